//! Events reported by the engine to the application.

use std::{
   sync::Arc,
   time::Duration,
};

use crossbeam::queue::SegQueue;
use smol_str::SmolStr;
use tokio::{sync::Notify, time};
use uuid::Uuid;

use crate::{
   address::Address,
   connection::ConnectionFailInfo,
   diagnostics::UhOh,
   state::{DeviceState, ManagerState, StateEvent},
   task::{TaskOutcome, Value},
};

/// Which transaction a device is waiting on.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum TransactionKind {
   Authentication,
   Initialization,
   /// Started by the application with `begin_transaction`.
   Custom,
}

/// Events that can be emitted by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
   Discovered {
      address: Address,
      name: Option<SmolStr>,
      rssi: Option<i16>,
   },
   DeviceState {
      address: Address,
      event: StateEvent<DeviceState>,
   },
   ManagerState(StateEvent<ManagerState>),
   ConnectionFailed(Box<ConnectionFailInfo>),
   ReconnectStopped {
      address: Address,
      attempts: u32,
      elapsed: Duration,
   },
   TaskEnded(TaskOutcome),
   Notification {
      address: Address,
      characteristic: Uuid,
      value: Value,
   },
   /// A polled characteristic changed value.
   ValueChanged {
      address: Address,
      characteristic: Uuid,
      value: Value,
   },
   TransactionRequired {
      address: Address,
      kind: TransactionKind,
   },
   UhOh(UhOh),
   ContractViolation(SmolStr),
}

impl EngineEvent {
   /// The device the event is about, if any.
   pub const fn address(&self) -> Option<Address> {
      match self {
         Self::Discovered { address, .. }
         | Self::DeviceState { address, .. }
         | Self::ReconnectStopped { address, .. }
         | Self::Notification { address, .. }
         | Self::ValueChanged { address, .. }
         | Self::TransactionRequired { address, .. } => Some(*address),
         Self::ConnectionFailed(info) => Some(info.address),
         Self::TaskEnded(outcome) => outcome.owner.device(),
         Self::UhOh(uhoh) => uhoh.address,
         Self::ManagerState(_) | Self::ContractViolation(_) => None,
      }
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   fn emit(&self, event: EngineEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Lock-free event queue with an async receiver.
pub struct EventQueue {
   queue: SegQueue<EngineEvent>,
   notifier: Notify,
}

impl EventQueue {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   /// Waits for the next event. Returns `None` once every other handle is dropped.
   pub async fn recv(self: &Arc<Self>) -> Option<EngineEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   /// Takes whatever is queued right now.
   pub fn drain(&self) -> Vec<EngineEvent> {
      std::iter::from_fn(|| self.queue.pop()).collect()
   }
}

impl EventBus for EventQueue {
   fn emit(&self, event: EngineEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}

/// Handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Box<dyn FnMut(&EngineEvent) + Send>;

/// Ordered listener list. Listeners run in registration order.
#[derive(Default)]
pub struct Listeners {
   next: u64,
   entries: Vec<(ListenerId, Listener)>,
}

impl Listeners {
   pub fn add(&mut self, listener: Listener) -> ListenerId {
      self.next += 1;
      let id = ListenerId(self.next);
      self.entries.push((id, listener));
      id
   }

   pub fn remove(&mut self, id: ListenerId) -> bool {
      let before = self.entries.len();
      self.entries.retain(|(entry, _)| *entry != id);
      self.entries.len() != before
   }

   pub fn dispatch(&mut self, event: &EngineEvent) {
      for (_, listener) in &mut self.entries {
         listener(event);
      }
   }

   pub fn len(&self) -> usize {
      self.entries.len()
   }

   pub fn is_empty(&self) -> bool {
      self.entries.is_empty()
   }
}
