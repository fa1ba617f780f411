//! Radio operation tasks.
//!
//! A [`Task`] is one asynchronous request against the platform binding
//! (connect, read, scan, ...). Tasks are owned by the [`queue::TaskQueue`]
//! from the moment they are added until they reach a terminal
//! [`TaskState`], at which point the engine reports the [`TaskOutcome`] and
//! drops them.

use std::{
   fmt,
   time::{Duration, Instant},
};

use log::{debug, error};
use serde::Serialize;
use smallvec::SmallVec;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{address::Address, state::NO_STATUS};

pub mod queue;
pub mod rules;
pub mod timeout;

pub use queue::{ExecuteResult, TaskExecutor, TaskQueue};
pub use timeout::{ConfigTimeouts, TaskTimeout, TimeoutPolicy};

/// Characteristic payload.
pub type Value = SmallVec<[u8; 32]>;

/// What a task (or a state tracker) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Owner {
   Manager,
   Device(Address),
}

impl Owner {
   pub const fn device(self) -> Option<Address> {
      match self {
         Self::Device(addr) => Some(addr),
         Self::Manager => None,
      }
   }
}

impl fmt::Display for Owner {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Manager => f.write_str("manager"),
         Self::Device(addr) => fmt::Display::fmt(addr, f),
      }
   }
}

/// The operation a task performs, with its parameters.
#[derive(Debug, Clone, PartialEq, strum::EnumDiscriminants)]
#[strum_discriminants(name(TaskType))]
#[strum_discriminants(derive(Hash, Serialize, strum::Display, strum::IntoStaticStr))]
pub enum TaskKind {
   TurnOn,
   TurnOff,
   /// Scan for advertisements; `None` scans until stopped.
   Scan { duration: Option<Duration> },
   Connect { explicit: bool },
   Disconnect { explicit: bool },
   DiscoverServices,
   Bond { explicit: bool },
   Unbond,
   Read { characteristic: Uuid },
   Write { characteristic: Uuid, data: Value },
   ToggleNotify { characteristic: Uuid, enable: bool },
   ReadRssi,
   /// Holds the queue for a device while a multi-step transaction runs.
   TxnLock,
}

impl TaskType {
   /// Stable snake_case key, used in configuration tables.
   pub const fn key(self) -> &'static str {
      match self {
         Self::TurnOn => "turn_on",
         Self::TurnOff => "turn_off",
         Self::Scan => "scan",
         Self::Connect => "connect",
         Self::Disconnect => "disconnect",
         Self::DiscoverServices => "discover_services",
         Self::Bond => "bond",
         Self::Unbond => "unbond",
         Self::Read => "read",
         Self::Write => "write",
         Self::ToggleNotify => "toggle_notify",
         Self::ReadRssi => "read_rssi",
         Self::TxnLock => "txn_lock",
      }
   }

   /// Characteristic operations, the ones a bond filter and transactions care about.
   pub const fn is_char_op(self) -> bool {
      matches!(self, Self::Read | Self::Write | Self::ToggleNotify)
   }
}

impl TaskKind {
   pub fn task_type(&self) -> TaskType {
      TaskType::from(self)
   }

   pub const fn characteristic(&self) -> Option<Uuid> {
      match self {
         Self::Read { characteristic }
         | Self::Write { characteristic, .. }
         | Self::ToggleNotify { characteristic, .. } => Some(*characteristic),
         _ => None,
      }
   }

   /// Whether the application asked for this directly, as opposed to the
   /// engine issuing it on its own (reconnects, bond filters, ...).
   pub const fn is_explicit(&self) -> bool {
      match self {
         Self::Connect { explicit } | Self::Disconnect { explicit } | Self::Bond { explicit } => {
            *explicit
         },
         _ => true,
      }
   }

   pub const fn default_priority(&self) -> Priority {
      match self {
         Self::TurnOn | Self::TurnOff | Self::Disconnect { .. } => Priority::Critical,
         Self::Scan { .. } => Priority::Trivial,
         Self::Connect { explicit: true } | Self::Bond { explicit: true } | Self::Unbond => {
            Priority::ExplicitBondingAndConnecting
         },
         Self::Connect { explicit: false } => Priority::Medium,
         Self::DiscoverServices | Self::Bond { explicit: false } => Priority::High,
         Self::Read { .. }
         | Self::Write { .. }
         | Self::ToggleNotify { .. }
         | Self::ReadRssi
         | Self::TxnLock => Priority::Medium,
      }
   }

   /// Tasks that only make sense on an established link.
   pub const fn requires_connection(&self) -> bool {
      matches!(
         self,
         Self::DiscoverServices
            | Self::Read { .. }
            | Self::Write { .. }
            | Self::ToggleNotify { .. }
            | Self::ReadRssi
            | Self::TxnLock
      )
   }
}

/// Scheduling priority, lowest first.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, strum::Display,
)]
pub enum Priority {
   Trivial,
   Low,
   Medium,
   High,
   ExplicitBondingAndConnecting,
   PriorityReadsWrites,
   Critical,
}

/// Lifecycle of a task.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum TaskState {
   Created,
   Queued,
   Armed,
   Executing,
   Succeeded,
   Failed,
   FailedImmediately,
   TimedOut,
   Redundant,
   NoOp,
   /// This instance is finished; a fresh copy was put back in the queue.
   Interrupted,
   SoftlyCancelled,
}

impl TaskState {
   pub const fn is_terminal(self) -> bool {
      !matches!(
         self,
         Self::Created | Self::Queued | Self::Armed | Self::Executing
      )
   }

   pub const fn is_success(self) -> bool {
      matches!(self, Self::Succeeded | Self::Redundant)
   }

   pub const fn is_failure(self) -> bool {
      matches!(self, Self::Failed | Self::FailedImmediately | Self::TimedOut)
   }
}

/// Monotonic task ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "#{}", self.0)
   }
}

/// Data produced by a successful task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TaskOutput {
   Value(Value),
   Rssi(i16),
}

/// Final report of a task, delivered to its completion channel and the event bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutcome {
   pub id: TaskId,
   pub task_type: TaskType,
   pub owner: Owner,
   pub characteristic: Option<Uuid>,
   pub state: TaskState,
   pub output: Option<TaskOutput>,
   pub native_status: i32,
   pub time_queued: Duration,
   pub time_executing: Duration,
}

impl TaskOutcome {
   /// When a failure happened relative to execution.
   pub const fn timing(&self) -> crate::connection::Timing {
      crate::connection::Timing::from_task_state(self.state)
   }
}

pub type Completion = oneshot::Sender<TaskOutcome>;

/// A single radio operation request.
pub struct Task {
   id: TaskId,
   kind: TaskKind,
   owner: Owner,
   priority: Priority,
   state: TaskState,
   bond_gated: bool,
   softly_cancelled: bool,
   timeout: TaskTimeout,
   queued_at: Option<Instant>,
   armed_at: Option<Instant>,
   armed_tick: u64,
   timeout_base: Option<Instant>,
   ended_at: Option<Instant>,
   native_status: i32,
   output: Option<TaskOutput>,
   completion: Option<Completion>,
}

impl fmt::Debug for Task {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Task")
         .field("id", &self.id)
         .field("kind", &self.kind)
         .field("owner", &self.owner)
         .field("priority", &self.priority)
         .field("state", &self.state)
         .field("softly_cancelled", &self.softly_cancelled)
         .finish_non_exhaustive()
   }
}

impl Task {
   pub fn new(kind: TaskKind, owner: Owner) -> Self {
      Self {
         id: TaskId(0),
         priority: kind.default_priority(),
         kind,
         owner,
         state: TaskState::Created,
         bond_gated: false,
         softly_cancelled: false,
         timeout: TaskTimeout::Disabled,
         queued_at: None,
         armed_at: None,
         armed_tick: 0,
         timeout_base: None,
         ended_at: None,
         native_status: NO_STATUS,
         output: None,
         completion: None,
      }
   }

   #[must_use]
   pub fn with_priority(mut self, priority: Priority) -> Self {
      self.priority = priority;
      self
   }

   /// Marks a characteristic operation as waiting on bonding.
   #[must_use]
   pub fn bond_gated(mut self) -> Self {
      self.bond_gated = true;
      self
   }

   #[must_use]
   pub fn with_completion(mut self, completion: Completion) -> Self {
      self.completion = Some(completion);
      self
   }

   pub const fn id(&self) -> TaskId {
      self.id
   }

   pub const fn kind(&self) -> &TaskKind {
      &self.kind
   }

   pub fn task_type(&self) -> TaskType {
      self.kind.task_type()
   }

   pub const fn owner(&self) -> Owner {
      self.owner
   }

   pub const fn priority(&self) -> Priority {
      self.priority
   }

   pub const fn state(&self) -> TaskState {
      self.state
   }

   pub const fn is_bond_gated(&self) -> bool {
      self.bond_gated
   }

   pub const fn is_softly_cancelled(&self) -> bool {
      self.softly_cancelled
   }

   pub const fn timeout(&self) -> TaskTimeout {
      self.timeout
   }

   pub const fn native_status(&self) -> i32 {
      self.native_status
   }

   pub const fn output(&self) -> Option<&TaskOutput> {
      self.output.as_ref()
   }

   pub fn matches(&self, task_type: TaskType, owner: Owner) -> bool {
      self.owner == owner && self.task_type() == task_type
   }

   pub fn set_output(&mut self, output: TaskOutput) {
      self.output = Some(output);
   }

   pub fn set_native_status(&mut self, status: i32) {
      self.native_status = status;
   }

   /// Time spent waiting in the queue before being armed.
   pub fn time_queued(&self) -> Duration {
      match (self.queued_at, self.armed_at.or(self.ended_at)) {
         (Some(queued), Some(until)) => until.saturating_duration_since(queued),
         _ => Duration::ZERO,
      }
   }

   /// Time spent armed or executing.
   pub fn time_executing(&self) -> Duration {
      match (self.armed_at, self.ended_at) {
         (Some(armed), Some(ended)) => ended.saturating_duration_since(armed),
         _ => Duration::ZERO,
      }
   }

   /// Time the current execution has been running against its timeout.
   pub fn time_against_timeout(&self, now: Instant) -> Duration {
      self
         .timeout_base
         .map_or(Duration::ZERO, |base| now.saturating_duration_since(base))
   }

   pub fn outcome(&self) -> TaskOutcome {
      TaskOutcome {
         id: self.id,
         task_type: self.task_type(),
         owner: self.owner,
         characteristic: self.kind.characteristic(),
         state: self.state,
         output: self.output.clone(),
         native_status: self.native_status,
         time_queued: self.time_queued(),
         time_executing: self.time_executing(),
      }
   }

   /// Resolves the completion channel, if any. Called once after the task ends.
   pub fn complete(&mut self) {
      if let Some(completion) = self.completion.take() {
         let _ = completion.send(self.outcome());
      }
   }

   fn enqueue(&mut self, id: TaskId, now: Instant) {
      self.id = id;
      self.state = TaskState::Queued;
      self.queued_at = Some(now);
   }

   fn arm(&mut self, timeout: TaskTimeout, tick: u64, now: Instant) {
      self.state = TaskState::Armed;
      self.timeout = timeout;
      self.armed_tick = tick;
      self.armed_at = Some(now);
   }

   fn begin_executing(&mut self, now: Instant) {
      self.state = TaskState::Executing;
      self.timeout_base = Some(now);
   }

   fn reset_timeout(&mut self, now: Instant) {
      self.timeout_base = Some(now);
   }

   fn mark_softly_cancelled(&mut self) {
      self.softly_cancelled = true;
   }

   /// Moves to a terminal state. Returns `false`, changing nothing, if the
   /// task had already ended.
   fn finish(&mut self, state: TaskState, now: Instant) -> bool {
      debug_assert!(state.is_terminal());
      if self.state.is_terminal() {
         error!(
            "task {} ({}) asked to end as {state} but already ended as {}",
            self.id,
            self.task_type(),
            self.state
         );
         return false;
      }
      let state = if self.softly_cancelled && state != TaskState::Interrupted {
         TaskState::SoftlyCancelled
      } else {
         state
      };
      debug!(
         "{}: task {} {} {} -> {state}",
         self.owner,
         self.id,
         self.task_type(),
         self.state
      );
      self.state = state;
      self.ended_at = Some(now);
      true
   }

   /// A fresh copy of an interrupted task, carrying over its completion.
   fn respawn(&mut self) -> Self {
      Self {
         bond_gated: self.bond_gated,
         priority: self.priority,
         completion: self.completion.take(),
         ..Self::new(self.kind.clone(), self.owner)
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_default_priorities() {
      let dev = Owner::Device(Address::any());
      assert_eq!(
         Task::new(TaskKind::Connect { explicit: true }, dev).priority(),
         Priority::ExplicitBondingAndConnecting
      );
      assert_eq!(
         Task::new(TaskKind::Connect { explicit: false }, dev).priority(),
         Priority::Medium
      );
      assert_eq!(
         Task::new(TaskKind::Scan { duration: None }, Owner::Manager).priority(),
         Priority::Trivial
      );
      assert!(Priority::Critical > Priority::ExplicitBondingAndConnecting);
   }

   #[test]
   fn test_terminal_states_are_final() {
      let now = Instant::now();
      let mut task = Task::new(TaskKind::ReadRssi, Owner::Device(Address::any()));
      task.enqueue(TaskId(1), now);
      assert!(task.finish(TaskState::Succeeded, now));
      assert!(!task.finish(TaskState::Failed, now));
      assert_eq!(task.state(), TaskState::Succeeded);
   }

   #[test]
   fn test_soft_cancel_overrides_result() {
      let now = Instant::now();
      let mut task = Task::new(
         TaskKind::Read {
            characteristic: Uuid::nil(),
         },
         Owner::Device(Address::any()),
      );
      task.enqueue(TaskId(1), now);
      task.mark_softly_cancelled();
      task.finish(TaskState::Succeeded, now);
      assert_eq!(task.state(), TaskState::SoftlyCancelled);
   }

   #[test]
   fn test_task_type_keys() {
      assert_eq!(TaskType::TxnLock.key(), "txn_lock");
      assert_eq!(
         TaskKind::ToggleNotify {
            characteristic: Uuid::nil(),
            enable: true
         }
         .task_type(),
         TaskType::ToggleNotify
      );
      assert!(TaskType::Write.is_char_op());
      assert!(!TaskType::ReadRssi.is_char_op());
   }
}
