//! Async front end for the engine.
//!
//! [`Engine`] is a cheap, cloneable handle. Every call is sent to a single
//! actor task that owns the [`Manager`] and applies commands, native events
//! and scheduler ticks one at a time.

use std::{sync::Arc, time::Duration};

use log::{debug, info};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   time::{self, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
   address::Address,
   binding::{NativeEvent, PlatformBinding},
   bond::BondFilter,
   clock::{ClockRef, TokioClock},
   config::{Config, DeviceConfig},
   connection::{ReconnectPolicy, RetryPolicy, WakeLock},
   device::DeviceSnapshot,
   error::{GattError, Result},
   event::{EventSender, Listener, ListenerId},
   manager::Manager,
   persist::DisconnectStore,
   task::{Completion, Priority, TaskId, TaskKind, TaskOutcome, TaskOutput, Value},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

type Reply<T> = oneshot::Sender<T>;

enum Command {
   RegisterDevice {
      address: Address,
      name: Option<SmolStr>,
      config: Option<DeviceConfig>,
      reply: Reply<bool>,
   },
   RemoveDevice(Address, Reply<bool>),
   Connect(Address, Reply<Result<()>>),
   Disconnect(Address, Completion, Reply<Result<TaskId>>),
   Task {
      address: Option<Address>,
      kind: TaskKind,
      priority: Option<Priority>,
      completion: Option<Completion>,
      reply: Reply<Result<TaskId>>,
   },
   StopScan(Reply<bool>),
   StartPoll {
      address: Address,
      characteristic: Uuid,
      interval: Duration,
      change_only: bool,
      reply: Reply<Result<()>>,
   },
   EnableNotify {
      address: Address,
      characteristic: Uuid,
      force_read_after: Option<Duration>,
      reply: Reply<Result<()>>,
   },
   StopPoll(Address, Uuid, Reply<Result<()>>),
   BeginTransaction(Address, Reply<Result<()>>),
   EndTransaction(Address, bool, Reply<Result<bool>>),
   GetDevice(Address, Reply<Option<DeviceSnapshot>>),
   GetAllDevices(Reply<Vec<DeviceSnapshot>>),
   GetManagerState(Reply<Vec<&'static str>>),
   SetRetryPolicy(Address, Box<dyn RetryPolicy>, Reply<Result<()>>),
   SetReconnectPolicy(Address, Box<dyn ReconnectPolicy>, Reply<Result<()>>),
   SetBondFilter(Box<dyn BondFilter>),
   AddListener(Listener, Reply<ListenerId>),
   RemoveListener(ListenerId, Reply<bool>),
   Shutdown,
}

/// Configures and spawns an [`Engine`].
pub struct EngineBuilder {
   config: Config,
   clock: ClockRef,
   bus: Option<EventSender>,
   store: Option<Arc<dyn DisconnectStore>>,
   wake_lock: Option<WakeLock>,
}

impl EngineBuilder {
   pub fn event_bus(mut self, bus: EventSender) -> Self {
      self.bus = Some(bus);
      self
   }

   pub fn store(mut self, store: Arc<dyn DisconnectStore>) -> Self {
      self.store = Some(store);
      self
   }

   pub fn wake_lock(mut self, wake_lock: WakeLock) -> Self {
      self.wake_lock = Some(wake_lock);
      self
   }

   pub fn clock(mut self, clock: ClockRef) -> Self {
      self.clock = clock;
      self
   }

   /// Starts the actor on the current tokio runtime. `native` receives the
   /// events the binding reports, usually through a
   /// [`NativeSender`](crate::binding::NativeSender).
   pub fn spawn(
      self,
      binding: Box<dyn PlatformBinding>,
      native: mpsc::UnboundedReceiver<NativeEvent>,
   ) -> Engine {
      let tick_interval = self.config.tick_interval();
      let mut manager = Manager::new(self.config, binding, self.clock);
      if let Some(bus) = self.bus {
         manager.set_event_bus(bus);
      }
      if let Some(store) = self.store {
         manager.set_store(store);
      }
      if let Some(wake_lock) = self.wake_lock {
         manager.set_wake_lock(wake_lock);
      }

      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(
         EngineActor {
            manager,
            tick_interval,
            command_rx,
            native_rx: native,
         }
         .run(),
      );
      Engine { inbox: command_tx }
   }
}

/// Handle to a running engine.
#[derive(Clone)]
pub struct Engine {
   inbox: mpsc::Sender<Command>,
}

impl Engine {
   pub fn builder(config: Config) -> EngineBuilder {
      EngineBuilder {
         config,
         clock: Arc::new(TokioClock),
         bus: None,
         store: None,
         wake_lock: None,
      }
   }

   async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| GattError::ManagerShutdown)?;
      rx.await.map_err(|_| GattError::ManagerShutdown)
   }

   /// Queues a task and waits for it to end.
   async fn run_task(
      &self,
      address: Option<Address>,
      kind: TaskKind,
      priority: Option<Priority>,
   ) -> Result<TaskOutcome> {
      let (completion, done) = oneshot::channel();
      self
         .request(|reply| Command::Task {
            address,
            kind,
            priority,
            completion: Some(completion),
            reply,
         })
         .await??;
      let outcome = done.await.map_err(|_| GattError::ManagerShutdown)?;
      if outcome.state.is_success() {
         Ok(outcome)
      } else {
         Err(GattError::TaskEnded {
            task: outcome.task_type,
            state: outcome.state,
         })
      }
   }

   pub async fn register_device(
      &self,
      address: Address,
      name: Option<SmolStr>,
      config: Option<DeviceConfig>,
   ) -> Result<bool> {
      self
         .request(|reply| Command::RegisterDevice {
            address,
            name,
            config,
            reply,
         })
         .await
   }

   pub async fn remove_device(&self, address: Address) -> Result<bool> {
      self
         .request(|reply| Command::RemoveDevice(address, reply))
         .await
   }

   /// Connects and waits until the device is initialized.
   pub async fn connect(&self, address: Address) -> Result<()> {
      self
         .request(|reply| Command::Connect(address, reply))
         .await?
   }

   pub async fn disconnect(&self, address: Address) -> Result<TaskOutcome> {
      let (completion, done) = oneshot::channel();
      self
         .request(|reply| Command::Disconnect(address, completion, reply))
         .await??;
      done.await.map_err(|_| GattError::ManagerShutdown)
   }

   pub async fn read(&self, address: Address, characteristic: Uuid) -> Result<Value> {
      let outcome = self
         .run_task(Some(address), TaskKind::Read { characteristic }, None)
         .await?;
      match outcome.output {
         Some(TaskOutput::Value(value)) => Ok(value),
         _ => Ok(Value::new()),
      }
   }

   pub async fn write(&self, address: Address, characteristic: Uuid, data: &[u8]) -> Result<()> {
      let kind = TaskKind::Write {
         characteristic,
         data: Value::from_slice(data),
      };
      self.run_task(Some(address), kind, None).await.map(drop)
   }

   /// Like [`write`](Self::write), ahead of everything but connects and bonds.
   pub async fn write_urgent(&self, address: Address, characteristic: Uuid, data: &[u8]) -> Result<()> {
      let kind = TaskKind::Write {
         characteristic,
         data: Value::from_slice(data),
      };
      self
         .run_task(Some(address), kind, Some(Priority::PriorityReadsWrites))
         .await
         .map(drop)
   }

   pub async fn set_notify(&self, address: Address, characteristic: Uuid, enable: bool) -> Result<()> {
      let kind = TaskKind::ToggleNotify {
         characteristic,
         enable,
      };
      self.run_task(Some(address), kind, None).await.map(drop)
   }

   pub async fn read_rssi(&self, address: Address) -> Result<i16> {
      let outcome = self
         .run_task(Some(address), TaskKind::ReadRssi, None)
         .await?;
      match outcome.output {
         Some(TaskOutput::Rssi(rssi)) => Ok(rssi),
         _ => Err(GattError::Native("no rssi reported".into())),
      }
   }

   pub async fn bond(&self, address: Address) -> Result<()> {
      self
         .run_task(Some(address), TaskKind::Bond { explicit: true }, None)
         .await
         .map(drop)
   }

   pub async fn unbond(&self, address: Address) -> Result<()> {
      self
         .run_task(Some(address), TaskKind::Unbond, None)
         .await
         .map(drop)
   }

   pub async fn turn_on(&self) -> Result<()> {
      self.run_task(None, TaskKind::TurnOn, None).await.map(drop)
   }

   pub async fn turn_off(&self) -> Result<()> {
      self.run_task(None, TaskKind::TurnOff, None).await.map(drop)
   }

   /// Scans for `duration` and waits for the scan to end.
   pub async fn scan(&self, duration: Duration) -> Result<TaskOutcome> {
      self
         .run_task(
            None,
            TaskKind::Scan {
               duration: Some(duration),
            },
            None,
         )
         .await
   }

   /// Starts a scan without waiting for it. Unbounded when `duration` is `None`.
   pub async fn start_scan(&self, duration: Option<Duration>) -> Result<TaskId> {
      self
         .request(|reply| Command::Task {
            address: None,
            kind: TaskKind::Scan { duration },
            priority: None,
            completion: None,
            reply,
         })
         .await?
   }

   pub async fn stop_scan(&self) -> Result<bool> {
      self.request(Command::StopScan).await
   }

   pub async fn start_poll(
      &self,
      address: Address,
      characteristic: Uuid,
      interval: Duration,
      change_only: bool,
   ) -> Result<()> {
      self
         .request(|reply| Command::StartPoll {
            address,
            characteristic,
            interval,
            change_only,
            reply,
         })
         .await?
   }

   pub async fn enable_notify(
      &self,
      address: Address,
      characteristic: Uuid,
      force_read_after: Option<Duration>,
   ) -> Result<()> {
      self
         .request(|reply| Command::EnableNotify {
            address,
            characteristic,
            force_read_after,
            reply,
         })
         .await?
   }

   pub async fn stop_poll(&self, address: Address, characteristic: Uuid) -> Result<()> {
      self
         .request(|reply| Command::StopPoll(address, characteristic, reply))
         .await?
   }

   pub async fn begin_transaction(&self, address: Address) -> Result<()> {
      self
         .request(|reply| Command::BeginTransaction(address, reply))
         .await?
   }

   pub async fn end_transaction(&self, address: Address, success: bool) -> Result<bool> {
      self
         .request(|reply| Command::EndTransaction(address, success, reply))
         .await?
   }

   pub async fn get_device(&self, address: Address) -> Result<DeviceSnapshot> {
      self
         .request(|reply| Command::GetDevice(address, reply))
         .await?
         .ok_or(GattError::DeviceNotFound(address))
   }

   pub async fn all_devices(&self) -> Vec<DeviceSnapshot> {
      self
         .request(Command::GetAllDevices)
         .await
         .unwrap_or_default()
   }

   pub async fn manager_state(&self) -> Result<Vec<&'static str>> {
      self.request(Command::GetManagerState).await
   }

   pub async fn set_retry_policy(&self, address: Address, policy: Box<dyn RetryPolicy>) -> Result<()> {
      self
         .request(|reply| Command::SetRetryPolicy(address, policy, reply))
         .await?
   }

   pub async fn set_reconnect_policy(
      &self,
      address: Address,
      policy: Box<dyn ReconnectPolicy>,
   ) -> Result<()> {
      self
         .request(|reply| Command::SetReconnectPolicy(address, policy, reply))
         .await?
   }

   pub async fn set_bond_filter(&self, filter: Box<dyn BondFilter>) -> Result<()> {
      self
         .inbox
         .send(Command::SetBondFilter(filter))
         .await
         .map_err(|_| GattError::ManagerShutdown)
   }

   pub async fn add_listener(&self, listener: Listener) -> Result<ListenerId> {
      self
         .request(|reply| Command::AddListener(listener, reply))
         .await
   }

   pub async fn remove_listener(&self, id: ListenerId) -> Result<bool> {
      self
         .request(|reply| Command::RemoveListener(id, reply))
         .await
   }

   /// Stops the actor. Pending tasks are dropped.
   pub async fn shutdown(&self) {
      let _ = self.inbox.send(Command::Shutdown).await;
   }
}

// === Engine Actor ===

struct EngineActor {
   manager: Manager,
   tick_interval: Duration,
   command_rx: mpsc::Receiver<Command>,
   native_rx: mpsc::UnboundedReceiver<NativeEvent>,
}

impl EngineActor {
   async fn run(mut self) {
      info!("engine starting, tick every {:?}", self.tick_interval);
      self.manager.register_known_devices();

      let mut tick_interval = time::interval(self.tick_interval);
      tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
             _ = tick_interval.tick() => {
                 self.manager.tick();
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("engine shutting down");
                     break;
                 };
                 if !self.handle_command(cmd) {
                     break;
                 }
             }
             Some(event) = self.native_rx.recv() => {
                 self.manager.on_native(event);
             }
         }
      }
      debug!("engine stopped");
   }

   fn handle_command(&mut self, cmd: Command) -> bool {
      let mgr = &mut self.manager;
      match cmd {
         Command::RegisterDevice {
            address,
            name,
            config,
            reply,
         } => {
            let created = mgr.register_device(address, name, config);
            mgr.flush();
            let _ = reply.send(created);
         },
         Command::RemoveDevice(address, reply) => {
            let _ = reply.send(mgr.remove_device(address));
         },
         Command::Connect(address, reply) => {
            let (waiter, done) = oneshot::channel();
            if let Err(e) = mgr.connect(address, Some(waiter)) {
               let _ = reply.send(Err(e));
            } else {
               tokio::spawn(async move {
                  let result = done.await.unwrap_or(Err(GattError::ManagerShutdown));
                  let _ = reply.send(result);
               });
            }
         },
         Command::Disconnect(address, completion, reply) => {
            let _ = reply.send(mgr.disconnect(address, Some(completion)));
         },
         Command::Task {
            address,
            kind,
            priority,
            completion,
            reply,
         } => {
            let id = match (kind, address) {
               (TaskKind::TurnOn, _) => Ok(mgr.turn_on(completion)),
               (TaskKind::TurnOff, _) => Ok(mgr.turn_off(completion)),
               (TaskKind::Scan { duration }, _) => Ok(mgr.start_scan(duration, completion)),
               (kind, Some(address)) => mgr.submit(address, kind, priority, completion),
               (kind, None) => Err(GattError::Native(
                  format!("{} needs a device", kind.task_type()).into(),
               )),
            };
            let _ = reply.send(id);
         },
         Command::StopScan(reply) => {
            let _ = reply.send(mgr.stop_scan());
         },
         Command::StartPoll {
            address,
            characteristic,
            interval,
            change_only,
            reply,
         } => {
            let _ = reply.send(mgr.start_poll(address, characteristic, interval, change_only));
         },
         Command::EnableNotify {
            address,
            characteristic,
            force_read_after,
            reply,
         } => {
            let _ = reply.send(mgr.enable_notify(address, characteristic, force_read_after));
         },
         Command::StopPoll(address, characteristic, reply) => {
            let _ = reply.send(mgr.stop_poll(address, characteristic));
         },
         Command::BeginTransaction(address, reply) => {
            let _ = reply.send(mgr.begin_transaction(address));
         },
         Command::EndTransaction(address, success, reply) => {
            let _ = reply.send(mgr.end_transaction(address, success));
         },
         Command::GetDevice(address, reply) => {
            let _ = reply.send(mgr.device(address));
         },
         Command::GetAllDevices(reply) => {
            let _ = reply.send(mgr.devices());
         },
         Command::GetManagerState(reply) => {
            let state = mgr.manager_state().iter().map(|f| f.to_str()).collect();
            let _ = reply.send(state);
         },
         Command::SetRetryPolicy(address, policy, reply) => {
            let _ = reply.send(mgr.set_retry_policy(address, policy));
         },
         Command::SetReconnectPolicy(address, policy, reply) => {
            let _ = reply.send(mgr.set_reconnect_policy(address, policy));
         },
         Command::SetBondFilter(filter) => mgr.set_bond_filter(filter),
         Command::AddListener(listener, reply) => {
            let _ = reply.send(mgr.add_listener(listener));
         },
         Command::RemoveListener(id, reply) => {
            let _ = reply.send(mgr.remove_listener(id));
         },
         Command::Shutdown => return false,
      }
      true
   }
}
