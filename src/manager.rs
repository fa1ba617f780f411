//! The synchronous engine core.
//!
//! [`Manager`] owns the task queue, the adapter state and every device. It is
//! driven from outside: [`Manager::tick`] once per scheduler tick and
//! [`Manager::on_native`] for each platform callback. Nothing in here blocks
//! or spawns; [`runtime`](crate::runtime) wraps it in a tokio actor so that
//! ticks, application commands and native callbacks are applied one at a time.

use std::{
   collections::BTreeMap,
   sync::Arc,
   time::{Duration, Instant},
};

use log::{debug, info, warn};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   address::Address,
   binding::{NativeError, NativeEvent, NativeRequest, NativeResult, PlatformBinding},
   bond::{BondContext, BondDecision, BondFilter, BondManager, BondTrigger},
   clock::ClockRef,
   config::{Config, DeviceConfig},
   connection::{
      FailReason, Failure, ReconnectAction, ReconnectPolicy, RetryPolicy, Timing, WakeLock,
   },
   device::{ConnectWaiter, Device, DeviceSnapshot, Transaction},
   diagnostics::{self, UhOh, UhOhKind, UhOhThrottle},
   error::{GattError, Result},
   event::{EngineEvent, EventSender, Listener, ListenerId, Listeners, TransactionKind},
   persist::{DisconnectStore, MemoryStore},
   state::{DeviceState, Intent, ManagerState, NO_STATUS, StateMask, StateTracker},
   task::{
      Completion, ConfigTimeouts, ExecuteResult, Owner, Priority, Task, TaskExecutor, TaskId,
      TaskKind, TaskOutput, TaskQueue, TaskState, TaskTimeout, TaskType, TimeoutPolicy, Value,
   },
};

/// Flags cleared when a link goes down, plus `Disconnected` set.
fn link_down() -> Vec<(DeviceState, bool)> {
   DeviceState::LINK
      .iter()
      .map(|&flag| (flag, false))
      .chain([(DeviceState::Disconnected, true), (DeviceState::Bonding, false)])
      .collect()
}

pub struct Manager {
   config: Config,
   clock: ClockRef,
   queue: TaskQueue,
   state: StateTracker<ManagerState>,
   devices: BTreeMap<Address, Device>,
   binding: Box<dyn PlatformBinding>,
   timeouts: Box<dyn TimeoutPolicy>,
   bonds: BondManager,
   store: Arc<dyn DisconnectStore>,
   wake_lock: WakeLock,
   listeners: Listeners,
   bus: Option<EventSender>,
   throttle: UhOhThrottle,
   outbox: Vec<EngineEvent>,
}

impl Manager {
   pub fn new(config: Config, binding: Box<dyn PlatformBinding>, clock: ClockRef) -> Self {
      let mut state = StateTracker::new("manager", clock.clone());
      state.set(Intent::Unintentional, NO_STATUS, &[(ManagerState::Off, true)]);
      state.take_events();
      Self {
         queue: TaskQueue::new(clock.clone()),
         state,
         devices: BTreeMap::new(),
         binding,
         timeouts: Box::new(ConfigTimeouts),
         bonds: BondManager::default(),
         store: Arc::new(MemoryStore::default()),
         wake_lock: WakeLock::default(),
         listeners: Listeners::default(),
         bus: None,
         throttle: UhOhThrottle::default(),
         outbox: Vec::new(),
         config,
         clock,
      }
   }

   pub fn set_event_bus(&mut self, bus: EventSender) {
      self.bus = Some(bus);
   }

   pub fn set_store(&mut self, store: Arc<dyn DisconnectStore>) {
      self.store = store;
   }

   /// Applies to devices registered afterwards.
   pub fn set_wake_lock(&mut self, wake_lock: WakeLock) {
      self.wake_lock = wake_lock;
   }

   pub fn set_timeout_policy(&mut self, policy: Box<dyn TimeoutPolicy>) {
      self.timeouts = policy;
   }

   pub fn set_bond_filter(&mut self, filter: Box<dyn BondFilter>) {
      self.bonds.set_filter(filter);
   }

   pub fn set_retry_policy(&mut self, address: Address, policy: Box<dyn RetryPolicy>) -> Result<()> {
      self.device_mut(address)?.fail.set_policy(policy);
      Ok(())
   }

   pub fn set_reconnect_policy(
      &mut self,
      address: Address,
      policy: Box<dyn ReconnectPolicy>,
   ) -> Result<()> {
      self.device_mut(address)?.reconnect.set_policy(policy);
      Ok(())
   }

   pub const fn config(&self) -> &Config {
      &self.config
   }

   pub fn now(&self) -> Instant {
      self.clock.now()
   }

   fn device_mut(&mut self, address: Address) -> Result<&mut Device> {
      self
         .devices
         .get_mut(&address)
         .ok_or(GattError::DeviceNotFound(address))
   }

   // === Devices ===

   /// Registers every device listed in the configuration.
   pub fn register_known_devices(&mut self) {
      let known: Vec<_> = self
         .config
         .known_devices
         .iter()
         .map(|d| d.address)
         .collect();
      for address in known {
         self.register_device(address, None, None);
      }
      self.flush();
   }

   /// Adds a device. Returns `false` if it was already known, in which case
   /// the name and config are updated when given.
   pub fn register_device(
      &mut self,
      address: Address,
      name: Option<SmolStr>,
      config: Option<DeviceConfig>,
   ) -> bool {
      if let Some(device) = self.devices.get_mut(&address) {
         if let Some(name) = name {
            device.set_name(name);
         }
         if let Some(config) = config {
            device.config = config;
         }
         return false;
      }

      let known = self.config.known_device(address);
      let config = config
         .or_else(|| known.map(|d| d.config.clone()))
         .unwrap_or_default();
      let name = name.or_else(|| known.map(|d| d.name.clone()).filter(|n| !n.is_empty()));
      let device = Device::new(
         address,
         name,
         config,
         &self.config,
         self.clock.clone(),
         self.wake_lock.clone(),
      );
      self.devices.insert(address, device);
      info!("{address}: registered");
      self.seed_reconnect(address);
      true
   }

   /// Starts the reconnect loop for a device that dropped on its own before a restart.
   fn seed_reconnect(&mut self, address: Address) {
      if !self.config.auto_reconnect_after_restart {
         return;
      }
      let record = match self.store.load(address) {
         Ok(record) => record,
         Err(e) => {
            warn!("{address}: could not read last disconnect: {e}");
            return;
         },
      };
      if record.is_none_or(|r| r.intent != Intent::Unintentional) {
         return;
      }
      let now = self.clock.now();
      if let Some(device) = self.devices.get_mut(&address)
         && device.reconnect.start(now)
      {
         info!("{address}: dropped unexpectedly before restart, reconnecting");
         device.state.update(
            Intent::Unintentional,
            NO_STATUS,
            &[(DeviceState::AttemptingReconnect, true)],
         );
      }
   }

   /// Forgets a device. Its tasks fail on the next tick.
   pub fn remove_device(&mut self, address: Address) -> bool {
      let Some(mut device) = self.devices.remove(&address) else {
         return false;
      };
      device.resolve_waiters(|| Err(GattError::DeviceNotFound(address)));
      info!("{address}: removed");
      true
   }

   pub fn device(&self, address: Address) -> Option<DeviceSnapshot> {
      self.devices.get(&address).map(Device::snapshot)
   }

   pub fn devices(&self) -> Vec<DeviceSnapshot> {
      self.devices.values().map(Device::snapshot).collect()
   }

   pub fn device_state(&self, address: Address) -> Option<StateMask<DeviceState>> {
      self.devices.get(&address).map(Device::mask)
   }

   pub fn time_in_state(&self, address: Address, flag: DeviceState) -> Option<Duration> {
      self
         .devices
         .get(&address)
         .map(|d| d.state.time_in_state(flag))
   }

   pub fn manager_state(&self) -> StateMask<ManagerState> {
      self.state.mask()
   }

   pub fn failure_count(&self, address: Address) -> Option<u32> {
      self.devices.get(&address).map(|d| d.fail.failure_count())
   }

   /// Auto-connect setting the next native connect would use.
   pub fn auto_connect(&self, address: Address) -> Option<bool> {
      self
         .devices
         .get(&address)
         .map(|d| d.auto_connect(&self.config))
   }

   pub const fn queue(&self) -> &TaskQueue {
      &self.queue
   }

   // === Listeners ===

   /// Listener invoked for every event, after the device's own listeners.
   pub fn add_listener(&mut self, listener: Listener) -> ListenerId {
      self.listeners.add(listener)
   }

   pub fn remove_listener(&mut self, id: ListenerId) -> bool {
      self.listeners.remove(id)
   }

   pub fn add_device_listener(&mut self, address: Address, listener: Listener) -> Result<ListenerId> {
      Ok(self.device_mut(address)?.listeners.add(listener))
   }

   pub fn remove_device_listener(&mut self, address: Address, id: ListenerId) -> bool {
      self
         .devices
         .get_mut(&address)
         .is_some_and(|d| d.listeners.remove(id))
   }

   // === Application operations ===

   /// Connects, running discovery, bonding, authentication and
   /// initialization as configured. `waiter` resolves once the device is
   /// initialized or the attempt has finally failed.
   pub fn connect(&mut self, address: Address, waiter: Option<ConnectWaiter>) -> Result<()> {
      self.register_device(address, None, None);
      let now = self.clock.now();
      let owner = Owner::Device(address);
      let device = self.device_mut(address)?;

      if device.is_initialized() {
         if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
         }
         return Ok(());
      }

      let in_loop = device.reconnect.is_active();
      if !in_loop && device.is(DeviceState::ConnectingOverall) {
         let mut failure = Failure::new(FailReason::AlreadyConnecting, Timing::NotApplicable);
         failure.highest_state = device.highest_state();
         let info = device.fail.on_failure(failure, false, now);
         if let Some(waiter) = waiter {
            let _ = waiter.send(Err(GattError::AlreadyConnecting(address)));
         }
         self.emit(EngineEvent::ConnectionFailed(Box::new(info)));
         self.settle();
         return Ok(());
      }

      let summary = device.reconnect.stop(now);
      device.fail.on_explicit_connect(now);
      device.connect_waiters.extend(waiter);
      device.state.update(
         Intent::Intentional,
         NO_STATUS,
         &[
            (DeviceState::ConnectingOverall, true),
            (DeviceState::RetryingConnection, false),
            (DeviceState::AttemptingReconnect, false),
         ],
      );
      if let Some(summary) = summary {
         self.emit(EngineEvent::ReconnectStopped {
            address,
            attempts: summary.attempts,
            elapsed: summary.elapsed,
         });
      }

      self.queue.clear_queue_of(TaskType::Connect, owner);
      self
         .queue
         .add(Task::new(TaskKind::Connect { explicit: true }, owner));
      self.settle();
      Ok(())
   }

   /// Disconnects, stopping any retries or reconnect loop.
   pub fn disconnect(&mut self, address: Address, completion: Option<Completion>) -> Result<TaskId> {
      let now = self.clock.now();
      let owner = Owner::Device(address);
      let device = self.device_mut(address)?;

      let connecting = device.is(DeviceState::ConnectingOverall);
      device.fail.reset();
      let summary = device.reconnect.stop(now);
      device.state.update(
         Intent::Intentional,
         NO_STATUS,
         &[(DeviceState::AttemptingReconnect, false)],
      );
      self.persist(address, Intent::Intentional);

      if let Some(summary) = summary {
         self.emit(EngineEvent::ReconnectStopped {
            address,
            attempts: summary.attempts,
            elapsed: summary.elapsed,
         });
      }
      if connecting {
         self.on_connection_failed(
            address,
            Failure::new(FailReason::ExplicitDisconnect, Timing::NotApplicable),
         );
      }

      let mut task = Task::new(TaskKind::Disconnect { explicit: true }, owner);
      if let Some(completion) = completion {
         task = task.with_completion(completion);
      }
      let id = self.queue.add(task);
      self.settle();
      Ok(id)
   }

   pub fn read(
      &mut self,
      address: Address,
      characteristic: Uuid,
      priority: Option<Priority>,
      completion: Option<Completion>,
   ) -> Result<TaskId> {
      self.submit(address, TaskKind::Read { characteristic }, priority, completion)
   }

   pub fn write(
      &mut self,
      address: Address,
      characteristic: Uuid,
      data: Value,
      priority: Option<Priority>,
      completion: Option<Completion>,
   ) -> Result<TaskId> {
      self.submit(
         address,
         TaskKind::Write {
            characteristic,
            data,
         },
         priority,
         completion,
      )
   }

   pub fn set_notify(
      &mut self,
      address: Address,
      characteristic: Uuid,
      enable: bool,
      completion: Option<Completion>,
   ) -> Result<TaskId> {
      self.submit(
         address,
         TaskKind::ToggleNotify {
            characteristic,
            enable,
         },
         None,
         completion,
      )
   }

   pub fn read_rssi(&mut self, address: Address, completion: Option<Completion>) -> Result<TaskId> {
      self.submit(address, TaskKind::ReadRssi, None, completion)
   }

   pub fn bond(&mut self, address: Address, completion: Option<Completion>) -> Result<TaskId> {
      self.submit(address, TaskKind::Bond { explicit: true }, None, completion)
   }

   pub fn unbond(&mut self, address: Address, completion: Option<Completion>) -> Result<TaskId> {
      self.submit(address, TaskKind::Unbond, None, completion)
   }

   pub(crate) fn submit(
      &mut self,
      address: Address,
      kind: TaskKind,
      priority: Option<Priority>,
      completion: Option<Completion>,
   ) -> Result<TaskId> {
      let owner = Owner::Device(address);
      let device = self
         .devices
         .get(&address)
         .ok_or(GattError::DeviceNotFound(address))?;

      let decision = match kind.characteristic() {
         Some(characteristic) => self.bonds.check(&BondContext {
            address,
            trigger: BondTrigger::CharacteristicOp {
               task: kind.task_type(),
               characteristic,
            },
            bonded: device.is_bonded(),
            config: &device.config,
            bond_on_connect: device.bond_on_connect(&self.config),
         }),
         None => BondDecision::Nothing,
      };

      let mut task = Task::new(kind, owner);
      match decision {
         BondDecision::Bond => {
            if !self.queue.is_pending(TaskType::Bond, owner) {
               self
                  .queue
                  .add(Task::new(TaskKind::Bond { explicit: false }, owner));
            }
            task = task.bond_gated();
         },
         BondDecision::Unbond => {
            self.queue.add(Task::new(TaskKind::Unbond, owner));
         },
         BondDecision::Nothing => {},
      }
      if let Some(priority) = priority {
         task = task.with_priority(priority);
      }
      if let Some(completion) = completion {
         task = task.with_completion(completion);
      }
      let id = self.queue.add(task);
      self.settle();
      Ok(id)
   }

   /// Scans for `duration`, or until [`stop_scan`](Self::stop_scan).
   pub fn start_scan(&mut self, duration: Option<Duration>, completion: Option<Completion>) -> TaskId {
      let mut task = Task::new(TaskKind::Scan { duration }, Owner::Manager);
      if let Some(completion) = completion {
         task = task.with_completion(completion);
      }
      let id = self.queue.add(task);
      self.settle();
      id
   }

   pub fn stop_scan(&mut self) -> bool {
      let cleared = self.queue.clear_queue_of(TaskType::Scan, Owner::Manager);
      let stopped = self.queue.succeed(TaskType::Scan, Owner::Manager);
      self.settle();
      stopped || cleared > 0
   }

   pub fn turn_on(&mut self, completion: Option<Completion>) -> TaskId {
      self.adapter_task(TaskKind::TurnOn, completion)
   }

   pub fn turn_off(&mut self, completion: Option<Completion>) -> TaskId {
      self.adapter_task(TaskKind::TurnOff, completion)
   }

   fn adapter_task(&mut self, kind: TaskKind, completion: Option<Completion>) -> TaskId {
      let mut task = Task::new(kind, Owner::Manager);
      if let Some(completion) = completion {
         task = task.with_completion(completion);
      }
      let id = self.queue.add(task);
      self.settle();
      id
   }

   /// Reads `characteristic` every `interval` while the device is initialized.
   pub fn start_poll(
      &mut self,
      address: Address,
      characteristic: Uuid,
      interval: Duration,
      change_only: bool,
   ) -> Result<()> {
      self
         .device_mut(address)?
         .poll
         .start_poll(characteristic, interval, change_only);
      Ok(())
   }

   /// Keeps notifications on for `characteristic`, re-enabling them after
   /// every reconnect. With `force_read_after`, the value is read when no
   /// notification arrived for that long.
   pub fn enable_notify(
      &mut self,
      address: Address,
      characteristic: Uuid,
      force_read_after: Option<Duration>,
   ) -> Result<()> {
      let device = self.device_mut(address)?;
      device.poll.watch_notify(characteristic, force_read_after);
      if device.is_initialized() {
         self.restore_notifications(address);
      }
      self.settle();
      Ok(())
   }

   /// Stops polling or watching `characteristic`.
   pub fn stop_poll(&mut self, address: Address, characteristic: Uuid) -> Result<()> {
      let device = self.device_mut(address)?;
      let was_notifying = device.poll.stop(characteristic);
      if was_notifying && device.is_connected() {
         self.queue.add(Task::new(
            TaskKind::ToggleNotify {
               characteristic,
               enable: false,
            },
            Owner::Device(address),
         ));
      }
      self.settle();
      Ok(())
   }

   /// Takes the queue for a connected device until [`end_transaction`](Self::end_transaction).
   pub fn begin_transaction(&mut self, address: Address) -> Result<()> {
      let device = self.device_mut(address)?;
      if !device.is_initialized() {
         return Err(GattError::DeviceNotConnected(address));
      }
      if device.transaction.is_some() {
         return Err(GattError::Native("transaction already running".into()));
      }
      self.start_transaction(address, TransactionKind::Custom);
      self.settle();
      Ok(())
   }

   /// Ends the running transaction. Returns `false` if there was none.
   pub fn end_transaction(&mut self, address: Address, success: bool) -> Result<bool> {
      self.device_mut(address)?;
      let ended = self.finish_transaction(address, success, Timing::Eventually);
      self.settle();
      Ok(ended)
   }

   // === Driving ===

   /// Advances reconnect loops, polls and the task queue by one tick.
   pub fn tick(&mut self) {
      let now = self.clock.now();
      let mut stopped = Vec::new();

      for (&address, device) in &mut self.devices {
         let owner = Owner::Device(address);
         match device.reconnect.tick(now, device.fail.last_failure()) {
            ReconnectAction::Connect => {
               device.state.update(
                  Intent::Unintentional,
                  NO_STATUS,
                  &[(DeviceState::ConnectingOverall, true)],
               );
               self
                  .queue
                  .add(Task::new(TaskKind::Connect { explicit: false }, owner));
            },
            ReconnectAction::Stop => {
               if let Some(summary) = device.reconnect.stop(now) {
                  device.state.update(
                     Intent::Unintentional,
                     NO_STATUS,
                     &[
                        (DeviceState::AttemptingReconnect, false),
                        (DeviceState::ConnectingOverall, false),
                     ],
                  );
                  device.resolve_waiters(|| Err(GattError::DeviceNotConnected(address)));
                  stopped.push(EngineEvent::ReconnectStopped {
                     address,
                     attempts: summary.attempts,
                     elapsed: summary.elapsed,
                  });
               }
            },
            ReconnectAction::Idle | ReconnectAction::Wait => {},
         }

         if device.is_initialized() {
            for characteristic in device.poll.due(now) {
               let read = TaskKind::Read { characteristic };
               let pending = self
                  .queue
                  .current()
                  .into_iter()
                  .chain(self.queue.queued())
                  .any(|t| t.owner() == owner && *t.kind() == read);
               if !pending {
                  self
                     .queue
                     .add(Task::new(read, owner).with_priority(Priority::Low));
               }
            }
         }
      }
      for event in stopped {
         self.emit(event);
      }

      let mut events = Vec::new();
      let mut uhohs = Vec::new();
      let mut exec = Executor {
         config: &self.config,
         now,
         timeouts: self.timeouts.as_ref(),
         binding: self.binding.as_mut(),
         devices: &mut self.devices,
         state: &mut self.state,
         events: &mut events,
         uhohs: &mut uhohs,
      };
      self.queue.update(&mut exec);
      for event in events {
         self.emit(event);
      }
      for uhoh in uhohs {
         self.uhoh(uhoh);
      }
      self.settle();
   }

   /// Applies one platform callback.
   pub fn on_native(&mut self, event: NativeEvent) {
      debug!("native: {event:?}");
      match event {
         NativeEvent::AdapterState { on } => self.on_adapter_state(on),
         NativeEvent::ScanStarted => {
            let scanning = self.queue.reset_timeout(TaskType::Scan, Owner::Manager);
            self.state.update(
               Intent::from_explicit(scanning),
               NO_STATUS,
               &[(ManagerState::Scanning, true)],
            );
         },
         NativeEvent::ScanStopped => self.on_scan_stopped(),
         NativeEvent::ScanFailed { status } => {
            if let Some(task) = self.queue.get_current_mut(TaskType::Scan, Owner::Manager) {
               task.set_native_status(status);
               self.queue.fail(TaskType::Scan, Owner::Manager);
            }
            self.state.update(
               Intent::Unintentional,
               status,
               &[(ManagerState::Scanning, false)],
            );
            self.uhoh(UhOh::new(UhOhKind::CannotEnableScan, None));
         },
         NativeEvent::Advertisement {
            address,
            rssi,
            name,
         } => self.on_advertisement(address, rssi, name),
         NativeEvent::Connected { address } => self.on_connected(address),
         NativeEvent::ConnectFailed { address, status } => {
            let owner = Owner::Device(address);
            if let Some(task) = self.queue.get_current_mut(TaskType::Connect, owner) {
               task.set_native_status(status);
               self.queue.fail(TaskType::Connect, owner);
            } else {
               debug!("{address}: connect failure with no connect task");
            }
         },
         NativeEvent::Disconnected { address, status } => self.on_disconnected(address, status),
         NativeEvent::ServicesDiscovered { address, services } => {
            self.on_services_discovered(address, services);
         },
         NativeEvent::BondState {
            address,
            bonded,
            status,
         } => self.on_bond_state(address, bonded, status),
         NativeEvent::CharacteristicRead {
            address,
            characteristic,
            result,
         } => self.route_result(
            address,
            TaskType::Read,
            Some(characteristic),
            result.map(|v| Some(TaskOutput::Value(v))),
         ),
         NativeEvent::CharacteristicWritten {
            address,
            characteristic,
            result,
         } => self.route_result(
            address,
            TaskType::Write,
            Some(characteristic),
            result.map(|()| None),
         ),
         NativeEvent::NotifyToggled {
            address,
            characteristic,
            result,
         } => self.route_result(
            address,
            TaskType::ToggleNotify,
            Some(characteristic),
            result.map(|_| None),
         ),
         NativeEvent::Notification {
            address,
            characteristic,
            value,
         } => {
            let now = self.clock.now();
            if let Some(device) = self.devices.get_mut(&address) {
               device.poll.on_notification(characteristic, now);
               self.emit(EngineEvent::Notification {
                  address,
                  characteristic,
                  value,
               });
            }
         },
         NativeEvent::Rssi { address, result } => {
            if let (Ok(rssi), Some(device)) = (result, self.devices.get_mut(&address)) {
               device.rssi = Some(rssi);
            }
            self.route_result(
               address,
               TaskType::ReadRssi,
               None,
               result.map(|rssi| Some(TaskOutput::Rssi(rssi))),
            );
         },
      }
      self.settle();
   }

   // === Native event handling ===

   fn on_adapter_state(&mut self, on: bool) {
      if on {
         let intentional = self.queue.succeed(TaskType::TurnOn, Owner::Manager);
         self.state.update(
            Intent::from_explicit(intentional),
            NO_STATUS,
            &[
               (ManagerState::Off, false),
               (ManagerState::TurningOn, false),
               (ManagerState::On, true),
            ],
         );
         return;
      }

      let intentional = self.queue.succeed(TaskType::TurnOff, Owner::Manager);
      let intent = Intent::from_explicit(intentional);
      self.state.update(
         intent,
         NO_STATUS,
         &[
            (ManagerState::On, false),
            (ManagerState::TurningOn, false),
            (ManagerState::TurningOff, false),
            (ManagerState::Scanning, false),
            (ManagerState::Off, true),
         ],
      );
      self
         .queue
         .softly_cancel_tasks(&Task::new(TaskKind::TurnOff, Owner::Manager));

      let now = self.clock.now();
      let addresses: Vec<_> = self.devices.keys().copied().collect();
      for address in addresses {
         let Some(device) = self.devices.get_mut(&address) else {
            continue;
         };
         let connecting = device.is(DeviceState::ConnectingOverall);
         let summary = device.reconnect.stop(now);
         if connecting {
            self.on_connection_failed(
               address,
               Failure::new(FailReason::AdapterTurningOff, Timing::NotApplicable),
            );
         }
         if let Some(device) = self.devices.get_mut(&address) {
            device.link_active = false;
            device.transaction = None;
            device.poll.on_disconnect();
            let mut changes = link_down();
            changes.push((DeviceState::AttemptingReconnect, false));
            device.state.update(intent, NO_STATUS, &changes);
         }
         if let Some(summary) = summary {
            self.emit(EngineEvent::ReconnectStopped {
               address,
               attempts: summary.attempts,
               elapsed: summary.elapsed,
            });
         }
      }
   }

   fn on_scan_stopped(&mut self) {
      let was_scanning = self.state.is(ManagerState::Scanning);
      self.state.update(
         Intent::Unintentional,
         NO_STATUS,
         &[(ManagerState::Scanning, false)],
      );
      let Some(task) = self.queue.get_current(TaskType::Scan, Owner::Manager) else {
         return;
      };
      if !was_scanning {
         return;
      }
      if matches!(task.kind(), TaskKind::Scan { duration: None }) {
         info!("scan stopped by the stack, re-queueing");
         self.queue.interrupt(TaskType::Scan, Owner::Manager);
      } else {
         self.queue.succeed(TaskType::Scan, Owner::Manager);
      }
   }

   fn on_advertisement(&mut self, address: Address, rssi: Option<i16>, name: Option<SmolStr>) {
      let created = self.register_device(address, name.clone(), None);
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      device.rssi = rssi.or(device.rssi);
      let newly_discovered = !device.is(DeviceState::Discovered);
      if created {
         device.state.set(
            Intent::Unintentional,
            NO_STATUS,
            &[
               (DeviceState::Discovered, true),
               (DeviceState::Advertising, true),
               (DeviceState::Disconnected, true),
               (DeviceState::Unbonded, true),
            ],
         );
      } else {
         device.state.update(
            Intent::Unintentional,
            NO_STATUS,
            &[
               (DeviceState::Undiscovered, false),
               (DeviceState::Discovered, true),
               (DeviceState::Advertising, true),
            ],
         );
      }
      if newly_discovered {
         self.emit(EngineEvent::Discovered {
            address,
            name,
            rssi,
         });
      }
   }

   fn on_connected(&mut self, address: Address) {
      let owner = Owner::Device(address);
      let explicit = self
         .queue
         .get_current(TaskType::Connect, owner)
         .map(|t| t.kind().is_explicit());
      self.queue.succeed(TaskType::Connect, owner);

      let Some(device) = self.devices.get_mut(&address) else {
         debug!("{address}: connected, but not registered");
         return;
      };
      let expected =
         explicit.is_some() || device.link_active || device.is(DeviceState::ConnectingOverall);
      device.link_active = true;
      if device.is_connected() {
         return;
      }
      let intent = match explicit {
         Some(explicit) => Intent::from_explicit(explicit),
         None => Intent::Unintentional,
      };
      device.state.update(
         intent,
         NO_STATUS,
         &[
            (DeviceState::Connecting, false),
            (DeviceState::Connected, true),
            (DeviceState::Disconnected, false),
            (DeviceState::ConnectingOverall, true),
         ],
      );
      if !expected {
         self.uhoh(UhOh::new(
            UhOhKind::ConnectedWithoutConnectAttempt,
            Some(address),
         ));
      }
      self.advance_connect(address);
   }

   fn on_disconnected(&mut self, address: Address, status: i32) {
      let owner = Owner::Device(address);
      if let Some(task) = self.queue.get_current_mut(TaskType::Connect, owner) {
         // The native connect never got the link up.
         task.set_native_status(status);
         self.queue.fail(TaskType::Connect, owner);
         return;
      }
      let expected = self.queue.succeed(TaskType::Disconnect, owner);
      self.on_link_lost(address, status, expected);
   }

   /// The link went down. `expected` when a disconnect task asked for it.
   fn on_link_lost(&mut self, address: Address, status: i32, expected: bool) {
      let owner = Owner::Device(address);
      self
         .queue
         .softly_cancel_tasks(&Task::new(TaskKind::Disconnect { explicit: false }, owner));

      let now = self.clock.now();
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      let was_link = std::mem::replace(&mut device.link_active, false);
      let was_initialized = device.is_initialized();
      let connecting = device.is(DeviceState::ConnectingOverall);
      device.transaction = None;
      device.poll.on_disconnect();

      if !expected && was_link && connecting && !was_initialized {
         let mut failure = Failure::new(FailReason::RogueDisconnect, Timing::NotApplicable);
         failure.gatt_status = status;
         self.on_connection_failed(address, failure);
         return;
      }

      let intent = Intent::from_explicit(expected);
      device.state.update(intent, status, &link_down());

      if !expected && was_initialized {
         info!("{address}: link lost (status {status})");
         if device.reconnect.start(now) {
            device.state.update(
               Intent::Unintentional,
               status,
               &[(DeviceState::AttemptingReconnect, true)],
            );
         }
         self.persist(address, Intent::Unintentional);
      }
   }

   fn on_services_discovered(&mut self, address: Address, services: NativeResult<Vec<Uuid>>) {
      let owner = Owner::Device(address);
      if !self.queue.is_current(TaskType::DiscoverServices, owner) {
         debug!("{address}: services discovered with no discovery task");
         return;
      }
      match services {
         Ok(mut services) => {
            let reported = services.len();
            services.sort_unstable();
            services.dedup();
            if services.len() != reported {
               self.uhoh(UhOh::new(UhOhKind::DuplicateServices, Some(address)));
            }
            self.queue.succeed(TaskType::DiscoverServices, owner);
            if let Some(device) = self.devices.get_mut(&address) {
               device.services = services;
               device.state.update(
                  Intent::Unintentional,
                  NO_STATUS,
                  &[
                     (DeviceState::DiscoveringServices, false),
                     (DeviceState::ServicesDiscovered, true),
                  ],
               );
            }
            self.advance_connect(address);
         },
         Err(status) => {
            if let Some(task) = self.queue.get_current_mut(TaskType::DiscoverServices, owner) {
               task.set_native_status(status);
            }
            self.queue.fail(TaskType::DiscoverServices, owner);
         },
      }
   }

   fn on_bond_state(&mut self, address: Address, bonded: bool, status: i32) {
      let owner = Owner::Device(address);
      if bonded {
         let requested = self.queue.succeed(TaskType::Bond, owner);
         if let Some(device) = self.devices.get_mut(&address) {
            device.bonding_for_connect = false;
            device.state.update(
               Intent::from_explicit(requested),
               status,
               &[
                  (DeviceState::Bonding, false),
                  (DeviceState::Bonded, true),
                  (DeviceState::Unbonded, false),
               ],
            );
         }
         self.advance_connect(address);
      } else if let Some(task) = self.queue.get_current_mut(TaskType::Bond, owner) {
         task.set_native_status(status);
         self.queue.fail(TaskType::Bond, owner);
      } else {
         let requested = self.queue.succeed(TaskType::Unbond, owner);
         if let Some(device) = self.devices.get_mut(&address) {
            device.state.update(
               Intent::from_explicit(requested),
               status,
               &[
                  (DeviceState::Bonding, false),
                  (DeviceState::Bonded, false),
                  (DeviceState::Unbonded, true),
               ],
            );
         }
      }
   }

   /// Ends the current task matching a native result.
   fn route_result(
      &mut self,
      address: Address,
      task_type: TaskType,
      characteristic: Option<Uuid>,
      result: NativeResult<Option<TaskOutput>>,
   ) {
      let owner = Owner::Device(address);
      let Some(task) = self
         .queue
         .get_current_mut(task_type, owner)
         .filter(|t| t.kind().characteristic() == characteristic)
      else {
         debug!("{address}: {task_type} result with no matching task");
         return;
      };
      match result {
         Ok(output) => {
            if let Some(output) = output {
               task.set_output(output);
            }
            self.queue.succeed(task_type, owner);
         },
         Err(status) => {
            task.set_native_status(status);
            self.queue.fail(task_type, owner);
         },
      }
   }

   // === Connect process ===

   /// Moves a connecting device to its next step.
   fn advance_connect(&mut self, address: Address) {
      let owner = Owner::Device(address);
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      if !device.is_connected() || !device.is(DeviceState::ConnectingOverall) {
         return;
      }

      if !device.is(DeviceState::ServicesDiscovered) {
         if !self.queue.is_pending(TaskType::DiscoverServices, owner) {
            self.queue.add(Task::new(TaskKind::DiscoverServices, owner));
         }
         return;
      }

      if device.is(DeviceState::Bonding) || self.queue.is_pending(TaskType::Bond, owner) {
         return;
      }
      let decision = self.bonds.check(&BondContext {
         address,
         trigger: BondTrigger::Connect,
         bonded: device.is_bonded(),
         config: &device.config,
         bond_on_connect: device.bond_on_connect(&self.config),
      });
      match decision {
         BondDecision::Bond => {
            device.bonding_for_connect = true;
            self
               .queue
               .add(Task::new(TaskKind::Bond { explicit: false }, owner));
            return;
         },
         BondDecision::Unbond => {
            self.queue.add(Task::new(TaskKind::Unbond, owner));
         },
         BondDecision::Nothing => {},
      }

      if device.transaction.is_some() {
         return;
      }
      if device.config.requires_authentication && !device.is(DeviceState::Authenticated) {
         self.start_transaction(address, TransactionKind::Authentication);
      } else if device.config.requires_initialization {
         self.start_transaction(address, TransactionKind::Initialization);
      } else {
         self.finish_connect(address);
      }
   }

   fn start_transaction(&mut self, address: Address, kind: TransactionKind) {
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      device.transaction = Some(Transaction {
         kind,
         announced: false,
      });
      let flag = match kind {
         TransactionKind::Authentication => Some(DeviceState::Authenticating),
         TransactionKind::Initialization => Some(DeviceState::Initializing),
         TransactionKind::Custom => None,
      };
      if let Some(flag) = flag {
         device
            .state
            .update(Intent::Unintentional, NO_STATUS, &[(flag, true)]);
      }
      debug!("{address}: {kind} transaction started");
      self
         .queue
         .add(Task::new(TaskKind::TxnLock, Owner::Device(address)));
   }

   fn finish_transaction(&mut self, address: Address, success: bool, timing: Timing) -> bool {
      let owner = Owner::Device(address);
      let Some(txn) = self
         .devices
         .get_mut(&address)
         .and_then(|d| d.transaction.take())
      else {
         return false;
      };
      if !self.queue.succeed(TaskType::TxnLock, owner) {
         self.queue.clear_queue_of(TaskType::TxnLock, owner);
      }
      debug!("{address}: {} transaction ended, success {success}", txn.kind);

      let (flag, done, reason) = match txn.kind {
         TransactionKind::Custom => return true,
         TransactionKind::Authentication => (
            DeviceState::Authenticating,
            DeviceState::Authenticated,
            FailReason::AuthenticationFailed,
         ),
         TransactionKind::Initialization => (
            DeviceState::Initializing,
            DeviceState::Initialized,
            FailReason::InitializationFailed,
         ),
      };
      if !success {
         self.on_connection_failed(address, Failure::new(reason, timing));
         return true;
      }
      if let Some(device) = self.devices.get_mut(&address) {
         device
            .state
            .update(Intent::Unintentional, NO_STATUS, &[(flag, false)]);
      }
      if done == DeviceState::Initialized {
         self.finish_connect(address);
      } else {
         if let Some(device) = self.devices.get_mut(&address) {
            device
               .state
               .update(Intent::Unintentional, NO_STATUS, &[(done, true)]);
         }
         self.advance_connect(address);
      }
      true
   }

   fn finish_connect(&mut self, address: Address) {
      let now = self.clock.now();
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      let intent = if device.reconnect.is_active() || device.connect_waiters.is_empty() {
         Intent::Unintentional
      } else {
         Intent::Intentional
      };
      device.state.update(
         intent,
         NO_STATUS,
         &[
            (DeviceState::ConnectingOverall, false),
            (DeviceState::RetryingConnection, false),
            (DeviceState::AttemptingReconnect, false),
            (DeviceState::Initialized, true),
         ],
      );
      device.fail.on_fully_initialized(device.last_auto_connect);
      let summary = device.reconnect.stop(now);
      device.resolve_waiters(|| Ok(()));
      info!("{address}: initialized");

      if let Some(summary) = summary {
         self.emit(EngineEvent::ReconnectStopped {
            address,
            attempts: summary.attempts,
            elapsed: summary.elapsed,
         });
      }
      self.restore_notifications(address);
   }

   fn restore_notifications(&mut self, address: Address) {
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      for characteristic in device.poll.notify_to_enable() {
         self.queue.add(Task::new(
            TaskKind::ToggleNotify {
               characteristic,
               enable: true,
            },
            Owner::Device(address),
         ));
      }
   }

   /// Records a failed connection attempt and acts on the retry decision.
   fn on_connection_failed(&mut self, address: Address, mut failure: Failure) {
      let now = self.clock.now();
      let owner = Owner::Device(address);
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      failure.highest_state = device.highest_state();
      failure.auto_connect = device.last_auto_connect.take();
      let in_loop = device.reconnect.is_active();
      let was_connected = device.is_connected();
      let info = device.fail.on_failure(failure, in_loop, now);

      device.transaction = None;
      device.bonding_for_connect = false;
      device.poll.on_disconnect();
      let retry = !in_loop && info.decision.is_retry();
      let mut changes = link_down();
      changes.extend([
         (DeviceState::ConnectingOverall, retry),
         (DeviceState::RetryingConnection, retry),
      ]);
      device.state.update(
         Intent::from_explicit(info.reason.was_cancelled()),
         info.gatt_status,
         &changes,
      );
      if in_loop {
         device.reconnect.on_attempt_failed(now);
      } else if !retry {
         device.resolve_waiters(|| Err(GattError::ConnectionFailed(Box::new(info.clone()))));
      }

      let needs_disconnect = was_connected
         && !matches!(
            info.reason,
            FailReason::RogueDisconnect
               | FailReason::ExplicitDisconnect
               | FailReason::AdapterTurningOff
         );
      if needs_disconnect {
         self
            .queue
            .add(Task::new(TaskKind::Disconnect { explicit: false }, owner));
      }
      if retry {
         self
            .queue
            .add(Task::new(TaskKind::Connect { explicit: false }, owner));
      } else if !in_loop {
         self.queue.clear_queue_of(TaskType::Connect, owner);
      }
      self.emit(EngineEvent::ConnectionFailed(Box::new(info)));
   }

   // === Finished tasks ===

   fn on_task_finished(&mut self, mut task: Task) {
      let outcome = task.outcome();
      task.complete();
      let state = outcome.state;
      let status = outcome.native_status;
      self.emit(EngineEvent::TaskEnded(outcome));

      match (task.kind(), task.owner()) {
         (TaskKind::TurnOn, _) if !state.is_success() => {
            self.state.update(
               Intent::Unintentional,
               status,
               &[(ManagerState::TurningOn, false)],
            );
         },
         (TaskKind::TurnOff, _) if !state.is_success() => {
            self.state.update(
               Intent::Unintentional,
               status,
               &[(ManagerState::TurningOff, false)],
            );
         },
         (TaskKind::Scan { .. }, _) => {
            if self.state.is(ManagerState::Scanning) {
               if let Err(e) = self.binding.execute(NativeRequest::StopScan) {
                  warn!("could not stop scanning: {e}");
               }
               self.state.update(
                  Intent::Intentional,
                  NO_STATUS,
                  &[(ManagerState::Scanning, false)],
               );
            }
         },
         (TaskKind::Connect { .. }, Owner::Device(address)) if state.is_failure() => {
            if state == TaskState::TimedOut
               && let Err(e) = self.binding.execute(NativeRequest::Disconnect { address })
            {
               debug!("{address}: could not cancel timed out connect: {e}");
            }
            if let Some(device) = self.devices.get_mut(&address) {
               device.link_active = false;
            }
            let mut failure =
               Failure::new(FailReason::NativeConnectFailed, Timing::from_task_state(state));
            failure.gatt_status = status;
            self.on_connection_failed(address, failure);
         },
         (TaskKind::Disconnect { .. }, Owner::Device(address)) if state.is_failure() => {
            warn!("{address}: disconnect ended as {state}, assuming the link is down");
            self.on_link_lost(address, status, true);
         },
         (TaskKind::DiscoverServices, Owner::Device(address)) if state.is_failure() => {
            let mut failure =
               Failure::new(FailReason::ServiceDiscoveryFailed, Timing::from_task_state(state));
            failure.gatt_status = status;
            self.on_connection_failed(address, failure);
         },
         (TaskKind::Bond { .. }, Owner::Device(address)) if !state.is_success() => {
            if state == TaskState::Interrupted {
               return;
            }
            let Some(device) = self.devices.get_mut(&address) else {
               return;
            };
            let for_connect = std::mem::take(&mut device.bonding_for_connect);
            device.state.update(
               Intent::Unintentional,
               status,
               &[(DeviceState::Bonding, false)],
            );
            if for_connect && state.is_failure() && device.is(DeviceState::ConnectingOverall) {
               let mut failure = Failure::new(FailReason::BondFailed, Timing::from_task_state(state));
               failure.bond_status = status;
               self.on_connection_failed(address, failure);
            }
         },
         (TaskKind::Read { characteristic }, Owner::Device(address))
            if state == TaskState::Succeeded =>
         {
            let changed = match (task.output(), self.devices.get_mut(&address)) {
               (Some(TaskOutput::Value(value)), Some(device)) => {
                  device.poll.on_read(*characteristic, value)
               },
               _ => None,
            };
            if let Some(value) = changed {
               self.emit(EngineEvent::ValueChanged {
                  address,
                  characteristic: *characteristic,
                  value,
               });
            }
         },
         (
            TaskKind::ToggleNotify {
               characteristic,
               enable,
            },
            Owner::Device(address),
         ) => {
            if let Some(device) = self.devices.get_mut(&address) {
               if state == TaskState::Succeeded {
                  device.poll.on_notify_toggled(*characteristic, *enable);
               } else if state != TaskState::Interrupted {
                  device.poll.on_notify_failed(*characteristic);
               }
            }
         },
         (TaskKind::TxnLock, Owner::Device(address)) if state.is_failure() => {
            self.finish_transaction(address, false, Timing::from_task_state(state));
         },
         _ => {},
      }
   }

   // === Events ===

   fn persist(&self, address: Address, intent: Intent) {
      if let Err(e) = self.store.save(address, intent) {
         warn!("{address}: could not persist disconnect intent: {e}");
      }
   }

   fn uhoh(&mut self, uhoh: UhOh) {
      let now = self.clock.now();
      if let Some(uhoh) = self.throttle.check(uhoh, now, self.config.uhoh_throttle()) {
         self.emit(EngineEvent::UhOh(uhoh));
      }
   }

   /// Moves recorded state transitions into the outbox, keeping them ahead
   /// of whatever is emitted next.
   fn sync_state_events(&mut self) {
      for event in self.state.take_events() {
         self.outbox.push(EngineEvent::ManagerState(event));
      }
      for (&address, device) in &mut self.devices {
         for event in device.state.take_events() {
            self.outbox.push(EngineEvent::DeviceState { address, event });
         }
      }
      for violation in self.queue.take_violations() {
         diagnostics::contract_violation(&violation);
         self.outbox.push(EngineEvent::ContractViolation(violation));
      }
   }

   fn emit(&mut self, event: EngineEvent) {
      self.sync_state_events();
      self.outbox.push(event);
   }

   /// Handles every finished task, then delivers pending events.
   fn settle(&mut self) {
      loop {
         let finished = self.queue.take_finished();
         if finished.is_empty() {
            break;
         }
         for task in finished {
            self.on_task_finished(task);
         }
      }
      self.flush();
   }

   /// Delivers pending events: device listeners, then manager listeners,
   /// then the event bus.
   pub fn flush(&mut self) {
      self.sync_state_events();
      for event in std::mem::take(&mut self.outbox) {
         if let Some(address) = event.address()
            && let Some(device) = self.devices.get_mut(&address)
         {
            device.listeners.dispatch(&event);
         }
         self.listeners.dispatch(&event);
         if let Some(bus) = &self.bus {
            bus.emit(event);
         }
      }
   }
}

/// Issues native calls for the queue on behalf of [`Manager`].
struct Executor<'a> {
   config: &'a Config,
   now: Instant,
   timeouts: &'a dyn TimeoutPolicy,
   binding: &'a mut dyn PlatformBinding,
   devices: &'a mut BTreeMap<Address, Device>,
   state: &'a mut StateTracker<ManagerState>,
   events: &'a mut Vec<EngineEvent>,
   uhohs: &'a mut Vec<UhOh>,
}

impl Executor<'_> {
   fn issue(&mut self, request: NativeRequest) -> ExecuteResult {
      let address = request.address();
      match self.binding.execute(request) {
         Ok(()) => ExecuteResult::Started,
         Err(NativeError::Rejected(status)) => ExecuteResult::FailedImmediately(status),
         Err(NativeError::Dead) => {
            self.uhohs.push(UhOh::new(UhOhKind::DeadBinding, address));
            ExecuteResult::FailedImmediately(NO_STATUS)
         },
      }
   }

   fn execute_device(&mut self, kind: &TaskKind, address: Address) -> ExecuteResult {
      let Some(device) = self.devices.get_mut(&address) else {
         return ExecuteResult::NoOp;
      };
      let connected = device.is_connected();
      let request = match kind {
         TaskKind::Connect { explicit } => {
            if device.link_active {
               return ExecuteResult::Redundant;
            }
            let auto_connect = device.auto_connect(self.config);
            device.last_auto_connect = Some(auto_connect);
            device.link_active = true;
            device.fail.on_attempt_start(self.now);
            device.state.update(
               Intent::from_explicit(*explicit),
               NO_STATUS,
               &[(DeviceState::Connecting, true)],
            );
            NativeRequest::Connect {
               address,
               auto_connect,
            }
         },
         TaskKind::Disconnect { .. } => {
            if !device.link_active {
               return ExecuteResult::Redundant;
            }
            NativeRequest::Disconnect { address }
         },
         TaskKind::DiscoverServices => {
            if !connected {
               return ExecuteResult::NoOp;
            }
            device.state.update(
               Intent::Unintentional,
               NO_STATUS,
               &[(DeviceState::DiscoveringServices, true)],
            );
            NativeRequest::DiscoverServices { address }
         },
         TaskKind::Bond { explicit } => {
            if device.is_bonded() {
               return ExecuteResult::Redundant;
            }
            device.state.update(
               Intent::from_explicit(*explicit),
               NO_STATUS,
               &[(DeviceState::Bonding, true)],
            );
            NativeRequest::Bond { address }
         },
         TaskKind::Unbond => {
            if !device.is_bonded() && !device.is(DeviceState::Bonding) {
               return ExecuteResult::Redundant;
            }
            NativeRequest::Unbond { address }
         },
         TaskKind::TxnLock => {
            let Some(txn) = device.transaction.as_mut() else {
               return ExecuteResult::Redundant;
            };
            if !txn.announced {
               txn.announced = true;
               self.events.push(EngineEvent::TransactionRequired {
                  address,
                  kind: txn.kind,
               });
            }
            return ExecuteResult::Started;
         },
         _ if !connected => return ExecuteResult::NoOp,
         TaskKind::Read { characteristic } => NativeRequest::Read {
            address,
            characteristic: *characteristic,
         },
         TaskKind::Write {
            characteristic,
            data,
         } => NativeRequest::Write {
            address,
            characteristic: *characteristic,
            data: data.clone(),
         },
         TaskKind::ToggleNotify {
            characteristic,
            enable,
         } => NativeRequest::SetNotify {
            address,
            characteristic: *characteristic,
            enable: *enable,
         },
         TaskKind::ReadRssi => NativeRequest::ReadRssi { address },
         TaskKind::TurnOn | TaskKind::TurnOff | TaskKind::Scan { .. } => {
            return ExecuteResult::NoOp;
         },
      };
      self.issue(request)
   }
}

impl TaskExecutor for Executor<'_> {
   fn owner_exists(&self, owner: Owner) -> bool {
      match owner {
         Owner::Manager => true,
         Owner::Device(address) => self.devices.contains_key(&address),
      }
   }

   fn resolve_timeout(&self, task: &Task) -> TaskTimeout {
      let device = task
         .owner()
         .device()
         .and_then(|address| self.devices.get(&address))
         .map(|d| &d.config);
      self.timeouts.timeout(task.kind(), device, self.config)
   }

   fn execute(&mut self, task: &Task) -> ExecuteResult {
      match (task.kind(), task.owner()) {
         (TaskKind::TurnOn, _) => {
            if self.state.is(ManagerState::On) {
               return ExecuteResult::Redundant;
            }
            self.state.update(
               Intent::Intentional,
               NO_STATUS,
               &[(ManagerState::TurningOn, true)],
            );
            self.issue(NativeRequest::TurnOn)
         },
         (TaskKind::TurnOff, _) => {
            if self.state.is(ManagerState::Off) {
               return ExecuteResult::Redundant;
            }
            self.state.update(
               Intent::Intentional,
               NO_STATUS,
               &[(ManagerState::TurningOff, true)],
            );
            self.issue(NativeRequest::TurnOff)
         },
         (TaskKind::Scan { .. }, _) => self.issue(NativeRequest::StartScan),
         (kind, Owner::Device(address)) => self.execute_device(kind, address),
         (_, Owner::Manager) => ExecuteResult::NoOp,
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::Ordering;

   use parking_lot::Mutex;
   use smallvec::smallvec;
   use tempfile::TempDir;
   use tokio::sync::oneshot;

   use super::*;
   use crate::{
      binding::recording::RecordingBinding,
      clock::ManualClock,
      connection::{
         ConnectionFailInfo, ReconnectDelay, ReconnectInfo, RetryDecision,
         wake_lock::tests::CountingBackend,
      },
      event::EventQueue,
      persist::HeedStore,
      state::StateEvent,
   };

   const ADDR: Address = Address([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);
   const CHAR: Uuid = Uuid::from_u128(0x2a37);
   const SERVICE: Uuid = Uuid::from_u128(0x180d);
   const TICK: Duration = Duration::from_millis(50);

   struct Harness {
      mgr: Manager,
      clock: Arc<ManualClock>,
      binding: RecordingBinding,
      bus: Arc<EventQueue>,
      seen: Vec<EngineEvent>,
   }

   impl Harness {
      fn new() -> Self {
         let clock = ManualClock::new();
         let binding = RecordingBinding::default();
         let bus = EventQueue::new();
         let mut mgr = Manager::new(Config::default(), Box::new(binding.clone()), clock.clone());
         mgr.set_event_bus(bus.clone());
         Self {
            mgr,
            clock,
            binding,
            bus,
            seen: Vec::new(),
         }
      }

      fn tick(&mut self, n: usize) {
         for _ in 0..n {
            self.clock.advance(TICK);
            self.mgr.tick();
         }
      }

      /// Ticks until `done` holds, at most `max` times.
      fn tick_until(&mut self, max: usize, done: impl Fn(&Self) -> bool) -> bool {
         for _ in 0..max {
            if done(self) {
               return true;
            }
            self.tick(1);
         }
         done(self)
      }

      fn native(&mut self, event: NativeEvent) {
         self.mgr.on_native(event);
      }

      fn sent(&self, pred: impl Fn(&NativeRequest) -> bool) -> usize {
         self.binding.requests.lock().iter().filter(|r| pred(r)).count()
      }

      fn events(&mut self) -> &[EngineEvent] {
         self.seen.extend(self.bus.drain());
         &self.seen
      }

      fn device_events(&mut self) -> Vec<StateEvent<DeviceState>> {
         self
            .events()
            .iter()
            .filter_map(|e| match e {
               EngineEvent::DeviceState { event, .. } => Some(*event),
               _ => None,
            })
            .collect()
      }

      fn failures(&mut self) -> Vec<ConnectionFailInfo> {
         self
            .events()
            .iter()
            .filter_map(|e| match e {
               EngineEvent::ConnectionFailed(info) => Some((**info).clone()),
               _ => None,
            })
            .collect()
      }

      fn task_end(&mut self, task_type: TaskType) -> Option<TaskState> {
         self.events().iter().find_map(|e| match e {
            EngineEvent::TaskEnded(outcome) if outcome.task_type == task_type => {
               Some(outcome.state)
            },
            _ => None,
         })
      }

      fn is(&self, flag: DeviceState) -> bool {
         self
            .mgr
            .device_state(ADDR)
            .is_some_and(|mask| mask.contains(flag))
      }

      /// Connects ADDR all the way to initialized.
      fn connect_fully(&mut self) {
         let (tx, mut rx) = oneshot::channel();
         let connects = self.binding.connects().len();
         let discoveries = self.sent(|r| matches!(r, NativeRequest::DiscoverServices { .. }));
         self.mgr.connect(ADDR, Some(tx)).unwrap();
         assert!(self.tick_until(5, |h| h.binding.connects().len() == connects + 1));
         self.native(NativeEvent::Connected { address: ADDR });
         assert!(self.tick_until(5, |h| {
            h.sent(|r| matches!(r, NativeRequest::DiscoverServices { .. })) == discoveries + 1
         }));
         self.native(NativeEvent::ServicesDiscovered {
            address: ADDR,
            services: Ok(vec![SERVICE]),
         });
         assert!(self.is(DeviceState::Initialized));
         assert!(matches!(rx.try_recv(), Ok(Ok(()))));
      }
   }

   fn is_read(r: &NativeRequest) -> bool {
      matches!(r, NativeRequest::Read { .. })
   }

   #[test]
   fn test_disconnect_cancels_queued_connect() {
      let mut h = Harness::new();
      let (tx, mut rx) = oneshot::channel();
      h.mgr.connect(ADDR, Some(tx)).unwrap();
      h.mgr.disconnect(ADDR, None).unwrap();
      h.tick(5);

      assert_eq!(h.task_end(TaskType::Connect), Some(TaskState::SoftlyCancelled));
      let events = h.device_events();
      let exits = events
         .iter()
         .filter(|e| e.did_exit(DeviceState::ConnectingOverall))
         .count();
      assert_eq!(exits, 1);
      assert!(!events.iter().any(|e| e.did_enter(DeviceState::AttemptingReconnect)));

      let failures = h.failures();
      assert_eq!(failures.len(), 1);
      assert_eq!(failures[0].reason, FailReason::ExplicitDisconnect);
      assert_eq!(failures[0].decision, RetryDecision::DoNotRetry);
      assert!(matches!(rx.try_recv(), Ok(Err(GattError::ConnectionFailed(_)))));
      assert!(h.binding.connects().is_empty());
   }

   #[test]
   fn test_read_times_out() {
      let mut h = Harness::new();
      h.connect_fully();

      let (tx, mut rx) = oneshot::channel();
      h.mgr.read(ADDR, CHAR, None, Some(tx)).unwrap();
      assert!(h.tick_until(5, |h| h.sent(is_read) == 1));

      h.clock.advance(Duration::from_millis(12_400));
      h.mgr.tick();
      assert!(rx.try_recv().is_err());

      h.clock.advance(Duration::from_millis(100));
      h.mgr.tick();
      let outcome = rx.try_recv().unwrap();
      assert_eq!(outcome.state, TaskState::TimedOut);
      assert_eq!(outcome.timing(), Timing::TimedOut);
   }

   #[test]
   fn test_retries_until_policy_gives_up() {
      let mut h = Harness::new();
      h.mgr.register_device(ADDR, None, None);
      let counts = Arc::new(Mutex::new(Vec::new()));
      let seen = counts.clone();
      h.mgr
         .set_retry_policy(
            ADDR,
            Box::new(move |info: &ConnectionFailInfo| {
               seen.lock().push(info.failure_count);
               if info.failure_count < 3 {
                  RetryDecision::Retry
               } else {
                  RetryDecision::DoNotRetry
               }
            }),
         )
         .unwrap();

      let (tx, mut rx) = oneshot::channel();
      h.mgr.connect(ADDR, Some(tx)).unwrap();
      for attempt in 1..=3 {
         assert!(h.tick_until(5, |h| h.binding.connects().len() == attempt));
         assert!(h.is(DeviceState::ConnectingOverall));
         h.native(NativeEvent::ConnectFailed {
            address: ADDR,
            status: 133,
         });
      }
      h.tick(20);

      assert_eq!(h.binding.connects().len(), 3);
      assert_eq!(*counts.lock(), vec![1, 2, 3]);
      assert!(!h.is(DeviceState::ConnectingOverall));
      let Ok(Err(GattError::ConnectionFailed(info))) = rx.try_recv() else {
         panic!("connect should have failed");
      };
      assert_eq!(info.failure_count, 3);
      assert_eq!(info.gatt_status, 133);
      assert_eq!(info.decision, RetryDecision::DoNotRetry);
   }

   #[test]
   fn test_auto_connect_is_learned_and_kept() {
      let mut h = Harness::new();
      h.mgr.register_device(ADDR, None, None);
      let calls = Arc::new(Mutex::new(0));
      let counter = calls.clone();
      h.mgr
         .set_retry_policy(
            ADDR,
            Box::new(move |_: &ConnectionFailInfo| {
               let mut n = counter.lock();
               *n += 1;
               if *n == 1 {
                  RetryDecision::RetryWithAutoConnectTrue
               } else {
                  RetryDecision::RetryWithAutoConnectFalse
               }
            }),
         )
         .unwrap();

      let (tx, mut rx) = oneshot::channel();
      h.mgr.connect(ADDR, Some(tx)).unwrap();
      assert!(h.tick_until(5, |h| h.binding.connects().len() == 1));
      h.clock.advance(Duration::from_millis(12_500));
      assert!(h.tick_until(5, |h| h.binding.connects().len() == 2));
      assert_eq!(h.binding.connects(), vec![false, true]);
      assert_eq!(h.sent(|r| matches!(r, NativeRequest::Disconnect { .. })), 1);
      assert_eq!(h.failures()[0].timing, Timing::TimedOut);

      h.native(NativeEvent::Connected { address: ADDR });
      assert!(h.tick_until(5, |h| {
         h.sent(|r| matches!(r, NativeRequest::DiscoverServices { .. })) == 1
      }));
      h.native(NativeEvent::ServicesDiscovered {
         address: ADDR,
         services: Ok(vec![SERVICE]),
      });
      assert!(matches!(rx.try_recv(), Ok(Ok(()))));
      assert_eq!(h.mgr.auto_connect(ADDR), Some(true));

      h.mgr.disconnect(ADDR, None).unwrap();
      assert!(h.tick_until(5, |h| h.sent(|r| matches!(r, NativeRequest::Disconnect { .. })) == 2));
      h.native(NativeEvent::Disconnected {
         address: ADDR,
         status: 0,
      });
      assert!(!h.is(DeviceState::AttemptingReconnect));

      h.mgr.connect(ADDR, None).unwrap();
      assert!(h.tick_until(5, |h| h.binding.connects().len() == 3));
      h.native(NativeEvent::ConnectFailed {
         address: ADDR,
         status: 133,
      });
      assert!(h.tick_until(5, |h| h.binding.connects().len() == 4));
      assert_eq!(*calls.lock(), 2);
      assert_eq!(h.binding.connects(), vec![false, true, true, true]);
   }

   #[test]
   fn test_reconnect_loop_stops_and_releases_wake_lock() {
      let backend = Arc::new(CountingBackend::default());
      let wake_lock = WakeLock::new(backend.clone());
      let mut h = Harness::new();
      h.mgr.set_wake_lock(wake_lock.clone());
      h.mgr.register_device(ADDR, None, None);
      h.mgr
         .set_reconnect_policy(
            ADDR,
            Box::new(|info: &ReconnectInfo<'_>| {
               if info.attempt_count >= 2 {
                  ReconnectDelay::Stop
               } else {
                  ReconnectDelay::After(Duration::from_millis(100))
               }
            }),
         )
         .unwrap();
      h.connect_fully();

      h.native(NativeEvent::Disconnected {
         address: ADDR,
         status: 8,
      });
      assert!(h.is(DeviceState::AttemptingReconnect));
      assert_eq!(wake_lock.count(), 1);

      for attempt in 1..=2 {
         assert!(h.tick_until(10, |h| h.binding.connects().len() == attempt + 1));
         h.native(NativeEvent::ConnectFailed {
            address: ADDR,
            status: 133,
         });
         assert_eq!(h.mgr.failure_count(ADDR), Some(1));
      }
      assert!(h.is(DeviceState::AttemptingReconnect));

      h.tick(1);
      assert!(!h.is(DeviceState::AttemptingReconnect));
      assert_eq!(wake_lock.count(), 0);
      assert_eq!(backend.released.load(Ordering::SeqCst), 1);

      h.tick(20);
      assert_eq!(h.binding.connects().len(), 3);
      assert!(h.events().iter().any(|e| matches!(
         e,
         EngineEvent::ReconnectStopped { attempts: 2, .. }
      )));
   }

   #[test]
   fn test_unexpected_drop_reconnects_after_restart() {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("disconnects.db");
      {
         let mut h = Harness::new();
         h.mgr.set_store(Arc::new(HeedStore::open_at(&path).unwrap()));
         h.connect_fully();
         h.native(NativeEvent::Disconnected {
            address: ADDR,
            status: 8,
         });
      }

      let mut h = Harness::new();
      h.mgr.set_store(Arc::new(HeedStore::open_at(&path).unwrap()));
      h.mgr.register_device(ADDR, None, None);
      assert!(h.is(DeviceState::AttemptingReconnect));
      assert!(h.tick_until(40, |h| h.binding.connects().len() == 1));
   }

   #[test]
   fn test_explicit_disconnect_is_not_reconnected_after_restart() {
      let store: Arc<dyn DisconnectStore> = Arc::new(MemoryStore::default());
      {
         let mut h = Harness::new();
         h.mgr.set_store(store.clone());
         h.connect_fully();
         h.mgr.disconnect(ADDR, None).unwrap();
         assert!(h.tick_until(5, |h| h.sent(|r| matches!(r, NativeRequest::Disconnect { .. })) == 1));
         h.native(NativeEvent::Disconnected {
            address: ADDR,
            status: 0,
         });
         assert_eq!(h.task_end(TaskType::Disconnect), Some(TaskState::Succeeded));
      }

      let mut h = Harness::new();
      h.mgr.set_store(store);
      h.mgr.register_device(ADDR, None, None);
      assert!(!h.is(DeviceState::AttemptingReconnect));
      h.tick(10);
      assert!(h.binding.connects().is_empty());
   }

   #[test]
   fn test_authentication_and_initialization_transactions() {
      let mut h = Harness::new();
      let config = DeviceConfig {
         requires_authentication: true,
         requires_initialization: true,
         ..DeviceConfig::default()
      };
      h.mgr.register_device(ADDR, None, Some(config));
      let (tx, mut rx) = oneshot::channel();
      h.mgr.connect(ADDR, Some(tx)).unwrap();
      assert!(h.tick_until(5, |h| h.binding.connects().len() == 1));
      h.native(NativeEvent::Connected { address: ADDR });
      assert!(h.tick_until(5, |h| {
         h.sent(|r| matches!(r, NativeRequest::DiscoverServices { .. })) == 1
      }));
      h.native(NativeEvent::ServicesDiscovered {
         address: ADDR,
         services: Ok(vec![SERVICE]),
      });
      assert!(h.is(DeviceState::Authenticating));
      h.tick(2);
      assert!(h.events().iter().any(|e| matches!(
         e,
         EngineEvent::TransactionRequired {
            kind: TransactionKind::Authentication,
            ..
         }
      )));

      // The application talks to the device while holding the transaction.
      let (read_tx, mut read_rx) = oneshot::channel();
      h.mgr.read(ADDR, CHAR, None, Some(read_tx)).unwrap();
      assert!(h.tick_until(5, |h| h.sent(is_read) == 1));
      h.native(NativeEvent::CharacteristicRead {
         address: ADDR,
         characteristic: CHAR,
         result: Ok(smallvec![0x42]),
      });
      let outcome = read_rx.try_recv().unwrap();
      assert_eq!(outcome.output, Some(TaskOutput::Value(smallvec![0x42])));

      h.tick(3);
      assert!(h.mgr.end_transaction(ADDR, true).unwrap());
      assert!(h.is(DeviceState::Authenticated));
      assert!(h.is(DeviceState::Initializing));
      assert!(!h.is(DeviceState::Initialized));

      h.tick(3);
      assert!(h.mgr.end_transaction(ADDR, true).unwrap());
      assert!(h.is(DeviceState::Initialized));
      assert!(!h.is(DeviceState::ConnectingOverall));
      assert!(matches!(rx.try_recv(), Ok(Ok(()))));

      let kinds: Vec<_> = h
         .events()
         .iter()
         .filter_map(|e| match e {
            EngineEvent::TransactionRequired { kind, .. } => Some(*kind),
            _ => None,
         })
         .collect();
      assert_eq!(
         kinds,
         vec![TransactionKind::Authentication, TransactionKind::Initialization]
      );
      assert!(!h.mgr.end_transaction(ADDR, true).unwrap());
   }

   #[test]
   fn test_bounded_scan_ends_successfully() {
      let mut h = Harness::new();
      let (tx, mut rx) = oneshot::channel();
      h.mgr.start_scan(Some(Duration::from_secs(5)), Some(tx));
      assert!(h.tick_until(5, |h| h.sent(|r| *r == NativeRequest::StartScan) == 1));
      h.native(NativeEvent::ScanStarted);
      assert!(h.mgr.manager_state().contains(ManagerState::Scanning));

      h.clock.advance(Duration::from_secs(5));
      h.mgr.tick();
      assert_eq!(rx.try_recv().unwrap().state, TaskState::Succeeded);
      assert_eq!(h.sent(|r| *r == NativeRequest::StopScan), 1);
      assert!(!h.mgr.manager_state().contains(ManagerState::Scanning));
   }

   #[test]
   fn test_unbounded_scan_restarts_when_stack_stops_it() {
      let mut h = Harness::new();
      h.mgr.start_scan(None, None);
      assert!(h.tick_until(5, |h| h.sent(|r| *r == NativeRequest::StartScan) == 1));
      h.native(NativeEvent::ScanStarted);
      h.native(NativeEvent::ScanStopped);
      assert_eq!(h.task_end(TaskType::Scan), Some(TaskState::Interrupted));
      assert!(h.tick_until(5, |h| h.sent(|r| *r == NativeRequest::StartScan) == 2));
      assert!(h.mgr.stop_scan());
      assert_eq!(h.sent(|r| *r == NativeRequest::StopScan), 0);
   }

   #[test]
   fn test_adapter_off_fails_connecting_devices() {
      let mut h = Harness::new();
      let (tx, mut rx) = oneshot::channel();
      h.mgr.connect(ADDR, Some(tx)).unwrap();
      assert!(h.tick_until(5, |h| h.binding.connects().len() == 1));
      h.native(NativeEvent::AdapterState { on: false });

      assert_eq!(h.task_end(TaskType::Connect), Some(TaskState::SoftlyCancelled));
      let failures = h.failures();
      assert_eq!(failures.len(), 1);
      assert_eq!(failures[0].reason, FailReason::AdapterTurningOff);
      assert_eq!(failures[0].decision, RetryDecision::DoNotRetry);
      assert!(matches!(rx.try_recv(), Ok(Err(GattError::ConnectionFailed(_)))));
      h.tick(10);
      assert_eq!(h.binding.connects().len(), 1);
      assert!(h.is(DeviceState::Disconnected));
   }

   #[test]
   fn test_drop_during_discovery_is_retried() {
      let mut h = Harness::new();
      h.mgr.connect(ADDR, None).unwrap();
      assert!(h.tick_until(5, |h| h.binding.connects().len() == 1));
      h.native(NativeEvent::Connected { address: ADDR });
      assert!(h.tick_until(5, |h| h.is(DeviceState::DiscoveringServices)));
      h.native(NativeEvent::Disconnected {
         address: ADDR,
         status: 19,
      });

      assert_eq!(
         h.task_end(TaskType::DiscoverServices),
         Some(TaskState::SoftlyCancelled)
      );
      let failures = h.failures();
      assert_eq!(failures.len(), 1);
      assert_eq!(failures[0].reason, FailReason::RogueDisconnect);
      assert_eq!(failures[0].gatt_status, 19);
      assert_eq!(failures[0].highest_state, Some(DeviceState::DiscoveringServices));
      assert!(h.is(DeviceState::RetryingConnection));
      assert!(h.tick_until(5, |h| h.binding.connects().len() == 2));
   }

   #[test]
   fn test_bonded_characteristic_bonds_first() {
      let mut h = Harness::new();
      let config = DeviceConfig {
         bonded_characteristics: vec![CHAR],
         ..DeviceConfig::default()
      };
      h.mgr.register_device(ADDR, None, Some(config));
      h.connect_fully();

      h.mgr.read(ADDR, CHAR, None, None).unwrap();
      assert!(h.tick_until(5, |h| h.sent(|r| matches!(r, NativeRequest::Bond { .. })) == 1));
      assert!(h.is(DeviceState::Bonding));
      assert_eq!(h.sent(is_read), 0);

      h.native(NativeEvent::BondState {
         address: ADDR,
         bonded: true,
         status: 0,
      });
      assert!(h.is(DeviceState::Bonded));
      assert!(h.tick_until(5, |h| h.sent(is_read) == 1));
   }

   #[test]
   fn test_change_only_poll_reports_changes() {
      let mut h = Harness::new();
      h.connect_fully();
      h.mgr
         .start_poll(ADDR, CHAR, Duration::from_secs(1), true)
         .unwrap();

      for (n, value) in [[1u8], [1], [2]].into_iter().enumerate() {
         assert!(h.tick_until(30, |h| h.sent(is_read) == n + 1));
         h.native(NativeEvent::CharacteristicRead {
            address: ADDR,
            characteristic: CHAR,
            result: Ok(Value::from_slice(&value)),
         });
      }

      let changes: Vec<_> = h
         .events()
         .iter()
         .filter_map(|e| match e {
            EngineEvent::ValueChanged { value, .. } => Some(value.to_vec()),
            _ => None,
         })
         .collect();
      assert_eq!(changes, vec![vec![1], vec![2]]);
   }

   #[test]
   fn test_dead_binding_is_reported_once() {
      let mut h = Harness::new();
      let always: fn(&NativeRequest) -> bool = |_| true;
      *h.binding.reject.lock() = Some((always, NativeError::Dead));
      h.mgr.connect(ADDR, None).unwrap();
      h.tick(20);

      let uhohs: Vec<_> = h
         .events()
         .iter()
         .filter_map(|e| match e {
            EngineEvent::UhOh(uhoh) => Some(uhoh.kind),
            _ => None,
         })
         .collect();
      assert_eq!(uhohs, vec![UhOhKind::DeadBinding]);
      let failures = h.failures();
      assert_eq!(failures.len(), 3);
      assert!(failures.iter().all(|f| f.timing == Timing::Immediately));
   }

   #[test]
   fn test_listeners_run_before_the_bus() {
      let mut h = Harness::new();
      h.mgr.register_device(ADDR, None, None);
      let order = Arc::new(Mutex::new(Vec::new()));
      let device_log = order.clone();
      h.mgr
         .add_device_listener(
            ADDR,
            Box::new(move |e: &EngineEvent| {
               if matches!(e, EngineEvent::ConnectionFailed(_)) {
                  device_log.lock().push("device");
               }
            }),
         )
         .unwrap();
      let manager_log = order.clone();
      h.mgr.add_listener(Box::new(move |e: &EngineEvent| {
         if matches!(e, EngineEvent::ConnectionFailed(_)) {
            manager_log.lock().push("manager");
         }
      }));

      h.mgr.connect(ADDR, None).unwrap();
      h.mgr.disconnect(ADDR, None).unwrap();
      assert_eq!(*order.lock(), vec!["device", "manager"]);
      assert_eq!(h.failures().len(), 1);
   }
}
