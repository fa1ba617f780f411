//! Per-device engine state.

use serde::Serialize;
use serde_json::json;
use smol_str::SmolStr;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{
   address::Address,
   clock::ClockRef,
   config::{Config, DeviceConfig},
   connection::{
      ConnectionFailManager, DefaultReconnectPolicy, DefaultRetryPolicy, ReconnectManager,
      WakeLock,
   },
   error::Result,
   event::{Listeners, TransactionKind},
   poll::PollManager,
   state::{DeviceState, Intent, NO_STATUS, StateMask, StateTracker},
};

/// Resolved when an explicit connect reaches the initialized state, or with
/// the final failure.
pub type ConnectWaiter = oneshot::Sender<Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transaction {
   pub kind: TransactionKind,
   pub announced: bool,
}

/// A remote device and everything the engine tracks about it.
pub struct Device {
   address: Address,
   name: Option<SmolStr>,
   pub(crate) config: DeviceConfig,
   pub(crate) state: StateTracker<DeviceState>,
   pub(crate) fail: ConnectionFailManager,
   pub(crate) reconnect: ReconnectManager,
   pub(crate) poll: PollManager,
   pub(crate) listeners: Listeners,
   pub(crate) connect_waiters: Vec<ConnectWaiter>,
   pub(crate) transaction: Option<Transaction>,
   pub(crate) services: Vec<Uuid>,
   pub(crate) rssi: Option<i16>,
   /// Auto-connect flag of the last native connect.
   pub(crate) last_auto_connect: Option<bool>,
   /// A native connect was issued or the link is up.
   pub(crate) link_active: bool,
   /// The bond in flight was started by the connect process.
   pub(crate) bonding_for_connect: bool,
}

impl Device {
   pub(crate) fn new(
      address: Address,
      name: Option<SmolStr>,
      config: DeviceConfig,
      global: &Config,
      clock: ClockRef,
      wake_lock: WakeLock,
   ) -> Self {
      let retry_count = config
         .connection_retry_count
         .unwrap_or(global.connection_retry_count);
      let mut state = StateTracker::new(address.to_string(), clock);
      state.set(
         Intent::Unintentional,
         NO_STATUS,
         &[(DeviceState::Undiscovered, true), (DeviceState::Disconnected, true)],
      );
      Self {
         address,
         name,
         config,
         state,
         fail: ConnectionFailManager::new(address, Box::new(DefaultRetryPolicy { retry_count })),
         reconnect: ReconnectManager::new(
            address,
            Box::new(DefaultReconnectPolicy::new(global.reconnect.clone())),
            wake_lock,
         ),
         poll: PollManager::default(),
         listeners: Listeners::default(),
         connect_waiters: Vec::new(),
         transaction: None,
         services: Vec::new(),
         rssi: None,
         last_auto_connect: None,
         link_active: false,
         bonding_for_connect: false,
      }
   }

   pub const fn address(&self) -> Address {
      self.address
   }

   pub fn name(&self) -> Option<&str> {
      self.name.as_deref()
   }

   pub(crate) fn set_name(&mut self, name: SmolStr) {
      self.name = Some(name);
   }

   pub const fn config(&self) -> &DeviceConfig {
      &self.config
   }

   pub fn mask(&self) -> StateMask<DeviceState> {
      self.state.mask()
   }

   pub fn is(&self, flag: DeviceState) -> bool {
      self.state.is(flag)
   }

   pub fn is_connected(&self) -> bool {
      self.is(DeviceState::Connected)
   }

   pub fn is_initialized(&self) -> bool {
      self.is(DeviceState::Initialized)
   }

   pub fn is_bonded(&self) -> bool {
      self.is(DeviceState::Bonded)
   }

   pub fn auto_connect(&self, global: &Config) -> bool {
      self
         .fail
         .auto_connect(self.config.use_auto_connect.unwrap_or(global.use_auto_connect))
   }

   pub fn bond_on_connect(&self, global: &Config) -> bool {
      self.config.bond_on_connect.unwrap_or(global.bond_on_connect)
   }

   /// Furthest connect step currently reached.
   pub fn highest_state(&self) -> Option<DeviceState> {
      DeviceState::PROGRESSION
         .iter()
         .rev()
         .copied()
         .find(|&flag| self.is(flag))
   }

   pub(crate) fn resolve_waiters(&mut self, result: impl Fn() -> Result<()>) {
      for waiter in self.connect_waiters.drain(..) {
         let _ = waiter.send(result());
      }
   }

   pub fn snapshot(&self) -> DeviceSnapshot {
      DeviceSnapshot {
         address: self.address,
         name: self.name.clone(),
         state: self.mask().iter().map(DeviceState::to_str).collect(),
         failure_count: self.fail.failure_count(),
         reconnecting: self.reconnect.is_active(),
         rssi: self.rssi,
         services: self.services.clone(),
      }
   }
}

/// Read-only view of a device, handed out by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
   pub address: Address,
   pub name: Option<SmolStr>,
   pub state: Vec<&'static str>,
   pub failure_count: u32,
   pub reconnecting: bool,
   pub rssi: Option<i16>,
   pub services: Vec<Uuid>,
}

impl DeviceSnapshot {
   pub fn to_json(&self) -> serde_json::Value {
      let mut info = json!({
          "address": self.address.to_string(),
          "state": self.state,
          "failure_count": self.failure_count,
          "reconnecting": self.reconnecting,
      });
      if let Some(name) = &self.name {
         info["name"] = json!(name.as_str());
      }
      if let Some(rssi) = self.rssi {
         info["rssi"] = json!(rssi);
      }
      if !self.services.is_empty() {
         info["services"] = json!(self.services);
      }
      info
   }

   pub fn is(&self, flag: DeviceState) -> bool {
      self.state.contains(&flag.to_str())
   }
}
