//! Closed state enumerations for devices and the manager.

use serde::{Deserialize, Serialize};

use super::StateFlag;

/// Flags describing a remote device. Several may be on at once, e.g. a device
/// can be `ConnectingOverall`, `Connected` and `DiscoveringServices` together.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumIter,
   strum::EnumCount,
   strum::IntoStaticStr,
   strum::FromRepr,
)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceState {
   Undiscovered,
   Discovered,
   Advertising,
   Disconnected,
   /// The whole connect process (native connect, discovery, bonding,
   /// authentication, initialization) is under way.
   ConnectingOverall,
   /// The native connect call is in flight.
   Connecting,
   Connected,
   DiscoveringServices,
   ServicesDiscovered,
   Authenticating,
   Authenticated,
   Initializing,
   Initialized,
   Unbonded,
   Bonding,
   Bonded,
   AttemptingReconnect,
   RetryingConnection,
}

impl StateFlag for DeviceState {
   fn index(self) -> usize {
      self as usize
   }
}

impl DeviceState {
   /// Flags that describe an established or in-progress link. All of them are
   /// cleared when the link goes down.
   pub const LINK: &'static [Self] = &[
      Self::Connecting,
      Self::Connected,
      Self::DiscoveringServices,
      Self::ServicesDiscovered,
      Self::Authenticating,
      Self::Authenticated,
      Self::Initializing,
      Self::Initialized,
   ];

   /// Steps of the connect process, in the order they are reached.
   pub const PROGRESSION: &'static [Self] = &[
      Self::Connecting,
      Self::Connected,
      Self::DiscoveringServices,
      Self::ServicesDiscovered,
      Self::Bonding,
      Self::Authenticating,
      Self::Authenticated,
      Self::Initializing,
      Self::Initialized,
   ];

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Flags describing the local adapter.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumIter,
   strum::EnumCount,
   strum::IntoStaticStr,
   strum::FromRepr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ManagerState {
   Off,
   TurningOn,
   On,
   TurningOff,
   Scanning,
}

impl StateFlag for ManagerState {
   fn index(self) -> usize {
      self as usize
   }
}

impl ManagerState {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}
