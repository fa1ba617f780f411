//! Error types for the GATT engine.
//!
//! Expected radio failures never show up here; they end tasks in a terminal
//! state and are reported as structured
//! [`ConnectionFailInfo`](crate::connection::ConnectionFailInfo) values.
//! `GattError` covers what goes wrong around the engine: bad input, a dead
//! actor, configuration and persistence I/O.

use smol_str::SmolStr;
use thiserror::Error;

use crate::{
   address::Address,
   connection::ConnectionFailInfo,
   task::{TaskState, TaskType},
};

/// Main error type for the engine.
#[derive(Error, Debug)]
pub enum GattError {
   #[cfg(feature = "bluez")]
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[cfg(feature = "daemon")]
   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[cfg(feature = "daemon")]
   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Device not connected: {0}")]
   DeviceNotConnected(Address),

   #[error("Already connecting to device: {0}")]
   AlreadyConnecting(Address),

   #[error("Invalid address: {0}")]
   InvalidAddress(SmolStr),

   #[error("{task} ended as {state}")]
   TaskEnded { task: TaskType, state: TaskState },

   #[error("Connection to {} failed: {}", .0.address, .0.reason)]
   ConnectionFailed(Box<ConnectionFailInfo>),

   #[error("Platform binding error: {0}")]
   Native(SmolStr),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Persistence error: {0}")]
   Persist(#[from] crate::persist::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `GattError`.
pub type Result<T> = std::result::Result<T, GattError>;
