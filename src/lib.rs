//! A deterministic BLE GATT client engine.
//!
//! Every radio operation is a task in one priority queue, executed one at a
//! time with a timeout. Adapter and device states are tracked as flag masks,
//! connection failures are classified and retried per policy, and devices
//! that drop unexpectedly are reconnected in a long-running loop, even after
//! a restart.
//!
//! [`Manager`] is the synchronous core. [`Engine`] runs it on a tokio actor.
//! With the `bluez` feature, [`bluez::BluezBinding`] drives a real adapter.

pub mod address;
pub mod binding;
#[cfg(feature = "bluez")]
pub mod bluez;
pub mod bond;
pub mod clock;
pub mod config;
pub mod connection;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod manager;
pub mod persist;
pub mod poll;
pub mod runtime;
pub mod state;
pub mod task;

pub use address::Address;
pub use binding::{NativeEvent, NativeRequest, NativeSender, PlatformBinding};
pub use config::{Config, DeviceConfig};
pub use device::DeviceSnapshot;
pub use error::{GattError, Result};
pub use event::{EngineEvent, EventBus, EventQueue, EventSender};
pub use manager::Manager;
pub use runtime::{Engine, EngineBuilder};
pub use state::{DeviceState, ManagerState};
pub use task::{Priority, TaskKind, TaskOutcome, TaskState, TaskType, Value};
