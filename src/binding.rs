//! The boundary with the platform Bluetooth stack.
//!
//! The engine issues [`NativeRequest`]s through a [`PlatformBinding`]; every
//! call returns immediately. Results come back later as [`NativeEvent`]s,
//! delivered from whatever thread the stack uses through a [`NativeSender`].

use smol_str::SmolStr;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{address::Address, task::Value};

/// Outcome of a native operation: a value, or the native status code.
pub type NativeResult<T> = Result<T, i32>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeRequest {
   TurnOn,
   TurnOff,
   StartScan,
   StopScan,
   Connect { address: Address, auto_connect: bool },
   Disconnect { address: Address },
   DiscoverServices { address: Address },
   Bond { address: Address },
   Unbond { address: Address },
   Read { address: Address, characteristic: Uuid },
   Write { address: Address, characteristic: Uuid, data: Value },
   SetNotify { address: Address, characteristic: Uuid, enable: bool },
   ReadRssi { address: Address },
}

impl NativeRequest {
   pub const fn address(&self) -> Option<Address> {
      match self {
         Self::TurnOn | Self::TurnOff | Self::StartScan | Self::StopScan => None,
         Self::Connect { address, .. }
         | Self::Disconnect { address }
         | Self::DiscoverServices { address }
         | Self::Bond { address }
         | Self::Unbond { address }
         | Self::Read { address, .. }
         | Self::Write { address, .. }
         | Self::SetNotify { address, .. }
         | Self::ReadRssi { address } => Some(*address),
      }
   }
}

/// Why the binding refused a request synchronously.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NativeError {
   #[error("rejected with status {0}")]
   Rejected(i32),
   #[error("native handle is gone")]
   Dead,
}

/// Issues native calls. Implementations must not block.
pub trait PlatformBinding: Send {
   fn execute(&mut self, request: NativeRequest) -> Result<(), NativeError>;
}

/// Asynchronous callbacks from the native stack.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeEvent {
   AdapterState { on: bool },
   ScanStarted,
   ScanStopped,
   ScanFailed { status: i32 },
   Advertisement { address: Address, rssi: Option<i16>, name: Option<SmolStr> },
   Connected { address: Address },
   ConnectFailed { address: Address, status: i32 },
   Disconnected { address: Address, status: i32 },
   ServicesDiscovered { address: Address, services: NativeResult<Vec<Uuid>> },
   BondState { address: Address, bonded: bool, status: i32 },
   CharacteristicRead { address: Address, characteristic: Uuid, result: NativeResult<Value> },
   CharacteristicWritten { address: Address, characteristic: Uuid, result: NativeResult<()> },
   NotifyToggled { address: Address, characteristic: Uuid, result: NativeResult<bool> },
   Notification { address: Address, characteristic: Uuid, value: Value },
   Rssi { address: Address, result: NativeResult<i16> },
}

/// Cloneable handle for delivering native events into the engine from any thread.
#[derive(Debug, Clone)]
pub struct NativeSender {
   tx: mpsc::UnboundedSender<NativeEvent>,
}

impl NativeSender {
   pub fn channel() -> (Self, mpsc::UnboundedReceiver<NativeEvent>) {
      let (tx, rx) = mpsc::unbounded_channel();
      (Self { tx }, rx)
   }

   /// Returns `false` once the engine is gone.
   pub fn deliver(&self, event: NativeEvent) -> bool {
      self.tx.send(event).is_ok()
   }

   pub fn is_closed(&self) -> bool {
      self.tx.is_closed()
   }
}
