//! Connection failure handling and automatic reconnection.

pub mod fail;
pub mod reconnect;
pub mod wake_lock;

pub use fail::{
   AutoConnectUsage, ConnectionFailInfo, ConnectionFailManager, DefaultRetryPolicy, FailReason,
   Failure, RetryDecision, RetryPolicy, Timing,
};
pub use reconnect::{
   DefaultReconnectPolicy, LoopSummary, ReconnectAction, ReconnectDelay, ReconnectInfo,
   ReconnectManager, ReconnectPolicy,
};
pub use wake_lock::{NoWakeLock, WakeLock, WakeLockBackend, WakeLockGuard};
