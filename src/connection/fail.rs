//! Connection failure bookkeeping and the retry policy.

use std::time::{Duration, Instant};

use log::{debug, info};
use serde::Serialize;

use crate::{address::Address, state::DeviceState, task::TaskState};

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailReason {
   NativeConnectFailed,
   ServiceDiscoveryFailed,
   BondFailed,
   AuthenticationFailed,
   InitializationFailed,
   /// The link dropped after connecting but before initialization finished.
   RogueDisconnect,
   AdapterTurningOff,
   ExplicitDisconnect,
   AlreadyConnecting,
}

impl FailReason {
   pub const fn was_cancelled(self) -> bool {
      matches!(self, Self::ExplicitDisconnect | Self::AdapterTurningOff)
   }

   /// Whether a retry decision from the policy is honoured at all.
   pub const fn allows_retry(self) -> bool {
      !self.was_cancelled() && !matches!(self, Self::AlreadyConnecting)
   }
}

/// When, relative to the native call, the failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Timing {
   Immediately,
   Eventually,
   TimedOut,
   NotApplicable,
}

impl Timing {
   pub const fn from_task_state(state: TaskState) -> Self {
      match state {
         TaskState::FailedImmediately => Self::Immediately,
         TaskState::TimedOut => Self::TimedOut,
         TaskState::Failed => Self::Eventually,
         _ => Self::NotApplicable,
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AutoConnectUsage {
   Used,
   NotUsed,
   /// No native connect was issued for this attempt.
   Unknown,
}

impl AutoConnectUsage {
   pub const fn from_flag(used: Option<bool>) -> Self {
      match used {
         Some(true) => Self::Used,
         Some(false) => Self::NotUsed,
         None => Self::Unknown,
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RetryDecision {
   Retry,
   RetryWithAutoConnectTrue,
   RetryWithAutoConnectFalse,
   DoNotRetry,
}

impl RetryDecision {
   pub const fn is_retry(self) -> bool {
      !matches!(self, Self::DoNotRetry)
   }

   pub const fn auto_connect(self) -> Option<bool> {
      match self {
         Self::RetryWithAutoConnectTrue => Some(true),
         Self::RetryWithAutoConnectFalse => Some(false),
         Self::Retry | Self::DoNotRetry => None,
      }
   }
}

/// Everything known about one failed connection attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionFailInfo {
   pub address: Address,
   pub reason: FailReason,
   pub timing: Timing,
   /// Consecutive failures, including this one.
   pub failure_count: u32,
   /// Time since the first attempt of the current streak.
   pub total_attempt_time: Duration,
   /// Time since this attempt started.
   pub attempt_time: Duration,
   pub gatt_status: i32,
   pub bond_status: i32,
   pub auto_connect_usage: AutoConnectUsage,
   /// Furthest connect step reached before failing.
   pub highest_state: Option<DeviceState>,
   pub in_reconnect_loop: bool,
   pub decision: RetryDecision,
}

/// Raw failure data collected by the engine before policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Failure {
   pub reason: FailReason,
   pub timing: Timing,
   pub gatt_status: i32,
   pub bond_status: i32,
   pub auto_connect: Option<bool>,
   pub highest_state: Option<DeviceState>,
}

impl Failure {
   pub const fn new(reason: FailReason, timing: Timing) -> Self {
      Self {
         reason,
         timing,
         gatt_status: crate::state::NO_STATUS,
         bond_status: crate::state::NO_STATUS,
         auto_connect: None,
         highest_state: None,
      }
   }
}

/// Decides whether a failed connection is retried.
pub trait RetryPolicy: Send {
   fn on_failure(&mut self, info: &ConnectionFailInfo) -> RetryDecision;
}

impl<F> RetryPolicy for F
where
   F: FnMut(&ConnectionFailInfo) -> RetryDecision + Send,
{
   fn on_failure(&mut self, info: &ConnectionFailInfo) -> RetryDecision {
      self(info)
   }
}

/// Retries up to `retry_count` times. A timeout without native auto-connect
/// is retried with auto-connect on.
#[derive(Debug, Clone, Copy)]
pub struct DefaultRetryPolicy {
   pub retry_count: u32,
}

impl RetryPolicy for DefaultRetryPolicy {
   fn on_failure(&mut self, info: &ConnectionFailInfo) -> RetryDecision {
      if !info.reason.allows_retry() || info.failure_count > self.retry_count {
         RetryDecision::DoNotRetry
      } else if info.timing == Timing::TimedOut
         && info.auto_connect_usage == AutoConnectUsage::NotUsed
      {
         RetryDecision::RetryWithAutoConnectTrue
      } else {
         RetryDecision::Retry
      }
   }
}

/// Per-device failure counter and auto-connect learning.
pub struct ConnectionFailManager {
   address: Address,
   policy: Box<dyn RetryPolicy>,
   failure_count: u32,
   streak_started: Option<Instant>,
   attempt_started: Option<Instant>,
   sticky_auto_connect: Option<bool>,
   confirmed_auto_connect: Option<bool>,
   last_failure: Option<ConnectionFailInfo>,
}

impl ConnectionFailManager {
   pub fn new(address: Address, policy: Box<dyn RetryPolicy>) -> Self {
      Self {
         address,
         policy,
         failure_count: 0,
         streak_started: None,
         attempt_started: None,
         sticky_auto_connect: None,
         confirmed_auto_connect: None,
         last_failure: None,
      }
   }

   pub fn set_policy(&mut self, policy: Box<dyn RetryPolicy>) {
      self.policy = policy;
   }

   pub const fn failure_count(&self) -> u32 {
      self.failure_count
   }

   pub const fn last_failure(&self) -> Option<&ConnectionFailInfo> {
      self.last_failure.as_ref()
   }

   /// Auto-connect setting for the next native connect.
   pub fn auto_connect(&self, default: bool) -> bool {
      self
         .confirmed_auto_connect
         .or(self.sticky_auto_connect)
         .unwrap_or(default)
   }

   pub const fn is_auto_connect_confirmed(&self) -> bool {
      self.confirmed_auto_connect.is_some()
   }

   pub fn reset(&mut self) {
      if self.failure_count != 0 {
         debug!("{}: failure count reset", self.address);
      }
      self.failure_count = 0;
      self.streak_started = None;
      self.attempt_started = None;
   }

   /// An explicit connect starts a fresh streak.
   pub fn on_explicit_connect(&mut self, now: Instant) {
      self.reset();
      self.streak_started = Some(now);
   }

   /// A native connect is being issued.
   pub fn on_attempt_start(&mut self, now: Instant) {
      self.streak_started.get_or_insert(now);
      self.attempt_started = Some(now);
   }

   /// The device reached the initialized state using `auto_connect`.
   pub fn on_fully_initialized(&mut self, auto_connect: Option<bool>) {
      self.reset();
      self.last_failure = None;
      if self.confirmed_auto_connect.is_none()
         && let Some(used) = auto_connect
      {
         info!("{}: auto-connect {used} confirmed", self.address);
         self.confirmed_auto_connect = Some(used);
      }
   }

   /// Records a failure and asks the policy what to do.
   pub fn on_failure(
      &mut self,
      failure: Failure,
      in_reconnect_loop: bool,
      now: Instant,
   ) -> ConnectionFailInfo {
      if failure.reason.allows_retry() {
         self.failure_count = if in_reconnect_loop {
            1
         } else {
            self.failure_count + 1
         };
      }

      let since = |t: Option<Instant>| t.map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
      let mut info = ConnectionFailInfo {
         address: self.address,
         reason: failure.reason,
         timing: failure.timing,
         failure_count: self.failure_count,
         total_attempt_time: since(self.streak_started),
         attempt_time: since(self.attempt_started),
         gatt_status: failure.gatt_status,
         bond_status: failure.bond_status,
         auto_connect_usage: AutoConnectUsage::from_flag(failure.auto_connect),
         highest_state: failure.highest_state,
         in_reconnect_loop,
         decision: RetryDecision::DoNotRetry,
      };

      let decision = self.policy.on_failure(&info);
      info.decision = if failure.reason.allows_retry() {
         decision
      } else {
         RetryDecision::DoNotRetry
      };

      if self.confirmed_auto_connect.is_none()
         && let Some(auto_connect) = info.decision.auto_connect()
      {
         self.sticky_auto_connect = Some(auto_connect);
      }

      info!(
         "{}: connection failed ({}, {}), count {}, decision {}",
         self.address, info.reason, info.timing, info.failure_count, info.decision
      );
      self.attempt_started = None;
      self.last_failure = Some(info.clone());
      info
   }
}

#[cfg(test)]
mod tests {
   use std::sync::{Arc, Mutex};

   use super::*;

   fn manager(policy: impl RetryPolicy + 'static) -> ConnectionFailManager {
      ConnectionFailManager::new(Address::any(), Box::new(policy))
   }

   fn native(timing: Timing) -> Failure {
      Failure::new(FailReason::NativeConnectFailed, timing)
   }

   #[test]
   fn test_counts_and_cancellations() {
      let seen = Arc::new(Mutex::new(Vec::new()));
      let log = seen.clone();
      let mut mgr = manager(move |info: &ConnectionFailInfo| {
         log.lock().unwrap().push(info.failure_count);
         RetryDecision::Retry
      });
      let now = Instant::now();

      assert!(mgr.on_failure(native(Timing::Eventually), false, now).decision.is_retry());
      mgr.on_failure(native(Timing::Eventually), false, now);
      let cancelled = mgr.on_failure(
         Failure::new(FailReason::ExplicitDisconnect, Timing::NotApplicable),
         false,
         now,
      );
      assert_eq!(cancelled.decision, RetryDecision::DoNotRetry);
      let already = mgr.on_failure(
         Failure::new(FailReason::AlreadyConnecting, Timing::NotApplicable),
         false,
         now,
      );
      assert_eq!(already.decision, RetryDecision::DoNotRetry);
      assert_eq!(*seen.lock().unwrap(), vec![1, 2, 2, 2]);

      assert_eq!(mgr.on_failure(native(Timing::Eventually), true, now).failure_count, 1);
   }

   #[test]
   fn test_resets_yield_zero_before_next_failure() {
      let mut mgr = manager(DefaultRetryPolicy { retry_count: 5 });
      let now = Instant::now();
      let resets: [fn(&mut ConnectionFailManager); 3] = [
         ConnectionFailManager::reset,
         |m| m.on_explicit_connect(Instant::now()),
         |m| m.on_fully_initialized(None),
      ];
      for reset in resets {
         mgr.on_failure(native(Timing::Eventually), false, now);
         mgr.on_failure(native(Timing::Eventually), false, now);
         reset(&mut mgr);
         assert_eq!(mgr.failure_count(), 0);
         assert_eq!(mgr.on_failure(native(Timing::Eventually), false, now).failure_count, 1);
         mgr.reset();
      }
   }

   #[test]
   fn test_default_policy_learns_auto_connect() {
      let mut mgr = manager(DefaultRetryPolicy { retry_count: 2 });
      let now = Instant::now();
      let mut timed_out = native(Timing::TimedOut);
      timed_out.auto_connect = Some(false);

      let info = mgr.on_failure(timed_out, false, now);
      assert_eq!(info.decision, RetryDecision::RetryWithAutoConnectTrue);
      assert!(mgr.auto_connect(false));

      mgr.on_failure(native(Timing::Eventually), false, now);
      let info = mgr.on_failure(native(Timing::Eventually), false, now);
      assert_eq!(info.failure_count, 3);
      assert_eq!(info.decision, RetryDecision::DoNotRetry);
   }

   #[test]
   fn test_confirmed_auto_connect_is_permanent() {
      let mut mgr = manager(|_: &ConnectionFailInfo| RetryDecision::RetryWithAutoConnectFalse);
      mgr.on_fully_initialized(Some(true));
      mgr.on_failure(native(Timing::TimedOut), false, Instant::now());
      assert!(mgr.auto_connect(false));
      assert!(mgr.is_auto_connect_confirmed());
   }

   #[test]
   fn test_elapsed_times() {
      let mut mgr = manager(DefaultRetryPolicy { retry_count: 2 });
      let start = Instant::now();
      mgr.on_explicit_connect(start);
      mgr.on_attempt_start(start + Duration::from_secs(2));
      let info = mgr.on_failure(
         native(Timing::Eventually),
         false,
         start + Duration::from_secs(5),
      );
      assert_eq!(info.total_attempt_time, Duration::from_secs(5));
      assert_eq!(info.attempt_time, Duration::from_secs(3));
   }
}
