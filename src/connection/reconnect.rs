//! The reconnect loop run after a device drops its link on its own.

use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng;

use crate::{address::Address, config::ReconnectConfig};

use super::{
   fail::ConnectionFailInfo,
   wake_lock::{WakeLock, WakeLockGuard},
};

/// What the delay policy wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDelay {
   After(Duration),
   Stop,
}

/// Input to the delay policy.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectInfo<'a> {
   pub address: Address,
   /// Connect attempts issued so far by this loop.
   pub attempt_count: u32,
   pub total_elapsed: Duration,
   pub previous_delay: Duration,
   pub last_failure: Option<&'a ConnectionFailInfo>,
}

/// Decides the spacing of reconnect attempts. Consulted on every tick while
/// the loop waits, so answers for the same attempt should be stable.
pub trait ReconnectPolicy: Send {
   fn delay(&mut self, info: &ReconnectInfo<'_>) -> ReconnectDelay;
}

impl<F> ReconnectPolicy for F
where
   F: FnMut(&ReconnectInfo<'_>) -> ReconnectDelay + Send,
{
   fn delay(&mut self, info: &ReconnectInfo<'_>) -> ReconnectDelay {
      self(info)
   }
}

/// Exponential backoff with jitter, giving up after a total time.
#[derive(Debug, Clone)]
pub struct DefaultReconnectPolicy {
   config: ReconnectConfig,
   jitter: Option<(u32, Duration)>,
}

impl DefaultReconnectPolicy {
   pub const fn new(config: ReconnectConfig) -> Self {
      Self {
         config,
         jitter: None,
      }
   }

   fn jitter_for(&mut self, attempt: u32) -> Duration {
      match self.jitter {
         Some((cached, jitter)) if cached == attempt => jitter,
         _ => {
            let jitter = if self.config.jitter_ms == 0 {
               Duration::ZERO
            } else {
               Duration::from_millis(rand::thread_rng().gen_range(0..self.config.jitter_ms))
            };
            self.jitter = Some((attempt, jitter));
            jitter
         },
      }
   }
}

impl ReconnectPolicy for DefaultReconnectPolicy {
   fn delay(&mut self, info: &ReconnectInfo<'_>) -> ReconnectDelay {
      let give_up = Duration::from_secs(self.config.give_up_secs);
      if !give_up.is_zero() && info.total_elapsed >= give_up {
         return ReconnectDelay::Stop;
      }
      if info.attempt_count == 0 {
         return ReconnectDelay::After(Duration::ZERO);
      }
      let exponent = (info.attempt_count - 1).min(16);
      let base = Duration::from_millis(self.config.base_delay_ms.saturating_mul(1 << exponent));
      let delay = base.min(Duration::from_secs(self.config.max_delay_secs));
      ReconnectDelay::After(delay + self.jitter_for(info.attempt_count))
   }
}

/// What the engine should do for this device on the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
   Idle,
   Wait,
   Connect,
   Stop,
}

struct ActiveLoop {
   started: Instant,
   waiting_since: Instant,
   attempt_count: u32,
   previous_delay: Duration,
   in_flight: bool,
   _wake: WakeLockGuard,
}

/// Summary of a finished loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSummary {
   pub attempts: u32,
   pub elapsed: Duration,
}

pub struct ReconnectManager {
   address: Address,
   policy: Box<dyn ReconnectPolicy>,
   wake_lock: WakeLock,
   active: Option<ActiveLoop>,
}

impl ReconnectManager {
   pub fn new(address: Address, policy: Box<dyn ReconnectPolicy>, wake_lock: WakeLock) -> Self {
      Self {
         address,
         policy,
         wake_lock,
         active: None,
      }
   }

   pub fn set_policy(&mut self, policy: Box<dyn ReconnectPolicy>) {
      self.policy = policy;
   }

   pub const fn is_active(&self) -> bool {
      self.active.is_some()
   }

   pub fn attempt_count(&self) -> u32 {
      self.active.as_ref().map_or(0, |l| l.attempt_count)
   }

   /// Starts the loop. Returns `false` if it was already running.
   pub fn start(&mut self, now: Instant) -> bool {
      if self.active.is_some() {
         return false;
      }
      info!("{}: starting reconnect loop", self.address);
      self.active = Some(ActiveLoop {
         started: now,
         waiting_since: now,
         attempt_count: 0,
         previous_delay: Duration::ZERO,
         in_flight: false,
         _wake: self.wake_lock.acquire(),
      });
      true
   }

   /// Stops the loop and releases its wake lock reference.
   pub fn stop(&mut self, now: Instant) -> Option<LoopSummary> {
      let active = self.active.take()?;
      let summary = LoopSummary {
         attempts: active.attempt_count,
         elapsed: now.saturating_duration_since(active.started),
      };
      info!(
         "{}: reconnect loop stopped after {} attempts",
         self.address, summary.attempts
      );
      Some(summary)
   }

   /// The attempt issued by the loop failed; start waiting for the next one.
   pub fn on_attempt_failed(&mut self, now: Instant) {
      if let Some(active) = self.active.as_mut() {
         active.in_flight = false;
         active.waiting_since = now;
      }
   }

   pub fn tick(&mut self, now: Instant, last_failure: Option<&ConnectionFailInfo>) -> ReconnectAction {
      let Some(active) = self.active.as_mut() else {
         return ReconnectAction::Idle;
      };
      if active.in_flight {
         return ReconnectAction::Wait;
      }

      let info = ReconnectInfo {
         address: self.address,
         attempt_count: active.attempt_count,
         total_elapsed: now.saturating_duration_since(active.started),
         previous_delay: active.previous_delay,
         last_failure,
      };
      match self.policy.delay(&info) {
         ReconnectDelay::Stop => ReconnectAction::Stop,
         ReconnectDelay::After(delay) if now.saturating_duration_since(active.waiting_since) >= delay => {
            active.attempt_count += 1;
            active.previous_delay = delay;
            active.in_flight = true;
            debug!(
               "{}: reconnect attempt {} after {delay:?}",
               self.address, active.attempt_count
            );
            ReconnectAction::Connect
         },
         ReconnectDelay::After(_) => ReconnectAction::Wait,
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use super::*;
   use crate::connection::wake_lock::tests::CountingBackend;

   #[test]
   fn test_default_policy_backoff() {
      let mut policy = DefaultReconnectPolicy::new(ReconnectConfig {
         base_delay_ms: 500,
         max_delay_secs: 2,
         give_up_secs: 30,
         jitter_ms: 0,
      });
      let at = |attempt_count, secs| ReconnectInfo {
         address: Address::any(),
         attempt_count,
         total_elapsed: Duration::from_secs(secs),
         previous_delay: Duration::ZERO,
         last_failure: None,
      };
      assert_eq!(policy.delay(&at(0, 0)), ReconnectDelay::After(Duration::ZERO));
      assert_eq!(policy.delay(&at(1, 1)), ReconnectDelay::After(Duration::from_millis(500)));
      assert_eq!(policy.delay(&at(2, 2)), ReconnectDelay::After(Duration::from_secs(1)));
      assert_eq!(policy.delay(&at(9, 20)), ReconnectDelay::After(Duration::from_secs(2)));
      assert_eq!(policy.delay(&at(10, 30)), ReconnectDelay::Stop);
   }

   #[test]
   fn test_jitter_is_stable_within_an_attempt() {
      let mut policy = DefaultReconnectPolicy::new(ReconnectConfig {
         jitter_ms: 1000,
         ..ReconnectConfig::default()
      });
      let info = ReconnectInfo {
         address: Address::any(),
         attempt_count: 3,
         total_elapsed: Duration::from_secs(1),
         previous_delay: Duration::ZERO,
         last_failure: None,
      };
      let first = policy.delay(&info);
      assert_eq!(policy.delay(&info), first);
   }

   #[test]
   fn test_loop_stops_and_releases_wake_lock() {
      let backend = Arc::new(CountingBackend::default());
      let lock = WakeLock::new(backend.clone());
      let mut mgr = ReconnectManager::new(
         Address::any(),
         Box::new(|info: &ReconnectInfo<'_>| {
            if info.attempt_count >= 2 {
               ReconnectDelay::Stop
            } else {
               ReconnectDelay::After(Duration::from_secs(1))
            }
         }),
         lock.clone(),
      );
      let start = Instant::now();
      assert!(mgr.start(start));
      assert!(!mgr.start(start));
      assert_eq!(lock.count(), 1);

      assert_eq!(mgr.tick(start, None), ReconnectAction::Wait);
      let t1 = start + Duration::from_secs(1);
      assert_eq!(mgr.tick(t1, None), ReconnectAction::Connect);
      assert_eq!(mgr.tick(t1, None), ReconnectAction::Wait);
      mgr.on_attempt_failed(t1);
      let t2 = t1 + Duration::from_secs(1);
      assert_eq!(mgr.tick(t2, None), ReconnectAction::Connect);
      mgr.on_attempt_failed(t2);
      assert_eq!(mgr.tick(t2, None), ReconnectAction::Stop);

      let summary = mgr.stop(t2).unwrap();
      assert_eq!(summary.attempts, 2);
      assert_eq!(lock.count(), 0);
      assert_eq!(mgr.tick(t2, None), ReconnectAction::Idle);
   }
}
