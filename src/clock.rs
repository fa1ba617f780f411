//! Time sources for the engine.
//!
//! Everything that records timestamps (task timeouts, time-in-state,
//! reconnect backoff) reads the time through a [`Clock`] so that the
//! synchronous core can be driven deterministically in tests.

use std::{
   sync::Arc,
   time::{Duration, Instant},
};

use parking_lot::Mutex;

pub trait Clock: Send + Sync {
   fn now(&self) -> Instant;
}

/// Shared clock handle.
pub type ClockRef = Arc<dyn Clock>;

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
   fn now(&self) -> Instant {
      Instant::now()
   }
}

/// Clock backed by tokio's timer, which honours `tokio::time::pause`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
   fn now(&self) -> Instant {
      tokio::time::Instant::now().into_std()
   }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
   now: Mutex<Instant>,
}

impl ManualClock {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         now: Mutex::new(Instant::now()),
      })
   }

   pub fn advance(&self, by: Duration) {
      *self.now.lock() += by;
   }
}

impl Clock for ManualClock {
   fn now(&self) -> Instant {
      *self.now.lock()
   }
}
