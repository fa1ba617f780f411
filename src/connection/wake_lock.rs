//! Reference-counted host wake lock.
//!
//! Every device in a reconnect loop holds a [`WakeLockGuard`]. The backend is
//! told to acquire when the first guard appears and to release when the last
//! one is dropped.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

/// Keeps the host awake. Implemented per platform.
pub trait WakeLockBackend: Send + Sync {
   fn acquire(&self);
   fn release(&self);
}

/// Backend for hosts that need no wake lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWakeLock;

impl WakeLockBackend for NoWakeLock {
   fn acquire(&self) {}

   fn release(&self) {}
}

struct Inner {
   count: Mutex<usize>,
   backend: Box<dyn WakeLockBackend>,
}

#[derive(Clone)]
pub struct WakeLock {
   inner: Arc<Inner>,
}

impl Default for WakeLock {
   fn default() -> Self {
      Self::new(NoWakeLock)
   }
}

impl WakeLock {
   pub fn new(backend: impl WakeLockBackend + 'static) -> Self {
      Self {
         inner: Arc::new(Inner {
            count: Mutex::new(0),
            backend: Box::new(backend),
         }),
      }
   }

   pub fn acquire(&self) -> WakeLockGuard {
      let mut count = self.inner.count.lock();
      if *count == 0 {
         debug!("acquiring wake lock");
         self.inner.backend.acquire();
      }
      *count += 1;
      WakeLockGuard {
         inner: self.inner.clone(),
      }
   }

   pub fn count(&self) -> usize {
      *self.inner.count.lock()
   }
}

/// Holds one reference on a [`WakeLock`].
#[must_use = "the wake lock is released when the guard is dropped"]
pub struct WakeLockGuard {
   inner: Arc<Inner>,
}

impl Drop for WakeLockGuard {
   fn drop(&mut self) {
      let mut count = self.inner.count.lock();
      *count = count.saturating_sub(1);
      if *count == 0 {
         debug!("releasing wake lock");
         self.inner.backend.release();
      }
   }
}

#[cfg(test)]
pub(crate) mod tests {
   use std::sync::atomic::{AtomicUsize, Ordering};

   use super::*;

   /// Counts backend calls.
   #[derive(Default)]
   pub struct CountingBackend {
      pub acquired: AtomicUsize,
      pub released: AtomicUsize,
   }

   impl WakeLockBackend for Arc<CountingBackend> {
      fn acquire(&self) {
         self.acquired.fetch_add(1, Ordering::SeqCst);
      }

      fn release(&self) {
         self.released.fetch_add(1, Ordering::SeqCst);
      }
   }

   #[test]
   fn test_backend_sees_first_acquire_and_last_release() {
      let backend = Arc::new(CountingBackend::default());
      let lock = WakeLock::new(backend.clone());

      let a = lock.acquire();
      let b = lock.acquire();
      assert_eq!(lock.count(), 2);
      assert_eq!(backend.acquired.load(Ordering::SeqCst), 1);

      drop(a);
      assert_eq!(backend.released.load(Ordering::SeqCst), 0);
      drop(b);
      assert_eq!(lock.count(), 0);
      assert_eq!(backend.released.load(Ordering::SeqCst), 1);
   }
}
