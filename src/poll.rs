//! Periodic characteristic reads and notification tracking.
//!
//! A poll re-reads a characteristic every interval. A notification watch
//! keeps notifications enabled across reconnects and, when a force-read
//! interval is given, reads the characteristic if no notification arrived
//! in that long.

use std::time::{Duration, Instant};

use log::debug;
use uuid::Uuid;

use crate::task::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotifyState {
   Off,
   Enabling,
   On,
}

#[derive(Debug)]
struct PollEntry {
   characteristic: Uuid,
   /// Read interval; `None` for a pure notification watch.
   interval: Option<Duration>,
   change_only: bool,
   wants_notify: bool,
   notify: NotifyState,
   last_read: Option<Instant>,
   last_notification: Option<Instant>,
   last_value: Option<Value>,
}

impl PollEntry {
   fn new(characteristic: Uuid) -> Self {
      Self {
         characteristic,
         interval: None,
         change_only: false,
         wants_notify: false,
         notify: NotifyState::Off,
         last_read: None,
         last_notification: None,
         last_value: None,
      }
   }

   fn is_due(&self, now: Instant) -> bool {
      let Some(interval) = self.interval else {
         return false;
      };
      let quiet_since = match (self.notify, self.last_notification, self.last_read) {
         (NotifyState::On, Some(n), Some(r)) => Some(n.max(r)),
         (NotifyState::On, Some(n), None) => Some(n),
         (_, _, r) => r,
      };
      quiet_since.is_none_or(|t| now.saturating_duration_since(t) >= interval)
   }
}

#[derive(Debug, Default)]
pub struct PollManager {
   entries: Vec<PollEntry>,
}

impl PollManager {
   fn entry(&mut self, characteristic: Uuid) -> &mut PollEntry {
      let idx = match self
         .entries
         .iter()
         .position(|e| e.characteristic == characteristic)
      {
         Some(idx) => idx,
         None => {
            self.entries.push(PollEntry::new(characteristic));
            self.entries.len() - 1
         },
      };
      &mut self.entries[idx]
   }

   /// Reads `characteristic` every `interval`. With `change_only`, only
   /// changed values are reported.
   pub fn start_poll(&mut self, characteristic: Uuid, interval: Duration, change_only: bool) {
      let entry = self.entry(characteristic);
      entry.interval = Some(interval);
      entry.change_only = change_only;
   }

   /// Keeps notifications on for `characteristic`.
   pub fn watch_notify(&mut self, characteristic: Uuid, force_read_after: Option<Duration>) {
      let entry = self.entry(characteristic);
      entry.wants_notify = true;
      entry.change_only = true;
      if force_read_after.is_some() {
         entry.interval = force_read_after;
      }
   }

   /// Stops polling and watching. Returns whether notifications were on.
   pub fn stop(&mut self, characteristic: Uuid) -> bool {
      let Some(idx) = self
         .entries
         .iter()
         .position(|e| e.characteristic == characteristic)
      else {
         return false;
      };
      let entry = self.entries.remove(idx);
      entry.notify != NotifyState::Off
   }

   pub fn is_tracked(&self, characteristic: Uuid) -> bool {
      self.entries.iter().any(|e| e.characteristic == characteristic)
   }

   /// Characteristics whose read is due. Marks them as read.
   pub fn due(&mut self, now: Instant) -> Vec<Uuid> {
      self
         .entries
         .iter_mut()
         .filter(|e| e.is_due(now))
         .map(|e| {
            e.last_read = Some(now);
            e.characteristic
         })
         .collect()
   }

   /// Watched characteristics whose notifications need to be turned on.
   pub fn notify_to_enable(&mut self) -> Vec<Uuid> {
      self
         .entries
         .iter_mut()
         .filter(|e| e.wants_notify && e.notify == NotifyState::Off)
         .map(|e| {
            e.notify = NotifyState::Enabling;
            e.characteristic
         })
         .collect()
   }

   pub fn on_notify_toggled(&mut self, characteristic: Uuid, enabled: bool) {
      if let Some(entry) = self
         .entries
         .iter_mut()
         .find(|e| e.characteristic == characteristic)
      {
         entry.notify = if enabled { NotifyState::On } else { NotifyState::Off };
      }
   }

   /// A toggle attempt ended without success.
   pub fn on_notify_failed(&mut self, characteristic: Uuid) {
      if let Some(entry) = self
         .entries
         .iter_mut()
         .find(|e| e.characteristic == characteristic && e.notify == NotifyState::Enabling)
      {
         entry.notify = NotifyState::Off;
      }
   }

   pub fn on_notification(&mut self, characteristic: Uuid, now: Instant) {
      if let Some(entry) = self
         .entries
         .iter_mut()
         .find(|e| e.characteristic == characteristic)
      {
         entry.last_notification = Some(now);
      }
   }

   /// Records a read result. Returns the value if it should be reported.
   pub fn on_read(&mut self, characteristic: Uuid, value: &Value) -> Option<Value> {
      let entry = self
         .entries
         .iter_mut()
         .find(|e| e.characteristic == characteristic)?;
      if entry.change_only && entry.last_value.as_ref() == Some(value) {
         debug!("{characteristic}: polled value unchanged");
         return None;
      }
      entry.last_value = Some(value.clone());
      Some(value.clone())
   }

   /// The link went down; notifications have to be enabled again.
   pub fn on_disconnect(&mut self) {
      for entry in &mut self.entries {
         entry.notify = NotifyState::Off;
         entry.last_notification = None;
      }
   }
}

#[cfg(test)]
mod tests {
   use smallvec::smallvec;

   use super::*;

   const CHAR: Uuid = Uuid::from_u128(0x2a19);

   #[test]
   fn test_poll_interval() {
      let mut poll = PollManager::default();
      let start = Instant::now();
      poll.start_poll(CHAR, Duration::from_secs(10), false);

      assert_eq!(poll.due(start), vec![CHAR]);
      assert!(poll.due(start + Duration::from_secs(9)).is_empty());
      assert_eq!(poll.due(start + Duration::from_secs(10)), vec![CHAR]);
   }

   #[test]
   fn test_change_only_suppresses_repeats() {
      let mut poll = PollManager::default();
      poll.start_poll(CHAR, Duration::from_secs(1), true);
      let v: Value = smallvec![1, 2];
      assert!(poll.on_read(CHAR, &v).is_some());
      assert!(poll.on_read(CHAR, &v).is_none());
      assert!(poll.on_read(CHAR, &smallvec![3]).is_some());
      assert!(poll.on_read(Uuid::nil(), &v).is_none());
   }

   #[test]
   fn test_notifications_defer_forced_reads() {
      let mut poll = PollManager::default();
      let start = Instant::now();
      poll.watch_notify(CHAR, Some(Duration::from_secs(30)));
      assert_eq!(poll.notify_to_enable(), vec![CHAR]);
      assert!(poll.notify_to_enable().is_empty());
      poll.on_notify_toggled(CHAR, true);

      assert_eq!(poll.due(start), vec![CHAR]);
      poll.on_notification(CHAR, start + Duration::from_secs(20));
      assert!(poll.due(start + Duration::from_secs(40)).is_empty());
      assert_eq!(poll.due(start + Duration::from_secs(50)), vec![CHAR]);

      poll.on_disconnect();
      assert_eq!(poll.notify_to_enable(), vec![CHAR]);
   }
}
