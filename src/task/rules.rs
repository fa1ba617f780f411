//! Preemption predicates.
//!
//! Each predicate answers a question about `self` given a newly added
//! candidate task. The queue consults them in [`TaskQueue::add`] and when
//! sweeping tasks after an external event.
//!
//! [`TaskQueue::add`]: super::TaskQueue::add

use super::{Priority, Task, TaskKind, TaskState, TaskType};

impl Task {
   fn same_device(&self, other: &Self) -> bool {
      self.owner.device().is_some() && self.owner == other.owner
   }

   /// Whether `self` should run before `other`.
   pub fn is_more_important_than(&self, other: &Self) -> bool {
      let (mine, theirs) = (self.task_type(), other.task_type());

      if mine.is_char_op() && theirs == TaskType::TxnLock && self.same_device(other) {
         return true;
      }
      if matches!(mine, TaskType::Read | TaskType::Write)
         && self.priority <= Priority::Low
         && theirs == TaskType::Scan
      {
         return false;
      }
      self.priority > other.priority
   }

   /// Whether the current `self` should step aside for `other` and be re-queued.
   pub fn is_interruptable_by(&self, other: &Self) -> bool {
      let theirs = other.task_type();
      match self.task_type() {
         TaskType::Scan => {
            other.priority >= Priority::ExplicitBondingAndConnecting
               || (matches!(
                  theirs,
                  TaskType::Read | TaskType::Write | TaskType::ToggleNotify | TaskType::ReadRssi
               ) && other.priority >= Priority::Medium)
         },
         t if t.is_char_op() && self.bond_gated => {
            theirs == TaskType::Bond && self.same_device(other)
         },
         TaskType::TxnLock => theirs.is_char_op() && self.same_device(other),
         _ => false,
      }
   }

   /// Whether `other` makes `self` pointless, so it can end right away.
   pub fn is_cancellable_by(&self, other: &Self) -> bool {
      let turning_off = matches!(other.kind, TaskKind::TurnOff);
      match (&self.kind, &other.kind) {
         (TaskKind::Connect { .. }, TaskKind::Disconnect { explicit: true }) => {
            self.same_device(other)
         },
         (TaskKind::Connect { .. } | TaskKind::Scan { .. }, TaskKind::TurnOff) => true,
         (TaskKind::TurnOn, TaskKind::TurnOff) | (TaskKind::TurnOff, TaskKind::TurnOn) => true,
         (TaskKind::Bond { .. }, TaskKind::Unbond) | (TaskKind::Unbond, TaskKind::Bond { .. }) => {
            self.same_device(other)
         },
         _ => turning_off && self.state == TaskState::Queued && self.owner.device().is_some(),
      }
   }

   /// Whether `self` should finish quietly, its native result discarded,
   /// because of `other`.
   pub fn is_softly_cancellable_by(&self, other: &Self) -> bool {
      let affected = matches!(
         self.kind,
         TaskKind::Read { .. }
            | TaskKind::Write { .. }
            | TaskKind::ToggleNotify { .. }
            | TaskKind::ReadRssi
            | TaskKind::DiscoverServices
            | TaskKind::Bond { explicit: false }
            | TaskKind::TxnLock
      );
      affected
         && self.owner.device().is_some()
         && match other.kind {
            TaskKind::Disconnect { .. } => self.same_device(other),
            TaskKind::TurnOff => true,
            _ => false,
         }
   }
}
