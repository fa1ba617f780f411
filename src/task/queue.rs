//! The task scheduler.
//!
//! One queue serializes every radio operation of a manager and all of its
//! devices. At most one task is current (armed or executing) at any time,
//! which also makes it the only executing task for its kind and owner. The
//! queue never reads the time on its own initiative; [`TaskQueue::update`] is
//! called once per engine tick and advances the current task by exactly one
//! step.

use std::collections::VecDeque;

use log::{debug, warn};
use smol_str::{SmolStr, format_smolstr};

use crate::clock::ClockRef;

use super::{Owner, Task, TaskId, TaskState, TaskTimeout, TaskType};

/// What happened when a task's native call was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteResult {
   /// The call is in flight; a native event will end the task.
   Started,
   /// The goal is already met.
   Redundant,
   /// The task cannot proceed and should not be retried.
   NoOp,
   /// The binding rejected the call outright, with a native status.
   FailedImmediately(i32),
}

/// Issues native calls for the queue. Implemented by the engine core.
pub trait TaskExecutor {
   fn owner_exists(&self, owner: Owner) -> bool;
   fn resolve_timeout(&self, task: &Task) -> TaskTimeout;
   fn execute(&mut self, task: &Task) -> ExecuteResult;
}

pub struct TaskQueue {
   clock: ClockRef,
   next_id: u64,
   tick: u64,
   current: Option<Task>,
   queue: VecDeque<Task>,
   finished: Vec<Task>,
   violations: Vec<SmolStr>,
}

impl TaskQueue {
   pub fn new(clock: ClockRef) -> Self {
      Self {
         clock,
         next_id: 0,
         tick: 0,
         current: None,
         queue: VecDeque::new(),
         finished: Vec::new(),
         violations: Vec::new(),
      }
   }

   fn next_id(&mut self) -> TaskId {
      self.next_id += 1;
      TaskId(self.next_id)
   }

   /// Enqueues `task` and applies the preemption rules against everything
   /// already queued or current.
   pub fn add(&mut self, mut task: Task) -> TaskId {
      let now = self.clock.now();
      let id = self.next_id();
      task.enqueue(id, now);
      debug!(
         "{}: queued {} {id} at {}",
         task.owner,
         task.task_type(),
         task.priority
      );

      self.sweep_queued(
         |queued| queued.is_cancellable_by(&task) || queued.is_softly_cancellable_by(&task),
         TaskState::SoftlyCancelled,
      );

      let mut cancel = false;
      let mut interrupt = false;
      if let Some(current) = self.current.as_mut() {
         let soft = current.is_softly_cancellable_by(&task);
         if current.is_cancellable_by(&task) || (soft && current.state != TaskState::Executing) {
            cancel = true;
         } else if soft {
            current.mark_softly_cancelled();
         } else if current.is_interruptable_by(&task) {
            interrupt = true;
         }
      }

      if cancel {
         self.end_current(TaskState::SoftlyCancelled);
      }
      if interrupt {
         self.queue.push_front(task);
         self.interrupt_current();
      } else {
         let pos = self
            .queue
            .iter()
            .position(|queued| task.is_more_important_than(queued))
            .unwrap_or(self.queue.len());
         self.queue.insert(pos, task);
      }
      id
   }

   /// Advances the scheduler by one tick.
   pub fn update(&mut self, exec: &mut dyn TaskExecutor) {
      self.tick += 1;
      let now = self.clock.now();

      let mut i = 0;
      while i < self.queue.len() {
         if exec.owner_exists(self.queue[i].owner) {
            i += 1;
         } else if let Some(task) = self.queue.remove(i) {
            warn!("{}: owner gone, dropping {}", task.owner, task.task_type());
            self.retire(task, TaskState::FailedImmediately);
         }
      }

      let Some(current) = self.current.as_mut() else {
         self.arm_next(exec);
         return;
      };

      if !exec.owner_exists(current.owner) {
         self.end_current(TaskState::FailedImmediately);
         return;
      }

      let ended = match current.state {
         TaskState::Armed if self.tick > current.armed_tick => {
            current.begin_executing(now);
            match exec.execute(current) {
               ExecuteResult::Started => None,
               ExecuteResult::Redundant => Some(TaskState::Redundant),
               ExecuteResult::NoOp => Some(TaskState::NoOp),
               ExecuteResult::FailedImmediately(status) => {
                  current.set_native_status(status);
                  Some(TaskState::FailedImmediately)
               },
            }
         },
         TaskState::Executing => current
            .timeout
            .duration()
            .filter(|&limit| current.time_against_timeout(now) >= limit)
            .map(|_| {
               // A bounded scan ends by running out its duration.
               if current.task_type() == TaskType::Scan {
                  TaskState::Succeeded
               } else {
                  TaskState::TimedOut
               }
            }),
         _ => None,
      };

      if let Some(state) = ended {
         self.end_current(state);
      }
   }

   fn arm_next(&mut self, exec: &mut dyn TaskExecutor) {
      let Some(mut task) = self.queue.pop_front() else {
         return;
      };
      let timeout = exec.resolve_timeout(&task);
      task.arm(timeout, self.tick, self.clock.now());
      debug!("{}: armed {} {} ({timeout:?})", task.owner, task.task_type(), task.id);
      self.current = Some(task);
   }

   fn retire(&mut self, mut task: Task, state: TaskState) {
      if !task.finish(state, self.clock.now()) {
         self.violations.push(format_smolstr!(
            "task {} ({}) ended twice",
            task.id,
            task.task_type()
         ));
      }
      self.finished.push(task);
   }

   fn end_current(&mut self, state: TaskState) -> bool {
      match self.current.take() {
         Some(task) => {
            self.retire(task, state);
            true
         },
         None => false,
      }
   }

   /// Ends the current task as interrupted and puts a fresh copy back in
   /// front of its peers.
   fn interrupt_current(&mut self) -> bool {
      let Some(mut task) = self.current.take() else {
         return false;
      };
      let mut fresh = task.respawn();
      self.retire(task, TaskState::Interrupted);

      let id = self.next_id();
      fresh.enqueue(id, self.clock.now());
      let pos = self
         .queue
         .iter()
         .position(|queued| !queued.is_more_important_than(&fresh))
         .unwrap_or(self.queue.len());
      debug!("{}: re-queued {} as {id}", fresh.owner, fresh.task_type());
      self.queue.insert(pos, fresh);
      true
   }

   fn sweep_queued(&mut self, mut pred: impl FnMut(&Task) -> bool, state: TaskState) -> usize {
      let mut removed = 0;
      let mut i = 0;
      while i < self.queue.len() {
         if !pred(&self.queue[i]) {
            i += 1;
         } else if let Some(task) = self.queue.remove(i) {
            self.retire(task, state);
            removed += 1;
         }
      }
      removed
   }

   /// The armed or executing task for `kind` and `owner`.
   pub fn get_current(&self, kind: TaskType, owner: Owner) -> Option<&Task> {
      self.current.as_ref().filter(|t| t.matches(kind, owner))
   }

   pub fn get_current_mut(&mut self, kind: TaskType, owner: Owner) -> Option<&mut Task> {
      self.current.as_mut().filter(|t| t.matches(kind, owner))
   }

   pub fn is_current(&self, kind: TaskType, owner: Owner) -> bool {
      self.get_current(kind, owner).is_some()
   }

   pub fn current(&self) -> Option<&Task> {
      self.current.as_ref()
   }

   /// Ends the current task for `kind` and `owner` as `state`. Returns `false`
   /// when there is no such task, i.e. the native event was spontaneous.
   pub fn end(&mut self, kind: TaskType, owner: Owner, state: TaskState) -> bool {
      if self.is_current(kind, owner) {
         self.end_current(state)
      } else {
         false
      }
   }

   pub fn succeed(&mut self, kind: TaskType, owner: Owner) -> bool {
      self.end(kind, owner, TaskState::Succeeded)
   }

   pub fn fail(&mut self, kind: TaskType, owner: Owner) -> bool {
      self.end(kind, owner, TaskState::Failed)
   }

   /// Restarts the timeout of the current task, e.g. when a scan actually starts.
   pub fn reset_timeout(&mut self, kind: TaskType, owner: Owner) -> bool {
      let now = self.clock.now();
      match self.get_current_mut(kind, owner) {
         Some(task) => {
            task.reset_timeout(now);
            true
         },
         None => false,
      }
   }

   /// Drops every queued (not yet current) task for `kind` and `owner`.
   pub fn clear_queue_of(&mut self, kind: TaskType, owner: Owner) -> usize {
      self.sweep_queued(|t| t.matches(kind, owner), TaskState::SoftlyCancelled)
   }

   /// Re-queues the current task for `kind` and `owner`.
   pub fn interrupt(&mut self, kind: TaskType, owner: Owner) -> bool {
      self.is_current(kind, owner) && self.interrupt_current()
   }

   /// Ends every task that `representative` would cancel or softly cancel,
   /// including the current one. Used when an external event already did
   /// what `representative` describes, so no native callback will arrive.
   pub fn softly_cancel_tasks(&mut self, representative: &Task) -> usize {
      let mut count = self.sweep_queued(
         |t| t.is_cancellable_by(representative) || t.is_softly_cancellable_by(representative),
         TaskState::SoftlyCancelled,
      );
      let current_hit = self.current.as_ref().is_some_and(|t| {
         t.is_cancellable_by(representative) || t.is_softly_cancellable_by(representative)
      });
      if current_hit && self.end_current(TaskState::SoftlyCancelled) {
         count += 1;
      }
      count
   }

   /// Whether a task for `kind` and `owner` is queued or current.
   pub fn is_pending(&self, kind: TaskType, owner: Owner) -> bool {
      self.is_current(kind, owner) || self.queue.iter().any(|t| t.matches(kind, owner))
   }

   pub fn queued(&self) -> impl Iterator<Item = &Task> {
      self.queue.iter()
   }

   pub fn len(&self) -> usize {
      self.queue.len() + usize::from(self.current.is_some())
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   /// Tasks that reached a terminal state since the last call, in order.
   pub fn take_finished(&mut self) -> Vec<Task> {
      std::mem::take(&mut self.finished)
   }

   pub fn take_violations(&mut self) -> Vec<SmolStr> {
      std::mem::take(&mut self.violations)
   }
}

#[cfg(test)]
mod tests {
   use std::{collections::HashMap, sync::Arc, time::Duration};

   use tokio::sync::oneshot;
   use uuid::Uuid;

   use super::*;
   use crate::{
      address::Address,
      clock::ManualClock,
      task::{Priority, TaskKind},
   };

   const TIMEOUT: Duration = Duration::from_millis(12_500);

   #[derive(Default)]
   struct Exec {
      gone: Vec<Owner>,
      results: HashMap<TaskType, ExecuteResult>,
      executed: Vec<(TaskType, Owner)>,
   }

   impl TaskExecutor for Exec {
      fn owner_exists(&self, owner: Owner) -> bool {
         !self.gone.contains(&owner)
      }

      fn resolve_timeout(&self, task: &Task) -> TaskTimeout {
         match task.kind() {
            TaskKind::Scan { duration } => duration.map_or(TaskTimeout::Infinite, TaskTimeout::After),
            TaskKind::TxnLock => TaskTimeout::Infinite,
            _ => TaskTimeout::After(TIMEOUT),
         }
      }

      fn execute(&mut self, task: &Task) -> ExecuteResult {
         self.executed.push((task.task_type(), task.owner()));
         self
            .results
            .get(&task.task_type())
            .copied()
            .unwrap_or(ExecuteResult::Started)
      }
   }

   fn dev(n: u8) -> Owner {
      Owner::Device(Address::new([0, 0, 0, 0, 0, n]))
   }

   fn read(owner: Owner) -> Task {
      Task::new(
         TaskKind::Read {
            characteristic: Uuid::nil(),
         },
         owner,
      )
   }

   fn setup() -> (TaskQueue, Arc<ManualClock>, Exec) {
      let clock = ManualClock::new();
      (TaskQueue::new(clock.clone()), clock, Exec::default())
   }

   fn states(q: &mut TaskQueue) -> Vec<(TaskType, TaskState)> {
      q.take_finished()
         .iter()
         .map(|t| (t.task_type(), t.state()))
         .collect()
   }

   #[test]
   fn test_arm_then_execute_one_tick_later() {
      let (mut q, _, mut exec) = setup();
      q.add(read(dev(1)));

      q.update(&mut exec);
      assert_eq!(q.current().unwrap().state(), TaskState::Armed);
      assert!(exec.executed.is_empty());

      q.update(&mut exec);
      assert_eq!(q.current().unwrap().state(), TaskState::Executing);
      assert_eq!(exec.executed, vec![(TaskType::Read, dev(1))]);

      assert!(q.succeed(TaskType::Read, dev(1)));
      assert!(!q.succeed(TaskType::Read, dev(1)));
      assert_eq!(states(&mut q), vec![(TaskType::Read, TaskState::Succeeded)]);
   }

   #[test]
   fn test_priority_order_with_fifo_ties() {
      let (mut q, _, _) = setup();
      let a = q.add(read(dev(1)));
      let b = q.add(read(dev(2)));
      let c = q.add(Task::new(TaskKind::Connect { explicit: true }, dev(3)));
      let d = q.add(read(dev(1)).with_priority(Priority::Low));
      let order: Vec<_> = q.queued().map(Task::id).collect();
      assert_eq!(order, vec![c, a, b, d]);
   }

   #[test]
   fn test_execution_timeout() {
      let (mut q, clock, mut exec) = setup();
      q.add(read(dev(1)));
      q.update(&mut exec);
      q.update(&mut exec);

      clock.advance(TIMEOUT - Duration::from_millis(1));
      q.update(&mut exec);
      assert!(q.take_finished().is_empty());

      clock.advance(Duration::from_millis(1));
      q.update(&mut exec);
      assert_eq!(states(&mut q), vec![(TaskType::Read, TaskState::TimedOut)]);
      assert!(q.is_empty());
   }

   #[test]
   fn test_scan_duration_ends_successfully_and_reset_extends_it() {
      let (mut q, clock, mut exec) = setup();
      q.add(Task::new(
         TaskKind::Scan {
            duration: Some(Duration::from_secs(5)),
         },
         Owner::Manager,
      ));
      q.update(&mut exec);
      q.update(&mut exec);

      clock.advance(Duration::from_secs(4));
      assert!(q.reset_timeout(TaskType::Scan, Owner::Manager));
      clock.advance(Duration::from_secs(4));
      q.update(&mut exec);
      assert!(q.take_finished().is_empty());

      clock.advance(Duration::from_secs(1));
      q.update(&mut exec);
      assert_eq!(states(&mut q), vec![(TaskType::Scan, TaskState::Succeeded)]);
   }

   #[test]
   fn test_immediate_results() {
      let (mut q, _, mut exec) = setup();
      exec.results.insert(TaskType::Connect, ExecuteResult::Redundant);
      exec.results.insert(TaskType::Read, ExecuteResult::FailedImmediately(133));
      q.add(Task::new(TaskKind::Connect { explicit: true }, dev(1)));
      q.add(read(dev(1)));
      for _ in 0..4 {
         q.update(&mut exec);
      }
      let finished = q.take_finished();
      assert_eq!(finished[0].state(), TaskState::Redundant);
      assert_eq!(finished[1].state(), TaskState::FailedImmediately);
      assert_eq!(finished[1].native_status(), 133);
   }

   #[test]
   fn test_explicit_disconnect_cancels_connect() {
      let (mut q, _, mut exec) = setup();
      q.add(Task::new(TaskKind::Connect { explicit: true }, dev(1)));
      q.update(&mut exec);
      q.update(&mut exec);
      q.add(Task::new(TaskKind::Disconnect { explicit: true }, dev(1)));

      assert_eq!(states(&mut q), vec![(TaskType::Connect, TaskState::SoftlyCancelled)]);
      q.update(&mut exec);
      assert!(q.is_current(TaskType::Disconnect, dev(1)));
   }

   #[test]
   fn test_soft_cancel_of_executing_read() {
      let (mut q, _, mut exec) = setup();
      q.add(read(dev(1)));
      q.add(read(dev(1)));
      q.update(&mut exec);
      q.update(&mut exec);

      q.add(Task::new(TaskKind::Disconnect { explicit: true }, dev(1)));
      // The queued read goes right away, the executing one waits for its callback.
      assert_eq!(states(&mut q), vec![(TaskType::Read, TaskState::SoftlyCancelled)]);
      assert!(q.get_current(TaskType::Read, dev(1)).unwrap().is_softly_cancelled());

      assert!(q.succeed(TaskType::Read, dev(1)));
      assert_eq!(states(&mut q), vec![(TaskType::Read, TaskState::SoftlyCancelled)]);
   }

   #[test]
   fn test_interrupted_scan_is_requeued_with_its_completion() {
      let (mut q, _, mut exec) = setup();
      let (tx, mut rx) = oneshot::channel();
      let scan_id = q.add(Task::new(TaskKind::Scan { duration: None }, Owner::Manager).with_completion(tx));
      q.update(&mut exec);
      q.update(&mut exec);

      q.add(read(dev(1)).with_priority(Priority::Low));
      assert!(q.take_finished().is_empty(), "low reads do not interrupt scans");

      let read_id = q.add(read(dev(2)));
      let finished = q.take_finished();
      assert_eq!(finished.len(), 1);
      assert_eq!(finished[0].id(), scan_id);
      assert_eq!(finished[0].state(), TaskState::Interrupted);

      // The copy goes back ahead of the low read, which never outranks a scan.
      let order: Vec<_> = q.queued().map(|t| (t.id(), t.task_type())).collect();
      assert_eq!(order[0], (read_id, TaskType::Read));
      assert_eq!(order[1].1, TaskType::Scan);
      assert_eq!(order[2].1, TaskType::Read);
      assert!(order[1].0 > read_id);

      // The completion travels with the re-queued copy.
      assert!(rx.try_recv().is_err());
      for _ in 0..6 {
         q.update(&mut exec);
         q.succeed(TaskType::Read, dev(1));
         q.succeed(TaskType::Read, dev(2));
      }
      q.succeed(TaskType::Scan, Owner::Manager);
      for mut task in q.take_finished() {
         task.complete();
      }
      assert_eq!(rx.try_recv().unwrap().state, TaskState::Succeeded);
   }

   #[test]
   fn test_transaction_lock_yields_to_own_reads() {
      let (mut q, _, mut exec) = setup();
      q.add(read(dev(2)));
      q.add(Task::new(TaskKind::TxnLock, dev(1)));
      q.update(&mut exec);
      q.update(&mut exec);
      q.succeed(TaskType::Read, dev(2));
      q.update(&mut exec);
      q.update(&mut exec);
      assert!(q.is_current(TaskType::TxnLock, dev(1)));

      q.add(read(dev(3)));
      q.add(read(dev(1)));
      assert_eq!(states(&mut q), vec![(TaskType::TxnLock, TaskState::Interrupted)]);
      let order: Vec<_> = q.queued().map(|t| (t.task_type(), t.owner())).collect();
      assert_eq!(
         order,
         vec![
            (TaskType::Read, dev(1)),
            (TaskType::TxnLock, dev(1)),
            (TaskType::Read, dev(3)),
         ]
      );
   }

   #[test]
   fn test_owner_gone_fails_immediately() {
      let (mut q, _, mut exec) = setup();
      q.add(read(dev(1)));
      q.add(read(dev(2)));
      q.update(&mut exec);
      exec.gone = vec![dev(1), dev(2)];
      q.update(&mut exec);
      let finished = states(&mut q);
      assert_eq!(
         finished,
         vec![
            (TaskType::Read, TaskState::FailedImmediately),
            (TaskType::Read, TaskState::FailedImmediately),
         ]
      );
      assert!(q.is_empty());
   }

   #[test]
   fn test_clear_queue_of_and_sweep() {
      let (mut q, _, mut exec) = setup();
      q.add(Task::new(TaskKind::Connect { explicit: false }, dev(1)));
      q.add(read(dev(2)));
      q.add(Task::new(TaskKind::Connect { explicit: false }, dev(1)));
      q.update(&mut exec);
      assert_eq!(q.clear_queue_of(TaskType::Connect, dev(1)), 1);
      assert!(q.is_current(TaskType::Connect, dev(1)));

      let off = Task::new(TaskKind::TurnOff, Owner::Manager);
      assert_eq!(q.softly_cancel_tasks(&off), 2);
      assert!(q.is_empty());
   }

   #[test]
   fn test_single_flight_under_churn() {
      let (mut q, clock, mut exec) = setup();
      let owners = [dev(1), dev(2), dev(3)];
      for round in 0..200u32 {
         let owner = owners[(round % 3) as usize];
         match round % 7 {
            0 => {
               q.add(Task::new(TaskKind::Connect { explicit: round % 2 == 0 }, owner));
            },
            1 | 4 => {
               q.add(read(owner));
            },
            2 => {
               q.add(Task::new(TaskKind::Disconnect { explicit: true }, owner));
            },
            3 => {
               q.add(Task::new(TaskKind::Scan { duration: None }, Owner::Manager));
            },
            _ => {
               if let Some(current) = q.current() {
                  let (kind, owner) = (current.task_type(), current.owner());
                  q.succeed(kind, owner);
               }
            },
         }
         clock.advance(Duration::from_secs(1));
         q.update(&mut exec);

         let executing = q
            .current()
            .into_iter()
            .chain(q.queued())
            .filter(|t| t.state() == TaskState::Executing)
            .count();
         assert!(executing <= 1);
         for task in q.take_finished() {
            assert!(task.state().is_terminal());
         }
         assert!(q.take_violations().is_empty());
      }
   }
}
