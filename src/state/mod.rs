//! Bitmask state tracking for devices and the manager.
//!
//! A [`StateTracker`] holds a set of simultaneously-active flags drawn from a
//! closed enumeration (see [`flags`]). Every mutation swaps the whole mask in
//! one step, records per-flag enter/exit times, tags the flags it actually
//! toggled with an [`Intent`], and queues a [`StateEvent`] describing the
//! transition. Identical before/after masks produce no event.

use std::{
   fmt,
   hash::Hash,
   marker::PhantomData,
   time::{Duration, Instant},
};

use log::debug;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use strum::{EnumCount, IntoEnumIterator};

use crate::clock::ClockRef;

pub mod flags;

pub use flags::{DeviceState, ManagerState};

/// A flag in a closed state enumeration.
pub trait StateFlag:
   Copy + Eq + Hash + fmt::Debug + fmt::Display + IntoEnumIterator + EnumCount + Send + Sync + 'static
{
   fn index(self) -> usize;

   fn bit(self) -> u32 {
      1 << self.index()
   }
}

/// Whether a transition was requested by the application or happened on its own.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Intent {
   Intentional,
   Unintentional,
}

impl Intent {
   pub const fn from_explicit(explicit: bool) -> Self {
      if explicit { Self::Intentional } else { Self::Unintentional }
   }
}

/// A set of flags of type `F`.
pub struct StateMask<F> {
   bits: u32,
   _flag: PhantomData<fn() -> F>,
}

impl<F> Clone for StateMask<F> {
   fn clone(&self) -> Self {
      *self
   }
}

impl<F> Copy for StateMask<F> {}

impl<F> PartialEq for StateMask<F> {
   fn eq(&self, other: &Self) -> bool {
      self.bits == other.bits
   }
}

impl<F> Eq for StateMask<F> {}

impl<F> Default for StateMask<F> {
   fn default() -> Self {
      Self::from_bits(0)
   }
}

impl<F> StateMask<F> {
   pub const fn from_bits(bits: u32) -> Self {
      Self {
         bits,
         _flag: PhantomData,
      }
   }

   pub const fn bits(self) -> u32 {
      self.bits
   }

   pub const fn is_empty(self) -> bool {
      self.bits == 0
   }
}

impl<F: StateFlag> StateMask<F> {
   pub fn contains(self, flag: F) -> bool {
      self.bits & flag.bit() != 0
   }

   pub fn contains_any(self, flags: &[F]) -> bool {
      flags.iter().any(|&f| self.contains(f))
   }

   #[must_use]
   pub fn with(self, flag: F) -> Self {
      Self::from_bits(self.bits | flag.bit())
   }

   #[must_use]
   pub fn without(self, flag: F) -> Self {
      Self::from_bits(self.bits & !flag.bit())
   }

   pub fn iter(self) -> impl Iterator<Item = F> {
      F::iter().filter(move |&f| self.contains(f))
   }
}

impl<F: StateFlag> FromIterator<F> for StateMask<F> {
   fn from_iter<I: IntoIterator<Item = F>>(iter: I) -> Self {
      Self::from_bits(iter.into_iter().fold(0, |bits, f| bits | f.bit()))
   }
}

impl<F: StateFlag> fmt::Debug for StateMask<F> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_set().entries(self.iter()).finish()
   }
}

impl<F: StateFlag> fmt::Display for StateMask<F> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut first = true;
      f.write_str("[")?;
      for flag in self.iter() {
         if !first {
            f.write_str(", ")?;
         }
         first = false;
         fmt::Display::fmt(&flag, f)?;
      }
      f.write_str("]")
   }
}

/// A single atomic transition of a [`StateTracker`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StateEvent<F> {
   pub old: StateMask<F>,
   pub new: StateMask<F>,
   /// Bit set for each flag that changed in this transition with
   /// [`Intent::Intentional`]. Unchanged flags never carry intent.
   pub intent_mask: u32,
   /// Native status code associated with the transition, or [`NO_STATUS`].
   pub status: i32,
}

/// Status code used when a transition has no native status attached.
pub const NO_STATUS: i32 = -1;

impl<F: StateFlag> StateEvent<F> {
   pub fn changed(&self) -> StateMask<F> {
      StateMask::from_bits(self.old.bits ^ self.new.bits)
   }

   pub fn did_enter(&self, flag: F) -> bool {
      !self.old.contains(flag) && self.new.contains(flag)
   }

   pub fn did_exit(&self, flag: F) -> bool {
      self.old.contains(flag) && !self.new.contains(flag)
   }

   pub fn entered(&self) -> impl Iterator<Item = F> + '_ {
      self.new.iter().filter(|&f| !self.old.contains(f))
   }

   pub fn exited(&self) -> impl Iterator<Item = F> + '_ {
      self.old.iter().filter(|&f| !self.new.contains(f))
   }

   pub fn is(&self, flag: F) -> bool {
      self.new.contains(flag)
   }

   pub fn was(&self, flag: F) -> bool {
      self.old.contains(flag)
   }

   /// Intent of the transition for `flag`, if that flag changed.
   pub fn intent(&self, flag: F) -> Option<Intent> {
      if !self.changed().contains(flag) {
         None
      } else if self.intent_mask & flag.bit() != 0 {
         Some(Intent::Intentional)
      } else {
         Some(Intent::Unintentional)
      }
   }
}

impl<F: StateFlag> fmt::Debug for StateEvent<F> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("StateEvent")
         .field("old", &self.old)
         .field("new", &self.new)
         .field("intent_mask", &format_args!("{:#x}", self.intent_mask))
         .field("status", &self.status)
         .finish()
   }
}

#[derive(Debug, Clone, Copy)]
enum FlagTime {
   /// Flag is on since this instant.
   On(Instant),
   /// Flag is off; how long it was on the last time.
   Off(Duration),
}

/// Bitmask state container with per-flag timing.
pub struct StateTracker<F: StateFlag> {
   name: SmolStr,
   mask: u32,
   times: Vec<FlagTime>,
   clock: ClockRef,
   pending: Vec<StateEvent<F>>,
}

impl<F: StateFlag> fmt::Debug for StateTracker<F> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("StateTracker")
         .field("name", &self.name)
         .field("mask", &self.mask())
         .finish_non_exhaustive()
   }
}

impl<F: StateFlag> StateTracker<F> {
   pub fn new(name: impl Into<SmolStr>, clock: ClockRef) -> Self {
      debug_assert!(F::COUNT <= 32, "state enumerations are limited to 32 flags");
      Self {
         name: name.into(),
         mask: 0,
         times: vec![FlagTime::Off(Duration::ZERO); F::COUNT],
         clock,
         pending: Vec::new(),
      }
   }

   pub fn mask(&self) -> StateMask<F> {
      StateMask::from_bits(self.mask)
   }

   pub fn is(&self, flag: F) -> bool {
      self.mask().contains(flag)
   }

   pub fn is_any(&self, flags: &[F]) -> bool {
      self.mask().contains_any(flags)
   }

   pub fn is_all(&self, flags: &[F]) -> bool {
      flags.iter().all(|&f| self.is(f))
   }

   /// How long `flag` has been on, or how long it was on the last time if it is off.
   pub fn time_in_state(&self, flag: F) -> Duration {
      match self.times[flag.index()] {
         FlagTime::On(since) => self.clock.now().saturating_duration_since(since),
         FlagTime::Off(spent) => spent,
      }
   }

   /// Turns `flag` on. Returns whether the mask changed.
   pub fn append(&mut self, flag: F, intent: Intent, status: i32) -> bool {
      if self.is(flag) {
         debug!("{}: {flag} already on, ignoring append", self.name);
         return false;
      }
      self.apply(self.mask | flag.bit(), intent, status)
   }

   /// Turns `flag` off. Returns whether the mask changed.
   pub fn remove(&mut self, flag: F, intent: Intent, status: i32) -> bool {
      self.apply(self.mask & !flag.bit(), intent, status)
   }

   /// Flips only the listed flags, leaving the others untouched.
   pub fn update(&mut self, intent: Intent, status: i32, changes: &[(F, bool)]) -> bool {
      let bits = changes.iter().fold(self.mask, |bits, &(flag, on)| {
         if on { bits | flag.bit() } else { bits & !flag.bit() }
      });
      self.apply(bits, intent, status)
   }

   /// Replaces the whole mask: listed flags set to `true` are on, everything else is off.
   pub fn set(&mut self, intent: Intent, status: i32, changes: &[(F, bool)]) -> bool {
      let bits = changes
         .iter()
         .filter(|(_, on)| *on)
         .fold(0, |bits, &(flag, _)| bits | flag.bit());
      self.apply(bits, intent, status)
   }

   /// Drains the transitions recorded since the last call.
   pub fn take_events(&mut self) -> Vec<StateEvent<F>> {
      std::mem::take(&mut self.pending)
   }

   fn apply(&mut self, bits: u32, intent: Intent, status: i32) -> bool {
      let old = self.mask;
      if old == bits {
         return false;
      }

      let now = self.clock.now();
      let changed = old ^ bits;
      for flag in F::iter() {
         let bit = flag.bit();
         if changed & bit == 0 {
            continue;
         }
         let slot = &mut self.times[flag.index()];
         *slot = if bits & bit != 0 {
            FlagTime::On(now)
         } else {
            match *slot {
               FlagTime::On(since) => FlagTime::Off(now.saturating_duration_since(since)),
               off @ FlagTime::Off(_) => off,
            }
         };
      }

      self.mask = bits;
      let event = StateEvent {
         old: StateMask::from_bits(old),
         new: StateMask::from_bits(bits),
         intent_mask: match intent {
            Intent::Intentional => changed,
            Intent::Unintentional => 0,
         },
         status,
      };
      debug!(
         "{}: {} -> {} ({intent})",
         self.name,
         event.old,
         event.new
      );
      self.pending.push(event);
      true
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use super::*;
   use crate::clock::ManualClock;

   fn tracker() -> (StateTracker<DeviceState>, Arc<ManualClock>) {
      let clock = ManualClock::new();
      (StateTracker::new("test", clock.clone()), clock)
   }

   #[test]
   fn test_update_only_touches_listed_flags() {
      let (mut t, _) = tracker();
      t.set(
         Intent::Unintentional,
         NO_STATUS,
         &[(DeviceState::Discovered, true), (DeviceState::Disconnected, true)],
      );
      t.update(
         Intent::Intentional,
         NO_STATUS,
         &[(DeviceState::Disconnected, false), (DeviceState::Connecting, true)],
      );
      assert!(t.is(DeviceState::Discovered));
      assert!(t.is(DeviceState::Connecting));
      assert!(!t.is(DeviceState::Disconnected));

      let events = t.take_events();
      assert_eq!(events.len(), 2);
      let ev = &events[1];
      assert!(ev.did_enter(DeviceState::Connecting));
      assert!(ev.did_exit(DeviceState::Disconnected));
      assert_eq!(ev.intent(DeviceState::Connecting), Some(Intent::Intentional));
      // Unchanged flags carry no intent.
      assert_eq!(ev.intent(DeviceState::Discovered), None);
      assert_eq!(
         ev.entered().collect::<Vec<_>>(),
         vec![DeviceState::Connecting]
      );
   }

   #[test]
   fn test_set_replaces_whole_mask() {
      let (mut t, _) = tracker();
      t.update(
         Intent::Unintentional,
         NO_STATUS,
         &[(DeviceState::Connected, true), (DeviceState::Bonded, true)],
      );
      t.set(Intent::Unintentional, NO_STATUS, &[(DeviceState::Discovered, true)]);
      assert_eq!(
         t.mask().iter().collect::<Vec<_>>(),
         vec![DeviceState::Discovered]
      );
   }

   #[test]
   fn test_identical_mask_fires_nothing() {
      let (mut t, _) = tracker();
      assert!(t.append(DeviceState::Connected, Intent::Intentional, NO_STATUS));
      t.take_events();

      assert!(!t.update(Intent::Intentional, NO_STATUS, &[(DeviceState::Connected, true)]));
      assert!(!t.append(DeviceState::Connected, Intent::Intentional, NO_STATUS));
      assert!(!t.remove(DeviceState::Bonded, Intent::Intentional, NO_STATUS));
      assert!(t.take_events().is_empty());
   }

   #[test]
   fn test_time_in_state() {
      let (mut t, clock) = tracker();
      t.append(DeviceState::Connected, Intent::Intentional, NO_STATUS);

      clock.advance(Duration::from_millis(100));
      let first = t.time_in_state(DeviceState::Connected);
      clock.advance(Duration::from_millis(100));
      let second = t.time_in_state(DeviceState::Connected);
      assert_eq!(first, Duration::from_millis(100));
      assert!(second > first);

      t.remove(DeviceState::Connected, Intent::Unintentional, 8);
      clock.advance(Duration::from_secs(5));
      assert_eq!(
         t.time_in_state(DeviceState::Connected),
         Duration::from_millis(200)
      );

      let events = t.take_events();
      assert_eq!(events[1].status, 8);
      assert_eq!(
         events[1].intent(DeviceState::Connected),
         Some(Intent::Unintentional)
      );
   }

   #[test]
   fn test_mask_from_iter() {
      let mask: StateMask<DeviceState> = [DeviceState::Bonded, DeviceState::Connected]
         .into_iter()
         .collect();
      assert!(mask.contains(DeviceState::Bonded));
      assert!(mask.contains_any(&[DeviceState::Bonding, DeviceState::Connected]));
      assert!(!mask.contains(DeviceState::Bonding));
      assert_eq!(mask.without(DeviceState::Bonded).with(DeviceState::Bonding).iter().count(), 2);
   }
}
