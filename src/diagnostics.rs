//! Warnings about a misbehaving native stack, and contract violations.

use std::{collections::HashMap, time::{Duration, Instant}};

use log::{error, warn};
use serde::Serialize;

use crate::address::Address;

/// Something the native stack did that should not happen.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum UhOhKind {
   /// A connect event arrived for a device nobody asked to connect.
   ConnectedWithoutConnectAttempt,
   /// Service discovery returned the same service more than once.
   DuplicateServices,
   /// Scanning could not be started.
   CannotEnableScan,
   /// The binding refused a request because it lost its native handle.
   DeadBinding,
}

/// Suggested severity of the fix.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum Remedy {
   WaitAndSee,
   ResetEverything,
   RestartHost,
}

impl UhOhKind {
   pub const fn remedy(self) -> Remedy {
      match self {
         Self::ConnectedWithoutConnectAttempt => Remedy::WaitAndSee,
         Self::CannotEnableScan | Self::DeadBinding => Remedy::ResetEverything,
         Self::DuplicateServices => Remedy::RestartHost,
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UhOh {
   pub kind: UhOhKind,
   pub remedy: Remedy,
   pub address: Option<Address>,
}

impl UhOh {
   pub const fn new(kind: UhOhKind, address: Option<Address>) -> Self {
      Self {
         kind,
         remedy: kind.remedy(),
         address,
      }
   }
}

/// Suppresses repeats of the same [`UhOhKind`] for a while.
#[derive(Debug, Default)]
pub struct UhOhThrottle {
   last: HashMap<UhOhKind, Instant>,
}

impl UhOhThrottle {
   /// Returns `Some` if `uhoh` should be reported now.
   pub fn check(&mut self, uhoh: UhOh, now: Instant, window: Duration) -> Option<UhOh> {
      if let Some(&last) = self.last.get(&uhoh.kind)
         && now.saturating_duration_since(last) < window
      {
         return None;
      }
      self.last.insert(uhoh.kind, now);
      match uhoh.address {
         Some(addr) => warn!("{addr}: uh-oh {} (remedy: {})", uhoh.kind, uhoh.remedy),
         None => warn!("uh-oh {} (remedy: {})", uhoh.kind, uhoh.remedy),
      }
      Some(uhoh)
   }
}

/// Logs a broken internal contract. The engine carries on.
pub fn contract_violation(what: &str) {
   error!("contract violation: {what}");
}
