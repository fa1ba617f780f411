//! Per-task timeout resolution.

use std::time::Duration;

use crate::config::{Config, DeviceConfig};

use super::TaskKind;

/// A resolved task timeout, fixed when the task is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTimeout {
   After(Duration),
   /// Timeout checking is off for this task.
   Disabled,
   /// The task runs until something ends it.
   Infinite,
}

impl TaskTimeout {
   pub const fn duration(self) -> Option<Duration> {
      match self {
         Self::After(d) => Some(d),
         Self::Disabled | Self::Infinite => None,
      }
   }
}

/// Decides how long a task may execute.
pub trait TimeoutPolicy: Send {
   fn timeout(&self, kind: &TaskKind, device: Option<&DeviceConfig>, config: &Config) -> TaskTimeout;
}

/// Reads timeouts from the configuration: device overrides first, then the
/// per-kind table, then the default. A scan runs for its requested duration.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigTimeouts;

impl TimeoutPolicy for ConfigTimeouts {
   fn timeout(&self, kind: &TaskKind, device: Option<&DeviceConfig>, config: &Config) -> TaskTimeout {
      if let TaskKind::Scan { duration } = kind {
         return duration.map_or(TaskTimeout::Infinite, TaskTimeout::After);
      }
      let task_type = kind.task_type();
      device
         .and_then(|d| d.timeouts.get(task_type.key()))
         .map_or_else(|| config.timeouts.for_kind(task_type), |t| t.resolve())
   }
}

#[cfg(test)]
mod tests {
   use smol_str::SmolStr;
   use uuid::Uuid;

   use super::*;
   use crate::config::{TimeoutKeyword, TimeoutSetting};

   #[test]
   fn test_device_override_wins() {
      let config = Config::default();
      let mut device = DeviceConfig::default();
      device.timeouts.insert(
         SmolStr::new_static("read"),
         TimeoutSetting::Keyword(TimeoutKeyword::Disabled),
      );
      let read = TaskKind::Read {
         characteristic: Uuid::nil(),
      };

      assert_eq!(
         ConfigTimeouts.timeout(&read, Some(&device), &config),
         TaskTimeout::Disabled
      );
      assert_eq!(
         ConfigTimeouts.timeout(&read, None, &config),
         TaskTimeout::After(Duration::from_secs_f64(12.5))
      );
   }

   #[test]
   fn test_scan_uses_its_duration() {
      let config = Config::default();
      assert_eq!(
         ConfigTimeouts.timeout(
            &TaskKind::Scan {
               duration: Some(Duration::from_secs(5))
            },
            None,
            &config
         ),
         TaskTimeout::After(Duration::from_secs(5))
      );
      assert_eq!(
         ConfigTimeouts.timeout(&TaskKind::Scan { duration: None }, None, &config),
         TaskTimeout::Infinite
      );
   }
}
