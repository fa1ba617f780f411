//! Configuration for the engine and the daemon.
//!
//! Loaded from `config.toml` under `$GATTKEEPER_HOME`, `$XDG_CONFIG_HOME` or
//! `$HOME/.config`. Every field has a default so a partial file is fine.

use std::{collections::BTreeMap, env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   address::Address,
   error::{GattError, Result},
   task::{TaskTimeout, TaskType},
};

/// Main configuration structure.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   /// Scheduler tick, in milliseconds.
   #[serde(default = "default_tick_interval")]
   pub tick_interval_ms: u64,

   #[serde(default = "default_retry_count")]
   pub connection_retry_count: u32,

   /// Initial native auto-connect setting for devices that have not learned one.
   #[serde(default)]
   pub use_auto_connect: bool,

   #[serde(default)]
   pub bond_on_connect: bool,

   #[serde(default = "default_true")]
   pub auto_reconnect_after_restart: bool,

   /// Seconds during which an identical "uh-oh" is not reported again.
   #[serde(default = "default_uhoh_throttle")]
   pub uhoh_throttle_secs: f64,

   #[serde(default)]
   pub timeouts: TimeoutConfig,

   #[serde(default)]
   pub reconnect: ReconnectConfig,
}

/// A device the daemon manages from startup.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct KnownDevice {
   pub address: Address,
   #[serde(default)]
   pub name: SmolStr,
   #[serde(default)]
   pub config: DeviceConfig,
}

/// Per-device overrides. Unset fields fall back to [`Config`].
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DeviceConfig {
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub use_auto_connect: Option<bool>,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub bond_on_connect: Option<bool>,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub connection_retry_count: Option<u32>,

   /// Characteristics whose reads, writes and notification toggles need a bond.
   #[serde(default, skip_serializing_if = "Vec::is_empty")]
   pub bonded_characteristics: Vec<uuid::Uuid>,

   #[serde(default)]
   pub requires_authentication: bool,

   #[serde(default)]
   pub requires_initialization: bool,

   #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
   pub timeouts: BTreeMap<SmolStr, TimeoutSetting>,
}

/// A timeout as written in the file: seconds, or `"disabled"` / `"infinite"`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(untagged)]
pub enum TimeoutSetting {
   Secs(f64),
   Keyword(TimeoutKeyword),
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKeyword {
   Disabled,
   Infinite,
}

impl TimeoutSetting {
   pub fn resolve(self) -> TaskTimeout {
      match self {
         Self::Secs(secs) if secs.is_finite() && secs > 0.0 => {
            TaskTimeout::After(Duration::from_secs_f64(secs))
         },
         Self::Secs(_) | Self::Keyword(TimeoutKeyword::Disabled) => TaskTimeout::Disabled,
         Self::Keyword(TimeoutKeyword::Infinite) => TaskTimeout::Infinite,
      }
   }
}

/// Task timeouts, in seconds.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TimeoutConfig {
   #[serde(default = "default_task_timeout")]
   pub default: TimeoutSetting,

   /// Overrides keyed by task kind (`connect`, `read`, `txn_lock`, ...).
   #[serde(default = "default_kind_timeouts")]
   pub kinds: BTreeMap<SmolStr, TimeoutSetting>,
}

impl Default for TimeoutConfig {
   fn default() -> Self {
      Self {
         default: default_task_timeout(),
         kinds: default_kind_timeouts(),
      }
   }
}

impl TimeoutConfig {
   pub fn for_kind(&self, kind: TaskType) -> TaskTimeout {
      self
         .kinds
         .get(kind.key())
         .copied()
         .unwrap_or(self.default)
         .resolve()
   }
}

/// Reconnect backoff parameters.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReconnectConfig {
   #[serde(default = "default_reconnect_base_delay")]
   pub base_delay_ms: u64,

   #[serde(default = "default_reconnect_max_delay")]
   pub max_delay_secs: u64,

   /// Total time after which the loop stops; 0 never gives up.
   #[serde(default = "default_reconnect_give_up")]
   pub give_up_secs: u64,

   #[serde(default = "default_reconnect_jitter")]
   pub jitter_ms: u64,
}

impl Default for ReconnectConfig {
   fn default() -> Self {
      Self {
         base_delay_ms: default_reconnect_base_delay(),
         max_delay_secs: default_reconnect_max_delay(),
         give_up_secs: default_reconnect_give_up(),
         jitter_ms: default_reconnect_jitter(),
      }
   }
}

const fn default_tick_interval() -> u64 {
   50
}

const fn default_retry_count() -> u32 {
   2
}

const fn default_true() -> bool {
   true
}

const fn default_uhoh_throttle() -> f64 {
   60.0
}

const fn default_task_timeout() -> TimeoutSetting {
   TimeoutSetting::Secs(12.5)
}

fn default_kind_timeouts() -> BTreeMap<SmolStr, TimeoutSetting> {
   BTreeMap::from([
      (
         SmolStr::new_static(TaskType::TxnLock.key()),
         TimeoutSetting::Keyword(TimeoutKeyword::Infinite),
      ),
      (SmolStr::new_static(TaskType::Bond.key()), TimeoutSetting::Secs(60.0)),
   ])
}

const fn default_reconnect_base_delay() -> u64 {
   1000
}

const fn default_reconnect_max_delay() -> u64 {
   60
}

const fn default_reconnect_give_up() -> u64 {
   300
}

const fn default_reconnect_jitter() -> u64 {
   1000
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_devices: vec![],
         tick_interval_ms: default_tick_interval(),
         connection_retry_count: default_retry_count(),
         use_auto_connect: false,
         bond_on_connect: false,
         auto_reconnect_after_restart: default_true(),
         uhoh_throttle_secs: default_uhoh_throttle(),
         timeouts: TimeoutConfig::default(),
         reconnect: ReconnectConfig::default(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("GATTKEEPER_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(GattError::ConfigDirNotFound);
      };

      Ok(config_dir.join("gattkeeper").join("config.toml"))
   }

   pub fn tick_interval(&self) -> Duration {
      Duration::from_millis(self.tick_interval_ms.max(1))
   }

   pub fn uhoh_throttle(&self) -> Duration {
      Duration::try_from_secs_f64(self.uhoh_throttle_secs).unwrap_or(Duration::ZERO)
   }

   pub fn known_device(&self, address: Address) -> Option<&KnownDevice> {
      self.known_devices.iter().find(|d| d.address == address)
   }
}
