//! Configuration management for the accessor.
//!
//! All timeouts and thresholds the accessor uses are collected here with the
//! values the transport expects as defaults. The daemon loads them from a
//! TOML file; library users construct a `Config` directly.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{AccessorError, Result};

/// Main configuration structure for the accessor.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   /// Deadline for a single HCI command.
   #[serde(default = "default_hci_timeout")]
   pub hci_timeout_ms: u64,

   /// Deadline for ordinary daemon method calls.
   #[serde(default = "default_call_timeout")]
   pub call_timeout_ms: u64,

   /// Deadline for a remote SDP query.
   #[serde(default = "default_sdp_query_timeout")]
   pub sdp_query_timeout_ms: u64,

   /// Deadline for creating a device object in the daemon.
   #[serde(default = "default_create_device_timeout")]
   pub create_device_timeout_ms: u64,

   /// How long a found device stays cached.
   #[serde(default = "default_device_expiry")]
   pub device_expiry_ms: u64,

   /// Extra delay added to the expiry alarm.
   #[serde(default = "default_expiry_grace")]
   pub expiry_grace_ms: u64,

   /// Devices reported weaker than this are ignored.
   #[serde(default = "default_min_rssi")]
   pub min_rssi: i16,

   /// How long to wait for the adapter to confirm a discovery change.
   #[serde(default = "default_discovery_wait")]
   pub discovery_wait_ms: u64,

   #[serde(default = "default_l2cap_mtu")]
   pub l2cap_mtu: u16,

   #[serde(default = "default_connect_attempts")]
   pub connect_attempts: u32,

   /// Number of 100 ms polls for a connected link to come up.
   #[serde(default = "default_connect_waits")]
   pub connect_waits: u32,

   #[serde(default)]
   pub inquiry: InquiryConfig,
}

/// Inquiry scan parameters applied to the default adapter.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct InquiryConfig {
   #[serde(default = "default_inquiry_window")]
   pub window_ms: u16,

   #[serde(default = "default_inquiry_interval")]
   pub interval_ms: u16,

   #[serde(default = "default_interlaced")]
   pub interlaced: bool,

   #[serde(default = "default_tx_power")]
   pub tx_power: i8,
}

const fn default_hci_timeout() -> u64 {
   10_000
}

const fn default_call_timeout() -> u64 {
   10_000
}

const fn default_sdp_query_timeout() -> u64 {
   60_000
}

const fn default_create_device_timeout() -> u64 {
   60_000
}

const fn default_device_expiry() -> u64 {
   15_000
}

const fn default_expiry_grace() -> u64 {
   5_000
}

const fn default_min_rssi() -> i16 {
   -80
}

const fn default_discovery_wait() -> u64 {
   10_000
}

const fn default_l2cap_mtu() -> u16 {
   2032
}

const fn default_connect_attempts() -> u32 {
   3
}

const fn default_connect_waits() -> u32 {
   30
}

const fn default_inquiry_window() -> u16 {
   11
}

const fn default_inquiry_interval() -> u16 {
   1280
}

const fn default_interlaced() -> bool {
   true
}

const fn default_tx_power() -> i8 {
   8
}

impl Default for InquiryConfig {
   fn default() -> Self {
      Self {
         window_ms: default_inquiry_window(),
         interval_ms: default_inquiry_interval(),
         interlaced: default_interlaced(),
         tx_power: default_tx_power(),
      }
   }
}

impl Default for Config {
   fn default() -> Self {
      Self {
         hci_timeout_ms: default_hci_timeout(),
         call_timeout_ms: default_call_timeout(),
         sdp_query_timeout_ms: default_sdp_query_timeout(),
         create_device_timeout_ms: default_create_device_timeout(),
         device_expiry_ms: default_device_expiry(),
         expiry_grace_ms: default_expiry_grace(),
         min_rssi: default_min_rssi(),
         discovery_wait_ms: default_discovery_wait(),
         l2cap_mtu: default_l2cap_mtu(),
         connect_attempts: default_connect_attempts(),
         connect_waits: default_connect_waits(),
         inquiry: InquiryConfig::default(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(Self::config_path()?)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(Self::config_path()?)
   }

   pub fn load_from(config_path: PathBuf) -> Result<Self> {
      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(config_path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, config_path: PathBuf) -> Result<()> {
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   pub fn config_path() -> Result<PathBuf> {
      if let Ok(home) = env::var("BTACCESSOR_HOME") {
         return Ok(PathBuf::from(home).join("config.toml"));
      }

      let config_dir = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(config_dir) = dirs::config_dir() {
         config_dir
      } else {
         return Err(AccessorError::ConfigDirNotFound);
      };

      Ok(config_dir.join("btaccessor").join("config.toml"))
   }

   pub const fn hci_timeout(&self) -> Duration {
      Duration::from_millis(self.hci_timeout_ms)
   }

   pub const fn call_timeout(&self) -> Duration {
      Duration::from_millis(self.call_timeout_ms)
   }

   pub const fn sdp_query_timeout(&self) -> Duration {
      Duration::from_millis(self.sdp_query_timeout_ms)
   }

   pub const fn create_device_timeout(&self) -> Duration {
      Duration::from_millis(self.create_device_timeout_ms)
   }

   pub const fn device_expiry(&self) -> Duration {
      Duration::from_millis(self.device_expiry_ms)
   }

   pub const fn expiry_grace(&self) -> Duration {
      Duration::from_millis(self.expiry_grace_ms)
   }

   pub const fn discovery_wait(&self) -> Duration {
      Duration::from_millis(self.discovery_wait_ms)
   }
}
