//! Configuration management for the board-link manager.
//!
//! This module handles loading and saving configuration from disk: the scan
//! window, the read buffer size and which link strategy the deployment uses.

use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
   bluetooth::establish::LinkStrategy,
   error::{LinkError, Result},
};

/// Main configuration structure.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
   #[serde(default = "default_scan_window")]
   pub scan_window_secs: u64,

   #[serde(default = "default_read_buffer_size")]
   pub read_buffer_size: usize,

   #[serde(default)]
   pub strategy: LinkStrategy,

   #[serde(default)]
   pub bluez: BluezSettings,
}

/// Settings only the BlueZ backend reads.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BluezSettings {
   /// Adapter name such as `hci0`; the default adapter when absent.
   #[serde(default)]
   pub adapter: Option<String>,

   /// RFCOMM channel used by the streaming strategy.
   #[serde(default = "default_rfcomm_channel")]
   pub rfcomm_channel: u8,
}

const fn default_scan_window() -> u64 {
   10
}

const fn default_read_buffer_size() -> usize {
   1024
}

const fn default_rfcomm_channel() -> u8 {
   1
}

impl Default for BluezSettings {
   fn default() -> Self {
      Self {
         adapter: None,
         rfcomm_channel: default_rfcomm_channel(),
      }
   }
}

impl Default for Config {
   fn default() -> Self {
      Self {
         scan_window_secs: default_scan_window(),
         read_buffer_size: default_read_buffer_size(),
         strategy: LinkStrategy::default(),
         bluez: BluezSettings::default(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads from `path`, writing the defaults there first if it is missing.
   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BOARDLINK_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(LinkError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("boardlink").join("config.toml"))
   }

   pub fn scan_window(&self) -> Duration {
      Duration::from_secs(self.scan_window_secs)
   }
}
