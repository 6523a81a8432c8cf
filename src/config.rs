//! Configuration management for the link layer.
//!
//! This module handles loading and saving the timeouts and sizing knobs of
//! the connection manager from disk.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Main configuration structure for the connection manager.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_ms: u64,

   #[serde(default = "default_disconnect_timeout")]
   pub disconnect_timeout_ms: u64,

   #[serde(default = "default_pairing_timeout")]
   pub pairing_timeout_ms: u64,

   #[serde(default = "default_remote_info_timeout")]
   pub remote_info_timeout_ms: u64,

   /// MTU proposed to the GATT session right after a link comes up.
   #[serde(default = "default_att_mtu")]
   pub att_mtu: u16,

   #[serde(default = "default_inbox_capacity")]
   pub inbox_capacity: usize,
}

const fn default_connect_timeout() -> u64 {
   10_000
}

const fn default_disconnect_timeout() -> u64 {
   10_000
}

const fn default_pairing_timeout() -> u64 {
   30_000
}

const fn default_remote_info_timeout() -> u64 {
   5_000
}

const fn default_att_mtu() -> u16 {
   256
}

const fn default_inbox_capacity() -> usize {
   1000
}

impl Default for Config {
   fn default() -> Self {
      Self {
         connect_timeout_ms: default_connect_timeout(),
         disconnect_timeout_ms: default_disconnect_timeout(),
         pairing_timeout_ms: default_pairing_timeout(),
         remote_info_timeout_ms: default_remote_info_timeout(),
         att_mtu: default_att_mtu(),
         inbox_capacity: default_inbox_capacity(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(Self::config_path()?)
   }

   /// Loads configuration from an explicit path, writing defaults when the
   /// file does not exist yet.
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

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(Self::config_path()?)
   }

   pub fn save_to(&self, config_path: PathBuf) -> Result<()> {
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("HCILINK_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(LinkError::ConfigDirNotFound);
      };

      Ok(config_dir.join("hcilink").join("config.toml"))
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_millis(self.connect_timeout_ms)
   }

   pub const fn disconnect_timeout(&self) -> Duration {
      Duration::from_millis(self.disconnect_timeout_ms)
   }

   pub const fn pairing_timeout(&self) -> Duration {
      Duration::from_millis(self.pairing_timeout_ms)
   }

   pub const fn remote_info_timeout(&self) -> Duration {
      Duration::from_millis(self.remote_info_timeout_ms)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_missing_file_writes_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("nested").join("config.toml");

      let config = Config::load_from(path.clone()).unwrap();
      assert_eq!(config, Config::default());
      assert!(path.exists());
   }

   #[test]
   fn test_partial_file_uses_field_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "pairing_timeout_ms = 1500\natt_mtu = 23\n").unwrap();

      let config = Config::load_from(path).unwrap();
      assert_eq!(config.pairing_timeout(), Duration::from_millis(1500));
      assert_eq!(config.att_mtu, 23);
      assert_eq!(config.connect_timeout_ms, 10_000);
      assert_eq!(config.remote_info_timeout(), Duration::from_secs(5));
   }

   #[test]
   fn test_save_then_load() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      let config = Config {
         connect_timeout_ms: 2500,
         ..Config::default()
      };
      config.save_to(path.clone()).unwrap();

      assert_eq!(Config::load_from(path).unwrap(), config);
   }

   #[test]
   fn test_rejects_garbage() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "att_mtu = \"large\"").unwrap();

      assert!(matches!(Config::load_from(path), Err(LinkError::TomlParse(_))));
   }
}
