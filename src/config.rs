//! Configuration management for the coordination service.
//!
//! This module handles loading and saving configuration from disk,
//! including backend selection and start-up discovery parameters.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoordError, Result};

/// Which adapter host implementation to run against.
#[derive(
   Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Backend {
   /// Use BlueZ when reachable, otherwise the fallback host.
   #[default]
   Auto,
   /// Ask for BlueZ explicitly.
   Bluez,
   /// Never touch the radio stack.
   Fallback,
}

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default)]
   pub backend: Backend,

   #[serde(default = "default_adapter_poll_interval")]
   pub adapter_poll_interval: u64,

   #[serde(default)]
   pub discover_on_start: bool,

   #[serde(default)]
   pub le_scan_services: Vec<Uuid>,

   #[serde(default = "default_bus_name")]
   pub bus_name: String,
}

const fn default_adapter_poll_interval() -> u64 {
   10
}

fn default_bus_name() -> String {
   "org.btcoord".to_string()
}

impl Default for Config {
   fn default() -> Self {
      Self {
         backend: Backend::default(),
         adapter_poll_interval: default_adapter_poll_interval(),
         discover_on_start: false,
         le_scan_services: vec![],
         bus_name: default_bus_name(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

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

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BTCOORD_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(CoordError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("btcoord").join("config.toml"))
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   use tempfile::TempDir;

   #[test]
   fn test_missing_file_writes_defaults() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("btcoord").join("config.toml");

      let config = Config::load_from(&path)?;
      assert!(path.exists());
      assert_eq!(config.backend, Backend::Auto);
      assert_eq!(config.adapter_poll_interval, 10);
      assert_eq!(config.bus_name, "org.btcoord");
      assert!(!config.discover_on_start);

      Ok(())
   }

   #[test]
   fn test_partial_file_keeps_defaults() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         "backend = \"fallback\"\nle_scan_services = [\"0000180d-0000-1000-8000-00805f9b34fb\"]\n",
      )?;

      let config = Config::load_from(&path)?;
      assert_eq!(config.backend, Backend::Fallback);
      assert_eq!(config.le_scan_services.len(), 1);
      assert_eq!(config.adapter_poll_interval, 10);

      Ok(())
   }

   #[test]
   fn test_save_then_load() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("config.toml");

      let config = Config {
         backend: Backend::Bluez,
         discover_on_start: true,
         ..Default::default()
      };
      config.save_to(&path)?;

      let loaded = Config::load_from(&path)?;
      assert_eq!(loaded.backend, Backend::Bluez);
      assert!(loaded.discover_on_start);

      Ok(())
   }
}
