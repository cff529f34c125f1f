//! Error types for the coordination service.
//!
//! Precondition failures (`NoAdapter`, `NoDiscoveryHandle`, `NoGattServer`)
//! are what the raw primitives reject with; everything else wraps failures
//! reported by the Bluetooth stack, D-Bus, or the configuration layer.

use smol_str::SmolStr;
use thiserror::Error;

/// Main error type for the coordination service.
#[derive(Error, Debug)]
pub enum CoordError {
   #[error("default adapter does not exist")]
   NoAdapter,

   #[error("discovery handle does not exist")]
   NoDiscoveryHandle,

   #[error("gatt server does not exist")]
   NoGattServer,

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid device address: {0}")]
   InvalidAddress(SmolStr),

   #[error("Operation not supported: {0}")]
   NotSupported(&'static str),

   #[error("Operation failed: {0}")]
   OperationFailed(String),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `CoordError`.
pub type Result<T> = std::result::Result<T, CoordError>;
