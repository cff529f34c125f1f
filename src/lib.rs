//! Bluetooth adapter coordination.
//!
//! Tracks the platform default adapter, serializes discovery and LE-scan
//! requests against it, follows its GATT server and classifies remote
//! devices for presentation.

pub mod bluetooth;
pub mod classifier;
pub mod config;
pub mod dbus;
pub mod error;
pub mod event;
pub mod host;

pub use bluetooth::{
   gatt::{GattManager, GattStatus},
   manager::AdapterManager,
};
pub use classifier::{ClassOfDevice, DeviceType};
pub use error::{CoordError, Result};
pub use event::{ConnectionState, Emitter, GattEvent, ListenerId, ManagerEvent};
pub use host::{AdapterState, Device, GattService};
