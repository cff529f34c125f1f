//! Coordination layer.
//!
//! [`manager::AdapterManager`] owns the default adapter binding and the
//! discovery lifecycle; [`gatt::GattManager`] follows it to the adapter's
//! GATT server.

pub mod gatt;
pub mod manager;
