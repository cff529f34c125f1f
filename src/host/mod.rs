//! Hardware-facing contract consumed by the coordinators.
//!
//! An [`AdapterHost`] publishes the platform default adapter; an [`Adapter`]
//! exposes power/discovery operations; a [`DiscoveryHandle`] is the source of
//! found devices; a [`GattServer`] is the optional connection-level GATT
//! surface. Two variants exist: the live BlueZ one and the fallback one,
//! chosen once by [`environment::resolve_adapter_host`].

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::{
   StreamExt, channel::mpsc as fmpsc, future, stream::BoxStream,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{classifier::ClassOfDevice, error::Result};

pub mod bluez;
pub mod environment;
pub mod fallback;
#[cfg(test)]
pub(crate) mod mock;

pub type AdapterRef = Arc<dyn Adapter>;
pub type HostRef = Arc<dyn AdapterHost>;
pub type DiscoveryRef = Arc<dyn DiscoveryHandle>;
pub type GattServerRef = Arc<dyn GattServer>;

/// Stream of hardware notifications. Dropping it unsubscribes.
pub type EventStream<T> = BoxStream<'static, T>;

/// Power state of an adapter.
#[derive(
   Debug,
   Clone,
   Copy,
   Default,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AdapterState {
   #[default]
   Disabled,
   Disabling,
   Enabling,
   Enabled,
}

impl AdapterState {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Name of an attribute reported as changed by a host or an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum Attribute {
   DefaultAdapter,
   Discovering,
   State,
}

/// Provides the platform default adapter.
pub trait AdapterHost: Send + Sync {
   /// Whether this is the stand-in used when no radio stack is reachable.
   fn is_fallback(&self) -> bool {
      false
   }

   fn default_adapter(&self) -> Option<AdapterRef>;

   /// Batches of changed host attributes (only `defaultAdapter` today).
   fn attribute_changes(&self) -> EventStream<Vec<Attribute>>;
}

/// A local Bluetooth radio.
#[async_trait]
pub trait Adapter: fmt::Debug + Send + Sync {
   fn name(&self) -> &str;

   fn state(&self) -> AdapterState;

   fn discovering(&self) -> bool;

   /// Batches of changed adapter attributes (`state`, `discovering`).
   fn attribute_changes(&self) -> EventStream<Vec<Attribute>>;

   fn gatt_server(&self) -> Option<GattServerRef>;

   async fn enable(&self) -> Result<()>;

   async fn disable(&self) -> Result<()>;

   async fn start_discovery(&self) -> Result<DiscoveryRef>;

   async fn stop_discovery(&self) -> Result<()>;

   async fn start_le_scan(&self, services: &[Uuid]) -> Result<DiscoveryRef>;

   async fn stop_le_scan(&self, handle: &DiscoveryRef) -> Result<()>;
}

/// Token for a running discovery or LE scan session.
pub trait DiscoveryHandle: Send + Sync {
   fn devices_found(&self) -> EventStream<Device>;
}

/// Connection-level GATT server.
#[async_trait]
pub trait GattServer: Send + Sync {
   fn is_fallback(&self) -> bool {
      false
   }

   fn events(&self) -> EventStream<GattServerEvent>;

   async fn connect(&self, address: &str) -> Result<()>;

   async fn disconnect(&self, address: &str) -> Result<()>;

   async fn add_service(&self, service: GattService) -> Result<()>;

   async fn remove_service(&self, service: &GattService) -> Result<()>;

   async fn notify_characteristic_changed(
      &self,
      address: &str,
      characteristic: Uuid,
      instance_id: u32,
      confirm: bool,
   ) -> Result<()>;

   async fn send_response(
      &self,
      address: &str,
      status: u16,
      request_id: u32,
      value: &[u8],
   ) -> Result<()>;
}

/// Raw notifications from a GATT server.
#[derive(Debug, Clone, PartialEq)]
pub enum GattServerEvent {
   ConnectionStateChanged { address: SmolStr, connected: bool },
   AttributeReadRequest(AttributeRequest),
   AttributeWriteRequest(AttributeRequest),
}

/// A remote read or write against a local attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRequest {
   pub address: SmolStr,
   pub request_id: u32,
   pub characteristic: Uuid,
   pub instance_id: u32,
   #[serde(default)]
   pub offset: u16,
   #[serde(default)]
   pub value: Vec<u8>,
   #[serde(default)]
   pub needs_response: bool,
}

/// A GATT service description handed to [`GattServer::add_service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
   pub uuid: Uuid,
   pub primary: bool,
}

impl GattService {
   /// An empty service with a freshly generated identifier.
   pub fn empty(primary: bool) -> Self {
      Self {
         uuid: Uuid::new_v4(),
         primary,
      }
   }
}

/// A remote device reported by a discovery session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
   pub address: SmolStr,
   #[serde(default)]
   pub name: Option<SmolStr>,
   /// Raw 24-bit class of device.
   #[serde(default)]
   pub class: Option<u32>,
   #[serde(default)]
   pub rssi: Option<i16>,
   #[serde(default)]
   pub uuids: Vec<Uuid>,
   #[serde(default)]
   pub paired: bool,
}

impl Device {
   pub fn new(address: impl Into<SmolStr>) -> Self {
      Self {
         address: address.into(),
         name: None,
         class: None,
         rssi: None,
         uuids: Vec::new(),
         paired: false,
      }
   }

   pub fn class_of_device(&self) -> Option<ClassOfDevice> {
      self.class.map(ClassOfDevice::from_raw)
   }

   /// Converts the device to a JSON representation including its
   /// classified type and icon.
   pub fn to_json(&self) -> serde_json::Value {
      let cod = self.class_of_device().unwrap_or_default();
      json!({
         "address": self.address.as_str(),
         "name": self.name.as_deref(),
         "class": self.class,
         "rssi": self.rssi,
         "uuids": self.uuids,
         "paired": self.paired,
         "type": cod.device_type_str(),
         "icon": cod.icon(),
      })
   }
}

/// Fan-out of hardware notifications to any number of streams.
pub(crate) struct Subscribers<T> {
   senders: Mutex<Vec<fmpsc::UnboundedSender<T>>>,
}

impl<T> Default for Subscribers<T> {
   fn default() -> Self {
      Self {
         senders: Mutex::new(Vec::new()),
      }
   }
}

impl<T: Clone + Send + 'static> Subscribers<T> {
   pub fn subscribe(&self) -> EventStream<T> {
      let (tx, rx) = fmpsc::unbounded();
      self.senders.lock().push(tx);
      rx.boxed()
   }

   pub fn publish(&self, value: &T) {
      self
         .senders
         .lock()
         .retain(|tx| tx.unbounded_send(value.clone()).is_ok());
   }

   /// Number of streams still alive.
   pub fn count(&self) -> usize {
      let mut senders = self.senders.lock();
      senders.retain(|tx| !tx.is_closed());
      senders.len()
   }
}

/// Next item of an attached stream; never resolves while detached.
pub(crate) async fn next_attached<T>(stream: &mut Option<EventStream<T>>) -> Option<T> {
   match stream {
      Some(stream) => stream.next().await,
      None => future::pending().await,
   }
}

#[cfg(test)]
mod tests {
   use std::str::FromStr;

   use super::*;

   #[test]
   fn test_attribute_names() {
      assert_eq!(Attribute::from_str("defaultAdapter").unwrap(), Attribute::DefaultAdapter);
      assert_eq!(Attribute::State.to_string(), "state");
      assert!(Attribute::from_str("powered").is_err());
   }

   #[test]
   fn test_device_json_includes_classification() {
      let mut device = Device::new("00:11:22:33:44:55");
      // Laptop: major class 1, minor class 3
      device.class = Some((1 << 8) | (3 << 2));
      let json = device.to_json();
      assert_eq!(json["type"], "computer");
      assert_eq!(json["icon"], "laptop");

      let unknown = Device::new("00:11:22:33:44:56").to_json();
      assert_eq!(unknown["type"], "");
      assert_eq!(unknown["icon"], "bluetooth");
   }

   #[tokio::test]
   async fn test_subscribers_track_dropped_streams() {
      let subs = Subscribers::<u8>::default();
      let mut first = subs.subscribe();
      let second = subs.subscribe();
      assert_eq!(subs.count(), 2);

      drop(second);
      assert_eq!(subs.count(), 1);

      subs.publish(&7);
      assert_eq!(first.next().await, Some(7));
   }

   #[test]
   fn test_empty_services_are_unique() {
      let a = GattService::empty(true);
      let b = GattService::empty(true);
      assert_ne!(a.uuid, b.uuid);
      assert!(a.primary);
   }
}
