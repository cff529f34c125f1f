use std::str::FromStr;

use log::{info, warn};
use uuid::Uuid;
use zbus::{
   interface,
   object_server::{InterfaceRef, SignalEmitter},
};

use crate::{
   bluetooth::manager::AdapterManager,
   classifier::ClassOfDevice,
   error::CoordError,
   event::{GattEvent, ManagerEvent},
};

pub const OBJECT_PATH: &str = "/org/btcoord/adapter";

fn to_fdo(e: CoordError) -> zbus::fdo::Error {
   match e {
      CoordError::InvalidAddress(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
      CoordError::NotSupported(what) => zbus::fdo::Error::NotSupported(what.to_string()),
      e => zbus::fdo::Error::Failed(e.to_string()),
   }
}

fn parse_uuid(value: &str) -> zbus::fdo::Result<Uuid> {
   Uuid::from_str(value).map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{value}: {e}")))
}

pub struct CoordinatorService {
   manager: AdapterManager,
}

impl CoordinatorService {
   pub const fn new(manager: AdapterManager) -> Self {
      Self { manager }
   }

   /// Emits the signals (and property notifications) for a manager event.
   pub async fn publish_manager_event(
      iface: &InterfaceRef<Self>,
      event: ManagerEvent,
   ) -> zbus::Result<()> {
      match event {
         ManagerEvent::StateChanged(state) => {
            iface.adapter_state_changed(state.to_str()).await?;
            iface.get().await.state_changed(iface.signal_emitter()).await?;
         },
         ManagerEvent::Enabled => iface.enabled().await?,
         ManagerEvent::Disabled => iface.disabled().await?,
         ManagerEvent::DiscoveringStateChanged(discovering) => {
            iface.discovering_state_changed(discovering).await?;
            iface
               .get()
               .await
               .discovering_changed(iface.signal_emitter())
               .await?;
         },
         ManagerEvent::StartDiscovering => iface.start_discovering().await?,
         ManagerEvent::StopDiscovering => iface.stop_discovering().await?,
         ManagerEvent::DeviceFound(device) => {
            iface.device_found(&device.to_json().to_string()).await?;
         },
         ManagerEvent::DefaultAdapterReady(adapter) => {
            iface.default_adapter_ready(adapter.name()).await?;
         },
      }
      Ok(())
   }

   /// Emits the signal for a GATT event. Requests are sent as JSON.
   pub async fn publish_gatt_event(
      iface: &InterfaceRef<Self>,
      event: GattEvent,
   ) -> zbus::Result<()> {
      if let GattEvent::ConnectionStateChanged(state) = &event {
         return iface
            .connection_state_changed(&state.address, state.connected)
            .await;
      }

      let Some(request) = request_json(&event) else {
         return Ok(());
      };
      match event {
         GattEvent::AttributeReadRequest(_) => iface.attribute_read_request(&request).await,
         GattEvent::AttributeWriteRequest(_) => iface.attribute_write_request(&request).await,
         GattEvent::ConnectionStateChanged(_) => Ok(()),
      }
   }
}

/// Serializes a GATT event for a signal payload; `None` skips the signal.
fn request_json(event: &GattEvent) -> Option<String> {
   match serde_json::to_string(event) {
      Ok(json) => Some(json),
      Err(e) => {
         warn!("Dropping {} signal, payload not serializable: {e}", event.name());
         None
      },
   }
}

#[interface(name = "org.btcoord.Adapter1")]
impl CoordinatorService {
   async fn start_discovery(&self) -> zbus::fdo::Result<()> {
      self.manager.safely_start_discovery().await.map_err(to_fdo)
   }

   async fn stop_discovery(&self) {
      self.manager.safely_stop_discovery().await;
   }

   async fn start_le_scan(&self, services: Vec<String>) -> zbus::fdo::Result<()> {
      let services = services
         .iter()
         .map(|s| parse_uuid(s))
         .collect::<zbus::fdo::Result<Vec<_>>>()?;
      self
         .manager
         .safely_start_le_scan(&services)
         .await
         .map_err(to_fdo)
   }

   async fn stop_le_scan(&self) {
      self.manager.safely_stop_le_scan().await;
   }

   async fn disable(&self) {
      info!("Disable requested over D-Bus");
      self.manager.safely_disable().await;
   }

   async fn gatt_connect(&self, address: String) -> zbus::fdo::Result<()> {
      self
         .manager
         .gatt_server_connect(&address)
         .await
         .map_err(to_fdo)
   }

   async fn gatt_disconnect(&self, address: String) -> zbus::fdo::Result<()> {
      self
         .manager
         .gatt_server_disconnect(&address)
         .await
         .map_err(to_fdo)
   }

   async fn notify_characteristic_changed(
      &self,
      address: String,
      characteristic: String,
      instance_id: u32,
      confirm: bool,
   ) -> zbus::fdo::Result<()> {
      let characteristic = parse_uuid(&characteristic)?;
      self
         .manager
         .gatt()
         .notify_characteristic_changed(&address, characteristic, instance_id, confirm)
         .await
         .map_err(to_fdo)
   }

   /// `value` is hex encoded.
   async fn send_response(
      &self,
      address: String,
      status: u16,
      request_id: u32,
      value: String,
   ) -> zbus::fdo::Result<()> {
      let value = hex::decode(value).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      self
         .manager
         .gatt()
         .send_response(&address, status, request_id, &value)
         .await
         .map_err(to_fdo)
   }

   /// Returns `(type, icon)` for a raw 24-bit class of device.
   fn classify_device(&self, class: u32) -> (String, String) {
      let cod = ClassOfDevice::from_raw(class);
      (cod.device_type_str().to_string(), cod.icon().to_string())
   }

   // Signals
   #[zbus(signal)]
   pub async fn adapter_state_changed(
      emitter: &SignalEmitter<'_>,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn enabled(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn disabled(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn discovering_state_changed(
      emitter: &SignalEmitter<'_>,
      discovering: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn start_discovering(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn stop_discovering(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_found(emitter: &SignalEmitter<'_>, device: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn default_adapter_ready(
      emitter: &SignalEmitter<'_>,
      adapter: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connection_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      connected: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn attribute_read_request(
      emitter: &SignalEmitter<'_>,
      request: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn attribute_write_request(
      emitter: &SignalEmitter<'_>,
      request: &str,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn state(&self) -> String {
      self.manager.state().to_str().to_string()
   }

   #[zbus(property)]
   async fn discovering(&self) -> bool {
      self.manager.discovering()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_error_mapping() {
      assert!(matches!(
         to_fdo(CoordError::InvalidAddress("x".into())),
         zbus::fdo::Error::InvalidArgs(_)
      ));
      assert!(matches!(
         to_fdo(CoordError::NotSupported("responses")),
         zbus::fdo::Error::NotSupported(_)
      ));
      match to_fdo(CoordError::NoGattServer) {
         zbus::fdo::Error::Failed(msg) => assert_eq!(msg, "gatt server does not exist"),
         other => panic!("unexpected mapping: {other:?}"),
      }
   }

   #[test]
   fn test_request_json() {
      let event = GattEvent::AttributeWriteRequest(crate::host::AttributeRequest {
         address: "AA:BB:CC:DD:EE:FF".into(),
         request_id: 7,
         characteristic: Uuid::nil(),
         instance_id: 1,
         offset: 0,
         value: vec![1, 2],
         needs_response: true,
      });
      let json: serde_json::Value =
         serde_json::from_str(&request_json(&event).expect("serializable")).unwrap();
      assert_eq!(json["type"], "attribute-write-request");
      assert_eq!(json["request_id"], 7);
   }

   #[test]
   fn test_parse_uuid() {
      assert!(parse_uuid("0000180d-0000-1000-8000-00805f9b34fb").is_ok());
      assert!(matches!(parse_uuid("heart-rate"), Err(zbus::fdo::Error::InvalidArgs(_))));
   }
}
