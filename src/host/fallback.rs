//! Stand-in host used when no Bluetooth stack is reachable.
//!
//! Every operation succeeds immediately and no event is ever reported, so
//! the coordinators stay operable (and testable) on machines without a
//! radio.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use log::debug;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
   Adapter, AdapterHost, AdapterRef, AdapterState, Attribute, Device, DiscoveryHandle,
   DiscoveryRef, EventStream, GattServer, GattServerEvent, GattServerRef, GattService,
};
use crate::error::Result;

const FALLBACK_ADAPTER_NAME: &str = "fallback";

/// Host exposing a single permanently-disabled adapter.
pub struct FallbackHost {
   adapter: AdapterRef,
}

impl FallbackHost {
   pub fn new() -> Self {
      Self {
         adapter: Arc::new(FallbackAdapter),
      }
   }
}

impl Default for FallbackHost {
   fn default() -> Self {
      Self::new()
   }
}

impl AdapterHost for FallbackHost {
   fn is_fallback(&self) -> bool {
      true
   }

   fn default_adapter(&self) -> Option<AdapterRef> {
      Some(self.adapter.clone())
   }

   fn attribute_changes(&self) -> EventStream<Vec<Attribute>> {
      stream::pending().boxed()
   }
}

#[derive(Debug)]
pub struct FallbackAdapter;

#[async_trait]
impl Adapter for FallbackAdapter {
   fn name(&self) -> &str {
      FALLBACK_ADAPTER_NAME
   }

   fn state(&self) -> AdapterState {
      AdapterState::Disabled
   }

   fn discovering(&self) -> bool {
      false
   }

   fn attribute_changes(&self) -> EventStream<Vec<Attribute>> {
      stream::pending().boxed()
   }

   fn gatt_server(&self) -> Option<GattServerRef> {
      None
   }

   async fn enable(&self) -> Result<()> {
      Ok(())
   }

   async fn disable(&self) -> Result<()> {
      Ok(())
   }

   async fn start_discovery(&self) -> Result<DiscoveryRef> {
      Ok(Arc::new(FallbackDiscovery))
   }

   async fn stop_discovery(&self) -> Result<()> {
      Ok(())
   }

   async fn start_le_scan(&self, _services: &[Uuid]) -> Result<DiscoveryRef> {
      Ok(Arc::new(FallbackDiscovery))
   }

   async fn stop_le_scan(&self, _handle: &DiscoveryRef) -> Result<()> {
      Ok(())
   }
}

/// Discovery session that never finds anything.
pub struct FallbackDiscovery;

impl DiscoveryHandle for FallbackDiscovery {
   fn devices_found(&self) -> EventStream<Device> {
      stream::pending().boxed()
   }
}

/// GATT server used until the adapter provides a real one.
#[derive(Default)]
pub struct FallbackGattServer {
   services: Mutex<Vec<GattService>>,
}

impl FallbackGattServer {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn services(&self) -> Vec<GattService> {
      self.services.lock().clone()
   }
}

#[async_trait]
impl GattServer for FallbackGattServer {
   fn is_fallback(&self) -> bool {
      true
   }

   fn events(&self) -> EventStream<GattServerEvent> {
      stream::pending().boxed()
   }

   async fn connect(&self, address: &str) -> Result<()> {
      debug!("Fallback GATT server: connect {address}");
      Ok(())
   }

   async fn disconnect(&self, address: &str) -> Result<()> {
      debug!("Fallback GATT server: disconnect {address}");
      Ok(())
   }

   async fn add_service(&self, service: GattService) -> Result<()> {
      debug!("Fallback GATT server: add service {}", service.uuid);
      self.services.lock().push(service);
      Ok(())
   }

   async fn remove_service(&self, service: &GattService) -> Result<()> {
      debug!("Fallback GATT server: remove service {}", service.uuid);
      self.services.lock().retain(|s| s.uuid != service.uuid);
      Ok(())
   }

   async fn notify_characteristic_changed(
      &self,
      address: &str,
      characteristic: Uuid,
      _instance_id: u32,
      _confirm: bool,
   ) -> Result<()> {
      debug!("Fallback GATT server: notify {characteristic} to {address}");
      Ok(())
   }

   async fn send_response(
      &self,
      address: &str,
      status: u16,
      request_id: u32,
      _value: &[u8],
   ) -> Result<()> {
      debug!("Fallback GATT server: response {request_id} ({status}) to {address}");
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[tokio::test]
   async fn test_fallback_adapter_operations_resolve() -> Result<()> {
      let host = FallbackHost::new();
      assert!(host.is_fallback());

      let adapter = host.default_adapter().expect("fallback has an adapter");
      assert_eq!(adapter.state(), AdapterState::Disabled);
      assert!(!adapter.discovering());
      assert!(adapter.gatt_server().is_none());

      adapter.enable().await?;
      let handle = adapter.start_discovery().await?;
      adapter.stop_discovery().await?;
      adapter.stop_le_scan(&handle).await?;
      adapter.disable().await?;

      // Enabling does not change the reported state
      assert_eq!(adapter.state(), AdapterState::Disabled);
      Ok(())
   }

   #[tokio::test]
   async fn test_fallback_gatt_server_tracks_services() -> Result<()> {
      let server = FallbackGattServer::new();
      let service = GattService::empty(true);

      server.add_service(service).await?;
      server.add_service(GattService::empty(false)).await?;
      assert_eq!(server.services().len(), 2);

      server.remove_service(&service).await?;
      assert_eq!(server.services().len(), 1);
      assert!(server.services().iter().all(|s| s.uuid != service.uuid));

      server.connect("AA:BB:CC:DD:EE:FF").await?;
      server.send_response("AA:BB:CC:DD:EE:FF", 0, 1, &[]).await?;
      Ok(())
   }
}
