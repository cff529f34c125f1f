//! GATT server coordination.
//!
//! The [`GattManager`] binds to the adapter manager's `default-adapter-ready`
//! notification, captures the adapter's GATT server (or the fallback one),
//! forwards connection requests to it and re-publishes its events.

use std::{
   future::Future,
   sync::{Arc, Weak},
};

use log::{debug, info};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
};
use uuid::Uuid;

use crate::{
   error::{CoordError, Result},
   event::{ConnectionState, Emitter, GattEvent, ListenerId, ManagerEvent},
   host::{
      AdapterRef, EventStream, GattServerEvent, GattServerRef, GattService,
      fallback::FallbackGattServer, next_attached,
   },
};

type Reply = oneshot::Sender<Result<()>>;

/// Which kind of GATT server is currently bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
   Unbound,
   Fallback,
   Live,
}

enum GattCommand {
   AdapterReady(AdapterRef),
   Detach,
   Status(oneshot::Sender<GattStatus>),
   Connect(SmolStr, Reply),
   Disconnect(SmolStr, Reply),
   AddService(GattService, Reply),
   RemoveService(GattService, Reply),
   NotifyCharacteristicChanged {
      address: SmolStr,
      characteristic: Uuid,
      instance_id: u32,
      confirm: bool,
      reply: Reply,
   },
   SendResponse {
      address: SmolStr,
      status: u16,
      request_id: u32,
      value: Vec<u8>,
      reply: Reply,
   },
}

/// Subscription on the owning adapter manager's events.
struct OwnerBinding {
   owner: Weak<Emitter<ManagerEvent>>,
   listener: ListenerId,
}

/// Handle to the GATT coordination actor. Cheaply cloneable.
#[derive(Clone)]
pub struct GattManager {
   inbox: mpsc::UnboundedSender<GattCommand>,
   events: Arc<Emitter<GattEvent>>,
   binding: Arc<Mutex<Option<OwnerBinding>>>,
}

impl GattManager {
   /// Spawns the actor. Must be called from within a tokio runtime.
   pub fn new() -> Self {
      let (inbox, inbox_rx) = mpsc::unbounded_channel();
      let events = Arc::new(Emitter::new());
      tokio::spawn(
         GattActor {
            inbox: inbox_rx,
            events: events.clone(),
            server: None,
            server_events: None,
         }
         .run(),
      );
      Self {
         inbox,
         events,
         binding: Arc::new(Mutex::new(None)),
      }
   }

   /// Starts following `default-adapter-ready` on `owner`.
   pub fn init(&self, owner: &Arc<Emitter<ManagerEvent>>) {
      let mut binding = self.binding.lock();
      if let Some(previous) = binding.take() {
         previous.release();
      }

      let inbox = self.inbox.clone();
      let listener = owner.on(move |event| {
         if let ManagerEvent::DefaultAdapterReady(adapter) = event {
            let _ = inbox.send(GattCommand::AdapterReady(adapter.clone()));
         }
      });
      *binding = Some(OwnerBinding {
         owner: Arc::downgrade(owner),
         listener,
      });
   }

   /// Drops the owner subscription and every GATT server listener.
   ///
   /// Safe to call repeatedly, or without a prior [`GattManager::init`].
   pub fn uninit(&self) {
      if let Some(binding) = self.binding.lock().take() {
         binding.release();
      }
      let _ = self.inbox.send(GattCommand::Detach);
   }

   pub fn events(&self) -> &Arc<Emitter<GattEvent>> {
      &self.events
   }

   pub async fn status(&self) -> GattStatus {
      let (tx, rx) = oneshot::channel();
      if self.inbox.send(GattCommand::Status(tx)).is_err() {
         return GattStatus::Unbound;
      }
      rx.await.unwrap_or(GattStatus::Unbound)
   }

   async fn request(&self, build: impl FnOnce(Reply) -> GattCommand) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(build(tx))
         .map_err(|_| CoordError::ManagerShutdown)?;
      rx.await.map_err(|_| CoordError::ManagerShutdown)?
   }

   /// Connects a remote device to the local GATT server.
   pub async fn connect(&self, address: &str) -> Result<()> {
      self
         .request(|reply| GattCommand::Connect(address.into(), reply))
         .await
   }

   pub async fn disconnect(&self, address: &str) -> Result<()> {
      self
         .request(|reply| GattCommand::Disconnect(address.into(), reply))
         .await
   }

   pub async fn add_service(&self, service: GattService) -> Result<()> {
      self
         .request(|reply| GattCommand::AddService(service, reply))
         .await
   }

   pub async fn remove_service(&self, service: GattService) -> Result<()> {
      self
         .request(|reply| GattCommand::RemoveService(service, reply))
         .await
   }

   pub async fn notify_characteristic_changed(
      &self,
      address: &str,
      characteristic: Uuid,
      instance_id: u32,
      confirm: bool,
   ) -> Result<()> {
      self
         .request(|reply| GattCommand::NotifyCharacteristicChanged {
            address: address.into(),
            characteristic,
            instance_id,
            confirm,
            reply,
         })
         .await
   }

   pub async fn send_response(
      &self,
      address: &str,
      status: u16,
      request_id: u32,
      value: &[u8],
   ) -> Result<()> {
      self
         .request(|reply| GattCommand::SendResponse {
            address: address.into(),
            status,
            request_id,
            value: value.to_vec(),
            reply,
         })
         .await
   }

   /// Describes an empty service with a fresh identifier.
   pub fn create_empty_service(&self, primary: bool) -> GattService {
      GattService::empty(primary)
   }
}

impl OwnerBinding {
   fn release(self) {
      if let Some(owner) = self.owner.upgrade() {
         owner.off(self.listener);
      }
   }
}

// === GATT Actor ===

struct GattActor {
   inbox: mpsc::UnboundedReceiver<GattCommand>,
   events: Arc<Emitter<GattEvent>>,
   server: Option<GattServerRef>,
   server_events: Option<EventStream<GattServerEvent>>,
}

impl GattActor {
   async fn run(mut self) {
      loop {
         select! {
            cmd = self.inbox.recv() => {
               let Some(cmd) = cmd else {
                  debug!("GATT manager shutting down");
                  break;
               };
               self.handle_command(cmd);
            }
            event = next_attached(&mut self.server_events) => {
               match event {
                  Some(event) => self.handle_server_event(event),
                  None => {
                     debug!("GATT server event stream ended");
                     self.server_events = None;
                  },
               }
            }
         }
      }
   }

   fn handle_command(&mut self, cmd: GattCommand) {
      match cmd {
         GattCommand::AdapterReady(adapter) => self.bind(&adapter),
         GattCommand::Detach => self.unbind(),
         GattCommand::Status(reply) => {
            let status = match &self.server {
               None => GattStatus::Unbound,
               Some(server) if server.is_fallback() => GattStatus::Fallback,
               Some(_) => GattStatus::Live,
            };
            let _ = reply.send(status);
         },
         GattCommand::Connect(address, reply) => {
            self.forward(reply, |server| async move { server.connect(&address).await });
         },
         GattCommand::Disconnect(address, reply) => {
            self.forward(reply, |server| async move { server.disconnect(&address).await });
         },
         GattCommand::AddService(service, reply) => {
            self.forward(reply, |server| async move { server.add_service(service).await });
         },
         GattCommand::RemoveService(service, reply) => {
            self.forward(reply, |server| async move { server.remove_service(&service).await });
         },
         GattCommand::NotifyCharacteristicChanged {
            address,
            characteristic,
            instance_id,
            confirm,
            reply,
         } => {
            self.forward(reply, |server| async move {
               server
                  .notify_characteristic_changed(&address, characteristic, instance_id, confirm)
                  .await
            });
         },
         GattCommand::SendResponse {
            address,
            status,
            request_id,
            value,
            reply,
         } => {
            self.forward(reply, |server| async move {
               server
                  .send_response(&address, status, request_id, &value)
                  .await
            });
         },
      }
   }

   /// Runs `op` against the bound server, or rejects with `NoGattServer`.
   fn forward<F, Fut>(&self, reply: Reply, op: F)
   where
      F: FnOnce(GattServerRef) -> Fut,
      Fut: Future<Output = Result<()>> + Send + 'static,
   {
      let Some(server) = self.server.clone() else {
         let _ = reply.send(Err(CoordError::NoGattServer));
         return;
      };
      let request = op(server);
      tokio::spawn(async move {
         let _ = reply.send(request.await);
      });
   }

   fn bind(&mut self, adapter: &AdapterRef) {
      // Old server listeners go before new ones are attached
      self.unbind();

      let server = adapter.gatt_server().unwrap_or_else(|| {
         debug!(
            "Adapter {} has no GATT server, using fallback",
            adapter.name()
         );
         Arc::new(FallbackGattServer::new()) as GattServerRef
      });
      info!(
         "GATT server bound on adapter {} (fallback: {})",
         adapter.name(),
         server.is_fallback()
      );
      self.server_events = Some(server.events());
      self.server = Some(server);
   }

   fn unbind(&mut self) {
      if self.server.take().is_some() {
         debug!("GATT server unbound");
      }
      self.server_events = None;
   }

   fn handle_server_event(&self, event: GattServerEvent) {
      match event {
         GattServerEvent::ConnectionStateChanged { address, connected } => {
            info!("GATT connection state of {address}: connected={connected}");
            self
               .events
               .fire(&GattEvent::ConnectionStateChanged(ConnectionState {
                  address,
                  connected,
               }));
         },
         GattServerEvent::AttributeReadRequest(request) => {
            debug!(
               "Attribute read request {} from {}",
               request.request_id, request.address
            );
            self.events.fire(&GattEvent::AttributeReadRequest(request));
         },
         GattServerEvent::AttributeWriteRequest(request) => {
            debug!(
               "Attribute write request {} from {}",
               request.request_id, request.address
            );
            self.events.fire(&GattEvent::AttributeWriteRequest(request));
         },
      }
   }
}
