//! Default adapter coordination.
//!
//! This module tracks the platform default adapter, mirrors its power and
//! discovery state, and serializes discovery/LE-scan requests against it.

use std::{
   fmt, mem,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
};

use crossbeam::atomic::AtomicCell;
use futures::{FutureExt, future::BoxFuture};
use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
};
use uuid::Uuid;

use crate::{
   bluetooth::gatt::GattManager,
   config::Config,
   error::{CoordError, Result},
   event::{Emitter, ManagerEvent},
   host::{
      AdapterRef, AdapterState, Attribute, Device, DiscoveryRef, EventStream, HostRef,
      environment::resolve_adapter_host, next_attached,
   },
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

type Reply = oneshot::Sender<Result<()>>;
type PendingStop = Result<BoxFuture<'static, Result<()>>>;

#[derive(Debug)]
enum ScanKind {
   Discovery,
   LeScan(Vec<Uuid>),
}

impl fmt::Display for ScanKind {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Discovery => f.write_str("discovery"),
         Self::LeScan(_) => f.write_str("LE scan"),
      }
   }
}

// === Commands ===

enum ManagerCommand {
   SetDefaultAdapter(Option<AdapterRef>, oneshot::Sender<()>),
   AdapterName(oneshot::Sender<Option<SmolStr>>),

   // Raw primitives
   StartDiscovery(Reply),
   StopDiscovery(Reply),
   StartLeScan(Vec<Uuid>, Reply),
   StopLeScan(Reply),

   // Best-effort entry points
   SafelyStartDiscovery(Reply),
   SafelyStopDiscovery(Reply),
   SafelyStartLeScan(Vec<Uuid>, Reply),
   SafelyStopLeScan(Reply),
   SafelyDisable(Reply),

   // Loopback
   ScanStarted {
      generation: u64,
      result: Result<DiscoveryRef>,
      reply: Reply,
   },
}

// === Published State ===

/// Observable `state` / `discovering` with change detection.
struct Published {
   state: AtomicCell<AdapterState>,
   discovering: AtomicBool,
   events: Arc<Emitter<ManagerEvent>>,
}

impl Published {
   fn new(events: Arc<Emitter<ManagerEvent>>) -> Self {
      Self {
         state: AtomicCell::new(AdapterState::Disabled),
         discovering: AtomicBool::new(false),
         events,
      }
   }

   /// Returns whether the value changed (and notifications were fired).
   fn set_state(&self, value: AdapterState) -> bool {
      if self.state.swap(value) == value {
         return false;
      }
      self.events.fire(&ManagerEvent::StateChanged(value));
      match value {
         AdapterState::Enabled => self.events.fire(&ManagerEvent::Enabled),
         AdapterState::Disabled => self.events.fire(&ManagerEvent::Disabled),
         AdapterState::Enabling | AdapterState::Disabling => {},
      }
      true
   }

   fn set_discovering(&self, value: bool) -> bool {
      if self.discovering.swap(value, Ordering::Relaxed) == value {
         return false;
      }
      self
         .events
         .fire(&ManagerEvent::DiscoveringStateChanged(value));
      if value {
         self.events.fire(&ManagerEvent::StartDiscovering);
      } else {
         self.events.fire(&ManagerEvent::StopDiscovering);
      }
      true
   }
}

// === Main Manager ===

/// Coordinates the default adapter, discovery sessions and the GATT server.
///
/// This type is a cheaply cloneable handle; all state lives in an actor
/// task, so requests from any number of clones are applied one at a time.
#[derive(Clone)]
pub struct AdapterManager {
   inbox: mpsc::Sender<ManagerCommand>,
   published: Arc<Published>,
   gatt: GattManager,
}

impl AdapterManager {
   /// Resolves the adapter host for `config` and starts coordinating it.
   pub async fn init(config: &Config, events: Arc<Emitter<ManagerEvent>>) -> Self {
      Self::with_emitter(resolve_adapter_host(config).await, events)
   }

   /// Starts coordinating `host` with a fresh event emitter.
   pub fn new(host: HostRef) -> Self {
      Self::with_emitter(host, Arc::new(Emitter::new()))
   }

   /// Starts coordinating `host`, publishing on `events`.
   ///
   /// Listeners already registered on `events` observe the initial
   /// `default-adapter-ready` notification.
   pub fn with_emitter(host: HostRef, events: Arc<Emitter<ManagerEvent>>) -> Self {
      let published = Arc::new(Published::new(events));
      let gatt = GattManager::new();
      gatt.init(&published.events);

      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let mut actor = ManagerActor {
         host,
         published: published.clone(),
         command_rx,
         loopback_rx,
         loopback_tx,
         host_events: None,
         adapter: None,
         adapter_events: None,
         discovery_handle: None,
         discovery_events: None,
         generation: 0,
         deferred: Vec::new(),
      };
      actor.initialize();
      tokio::spawn(actor.run());

      Self {
         inbox: command_tx,
         published,
         gatt,
      }
   }

   pub fn state(&self) -> AdapterState {
      self.published.state.load()
   }

   pub fn discovering(&self) -> bool {
      self.published.discovering.load(Ordering::Relaxed)
   }

   pub fn events(&self) -> &Arc<Emitter<ManagerEvent>> {
      &self.published.events
   }

   pub fn gatt(&self) -> &GattManager {
      &self.gatt
   }

   /// Name of the bound default adapter, if any.
   pub async fn adapter_name(&self) -> Option<SmolStr> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::AdapterName(tx))
         .await
         .is_err()
      {
         return None;
      }
      rx.await.ok().flatten()
   }

   /// Rebinds to `adapter`. `None` is ignored.
   pub async fn set_default_adapter(&self, adapter: Option<AdapterRef>) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::SetDefaultAdapter(adapter, tx))
         .await
         .map_err(|_| CoordError::ManagerShutdown)?;
      rx.await.map_err(|_| CoordError::ManagerShutdown)
   }

   async fn request(&self, build: impl FnOnce(Reply) -> ManagerCommand) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(build(tx))
         .await
         .map_err(|_| CoordError::ManagerShutdown)?;
      rx.await.map_err(|_| CoordError::ManagerShutdown)?
   }

   /// Starts classic discovery, enabling the adapter first if needed.
   pub async fn start_discovery(&self) -> Result<()> {
      self.request(ManagerCommand::StartDiscovery).await
   }

   pub async fn stop_discovery(&self) -> Result<()> {
      self.request(ManagerCommand::StopDiscovery).await
   }

   /// Starts an LE scan for `services`, enabling the adapter first if needed.
   pub async fn start_le_scan(&self, services: &[Uuid]) -> Result<()> {
      let services = services.to_vec();
      self
         .request(|reply| ManagerCommand::StartLeScan(services, reply))
         .await
   }

   pub async fn stop_le_scan(&self) -> Result<()> {
      self.request(ManagerCommand::StopLeScan).await
   }

   /// Stops any running discovery, then starts a new one.
   ///
   /// Waits for the default adapter when none is bound yet. Only failures
   /// of the start itself are returned.
   pub async fn safely_start_discovery(&self) -> Result<()> {
      self.request(ManagerCommand::SafelyStartDiscovery).await
   }

   pub async fn safely_stop_discovery(&self) {
      if let Err(e) = self.request(ManagerCommand::SafelyStopDiscovery).await {
         warn!("Failed to stop discovery: {e}");
      }
   }

   /// Stops any running LE scan, then starts a new one for `services`.
   pub async fn safely_start_le_scan(&self, services: &[Uuid]) -> Result<()> {
      let services = services.to_vec();
      self
         .request(|reply| ManagerCommand::SafelyStartLeScan(services, reply))
         .await
   }

   pub async fn safely_stop_le_scan(&self) {
      if let Err(e) = self.request(ManagerCommand::SafelyStopLeScan).await {
         warn!("Failed to stop LE scan: {e}");
      }
   }

   pub async fn safely_disable(&self) {
      if let Err(e) = self.request(ManagerCommand::SafelyDisable).await {
         warn!("Failed to disable adapter: {e}");
      }
   }

   pub async fn gatt_server_connect(&self, address: &str) -> Result<()> {
      self.gatt.connect(address).await
   }

   pub async fn gatt_server_disconnect(&self, address: &str) -> Result<()> {
      self.gatt.disconnect(address).await
   }
}

// === Manager Actor ===

struct ManagerActor {
   host: HostRef,
   published: Arc<Published>,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,

   // State
   host_events: Option<EventStream<Vec<Attribute>>>,
   adapter: Option<AdapterRef>,
   adapter_events: Option<EventStream<Vec<Attribute>>>,
   discovery_handle: Option<DiscoveryRef>,
   discovery_events: Option<EventStream<Device>>,
   generation: u64, // Bumped by every scan start; older completions are stale
   deferred: Vec<ManagerCommand>,
}

impl ManagerActor {
   fn initialize(&mut self) {
      info!(
         "Adapter manager starting up (fallback host: {})",
         self.host.is_fallback()
      );
      self.host_events = Some(self.host.attribute_changes());
      self.set_default_adapter(self.host.default_adapter());
   }

   async fn run(mut self) {
      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Adapter manager shutting down");
                  break;
               };
               self.handle_command(cmd);
            }
            Some(cmd) = self.loopback_rx.recv() => {
               self.handle_command(cmd);
            }
            attrs = next_attached(&mut self.host_events) => {
               match attrs {
                  Some(attrs) => self.on_attributes_changed(&attrs),
                  None => {
                     warn!("Host attribute stream ended");
                     self.host_events = None;
                  },
               }
            }
            attrs = next_attached(&mut self.adapter_events) => {
               match attrs {
                  Some(attrs) => self.on_attributes_changed(&attrs),
                  None => {
                     warn!("Adapter attribute stream ended");
                     self.adapter_events = None;
                  },
               }
            }
            device = next_attached(&mut self.discovery_events) => {
               match device {
                  Some(device) => self.on_device_found(device),
                  None => {
                     debug!("Discovery session ended");
                     self.discovery_events = None;
                  },
               }
            }
         }
      }
   }

   fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::SetDefaultAdapter(adapter, done) => {
            self.set_default_adapter(adapter);
            let _ = done.send(());
         },
         ManagerCommand::AdapterName(reply) => {
            let _ = reply.send(self.adapter.as_ref().map(|a| SmolStr::new(a.name())));
         },
         ManagerCommand::StartDiscovery(reply) => {
            self.start_scan(ScanKind::Discovery, reply);
         },
         ManagerCommand::StartLeScan(services, reply) => {
            self.start_scan(ScanKind::LeScan(services), reply);
         },
         ManagerCommand::StopDiscovery(reply) => {
            let stop = self.begin_stop_discovery();
            tokio::spawn(async move {
               let result = match stop {
                  Ok(stop) => stop.await,
                  Err(e) => Err(e),
               };
               let _ = reply.send(result);
            });
         },
         ManagerCommand::StopLeScan(reply) => {
            let stop = self.begin_stop_le_scan();
            tokio::spawn(async move {
               let result = match stop {
                  Ok(stop) => stop.await,
                  Err(e) => Err(e),
               };
               let _ = reply.send(result);
            });
         },
         ManagerCommand::SafelyStartDiscovery(reply) => {
            // Nothing can be running before the first adapter, so the
            // deferred request starts without a prior stop
            if self.adapter.is_none() {
               self.defer(ManagerCommand::StartDiscovery(reply));
               return;
            }
            let stop = self.begin_stop_discovery();
            self.then_loopback(stop, "discovery", ManagerCommand::StartDiscovery(reply));
         },
         ManagerCommand::SafelyStopDiscovery(reply) => {
            let stop = self.begin_stop_discovery();
            tokio::spawn(async move {
               settle_stop(stop, "discovery").await;
               let _ = reply.send(Ok(()));
            });
         },
         ManagerCommand::SafelyStartLeScan(services, reply) => {
            if self.adapter.is_none() {
               self.defer(ManagerCommand::StartLeScan(services, reply));
               return;
            }
            let stop = self.begin_stop_le_scan();
            self.then_loopback(stop, "LE scan", ManagerCommand::StartLeScan(services, reply));
         },
         ManagerCommand::SafelyStopLeScan(reply) => {
            if self.adapter.is_none() {
               self.defer(ManagerCommand::SafelyStopLeScan(reply));
               return;
            }
            let stop = self.begin_stop_le_scan();
            tokio::spawn(async move {
               settle_stop(stop, "LE scan").await;
               let _ = reply.send(Ok(()));
            });
         },
         ManagerCommand::SafelyDisable(reply) => {
            let Some(adapter) = self.adapter.clone() else {
               self.defer(ManagerCommand::SafelyDisable(reply));
               return;
            };
            tokio::spawn(async move {
               if let Err(e) = adapter.disable().await {
                  warn!("Failed to disable adapter {}: {e}", adapter.name());
               }
               let _ = reply.send(Ok(()));
            });
         },
         ManagerCommand::ScanStarted {
            generation,
            result,
            reply,
         } => {
            self.finish_scan(generation, result, reply);
         },
      }
   }

   fn defer(&mut self, cmd: ManagerCommand) {
      debug!("No default adapter yet, deferring request until one is ready");
      self.deferred.push(cmd);
   }

   fn set_default_adapter(&mut self, adapter: Option<AdapterRef>) {
      let Some(adapter) = adapter else {
         debug!("No default adapter to bind");
         return;
      };

      // Detach from the previous adapter before subscribing to the new one
      if let Some(previous) = self.adapter.take() {
         debug!("Releasing adapter {}", previous.name());
      }
      self.adapter_events = None;

      info!("Default adapter ready: {}", adapter.name());
      self.adapter_events = Some(adapter.attribute_changes());
      self.adapter = Some(adapter.clone());

      self.published.set_state(adapter.state());
      self.published.set_discovering(adapter.discovering());
      self
         .published
         .events
         .fire(&ManagerEvent::DefaultAdapterReady(adapter));

      for cmd in mem::take(&mut self.deferred) {
         self.handle_command(cmd);
      }
   }

   fn on_attributes_changed(&mut self, attrs: &[Attribute]) {
      for attr in attrs {
         debug!("Attribute changed: {attr}");
         match attr {
            Attribute::DefaultAdapter => {
               self.set_default_adapter(self.host.default_adapter());
            },
            Attribute::Discovering => {
               if let Some(adapter) = &self.adapter {
                  self.published.set_discovering(adapter.discovering());
               }
            },
            Attribute::State => {
               if let Some(adapter) = &self.adapter {
                  self.published.set_state(adapter.state());
               }
            },
         }
      }
   }

   fn on_device_found(&self, device: Device) {
      debug!("Device found: {}", device.address);
      self.published.events.fire(&ManagerEvent::DeviceFound(device));
   }

   fn clear_discovery(&mut self) {
      if self.discovery_handle.take().is_some() {
         debug!("Discarding discovery handle");
      }
      self.discovery_events = None;
   }

   fn start_scan(&mut self, kind: ScanKind, reply: Reply) {
      self.clear_discovery();

      let Some(adapter) = self.adapter.clone() else {
         let _ = reply.send(Err(CoordError::NoAdapter));
         return;
      };

      self.generation += 1;
      let generation = self.generation;
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let result = start_on(&adapter, kind).await;
         if let Err(e) = loopback
            .send(ManagerCommand::ScanStarted {
               generation,
               result,
               reply,
            })
            .await
         {
            warn!("Channel overflow sending scan result: {e}");
         }
      });
   }

   fn finish_scan(&mut self, generation: u64, result: Result<DiscoveryRef>, reply: Reply) {
      let outcome = match result {
         Ok(handle) if generation == self.generation => {
            self.clear_discovery();
            self.discovery_events = Some(handle.devices_found());
            self.discovery_handle = Some(handle);
            Ok(())
         },
         Ok(_) => {
            debug!(
               "Dropping superseded discovery handle (generation {generation}, current {})",
               self.generation
            );
            Ok(())
         },
         Err(e) => Err(e),
      };
      let _ = reply.send(outcome);
   }

   fn begin_stop_discovery(&mut self) -> PendingStop {
      let adapter = self.adapter.clone().ok_or(CoordError::NoAdapter)?;
      self.clear_discovery();
      Ok(async move { adapter.stop_discovery().await }.boxed())
   }

   fn begin_stop_le_scan(&mut self) -> PendingStop {
      let adapter = self.adapter.clone().ok_or(CoordError::NoAdapter)?;
      let handle = self
         .discovery_handle
         .clone()
         .ok_or(CoordError::NoDiscoveryHandle)?;
      self.clear_discovery();
      Ok(async move { adapter.stop_le_scan(&handle).await }.boxed())
   }

   /// Awaits `stop` (swallowing failures), then posts `next` to the actor.
   fn then_loopback(&self, stop: PendingStop, what: &'static str, next: ManagerCommand) {
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         settle_stop(stop, what).await;
         if let Err(e) = loopback.send(next).await {
            warn!("Channel overflow re-queueing {what} start: {e}");
         }
      });
   }
}

async fn start_on(adapter: &AdapterRef, kind: ScanKind) -> Result<DiscoveryRef> {
   if adapter.state() != AdapterState::Enabled {
      debug!("Enabling adapter {} before {kind}", adapter.name());
      adapter.enable().await?;
   }
   match kind {
      ScanKind::Discovery => adapter.start_discovery().await,
      ScanKind::LeScan(services) => adapter.start_le_scan(&services).await,
   }
}

async fn settle_stop(stop: PendingStop, what: &str) {
   let result = match stop {
      Ok(stop) => stop.await,
      Err(e) => Err(e),
   };
   match result {
      Ok(()) => {},
      Err(CoordError::NoDiscoveryHandle) => debug!("No {what} to stop"),
      Err(e) => warn!("Failed to stop {what}: {e}"),
   }
}
