//! Live host backed by BlueZ through `bluer`.

use std::{
   collections::{HashMap, HashSet},
   pin::pin,
   str::FromStr,
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use async_trait::async_trait;
use bluer::{
   AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty, DiscoveryFilter,
   DiscoveryTransport, Session,
};
use crossbeam::atomic::AtomicCell;
use futures::{
   Stream, StreamExt,
   channel::mpsc as fmpsc,
   stream::{BoxStream, SelectAll},
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};
use uuid::Uuid;

use super::{
   Adapter, AdapterHost, AdapterRef, AdapterState, Attribute, Device, DiscoveryHandle,
   DiscoveryRef, EventStream, GattServer, GattServerEvent, GattServerRef, GattService,
   Subscribers,
};
use crate::error::{CoordError, Result};

// === Host ===

/// Tracks the BlueZ default adapter.
///
/// BlueZ has no "default adapter changed" signal, so the host re-resolves
/// it periodically and reports `defaultAdapter` when it appears, changes,
/// or disappears.
pub struct BluezHost {
   session: Session,
   current: Mutex<Option<Arc<BluezAdapter>>>,
   attrs: Subscribers<Vec<Attribute>>,
   poller: Mutex<Option<JoinHandle<()>>>,
}

impl BluezHost {
   pub async fn connect(poll_interval: Duration) -> Result<Arc<Self>> {
      let session = Session::new().await?;
      let current = match session.default_adapter().await {
         Ok(adapter) => Some(BluezAdapter::new(adapter).await?),
         Err(e) => {
            info!("No default adapter yet: {e}");
            None
         },
      };

      let host = Arc::new(Self {
         session,
         current: Mutex::new(current),
         attrs: Subscribers::default(),
         poller: Mutex::new(None),
      });
      let poller = tokio::spawn(Self::poll_default_adapter(
         Arc::downgrade(&host),
         poll_interval,
      ));
      *host.poller.lock() = Some(poller);
      Ok(host)
   }

   async fn poll_default_adapter(host: Weak<Self>, period: Duration) {
      let mut ticker = time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      ticker.tick().await;

      loop {
         ticker.tick().await;
         let Some(host) = host.upgrade() else {
            break;
         };
         host.refresh().await;
      }
   }

   async fn refresh(&self) {
      let found = self.session.default_adapter().await.ok();
      let current_name = self
         .current
         .lock()
         .as_ref()
         .map(|adapter| adapter.name.clone());
      if current_name.as_deref() == found.as_ref().map(bluer::Adapter::name) {
         return;
      }

      let next = match found {
         Some(adapter) => match BluezAdapter::new(adapter).await {
            Ok(adapter) => Some(adapter),
            Err(e) => {
               warn!("Failed to attach new default adapter: {e}");
               return;
            },
         },
         None => None,
      };
      info!(
         "Default adapter changed: {:?} -> {:?}",
         current_name,
         next.as_ref().map(|a| a.name.clone())
      );
      *self.current.lock() = next;
      self.attrs.publish(&vec![Attribute::DefaultAdapter]);
   }
}

impl Drop for BluezHost {
   fn drop(&mut self) {
      if let Some(poller) = self.poller.lock().take() {
         poller.abort();
      }
   }
}

impl AdapterHost for BluezHost {
   fn default_adapter(&self) -> Option<AdapterRef> {
      self
         .current
         .lock()
         .clone()
         .map(|adapter| adapter as AdapterRef)
   }

   fn attribute_changes(&self) -> EventStream<Vec<Attribute>> {
      self.attrs.subscribe()
   }
}

// === Adapter ===

/// Cached adapter properties, kept current by the monitor task.
#[derive(Default)]
struct Observed {
   state: AtomicCell<AdapterState>,
   discovering: AtomicBool,
   attrs: Subscribers<Vec<Attribute>>,
}

impl Observed {
   fn report_state(&self, state: AdapterState) {
      if self.state.swap(state) != state {
         self.attrs.publish(&vec![Attribute::State]);
      }
   }

   fn report_discovering(&self, discovering: bool) {
      if self.discovering.swap(discovering, Ordering::Relaxed) != discovering {
         self.attrs.publish(&vec![Attribute::Discovering]);
      }
   }
}

pub struct BluezAdapter {
   adapter: bluer::Adapter,
   name: SmolStr,
   observed: Arc<Observed>,
   monitor: JoinHandle<()>,
   active: Mutex<Option<Arc<BluezDiscovery>>>,
   gatt: Arc<BluezGattServer>,
}

impl std::fmt::Debug for BluezAdapter {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("BluezAdapter")
         .field("name", &self.name)
         .field("state", &self.observed.state.load())
         .finish()
   }
}

impl BluezAdapter {
   pub async fn new(adapter: bluer::Adapter) -> Result<Arc<Self>> {
      let name = SmolStr::new(adapter.name());
      let observed = Arc::new(Observed::default());
      observed.state.store(if adapter.is_powered().await? {
         AdapterState::Enabled
      } else {
         AdapterState::Disabled
      });
      observed
         .discovering
         .store(adapter.is_discovering().await?, Ordering::Relaxed);

      let events = adapter.events().await?;
      let monitor = tokio::spawn(Self::monitor(name.clone(), events, observed.clone()));
      debug!("Attached to adapter {name}");

      Ok(Arc::new(Self {
         gatt: Arc::new(BluezGattServer::new(adapter.clone())),
         adapter,
         name,
         observed,
         monitor,
         active: Mutex::new(None),
      }))
   }

   async fn monitor(
      name: SmolStr,
      events: impl Stream<Item = AdapterEvent> + Send + 'static,
      observed: Arc<Observed>,
   ) {
      let mut events = pin!(events);
      while let Some(event) = events.next().await {
         match event {
            AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => {
               debug!("Adapter {name} powered: {powered}");
               observed.report_state(if powered {
                  AdapterState::Enabled
               } else {
                  AdapterState::Disabled
               });
            },
            AdapterEvent::PropertyChanged(AdapterProperty::Discovering(discovering)) => {
               debug!("Adapter {name} discovering: {discovering}");
               observed.report_discovering(discovering);
            },
            _ => {},
         }
      }
      debug!("Adapter {name} event stream ended");
   }

   async fn discover(&self, filter: DiscoveryFilter) -> Result<DiscoveryRef> {
      self.adapter.set_discovery_filter(filter).await?;
      let events = self.adapter.discover_devices().await?;
      let session = BluezDiscovery::spawn(self.adapter.clone(), events);
      *self.active.lock() = Some(session.clone());
      Ok(session)
   }

   async fn set_powered(&self, powered: bool) -> Result<()> {
      let (transient, target, previous) = if powered {
         (AdapterState::Enabling, AdapterState::Enabled, AdapterState::Disabled)
      } else {
         (AdapterState::Disabling, AdapterState::Disabled, AdapterState::Enabled)
      };

      self.observed.report_state(transient);
      match self.adapter.set_powered(powered).await {
         Ok(()) => {
            self.observed.report_state(target);
            Ok(())
         },
         Err(e) => {
            self.observed.report_state(previous);
            Err(e.into())
         },
      }
   }
}

impl Drop for BluezAdapter {
   fn drop(&mut self) {
      self.monitor.abort();
   }
}

#[async_trait]
impl Adapter for BluezAdapter {
   fn name(&self) -> &str {
      &self.name
   }

   fn state(&self) -> AdapterState {
      self.observed.state.load()
   }

   fn discovering(&self) -> bool {
      self.observed.discovering.load(Ordering::Relaxed)
   }

   fn attribute_changes(&self) -> EventStream<Vec<Attribute>> {
      self.observed.attrs.subscribe()
   }

   fn gatt_server(&self) -> Option<GattServerRef> {
      Some(self.gatt.clone())
   }

   async fn enable(&self) -> Result<()> {
      self.set_powered(true).await
   }

   async fn disable(&self) -> Result<()> {
      self.set_powered(false).await
   }

   async fn start_discovery(&self) -> Result<DiscoveryRef> {
      self.discover(DiscoveryFilter::default()).await
   }

   async fn stop_discovery(&self) -> Result<()> {
      if let Some(session) = self.active.lock().take() {
         session.stop();
      }
      Ok(())
   }

   async fn start_le_scan(&self, services: &[Uuid]) -> Result<DiscoveryRef> {
      self
         .discover(DiscoveryFilter {
            uuids: services.iter().copied().collect(),
            transport: DiscoveryTransport::Le,
            ..Default::default()
         })
         .await
   }

   async fn stop_le_scan(&self, handle: &DiscoveryRef) -> Result<()> {
      let mut active = self.active.lock();
      let matches = active.as_ref().is_some_and(|session| {
         std::ptr::addr_eq(Arc::as_ptr(session), Arc::as_ptr(handle))
      });
      if matches {
         if let Some(session) = active.take() {
            session.stop();
         }
      } else {
         debug!("LE scan on {} already stopped", self.name);
      }
      Ok(())
   }
}

// === Discovery ===

/// A running BlueZ discovery session; ends when stopped or dropped.
pub struct BluezDiscovery {
   devices: Arc<Subscribers<Device>>,
   pump: JoinHandle<()>,
}

impl BluezDiscovery {
   fn spawn(
      adapter: bluer::Adapter,
      events: impl Stream<Item = AdapterEvent> + Send + 'static,
   ) -> Arc<Self> {
      let devices = Arc::new(Subscribers::default());
      let pump = tokio::spawn(Self::pump(adapter, events, devices.clone()));
      Arc::new(Self { devices, pump })
   }

   async fn pump(
      adapter: bluer::Adapter,
      events: impl Stream<Item = AdapterEvent> + Send + 'static,
      devices: Arc<Subscribers<Device>>,
   ) {
      let mut events = pin!(events);
      while let Some(event) = events.next().await {
         if let AdapterEvent::DeviceAdded(addr) = event {
            match describe_device(&adapter, addr).await {
               Ok(device) => devices.publish(&device),
               Err(e) => debug!("Skipping device {addr}: {e}"),
            }
         }
      }
   }

   fn stop(&self) {
      self.pump.abort();
   }
}

impl Drop for BluezDiscovery {
   fn drop(&mut self) {
      self.pump.abort();
   }
}

impl DiscoveryHandle for BluezDiscovery {
   fn devices_found(&self) -> EventStream<Device> {
      self.devices.subscribe()
   }
}

async fn describe_device(adapter: &bluer::Adapter, addr: Address) -> Result<Device> {
   let remote = adapter.device(addr)?;
   let mut device = Device::new(addr.to_string());
   device.name = remote.name().await?.map(SmolStr::from);
   device.class = remote.class().await?;
   device.rssi = remote.rssi().await?;
   device.uuids = remote
      .uuids()
      .await?
      .unwrap_or_default()
      .into_iter()
      .collect();
   device.paired = remote.is_paired().await?;
   Ok(device)
}

fn parse_address(address: &str) -> Result<Address> {
   Address::from_str(address).map_err(|_| CoordError::InvalidAddress(address.into()))
}

// === GATT ===

/// Last known connection state per remote address; unknown means
/// disconnected.
#[derive(Default)]
struct ConnectionTracker {
   events: Subscribers<GattServerEvent>,
   connected: Mutex<HashMap<SmolStr, bool>>,
}

impl ConnectionTracker {
   /// Publishes `connectionStateChanged` unless the state is already known.
   fn report(&self, address: &str, connected: bool) {
      let previous = self.connected.lock().insert(address.into(), connected);
      if previous.unwrap_or(false) == connected {
         return;
      }
      debug!("Device {address} connected: {connected}");
      self.events.publish(&GattServerEvent::ConnectionStateChanged {
         address: address.into(),
         connected,
      });
   }
}

/// Connection-level GATT surface of a BlueZ adapter.
///
/// Connection changes are reported whoever initiated them: a monitor task
/// follows the `Connected` property of every device the adapter knows.
/// Local service registration goes through BlueZ's application API, which
/// this server does not drive; those operations report `NotSupported`.
pub struct BluezGattServer {
   adapter: bluer::Adapter,
   tracker: Arc<ConnectionTracker>,
   monitor: JoinHandle<()>,
}

impl BluezGattServer {
   fn new(adapter: bluer::Adapter) -> Self {
      let tracker = Arc::new(ConnectionTracker::default());
      let monitor = tokio::spawn(Self::monitor(adapter.clone(), tracker.clone()));
      Self {
         adapter,
         tracker,
         monitor,
      }
   }

   async fn monitor(adapter: bluer::Adapter, tracker: Arc<ConnectionTracker>) {
      let name = SmolStr::new(adapter.name());
      let (tx, rx) = fmpsc::unbounded();
      let feed = async {
         if let Err(e) = feed_connections(adapter, tx).await {
            warn!("Connection monitor on {name} stopped: {e}");
         }
      };
      tokio::join!(feed, track_connections(rx, &tracker));
      debug!("Connection monitor on {name} ended");
   }
}

impl Drop for BluezGattServer {
   fn drop(&mut self) {
      self.monitor.abort();
   }
}

/// Forwards `Connected` changes of every known and newly added device.
async fn feed_connections(
   adapter: bluer::Adapter,
   tx: fmpsc::UnboundedSender<(Address, bool)>,
) -> Result<()> {
   let mut watched = HashSet::new();
   let mut devices = SelectAll::new();
   for addr in adapter.device_addresses().await? {
      watch_device(&adapter, addr, &mut watched, &mut devices).await;
   }

   let events = adapter.events().await?;
   let mut events = pin!(events);
   loop {
      tokio::select! {
         Some(event) = events.next() => match event {
            AdapterEvent::DeviceAdded(addr) => {
               watch_device(&adapter, addr, &mut watched, &mut devices).await;
            },
            AdapterEvent::DeviceRemoved(addr) => {
               watched.remove(&addr);
               if tx.unbounded_send((addr, false)).is_err() {
                  break;
               }
            },
            _ => {},
         },
         Some((addr, event)) = devices.next(), if !devices.is_empty() => {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) = event {
               if tx.unbounded_send((addr, connected)).is_err() {
                  break;
               }
            }
         },
         else => break,
      }
   }
   Ok(())
}

async fn watch_device(
   adapter: &bluer::Adapter,
   addr: Address,
   watched: &mut HashSet<Address>,
   devices: &mut SelectAll<BoxStream<'static, (Address, DeviceEvent)>>,
) {
   if !watched.insert(addr) {
      return;
   }
   let events = match adapter.device(addr) {
      Ok(device) => device.events().await,
      Err(e) => Err(e),
   };
   match events {
      Ok(events) => devices.push(events.map(move |event| (addr, event)).boxed()),
      Err(e) => {
         watched.remove(&addr);
         debug!("Cannot follow device {addr}: {e}");
      },
   }
}

async fn track_connections(
   changes: impl Stream<Item = (Address, bool)>,
   tracker: &ConnectionTracker,
) {
   let mut changes = pin!(changes);
   while let Some((addr, connected)) = changes.next().await {
      tracker.report(&addr.to_string(), connected);
   }
}

#[async_trait]
impl GattServer for BluezGattServer {
   fn events(&self) -> EventStream<GattServerEvent> {
      self.tracker.events.subscribe()
   }

   async fn connect(&self, address: &str) -> Result<()> {
      let addr = parse_address(address)?;
      self.adapter.device(addr)?.connect().await?;
      self.tracker.report(&addr.to_string(), true);
      Ok(())
   }

   async fn disconnect(&self, address: &str) -> Result<()> {
      let addr = parse_address(address)?;
      self.adapter.device(addr)?.disconnect().await?;
      self.tracker.report(&addr.to_string(), false);
      Ok(())
   }

   async fn add_service(&self, _service: GattService) -> Result<()> {
      Err(CoordError::NotSupported("adding local GATT services"))
   }

   async fn remove_service(&self, _service: &GattService) -> Result<()> {
      Err(CoordError::NotSupported("removing local GATT services"))
   }

   async fn notify_characteristic_changed(
      &self,
      _address: &str,
      _characteristic: Uuid,
      _instance_id: u32,
      _confirm: bool,
   ) -> Result<()> {
      Err(CoordError::NotSupported("characteristic notifications"))
   }

   async fn send_response(
      &self,
      _address: &str,
      _status: u16,
      _request_id: u32,
      _value: &[u8],
   ) -> Result<()> {
      Err(CoordError::NotSupported("attribute responses"))
   }
}
