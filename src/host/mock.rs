//! Scripted host for tests: records calls and counts live listeners.

use std::{
   collections::VecDeque,
   fmt,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
};

use async_trait::async_trait;
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{
   Adapter, AdapterHost, AdapterRef, AdapterState, Attribute, Device, DiscoveryHandle,
   DiscoveryRef, EventStream, GattServer, GattServerEvent, GattServerRef, GattService,
   Subscribers,
};
use crate::error::{CoordError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
   Enable,
   Disable,
   StartDiscovery,
   StopDiscovery,
   StartLeScan(Vec<Uuid>),
   StopLeScan,
   Connect(SmolStr),
   Disconnect(SmolStr),
   AddService(Uuid),
   SendResponse(u32),
}

#[derive(Default)]
pub struct MockHost {
   default: Mutex<Option<AdapterRef>>,
   attrs: Subscribers<Vec<Attribute>>,
}

impl MockHost {
   pub fn new(adapter: Option<Arc<MockAdapter>>) -> Arc<Self> {
      Arc::new(Self {
         default: Mutex::new(adapter.map(|a| a as AdapterRef)),
         attrs: Subscribers::default(),
      })
   }

   pub fn replace_default(&self, adapter: Option<Arc<MockAdapter>>) {
      *self.default.lock() = adapter.map(|a| a as AdapterRef);
      self.attrs.publish(&vec![Attribute::DefaultAdapter]);
   }

   pub fn listener_count(&self) -> usize {
      self.attrs.count()
   }
}

impl AdapterHost for MockHost {
   fn default_adapter(&self) -> Option<AdapterRef> {
      self.default.lock().clone()
   }

   fn attribute_changes(&self) -> EventStream<Vec<Attribute>> {
      self.attrs.subscribe()
   }
}

pub struct MockAdapter {
   name: SmolStr,
   state: AtomicCell<AdapterState>,
   discovering: AtomicBool,
   attrs: Subscribers<Vec<Attribute>>,
   calls: Mutex<Vec<Call>>,
   fail_stop: AtomicBool,
   fail_enable: AtomicBool,
   start_gates: Mutex<VecDeque<oneshot::Receiver<()>>>,
   sessions: Mutex<Vec<Arc<MockDiscovery>>>,
   gatt: Option<Arc<MockGattServer>>,
}

impl fmt::Debug for MockAdapter {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("MockAdapter").field("name", &self.name).finish()
   }
}

impl MockAdapter {
   pub fn new(name: &str) -> Arc<Self> {
      Self::build(name, AdapterState::Disabled, None)
   }

   pub fn enabled(name: &str) -> Arc<Self> {
      Self::build(name, AdapterState::Enabled, None)
   }

   pub fn with_gatt(name: &str, gatt: Arc<MockGattServer>) -> Arc<Self> {
      Self::build(name, AdapterState::Enabled, Some(gatt))
   }

   fn build(name: &str, state: AdapterState, gatt: Option<Arc<MockGattServer>>) -> Arc<Self> {
      Arc::new(Self {
         name: name.into(),
         state: AtomicCell::new(state),
         discovering: AtomicBool::new(false),
         attrs: Subscribers::default(),
         calls: Mutex::new(Vec::new()),
         fail_stop: AtomicBool::new(false),
         fail_enable: AtomicBool::new(false),
         start_gates: Mutex::new(VecDeque::new()),
         sessions: Mutex::new(Vec::new()),
         gatt,
      })
   }

   /// Reports a state change the way the radio would.
   pub fn report_state(&self, state: AdapterState) {
      self.state.store(state);
      self.attrs.publish(&vec![Attribute::State]);
   }

   pub fn report_discovering(&self, discovering: bool) {
      self.discovering.store(discovering, Ordering::Relaxed);
      self.attrs.publish(&vec![Attribute::Discovering]);
   }

   pub fn fail_stops(&self) {
      self.fail_stop.store(true, Ordering::Relaxed);
   }

   pub fn fail_enables(&self) {
      self.fail_enable.store(true, Ordering::Relaxed);
   }

   /// Holds the next discovery/scan start until the returned sender fires.
   pub fn gate_next_start(&self) -> oneshot::Sender<()> {
      let (tx, rx) = oneshot::channel();
      self.start_gates.lock().push_back(rx);
      tx
   }

   pub fn calls(&self) -> Vec<Call> {
      self.calls.lock().clone()
   }

   pub fn count(&self, call: &Call) -> usize {
      self.calls.lock().iter().filter(|c| *c == call).count()
   }

   pub fn listener_count(&self) -> usize {
      self.attrs.count()
   }

   pub fn sessions(&self) -> Vec<Arc<MockDiscovery>> {
      self.sessions.lock().clone()
   }

   fn record(&self, call: Call) {
      self.calls.lock().push(call);
   }

   async fn open_session(&self) -> DiscoveryRef {
      let gate = self.start_gates.lock().pop_front();
      if let Some(gate) = gate {
         let _ = gate.await;
      }
      let session = Arc::new(MockDiscovery::default());
      self.sessions.lock().push(session.clone());
      session
   }
}

#[async_trait]
impl Adapter for MockAdapter {
   fn name(&self) -> &str {
      &self.name
   }

   fn state(&self) -> AdapterState {
      self.state.load()
   }

   fn discovering(&self) -> bool {
      self.discovering.load(Ordering::Relaxed)
   }

   fn attribute_changes(&self) -> EventStream<Vec<Attribute>> {
      self.attrs.subscribe()
   }

   fn gatt_server(&self) -> Option<GattServerRef> {
      self.gatt.clone().map(|g| g as GattServerRef)
   }

   async fn enable(&self) -> Result<()> {
      self.record(Call::Enable);
      if self.fail_enable.load(Ordering::Relaxed) {
         return Err(CoordError::OperationFailed("enable rejected".into()));
      }
      self.report_state(AdapterState::Enabled);
      Ok(())
   }

   async fn disable(&self) -> Result<()> {
      self.record(Call::Disable);
      self.report_state(AdapterState::Disabled);
      Ok(())
   }

   async fn start_discovery(&self) -> Result<DiscoveryRef> {
      self.record(Call::StartDiscovery);
      Ok(self.open_session().await)
   }

   async fn stop_discovery(&self) -> Result<()> {
      self.record(Call::StopDiscovery);
      if self.fail_stop.load(Ordering::Relaxed) {
         return Err(CoordError::OperationFailed("stop rejected".into()));
      }
      Ok(())
   }

   async fn start_le_scan(&self, services: &[Uuid]) -> Result<DiscoveryRef> {
      self.record(Call::StartLeScan(services.to_vec()));
      Ok(self.open_session().await)
   }

   async fn stop_le_scan(&self, _handle: &DiscoveryRef) -> Result<()> {
      self.record(Call::StopLeScan);
      if self.fail_stop.load(Ordering::Relaxed) {
         return Err(CoordError::OperationFailed("stop rejected".into()));
      }
      Ok(())
   }
}

#[derive(Default)]
pub struct MockDiscovery {
   devices: Subscribers<Device>,
}

impl MockDiscovery {
   pub fn report(&self, device: Device) {
      self.devices.publish(&device);
   }

   pub fn listener_count(&self) -> usize {
      self.devices.count()
   }
}

impl DiscoveryHandle for MockDiscovery {
   fn devices_found(&self) -> EventStream<Device> {
      self.devices.subscribe()
   }
}

#[derive(Default)]
pub struct MockGattServer {
   events: Subscribers<GattServerEvent>,
   calls: Mutex<Vec<Call>>,
   fail_connect: AtomicBool,
}

impl MockGattServer {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn report(&self, event: GattServerEvent) {
      self.events.publish(&event);
   }

   pub fn fail_connects(&self) {
      self.fail_connect.store(true, Ordering::Relaxed);
   }

   pub fn calls(&self) -> Vec<Call> {
      self.calls.lock().clone()
   }

   pub fn listener_count(&self) -> usize {
      self.events.count()
   }
}

#[async_trait]
impl GattServer for MockGattServer {
   fn events(&self) -> EventStream<GattServerEvent> {
      self.events.subscribe()
   }

   async fn connect(&self, address: &str) -> Result<()> {
      self.calls.lock().push(Call::Connect(address.into()));
      if self.fail_connect.load(Ordering::Relaxed) {
         return Err(CoordError::OperationFailed("connect rejected".into()));
      }
      Ok(())
   }

   async fn disconnect(&self, address: &str) -> Result<()> {
      self.calls.lock().push(Call::Disconnect(address.into()));
      Ok(())
   }

   async fn add_service(&self, service: GattService) -> Result<()> {
      self.calls.lock().push(Call::AddService(service.uuid));
      Ok(())
   }

   async fn remove_service(&self, _service: &GattService) -> Result<()> {
      Ok(())
   }

   async fn notify_characteristic_changed(
      &self,
      _address: &str,
      _characteristic: Uuid,
      _instance_id: u32,
      _confirm: bool,
   ) -> Result<()> {
      Ok(())
   }

   async fn send_response(
      &self,
      _address: &str,
      _status: u16,
      request_id: u32,
      _value: &[u8],
   ) -> Result<()> {
      self.calls.lock().push(Call::SendResponse(request_id));
      Ok(())
   }
}
