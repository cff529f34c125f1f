//! Bluetooth coordination D-Bus service
//!
//! This daemon binds the platform default adapter, exposes discovery, LE
//! scanning and GATT connection control over D-Bus, and re-publishes every
//! coordinator notification as a D-Bus signal.

use std::{sync::Arc, time::Duration};

use btcoord::{
   AdapterManager, Emitter, GattEvent, ManagerEvent,
   config::Config,
   dbus::{CoordinatorService, OBJECT_PATH},
   error::Result,
};
use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use uuid::Uuid;
use zbus::{Connection, connection, object_server::InterfaceRef};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting btcoord D-Bus service...");

   // Load configuration
   let config = Config::load()?;
   info!("Loaded configuration (backend: {})", config.backend);

   // Route coordinator notifications into the dispatcher queue before the
   // manager binds its first adapter
   let event_bus = EventProcessor::new();
   let events = Arc::new(Emitter::<ManagerEvent>::new());
   event_bus.attach_manager(&events);
   let manager = AdapterManager::init(&config, events).await;
   event_bus.attach_gatt(manager.gatt().events());

   // Create D-Bus service
   let service = CoordinatorService::new(manager.clone());

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(config.bus_name.as_str())?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("btcoord D-Bus service started at {}", config.bus_name);

   // Start event processor
   event_bus.clone().spawn_dispatcher(connection).await?;

   if config.discover_on_start {
      tokio::spawn(discover_on_start(manager.clone(), config.le_scan_services.clone()));
   }

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down btcoord service...");
   manager.safely_stop_discovery().await;
   manager.gatt().uninit();

   Ok(())
}

async fn discover_on_start(manager: AdapterManager, services: Vec<Uuid>) {
   let result = if services.is_empty() {
      manager.safely_start_discovery().await
   } else {
      manager.safely_start_le_scan(&services).await
   };
   if let Err(e) = result {
      warn!("Failed to start discovery on start-up: {e}");
   }
}

enum BusEvent {
   Manager(ManagerEvent),
   Gatt(GattEvent),
}

struct EventProcessor {
   queue: SegQueue<BusEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   fn push(&self, event: BusEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }

   fn attach_manager(self: &Arc<Self>, events: &Emitter<ManagerEvent>) {
      let this = Arc::downgrade(self);
      events.on(move |event| {
         if let Some(this) = this.upgrade() {
            this.push(BusEvent::Manager(event.clone()));
         }
      });
   }

   fn attach_gatt(self: &Arc<Self>, events: &Emitter<GattEvent>) {
      let this = Arc::downgrade(self);
      events.on(move |event| {
         if let Some(this) = this.upgrade() {
            this.push(BusEvent::Gatt(event.clone()));
         }
      });
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<BusEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<CoordinatorService>, event: BusEvent) -> Result<()> {
      match event {
         BusEvent::Manager(event) => CoordinatorService::publish_manager_event(iface, event).await?,
         BusEvent::Gatt(event) => CoordinatorService::publish_gatt_event(iface, event).await?,
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, CoordinatorService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}
