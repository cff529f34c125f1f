//! Event handling system for adapter and GATT notifications.
//!
//! This module provides the subscribe/unsubscribe/fire capability each
//! coordinator composes in, and the typed events they publish.

use std::{
   fmt,
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smol_str::SmolStr;
use tokio::sync::mpsc;

use crate::host::{AdapterRef, AdapterState, AttributeRequest, Device};

/// Identifies a registered listener so it can be removed again.
pub type ListenerId = u64;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Reports that a listener's consumer is gone and the entry can be pruned.
type Closed = Box<dyn Fn() -> bool + Send + Sync>;

struct Entry<E> {
   id: ListenerId,
   once: bool,
   listener: Listener<E>,
   closed: Option<Closed>,
}

impl<E> Entry<E> {
   fn is_closed(&self) -> bool {
      self.closed.as_ref().is_some_and(|closed| closed())
   }
}

/// Synchronous event dispatcher.
///
/// Listeners run on the thread calling [`Emitter::fire`], in subscription
/// order, after the internal lock has been released, so a listener may
/// subscribe or unsubscribe without deadlocking.
pub struct Emitter<E> {
   next_id: AtomicU64,
   entries: Mutex<SmallVec<[Entry<E>; 4]>>,
}

impl<E> Default for Emitter<E> {
   fn default() -> Self {
      Self {
         next_id: AtomicU64::new(1),
         entries: Mutex::new(SmallVec::new()),
      }
   }
}

impl<E> fmt::Debug for Emitter<E> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Emitter")
         .field("listeners", &self.listener_count())
         .finish()
   }
}

impl<E> Emitter<E> {
   pub fn new() -> Self {
      Self::default()
   }

   fn insert(&self, once: bool, listener: Listener<E>, closed: Option<Closed>) -> ListenerId {
      let id = self.next_id.fetch_add(1, Ordering::Relaxed);
      self.entries.lock().push(Entry {
         id,
         once,
         listener,
         closed,
      });
      id
   }

   /// Registers a listener invoked for every fired event.
   pub fn on<F>(&self, listener: F) -> ListenerId
   where
      F: Fn(&E) + Send + Sync + 'static,
   {
      self.insert(false, Arc::new(listener), None)
   }

   /// Registers a listener removed after its first delivery.
   pub fn once<F>(&self, listener: F) -> ListenerId
   where
      F: FnOnce(&E) + Send + 'static,
   {
      let slot = Mutex::new(Some(listener));
      self.insert(
         true,
         Arc::new(move |event: &E| {
            if let Some(listener) = slot.lock().take() {
               listener(event);
            }
         }),
         None,
      )
   }

   /// Removes a listener. Returns `false` if it was not registered.
   pub fn off(&self, id: ListenerId) -> bool {
      let mut entries = self.entries.lock();
      let before = entries.len();
      entries.retain(|e| e.id != id);
      entries.len() != before
   }

   pub fn fire(&self, event: &E) {
      let listeners: SmallVec<[Listener<E>; 4]> = {
         let mut entries = self.entries.lock();
         entries.retain(|e| !e.is_closed());
         let snapshot = entries.iter().map(|e| e.listener.clone()).collect();
         entries.retain(|e| !e.once);
         snapshot
      };
      for listener in listeners {
         listener(event);
      }
   }

   /// Number of registered listeners, not counting subscriptions whose
   /// receiver has been dropped.
   pub fn listener_count(&self) -> usize {
      let mut entries = self.entries.lock();
      entries.retain(|e| !e.is_closed());
      entries.len()
   }
}

impl<E: Clone + Send + 'static> Emitter<E> {
   /// Registers a listener that forwards every event into a channel.
   ///
   /// The listener is dropped once the receiver is.
   pub fn subscribe(&self) -> (ListenerId, mpsc::UnboundedReceiver<E>) {
      let (tx, rx) = mpsc::unbounded_channel();
      let watch = tx.clone();
      let id = self.insert(
         false,
         Arc::new(move |event: &E| {
            let _ = tx.send(event.clone());
         }),
         Some(Box::new(move || watch.is_closed())),
      );
      (id, rx)
   }
}

/// Events published by the adapter manager.
#[derive(Debug, Clone, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ManagerEvent {
   StateChanged(AdapterState),
   Enabled,
   Disabled,
   DiscoveringStateChanged(bool),
   StartDiscovering,
   StopDiscovering,
   DeviceFound(Device),
   DefaultAdapterReady(AdapterRef),
}

impl ManagerEvent {
   /// Published event name, e.g. `state-changed`.
   pub fn name(&self) -> &'static str {
      self.into()
   }
}

/// Connection state of a remote device on the GATT server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
   pub address: SmolStr,
   #[serde(alias = "status")]
   pub connected: bool,
}

/// Events published by the GATT manager.
#[derive(Debug, Clone, PartialEq, Serialize, strum::IntoStaticStr)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum GattEvent {
   ConnectionStateChanged(ConnectionState),
   AttributeReadRequest(AttributeRequest),
   AttributeWriteRequest(AttributeRequest),
}

impl GattEvent {
   pub fn name(&self) -> &'static str {
      self.into()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   use std::sync::atomic::AtomicUsize;

   #[test]
   fn test_on_and_off() {
      let emitter = Emitter::<u32>::new();
      let hits = Arc::new(AtomicUsize::new(0));

      let id = emitter.on({
         let hits = hits.clone();
         move |v| {
            hits.fetch_add(*v as usize, Ordering::Relaxed);
         }
      });
      emitter.fire(&2);
      emitter.fire(&3);
      assert_eq!(hits.load(Ordering::Relaxed), 5);

      assert!(emitter.off(id));
      assert!(!emitter.off(id));
      emitter.fire(&10);
      assert_eq!(hits.load(Ordering::Relaxed), 5);
      assert_eq!(emitter.listener_count(), 0);
   }

   #[test]
   fn test_once_delivers_a_single_event() {
      let emitter = Emitter::<u32>::new();
      let seen = Arc::new(Mutex::new(Vec::new()));

      emitter.once({
         let seen = seen.clone();
         move |v| seen.lock().push(*v)
      });
      assert_eq!(emitter.listener_count(), 1);

      emitter.fire(&1);
      emitter.fire(&2);
      assert_eq!(*seen.lock(), vec![1]);
      assert_eq!(emitter.listener_count(), 0);
   }

   #[test]
   fn test_listeners_run_in_subscription_order() {
      let emitter = Emitter::<()>::new();
      let order = Arc::new(Mutex::new(Vec::new()));
      for i in 0..3 {
         let order = order.clone();
         emitter.on(move |_| order.lock().push(i));
      }
      emitter.fire(&());
      assert_eq!(*order.lock(), vec![0, 1, 2]);
   }

   #[test]
   fn test_listener_may_unsubscribe_itself() {
      let emitter = Arc::new(Emitter::<()>::new());
      let id = Arc::new(AtomicU64::new(0));
      let registered = emitter.on({
         let emitter = Arc::downgrade(&emitter);
         let id = id.clone();
         move |_| {
            if let Some(emitter) = emitter.upgrade() {
               emitter.off(id.load(Ordering::Relaxed));
            }
         }
      });
      id.store(registered, Ordering::Relaxed);

      emitter.fire(&());
      assert_eq!(emitter.listener_count(), 0);
   }

   #[tokio::test]
   async fn test_subscribe_forwards_events() {
      let emitter = Emitter::<ManagerEvent>::new();
      let (_, mut rx) = emitter.subscribe();

      emitter.fire(&ManagerEvent::Enabled);
      emitter.fire(&ManagerEvent::DiscoveringStateChanged(true));

      assert!(matches!(rx.recv().await, Some(ManagerEvent::Enabled)));
      assert!(matches!(
         rx.recv().await,
         Some(ManagerEvent::DiscoveringStateChanged(true))
      ));
   }

   #[test]
   fn test_dropped_subscription_is_pruned() {
      let emitter = Emitter::<u32>::new();
      emitter.on(|_| {});
      let (_, rx) = emitter.subscribe();
      let (_, mut kept) = emitter.subscribe();
      assert_eq!(emitter.listener_count(), 3);

      drop(rx);
      assert_eq!(emitter.listener_count(), 2);

      emitter.fire(&4);
      assert_eq!(kept.try_recv().unwrap(), 4);
      assert_eq!(emitter.listener_count(), 2);
   }

   #[test]
   fn test_event_names() {
      assert_eq!(ManagerEvent::StateChanged(AdapterState::Enabled).name(), "state-changed");
      assert_eq!(ManagerEvent::StartDiscovering.name(), "start-discovering");
      let event = GattEvent::ConnectionStateChanged(ConnectionState {
         address: "AA:BB:CC:DD:EE:FF".into(),
         connected: true,
      });
      assert_eq!(event.name(), "connection-state-changed");
   }

   #[test]
   fn test_connection_state_accepts_status_field() {
      let state: ConnectionState =
         serde_json::from_str(r#"{"address":"AA:BB:CC:DD:EE:FF","status":true}"#).unwrap();
      assert!(state.connected);
      let json = serde_json::to_value(&state).unwrap();
      assert_eq!(json["connected"], true);
   }
}
