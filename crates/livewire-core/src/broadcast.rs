//! Typed broadcast on top of a managed channel.
//!
//! Handlers live in a registry keyed by event name that outlives any single
//! handle. Each time the manager exposes a new handle, one dispatcher per
//! event name is wired onto it; the "wired-for" marker remembers which handle
//! that was, so wiring again for the same handle is a no-op.

use crate::channel::{ChannelManager, ChannelOptions, ChannelStatus, Generation};
use livewire_transport::{HandleId, Transport, TransportError};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{trace, warn};

/// Receives raw inbound payloads.
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

type Registry = Arc<RwLock<HashMap<String, EventHandler>>>;

/// Send errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No handle, or the handle is not connected.
    #[error("Channel not connected (status: {status})")]
    NotConnected {
        /// Status at the time of the attempt.
        status: ChannelStatus,
    },

    /// The transport reported a delivery failure.
    #[error("Failed to send '{event}': {source}")]
    Delivery {
        /// Event name.
        event: String,
        /// Transport error.
        #[source]
        source: TransportError,
    },

    /// The payload could not be serialized.
    #[error("Failed to encode '{event}' payload: {source}")]
    Encode {
        /// Event name.
        event: String,
        /// Serialization error.
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Default)]
struct WiredFor {
    handle: Option<HandleId>,
    events: HashSet<String>,
}

/// Named-event send/receive on one managed channel.
pub struct Broadcast {
    channel: ChannelManager,
    registry: Registry,
    wired: Mutex<WiredFor>,
}

impl Broadcast {
    /// Create a detached facade.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, options: ChannelOptions) -> Self {
        Self {
            channel: ChannelManager::new(transport, options),
            registry: Arc::new(RwLock::new(HashMap::new())),
            wired: Mutex::new(WiredFor::default()),
        }
    }

    /// Attach to `name` and wire every registered handler onto the new handle.
    pub async fn attach(&mut self, name: impl AsRef<str>) {
        self.attach_with(name, |_| {}).await;
    }

    /// Like [`attach`](Self::attach), running `prepare` after the handlers are
    /// wired and before the handle subscribes.
    pub async fn attach_with(&mut self, name: impl AsRef<str>, prepare: impl FnOnce(&Generation)) {
        let (registry, wired) = (&self.registry, &self.wired);
        self.channel
            .attach_with(name, |generation| {
                wire(registry, wired, generation);
                prepare(generation);
            })
            .await;
    }

    /// Release the current handle.
    pub async fn detach(&mut self) {
        self.channel.detach().await;
    }

    /// Publish one event.
    ///
    /// # Errors
    ///
    /// Fails with [`ChannelError::NotConnected`] when no handle is connected,
    /// [`ChannelError::Encode`] when the payload cannot be serialized, and
    /// [`ChannelError::Delivery`] when the transport rejects the send.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        event: &str,
        payload: &T,
    ) -> Result<(), ChannelError> {
        let value = serde_json::to_value(payload).map_err(|source| ChannelError::Encode {
            event: event.to_string(),
            source,
        })?;
        self.send_value(event, value).await
    }

    /// Publish one event with an already-built payload.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_value(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        let status = self.channel.status();
        let handle = match self.channel.handle() {
            Some(handle) if status.is_connected() => handle,
            _ => return Err(ChannelError::NotConnected { status }),
        };

        trace!(channel = %handle.topic(), event = %event, "Sending");
        handle
            .send(event, payload)
            .await
            .map_err(|source| ChannelError::Delivery {
                event: event.to_string(),
                source,
            })
    }

    /// Register a typed handler for `event`, replacing any previous one.
    ///
    /// Payloads that fail to decode into `T` are logged and dropped.
    pub fn on<T, F>(&self, event: &str, handler: F)
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let name = event.to_string();
        self.on_raw(event, move |payload| match serde_json::from_value::<T>(payload) {
            Ok(decoded) => handler(decoded),
            Err(e) => warn!(event = %name, error = %e, "Dropping undecodable payload"),
        });
    }

    /// Register a raw handler for `event`, replacing any previous one.
    pub fn on_raw(&self, event: &str, handler: impl Fn(Value) + Send + Sync + 'static) {
        self.registry
            .write()
            .insert(event.to_string(), Arc::new(handler));
        self.wire();
    }

    /// Remove the handler for `event`.
    pub fn off(&self, event: &str) -> bool {
        self.registry.write().remove(event).is_some()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.channel.status()
    }

    /// Stream of status values.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.channel.watch_status()
    }

    /// The underlying manager.
    #[must_use]
    pub fn channel(&self) -> &ChannelManager {
        &self.channel
    }

    fn wire(&self) {
        if let Some(generation) = self.channel.generation() {
            wire(&self.registry, &self.wired, &generation);
        }
    }
}

/// Wire registered events onto `generation`, once per handle.
fn wire(registry: &Registry, wired: &Mutex<WiredFor>, generation: &Generation) {
    let mut wired = wired.lock();
    if wired.handle != Some(generation.id()) {
        wired.handle = Some(generation.id());
        wired.events.clear();
    }

    let events: Vec<String> = registry.read().keys().cloned().collect();
    for event in events {
        if wired.events.insert(event.clone()) {
            wire_event(registry, generation, event);
        }
    }
}

fn wire_event(registry: &Registry, generation: &Generation, event: String) {
    let registry = Arc::clone(registry);
    let liveness = Arc::clone(generation.liveness());
    let name = event.clone();
    generation.handle().on_broadcast(
        &event,
        Arc::new(move |payload| {
            if !liveness.is_live() {
                return;
            }
            let handler = registry.read().get(&name).cloned();
            if let Some(handler) = handler {
                handler(payload);
            }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_for_status, StubTransport};
    use livewire_transport::{MemoryHub, Principal};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Delta {
        title: String,
    }

    async fn connected(hub: &MemoryHub, name: &str) -> Broadcast {
        let mut broadcast =
            Broadcast::new(hub.transport(Principal::Anonymous), ChannelOptions::default());
        broadcast.attach(name).await;
        wait_for_status(&broadcast.watch_status(), ChannelStatus::Connected).await;
        broadcast
    }

    fn counter() -> (Arc<Mutex<Vec<Value>>>, impl Fn(Value) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |payload| sink.lock().push(payload))
    }

    #[tokio::test]
    async fn test_send_without_handle_fails() {
        let hub = MemoryHub::new();
        let broadcast =
            Broadcast::new(hub.transport(Principal::Anonymous), ChannelOptions::default());

        assert!(matches!(
            broadcast.send("delta", &json!({})).await,
            Err(ChannelError::NotConnected {
                status: ChannelStatus::Disconnected
            })
        ));
        assert_eq!(hub.published_count(), 0);
    }

    #[tokio::test]
    async fn test_typed_send_and_receive() {
        let hub = MemoryHub::new();
        let sender = connected(&hub, "live:doc:1").await;
        let receiver = connected(&hub, "live:doc:1").await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        receiver.on("delta", move |delta: Delta| sink.lock().push(delta));

        sender.send("delta", &json!({"title": "Hello"})).await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![Delta {
                title: "Hello".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_handlers_for_different_events_coexist() {
        let hub = MemoryHub::new();
        let sender = connected(&hub, "live:doc:1").await;
        let receiver = connected(&hub, "live:doc:1").await;

        let (deltas, on_delta) = counter();
        let (snapshots, on_snapshot) = counter();
        receiver.on_raw("delta", on_delta);
        receiver.on_raw("snapshot", on_snapshot);

        sender.send("delta", &1).await.unwrap();
        sender.send("snapshot", &2).await.unwrap();

        assert_eq!(*deltas.lock(), vec![json!(1)]);
        assert_eq!(*snapshots.lock(), vec![json!(2)]);
    }

    #[tokio::test]
    async fn test_re_registration_does_not_duplicate_delivery() {
        let hub = MemoryHub::new();
        let sender = connected(&hub, "live:doc:1").await;
        let mut receiver = connected(&hub, "live:doc:1").await;

        let (seen, handler) = counter();
        let handler = Arc::new(handler);
        for _ in 0..3 {
            let handler = Arc::clone(&handler);
            receiver.on_raw("delta", move |payload| handler(payload));
        }

        sender.send("delta", &"once").await.unwrap();
        assert_eq!(seen.lock().len(), 1);

        // A new handle generation gets exactly one dispatcher too.
        receiver.attach("live:doc:1").await;
        wait_for_status(&receiver.watch_status(), ChannelStatus::Connected).await;
        sender.send("delta", &"twice").await.unwrap();
        assert_eq!(*seen.lock(), vec![json!("once"), json!("twice")]);
    }

    #[tokio::test]
    async fn test_dispatchers_wired_before_subscribe() {
        let transport = StubTransport::new();
        let mut broadcast = Broadcast::new(transport.clone(), ChannelOptions::default());
        broadcast.on_raw("snapshot", |_| {});
        broadcast.attach("live:doc:1").await;

        let handle = transport.last();
        assert_eq!(handle.broadcast_events(), vec![("snapshot".to_string(), false)]);

        let mut seen_at_prepare = Vec::new();
        broadcast
            .attach_with("live:doc:2", |_| seen_at_prepare = transport.last().broadcast_events())
            .await;
        assert_eq!(seen_at_prepare, vec![("snapshot".to_string(), false)]);
        assert!(transport.last().is_subscribed());
        let handle = transport.last();

        // Handlers registered while attached are wired straight away.
        broadcast.on_raw("delta", |_| {});
        assert_eq!(
            handle.broadcast_events(),
            vec![("snapshot".to_string(), false), ("delta".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_off_stops_delivery() {
        let hub = MemoryHub::new();
        let sender = connected(&hub, "live:doc:1").await;
        let receiver = connected(&hub, "live:doc:1").await;

        let (seen, handler) = counter();
        receiver.on_raw("delta", handler);
        assert!(receiver.off("delta"));
        assert!(!receiver.off("delta"));

        sender.send("delta", &1).await.unwrap();
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dropped() {
        let hub = MemoryHub::new();
        let sender = connected(&hub, "live:doc:1").await;
        let receiver = connected(&hub, "live:doc:1").await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        receiver.on("delta", move |delta: Delta| sink.lock().push(delta));

        sender.send("delta", &json!({"wrong": true})).await.unwrap();
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported() {
        let hub = MemoryHub::new();
        let sender = connected(&hub, "live:doc:1").await;
        hub.set_fail_sends(true);

        match sender.send("delta", &1).await {
            Err(ChannelError::Delivery { event, .. }) => assert_eq!(event, "delta"),
            other => panic!("Expected Delivery error, got {:?}", other),
        }
    }
}
