//! Shared test helpers.

use crate::channel::ChannelStatus;
use async_trait::async_trait;
use livewire_transport::{
    BroadcastCallback, ChannelConfig, ChannelHandle, HandleId, PresenceCallback, PresenceEvent,
    PresenceEventKind, PresenceSnapshot, StatusCallback, Transport, TransportError,
    TransportStatus,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Wait until `rx` reports `target`.
pub(crate) async fn wait_for_status(rx: &watch::Receiver<ChannelStatus>, target: ChannelStatus) {
    let mut rx = rx.clone();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == target))
        .await
        .expect("status wait timed out")
        .expect("status sender dropped");
}

/// Transport whose handles keep their callbacks after release, so tests can
/// deliver callbacks late or out of order.
#[derive(Default)]
pub(crate) struct StubTransport {
    handles: Mutex<Vec<Arc<StubHandle>>>,
}

impl StubTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn last(&self) -> Arc<StubHandle> {
        self.handles
            .lock()
            .last()
            .cloned()
            .expect("no handle opened")
    }
}

#[async_trait]
impl Transport for StubTransport {
    fn channel(&self, name: &str, config: ChannelConfig) -> Arc<dyn ChannelHandle> {
        let handle = Arc::new(StubHandle {
            id: HandleId::generate(),
            topic: name.to_string(),
            config,
            callback: Mutex::new(None),
            presence: Mutex::new(PresenceSnapshot::new()),
            presence_handlers: Mutex::new(Vec::new()),
            broadcast_events: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        });
        self.handles.lock().push(Arc::clone(&handle));
        handle
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

pub(crate) struct StubHandle {
    id: HandleId,
    topic: String,
    config: ChannelConfig,
    callback: Mutex<Option<StatusCallback>>,
    presence: Mutex<PresenceSnapshot>,
    presence_handlers: Mutex<Vec<(PresenceEventKind, PresenceCallback)>>,
    broadcast_events: Mutex<Vec<(String, bool)>>,
    released: AtomicBool,
}

impl StubHandle {
    pub(crate) fn emit(&self, status: TransportStatus) {
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    /// Replace the snapshot returned by `presence_state`.
    pub(crate) fn set_presence(&self, snapshot: PresenceSnapshot) {
        *self.presence.lock() = snapshot;
    }

    /// Deliver `event` to every presence callback registered for its kind.
    pub(crate) fn emit_presence(&self, event: PresenceEvent) {
        let kind = event.kind();
        let handlers: Vec<PresenceCallback> = self
            .presence_handlers
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub(crate) fn presence_handler_count(&self) -> usize {
        self.presence_handlers.lock().len()
    }

    /// Events with a broadcast callback, and whether each was registered
    /// after the handle subscribed.
    pub(crate) fn broadcast_events(&self) -> Vec<(String, bool)> {
        self.broadcast_events.lock().clone()
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelHandle for StubHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn subscribe(&self, callback: StatusCallback) {
        *self.callback.lock() = Some(callback);
    }

    async fn send(&self, _event: &str, _payload: Value) -> Result<(), TransportError> {
        Ok(())
    }

    fn on_broadcast(&self, event: &str, _callback: BroadcastCallback) {
        let subscribed = self.is_subscribed();
        self.broadcast_events
            .lock()
            .push((event.to_string(), subscribed));
    }

    fn on_presence(&self, kind: PresenceEventKind, callback: PresenceCallback) {
        self.presence_handlers.lock().push((kind, callback));
    }

    fn presence_state(&self) -> PresenceSnapshot {
        self.presence.lock().clone()
    }

    async fn track(&self, _state: Value) -> Result<(), TransportError> {
        Ok(())
    }

    async fn untrack(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}
