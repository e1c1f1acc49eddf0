//! Presence tracking for Livewire.
//!
//! A [`PresenceReconciler`] keeps a local copy of who is present on a channel.
//! The copy is never patched: every `sync`, `join` and `leave` notification
//! re-reads the transport's authoritative snapshot and replaces it wholesale,
//! so interleaved notifications always converge on the latest snapshot.

use crate::channel::{
    ChannelManager, ChannelOptions, ChannelStatus, DebugLabel, Generation, Liveness,
};
use livewire_transport::{
    ChannelHandle, HandleId, PresenceEvent, PresenceEventKind, PresenceSnapshot, Transport,
    TransportError,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default wait between becoming connected and announcing the initial state.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Presence errors.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// Tracking was attempted without a connected channel.
    #[error("Cannot track: channel not connected (status: {status})")]
    NotConnected {
        /// Status at the time of the attempt.
        status: ChannelStatus,
    },

    /// The state could not be serialized.
    #[error("Failed to encode presence state: {0}")]
    Encode(#[from] serde_json::Error),

    /// The transport rejected the update.
    #[error("Presence update failed: {0}")]
    Transport(#[from] TransportError),
}

/// One peer and every state it contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePeer {
    /// Presence key, usually a user or session id.
    pub key: String,
    /// States in the order the transport reports them.
    pub states: Vec<Value>,
}

/// Options for a [`PresenceReconciler`].
#[derive(Debug, Clone)]
pub struct PresenceOptions {
    /// Presence key for this client. Without one the transport picks a key.
    pub key: Option<String>,
    /// State announced automatically once connected.
    pub state: Option<Value>,
    /// Whether to announce `state` automatically. Defaults to `state.is_some()`.
    pub auto_track: Option<bool>,
    /// Wait between becoming connected and announcing.
    pub settle_delay: Duration,
    /// Options for the underlying channel.
    pub channel: ChannelOptions,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            key: None,
            state: None,
            auto_track: None,
            settle_delay: DEFAULT_SETTLE_DELAY,
            channel: ChannelOptions::default(),
        }
    }
}

impl PresenceOptions {
    /// Set the presence key.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the initial state.
    #[must_use]
    pub fn state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    /// Enable or disable automatic announcement.
    #[must_use]
    pub fn auto_track(mut self, enabled: bool) -> Self {
        self.auto_track = Some(enabled);
        self
    }

    /// Set the settle delay.
    #[must_use]
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the channel options.
    #[must_use]
    pub fn channel(mut self, channel: ChannelOptions) -> Self {
        self.channel = channel;
        self
    }

    fn should_auto_track(&self) -> bool {
        self.state.is_some() && self.auto_track.unwrap_or(true)
    }
}

/// Self-announcement and peer tracking on one managed channel.
pub struct PresenceReconciler {
    channel: ChannelManager,
    initial_state: Option<Value>,
    auto_track: bool,
    settle_delay: Duration,
    peers: Arc<watch::Sender<PresenceSnapshot>>,
    wired_for: Mutex<Option<HandleId>>,
    auto_task: Option<JoinHandle<()>>,
}

impl PresenceReconciler {
    /// Create a detached reconciler.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, options: PresenceOptions) -> Self {
        let auto_track = options.should_auto_track();
        let mut channel_options = options.channel;
        if let Some(key) = options.key {
            channel_options.config.presence_key = Some(key);
        }
        let (peers, _) = watch::channel(PresenceSnapshot::new());

        Self {
            channel: ChannelManager::new(transport, channel_options),
            initial_state: options.state,
            auto_track,
            settle_delay: options.settle_delay,
            peers: Arc::new(peers),
            wired_for: Mutex::new(None),
            auto_task: None,
        }
    }

    /// Attach to `name`, wire presence handlers and arm auto-tracking.
    pub async fn attach(&mut self, name: impl AsRef<str>) {
        self.stop_auto_track();
        self.peers.send_replace(PresenceSnapshot::new());

        let label = self.channel.debug_label_ref();
        let (peers, wired_for) = (&self.peers, &self.wired_for);
        self.channel
            .attach_with(name, |generation| {
                peers.send_replace(PresenceSnapshot::new());
                wire(peers, wired_for, generation, label);
            })
            .await;
        self.start_auto_track();
    }

    /// Release the channel and forget every peer.
    pub async fn detach(&mut self) {
        self.stop_auto_track();
        self.channel.detach().await;
        *self.wired_for.lock() = None;
        self.peers.send_replace(PresenceSnapshot::new());
    }

    /// Announce or replace this client's state.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::NotConnected`] without side effects when the
    /// channel is not connected.
    pub async fn track<T: Serialize + ?Sized>(&self, state: &T) -> Result<(), PresenceError> {
        let handle = self.connected_handle()?;
        let state = serde_json::to_value(state)?;

        if let Some(label) = self.channel.debug_label() {
            debug!(label = %label, state = %state, "Tracking presence");
        }
        handle.track(state).await?;
        Ok(())
    }

    /// Withdraw this client's state.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::NotConnected`] when the channel is not connected.
    pub async fn untrack(&self) -> Result<(), PresenceError> {
        let handle = self.connected_handle()?;
        handle.untrack().await?;
        Ok(())
    }

    /// Whether `key` is present with at least one state. Keys match exactly.
    #[must_use]
    pub fn is_online(&self, key: &str) -> bool {
        self.peers
            .borrow()
            .get(key)
            .is_some_and(|states| !states.is_empty())
    }

    /// Every peer, ordered by key.
    #[must_use]
    pub fn peers(&self) -> Vec<PresencePeer> {
        self.peers
            .borrow()
            .iter()
            .map(|(key, states)| PresencePeer {
                key: key.clone(),
                states: states.clone(),
            })
            .collect()
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn peers_count(&self) -> usize {
        self.peers.borrow().len()
    }

    /// The last snapshot received from the transport.
    #[must_use]
    pub fn raw_state(&self) -> PresenceSnapshot {
        self.peers.borrow().clone()
    }

    /// Stream of snapshots.
    #[must_use]
    pub fn watch_peers(&self) -> watch::Receiver<PresenceSnapshot> {
        self.peers.subscribe()
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

    fn connected_handle(&self) -> Result<Arc<dyn ChannelHandle>, PresenceError> {
        let status = self.channel.status();
        match self.channel.handle() {
            Some(handle) if status.is_connected() => Ok(handle),
            _ => {
                if let Some(label) = self.channel.debug_label() {
                    debug!(label = %label, status = %status, "Cannot track: channel not connected");
                }
                Err(PresenceError::NotConnected { status })
            }
        }
    }

    fn start_auto_track(&mut self) {
        if !self.auto_track {
            return;
        }
        let (Some(state), Some(generation)) =
            (self.initial_state.clone(), self.channel.generation())
        else {
            return;
        };

        let status = self.channel.watch_status();
        let delay = self.settle_delay;
        let label = self.channel.debug_label_ref();
        self.auto_task = Some(tokio::spawn(auto_track_loop(
            status, generation, state, delay, label,
        )));
    }

    fn stop_auto_track(&mut self) {
        if let Some(task) = self.auto_task.take() {
            task.abort();
        }
    }
}

impl Drop for PresenceReconciler {
    fn drop(&mut self) {
        self.stop_auto_track();
    }
}

/// Register `sync`/`join`/`leave` handlers, once per handle generation.
fn wire(
    peers: &Arc<watch::Sender<PresenceSnapshot>>,
    wired_for: &Mutex<Option<HandleId>>,
    generation: &Generation,
    label: DebugLabel,
) {
    {
        let mut wired_for = wired_for.lock();
        if *wired_for == Some(generation.id()) {
            return;
        }
        *wired_for = Some(generation.id());
    }

    if let Some(label) = label.get() {
        debug!(label = %label, "Registering presence handlers");
    }

    let handle = Arc::downgrade(generation.handle());
    for kind in [
        PresenceEventKind::Sync,
        PresenceEventKind::Join,
        PresenceEventKind::Leave,
    ] {
        let refresh = Refresh {
            handle: Weak::clone(&handle),
            liveness: Arc::clone(generation.liveness()),
            peers: Arc::clone(peers),
            label: label.clone(),
        };
        generation
            .handle()
            .on_presence(kind, Arc::new(move |event| refresh.apply(event)));
    }
}

/// Re-reads the snapshot for one generation.
struct Refresh {
    handle: Weak<dyn ChannelHandle>,
    liveness: Arc<Liveness>,
    peers: Arc<watch::Sender<PresenceSnapshot>>,
    label: DebugLabel,
}

impl Refresh {
    fn apply(&self, event: &PresenceEvent) {
        let Some(handle) = self.handle.upgrade() else {
            return;
        };

        // Fetch and publish under the liveness lock so refreshes never
        // overwrite a newer snapshot with an older one.
        let published = self.liveness.run_if_live(|| {
            let snapshot = handle.presence_state();
            let peers = snapshot.len();
            self.peers.send_replace(snapshot);
            peers
        });
        let (Some(peers), Some(label)) = (published, self.label.get()) else {
            return;
        };

        match event {
            PresenceEvent::Sync => {
                debug!(label = %label, peers, "Presence sync");
            }
            PresenceEvent::Join { key, new_presences } => {
                debug!(label = %label, key = %key, joined = new_presences.len(), peers, "Presence join");
            }
            PresenceEvent::Leave {
                key,
                left_presences,
            } => {
                debug!(label = %label, key = %key, left = left_presences.len(), peers, "Presence leave");
            }
        }
    }
}

/// Announce `state` each time the channel settles into `Connected`.
async fn auto_track_loop(
    mut status: watch::Receiver<ChannelStatus>,
    generation: Generation,
    state: Value,
    delay: Duration,
    label: DebugLabel,
) {
    loop {
        if status.wait_for(|s| s.is_connected()).await.is_err() {
            return;
        }
        tokio::time::sleep(delay).await;

        let connected = status.borrow().is_connected();
        if !generation.is_live() {
            return;
        }
        if connected {
            if let Some(label) = label.get() {
                debug!(label = %label, "Auto-tracking presence state");
            }
            if let Err(e) = generation.handle().track(state.clone()).await {
                warn!(channel = %generation.handle().topic(), error = %e, "Auto-track failed");
            }
        }

        if status.wait_for(|s| !s.is_connected()).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_for_status, StubTransport};
    use livewire_transport::{MemoryHub, Principal, TransportStatus};
    use serde_json::json;

    const ROOM: &str = "presence:room:general";

    async fn wait_for_peers(reconciler: &PresenceReconciler, count: usize) {
        let mut rx = reconciler.watch_peers();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.len() == count))
            .await
            .expect("presence wait timed out")
            .expect("presence sender dropped");
    }

    async fn joined(hub: &MemoryHub, options: PresenceOptions) -> PresenceReconciler {
        let mut reconciler = PresenceReconciler::new(hub.transport(Principal::Anonymous), options);
        reconciler.attach(ROOM).await;
        wait_for_status(&reconciler.watch_status(), ChannelStatus::Connected).await;
        reconciler
    }

    fn snapshot(entries: &[(&str, Value)]) -> PresenceSnapshot {
        entries
            .iter()
            .map(|(key, state)| (key.to_string(), vec![state.clone()]))
            .collect()
    }

    fn tab(key: &str, name: &str) -> PresenceOptions {
        PresenceOptions::default()
            .key(key)
            .state(json!({ "tab": name }))
            .settle_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_keys_match_exactly() {
        let hub = MemoryHub::new();
        let a = joined(&hub, tab("u1:tabA", "A")).await;
        let b = joined(&hub, tab("u1:tabB", "B")).await;

        wait_for_peers(&a, 2).await;
        wait_for_peers(&b, 2).await;

        assert_eq!(a.peers_count(), 2);
        assert!(a.is_online("u1:tabA"));
        assert!(a.is_online("u1:tabB"));
        assert!(!a.is_online("u1"));
        assert_eq!(
            a.peers(),
            vec![
                PresencePeer {
                    key: "u1:tabA".into(),
                    states: vec![json!({"tab": "A"})],
                },
                PresencePeer {
                    key: "u1:tabB".into(),
                    states: vec![json!({"tab": "B"})],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_peers_converge_on_leave() {
        let hub = MemoryHub::new();
        let a = joined(&hub, tab("u1", "A")).await;
        let mut b = joined(&hub, tab("u2", "B")).await;
        wait_for_peers(&a, 2).await;

        b.detach().await;
        wait_for_peers(&a, 1).await;

        assert_eq!(a.raw_state(), hub.presence_state(ROOM));
        assert!(!a.is_online("u2"));
        assert_eq!(b.peers_count(), 0);
    }

    #[tokio::test]
    async fn test_track_rejected_while_disconnected() {
        let hub = MemoryHub::new();
        let reconciler =
            PresenceReconciler::new(hub.transport(Principal::Anonymous), tab("u1", "A"));

        assert!(matches!(
            reconciler.track(&json!({"status": "away"})).await,
            Err(PresenceError::NotConnected {
                status: ChannelStatus::Disconnected
            })
        ));
        assert!(hub.presence_state(ROOM).is_empty());
    }

    #[tokio::test]
    async fn test_manual_track_without_auto_track() {
        let hub = MemoryHub::new();
        let reconciler = joined(&hub, tab("u1", "A").auto_track(false)).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(hub.presence_state(ROOM).is_empty());

        reconciler.track(&json!({"status": "away"})).await.unwrap();
        wait_for_peers(&reconciler, 1).await;
        assert_eq!(
            reconciler.raw_state()["u1"],
            vec![json!({"status": "away"})]
        );

        reconciler.untrack().await.unwrap();
        wait_for_peers(&reconciler, 0).await;
    }

    #[test]
    fn test_no_state_means_no_auto_track() {
        let options = PresenceOptions::default().key("u1");
        assert!(!options.should_auto_track());
        assert!(tab("u1", "A").should_auto_track());
        assert!(!tab("u1", "A").auto_track(false).should_auto_track());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_track_waits_for_settle_delay() {
        let hub = MemoryHub::new();
        let options = tab("u1", "A").settle_delay(DEFAULT_SETTLE_DELAY);
        let reconciler = joined(&hub, options).await;

        assert!(hub.presence_state(ROOM).is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(reconciler.is_online("u1"));
    }

    #[tokio::test]
    async fn test_switching_rooms_resets_peers() {
        let hub = MemoryHub::new();
        let _other = {
            let mut other =
                PresenceReconciler::new(hub.transport(Principal::Anonymous), tab("u9", "Z"));
            other.attach("presence:room:other").await;
            wait_for_status(&other.watch_status(), ChannelStatus::Connected).await;
            other
        };
        let mut reconciler = joined(&hub, tab("u1", "A")).await;
        wait_for_peers(&reconciler, 1).await;

        reconciler.attach("presence:room:other").await;
        wait_for_status(&reconciler.watch_status(), ChannelStatus::Connected).await;
        wait_for_peers(&reconciler, 2).await;

        assert!(reconciler.is_online("u9"));
        assert!(reconciler.is_online("u1"));
        assert!(hub.presence_state(ROOM).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_late_joiner_sees_existing_peers() {
        let hub = MemoryHub::new();
        let existing = joined(&hub, tab("u9", "Z")).await;
        wait_for_peers(&existing, 1).await;

        for _ in 0..50 {
            let options = PresenceOptions::default().key("u1").auto_track(false);
            let mut reconciler =
                PresenceReconciler::new(hub.transport(Principal::Anonymous), options);
            reconciler.attach(ROOM).await;
            wait_for_status(&reconciler.watch_status(), ChannelStatus::Connected).await;

            let mut rx = reconciler.watch_peers();
            tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| s.len() == 1))
                .await
                .expect("initial sync was not applied")
                .expect("presence sender dropped");
            assert!(reconciler.is_online("u9"));

            reconciler.detach().await;
        }
    }

    #[tokio::test]
    async fn test_out_of_order_events_converge_on_latest_snapshot() {
        let transport = StubTransport::new();
        let mut reconciler =
            PresenceReconciler::new(transport.clone(), PresenceOptions::default().key("u1"));
        reconciler.attach(ROOM).await;
        let handle = transport.last();
        handle.emit(TransportStatus::Subscribed);
        assert_eq!(handle.presence_handler_count(), 3);

        let latest = snapshot(&[("u1", json!({"tab": "A"})), ("u3", json!({"tab": "C"}))]);
        handle.set_presence(latest.clone());
        handle.emit_presence(PresenceEvent::Sync);

        // u2 already left by the time its join arrives.
        handle.emit_presence(PresenceEvent::Join {
            key: "u2".into(),
            new_presences: vec![json!({"tab": "B"})],
        });
        assert_eq!(reconciler.raw_state(), latest);
        assert!(!reconciler.is_online("u2"));

        // A leave for u3 delivered before the transport dropped it.
        handle.emit_presence(PresenceEvent::Leave {
            key: "u3".into(),
            left_presences: vec![json!({"tab": "C"})],
        });
        assert!(reconciler.is_online("u3"));

        let latest = snapshot(&[("u1", json!({"tab": "A"}))]);
        handle.set_presence(latest.clone());
        handle.emit_presence(PresenceEvent::Sync);
        assert_eq!(reconciler.raw_state(), latest);
        assert_eq!(reconciler.peers_count(), 1);
    }

    #[tokio::test]
    async fn test_superseded_generation_cannot_touch_peers() {
        let transport = StubTransport::new();
        let mut reconciler =
            PresenceReconciler::new(transport.clone(), PresenceOptions::default().key("u1"));
        reconciler.attach(ROOM).await;
        let stale = transport.last();
        stale.emit(TransportStatus::Subscribed);

        reconciler.attach("presence:room:other").await;
        let fresh = transport.last();
        fresh.emit(TransportStatus::Subscribed);
        assert!(stale.is_released());

        let current = snapshot(&[("u9", json!({"tab": "Z"}))]);
        fresh.set_presence(current.clone());
        fresh.emit_presence(PresenceEvent::Sync);

        stale.set_presence(snapshot(&[("u2", json!({"tab": "B"}))]));
        stale.emit_presence(PresenceEvent::Sync);
        stale.emit_presence(PresenceEvent::Join {
            key: "u2".into(),
            new_presences: vec![json!({"tab": "B"})],
        });

        assert_eq!(reconciler.raw_state(), current);
        assert!(!reconciler.is_online("u2"));
        assert_eq!(fresh.presence_handler_count(), 3);
    }
}
