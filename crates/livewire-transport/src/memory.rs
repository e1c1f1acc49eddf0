//! In-process transport.
//!
//! [`MemoryHub`] behaves like a small managed pub/sub service living inside the
//! process: channels are joined asynchronously, broadcasts reach every other
//! joined handle on the same topic, and presence is grouped by presence key
//! with `join`/`leave` followed by a `sync` after every change.
//!
//! The hub also exposes knobs to make the service misbehave (rejected joins,
//! joins that never complete, failing sends) and to inject raw status changes.

use crate::traits::{
    BroadcastCallback, ChannelConfig, ChannelHandle, Connector, HandleId, PresenceCallback,
    PresenceEvent, PresenceEventKind, PresenceSnapshot, Principal, StatusCallback, Transport,
    TransportError, TransportStatus,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// How the hub answers a subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscribeBehavior {
    /// Join and report `Subscribed`.
    #[default]
    Subscribe,
    /// Report a channel error.
    Error,
    /// Never answer.
    Never,
}

/// One tracked presence state.
struct Tracked {
    handle: HandleId,
    key: String,
    state: Value,
}

/// Topic entry: joined handles and their presence.
#[derive(Default)]
struct TopicEntry {
    members: HashMap<HandleId, Weak<MemoryChannel>>,
    presences: Vec<Tracked>,
}

impl TopicEntry {
    fn is_empty(&self) -> bool {
        self.members.is_empty() && self.presences.is_empty()
    }
}

#[derive(Default)]
struct HubInner {
    /// Topics indexed by name.
    topics: DashMap<String, TopicEntry>,
    /// Every handle that has not been released yet.
    channels: DashMap<HandleId, Weak<MemoryChannel>>,
    subscribe_behavior: RwLock<SubscribeBehavior>,
    fail_sends: AtomicBool,
    service_keys: RwLock<HashSet<String>>,
    published: AtomicU64,
}

impl HubInner {
    /// Joined handles on `topic`, optionally skipping one.
    fn members_of(&self, topic: &str, except: Option<HandleId>) -> Vec<Arc<MemoryChannel>> {
        self.topics
            .get(topic)
            .map(|entry| {
                entry
                    .members
                    .iter()
                    .filter(|(id, _)| Some(**id) != except)
                    .filter_map(|(_, member)| member.upgrade())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn snapshot(&self, topic: &str) -> PresenceSnapshot {
        let mut snapshot = PresenceSnapshot::new();
        if let Some(entry) = self.topics.get(topic) {
            for tracked in &entry.presences {
                snapshot
                    .entry(tracked.key.clone())
                    .or_default()
                    .push(tracked.state.clone());
            }
        }
        snapshot
    }

    fn notify_presence(&self, topic: &str, event: &PresenceEvent) {
        for member in self.members_of(topic, None) {
            member.dispatch_presence(event);
        }
    }

    /// Remove a handle from its topic, returning its presence if it had one.
    fn leave(&self, topic: &str, id: HandleId) -> Option<Tracked> {
        let mut entry = self.topics.get_mut(topic)?;
        entry.members.remove(&id);
        let left = entry
            .presences
            .iter()
            .position(|t| t.handle == id)
            .map(|pos| entry.presences.remove(pos));
        let empty = entry.is_empty();
        drop(entry); // Release the lock

        if empty {
            self.topics.remove_if(topic, |_, e| e.is_empty());
            debug!(channel = %topic, "Deleted empty topic");
        }
        left
    }

    fn announce_leave(&self, topic: &str, left: Tracked) {
        self.notify_presence(
            topic,
            &PresenceEvent::Leave {
                key: left.key,
                left_presences: vec![left.state],
            },
        );
        self.notify_presence(topic, &PresenceEvent::Sync);
    }
}

/// An in-process pub/sub service.
///
/// Cloning the hub is cheap; clones share all state.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `key` as a service key.
    #[must_use]
    pub fn with_service_key(self, key: impl Into<String>) -> Self {
        self.add_service_key(key);
        self
    }

    /// Accept `key` as a service key.
    pub fn add_service_key(&self, key: impl Into<String>) {
        self.inner.service_keys.write().insert(key.into());
    }

    /// Change how future subscribe requests are answered.
    pub fn set_subscribe_behavior(&self, behavior: SubscribeBehavior) {
        *self.inner.subscribe_behavior.write() = behavior;
    }

    /// Make every send fail (or succeed again).
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Open a session without going through [`Connector::connect`].
    #[must_use]
    pub fn transport(&self, principal: Principal) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            hub: Arc::clone(&self.inner),
            principal,
        })
    }

    /// Number of successful broadcasts since the hub was created.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Number of handles opened and not yet released.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.inner
            .channels
            .iter()
            .filter(|c| c.value().strong_count() > 0)
            .count()
    }

    /// Number of joined handles on `topic`.
    #[must_use]
    pub fn member_count(&self, topic: &str) -> usize {
        self.inner.members_of(topic, None).len()
    }

    /// Number of live topics.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.inner.topics.len()
    }

    /// Authoritative presence state of `topic`.
    #[must_use]
    pub fn presence_state(&self, topic: &str) -> PresenceSnapshot {
        self.inner.snapshot(topic)
    }

    /// Deliver a raw status to the subscriber of handle `id`.
    ///
    /// Returns `false` if the handle is unknown or already released.
    pub fn emit_status(&self, id: HandleId, status: TransportStatus) -> bool {
        let channel = self.inner.channels.get(&id).and_then(|c| c.upgrade());
        match channel {
            Some(channel) => {
                channel.emit_status(status);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Connector for MemoryHub {
    async fn connect(&self, principal: &Principal) -> Result<Arc<dyn Transport>, TransportError> {
        match principal {
            Principal::Service { key } if !self.inner.service_keys.read().contains(key) => {
                warn!("Rejected unknown service key");
                return Err(TransportError::Unauthorized("unknown service key".into()));
            }
            Principal::User { token } if token.is_empty() => {
                return Err(TransportError::Unauthorized("empty session token".into()));
            }
            _ => {}
        }
        Ok(self.transport(principal.clone()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// A session on a [`MemoryHub`].
struct MemoryTransport {
    hub: Arc<HubInner>,
    principal: Principal,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn channel(&self, name: &str, config: ChannelConfig) -> Arc<dyn ChannelHandle> {
        let authorized = !config.private || self.principal != Principal::Anonymous;
        let channel = Arc::new_cyclic(|this| MemoryChannel {
            id: HandleId::generate(),
            topic: name.to_string(),
            config,
            authorized,
            hub: Arc::clone(&self.hub),
            this: this.clone(),
            state: Mutex::new(ChannelState::default()),
            broadcast_handlers: Mutex::new(HashMap::new()),
            presence_handlers: Mutex::new(HashMap::new()),
        });
        self.hub
            .channels
            .insert(channel.id, Arc::downgrade(&channel));
        trace!(channel = %name, handle = %channel.id, "Opened memory channel");
        channel
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[derive(Default)]
struct ChannelState {
    joined: bool,
    closed: bool,
    status_callback: Option<StatusCallback>,
}

/// A handle on a [`MemoryHub`] topic.
pub struct MemoryChannel {
    id: HandleId,
    topic: String,
    config: ChannelConfig,
    authorized: bool,
    hub: Arc<HubInner>,
    this: Weak<MemoryChannel>,
    state: Mutex<ChannelState>,
    broadcast_handlers: Mutex<HashMap<String, Vec<BroadcastCallback>>>,
    presence_handlers: Mutex<HashMap<PresenceEventKind, Vec<PresenceCallback>>>,
}

impl MemoryChannel {
    /// Invoke the status callback, if one is registered.
    pub fn emit_status(&self, status: TransportStatus) {
        let callback = self.state.lock().status_callback.clone();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    fn presence_key(&self) -> String {
        self.config
            .presence_key
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    fn is_joined(&self) -> bool {
        self.state.lock().joined
    }

    fn join(&self) {
        {
            let mut state = self.state.lock();
            if state.closed || state.joined {
                return;
            }
            state.joined = true;
        }

        self.hub
            .topics
            .entry(self.topic.clone())
            .or_default()
            .members
            .insert(self.id, self.this.clone());

        debug!(channel = %self.topic, handle = %self.id, "Joined");
        self.emit_status(TransportStatus::Subscribed);
        self.dispatch_presence(&PresenceEvent::Sync);
    }

    fn deliver(&self, event: &str, payload: &Value) {
        let handlers = self
            .broadcast_handlers
            .lock()
            .get(event)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(payload.clone());
        }
    }

    fn dispatch_presence(&self, event: &PresenceEvent) {
        let handlers = self
            .presence_handlers
            .lock()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(event);
        }
    }
}

#[async_trait]
impl ChannelHandle for MemoryChannel {
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
        {
            let mut state = self.state.lock();
            if state.closed {
                warn!(channel = %self.topic, "Subscribe on a released handle ignored");
                return;
            }
            state.status_callback = Some(callback);
        }

        let behavior = *self.hub.subscribe_behavior.read();
        if behavior == SubscribeBehavior::Never && self.authorized {
            return;
        }

        let this = self.this.clone();
        let authorized = self.authorized;
        tokio::spawn(async move {
            let Some(channel) = this.upgrade() else {
                return;
            };
            if !authorized {
                channel.emit_status(TransportStatus::ChannelError(Some("unauthorized".into())));
                return;
            }
            match behavior {
                SubscribeBehavior::Subscribe => channel.join(),
                SubscribeBehavior::Error => channel.emit_status(TransportStatus::ChannelError(
                    Some("subscription rejected".into()),
                )),
                SubscribeBehavior::Never => {}
            }
        });
    }

    async fn send(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if self.hub.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed(format!(
                "{event} rejected on {}",
                self.topic
            )));
        }
        if !self.is_joined() {
            return Err(TransportError::NotJoined(self.topic.clone()));
        }

        self.hub.published.fetch_add(1, Ordering::SeqCst);
        let peers = self.hub.members_of(&self.topic, Some(self.id));
        trace!(channel = %self.topic, event = %event, recipients = peers.len(), "Broadcast");

        for peer in peers {
            peer.deliver(event, &payload);
        }
        Ok(())
    }

    fn on_broadcast(&self, event: &str, callback: BroadcastCallback) {
        self.broadcast_handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(callback);
    }

    fn on_presence(&self, kind: PresenceEventKind, callback: PresenceCallback) {
        self.presence_handlers
            .lock()
            .entry(kind)
            .or_default()
            .push(callback);
    }

    fn presence_state(&self) -> PresenceSnapshot {
        self.hub.snapshot(&self.topic)
    }

    async fn track(&self, state: Value) -> Result<(), TransportError> {
        if !self.is_joined() {
            return Err(TransportError::NotJoined(self.topic.clone()));
        }

        let key = self.presence_key();
        {
            let mut entry = self.hub.topics.entry(self.topic.clone()).or_default();
            match entry.presences.iter_mut().find(|t| t.handle == self.id) {
                Some(existing) => existing.state = state.clone(),
                None => entry.presences.push(Tracked {
                    handle: self.id,
                    key: key.clone(),
                    state: state.clone(),
                }),
            }
        }

        debug!(channel = %self.topic, key = %key, "Presence tracked");
        self.hub.notify_presence(
            &self.topic,
            &PresenceEvent::Join {
                key,
                new_presences: vec![state],
            },
        );
        self.hub.notify_presence(&self.topic, &PresenceEvent::Sync);
        Ok(())
    }

    async fn untrack(&self) -> Result<(), TransportError> {
        let left = self.hub.topics.get_mut(&self.topic).and_then(|mut entry| {
            entry
                .presences
                .iter()
                .position(|t| t.handle == self.id)
                .map(|pos| entry.presences.remove(pos))
        });

        if let Some(left) = left {
            debug!(channel = %self.topic, key = %left.key, "Presence untracked");
            self.hub.announce_leave(&self.topic, left);
        }
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        let callback = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.joined = false;
            state.status_callback.take()
        };

        self.hub.channels.remove(&self.id);
        if let Some(left) = self.hub.leave(&self.topic, self.id) {
            self.hub.announce_leave(&self.topic, left);
        }
        self.broadcast_handlers.lock().clear();
        self.presence_handlers.lock().clear();

        debug!(channel = %self.topic, handle = %self.id, "Unsubscribed");
        if let Some(callback) = callback {
            callback(TransportStatus::Closed);
        }
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if self.state.get_mut().closed {
            return;
        }
        self.hub.channels.remove(&self.id);
        if let Some(left) = self.hub.leave(&self.topic, self.id) {
            self.hub.announce_leave(&self.topic, left);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn status_channel() -> (StatusCallback, mpsc::UnboundedReceiver<TransportStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: StatusCallback = Arc::new(move |status| {
            let _ = tx.send(status);
        });
        (callback, rx)
    }

    async fn joined(
        transport: &Arc<dyn Transport>,
        topic: &str,
        config: ChannelConfig,
    ) -> Arc<dyn ChannelHandle> {
        let handle = transport.channel(topic, config);
        let (callback, mut rx) = status_channel();
        handle.subscribe(callback);
        assert_eq!(rx.recv().await, Some(TransportStatus::Subscribed));
        handle
    }

    #[tokio::test]
    async fn test_broadcast_reaches_other_members() {
        let hub = MemoryHub::new();
        let transport = hub.transport(Principal::Anonymous);

        let a = joined(&transport, "live:doc:1", ChannelConfig::default()).await;
        let b = joined(&transport, "live:doc:1", ChannelConfig::default()).await;
        assert_eq!(hub.member_count("live:doc:1"), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx_b = tx.clone();
        b.on_broadcast(
            "delta",
            Arc::new(move |payload| {
                let _ = tx_b.send(("b", payload));
            }),
        );
        a.on_broadcast(
            "delta",
            Arc::new(move |payload| {
                let _ = tx.send(("a", payload));
            }),
        );

        a.send("delta", json!({"n": 1})).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), ("b", json!({"n": 1})));
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.published_count(), 1);
    }

    #[tokio::test]
    async fn test_send_before_join_fails() {
        let hub = MemoryHub::new();
        let transport = hub.transport(Principal::Anonymous);
        let handle = transport.channel("live:doc:1", ChannelConfig::default());

        assert!(matches!(
            handle.send("delta", json!(null)).await,
            Err(TransportError::NotJoined(_))
        ));
    }

    #[tokio::test]
    async fn test_presence_grouped_by_key() {
        let hub = MemoryHub::new();
        let transport = hub.transport(Principal::Anonymous);

        let a = joined(
            &transport,
            "presence:room:1",
            ChannelConfig::default().with_presence_key("u1"),
        )
        .await;
        let b = joined(
            &transport,
            "presence:room:1",
            ChannelConfig::default().with_presence_key("u1"),
        )
        .await;

        a.track(json!({"tab": "a"})).await.unwrap();
        b.track(json!({"tab": "b"})).await.unwrap();
        a.track(json!({"tab": "a2"})).await.unwrap();

        let state = hub.presence_state("presence:room:1");
        assert_eq!(state.len(), 1);
        assert_eq!(state["u1"], vec![json!({"tab": "a2"}), json!({"tab": "b"})]);

        b.untrack().await.unwrap();
        assert_eq!(a.presence_state()["u1"], vec![json!({"tab": "a2"})]);
    }

    #[tokio::test]
    async fn test_presence_events_follow_track() {
        let hub = MemoryHub::new();
        let transport = hub.transport(Principal::Anonymous);

        let a = joined(&transport, "presence:room:1", ChannelConfig::default()).await;
        let b = joined(
            &transport,
            "presence:room:1",
            ChannelConfig::default().with_presence_key("u2"),
        )
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        for kind in [
            PresenceEventKind::Sync,
            PresenceEventKind::Join,
            PresenceEventKind::Leave,
        ] {
            let tx = tx.clone();
            a.on_presence(
                kind,
                Arc::new(move |event| {
                    let _ = tx.send(event.kind());
                }),
            );
        }

        b.track(json!({})).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), PresenceEventKind::Join);
        assert_eq!(rx.try_recv().unwrap(), PresenceEventKind::Sync);

        b.unsubscribe().await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), PresenceEventKind::Leave);
        assert_eq!(rx.try_recv().unwrap(), PresenceEventKind::Sync);
        assert!(a.presence_state().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_reports_closed_and_cleans_up() {
        let hub = MemoryHub::new();
        let transport = hub.transport(Principal::Anonymous);

        let handle = transport.channel("live:doc:1", ChannelConfig::default());
        let (callback, mut rx) = status_channel();
        handle.subscribe(callback);
        assert_eq!(rx.recv().await, Some(TransportStatus::Subscribed));
        assert_eq!(hub.open_handles(), 1);

        transport.remove_channel(&handle).await.unwrap();
        assert_eq!(rx.recv().await, Some(TransportStatus::Closed));
        assert_eq!(hub.open_handles(), 0);
        assert_eq!(hub.topic_count(), 0);

        // Idempotent.
        handle.unsubscribe().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_error_behavior() {
        let hub = MemoryHub::new();
        hub.set_subscribe_behavior(SubscribeBehavior::Error);
        let transport = hub.transport(Principal::Anonymous);

        let handle = transport.channel("live:doc:1", ChannelConfig::default());
        let (callback, mut rx) = status_channel();
        handle.subscribe(callback);

        assert!(matches!(
            rx.recv().await,
            Some(TransportStatus::ChannelError(_))
        ));
        assert_eq!(hub.member_count("live:doc:1"), 0);
    }

    #[tokio::test]
    async fn test_private_channel_requires_credentials() {
        let hub = MemoryHub::new();
        let transport = hub.transport(Principal::Anonymous);

        let handle = transport.channel("live:doc:1", ChannelConfig::private());
        let (callback, mut rx) = status_channel();
        handle.subscribe(callback);

        assert_eq!(
            rx.recv().await,
            Some(TransportStatus::ChannelError(Some("unauthorized".into())))
        );
    }

    #[tokio::test]
    async fn test_connect_checks_service_keys() {
        let hub = MemoryHub::new().with_service_key("sk-1");

        assert!(hub
            .connect(&Principal::Service { key: "sk-1".into() })
            .await
            .is_ok());
        assert!(matches!(
            hub.connect(&Principal::Service { key: "sk-2".into() }).await,
            Err(TransportError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_sends() {
        let hub = MemoryHub::new();
        let transport = hub.transport(Principal::Anonymous);
        let handle = joined(&transport, "live:doc:1", ChannelConfig::default()).await;

        hub.set_fail_sends(true);
        assert!(matches!(
            handle.send("delta", json!(1)).await,
            Err(TransportError::SendFailed(_))
        ));
        assert_eq!(hub.published_count(), 0);
    }

    #[tokio::test]
    async fn test_emit_status_injection() {
        let hub = MemoryHub::new();
        hub.set_subscribe_behavior(SubscribeBehavior::Never);
        let transport = hub.transport(Principal::Anonymous);

        let handle = transport.channel("live:doc:1", ChannelConfig::default());
        let (callback, mut rx) = status_channel();
        handle.subscribe(callback);

        assert!(hub.emit_status(handle.id(), TransportStatus::TimedOut));
        assert_eq!(rx.recv().await, Some(TransportStatus::TimedOut));
    }
}
