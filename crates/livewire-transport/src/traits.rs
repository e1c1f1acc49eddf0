//! Transport abstraction traits for Livewire.
//!
//! These traits describe the managed pub/sub service Livewire runs on top of.
//! Implementations deliver messages at least once and keep channel membership
//! eventually consistent; nothing stronger is assumed.

use async_trait::async_trait;
use livewire_protocol::events;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Process-unique identity of one channel handle.
///
/// A new handle is created for every subscription, so the id doubles as the
/// generation marker of whoever owns the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(pub u64);

/// Atomic counter for handle ids.
static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(1);

impl HandleId {
    /// Allocate the next handle id.
    #[must_use]
    pub fn generate() -> Self {
        Self(HANDLE_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch_{:x}", self.0)
    }
}

/// Who a transport session acts on behalf of.
#[derive(Clone, PartialEq, Eq)]
pub enum Principal {
    /// No credentials.
    Anonymous,
    /// An end-user session.
    User {
        /// Session access token.
        token: String,
    },
    /// A trusted backend principal.
    Service {
        /// Service key.
        key: String,
    },
}

impl Principal {
    /// Whether this is a trusted service principal.
    #[must_use]
    pub fn is_service(&self) -> bool {
        matches!(self, Principal::Service { .. })
    }
}

// Credentials never end up in logs.
impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Anonymous => f.write_str("Anonymous"),
            Principal::User { .. } => f.write_str("User { .. }"),
            Principal::Service { .. } => f.write_str("Service { .. }"),
        }
    }
}

/// Per-channel options passed when a handle is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Private channels require an authorized principal.
    pub private: bool,
    /// Key this handle's presence is grouped under.
    pub presence_key: Option<String>,
}

impl ChannelConfig {
    /// Config for a private channel.
    #[must_use]
    pub fn private() -> Self {
        Self {
            private: true,
            ..Self::default()
        }
    }

    /// Set the presence key.
    #[must_use]
    pub fn with_presence_key(mut self, key: impl Into<String>) -> Self {
        self.presence_key = Some(key.into());
        self
    }
}

/// Subscription status as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    /// Joined and ready.
    Subscribed,
    /// The service reported an error for this channel.
    ChannelError(Option<String>),
    /// The join did not complete in time.
    TimedOut,
    /// The channel was closed.
    Closed,
}

/// Presence notification classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceEventKind {
    /// The full presence state is available.
    Sync,
    /// A peer joined.
    Join,
    /// A peer left.
    Leave,
}

impl PresenceEventKind {
    /// Wire name of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            PresenceEventKind::Sync => events::presence::SYNC,
            PresenceEventKind::Join => events::presence::JOIN,
            PresenceEventKind::Leave => events::presence::LEAVE,
        }
    }
}

/// A presence notification.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Presence state is in sync.
    Sync,
    /// A peer joined or updated its state.
    Join {
        /// Peer key.
        key: String,
        /// States added by the peer.
        new_presences: Vec<Value>,
    },
    /// A peer left.
    Leave {
        /// Peer key.
        key: String,
        /// States removed.
        left_presences: Vec<Value>,
    },
}

impl PresenceEvent {
    /// The class of this event.
    #[must_use]
    pub fn kind(&self) -> PresenceEventKind {
        match self {
            PresenceEvent::Sync => PresenceEventKind::Sync,
            PresenceEvent::Join { .. } => PresenceEventKind::Join,
            PresenceEvent::Leave { .. } => PresenceEventKind::Leave,
        }
    }
}

/// Presence snapshot: peer key to the ordered list of states it contributed.
pub type PresenceSnapshot = BTreeMap<String, Vec<Value>>;

/// Receives subscription status changes.
pub type StatusCallback = Arc<dyn Fn(TransportStatus) + Send + Sync>;

/// Receives broadcast payloads for one event name.
pub type BroadcastCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Receives presence notifications of one class.
pub type PresenceCallback = Arc<dyn Fn(&PresenceEvent) + Send + Sync>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Channel was closed.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Channel has not completed its join.
    #[error("Channel not joined: {0}")]
    NotJoined(String),

    /// Operation timed out.
    #[error("Operation timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Credentials were rejected.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Authenticates a principal and opens a transport session.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session for `principal`.
    async fn connect(&self, principal: &Principal) -> Result<Arc<dyn Transport>, TransportError>;

    /// Connector name (e.g. "memory").
    fn name(&self) -> &'static str;

    /// Check if the connector is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// An authenticated session that channels are opened on.
///
/// One session is shared read-only by every channel opened from it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new handle for `name`. The handle is inert until subscribed.
    fn channel(&self, name: &str, config: ChannelConfig) -> Arc<dyn ChannelHandle>;

    /// Release a handle: unsubscribe and forget it.
    async fn remove_channel(&self, handle: &Arc<dyn ChannelHandle>) -> Result<(), TransportError> {
        handle.unsubscribe().await
    }

    /// Transport name.
    fn name(&self) -> &'static str;
}

/// One subscription to one channel.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Unique handle identity.
    fn id(&self) -> HandleId;

    /// The channel name this handle is bound to.
    fn topic(&self) -> &str;

    /// The options the handle was opened with.
    fn config(&self) -> &ChannelConfig;

    /// Start joining. `callback` receives every status change from now on.
    fn subscribe(&self, callback: StatusCallback);

    /// Broadcast `payload` as `event` to the other members of the channel.
    async fn send(&self, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Register a handler for inbound broadcasts named `event`.
    fn on_broadcast(&self, event: &str, callback: BroadcastCallback);

    /// Register a handler for presence notifications of `kind`.
    fn on_presence(&self, kind: PresenceEventKind, callback: PresenceCallback);

    /// The service's current authoritative presence state.
    fn presence_state(&self) -> PresenceSnapshot;

    /// Announce (or replace) this handle's presence state.
    async fn track(&self, state: Value) -> Result<(), TransportError>;

    /// Withdraw this handle's presence state.
    async fn untrack(&self) -> Result<(), TransportError>;

    /// Leave the channel.
    async fn unsubscribe(&self) -> Result<(), TransportError>;
}
