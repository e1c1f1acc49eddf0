//! One-shot server-side publishing.
//!
//! Backend code pushes state changes to subscribers of a live channel by
//! authenticating as a service principal, joining the private channel,
//! publishing one event and leaving again. Nothing is cached between calls.

use crate::metrics;
use livewire_protocol::topic;
use livewire_transport::{
    ChannelConfig, ChannelHandle, Connector, Principal, Transport, TransportError,
    TransportStatus,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default wait for the channel to be joined.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Publish errors.
#[derive(Debug, Error)]
pub enum PublishError {
    /// No service key is configured.
    #[error("A service key is required for publishing")]
    MissingServiceKey,

    /// The service principal was rejected.
    #[error("Failed to connect as service: {0}")]
    Connect(#[source] TransportError),

    /// The channel was not joined in time. Nothing was published.
    #[error("Timeout subscribing to channel: {topic}")]
    SubscribeTimeout {
        /// Channel name.
        topic: String,
        /// Bound that elapsed.
        timeout: Duration,
    },

    /// The transport refused the subscription.
    #[error("Channel error: {topic}")]
    ChannelError {
        /// Channel name.
        topic: String,
        /// Reason given by the transport.
        reason: Option<String>,
    },

    /// The transport reported the publish as failed.
    #[error("Failed to broadcast {event} to {topic}")]
    PublishFailed {
        /// Event name.
        event: String,
        /// Channel name.
        topic: String,
        /// Transport error.
        #[source]
        source: TransportError,
    },

    /// The payload could not be serialized.
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PublishError {
    fn kind(&self) -> &'static str {
        match self {
            PublishError::MissingServiceKey => "missing_service_key",
            PublishError::Connect(_) => "connect",
            PublishError::SubscribeTimeout { .. } => "subscribe_timeout",
            PublishError::ChannelError { .. } => "channel_error",
            PublishError::PublishFailed { .. } => "publish_failed",
            PublishError::Encode(_) => "encode",
        }
    }
}

/// Publisher configuration.
#[derive(Clone)]
pub struct PublisherConfig {
    /// Key identifying the trusted service principal.
    pub service_key: Option<String>,
    /// How long to wait for the channel to be joined.
    pub subscribe_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            service_key: None,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
        }
    }
}

impl PublisherConfig {
    /// Set the service key.
    #[must_use]
    pub fn with_service_key(mut self, key: impl Into<String>) -> Self {
        self.service_key = Some(key.into());
        self
    }
}

impl std::fmt::Debug for PublisherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherConfig")
            .field("service_key", &self.service_key.as_ref().map(|_| "<redacted>"))
            .field("subscribe_timeout", &self.subscribe_timeout)
            .finish()
    }
}

/// Publish one event to `live:<domain>:<resource_id>`.
///
/// The channel is released on every path once it has been opened.
///
/// # Errors
///
/// See [`PublishError`]. Nothing is retried.
pub async fn publish_live<T: Serialize + ?Sized>(
    connector: &dyn Connector,
    config: &PublisherConfig,
    domain: &str,
    resource_id: &str,
    event: &str,
    payload: &T,
) -> Result<(), PublishError> {
    let result = publish(connector, config, domain, resource_id, event, payload).await;
    metrics::record_publish(event, result.as_ref().err().map(PublishError::kind));
    result
}

async fn publish<T: Serialize + ?Sized>(
    connector: &dyn Connector,
    config: &PublisherConfig,
    domain: &str,
    resource_id: &str,
    event: &str,
    payload: &T,
) -> Result<(), PublishError> {
    let key = config
        .service_key
        .as_deref()
        .filter(|key| !key.is_empty())
        .ok_or(PublishError::MissingServiceKey)?;
    let payload = serde_json::to_value(payload)?;

    let transport = connector
        .connect(&Principal::Service {
            key: key.to_string(),
        })
        .await
        .map_err(PublishError::Connect)?;

    let name = topic::live(domain, resource_id);
    let handle = transport.channel(name.as_str(), ChannelConfig::private());
    let (tx, mut statuses) = mpsc::unbounded_channel();
    handle.subscribe(Arc::new(move |status| {
        let _ = tx.send(status);
    }));

    let result = async {
        wait_joined(&mut statuses, name.as_str(), config.subscribe_timeout).await?;
        debug!(channel = %name, event = %event, "Publishing");
        handle
            .send(event, payload)
            .await
            .map_err(|source| PublishError::PublishFailed {
                event: event.to_string(),
                topic: name.to_string(),
                source,
            })
    }
    .await;

    release(transport.as_ref(), &handle).await;
    result
}

async fn wait_joined(
    statuses: &mut mpsc::UnboundedReceiver<TransportStatus>,
    topic: &str,
    timeout: Duration,
) -> Result<(), PublishError> {
    let joined = async {
        while let Some(status) = statuses.recv().await {
            match status {
                TransportStatus::Subscribed => return Ok(()),
                TransportStatus::ChannelError(reason) => {
                    return Err(PublishError::ChannelError {
                        topic: topic.to_string(),
                        reason,
                    })
                }
                TransportStatus::TimedOut | TransportStatus::Closed => {}
            }
        }
        Err(PublishError::ChannelError {
            topic: topic.to_string(),
            reason: Some("channel closed".into()),
        })
    };

    tokio::time::timeout(timeout, joined)
        .await
        .map_err(|_| PublishError::SubscribeTimeout {
            topic: topic.to_string(),
            timeout,
        })?
}

async fn release(transport: &dyn Transport, handle: &Arc<dyn ChannelHandle>) {
    if let Err(e) = transport.remove_channel(handle).await {
        warn!(channel = %handle.topic(), error = %e, "Failed to release channel");
    }
}

/// Holds a connector and configuration for repeated [`publish_live`] calls.
#[derive(Clone)]
pub struct LivePublisher {
    connector: Arc<dyn Connector>,
    config: PublisherConfig,
}

impl LivePublisher {
    /// Create a publisher.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: PublisherConfig) -> Self {
        Self { connector, config }
    }

    /// Publish one event to `live:<domain>:<resource_id>`.
    ///
    /// # Errors
    ///
    /// See [`publish_live`].
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        domain: &str,
        resource_id: &str,
        event: &str,
        payload: &T,
    ) -> Result<(), PublishError> {
        publish_live(
            self.connector.as_ref(),
            &self.config,
            domain,
            resource_id,
            event,
            payload,
        )
        .await
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }
}
