//! Request/response calls over a control channel.
//!
//! Requests go out as `rpc` events and are correlated with `rpc_ack` events by
//! request id. Every accepted call owns exactly one entry in the pending map
//! together with its timeout timer. Whoever removes the entry (the ack
//! handler, the timer, a failed send or a detach) settles the call; every
//! other path finds nothing and does nothing.

use crate::broadcast::{Broadcast, ChannelError};
use crate::channel::{ChannelOptions, ChannelStatus, DebugLabel, Generation};
use crate::metrics;
use livewire_protocol::events::ctrl;
use livewire_protocol::{Notify, ResourceRef, RpcAck, RpcRequest};
use livewire_transport::{Transport, TransportError};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Default call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Default ceiling on outstanding calls.
pub const DEFAULT_MAX_PENDING: usize = 200;

/// RPC errors.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The channel is not connected; nothing was sent.
    #[error("Channel not connected (status: {status})")]
    NotConnected {
        /// Status at the time of the call.
        status: ChannelStatus,
    },

    /// The pending ceiling was reached; nothing was sent.
    #[error("Too many pending RPC calls ({pending}/{max}). Rejecting new call to \"{action}\"")]
    TooManyPending {
        /// Calls outstanding.
        pending: usize,
        /// Configured ceiling.
        max: usize,
        /// Rejected action.
        action: String,
    },

    /// No acknowledgment arrived in time.
    #[error("RPC \"{action}\" timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// Action called.
        action: String,
        /// Bound that elapsed.
        timeout: Duration,
    },

    /// The remote side reported an error.
    #[error("{0}")]
    Remote(String),

    /// The remote side reported failure without a message.
    #[error("RPC \"{action}\" failed without error message")]
    Failed {
        /// Action called.
        action: String,
    },

    /// The engine was detached or dropped while the call was pending.
    #[error("RPC cancelled: engine detached")]
    Cancelled,

    /// The request could not be published.
    #[error("Failed to send RPC \"{action}\": {source}")]
    Send {
        /// Action called.
        action: String,
        /// Transport error.
        #[source]
        source: TransportError,
    },

    /// The parameters could not be serialized.
    #[error("Failed to encode params for \"{action}\": {source}")]
    Encode {
        /// Action called.
        action: String,
        /// Serialization error.
        #[source]
        source: serde_json::Error,
    },

    /// The result could not be decoded into the requested type.
    #[error("Failed to decode result of \"{action}\": {source}")]
    Decode {
        /// Action called.
        action: String,
        /// Deserialization error.
        #[source]
        source: serde_json::Error,
    },
}

/// Options for an [`RpcEngine`].
#[derive(Debug, Clone)]
pub struct RpcOptions {
    /// Timeout for calls that don't override it.
    pub default_timeout: Duration,
    /// Maximum outstanding calls before new ones are rejected.
    pub max_pending: usize,
    /// Options for the underlying channel.
    pub channel: ChannelOptions,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
            channel: ChannelOptions::default(),
        }
    }
}

struct Pending {
    action: String,
    tx: oneshot::Sender<Result<Value, RpcError>>,
    timer: JoinHandle<()>,
    started: Instant,
}

type PendingMap = Arc<Mutex<HashMap<String, Pending>>>;

/// Call/response correlation on one managed channel.
pub struct RpcEngine {
    broadcast: Broadcast,
    pending: PendingMap,
    default_timeout: Duration,
    max_pending: usize,
}

impl RpcEngine {
    /// Create a detached engine.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, options: RpcOptions) -> Self {
        let broadcast = Broadcast::new(transport, options.channel);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let acks = Arc::clone(&pending);
        let label = broadcast.channel().debug_label_ref();
        broadcast.on(ctrl::RPC_ACK, move |ack: RpcAck| settle(&acks, &label, ack));

        Self {
            broadcast,
            pending,
            default_timeout: options.default_timeout,
            max_pending: options.max_pending,
        }
    }

    /// Attach to `name`. Calls already pending are left to resolve or time out.
    pub async fn attach(&mut self, name: impl AsRef<str>) {
        self.broadcast.attach(name).await;
    }

    /// Cancel every pending call, then release the channel.
    pub async fn detach(&mut self) {
        self.cancel_all();
        self.broadcast.detach().await;
    }

    /// Call `action` and wait for its acknowledgment.
    ///
    /// Rejections (not connected, too many pending) are decided immediately;
    /// the returned future resolves with them without sending anything.
    ///
    /// An accepted call takes a pending slot and starts its timeout here, but
    /// the request is only sent when the returned [`RpcCall`] is first polled.
    /// If the handle it was accepted on has been replaced or is no longer
    /// connected by then, the call fails with [`RpcError::NotConnected`]
    /// instead of sending. Dropping the [`RpcCall`] gives the slot back.
    pub fn call<P, R>(&self, action: &str, params: &P, timeout: Option<Duration>) -> RpcCall<R>
    where
        P: Serialize + ?Sized,
    {
        self.start(action, params, None, timeout)
    }

    /// Like [`call`](Self::call), naming the resource the call targets.
    pub fn call_for<P, R>(
        &self,
        resource: ResourceRef,
        action: &str,
        params: &P,
        timeout: Option<Duration>,
    ) -> RpcCall<R>
    where
        P: Serialize + ?Sized,
    {
        self.start(action, params, Some(resource), timeout)
    }

    /// Send a fire-and-forget notification.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not connected or the send fails.
    pub async fn notify<P: Serialize + ?Sized>(
        &self,
        action: &str,
        params: &P,
    ) -> Result<(), RpcError> {
        if let Some(label) = self.broadcast.channel().debug_label() {
            debug!(label = %label, action = %action, "Notifying (fire-and-forget)");
        }

        self.broadcast
            .send(ctrl::NOTIFY, &Notify::new(action, params))
            .await
            .map_err(|e| match e {
                ChannelError::NotConnected { status } => RpcError::NotConnected { status },
                ChannelError::Delivery { source, .. } => RpcError::Send {
                    action: action.to_string(),
                    source,
                },
                ChannelError::Encode { source, .. } => RpcError::Encode {
                    action: action.to_string(),
                    source,
                },
            })
    }

    /// Number of calls awaiting an outcome.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.broadcast.status()
    }

    /// Stream of status values.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.broadcast.watch_status()
    }

    /// The underlying broadcast facade.
    #[must_use]
    pub fn broadcast(&self) -> &Broadcast {
        &self.broadcast
    }

    fn start<P, R>(
        &self,
        action: &str,
        params: &P,
        resource: Option<ResourceRef>,
        timeout: Option<Duration>,
    ) -> RpcCall<R>
    where
        P: Serialize + ?Sized,
    {
        let inner: Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>> =
            match self.enqueue(action, params, resource, timeout) {
                Ok(flight) => Box::pin(flight.run()),
                Err(e) => Box::pin(std::future::ready(Err(e))),
            };

        RpcCall {
            action: action.to_string(),
            inner,
            _result: PhantomData,
        }
    }

    fn enqueue<P: Serialize + ?Sized>(
        &self,
        action: &str,
        params: &P,
        resource: Option<ResourceRef>,
        timeout: Option<Duration>,
    ) -> Result<InFlight, RpcError> {
        let label = self.broadcast.channel().debug_label_ref();
        let status = self.broadcast.status();
        let generation = match self.broadcast.channel().generation() {
            Some(generation) if status.is_connected() => generation,
            _ => {
                metrics::record_rpc_rejected("not_connected");
                if let Some(label) = label.get() {
                    debug!(label = %label, action = %action, status = %status, "Cannot call: channel not connected");
                }
                return Err(RpcError::NotConnected { status });
            }
        };

        let encode = |source| RpcError::Encode {
            action: action.to_string(),
            source,
        };
        let request_id = Uuid::new_v4().to_string();
        let params = serde_json::to_value(params).map_err(encode)?;
        let mut request = RpcRequest::new(request_id.clone(), action, params);
        if let Some(resource) = resource {
            request = request.with_resource(resource);
        }
        let payload = serde_json::to_value(&request).map_err(encode)?;
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.max_pending {
                let error = RpcError::TooManyPending {
                    pending: pending.len(),
                    max: self.max_pending,
                    action: action.to_string(),
                };
                drop(pending);
                metrics::record_rpc_rejected("too_many_pending");
                if let Some(label) = label.get() {
                    warn!(label = %label, "{}", error);
                }
                return Err(error);
            }

            let timer = tokio::spawn(expire(
                Arc::clone(&self.pending),
                request_id.clone(),
                timeout,
                label.clone(),
            ));
            pending.insert(
                request_id.clone(),
                Pending {
                    action: action.to_string(),
                    tx,
                    timer,
                    started: Instant::now(),
                },
            );
        }

        metrics::record_rpc_call(action);
        if let Some(label) = label.get() {
            debug!(
                label = %label,
                action = %action,
                request_id = %request_id,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Calling"
            );
        }

        Ok(InFlight {
            generation,
            status: self.broadcast.watch_status(),
            slot: Slot {
                pending: Arc::clone(&self.pending),
                request_id,
            },
            action: action.to_string(),
            payload,
            rx,
        })
    }

    /// Fail every pending call with [`RpcError::Cancelled`].
    fn cancel_all(&self) {
        let drained: Vec<(String, Pending)> = self.pending.lock().drain().collect();
        let label = self.broadcast.channel().debug_label();

        for (request_id, entry) in drained {
            entry.timer.abort();
            if let Some(label) = &label {
                debug!(label = %label, action = %entry.action, request_id = %request_id, "Cleaning up pending RPC");
            }
            let _ = entry.tx.send(Err(RpcError::Cancelled));
        }
    }
}

impl Drop for RpcEngine {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Apply an acknowledgment to the pending map.
fn settle(pending: &PendingMap, label: &DebugLabel, ack: RpcAck) {
    let entry = pending.lock().remove(&ack.request_id);
    let Some(entry) = entry else {
        match label.get() {
            Some(label) => {
                debug!(label = %label, request_id = %ack.request_id, "Received rpc_ack for unknown request");
            }
            None => trace!(request_id = %ack.request_id, "Dropping rpc_ack for unknown request"),
        }
        return;
    };

    entry.timer.abort();
    metrics::record_rpc_latency(entry.started.elapsed());
    if let Some(label) = label.get() {
        debug!(label = %label, action = %entry.action, ok = ack.ok, "Received rpc_ack");
    }

    let outcome = if ack.ok {
        Ok(ack.data.unwrap_or(Value::Null))
    } else {
        Err(match ack.error {
            Some(message) => RpcError::Remote(message),
            None => RpcError::Failed {
                action: entry.action,
            },
        })
    };
    let _ = entry.tx.send(outcome);
}

/// Timer for one call; fails it if it is still pending when the bound elapses.
async fn expire(pending: PendingMap, request_id: String, timeout: Duration, label: DebugLabel) {
    tokio::time::sleep(timeout).await;

    let entry = pending.lock().remove(&request_id);
    let Some(entry) = entry else {
        return;
    };

    metrics::record_rpc_timeout(&entry.action);
    let error = RpcError::Timeout {
        action: entry.action,
        timeout,
    };
    if let Some(label) = label.get() {
        warn!(label = %label, "{}", error);
    }
    let _ = entry.tx.send(Err(error));
}

/// A call's entry in the pending map. Dropping it abandons the call.
struct Slot {
    pending: PendingMap,
    request_id: String,
}

impl Slot {
    fn is_held(&self) -> bool {
        self.pending.lock().contains_key(&self.request_id)
    }

    fn take(&self) -> Option<Pending> {
        let entry = self.pending.lock().remove(&self.request_id)?;
        entry.timer.abort();
        Some(entry)
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.take();
    }
}

/// An accepted call waiting to be sent.
struct InFlight {
    generation: Generation,
    status: watch::Receiver<ChannelStatus>,
    slot: Slot,
    action: String,
    payload: Value,
    rx: oneshot::Receiver<Result<Value, RpcError>>,
}

impl InFlight {
    async fn run(self) -> Result<Value, RpcError> {
        let InFlight {
            generation,
            status,
            slot,
            action,
            payload,
            rx,
        } = self;

        // A detach between enqueue and the first poll has already settled it.
        if slot.is_held() {
            let current = if generation.is_live() {
                *status.borrow()
            } else {
                ChannelStatus::Disconnected
            };

            if !current.is_connected() {
                if slot.take().is_some() {
                    metrics::record_rpc_rejected("not_connected");
                    return Err(RpcError::NotConnected { status: current });
                }
            } else if let Err(source) = generation.handle().send(ctrl::RPC, payload).await {
                if slot.take().is_some() {
                    return Err(RpcError::Send { action, source });
                }
            }
        }

        rx.await.unwrap_or(Err(RpcError::Cancelled))
    }
}

/// The outcome of [`RpcEngine::call`].
///
/// Owns everything it needs, so it can be spawned or held across a detach.
#[must_use = "the request is not sent until the call is awaited"]
pub struct RpcCall<R> {
    action: String,
    inner: Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>,
    _result: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> Future for RpcCall<R> {
    type Output = Result<R, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = ready!(self.inner.as_mut().poll(cx));
        Poll::Ready(result.and_then(|value| {
            serde_json::from_value(value).map_err(|source| RpcError::Decode {
                action: self.action.clone(),
                source,
            })
        }))
    }
}
