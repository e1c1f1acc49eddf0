//! The answering side of the RPC protocol.
//!
//! A responder listens for `rpc` requests on a control channel, runs the
//! handler registered for the action on its own task and publishes the
//! outcome as `rpc_ack`. Workers use it to serve calls made through
//! [`RpcEngine`](crate::rpc::RpcEngine).

use crate::broadcast::Broadcast;
use crate::channel::{ChannelOptions, ChannelStatus};
use futures_util::future::{BoxFuture, FutureExt};
use livewire_protocol::events::ctrl;
use livewire_protocol::{Notify, RpcAck, RpcRequest};
use livewire_transport::{ChannelHandle, Transport};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Serves one action. `Err` is sent back as the ack's error text.
pub type ActionHandler =
    Arc<dyn Fn(RpcRequest) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Receives the params of one notification.
pub type NotifyHandler = Arc<dyn Fn(Value) + Send + Sync>;

type Current = Arc<Mutex<Option<Arc<dyn ChannelHandle>>>>;

/// Serves RPC requests arriving on one managed channel.
pub struct RpcResponder {
    broadcast: Broadcast,
    actions: Arc<RwLock<HashMap<String, ActionHandler>>>,
    notifications: Arc<RwLock<HashMap<String, NotifyHandler>>>,
    current: Current,
}

impl RpcResponder {
    /// Create a detached responder.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, options: ChannelOptions) -> Self {
        let broadcast = Broadcast::new(transport, options);
        let actions: Arc<RwLock<HashMap<String, ActionHandler>>> = Arc::default();
        let notifications: Arc<RwLock<HashMap<String, NotifyHandler>>> = Arc::default();
        let current: Current = Arc::default();

        {
            let actions = Arc::clone(&actions);
            let current = Arc::clone(&current);
            broadcast.on(ctrl::RPC, move |request: RpcRequest| {
                dispatch(&actions, &current, request);
            });
        }
        {
            let notifications = Arc::clone(&notifications);
            broadcast.on(ctrl::NOTIFY, move |notify: Notify| {
                let handler = notifications.read().get(&notify.action).cloned();
                match handler {
                    Some(handler) => handler(notify.params),
                    None => debug!(action = %notify.action, "No handler for notification"),
                }
            });
        }

        Self {
            broadcast,
            actions,
            notifications,
            current,
        }
    }

    /// Attach to `name` and start answering requests on it.
    pub async fn attach(&mut self, name: impl AsRef<str>) {
        *self.current.lock() = None;
        let current = &self.current;
        self.broadcast
            .attach_with(name, |generation| {
                *current.lock() = Some(Arc::clone(generation.handle()));
            })
            .await;
    }

    /// Stop answering and release the channel.
    pub async fn detach(&mut self) {
        *self.current.lock() = None;
        self.broadcast.detach().await;
    }

    /// Serve `action` with `handler`, replacing any previous handler.
    pub fn handle<F, Fut>(&self, action: &str, handler: F)
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: ActionHandler = Arc::new(move |request| handler(request).boxed());
        self.actions.write().insert(action.to_string(), handler);
    }

    /// Receive notifications for `action`, replacing any previous handler.
    pub fn on_notify(&self, action: &str, handler: impl Fn(Value) + Send + Sync + 'static) {
        self.notifications
            .write()
            .insert(action.to_string(), Arc::new(handler));
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
}

fn dispatch(
    actions: &RwLock<HashMap<String, ActionHandler>>,
    current: &Mutex<Option<Arc<dyn ChannelHandle>>>,
    request: RpcRequest,
) {
    let Some(target) = current.lock().clone() else {
        return;
    };
    let handler = actions.read().get(&request.action).cloned();

    tokio::spawn(async move {
        let request_id = request.request_id.clone();
        let action = request.action.clone();

        let ack = match handler {
            Some(handler) => match handler(request).await {
                Ok(data) => RpcAck::success(request_id, data),
                Err(error) => RpcAck::failure(request_id, error),
            },
            None => {
                debug!(action = %action, "Rejecting unknown action");
                RpcAck::failure(request_id, format!("Unknown action: {action}"))
            }
        };

        let payload = match serde_json::to_value(&ack) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(action = %action, error = %e, "Failed to encode rpc_ack");
                return;
            }
        };
        if let Err(e) = target.send(ctrl::RPC_ACK, payload).await {
            warn!(channel = %target.topic(), action = %action, error = %e, "Failed to send rpc_ack");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcEngine, RpcError, RpcOptions};
    use crate::testing::wait_for_status;
    use livewire_protocol::ResourceRef;
    use livewire_transport::{MemoryHub, Principal};
    use serde_json::json;
    use tokio::sync::mpsc;

    const CTRL: &str = "ctrl:worker:1";

    async fn pair(hub: &MemoryHub) -> (RpcEngine, RpcResponder) {
        let mut responder =
            RpcResponder::new(hub.transport(Principal::Anonymous), ChannelOptions::default());
        responder.attach(CTRL).await;
        wait_for_status(&responder.watch_status(), ChannelStatus::Connected).await;

        let mut engine = RpcEngine::new(hub.transport(Principal::Anonymous), RpcOptions::default());
        engine.attach(CTRL).await;
        wait_for_status(&engine.watch_status(), ChannelStatus::Connected).await;

        (engine, responder)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let hub = MemoryHub::new();
        let (engine, responder) = pair(&hub).await;
        responder.handle("echo", |request| async move { Ok(request.params) });

        let result: Value = engine.call("echo", &json!({"x": 1}), None).await.unwrap();
        assert_eq!(result, json!({"x": 1}));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let hub = MemoryHub::new();
        let (engine, _responder) = pair(&hub).await;

        let error = engine.call::<_, Value>("nope", &1, None).await.unwrap_err();
        assert!(matches!(&error, RpcError::Remote(m) if m == "Unknown action: nope"));
    }

    #[tokio::test]
    async fn test_handler_error_and_resource() {
        let hub = MemoryHub::new();
        let (engine, responder) = pair(&hub).await;
        responder.handle("rename", |request| async move {
            match request.resource {
                Some(resource) if resource.domain == "doc" => Err(format!(
                    "Document {} is locked",
                    resource.resource_id
                )),
                _ => Ok(Value::Null),
            }
        });

        let error = engine
            .call_for::<_, Value>(ResourceRef::new("doc", "7"), "rename", &json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "Document 7 is locked");

        let ok: Value = engine.call("rename", &json!({}), None).await.unwrap();
        assert_eq!(ok, Value::Null);
    }

    #[tokio::test]
    async fn test_notifications() {
        let hub = MemoryHub::new();
        let (engine, responder) = pair(&hub).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        responder.on_notify("logEvent", move |params| {
            let _ = tx.send(params);
        });

        engine.notify("logEvent", &json!({"event": "click"})).await.unwrap();
        engine.notify("other", &1).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), json!({"event": "click"}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_detached_responder_stays_silent() {
        let hub = MemoryHub::new();
        let (engine, mut responder) = pair(&hub).await;
        responder.handle("echo", |request| async move { Ok(request.params) });
        responder.detach().await;

        let error = engine
            .call::<_, Value>("echo", &1, Some(std::time::Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(error, RpcError::Timeout { .. }));
    }
}
