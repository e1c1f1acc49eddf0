//! Payloads carried by control-plane events.
//!
//! Field names follow the camelCase wire convention (`requestId`), optional
//! fields are omitted when absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The resource an RPC request targets, used for routing and authorization
/// by the responding side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// Resource domain (e.g. `doc`, `comment`).
    pub domain: String,
    /// Resource identifier.
    pub resource_id: String,
}

impl ResourceRef {
    /// Create a new resource reference.
    #[must_use]
    pub fn new(domain: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            resource_id: resource_id.into(),
        }
    }
}

/// RPC request, sent as the `rpc` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest<P = Value> {
    /// Correlates the acknowledgment with this request.
    pub request_id: String,
    /// Action to invoke.
    pub action: String,
    /// Action parameters.
    pub params: P,
    /// Optional target resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,
}

impl<P> RpcRequest<P> {
    /// Create a new request.
    #[must_use]
    pub fn new(request_id: impl Into<String>, action: impl Into<String>, params: P) -> Self {
        Self {
            request_id: request_id.into(),
            action: action.into(),
            params,
            resource: None,
        }
    }

    /// Attach a target resource.
    #[must_use]
    pub fn with_resource(mut self, resource: ResourceRef) -> Self {
        self.resource = Some(resource);
        self
    }
}

/// RPC acknowledgment, sent as the `rpc_ack` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcAck {
    /// Request being acknowledged.
    pub request_id: String,
    /// Whether the call succeeded.
    pub ok: bool,
    /// Result data, present when `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message, present when not `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcAck {
    /// Successful acknowledgment.
    #[must_use]
    pub fn success(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed acknowledgment.
    #[must_use]
    pub fn failure(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Fire-and-forget notification, sent as the `notify` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notify<P = Value> {
    /// Action being notified.
    pub action: String,
    /// Notification parameters.
    pub params: P,
}

impl<P> Notify<P> {
    /// Create a new notification.
    #[must_use]
    pub fn new(action: impl Into<String>, params: P) -> Self {
        Self {
            action: action.into(),
            params,
        }
    }
}

/// Standard error shape for data-plane `error` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeError {
    /// Optional machine-readable code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable message.
    pub message: String,
}
