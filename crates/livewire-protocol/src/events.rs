//! Standard event names, organized by plane.

/// Data-plane events.
pub mod live {
    /// Full state of a resource.
    pub const SNAPSHOT: &str = "snapshot";
    /// Incremental change to a resource.
    pub const DELTA: &str = "delta";
    /// Error affecting a resource.
    pub const ERROR: &str = "error";
}

/// Control-plane events.
pub mod ctrl {
    /// RPC request.
    pub const RPC: &str = "rpc";
    /// RPC acknowledgment.
    pub const RPC_ACK: &str = "rpc_ack";
    /// Fire-and-forget notification.
    pub const NOTIFY: &str = "notify";
}

/// Presence events emitted by the transport.
pub mod presence {
    /// Full presence state is available.
    pub const SYNC: &str = "sync";
    /// A peer joined.
    pub const JOIN: &str = "join";
    /// A peer left.
    pub const LEAVE: &str = "leave";
}
