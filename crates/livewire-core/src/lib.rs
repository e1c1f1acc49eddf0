//! # livewire-core
//!
//! Channel lifecycle, presence, RPC and server publishing for Livewire.
//!
//! This crate provides the building blocks application code talks to:
//!
//! - **Channel** - Owns one subscription and its status
//! - **Broadcast** - Typed named events on a channel
//! - **Presence** - Who is connected and their ephemeral state
//! - **RPC** - Calls correlated with acknowledgments, plus notifications
//! - **Responder** - The answering side of RPC
//! - **Publish** - One-shot server-side publishing to a live channel
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  RpcEngine  │────▶│  Broadcast  │────▶│   Channel   │
//! └─────────────┘     └─────────────┘     │   Manager   │
//!                                         └──────┬──────┘
//! ┌─────────────┐                                │
//! │  Presence   │────────────────────────────────┤
//! └─────────────┘                                ▼
//!                                         ┌─────────────┐
//!                     publish_live ──────▶│  Transport  │
//!                                         └─────────────┘
//! ```

pub mod broadcast;
pub mod channel;
pub mod config;
pub mod metrics;
pub mod presence;
pub mod publish;
pub mod responder;
pub mod rpc;

#[cfg(test)]
mod testing;

pub use broadcast::{Broadcast, ChannelError};
pub use channel::{ChannelManager, ChannelOptions, ChannelStatus};
pub use config::LiveConfig;
pub use presence::{PresenceError, PresenceOptions, PresencePeer, PresenceReconciler};
pub use publish::{publish_live, LivePublisher, PublishError, PublisherConfig};
pub use responder::RpcResponder;
pub use rpc::{RpcCall, RpcEngine, RpcError, RpcOptions};
