//! # livewire-transport
//!
//! Transport abstraction layer for Livewire.
//!
//! Livewire never talks to a pub/sub service directly. Everything goes through
//! three traits:
//!
//! - **Connector** - authenticates a principal and yields a transport session
//! - **Transport** - opens and releases channel handles on that session
//! - **ChannelHandle** - one subscription: status, send, handlers, presence
//!
//! The `memory` feature (on by default) provides [`MemoryHub`], an in-process
//! service with the same delivery and presence semantics, used for tests,
//! benchmarks and local development.
//!
//! ```rust,ignore
//! use livewire_transport::{ChannelConfig, Connector, MemoryHub, Principal};
//!
//! let hub = MemoryHub::new();
//! let transport = hub.connect(&Principal::Anonymous).await?;
//! let handle = transport.channel("live:doc:1", ChannelConfig::default());
//! handle.subscribe(Arc::new(|status| println!("{status:?}")));
//! ```

pub mod fallback;
pub mod traits;

#[cfg(feature = "memory")]
pub mod memory;

pub use fallback::FallbackConnector;
pub use traits::{
    BroadcastCallback, ChannelConfig, ChannelHandle, Connector, HandleId, PresenceCallback,
    PresenceEvent, PresenceEventKind, PresenceSnapshot, Principal, StatusCallback, Transport,
    TransportError, TransportStatus,
};

#[cfg(feature = "memory")]
pub use memory::{MemoryChannel, MemoryHub, SubscribeBehavior};
