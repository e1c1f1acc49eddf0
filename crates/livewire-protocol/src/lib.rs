//! # livewire-protocol
//!
//! Wire-level definitions shared by every Livewire component.
//!
//! This crate defines how channels are named and what the payloads exchanged
//! over them look like. It performs no I/O.
//!
//! ## Planes
//!
//! - `live` - Data plane: snapshots, deltas, errors
//! - `ctrl` - Control plane: RPC requests, acknowledgments, notifications
//! - `presence` - Who is connected and their ephemeral state
//!
//! ## Example
//!
//! ```rust
//! use livewire_protocol::{codec, topic, Envelope};
//!
//! let channel = topic::live("doc", "a:b");
//! assert_eq!(channel.as_str(), "live:doc:a%3Ab");
//!
//! let envelope = Envelope::new(channel.as_str(), "delta", serde_json::json!({"title": "Hi"}));
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded: Envelope<serde_json::Value> = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.topic, "live:doc:a%3Ab");
//! ```

pub mod codec;
pub mod envelope;
pub mod events;
pub mod payload;
pub mod topic;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::Envelope;
pub use payload::{Notify, RealtimeError, ResourceRef, RpcAck, RpcRequest};
pub use topic::{ChannelName, Plane};
pub use version::{EnvelopeVersion, ENVELOPE_VERSION};
