//! Optional message envelope.
//!
//! Features may send raw payloads or wrap them in an [`Envelope`] to carry
//! version, timestamp and topic metadata alongside the data.

use crate::version::{EnvelopeVersion, ENVELOPE_VERSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard envelope: `{v, ts, topic, type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Envelope version.
    pub v: EnvelopeVersion,
    /// Creation time, serialized as ISO-8601.
    pub ts: DateTime<Utc>,
    /// Channel the message was produced for.
    pub topic: String,
    /// Event type name (`snapshot`, `delta`, `rpc`, or a custom name).
    #[serde(rename = "type")]
    pub kind: String,
    /// The wrapped payload.
    pub data: T,
}

impl<T> Envelope<T> {
    /// Wrap `data` with the current version and time.
    #[must_use]
    pub fn new(topic: impl Into<String>, kind: impl Into<String>, data: T) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            ts: Utc::now(),
            topic: topic.into(),
            kind: kind.into(),
            data,
        }
    }

    /// Override the timestamp.
    #[must_use]
    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = ts;
        self
    }

    /// Whether this process can read an envelope of this version.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        ENVELOPE_VERSION.can_read(&self.v)
    }

    /// Transform the payload, keeping the metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            v: self.v,
            ts: self.ts,
            topic: self.topic,
            kind: self.kind,
            data: f(self.data),
        }
    }
}
