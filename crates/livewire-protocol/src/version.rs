//! Envelope versioning.
//!
//! Envelopes carry a single integer version so receivers can refuse payloads
//! written by a newer, incompatible producer.

use serde::{Deserialize, Serialize};

/// Current envelope version.
pub const ENVELOPE_VERSION: EnvelopeVersion = EnvelopeVersion(1);

/// Envelope version number as it appears on the wire (`"v": 1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeVersion(pub u8);

impl EnvelopeVersion {
    /// Create a new version.
    #[must_use]
    pub const fn new(v: u8) -> Self {
        Self(v)
    }

    /// Get the raw version number.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Check whether a reader at this version can understand `other`.
    ///
    /// Readers understand anything at or below their own version.
    #[must_use]
    pub fn can_read(&self, other: &EnvelopeVersion) -> bool {
        other.0 >= 1 && other.0 <= self.0
    }
}

impl std::fmt::Display for EnvelopeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl Default for EnvelopeVersion {
    fn default() -> Self {
        ENVELOPE_VERSION
    }
}
