//! Codec for encoding and decoding envelopes.
//!
//! Envelopes travel as JSON. Decoding refuses oversized input and envelopes
//! written by a newer, incompatible producer.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::version::EnvelopeVersion;

/// Maximum encoded envelope size (1 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during naming, encoding or decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    TooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Envelope version this process cannot read.
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(EnvelopeVersion),

    /// Malformed channel name.
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),
}

/// Encode an envelope to bytes.
///
/// # Errors
///
/// Returns an error if the envelope is too large or serialization fails.
pub fn encode<T: Serialize>(envelope: &Envelope<T>) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(envelope)?;

    if payload.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode an envelope from bytes.
///
/// # Errors
///
/// Returns an error if the data is too large, malformed, or of an
/// unsupported version.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<Envelope<T>, ProtocolError> {
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(data.len()));
    }

    let envelope: Envelope<T> = serde_json::from_slice(data)?;
    if !envelope.is_supported() {
        return Err(ProtocolError::UnsupportedVersion(envelope.v));
    }

    Ok(envelope)
}

/// Wrap and encode a payload in one step.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn wrap<T: Serialize>(
    topic: impl Into<String>,
    kind: impl Into<String>,
    data: T,
) -> Result<Bytes, ProtocolError> {
    encode(&Envelope::new(topic, kind, data))
}
