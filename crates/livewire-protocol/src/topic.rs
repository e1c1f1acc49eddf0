//! Channel naming.
//!
//! Every channel is addressed as `<plane>:<domain>:<resource-id>`. Both the
//! domain and the resource id are percent-encoded so that `:` stays reserved
//! as the separator, which keeps `live:doc:1` and `ctrl:doc:1` (or a resource
//! id that itself contains colons) from ever colliding.

use crate::codec::ProtocolError;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fmt;
use std::str::FromStr;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Separator between the parts of a channel name.
pub const SEPARATOR: char = ':';

/// Characters left untouched by segment encoding (same set as `encodeURIComponent`).
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// The plane a channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plane {
    /// Data plane: snapshots and deltas.
    Live,
    /// Control plane: RPC and notifications.
    Ctrl,
    /// Presence tracking.
    Presence,
}

impl Plane {
    /// All planes, in declaration order.
    pub const ALL: [Plane; 3] = [Plane::Live, Plane::Ctrl, Plane::Presence];

    /// The tag used as the first part of a channel name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Plane::Live => "live",
            Plane::Ctrl => "ctrl",
            Plane::Presence => "presence",
        }
    }
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plane {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(Plane::Live),
            "ctrl" => Ok(Plane::Ctrl),
            "presence" => Ok(Plane::Presence),
            other => Err(ProtocolError::InvalidChannel(format!(
                "unknown plane '{other}'"
            ))),
        }
    }
}

/// Percent-encode a single name segment.
#[must_use]
pub fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

/// Decode a percent-encoded name segment.
///
/// # Errors
///
/// Returns an error if the decoded bytes are not valid UTF-8.
pub fn decode_segment(segment: &str) -> Result<String, ProtocolError> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| ProtocolError::InvalidChannel(format!("bad segment '{segment}': {e}")))
}

/// Validate a raw channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.starts_with('$') {
        return Err("Channel names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// A canonical channel identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    name: String,
    plane: Plane,
    domain: String,
    resource_id: String,
}

impl ChannelName {
    /// Build a channel name from its parts.
    #[must_use]
    pub fn new(plane: Plane, domain: &str, resource_id: &str) -> Self {
        let name = format!(
            "{plane}{SEPARATOR}{}{SEPARATOR}{}",
            encode_segment(domain),
            encode_segment(resource_id)
        );
        Self {
            name,
            plane,
            domain: domain.to_string(),
            resource_id: resource_id.to_string(),
        }
    }

    /// Parse a canonical channel name back into its parts.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is not `<plane>:<domain>:<resource-id>`.
    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        validate_channel_name(name)
            .map_err(|e| ProtocolError::InvalidChannel(e.to_string()))?;

        let mut parts = name.split(SEPARATOR);
        let (Some(plane), Some(domain), Some(resource_id), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::InvalidChannel(format!(
                "expected <plane>:<domain>:<resource-id>, got '{name}'"
            )));
        };

        Ok(Self {
            name: name.to_string(),
            plane: plane.parse()?,
            domain: decode_segment(domain)?,
            resource_id: decode_segment(resource_id)?,
        })
    }

    /// The full encoded name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The plane tag.
    #[must_use]
    pub fn plane(&self) -> Plane {
        self.plane
    }

    /// The decoded domain.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The decoded resource id.
    #[must_use]
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Consume the name and return the encoded string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.name
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl From<ChannelName> for String {
    fn from(name: ChannelName) -> Self {
        name.name
    }
}

/// Build a channel name on the given plane.
#[must_use]
pub fn topic(plane: Plane, domain: &str, resource_id: &str) -> ChannelName {
    ChannelName::new(plane, domain, resource_id)
}

/// Data-plane channel, e.g. `live:doc:123`.
#[must_use]
pub fn live(domain: &str, resource_id: &str) -> ChannelName {
    topic(Plane::Live, domain, resource_id)
}

/// Control-plane channel, e.g. `ctrl:worker:main`.
#[must_use]
pub fn ctrl(domain: &str, resource_id: &str) -> ChannelName {
    topic(Plane::Ctrl, domain, resource_id)
}

/// Presence channel, e.g. `presence:room:general`.
#[must_use]
pub fn presence(domain: &str, resource_id: &str) -> ChannelName {
    topic(Plane::Presence, domain, resource_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_prefixes() {
        assert_eq!(live("doc", "1").as_str(), "live:doc:1");
        assert_eq!(ctrl("doc", "1").as_str(), "ctrl:doc:1");
        assert_eq!(presence("doc", "1").as_str(), "presence:doc:1");
    }

    #[test]
    fn test_segments_are_encoded() {
        let name = live("doc", "user:42/draft 1");
        assert_eq!(name.as_str(), "live:doc:user%3A42%2Fdraft%201");
        assert_eq!(name.resource_id(), "user:42/draft 1");
        assert_eq!(name.as_str().matches(SEPARATOR).count(), 2);
    }

    #[test]
    fn test_unreserved_characters_pass_through() {
        assert_eq!(encode_segment("a-b_c.d!e~f*g'h(i)"), "a-b_c.d!e~f*g'h(i)");
        assert_eq!(encode_segment("100%"), "100%25");
        assert_eq!(encode_segment("é"), "%C3%A9");
    }

    #[test]
    fn test_parse_decodes_parts() {
        let original = presence("room", "team:a");
        let parsed = ChannelName::parse(original.as_str()).unwrap();

        assert_eq!(parsed, original);
        assert_eq!(parsed.plane(), Plane::Presence);
        assert_eq!(parsed.domain(), "room");
        assert_eq!(parsed.resource_id(), "team:a");
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        assert!(ChannelName::parse("").is_err());
        assert!(ChannelName::parse("live:doc").is_err());
        assert!(ChannelName::parse("live:doc:1:extra").is_err());
        assert!(ChannelName::parse("topic:doc:1").is_err());
        assert!(ChannelName::parse("live:doc:%FF").is_err());
    }

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("live:doc:1").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("$system").is_err());
        assert!(validate_channel_name("live:\u{7}:1").is_err());

        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());
    }
}
