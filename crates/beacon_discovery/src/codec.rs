//! Wire codec for service announcements.
//!
//! An announcement travels as a single datagram:
//!
//! ```text
//! <service-name>\t<endpoint-uri>
//! ```
//!
//! Anything else seen on the shared channel is noise and decodes to `None`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;

/// Separates the two fields of an announcement.
pub const DELIMITER: char = '\t';

/// Largest payload accepted on the wire, in bytes.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// A `(service name, endpoint URI)` pair broadcast by a providing node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Announcement {
    /// Name of the service being offered.
    pub service_name: String,
    /// Contact endpoint of this service instance.
    pub endpoint_uri: String,
}

impl Announcement {
    /// Create an announcement, rejecting records that could not be decoded
    /// back by a peer.
    pub fn new(
        service_name: impl Into<String>,
        endpoint_uri: impl Into<String>,
    ) -> Result<Self, DiscoveryError> {
        let announcement = Self {
            service_name: service_name.into(),
            endpoint_uri: endpoint_uri.into(),
        };
        announcement.validate()?;
        Ok(announcement)
    }

    /// Check that both fields are non-empty, delimiter-free and fit in one
    /// datagram once encoded.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        for (field, value) in [
            ("service name", &self.service_name),
            ("endpoint URI", &self.endpoint_uri),
        ] {
            if value.is_empty() {
                return Err(DiscoveryError::InvalidAnnouncement(format!(
                    "{field} is empty"
                )));
            }
            if value.contains(DELIMITER) {
                return Err(DiscoveryError::InvalidAnnouncement(format!(
                    "{field} contains the delimiter"
                )));
            }
        }

        let len = self.encoded_len();
        if len > MAX_DATAGRAM_SIZE {
            return Err(DiscoveryError::InvalidAnnouncement(format!(
                "encoded size {len} exceeds {MAX_DATAGRAM_SIZE} bytes"
            )));
        }
        Ok(())
    }

    /// Encode the announcement into a datagram payload.
    pub fn encode(&self) -> Result<Vec<u8>, DiscoveryError> {
        self.validate()?;
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(self.service_name.as_bytes());
        let mut delim = [0u8; 4];
        buf.extend_from_slice(DELIMITER.encode_utf8(&mut delim).as_bytes());
        buf.extend_from_slice(self.endpoint_uri.as_bytes());
        Ok(buf)
    }

    /// Decode a datagram payload. Returns `None` for anything that is not
    /// exactly two non-empty fields.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() > MAX_DATAGRAM_SIZE {
            return None;
        }
        let text = std::str::from_utf8(payload).ok()?;

        let mut fields = text.split(DELIMITER);
        let service_name = fields.next()?;
        let endpoint_uri = fields.next()?;
        if fields.next().is_some() || service_name.is_empty() || endpoint_uri.is_empty() {
            return None;
        }

        Some(Self {
            service_name: service_name.to_string(),
            endpoint_uri: endpoint_uri.to_string(),
        })
    }

    fn encoded_len(&self) -> usize {
        self.service_name.len() + DELIMITER.len_utf8() + self.endpoint_uri.len()
    }
}

impl fmt::Display for Announcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.service_name, self.endpoint_uri)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
