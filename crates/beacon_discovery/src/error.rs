//! Discovery error types.

use std::net::SocketAddr;
use std::time::Duration;

/// Errors that can occur in the beacon_discovery crate.
///
/// Transient network failures (`Send`, `Receive`) are produced by the
/// transport and handled inside the background loops; callers of
/// [`Discovery::lookup`](crate::Discovery::lookup) never see them.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Binding the port or joining the multicast group failed at startup.
    #[error("Failed to bind multicast group {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Sending an announcement datagram failed.
    #[error("Send error: {0}")]
    Send(#[source] std::io::Error),

    /// Receiving a datagram failed.
    #[error("Receive error: {0}")]
    Receive(#[source] std::io::Error),

    /// The local announcement cannot be put on the wire.
    #[error("Invalid announcement: {0}")]
    InvalidAnnouncement(String),

    /// Announcing mode was requested without an announcement configured.
    #[error("No announcement configured for announcing mode")]
    NoAnnouncement,

    /// `stop` was called before `start`.
    #[error("Discovery not started")]
    NotStarted,

    /// `start` was called on a running discovery.
    #[error("Discovery already started")]
    AlreadyStarted,

    /// The discovery was stopped and cannot be restarted or stopped again.
    #[error("Discovery already stopped")]
    AlreadyStopped,

    /// A query was issued while the discovery is not running.
    #[error("Discovery not running")]
    NotRunning,

    /// Waiting for an endpoint took too long.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiscoveryError {
    /// Whether this error is a caller mistake rather than a system fault.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::NoAnnouncement
                | Self::NotStarted
                | Self::AlreadyStarted
                | Self::AlreadyStopped
                | Self::NotRunning
        )
    }
}
