//! Discovery configuration.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::Announcement;
use crate::error::DiscoveryError;

/// The pre-agreed multicast endpoint used for discovery.
pub const DEFAULT_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(226, 226, 226, 226), 2266);

/// Configuration for the discovery subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Multicast group address and port shared by every node.
    pub group: SocketAddrV4,

    /// Local interface used to join the group. `0.0.0.0` lets the OS pick.
    pub interface: Ipv4Addr,

    /// Multicast TTL for outgoing announcements.
    pub multicast_ttl: u32,

    /// How often this node announces itself.
    #[serde(with = "duration_ms")]
    pub announce_period: Duration,

    /// An endpoint not heard from for this long is dropped.
    #[serde(with = "duration_ms")]
    pub expiry_timeout: Duration,

    /// Upper bound on a single blocking receive.
    #[serde(with = "duration_ms")]
    pub receive_timeout: Duration,

    /// How often `wait_for` re-checks the registry.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    /// What to announce when started in announcing mode.
    pub announcement: Option<Announcement>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP,
            interface: Ipv4Addr::UNSPECIFIED,
            multicast_ttl: 1,
            announce_period: Duration::from_millis(1000),
            expiry_timeout: Duration::from_millis(5000),
            receive_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
            announcement: None,
        }
    }
}

impl DiscoveryConfig {
    /// Default config that announces the given service.
    pub fn announcing(announcement: Announcement) -> Self {
        Self {
            announcement: Some(announcement),
            ..Self::default()
        }
    }

    /// Check the config for values that would break the protocol.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if !self.group.ip().is_multicast() {
            return Err(DiscoveryError::Config(format!(
                "{} is not a multicast address",
                self.group.ip()
            )));
        }
        if self.group.port() == 0 {
            return Err(DiscoveryError::Config("group port must be non-zero".into()));
        }
        for (name, value) in [
            ("announce_period", self.announce_period),
            ("expiry_timeout", self.expiry_timeout),
            ("receive_timeout", self.receive_timeout),
            ("poll_interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(DiscoveryError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.announce_period >= self.expiry_timeout {
            return Err(DiscoveryError::Config(format!(
                "announce_period {:?} must be shorter than expiry_timeout {:?}",
                self.announce_period, self.expiry_timeout
            )));
        }
        if let Some(announcement) = &self.announcement {
            announcement.validate()?;
        }
        Ok(())
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), DiscoveryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<DiscoveryConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
