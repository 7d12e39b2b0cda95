//! Beacon Discovery: soft-state service discovery over UDP multicast.
//!
//! Service providers periodically announce `(service name, endpoint URI)`
//! on a shared multicast group. Every node listens to the group and keeps a
//! registry of endpoints it has heard from recently; an endpoint that stops
//! announcing is forgotten once the expiry timeout passes.
//!
//! # Architecture
//!
//! - **Codec**: `<service>\t<uri>` datagrams of at most 1024 bytes.
//! - **Transport**: UDP multicast (tokio), or an in-process channel.
//! - **Registry**: internally locked map of service → endpoint → last seen.
//! - **Loops**: an announcer (providers only) and a listener, both tokio
//!   tasks stopped through a broadcast shutdown signal.
//! - **Discovery**: the lifecycle and lookup facade.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use beacon_discovery::{Announcement, Discovery, DiscoveryConfig};
//!
//! # async fn example() -> Result<(), beacon_discovery::DiscoveryError> {
//! // Provider side.
//! let announcement = Announcement::new("UsersService", "http://10.0.0.1:8080/rest")?;
//! let mut provider = Discovery::new(DiscoveryConfig::announcing(announcement));
//! provider.start(true).await?;
//!
//! // Consumer side.
//! let mut consumer = Discovery::new(DiscoveryConfig::default());
//! consumer.start(false).await?;
//! let endpoints = consumer.wait_for("UsersService", Duration::from_secs(5)).await?;
//! println!("calling {}", endpoints[0]);
//!
//! consumer.stop().await?;
//! provider.stop().await?;
//! # Ok(())
//! # }
//! ```

mod announcer;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
mod listener;
pub mod registry;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use codec::{Announcement, DELIMITER, MAX_DATAGRAM_SIZE};
pub use config::{DEFAULT_GROUP, DiscoveryConfig};
pub use discovery::{Discovery, DiscoveryState};
pub use error::DiscoveryError;
pub use registry::ServiceRegistry;
pub use transport::{
    Datagram, MemoryChannel, MemoryTransport, MulticastTransport, SharedTransport, Transport,
};
