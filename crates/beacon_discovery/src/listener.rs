//! Listener loop: collects announcements into the registry.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::codec::Announcement;
use crate::registry::ServiceRegistry;
use crate::transport::{Datagram, SharedTransport};

/// Spawn the listener task.
///
/// Receives are bounded by `receive_timeout` and raced against `shutdown`,
/// so the task never blocks past a stop request.
pub(crate) fn spawn(
    transport: SharedTransport,
    registry: ServiceRegistry,
    receive_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Listener started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    debug!("Listener shutting down");
                    break;
                }
                result = transport.receive(receive_timeout) => match result {
                    Ok(Some(datagram)) => {
                        record(&registry, &datagram, Instant::now());
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Discovery receive failed: {e}");
                        // Back off so a persistent failure does not spin.
                        tokio::select! {
                            biased;
                            _ = shutdown.recv() => {
                                debug!("Listener shutting down");
                                break;
                            }
                            _ = tokio::time::sleep(receive_timeout) => {}
                        }
                    }
                },
            }
        }
    })
}

/// Decode one datagram and refresh its endpoint. Malformed payloads are
/// dropped. Returns whether the registry was touched.
pub(crate) fn record(registry: &ServiceRegistry, datagram: &Datagram, now: Instant) -> bool {
    let Some(announcement) = Announcement::decode(&datagram.payload) else {
        trace!(
            "Ignoring {} byte datagram from {}",
            datagram.payload.len(),
            datagram.source
        );
        return false;
    };

    if registry.upsert(&announcement.service_name, &announcement.endpoint_uri, now) {
        info!(
            "Discovered '{}' at {} (from {})",
            announcement.service_name, announcement.endpoint_uri, datagram.source
        );
    } else {
        trace!("Heartbeat {announcement} from {}", datagram.source);
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
