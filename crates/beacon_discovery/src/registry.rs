//! Service registry: soft-state map of live endpoints per service.
//!
//! Every announcement refreshes the heartbeat of its endpoint; a sweep drops
//! endpoints that have been silent for at least the expiry timeout. All
//! access goes through an internal lock, so the listener, the sweepers and
//! any number of readers can share one registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// One known endpoint of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EndpointEntry {
    /// Last time an announcement for this endpoint arrived.
    last_seen: Instant,
}

type ServiceMap = HashMap<String, HashMap<String, EndpointEntry>>;

/// Registry of live endpoints, keyed by service name then endpoint URI.
///
/// Clones share the same underlying state.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    services: Arc<Mutex<ServiceMap>>,
    timeout: Duration,
}

impl ServiceRegistry {
    /// Create an empty registry that expires endpoints after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            services: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// The expiry timeout this registry sweeps with.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a heartbeat for `endpoint_uri` under `service_name`.
    ///
    /// Returns `true` if the endpoint was not known before.
    pub fn upsert(&self, service_name: &str, endpoint_uri: &str, now: Instant) -> bool {
        let mut services = self.services.lock();
        let endpoints = services.entry(service_name.to_string()).or_default();
        match endpoints.get_mut(endpoint_uri) {
            Some(entry) => {
                entry.last_seen = entry.last_seen.max(now);
                false
            }
            None => {
                endpoints.insert(endpoint_uri.to_string(), EndpointEntry { last_seen: now });
                true
            }
        }
    }

    /// Drop every endpoint silent for at least the timeout. Returns how many
    /// were evicted.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut services = self.services.lock();
        Self::sweep_locked(&mut services, now, self.timeout)
    }

    /// Endpoint URIs currently registered under `service_name`, sweeping
    /// first. Unknown names yield an empty list.
    pub fn snapshot(&self, service_name: &str, now: Instant) -> Vec<String> {
        let mut services = self.services.lock();
        Self::sweep_locked(&mut services, now, self.timeout);
        services
            .get(service_name)
            .map(|endpoints| endpoints.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of every service with at least one live endpoint.
    pub fn services(&self, now: Instant) -> Vec<String> {
        let mut services = self.services.lock();
        Self::sweep_locked(&mut services, now, self.timeout);
        services.keys().cloned().collect()
    }

    /// Total number of registered endpoints across all services.
    pub fn len(&self) -> usize {
        self.services.lock().values().map(HashMap::len).sum()
    }

    /// Whether no endpoint is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.services.lock().clear();
    }

    fn sweep_locked(services: &mut ServiceMap, now: Instant, timeout: Duration) -> usize {
        let mut evicted = 0;
        services.retain(|_, endpoints| {
            let before = endpoints.len();
            endpoints.retain(|_, entry| now.saturating_duration_since(entry.last_seen) < timeout);
            evicted += before - endpoints.len();
            !endpoints.is_empty()
        });
        evicted
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
