//! Discovery: lifecycle and query surface of the subsystem.
//!
//! [`Discovery`] owns the transport, the registry and the two background
//! loops. It moves through `Created → Running → Stopped`:
//!
//! - [`start`](Discovery::start) opens the transport and spawns the listener,
//!   plus the announcer when announcing.
//! - [`lookup`](Discovery::lookup) answers from the in-memory registry and
//!   is only valid while running; before `start` and after `stop` it fails
//!   with [`DiscoveryError::NotRunning`].
//! - [`stop`](Discovery::stop) signals both loops, waits for them to exit,
//!   then closes the transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::registry::ServiceRegistry;
use crate::transport::{MulticastTransport, SharedTransport};
use crate::{announcer, listener};

/// Lifecycle state of a [`Discovery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Constructed, not started yet.
    Created,
    /// Loops are running.
    Running,
    /// Stopped for good.
    Stopped,
}

/// Multicast service discovery node.
pub struct Discovery {
    config: DiscoveryConfig,
    registry: ServiceRegistry,
    /// Pre-built transport; `None` means open a multicast socket on start.
    preset_transport: Option<SharedTransport>,
    running: Option<Running>,
    state: DiscoveryState,
}

/// Resources that only exist while running.
struct Running {
    transport: SharedTransport,
    shutdown_tx: broadcast::Sender<()>,
    listener: JoinHandle<()>,
    announcer: Option<JoinHandle<()>>,
}

impl Discovery {
    /// Create a discovery that talks UDP multicast per `config`.
    pub fn new(config: DiscoveryConfig) -> Self {
        let registry = ServiceRegistry::new(config.expiry_timeout);
        Self {
            config,
            registry,
            preset_transport: None,
            running: None,
            state: DiscoveryState::Created,
        }
    }

    /// Create a discovery over an already-open transport, e.g. a
    /// [`MemoryTransport`](crate::transport::MemoryTransport).
    pub fn with_transport(config: DiscoveryConfig, transport: SharedTransport) -> Self {
        let registry = ServiceRegistry::new(config.expiry_timeout);
        Self {
            config,
            registry,
            preset_transport: Some(transport),
            running: None,
            state: DiscoveryState::Created,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Whether the loops are running.
    pub fn is_running(&self) -> bool {
        self.state == DiscoveryState::Running
    }

    /// The configuration this node was built with.
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// The underlying registry.
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Start listening, and announcing too when `announcing` is set.
    ///
    /// On error the node stays in `Created` and may be started again.
    pub async fn start(&mut self, announcing: bool) -> Result<(), DiscoveryError> {
        match self.state {
            DiscoveryState::Created => {}
            DiscoveryState::Running => return Err(DiscoveryError::AlreadyStarted),
            DiscoveryState::Stopped => return Err(DiscoveryError::AlreadyStopped),
        }

        self.config.validate()?;
        let announcement = match (&self.config.announcement, announcing) {
            (Some(announcement), true) => Some(announcement.clone()),
            (None, true) => return Err(DiscoveryError::NoAnnouncement),
            (_, false) => None,
        };

        let transport: SharedTransport = match &self.preset_transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(
                MulticastTransport::open_with_ttl(
                    self.config.group,
                    self.config.interface,
                    self.config.multicast_ttl,
                )
                .await?,
            ),
        };

        let (shutdown_tx, _) = broadcast::channel(1);

        let announcer = match &announcement {
            Some(announcement) => match announcer::spawn(
                Arc::clone(&transport),
                announcement,
                self.config.announce_period,
                shutdown_tx.subscribe(),
            ) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    transport.close().await;
                    return Err(e);
                }
            },
            None => None,
        };

        let listener = listener::spawn(
            Arc::clone(&transport),
            self.registry.clone(),
            self.config.receive_timeout,
            shutdown_tx.subscribe(),
        );

        self.running = Some(Running {
            transport,
            shutdown_tx,
            listener,
            announcer,
        });
        self.state = DiscoveryState::Running;

        match &announcement {
            Some(announcement) => info!(
                "Discovery started on {} announcing {announcement}",
                self.config.group
            ),
            None => info!("Discovery started on {} (listen only)", self.config.group),
        }
        Ok(())
    }

    /// Endpoints currently known for `service_name`. Unknown names give an
    /// empty list.
    pub fn lookup(&self, service_name: &str) -> Result<Vec<String>, DiscoveryError> {
        if !self.is_running() {
            return Err(DiscoveryError::NotRunning);
        }
        Ok(self.registry.snapshot(service_name, Instant::now()))
    }

    /// Names of all services with at least one live endpoint.
    pub fn services(&self) -> Result<Vec<String>, DiscoveryError> {
        if !self.is_running() {
            return Err(DiscoveryError::NotRunning);
        }
        Ok(self.registry.services(Instant::now()))
    }

    /// Poll [`lookup`](Self::lookup) until `service_name` has at least one
    /// endpoint, or fail with [`DiscoveryError::Timeout`].
    pub async fn wait_for(
        &self,
        service_name: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, DiscoveryError> {
        // A timeout too large to represent means no deadline.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let endpoints = self.lookup(service_name)?;
            if !endpoints.is_empty() {
                return Ok(endpoints);
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DiscoveryError::Timeout(timeout));
                    }
                    self.config.poll_interval.min(deadline - now)
                }
                None => self.config.poll_interval,
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Stop both loops, wait for them to exit and close the transport.
    pub async fn stop(&mut self) -> Result<(), DiscoveryError> {
        match self.state {
            DiscoveryState::Running => {}
            DiscoveryState::Created => return Err(DiscoveryError::NotStarted),
            DiscoveryState::Stopped => return Err(DiscoveryError::AlreadyStopped),
        }
        self.state = DiscoveryState::Stopped;

        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(());

            if let Some(announcer) = running.announcer {
                if let Err(e) = announcer.await {
                    warn!("Announcer task ended abnormally: {e}");
                }
            }
            if let Err(e) = running.listener.await {
                warn!("Listener task ended abnormally: {e}");
            }
            debug!("Discovery loops joined");

            running.transport.close().await;
        }

        self.registry.clear();
        info!("Discovery stopped");
        Ok(())
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        // Dropped without `stop`: make sure the loops do not outlive us.
        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(());
            if let Some(announcer) = running.announcer {
                announcer.abort();
            }
            running.listener.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Announcement;
    use crate::transport::{MemoryChannel, Transport};

    fn announcing_config(uri: &str) -> DiscoveryConfig {
        DiscoveryConfig::announcing(Announcement::new("UsersService", uri).unwrap())
    }

    #[test]
    fn test_new_discovery_is_created() {
        let discovery = Discovery::new(DiscoveryConfig::default());
        assert_eq!(discovery.state(), DiscoveryState::Created);
        assert!(!discovery.is_running());
        assert!(discovery.registry().is_empty());
        assert_eq!(
            discovery.registry().timeout(),
            discovery.config().expiry_timeout
        );
    }

    #[test]
    fn test_lookup_before_start_fails() {
        let discovery = Discovery::new(DiscoveryConfig::default());
        assert!(matches!(
            discovery.lookup("UsersService"),
            Err(DiscoveryError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_stop_before_start_fails() {
        let mut discovery = Discovery::new(DiscoveryConfig::default());
        assert!(matches!(discovery.stop().await, Err(DiscoveryError::NotStarted)));
        assert_eq!(discovery.state(), DiscoveryState::Created);
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let channel = MemoryChannel::new();
        let mut discovery =
            Discovery::with_transport(DiscoveryConfig::default(), Arc::new(channel.open()));

        discovery.start(false).await.unwrap();
        assert!(matches!(
            discovery.start(false).await,
            Err(DiscoveryError::AlreadyStarted)
        ));
        assert!(discovery.is_running());

        discovery.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_stop_fails() {
        let channel = MemoryChannel::new();
        let mut discovery =
            Discovery::with_transport(DiscoveryConfig::default(), Arc::new(channel.open()));

        discovery.start(false).await.unwrap();
        discovery.stop().await.unwrap();

        assert!(matches!(
            discovery.start(false).await,
            Err(DiscoveryError::AlreadyStopped)
        ));
        assert!(matches!(
            discovery.stop().await,
            Err(DiscoveryError::AlreadyStopped)
        ));
        assert!(matches!(
            discovery.lookup("UsersService"),
            Err(DiscoveryError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_announcing_without_announcement_fails() {
        let channel = MemoryChannel::new();
        let mut discovery =
            Discovery::with_transport(DiscoveryConfig::default(), Arc::new(channel.open()));

        assert!(matches!(
            discovery.start(true).await,
            Err(DiscoveryError::NoAnnouncement)
        ));
        assert_eq!(discovery.state(), DiscoveryState::Created);

        // Still usable in listen-only mode.
        discovery.start(false).await.unwrap();
        discovery.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_keeps_created_state() {
        let mut config = DiscoveryConfig::default();
        config.group = "10.1.2.3:2266".parse().unwrap();
        let mut discovery = Discovery::new(config);

        assert!(matches!(
            discovery.start(false).await,
            Err(DiscoveryError::Config(_))
        ));
        assert_eq!(discovery.state(), DiscoveryState::Created);
    }

    #[tokio::test]
    async fn test_announcing_node_finds_itself() {
        let channel = MemoryChannel::new();
        let mut discovery = Discovery::with_transport(
            announcing_config("http://10.0.0.2:8080/rest"),
            Arc::new(channel.open()),
        );

        discovery.start(true).await.unwrap();
        let endpoints = discovery
            .wait_for("UsersService", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(endpoints, vec!["http://10.0.0.2:8080/rest".to_string()]);
        assert_eq!(discovery.services().unwrap(), vec!["UsersService".to_string()]);

        discovery.stop().await.unwrap();
        assert!(discovery.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out() {
        let channel = MemoryChannel::new();
        let mut discovery =
            Discovery::with_transport(DiscoveryConfig::default(), Arc::new(channel.open()));
        discovery.start(false).await.unwrap();

        let result = discovery
            .wait_for("UsersService", Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(DiscoveryError::Timeout(_))));

        discovery.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_without_deadline() {
        let channel = MemoryChannel::new();
        let mut discovery =
            Discovery::with_transport(DiscoveryConfig::default(), Arc::new(channel.open()));
        discovery.start(false).await.unwrap();
        let source = "10.0.0.9:2266".parse().unwrap();

        // Already registered: answered on the first lookup.
        channel.inject("UsersService\thttp://a", source);
        tokio::time::sleep(discovery.config().poll_interval).await;
        let endpoints = discovery
            .wait_for("UsersService", Duration::MAX)
            .await
            .unwrap();
        assert_eq!(endpoints, vec!["http://a".to_string()]);

        // Not yet registered: keeps polling until it shows up.
        let late = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            channel.inject("OrdersService\thttp://b", source);
        };
        let (endpoints, ()) = tokio::join!(
            discovery.wait_for("OrdersService", Duration::from_secs(u64::MAX)),
            late
        );
        assert_eq!(endpoints.unwrap(), vec!["http://b".to_string()]);

        discovery.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_transport() {
        let channel = MemoryChannel::new();
        let transport = Arc::new(channel.open());
        let mut discovery =
            Discovery::with_transport(DiscoveryConfig::default(), transport.clone());

        discovery.start(false).await.unwrap();
        discovery.stop().await.unwrap();

        assert!(transport.send(b"late").await.is_err());
    }
}
