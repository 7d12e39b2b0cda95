//! Announcer loop: periodically broadcasts this node's announcement.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::codec::Announcement;
use crate::error::DiscoveryError;
use crate::transport::SharedTransport;

/// Spawn the announcer task.
///
/// The first announcement goes out immediately, then one every `period`.
/// A failed send is logged and retried on the next tick. The task exits as
/// soon as `shutdown` fires (or its sender is dropped).
pub(crate) fn spawn(
    transport: SharedTransport,
    announcement: &Announcement,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<JoinHandle<()>, DiscoveryError> {
    let payload = announcement.encode()?;
    info!("Announcing {announcement} every {period:?}");

    Ok(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    debug!("Announcer shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match transport.send(&payload).await {
                        Ok(()) => trace!("Announcement sent"),
                        Err(e) => warn!("Announcement send failed: {e}"),
                    }
                }
            }
        }
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::transport::{Datagram, MemoryChannel, Transport};

    /// Transport whose sends always fail, counting the attempts.
    struct Unreachable {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Unreachable {
        async fn send(&self, _payload: &[u8]) -> Result<(), DiscoveryError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(DiscoveryError::Send(std::io::Error::from(
                std::io::ErrorKind::NetworkUnreachable,
            )))
        }

        async fn receive(&self, timeout: Duration) -> Result<Option<Datagram>, DiscoveryError> {
            tokio::time::sleep(timeout).await;
            Ok(None)
        }

        async fn close(&self) {}
    }

    fn users_service() -> Announcement {
        Announcement::new("UsersService", "http://10.0.0.2:8080/rest").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_announces_every_period() {
        let channel = MemoryChannel::new();
        let observer = channel.open();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = spawn(
            Arc::new(channel.open()),
            &users_service(),
            Duration::from_secs(1),
            shutdown_rx,
        )
        .unwrap();

        let mut received = 0;
        while received < 3 {
            if let Some(datagram) = observer.receive(Duration::from_secs(2)).await.unwrap() {
                assert_eq!(Announcement::decode(&datagram.payload), Some(users_service()));
                received += 1;
            }
        }

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failures_do_not_stop_the_loop() {
        let transport = Arc::new(Unreachable {
            attempts: AtomicUsize::new(0),
        });
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = spawn(
            transport.clone(),
            &users_service(),
            Duration::from_secs(1),
            shutdown_rx,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(transport.attempts.load(Ordering::SeqCst) >= 3);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_without_waiting_for_the_period() {
        let channel = MemoryChannel::new();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = spawn(
            Arc::new(channel.open()),
            &users_service(),
            Duration::from_secs(3600),
            shutdown_rx,
        )
        .unwrap();

        tokio::task::yield_now().await;
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("announcer did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_announcement_is_rejected_up_front() {
        let channel = MemoryChannel::new();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let bad = Announcement {
            service_name: "Svc".into(),
            endpoint_uri: String::new(),
        };

        let result = spawn(Arc::new(channel.open()), &bad, Duration::from_secs(1), shutdown_rx);
        assert!(matches!(result, Err(DiscoveryError::InvalidAnnouncement(_))));
    }
}
