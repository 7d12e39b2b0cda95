//! Datagram transport: multicast group membership, send and receive.
//!
//! The [`Transport`] trait is what the announcer and listener loops talk to.
//! [`MulticastTransport`] is the real UDP implementation; [`MemoryChannel`]
//! hands out [`MemoryTransport`]s that share an in-process broadcast hub,
//! which is how tests and single-process setups run without a network.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use crate::codec::MAX_DATAGRAM_SIZE;
use crate::error::DiscoveryError;

/// A datagram received from the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Where the datagram came from.
    pub source: SocketAddr,
}

/// A shared one-to-many datagram channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram to every member of the channel.
    async fn send(&self, payload: &[u8]) -> Result<(), DiscoveryError>;

    /// Wait at most `timeout` for the next datagram. `Ok(None)` means the
    /// wait timed out.
    async fn receive(&self, timeout: Duration) -> Result<Option<Datagram>, DiscoveryError>;

    /// Leave the channel. Further sends and receives fail.
    async fn close(&self);
}

// ---------------------------------------------------------------------------
// UDP multicast
// ---------------------------------------------------------------------------

/// UDP socket bound to the group port and joined to the multicast group.
pub struct MulticastTransport {
    socket: UdpSocket,
    group: SocketAddrV4,
    interface: Ipv4Addr,
    closed: AtomicBool,
}

impl MulticastTransport {
    /// Bind the group port and join the group on `interface`.
    pub async fn open(group: SocketAddrV4, interface: Ipv4Addr) -> Result<Self, DiscoveryError> {
        Self::open_with_ttl(group, interface, 1).await
    }

    /// Like [`open`](Self::open) with an explicit multicast TTL.
    pub async fn open_with_ttl(
        group: SocketAddrV4,
        interface: Ipv4Addr,
        ttl: u32,
    ) -> Result<Self, DiscoveryError> {
        let bind_err = |source| DiscoveryError::Bind {
            addr: SocketAddr::V4(group),
            source,
        };

        let socket = Self::bind_shared(group.port()).map_err(bind_err)?;
        socket
            .join_multicast_v4(*group.ip(), interface)
            .map_err(bind_err)?;
        socket.set_multicast_loop_v4(true).map_err(bind_err)?;
        socket.set_multicast_ttl_v4(ttl).map_err(bind_err)?;

        info!("Joined multicast group {group} on interface {interface}");
        Ok(Self {
            socket,
            group,
            interface,
            closed: AtomicBool::new(false),
        })
    }

    /// Bind the group port with address reuse, so several nodes on one host
    /// can be members of the same group.
    fn bind_shared(port: u16) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&bind_addr.into())?;
        UdpSocket::from_std(socket.into())
    }

    /// The group this transport is a member of.
    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        Ok(self.socket.local_addr()?)
    }

    fn ensure_open(&self) -> Result<(), std::io::Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "transport closed",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MulticastTransport {
    async fn send(&self, payload: &[u8]) -> Result<(), DiscoveryError> {
        self.ensure_open().map_err(DiscoveryError::Send)?;
        self.socket
            .send_to(payload, SocketAddr::V4(self.group))
            .await
            .map_err(DiscoveryError::Send)?;
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Datagram>, DiscoveryError> {
        self.ensure_open().map_err(DiscoveryError::Receive)?;
        // One spare byte so oversized datagrams are detectable by length.
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, source))) => {
                buf.truncate(len);
                Ok(Some(Datagram {
                    payload: buf,
                    source,
                }))
            }
            Ok(Err(e)) => Err(DiscoveryError::Receive(e)),
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self
            .socket
            .leave_multicast_v4(*self.group.ip(), self.interface)
        {
            debug!("Leaving multicast group {} failed: {e}", self.group);
        }
        info!("Left multicast group {}", self.group);
    }
}

// ---------------------------------------------------------------------------
// In-process channel
// ---------------------------------------------------------------------------

/// Capacity of the in-process hub before slow receivers start lagging.
const MEMORY_CHANNEL_CAPACITY: usize = 1024;

/// An in-process stand-in for a multicast group.
///
/// Every [`MemoryTransport`] opened on the channel receives every datagram
/// sent after it was opened, its own included, like a multicast socket with
/// loopback enabled.
#[derive(Clone)]
pub struct MemoryChannel {
    tx: broadcast::Sender<Datagram>,
}

impl MemoryChannel {
    /// Create an empty channel.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(MEMORY_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Join the channel.
    pub fn open(&self) -> MemoryTransport {
        MemoryTransport {
            tx: self.tx.clone(),
            rx: Mutex::new(self.tx.subscribe()),
            source: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            closed: AtomicBool::new(false),
        }
    }

    /// Join the channel, stamping outgoing datagrams with `source`.
    pub fn open_as(&self, source: SocketAddr) -> MemoryTransport {
        MemoryTransport {
            source,
            ..self.open()
        }
    }

    /// Put raw bytes on the channel as if they arrived from `source`.
    /// Returns how many transports will see them.
    pub fn inject(&self, payload: impl Into<Vec<u8>>, source: SocketAddr) -> usize {
        self.tx
            .send(Datagram {
                payload: payload.into(),
                source,
            })
            .unwrap_or(0)
    }

    /// Number of transports currently joined.
    pub fn member_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// One member of a [`MemoryChannel`].
pub struct MemoryTransport {
    tx: broadcast::Sender<Datagram>,
    rx: Mutex<broadcast::Receiver<Datagram>>,
    source: SocketAddr,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn closed_error() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::NotConnected, "transport closed")
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, payload: &[u8]) -> Result<(), DiscoveryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DiscoveryError::Send(Self::closed_error()));
        }
        // No receivers is not an error: datagrams to an empty group vanish.
        let _ = self.tx.send(Datagram {
            payload: payload.to_vec(),
            source: self.source,
        });
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Datagram>, DiscoveryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DiscoveryError::Receive(Self::closed_error()));
        }
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Ok(datagram)) => Ok(Some(datagram)),
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                // Lost datagrams are what UDP would do anyway.
                debug!("Memory transport dropped {skipped} datagrams");
                Ok(None)
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                Err(DiscoveryError::Receive(Self::closed_error()))
            }
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Shared handle to a transport, as held by the loops.
pub type SharedTransport = Arc<dyn Transport>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
