//! UDP listener multiplexing peers into virtual connections.
//!
//! A single socket receives every client datagram. The read loop looks the
//! sender up in the connection table and hands the datagram to that peer's
//! task through a bounded queue; a new peer gets a new task. The loop never
//! waits on a peer: when a queue is full the datagram is dropped.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use super::backend::DEFAULT_CONNECT_TIMEOUT;
use super::virtual_conn::VirtualConnection;
use crate::directory::{Directory, Protocol};
use crate::metrics::IngressMetrics;

/// Default idle lifetime of a virtual connection.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Bytes a connection may buffer while waiting for a complete Initial.
pub const MAX_ACCUMULATED_BYTES: usize = 65536;

/// Datagrams queued per peer before the read loop starts dropping.
pub const PEER_QUEUE_CAPACITY: usize = 128;

/// Largest UDP payload.
pub(crate) const MAX_DATAGRAM_SIZE: usize = 65535;

/// Configuration for a datagram listener.
#[derive(Debug, Clone)]
pub struct DatagramConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Protocol served. Only QUIC rides on UDP.
    pub protocol: Protocol,
    /// Close a connection after this long without traffic either way.
    pub idle_timeout: Duration,
    /// Backend resolve timeout.
    pub connect_timeout: Duration,
    /// Accumulator cap while in INIT.
    pub max_accumulated: usize,
    /// Per-peer queue capacity.
    pub queue_capacity: usize,
}

impl DatagramConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            protocol: Protocol::Quic,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_accumulated: MAX_ACCUMULATED_BYTES,
            queue_capacity: PEER_QUEUE_CAPACITY,
        }
    }
}

/// What [`Shared::dispatch`] did with a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// Queued to the peer's live connection.
    Queued,
    /// Started a new connection for the peer.
    Spawned,
    /// The peer's queue was full.
    Dropped,
}

/// Table entry for a live peer.
pub(crate) struct PeerHandle {
    /// Distinguishes successive connections from the same address.
    id: u64,
    inbound: mpsc::Sender<Bytes>,
}

/// State shared by the read loop and every virtual connection.
pub(crate) struct Shared {
    pub(crate) socket: UdpSocket,
    pub(crate) local_addr: SocketAddr,
    /// `listener` metric label.
    pub(crate) label: String,
    pub(crate) config: DatagramConfig,
    pub(crate) directory: Arc<Directory>,
    pub(crate) metrics: IngressMetrics,
    pub(crate) shutdown: CancellationToken,
    table: Mutex<HashMap<SocketAddr, PeerHandle>>,
    next_id: AtomicU64,
}

impl Shared {
    /// Route one client datagram to its virtual connection.
    async fn dispatch(self: &Arc<Self>, peer: SocketAddr, datagram: Bytes) -> Dispatch {
        let mut table = self.table.lock().await;

        let datagram = match table.get(&peer) {
            Some(handle) => match handle.inbound.try_send(datagram) {
                Ok(()) => return Dispatch::Queued,
                Err(TrySendError::Full(_)) => {
                    debug!(peer = %peer, "Peer queue full, dropping datagram");
                    return Dispatch::Dropped;
                }
                // The connection closed but has not yet removed itself.
                Err(TrySendError::Closed(datagram)) => datagram,
            },
            None => datagram,
        };

        self.metrics.raw_connection(self.config.protocol, &self.label);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        if tx.try_send(datagram).is_err() {
            return Dispatch::Dropped;
        }
        table.insert(peer, PeerHandle { id, inbound: tx });
        drop(table);

        let conn = VirtualConnection::new(Arc::clone(self), id, peer, rx);
        tokio::spawn(conn.run().instrument(tracing::info_span!(
            "connection",
            peer = %peer,
            protocol = %self.config.protocol,
        )));
        Dispatch::Spawned
    }

    /// Drop `peer` from the table if it still refers to connection `id`.
    pub(crate) async fn remove(&self, peer: SocketAddr, id: u64) -> bool {
        let mut table = self.table.lock().await;
        if table.get(&peer).is_some_and(|handle| handle.id == id) {
            table.remove(&peer);
            true
        } else {
            false
        }
    }
}

/// A UDP listener for QUIC.
pub struct DatagramListener {
    shared: Arc<Shared>,
}

impl DatagramListener {
    /// Bind the shared socket.
    ///
    /// Only datagram protocols and a non-zero queue capacity are accepted.
    pub async fn bind(
        config: DatagramConfig,
        directory: Arc<Directory>,
        metrics: IngressMetrics,
    ) -> io::Result<Self> {
        if !config.protocol.is_datagram() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "protocol mismatch: {} cannot be served over UDP",
                    config.protocol
                ),
            ));
        }
        if config.queue_capacity == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "peer queue capacity must be at least 1",
            ));
        }

        let socket = UdpSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr()?;

        info!(
            bind_addr = %local_addr,
            protocol = %config.protocol,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Datagram listener bound"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                socket,
                local_addr,
                label: local_addr.to_string(),
                config,
                directory,
                metrics,
                shutdown: CancellationToken::new(),
                table: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn protocol(&self) -> Protocol {
        self.shared.config.protocol
    }

    /// Number of live virtual connections.
    pub async fn connection_count(&self) -> usize {
        self.shared.table.lock().await.len()
    }

    /// Close every virtual connection. The read loop keeps running.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Read datagrams until the socket fails permanently.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        info!(
            bind_addr = %self.shared.local_addr,
            protocol = %self.shared.config.protocol,
            "Datagram listener started"
        );

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match self.shared.socket.recv_from(&mut buf).await {
                Ok((n, peer)) => {
                    self.shared
                        .dispatch(peer, Bytes::copy_from_slice(&buf[..n]))
                        .await;
                }
                Err(e) if is_transient_recv_error(&e) => {
                    debug!(error = %e, "Transient receive error");
                }
                Err(e) => {
                    error!(bind_addr = %self.shared.local_addr, error = %e, "Receive failed");
                    self.shared.shutdown.cancel();
                    return Err(e);
                }
            }
        }
    }
}

/// ICMP errors surface on the next receive; they concern one peer only.
fn is_transient_recv_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
