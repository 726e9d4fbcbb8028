//! Per-peer virtual connection over the shared UDP socket.
//!
//! Lifecycle:
//! - INIT: datagrams are buffered until they hold a complete QUIC client
//!   Initial. The server name picks the backend.
//! - ACTIVE: a connected backend socket carries the buffered datagrams and
//!   then every later one. Backend replies go out through the shared socket.
//! - CLOSED: idle timeout, buffer overflow, no route, backend or client
//!   I/O failure, or listener shutdown.
//!
//! The task owns all of its state; closing consumes it, so a connection is
//! closed and its open-connection slot released exactly once.

use std::fmt;
use std::future::pending;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use super::backend::connect_udp;
use super::datagram::{Shared, MAX_DATAGRAM_SIZE};
use super::proxy_protocol::{ProxyProtocolV2, Transport};
use super::quic::{ClientInitial, InitialAssembler};
use crate::directory::{normalize_hostname, BackendDescriptor};
use crate::metrics::OpenConnectionGuard;

/// Why a virtual connection closed.
#[derive(Debug)]
pub(crate) enum CloseReason {
    IdleTimeout,
    Overflow,
    NoRoute,
    Backend(io::Error),
    ClientWrite(io::Error),
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::Overflow => f.write_str("initial buffer overflow"),
            CloseReason::NoRoute => f.write_str("no backend"),
            CloseReason::Backend(e) => write!(f, "backend I/O: {e}"),
            CloseReason::ClientWrite(e) => write!(f, "client write: {e}"),
            CloseReason::Shutdown => f.write_str("listener shutdown"),
        }
    }
}

enum Phase {
    Init {
        buffered: Vec<Bytes>,
        len: usize,
        assembler: InitialAssembler,
    },
    Active {
        backend: UdpSocket,
        descriptor: Arc<BackendDescriptor>,
        _open: OpenConnectionGuard,
    },
}

pub(crate) struct VirtualConnection {
    shared: Arc<Shared>,
    id: u64,
    peer: SocketAddr,
    inbound: mpsc::Receiver<Bytes>,
    phase: Phase,
}

impl VirtualConnection {
    pub(crate) fn new(
        shared: Arc<Shared>,
        id: u64,
        peer: SocketAddr,
        inbound: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            shared,
            id,
            peer,
            inbound,
            phase: Phase::Init {
                buffered: Vec::new(),
                len: 0,
                assembler: InitialAssembler::new(),
            },
        }
    }

    pub(crate) async fn run(mut self) {
        let idle_timeout = self.shared.config.idle_timeout;
        let idle = sleep(idle_timeout);
        tokio::pin!(idle);

        let shutdown = self.shared.shutdown.clone();
        let mut reply = vec![0u8; MAX_DATAGRAM_SIZE];

        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break CloseReason::Shutdown,
                _ = &mut idle => break CloseReason::IdleTimeout,
                datagram = self.inbound.recv() => {
                    let Some(datagram) = datagram else {
                        break CloseReason::Shutdown;
                    };
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    if let Err(reason) = self.on_client_datagram(datagram).await {
                        break reason;
                    }
                }
                result = recv_backend(&self.phase, &mut reply) => {
                    let n = match result {
                        Ok(n) => n,
                        Err(e) => break CloseReason::Backend(e),
                    };
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    if let Err(e) = self.shared.socket.send_to(&reply[..n], self.peer).await {
                        break CloseReason::ClientWrite(e);
                    }
                }
            }
        };

        self.close(reason).await;
    }

    async fn on_client_datagram(&mut self, datagram: Bytes) -> Result<(), CloseReason> {
        let max_accumulated = self.shared.config.max_accumulated;

        let initial = match &mut self.phase {
            Phase::Active { backend, .. } => {
                backend.send(&datagram).await.map_err(CloseReason::Backend)?;
                return Ok(());
            }
            Phase::Init {
                buffered,
                len,
                assembler,
            } => {
                if *len + datagram.len() > max_accumulated {
                    return Err(CloseReason::Overflow);
                }
                *len += datagram.len();
                let parsed = assembler.push(&datagram);
                buffered.push(datagram);

                match parsed {
                    Ok(initial) => initial,
                    Err(e) => {
                        trace!(error = %e, buffered = *len, "Client Initial not complete");
                        return Ok(());
                    }
                }
            }
        };

        self.activate(initial).await
    }

    /// Resolve, dial and flush the buffered datagrams.
    async fn activate(&mut self, initial: ClientInitial) -> Result<(), CloseReason> {
        let requested = initial.server_name.unwrap_or_default();
        let hostname = normalize_hostname(&requested);
        let protocol = self.shared.config.protocol;

        let Some(descriptor) = self.shared.directory.resolve(&hostname, protocol) else {
            debug!(hostname = %hostname, "No backend for hostname");
            return Err(CloseReason::NoRoute);
        };

        let dial_host = descriptor.dial_host(&hostname);
        let connect_timeout = self.shared.config.connect_timeout;
        let backend = connect_udp(dial_host, descriptor.port, connect_timeout)
            .await
            .map_err(|e| {
                warn!(
                    hostname = %hostname,
                    backend = %format_args!("{dial_host}:{}", descriptor.port),
                    error = %e,
                    "Backend connect failed"
                );
                CloseReason::Backend(e)
            })?;

        if descriptor.use_proxy_protocol {
            let header =
                ProxyProtocolV2::for_connection(Transport::Dgram, self.peer, self.shared.local_addr)
                    .map_err(|e| CloseReason::Backend(io::Error::other(e)))?;
            backend
                .send(&header.encode())
                .await
                .map_err(CloseReason::Backend)?;
        }

        let buffered = match &mut self.phase {
            Phase::Init { buffered, .. } => std::mem::take(buffered),
            Phase::Active { .. } => Vec::new(),
        };
        for datagram in &buffered {
            backend.send(datagram).await.map_err(CloseReason::Backend)?;
        }

        let open = self
            .shared
            .metrics
            .backend_connected(protocol, &self.shared.label, &descriptor);

        debug!(
            hostname = %hostname,
            version = ?initial.version,
            pattern = %descriptor.matched_pattern,
            backend = %descriptor,
            datagrams = buffered.len(),
            "Virtual connection active"
        );

        self.phase = Phase::Active {
            backend,
            descriptor,
            _open: open,
        };
        Ok(())
    }

    /// Remove the table entry and release the backend.
    ///
    /// The receiver is closed first, so a dispatch that still holds the old
    /// entry sees `Closed` and starts a fresh connection.
    async fn close(mut self, reason: CloseReason) {
        self.inbound.close();
        let removed = self.shared.remove(self.peer, self.id).await;
        let backend = match &self.phase {
            Phase::Active { descriptor, .. } => Some(descriptor.to_string()),
            Phase::Init { .. } => None,
        };
        debug!(reason = %reason, removed, backend = ?backend, "Virtual connection closed");
    }
}

async fn recv_backend(phase: &Phase, buf: &mut [u8]) -> io::Result<usize> {
    match phase {
        Phase::Active { backend, .. } => backend.recv(buf).await,
        Phase::Init { .. } => pending().await,
    }
}
