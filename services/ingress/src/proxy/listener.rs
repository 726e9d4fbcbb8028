//! TCP listener and connection handling.
//!
//! One listener per stream protocol (HTTP or HTTPS). Each accepted
//! connection is sniffed for its hostname, resolved against the directory,
//! dialed, optionally prefixed with a PROXY v2 header and then relayed
//! until either side finishes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn, Instrument};

use super::backend::{connect_tcp, DEFAULT_CONNECT_TIMEOUT};
use super::proxy_protocol::{ProxyProtocolV2, Transport};
use super::sniff::{Inspector, SniffConfig, SniffResult};
use crate::directory::{normalize_hostname, Directory, Protocol};
use crate::metrics::IngressMetrics;

const RELAY_BUFFER: usize = 8192;

/// Configuration for a stream listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Protocol served; selects the sniffer and directory table.
    pub protocol: Protocol,
    /// Hostname inspection limits.
    pub sniff: SniffConfig,
    /// Backend connect timeout.
    pub connect_timeout: Duration,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr, protocol: Protocol) -> Self {
        Self {
            bind_addr,
            protocol,
            sniff: SniffConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// A TCP listener for one stream protocol.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    /// `listener` metric label.
    label: String,
    directory: Arc<Directory>,
    metrics: IngressMetrics,
    inspector: Inspector,
}

impl Listener {
    /// Bind the listening socket.
    ///
    /// QUIC is rejected: it needs a datagram listener.
    pub async fn bind(
        config: ListenerConfig,
        directory: Arc<Directory>,
        metrics: IngressMetrics,
    ) -> io::Result<Self> {
        if config.protocol.is_datagram() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "protocol mismatch: {} cannot be served over TCP",
                    config.protocol
                ),
            ));
        }

        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            protocol = %config.protocol,
            "Listener bound"
        );

        Ok(Self {
            inspector: Inspector::new(config.sniff.clone()),
            label: local_addr.to_string(),
            listener,
            local_addr,
            config,
            directory,
            metrics,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    /// Accept connections until the socket fails permanently.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        info!(bind_addr = %self.local_addr, protocol = %self.config.protocol, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    self.metrics
                        .raw_connection(self.config.protocol, &self.label);

                    let listener = Arc::clone(&self);
                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                                debug!(error = %e, "Connection error");
                            }
                        }
                        .instrument(tracing::info_span!(
                            "connection",
                            peer = %peer_addr,
                            protocol = %self.config.protocol,
                        )),
                    );
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, "Transient accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    error!(bind_addr = %self.local_addr, error = %e, "Accept failed");
                    return Err(e);
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
    ) -> io::Result<()> {
        let protocol = self.config.protocol;
        let mut sniffed = Vec::new();

        let requested = match self
            .inspector
            .inspect(protocol, &mut client, &mut sniffed)
            .await
        {
            SniffResult::Found(hostname) => hostname,
            other => {
                debug!(result = ?other, bytes = sniffed.len(), "Hostname not found");
                return Ok(());
            }
        };

        let hostname = normalize_hostname(&requested);
        let Some(descriptor) = self.directory.resolve(&hostname, protocol) else {
            debug!(hostname = %hostname, "No backend for hostname");
            return Ok(());
        };

        let dial_host = descriptor.dial_host(&hostname);
        let mut backend =
            match connect_tcp(dial_host, descriptor.port, self.config.connect_timeout).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        hostname = %hostname,
                        backend = %format_args!("{dial_host}:{}", descriptor.port),
                        error = %e,
                        "Backend connect failed"
                    );
                    return Ok(());
                }
            };

        let _open = self
            .metrics
            .backend_connected(protocol, &self.label, &descriptor);

        debug!(
            hostname = %hostname,
            pattern = %descriptor.matched_pattern,
            backend = %descriptor,
            "Connected to backend"
        );

        if descriptor.use_proxy_protocol {
            let local_addr = client.local_addr()?;
            let header = ProxyProtocolV2::for_connection(Transport::Stream, peer_addr, local_addr)
                .map_err(io::Error::other)?;
            backend.write_all(&header.encode()).await?;
            debug!("PROXY v2 header sent");
        }

        backend.write_all(&sniffed).await?;

        let (bytes_to_backend, bytes_from_backend) = relay(&mut client, &mut backend).await;
        debug!(bytes_to_backend, bytes_from_backend, "Connection closed");

        Ok(())
    }
}

/// Accept errors that concern one connection rather than the socket.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Copy both directions until either one finishes.
///
/// Returns (bytes_to_b, bytes_from_b) copied by the time the first side
/// stopped. Both streams are closed when the caller drops them.
async fn relay(a: &mut TcpStream, b: &mut TcpStream) -> (u64, u64) {
    let (mut a_read, mut a_write) = a.split();
    let (mut b_read, mut b_write) = b.split();

    let mut to_b = 0u64;
    let mut from_b = 0u64;

    tokio::select! {
        result = pump(&mut a_read, &mut b_write, &mut to_b) => {
            if let Err(e) = result {
                debug!(error = %e, "client to backend copy failed");
            }
        }
        result = pump(&mut b_read, &mut a_write, &mut from_b) => {
            if let Err(e) = result {
                debug!(error = %e, "backend to client copy failed");
            }
        }
    }

    (to_b, from_b)
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return writer.shutdown().await;
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}
