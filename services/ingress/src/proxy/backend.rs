//! Backend dialing.
//!
//! One attempt per connection with a bounded connect timeout; there is no
//! pooling, retry or health tracking.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Strip IPv6 literal brackets (`[::1]` -> `::1`).
fn bare_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Open a TCP connection to `host:port`.
///
/// Name resolution and connect share the timeout. Every resolved address
/// is tried in order until one connects.
pub async fn connect_tcp(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> io::Result<TcpStream> {
    let host = bare_host(host);
    match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            debug!(backend = %format_args!("{host}:{port}"), "backend connected");
            Ok(stream)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {host}:{port} timed out after {connect_timeout:?}"),
        )),
    }
}

/// Bind a UDP socket connected to `host:port`.
///
/// The local address is unspecified in the same family as the backend.
pub async fn connect_udp(
    host: &str,
    port: u16,
    resolve_timeout: Duration,
) -> io::Result<UdpSocket> {
    let host = bare_host(host);
    let addr = timeout(resolve_timeout, resolve_first(host, port))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("resolving {host} timed out after {resolve_timeout:?}"),
            )
        })??;

    let local: SocketAddr = if addr.is_ipv4() {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    debug!(backend = %addr, local = %socket.local_addr()?, "backend socket connected");
    Ok(socket)
}

async fn resolve_first(host: &str, port: u16) -> io::Result<SocketAddr> {
    lookup_host((host, port)).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {host}"),
        )
    })
}
