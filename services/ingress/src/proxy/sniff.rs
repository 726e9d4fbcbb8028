//! Hostname sniffing on TCP streams.
//!
//! The inspector reads just enough of the client's first flight to find the
//! requested hostname: the HTTP Host header on the HTTP listener, the TLS
//! ClientHello SNI on the HTTPS listener. Everything read is kept in the
//! caller's buffer and must be replayed to the backend.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::trace;

use super::http_host::{parse_host, HostParse};
use super::sni::{parse_tls_record, ClientHelloError, MAX_RECORD_LEN, RECORD_HEADER_LEN};
use crate::directory::Protocol;

/// Default timeout for receiving the sniffed bytes.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cap on an HTTP request head.
pub const DEFAULT_MAX_HTTP_BYTES: usize = 16 * 1024;

/// Default cap on a TLS ClientHello: one full record.
pub const DEFAULT_MAX_TLS_BYTES: usize = RECORD_HEADER_LEN + MAX_RECORD_LEN;

const READ_CHUNK: usize = 4096;

/// Result of hostname inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffResult {
    /// Hostname as sent by the client. Empty when the request carried none.
    Found(String),
    /// The bytes are not the protocol this listener expects.
    Unrecognized,
    /// Protocol recognized but the message is malformed or over the cap.
    Malformed,
    /// Client closed before a hostname could be read.
    Closed,
    /// Timeout while waiting for enough data.
    Timeout,
    /// I/O error during read.
    IoError(String),
}

/// Configuration for hostname inspection.
#[derive(Debug, Clone)]
pub struct SniffConfig {
    /// Maximum time to wait for the hostname.
    pub timeout: Duration,
    /// Maximum bytes of HTTP request head.
    pub max_http_bytes: usize,
    /// Maximum bytes of TLS ClientHello record.
    pub max_tls_bytes: usize,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_http_bytes: DEFAULT_MAX_HTTP_BYTES,
            max_tls_bytes: DEFAULT_MAX_TLS_BYTES,
        }
    }
}

impl SniffConfig {
    fn max_bytes(&self, protocol: Protocol) -> usize {
        match protocol {
            Protocol::Http => self.max_http_bytes,
            Protocol::Https | Protocol::Quic => self.max_tls_bytes,
        }
    }
}

/// Hostname inspector for stream listeners.
#[derive(Debug, Clone, Default)]
pub struct Inspector {
    config: SniffConfig,
}

impl Inspector {
    pub fn new(config: SniffConfig) -> Self {
        Self { config }
    }

    /// Inspect a stream, reading into the provided buffer.
    ///
    /// The buffer holds every byte consumed from the stream, whatever the
    /// result.
    pub async fn inspect<R: AsyncRead + Unpin>(
        &self,
        protocol: Protocol,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> SniffResult {
        buffer.clear();

        let read = self.read_hostname(protocol, stream, buffer);
        match timeout(self.config.timeout, read).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => SniffResult::IoError(e.to_string()),
            Err(_) => SniffResult::Timeout,
        }
    }

    async fn read_hostname<R: AsyncRead + Unpin>(
        &self,
        protocol: Protocol,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> io::Result<SniffResult> {
        let limit = self.config.max_bytes(protocol);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(result) = try_parse(protocol, buffer) {
                return Ok(result);
            }
            if buffer.len() >= limit {
                trace!(bytes = buffer.len(), "sniff limit reached");
                return Ok(SniffResult::Malformed);
            }

            let want = (limit - buffer.len()).min(READ_CHUNK);
            let n = stream.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Ok(SniffResult::Closed);
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// `None` while more bytes are needed.
fn try_parse(protocol: Protocol, data: &[u8]) -> Option<SniffResult> {
    match protocol {
        Protocol::Http => match parse_host(data) {
            HostParse::Complete(host) => Some(SniffResult::Found(host.unwrap_or_default())),
            HostParse::Partial => None,
            HostParse::Invalid => Some(SniffResult::Unrecognized),
        },
        Protocol::Https => match parse_tls_record(data) {
            Ok(name) => Some(SniffResult::Found(name.unwrap_or_default())),
            Err(ClientHelloError::Incomplete) => None,
            Err(ClientHelloError::NotClientHello) => Some(SniffResult::Unrecognized),
            Err(ClientHelloError::Malformed) => Some(SniffResult::Malformed),
        },
        Protocol::Quic => Some(SniffResult::Unrecognized),
    }
}
