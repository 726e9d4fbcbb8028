//! Protocol-sniffing L4 proxy.
//!
//! This module provides:
//! - TCP listeners that sniff the HTTP Host header or TLS SNI
//! - A UDP listener that splits one socket into per-peer virtual
//!   connections and reads SNI from the QUIC Initial
//! - PROXY protocol v2 injection
//! - Bidirectional relaying
//!
//! ## Architecture
//!
//! ```text
//! TCP client -> Listener -> Inspector (Host / SNI) -> Directory -> Backend
//!                                                         |
//!                                             PROXY v2 STREAM header (if enabled)
//!
//! UDP client -> DatagramListener -> VirtualConnection (Initial SNI) -> Directory -> Backend
//!                                                                          |
//!                                                          PROXY v2 DGRAM header (if enabled)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use sniproute_ingress::{Directory, Ingress, IngressMetrics, Protocol};
//!
//! let directory = Arc::new(directory);
//! let metrics = IngressMetrics::new()?;
//!
//! let ingress = Ingress::bind(
//!     Protocol::Https,
//!     "[::]:443".parse()?,
//!     Duration::from_secs(60),
//!     directory,
//!     metrics,
//! )
//! .await?;
//! ingress.run().await?;
//! ```

mod backend;
mod datagram;
mod http_host;
mod ingress;
mod listener;
mod proxy_protocol;
pub mod quic;
mod sni;
mod sniff;
mod virtual_conn;

pub use backend::{connect_tcp, connect_udp, DEFAULT_CONNECT_TIMEOUT};
pub use datagram::{
    DatagramConfig, DatagramListener, DEFAULT_IDLE_TIMEOUT, MAX_ACCUMULATED_BYTES,
    PEER_QUEUE_CAPACITY,
};
pub use http_host::{parse_host, strip_port, HostParse};
pub use ingress::Ingress;
pub use listener::{Listener, ListenerConfig};
pub use proxy_protocol::{encode, parse_proxy_v2, ProxyProtocolV2, Transport};
pub use sni::{parse_client_hello, parse_tls_record, ClientHelloError};
pub use sniff::{Inspector, SniffConfig, SniffResult};
