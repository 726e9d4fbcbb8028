//! Protocol-agnostic handle over the two listener kinds.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::datagram::{DatagramConfig, DatagramListener};
use super::listener::{Listener, ListenerConfig};
use crate::directory::{Directory, Protocol};
use crate::metrics::IngressMetrics;

/// A bound listener: TCP for HTTP and HTTPS, UDP for QUIC.
pub enum Ingress {
    Stream(Arc<Listener>),
    Datagram(Arc<DatagramListener>),
}

impl Ingress {
    /// Bind the right kind of listener for `protocol`.
    pub async fn bind(
        protocol: Protocol,
        bind_addr: SocketAddr,
        udp_idle_timeout: Duration,
        directory: Arc<Directory>,
        metrics: IngressMetrics,
    ) -> io::Result<Self> {
        if protocol.is_datagram() {
            let mut config = DatagramConfig::new(bind_addr);
            config.protocol = protocol;
            config.idle_timeout = udp_idle_timeout;
            let listener = DatagramListener::bind(config, directory, metrics).await?;
            Ok(Ingress::Datagram(Arc::new(listener)))
        } else {
            let config = ListenerConfig::new(bind_addr, protocol);
            let listener = Listener::bind(config, directory, metrics).await?;
            Ok(Ingress::Stream(Arc::new(listener)))
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Ingress::Stream(l) => l.protocol(),
            Ingress::Datagram(l) => l.protocol(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Ingress::Stream(l) => l.local_addr(),
            Ingress::Datagram(l) => l.local_addr(),
        }
    }

    /// Serve until the listener fails permanently.
    pub async fn run(self) -> io::Result<()> {
        match self {
            Ingress::Stream(l) => l.run().await,
            Ingress::Datagram(l) => l.run().await,
        }
    }
}
