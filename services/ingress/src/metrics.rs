//! Prometheus metrics for the ingress listeners.
//!
//! Three families, all prefixed `sniproute_`:
//! - `raw_connections_total{protocol,transport,listener}`: accepted sockets
//!   and new UDP peers, counted before any sniffing
//! - `connections_total{protocol,transport,listener,match,backend}`:
//!   connections that reached a backend
//! - `open_connections{...same labels}`: connections currently relayed

use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::directory::{BackendDescriptor, Protocol};

pub mod labels {
    pub const PROTOCOL: &str = "protocol";
    pub const TRANSPORT: &str = "transport";
    pub const LISTENER: &str = "listener";
    pub const MATCH: &str = "match";
    pub const BACKEND: &str = "backend";
}

const NAMESPACE: &str = "sniproute";

#[derive(Clone)]
pub struct IngressMetrics {
    registry: Registry,
    raw_connections: IntCounterVec,
    connections: IntCounterVec,
    open_connections: IntGaugeVec,
}

impl IngressMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let accept_labels = [labels::PROTOCOL, labels::TRANSPORT, labels::LISTENER];
        let backend_labels = [
            labels::PROTOCOL,
            labels::TRANSPORT,
            labels::LISTENER,
            labels::MATCH,
            labels::BACKEND,
        ];

        let raw_connections = IntCounterVec::new(
            Opts::new(
                "raw_connections_total",
                "Connections accepted by a listener, before routing",
            )
            .namespace(NAMESPACE),
            &accept_labels,
        )?;
        let connections = IntCounterVec::new(
            Opts::new("connections_total", "Connections relayed to a backend").namespace(NAMESPACE),
            &backend_labels,
        )?;
        let open_connections = IntGaugeVec::new(
            Opts::new(
                "open_connections",
                "Connections currently relayed to a backend",
            )
            .namespace(NAMESPACE),
            &backend_labels,
        )?;

        registry.register(Box::new(raw_connections.clone()))?;
        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(open_connections.clone()))?;

        Ok(Self {
            registry,
            raw_connections,
            connections,
            open_connections,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Count a newly accepted client on `listener`.
    pub fn raw_connection(&self, protocol: Protocol, listener: &str) {
        self.raw_connections
            .with_label_values(&[protocol.as_str(), protocol.transport(), listener])
            .inc();
    }

    /// Record a connection that reached its backend.
    ///
    /// The open-connections gauge stays incremented until the returned guard
    /// is dropped.
    pub fn backend_connected(
        &self,
        protocol: Protocol,
        listener: &str,
        backend: &BackendDescriptor,
    ) -> OpenConnectionGuard {
        let address = backend.to_string();
        let values = Self::backend_values(protocol, listener, backend, &address);

        self.connections.with_label_values(&values).inc();
        let gauge = self.open_connections.with_label_values(&values);
        gauge.inc();
        OpenConnectionGuard { gauge }
    }

    pub fn raw_connections_total(&self, protocol: Protocol, listener: &str) -> u64 {
        self.raw_connections
            .with_label_values(&[protocol.as_str(), protocol.transport(), listener])
            .get()
    }

    pub fn open_connections(
        &self,
        protocol: Protocol,
        listener: &str,
        backend: &BackendDescriptor,
    ) -> i64 {
        let address = backend.to_string();
        self.open_connections
            .with_label_values(&Self::backend_values(protocol, listener, backend, &address))
            .get()
    }

    pub fn connections_total(
        &self,
        protocol: Protocol,
        listener: &str,
        backend: &BackendDescriptor,
    ) -> u64 {
        let address = backend.to_string();
        self.connections
            .with_label_values(&Self::backend_values(protocol, listener, backend, &address))
            .get()
    }

    fn backend_values<'a>(
        protocol: Protocol,
        listener: &'a str,
        backend: &'a BackendDescriptor,
        address: &'a str,
    ) -> [&'a str; 5] {
        [
            protocol.as_str(),
            protocol.transport(),
            listener,
            backend.matched_pattern.as_str(),
            address,
        ]
    }

    /// Encode every family in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Holds one open-connection slot; releases it on drop.
#[derive(Debug)]
pub struct OpenConnectionGuard {
    gauge: IntGauge,
}

impl Drop for OpenConnectionGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
