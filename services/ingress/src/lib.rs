pub mod config;
pub mod directory;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod server;

pub use config::{Config, RoutingFile};
pub use directory::{normalize_hostname, BackendDescriptor, Directory, Protocol};
pub use error::{ConfigError, ProxyHeaderError};
pub use metrics::{IngressMetrics, OpenConnectionGuard};
pub use proxy::{
    DatagramConfig, DatagramListener, Ingress, Inspector, Listener, ListenerConfig,
    ProxyProtocolV2, SniffConfig, SniffResult, Transport,
};
