//! Typed errors for configuration loading and header encoding.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::directory::Protocol;

/// Fatal problems found while loading the routing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read routing file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse routing file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("host {pattern:?} has no backend host for {protocol}")]
    MissingHost { pattern: String, protocol: Protocol },

    #[error("host {pattern:?} has no backend port for {protocol}")]
    MissingPort { pattern: String, protocol: Protocol },

    #[error("host {pattern:?} has invalid port {port} for {protocol}")]
    InvalidPort {
        pattern: String,
        protocol: Protocol,
        port: i64,
    },

    #[error("host {pattern:?} references unknown template {template:?}")]
    UnknownTemplate { pattern: String, template: String },

    #[error("template {template:?} may not reference another template")]
    NestedTemplate { template: String },

    #[error("invalid listen address {addr:?} for {listener} listener")]
    InvalidListenAddr {
        listener: &'static str,
        addr: String,
    },
}

/// Errors building a PROXY protocol header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyHeaderError {
    #[error("source {src} and destination {dst} are different address families")]
    MixedFamilies { src: SocketAddr, dst: SocketAddr },
}
