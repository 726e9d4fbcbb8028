//! Ingress configuration.
//!
//! Process settings come from the environment; routing comes from a TOML
//! file named by `SNIPROUTE_CONFIG_FILE`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::directory::{Directory, HostConfig, Protocol};
use crate::error::ConfigError;

const DEFAULT_CONFIG_FILE: &str = "config.toml";
const DEFAULT_UDP_IDLE_TIMEOUT_SECS: u64 = 60;

/// Ingress configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Routing file path.
    pub config_file: PathBuf,

    /// Emit diagnostic (debug) events.
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Idle lifetime of a UDP virtual connection.
    pub udp_idle_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |primary: &str, fallback: Option<&str>| {
            lookup(primary)
                .or_else(|| fallback.and_then(&lookup))
                .filter(|v| !v.is_empty())
        };

        let config_file = var("SNIPROUTE_CONFIG_FILE", Some("CONFIG_FILE"))
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string())
            .into();

        let verbose = var("SNIPROUTE_VERBOSE", Some("VERBOSE"))
            .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false"))
            .unwrap_or(false);

        let default_level = if verbose { "debug" } else { "info" };
        let log_level =
            var("SNIPROUTE_LOG_LEVEL", None).unwrap_or_else(|| default_level.to_string());

        let idle_secs: u64 = var("SNIPROUTE_UDP_IDLE_TIMEOUT_SECS", None)
            .map(|v| v.parse())
            .transpose()
            .context("SNIPROUTE_UDP_IDLE_TIMEOUT_SECS must be an integer (seconds).")?
            .unwrap_or(DEFAULT_UDP_IDLE_TIMEOUT_SECS);

        Ok(Self {
            config_file,
            verbose,
            log_level,
            udp_idle_timeout: Duration::from_secs(idle_secs.max(1)),
        })
    }
}

/// Listen addresses. An empty or missing entry disables that listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Listeners {
    pub http: Option<String>,
    pub https: Option<String>,
    pub quic: Option<String>,
    pub metrics: Option<String>,
}

/// Global per-protocol backend defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(default)]
    pub backends: HostConfig,
}

/// The routing file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingFile {
    #[serde(default)]
    pub listeners: Listeners,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub templates: BTreeMap<String, HostConfig>,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,
}

impl RoutingFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    pub fn directory(&self) -> Result<Directory, ConfigError> {
        Directory::load(&self.hosts, &self.templates, &self.defaults.backends)
    }

    /// Configured ingress listeners, in protocol order.
    pub fn ingress_addrs(&self) -> Result<Vec<(Protocol, SocketAddr)>, ConfigError> {
        let entries = [
            (Protocol::Http, "http", &self.listeners.http),
            (Protocol::Https, "https", &self.listeners.https),
            (Protocol::Quic, "quic", &self.listeners.quic),
        ];

        let mut addrs = Vec::new();
        for (protocol, name, addr) in entries {
            if let Some(addr) = resolve_bind_addr(name, addr.as_deref())? {
                addrs.push((protocol, addr));
            }
        }
        Ok(addrs)
    }

    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        resolve_bind_addr("metrics", self.listeners.metrics.as_deref())
    }
}

impl std::str::FromStr for RoutingFile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

/// Parse a listen address. `:port` binds every interface.
fn resolve_bind_addr(
    listener: &'static str,
    addr: Option<&str>,
) -> Result<Option<SocketAddr>, ConfigError> {
    let Some(addr) = addr.map(str::trim).filter(|a| !a.is_empty()) else {
        return Ok(None);
    };

    let full = match addr.strip_prefix(':') {
        Some(port) => format!("[::]:{port}"),
        None => addr.to_string(),
    };

    full.parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidListenAddr {
            listener,
            addr: addr.to_string(),
        })
}
