//! Backend directory and hostname matching.
//!
//! The directory maps `(protocol, hostname)` to a [`BackendDescriptor`].
//! It is built once at startup (see [`Directory::load`]) and shared
//! read-only across every listener behind an `Arc`.
//!
//! Matching rules:
//! - Hostnames are normalized to lowercase with the trailing dot trimmed
//! - An exact entry always wins
//! - With no wildcard patterns configured, a miss falls back to `__default__`
//! - With wildcards (`_.<suffix>`), the lookup walks up one label at a time:
//!   `a.b.example.com` tries `_.b.example.com`, `_.example.com`, `_.com`,
//!   then `__default__`

mod loader;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

pub use loader::{BackendBlock, HostConfig};

/// Pattern of the catch-all entry.
pub const HOST_DEFAULT: &str = "__default__";

/// Prefix marking a wildcard pattern.
pub const WILDCARD_PREFIX: &str = "_.";

/// Protocol of a listener, selecting both the sniffer and the directory table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
    Quic,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Http, Protocol::Https, Protocol::Quic];

    /// Metric label value.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
            Protocol::Quic => "QUIC",
        }
    }

    /// Transport label value: QUIC rides on UDP, everything else on TCP.
    pub fn transport(self) -> &'static str {
        if self.is_datagram() {
            "UDP"
        } else {
            "TCP"
        }
    }

    pub fn is_datagram(self) -> bool {
        matches!(self, Protocol::Quic)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where to send a routed connection. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    /// Backend hostname or IP literal.
    pub host: String,
    /// Backend port (1-65535).
    pub port: u16,
    /// Prefix the backend stream with a PROXY v2 header.
    pub use_proxy_protocol: bool,
    /// Dial the client-requested hostname instead of `host`.
    pub host_passthrough: bool,
    /// Directory pattern that produced this entry.
    pub matched_pattern: String,
}

impl BackendDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            use_proxy_protocol: false,
            host_passthrough: false,
            matched_pattern: String::new(),
        }
    }

    pub fn with_proxy_protocol(mut self, enabled: bool) -> Self {
        self.use_proxy_protocol = enabled;
        self
    }

    pub fn with_host_passthrough(mut self, enabled: bool) -> Self {
        self.host_passthrough = enabled;
        self
    }

    /// Host to dial for a client that asked for `requested`.
    pub fn dial_host<'a>(&'a self, requested: &'a str) -> &'a str {
        if self.host_passthrough {
            requested
        } else {
            &self.host
        }
    }
}

impl fmt::Display for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Normalize a hostname for matching.
///
/// - Convert to lowercase
/// - Trim trailing dot
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}

/// Immutable `(protocol, pattern) -> descriptor` tables.
#[derive(Debug, Default)]
pub struct Directory {
    http: HashMap<String, Arc<BackendDescriptor>>,
    https: HashMap<String, Arc<BackendDescriptor>>,
    quic: HashMap<String, Arc<BackendDescriptor>>,
    wildcard_enabled: bool,
}

impl Directory {
    pub fn builder() -> DirectoryBuilder {
        DirectoryBuilder::default()
    }

    fn table(&self, protocol: Protocol) -> &HashMap<String, Arc<BackendDescriptor>> {
        match protocol {
            Protocol::Http => &self.http,
            Protocol::Https => &self.https,
            Protocol::Quic => &self.quic,
        }
    }

    /// Whether any configured pattern is a wildcard.
    pub fn wildcard_enabled(&self) -> bool {
        self.wildcard_enabled
    }

    /// Number of entries served for `protocol`.
    pub fn len(&self, protocol: Protocol) -> usize {
        self.table(protocol).len()
    }

    pub fn is_empty(&self) -> bool {
        Protocol::ALL.iter().all(|p| self.table(*p).is_empty())
    }

    /// Resolve a normalized hostname.
    ///
    /// `None` means the connection is deliberately not served.
    pub fn resolve(&self, hostname: &str, protocol: Protocol) -> Option<Arc<BackendDescriptor>> {
        let table = self.table(protocol);

        if let Some(found) = table.get(hostname) {
            return Some(Arc::clone(found));
        }

        if !self.wildcard_enabled {
            return table.get(HOST_DEFAULT).cloned();
        }

        let mut labels: Vec<&str> = hostname.split('.').collect();
        loop {
            let skip = if labels.first() == Some(&"_") { 2 } else { 1 };
            labels.drain(..skip.min(labels.len()));
            if labels.is_empty() {
                break;
            }

            let candidate = format!("{WILDCARD_PREFIX}{}", labels.join("."));
            if let Some(found) = table.get(&candidate) {
                debug!(hostname, pattern = %candidate, "wildcard match");
                return Some(Arc::clone(found));
            }
            labels.insert(0, "_");
        }

        table.get(HOST_DEFAULT).cloned()
    }
}

/// Incremental construction of a [`Directory`].
#[derive(Debug, Default)]
pub struct DirectoryBuilder {
    directory: Directory,
}

impl DirectoryBuilder {
    /// Add an entry. The pattern is normalized and recorded as the
    /// descriptor's `matched_pattern`.
    pub fn insert(
        mut self,
        protocol: Protocol,
        pattern: &str,
        mut descriptor: BackendDescriptor,
    ) -> Self {
        let pattern = normalize_hostname(pattern);
        if pattern.starts_with(WILDCARD_PREFIX) {
            self.directory.wildcard_enabled = true;
        }
        descriptor.matched_pattern = pattern.clone();

        let table = match protocol {
            Protocol::Http => &mut self.directory.http,
            Protocol::Https => &mut self.directory.https,
            Protocol::Quic => &mut self.directory.quic,
        };
        table.insert(pattern, Arc::new(descriptor));
        self
    }

    /// Record a pattern without an entry (a disabled host still
    /// turns wildcard matching on).
    pub fn note_pattern(mut self, pattern: &str) -> Self {
        if normalize_hostname(pattern).starts_with(WILDCARD_PREFIX) {
            self.directory.wildcard_enabled = true;
        }
        self
    }

    pub fn build(self) -> Directory {
        self.directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn backend(host: &str) -> BackendDescriptor {
        BackendDescriptor::new(host, 9000)
    }

    fn wildcard_directory() -> Directory {
        Directory::builder()
            .insert(Protocol::Http, "exact.example.com", backend("exact"))
            .insert(Protocol::Http, "_.example.com", backend("example"))
            .insert(Protocol::Http, "_.b.example.com", backend("b-example"))
            .insert(Protocol::Http, "_.com", backend("com"))
            .insert(Protocol::Http, HOST_DEFAULT, backend("default"))
            .build()
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("Example.COM."), "example.com");
        assert_eq!(normalize_hostname("example.com"), "example.com");
        assert_eq!(normalize_hostname(""), "");
    }

    #[rstest]
    #[case("exact.example.com", "exact")]
    #[case("a.b.example.com", "b-example")]
    #[case("b.example.com", "example")]
    #[case("a.example.com", "example")]
    #[case("deep.a.c.example.com", "example")]
    #[case("other.com", "com")]
    #[case("example.org", "default")]
    #[case("localhost", "default")]
    #[case("", "default")]
    fn wildcard_resolution(#[case] hostname: &str, #[case] expected: &str) {
        let directory = wildcard_directory();
        let found = directory.resolve(hostname, Protocol::Http).unwrap();
        assert_eq!(found.host, expected);
    }

    #[test]
    fn exact_entry_wins_without_wildcards() {
        let directory = Directory::builder()
            .insert(Protocol::Https, "a.example.com", backend("a"))
            .insert(Protocol::Https, HOST_DEFAULT, backend("default"))
            .build();

        assert!(!directory.wildcard_enabled());
        let a = directory.resolve("a.example.com", Protocol::Https).unwrap();
        let b = directory.resolve("b.example.com", Protocol::Https).unwrap();
        assert_eq!(a.host, "a");
        assert_eq!(b.host, "default");
    }

    #[test]
    fn subdomain_miss_without_wildcards_is_none() {
        let directory = Directory::builder()
            .insert(Protocol::Http, "example.com", backend("example"))
            .build();

        assert!(directory.resolve("a.example.com", Protocol::Http).is_none());
    }

    #[test]
    fn miss_without_default_is_none() {
        let directory = Directory::builder()
            .insert(Protocol::Quic, "_.example.com", backend("example"))
            .build();

        assert!(directory.resolve("q.example.org", Protocol::Quic).is_none());
        assert!(directory.resolve("q.example.com", Protocol::Http).is_none());
    }

    #[test]
    fn protocols_are_separate_tables() {
        let directory = Directory::builder()
            .insert(Protocol::Http, "a.example.com", backend("http"))
            .insert(Protocol::Quic, "a.example.com", backend("quic"))
            .build();

        let http = directory.resolve("a.example.com", Protocol::Http).unwrap();
        let quic = directory.resolve("a.example.com", Protocol::Quic).unwrap();
        assert_eq!(http.host, "http");
        assert_eq!(quic.host, "quic");
        assert!(directory.resolve("a.example.com", Protocol::Https).is_none());
        assert_eq!(directory.len(Protocol::Http), 1);
    }

    #[test]
    fn lone_wildcard_label_terminates() {
        let directory = wildcard_directory();
        assert_eq!(
            directory.resolve("_", Protocol::Http).unwrap().host,
            "default"
        );
        assert_eq!(
            directory.resolve("_.", Protocol::Http).unwrap().host,
            "default"
        );
    }

    #[test]
    fn matched_pattern_is_recorded() {
        let directory = wildcard_directory();
        let found = directory
            .resolve("x.b.example.com", Protocol::Http)
            .unwrap();
        assert_eq!(found.matched_pattern, "_.b.example.com");
        assert_eq!(found.to_string(), "b-example:9000");
    }

    #[test]
    fn dial_host_honours_passthrough() {
        let plain = BackendDescriptor::new("10.0.0.1", 80);
        assert_eq!(plain.dial_host("app.example.com"), "10.0.0.1");

        let passthrough = plain.with_host_passthrough(true);
        assert_eq!(passthrough.dial_host("app.example.com"), "app.example.com");
    }
}
