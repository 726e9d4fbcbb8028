//! HTTP/1.x Host header extraction.

use tracing::trace;

/// Maximum number of request headers to parse.
const MAX_HEADERS: usize = 96;

/// Outcome of parsing the buffered start of an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostParse {
    /// Request head is complete. `None` when there is no Host header.
    Complete(Option<String>),
    /// Need more bytes.
    Partial,
    /// Not an HTTP/1.x request.
    Invalid,
}

/// Parse a request head and return its Host header, port removed.
pub fn parse_host(data: &[u8]) -> HostParse {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(data) {
        Ok(httparse::Status::Complete(_)) => {
            let host = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("host"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .map(|v| strip_port(v.trim()).to_string());
            trace!(?host, "HTTP request head parsed");
            HostParse::Complete(host)
        }
        Ok(httparse::Status::Partial) => HostParse::Partial,
        Err(e) => {
            trace!(error = %e, "not an HTTP request");
            HostParse::Invalid
        }
    }
}

/// Remove a `:port` suffix, keeping IPv6 literals (`[::1]:80` -> `[::1]`).
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}
