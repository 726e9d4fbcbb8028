//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! [`parse_client_hello`] works on a bare handshake message, which is what
//! QUIC carries in CRYPTO frames. [`parse_tls_record`] adds the TLS record
//! layer seen on a TCP stream.

use thiserror::Error;

/// TLS record type: handshake.
const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type: ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Extension type: server_name.
const EXT_SERVER_NAME: u16 = 0x0000;

/// Server name type: host_name.
const NAME_TYPE_HOST: u8 = 0x00;

/// TLS record header length.
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest TLS plaintext record.
pub const MAX_RECORD_LEN: usize = 16384;

/// Why a ClientHello could not yield a server name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClientHelloError {
    #[error("need more bytes")]
    Incomplete,
    #[error("not a TLS ClientHello")]
    NotClientHello,
    #[error("malformed ClientHello")]
    Malformed,
}

/// Parse SNI from a TLS record holding a ClientHello.
///
/// TLS Record structure:
/// - byte 0: record type (0x16 = Handshake)
/// - bytes 1-2: version
/// - bytes 3-4: record length
/// - bytes 5+: handshake message
///
/// Returns `Ok(None)` for a complete ClientHello without SNI.
pub fn parse_tls_record(data: &[u8]) -> Result<Option<String>, ClientHelloError> {
    if let Some(&first) = data.first() {
        if first != RECORD_TYPE_HANDSHAKE {
            return Err(ClientHelloError::NotClientHello);
        }
    }
    if data.len() < RECORD_HEADER_LEN {
        return Err(ClientHelloError::Incomplete);
    }

    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if record_len > MAX_RECORD_LEN {
        return Err(ClientHelloError::Malformed);
    }

    let available = &data[RECORD_HEADER_LEN..data.len().min(RECORD_HEADER_LEN + record_len)];
    match parse_client_hello(available) {
        // The handshake outgrew this record: a ClientHello spanning records
        // is not supported.
        Err(ClientHelloError::Incomplete) if available.len() == record_len => {
            Err(ClientHelloError::Malformed)
        }
        other => other,
    }
}

/// Parse SNI from a handshake message.
///
/// Handshake ClientHello:
/// - byte 0: handshake type (0x01 = ClientHello)
/// - bytes 1-3: length
/// - bytes 4-5: client version
/// - bytes 6-37: random (32 bytes)
/// - byte 38: session ID length
/// - variable: session ID
/// - 2 bytes: cipher suites length
/// - variable: cipher suites
/// - 1 byte: compression methods length
/// - variable: compression methods
/// - 2 bytes: extensions length
/// - variable: extensions
pub fn parse_client_hello(handshake: &[u8]) -> Result<Option<String>, ClientHelloError> {
    if let Some(&msg_type) = handshake.first() {
        if msg_type != HANDSHAKE_CLIENT_HELLO {
            return Err(ClientHelloError::NotClientHello);
        }
    }
    if handshake.len() < 4 {
        return Err(ClientHelloError::Incomplete);
    }

    let body_len =
        (handshake[1] as usize) << 16 | (handshake[2] as usize) << 8 | handshake[3] as usize;
    if handshake.len() < 4 + body_len {
        return Err(ClientHelloError::Incomplete);
    }

    let mut hello = Reader::new(&handshake[4..4 + body_len]);
    hello.skip(2 + 32)?;
    hello.vec8()?;
    hello.vec16()?;
    hello.vec8()?;

    if hello.is_empty() {
        // No extensions at all.
        return Ok(None);
    }

    let mut extensions = Reader::new(hello.vec16()?);
    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_data = extensions.vec16()?;
        if ext_type == EXT_SERVER_NAME {
            return parse_sni_extension(ext_data);
        }
    }

    Ok(None)
}

/// Parse the SNI extension value.
///
/// SNI extension structure:
/// - 2 bytes: list length
/// - for each entry:
///   - 1 byte: name type (0 = hostname)
///   - 2 bytes: name length
///   - variable: name
fn parse_sni_extension(data: &[u8]) -> Result<Option<String>, ClientHelloError> {
    let mut list = Reader::new(Reader::new(data).vec16()?);
    while !list.is_empty() {
        let name_type = list.u8()?;
        let name = list.vec16()?;
        if name_type == NAME_TYPE_HOST {
            return std::str::from_utf8(name)
                .map(|s| Some(s.to_string()))
                .map_err(|_| ClientHelloError::Malformed);
        }
    }
    Ok(None)
}

/// Bounds-checked cursor over a complete message.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ClientHelloError> {
        if self.buf.len() < n {
            return Err(ClientHelloError::Malformed);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize) -> Result<(), ClientHelloError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, ClientHelloError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ClientHelloError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn vec8(&mut self) -> Result<&'a [u8], ClientHelloError> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    fn vec16(&mut self) -> Result<&'a [u8], ClientHelloError> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}
