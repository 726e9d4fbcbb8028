//! TLS ClientHello fixtures.

/// Build a TLS 1.3 style ClientHello handshake message (no record layer).
///
/// The SNI extension is included only when `server_name` is set.
pub fn client_hello(server_name: Option<&str>) -> Vec<u8> {
    let mut body = Vec::with_capacity(256);

    // legacy_version
    body.extend_from_slice(&[0x03, 0x03]);
    // random
    body.extend((0u8..32).map(|i| i.wrapping_mul(7)));
    // legacy_session_id
    body.push(32);
    body.extend((0u8..32).map(|i| 0xa0 ^ i));
    // cipher_suites: TLS_AES_128_GCM_SHA256, TLS_AES_256_GCM_SHA384
    body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x13, 0x02]);
    // legacy_compression_methods: null
    body.extend_from_slice(&[0x01, 0x00]);

    let mut extensions = Vec::new();
    if let Some(name) = server_name {
        let name = name.as_bytes();
        let entry_len = 3 + name.len();
        push_u16(&mut extensions, 0x0000);
        push_u16(&mut extensions, (2 + entry_len) as u16);
        push_u16(&mut extensions, entry_len as u16);
        extensions.push(0x00);
        push_u16(&mut extensions, name.len() as u16);
        extensions.extend_from_slice(name);
    }
    // supported_versions: TLS 1.3
    extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);
    // ALPN: h3
    extensions.extend_from_slice(&[0x00, 0x10, 0x00, 0x05, 0x00, 0x03, 0x02, b'h', b'3']);

    push_u16(&mut body, extensions.len() as u16);
    body.extend_from_slice(&extensions);

    let mut message = Vec::with_capacity(4 + body.len());
    message.push(0x01);
    message.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    message.extend_from_slice(&body);
    message
}

/// Wrap a ClientHello in a single TLS handshake record.
pub fn client_hello_record(server_name: Option<&str>) -> Vec<u8> {
    let message = client_hello(server_name);
    let mut record = Vec::with_capacity(5 + message.len());
    record.extend_from_slice(&[0x16, 0x03, 0x01]);
    push_u16(&mut record, message.len() as u16);
    record.extend_from_slice(&message);
    record
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}
