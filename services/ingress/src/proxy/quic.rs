//! QUIC client Initial decryption for SNI extraction (RFC 9001, RFC 9369).
//!
//! Client Initial packets are protected with keys every observer can derive
//! from the Destination Connection ID. Recovering the server name means:
//!
//! 1. Walk the long-header packets in the bytes received so far
//! 2. Derive the client Initial keys (HKDF-SHA256)
//! 3. Remove header protection (AES-128-ECB) and open the payload (AES-128-GCM)
//! 4. Reassemble CRYPTO frames from offset 0
//! 5. Read the SNI from the TLS ClientHello
//!
//! A ClientHello can span several Initial packets and a packet can span
//! several datagrams. [`InitialAssembler`] is fed one datagram at a time,
//! opens each packet once and reports [`QuicError::Incomplete`] until the
//! ClientHello is complete.

use std::collections::BTreeMap;

use aes::cipher::{generic_array::GenericArray, BlockEncrypt};
use aes::Aes128;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use tracing::trace;

use super::sni::{parse_client_hello, ClientHelloError};

/// QUIC v1 Initial salt (RFC 9001 Section 5.2).
const V1_INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];

/// QUIC v2 Initial salt (RFC 9369 Section 3.3.1).
const V2_INITIAL_SALT: [u8; 20] = [
    0x0d, 0xed, 0xe3, 0xde, 0xf7, 0x00, 0xa6, 0xdb, 0x81, 0x93, 0x81, 0xbe, 0x6e, 0x26, 0x9d, 0xcb,
    0xf9, 0xbd, 0x2e, 0xd9,
];

const VERSION_1: u32 = 0x0000_0001;
const VERSION_2: u32 = 0x6b33_43cf;

/// Longest connection ID allowed in a v1 long header.
const MAX_CID_LEN: usize = 20;

const TAG_LEN: usize = 16;
const HP_SAMPLE_LEN: usize = 16;

/// Header protection always samples as if the packet number were 4 bytes.
const HP_SAMPLE_OFFSET: usize = 4;

const FRAME_PADDING: u64 = 0x00;
const FRAME_PING: u64 = 0x01;
const FRAME_ACK: u64 = 0x02;
const FRAME_ACK_ECN: u64 = 0x03;
const FRAME_CRYPTO: u64 = 0x06;
const FRAME_CONNECTION_CLOSE: u64 = 0x1c;

/// Why no server name could be read (yet).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuicError {
    #[error("client Initial incomplete")]
    Incomplete,
    #[error("unsupported QUIC version {0:#010x}")]
    UnsupportedVersion(u32),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("Initial packet failed authentication")]
    Decrypt,
}

/// Versions whose Initial keys can be derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicVersion {
    V1,
    V2,
}

impl QuicVersion {
    fn from_wire(version: u32) -> Option<Self> {
        match version {
            VERSION_1 => Some(QuicVersion::V1),
            VERSION_2 => Some(QuicVersion::V2),
            _ => None,
        }
    }

    fn salt(self) -> &'static [u8; 20] {
        match self {
            QuicVersion::V1 => &V1_INITIAL_SALT,
            QuicVersion::V2 => &V2_INITIAL_SALT,
        }
    }

    fn label_prefix(self) -> &'static str {
        match self {
            QuicVersion::V1 => "quic",
            QuicVersion::V2 => "quicv2",
        }
    }

    /// Long header packet type from the two type bits.
    ///
    /// RFC 9369 rotates the codepoints.
    fn packet_type(self, first_byte: u8) -> PacketType {
        let bits = (first_byte >> 4) & 0x03;
        match (self, bits) {
            (QuicVersion::V1, 0) | (QuicVersion::V2, 1) => PacketType::Initial,
            (QuicVersion::V1, 1) | (QuicVersion::V2, 2) => PacketType::ZeroRtt,
            (QuicVersion::V1, 2) | (QuicVersion::V2, 3) => PacketType::Handshake,
            _ => PacketType::Retry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

/// What a complete client Initial flight revealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInitial {
    pub version: QuicVersion,
    /// Destination connection ID of the first Initial packet.
    pub dcid: Vec<u8>,
    /// SNI from the ClientHello, if present.
    pub server_name: Option<String>,
}

/// Client Initial packet-protection keys.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InitialKeys {
    key: [u8; 16],
    iv: [u8; 12],
    hp: [u8; 16],
}

/// Extract the ClientHello server name from a buffer of client datagrams.
pub fn parse_client_initial(data: &[u8]) -> Result<ClientInitial, QuicError> {
    InitialAssembler::new().push(data)
}

/// Incremental client Initial parser for one peer.
///
/// Datagrams are pushed in arrival order. Every complete packet is opened
/// exactly once and its CRYPTO frames are kept; the bytes of a packet that
/// is still arriving wait for the rest. The ClientHello is only reparsed
/// when the contiguous CRYPTO prefix grows.
#[derive(Default)]
pub struct InitialAssembler {
    /// Bytes after the last complete packet.
    partial: Vec<u8>,
    crypto: CryptoStream,
    keys: Option<CachedKeys>,
    /// Version and DCID of the first Initial opened.
    first: Option<(QuicVersion, Vec<u8>)>,
    opened: usize,
}

/// Keys for the DCID most recently seen.
struct CachedKeys {
    version: QuicVersion,
    dcid: Vec<u8>,
    keys: InitialKeys,
}

impl InitialAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial packets decrypted so far.
    pub fn packets_opened(&self) -> usize {
        self.opened
    }

    /// Feed one datagram.
    ///
    /// Returns [`QuicError::Incomplete`] until the ClientHello is whole. A
    /// packet that fails to open is discarded and its error returned; later
    /// datagrams can still complete the flight.
    pub fn push(&mut self, datagram: &[u8]) -> Result<ClientInitial, QuicError> {
        self.partial.extend_from_slice(datagram);
        let before = self.crypto.contiguous().len();
        let walked = self.walk_packets();

        if self.crypto.contiguous().len() > before {
            match parse_client_hello(self.crypto.contiguous()) {
                Ok(server_name) => {
                    if let Some((version, dcid)) = self.first.clone() {
                        return Ok(ClientInitial {
                            version,
                            dcid,
                            server_name,
                        });
                    }
                }
                Err(ClientHelloError::Incomplete) => {}
                Err(ClientHelloError::NotClientHello) => {
                    return Err(QuicError::Malformed("CRYPTO stream is not a ClientHello"));
                }
                Err(ClientHelloError::Malformed) => {
                    return Err(QuicError::Malformed("malformed ClientHello"));
                }
            }
        }

        walked?;
        Err(QuicError::Incomplete)
    }

    /// Open every complete packet in `partial` and drop its bytes.
    fn walk_packets(&mut self) -> Result<(), QuicError> {
        let Self {
            partial,
            crypto,
            keys,
            first,
            opened,
        } = self;

        let mut pos = 0;
        let result = loop {
            if pos >= partial.len() {
                break Ok(());
            }
            // Datagrams may be padded with zeros after the last packet.
            if partial[pos] == 0 {
                pos += 1;
                continue;
            }

            let packet = match LongHeader::parse(&partial[pos..]) {
                Ok(packet) => packet,
                Err(QuicError::Incomplete) => break Ok(()),
                Err(e) => {
                    // No packet boundary to resync on.
                    pos = partial.len();
                    break Err(e);
                }
            };
            let end = pos + packet.len;
            trace!(
                packet_type = ?packet.packet_type,
                len = packet.len,
                "QUIC long header packet"
            );

            let step = match packet.packet_type {
                PacketType::Initial => {
                    *opened += 1;
                    cached_keys(keys, packet.version, packet.dcid)
                        .and_then(|keys| open_initial(&partial[pos..end], &packet, keys))
                        .and_then(|payload| read_frames(&payload, crypto))
                        .map(|()| {
                            first.get_or_insert_with(|| (packet.version, packet.dcid.to_vec()));
                        })
                }
                PacketType::ZeroRtt | PacketType::Handshake => Ok(()),
                PacketType::Retry => Err(QuicError::Malformed("Retry packet from client")),
            };

            pos = end;
            if let Err(e) = step {
                break Err(e);
            }
        };

        partial.drain(..pos);
        result
    }
}

/// Keys for `dcid`, derived only when the DCID or version changes.
fn cached_keys<'c>(
    cache: &'c mut Option<CachedKeys>,
    version: QuicVersion,
    dcid: &[u8],
) -> Result<&'c InitialKeys, QuicError> {
    let stale = cache
        .as_ref()
        .is_none_or(|cached| cached.version != version || cached.dcid != dcid);
    if stale {
        *cache = Some(CachedKeys {
            version,
            dcid: dcid.to_vec(),
            keys: derive_client_keys(version, dcid)?,
        });
    }
    cache
        .as_ref()
        .map(|cached| &cached.keys)
        .ok_or(QuicError::Malformed("key derivation failed"))
}

/// Long header fields needed to open a packet (still header-protected).
struct LongHeader<'a> {
    version: QuicVersion,
    packet_type: PacketType,
    dcid: &'a [u8],
    /// Offset of the packet number field.
    pn_offset: usize,
    /// Total packet length including header and tag.
    len: usize,
}

impl<'a> LongHeader<'a> {
    /// Parse a header at the start of `data`, which must hold the whole
    /// packet or the result is `Incomplete`.
    fn parse(data: &'a [u8]) -> Result<Self, QuicError> {
        let mut cursor = Cursor::new(data);
        let first_byte = cursor.u8().ok_or(QuicError::Incomplete)?;
        if first_byte & 0x80 == 0 {
            return Err(QuicError::Malformed("short header packet"));
        }

        let wire_version = cursor.u32().ok_or(QuicError::Incomplete)?;
        if wire_version == 0 {
            return Err(QuicError::Malformed("version negotiation packet"));
        }
        let version = QuicVersion::from_wire(wire_version)
            .ok_or(QuicError::UnsupportedVersion(wire_version))?;
        if first_byte & 0x40 == 0 {
            return Err(QuicError::Malformed("fixed bit not set"));
        }

        let dcid = cursor.cid()?;
        cursor.cid()?;

        let packet_type = version.packet_type(first_byte);
        if packet_type == PacketType::Retry {
            return Err(QuicError::Malformed("Retry packet from client"));
        }
        if packet_type == PacketType::Initial {
            let token_len = cursor.varint().ok_or(QuicError::Incomplete)?;
            cursor.skip(token_len).ok_or(QuicError::Incomplete)?;
        }

        let length = cursor.varint().ok_or(QuicError::Incomplete)?;
        let pn_offset = cursor.pos;
        let len = usize::try_from(length)
            .ok()
            .and_then(|l| l.checked_add(pn_offset))
            .ok_or(QuicError::Malformed("length overflow"))?;
        if len > data.len() {
            return Err(QuicError::Incomplete);
        }

        Ok(Self {
            version,
            packet_type,
            dcid,
            pn_offset,
            len,
        })
    }
}

/// Remove header protection from an Initial packet and decrypt its payload.
fn open_initial(
    packet: &[u8],
    header: &LongHeader<'_>,
    keys: &InitialKeys,
) -> Result<Vec<u8>, QuicError> {
    let sample_start = header.pn_offset + HP_SAMPLE_OFFSET;
    let sample = packet
        .get(sample_start..sample_start + HP_SAMPLE_LEN)
        .ok_or(QuicError::Malformed("packet too short for header protection sample"))?;
    let mask = header_protection_mask(&keys.hp, sample);

    let first_byte = packet[0] ^ (mask[0] & 0x0f);
    let pn_len = (first_byte & 0x03) as usize + 1;
    let payload_start = header.pn_offset + pn_len;
    if payload_start + TAG_LEN > packet.len() {
        return Err(QuicError::Malformed("packet too short for AEAD tag"));
    }

    let mut aad = packet[..payload_start].to_vec();
    aad[0] = first_byte;
    let mut packet_number: u64 = 0;
    for i in 0..pn_len {
        let byte = aad[header.pn_offset + i] ^ mask[1 + i];
        aad[header.pn_offset + i] = byte;
        packet_number = packet_number << 8 | byte as u64;
    }

    let mut nonce = keys.iv;
    for (slot, byte) in nonce[4..].iter_mut().zip(packet_number.to_be_bytes()) {
        *slot ^= byte;
    }

    let cipher = Aes128Gcm::new_from_slice(&keys.key).map_err(|_| QuicError::Decrypt)?;
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &packet[payload_start..],
                aad: &aad,
            },
        )
        .map_err(|_| QuicError::Decrypt)
}

/// Derive client Initial keys.
///
/// - initial_secret = HKDF-Extract(salt, DCID)
/// - client_initial_secret = HKDF-Expand-Label(initial_secret, "client in", 32)
/// - key, iv, hp = HKDF-Expand-Label(client_initial_secret, "<prefix> key|iv|hp")
///
/// where the prefix is `quic` for v1 and `quicv2` for v2.
fn derive_client_keys(version: QuicVersion, dcid: &[u8]) -> Result<InitialKeys, QuicError> {
    const KDF: QuicError = QuicError::Malformed("key derivation failed");

    let initial = Hkdf::<Sha256>::new(Some(version.salt()), dcid);
    let mut client_secret = [0u8; 32];
    initial
        .expand(&expand_label_info("client in", 32), &mut client_secret)
        .map_err(|_| KDF)?;

    let client = Hkdf::<Sha256>::from_prk(&client_secret).map_err(|_| KDF)?;
    let prefix = version.label_prefix();
    let mut keys = InitialKeys {
        key: [0; 16],
        iv: [0; 12],
        hp: [0; 16],
    };
    client
        .expand(&expand_label_info(&format!("{prefix} key"), 16), &mut keys.key)
        .map_err(|_| KDF)?;
    client
        .expand(&expand_label_info(&format!("{prefix} iv"), 12), &mut keys.iv)
        .map_err(|_| KDF)?;
    client
        .expand(&expand_label_info(&format!("{prefix} hp"), 16), &mut keys.hp)
        .map_err(|_| KDF)?;
    Ok(keys)
}

/// HKDF-Expand-Label `info` (TLS 1.3 HkdfLabel with an empty context).
fn expand_label_info(label: &str, length: u16) -> Vec<u8> {
    let full = format!("tls13 {label}");
    let mut info = Vec::with_capacity(4 + full.len());
    info.extend_from_slice(&length.to_be_bytes());
    info.push(full.len() as u8);
    info.extend_from_slice(full.as_bytes());
    info.push(0);
    info
}

fn header_protection_mask(hp: &[u8; 16], sample: &[u8]) -> [u8; 16] {
    let mut block = GenericArray::clone_from_slice(sample);
    Aes128::new(GenericArray::from_slice(hp)).encrypt_block(&mut block);
    let mut mask = [0u8; 16];
    mask.copy_from_slice(&block);
    mask
}

/// Walk the frames of a decrypted Initial payload.
fn read_frames(payload: &[u8], crypto: &mut CryptoStream) -> Result<(), QuicError> {
    const BAD_FRAME: QuicError = QuicError::Malformed("truncated frame");

    let mut cursor = Cursor::new(payload);
    while !cursor.is_empty() {
        let frame_type = cursor.varint().ok_or(BAD_FRAME)?;
        match frame_type {
            FRAME_PADDING | FRAME_PING => {}
            FRAME_ACK | FRAME_ACK_ECN => {
                // Largest acknowledged, ACK delay.
                cursor.varint().ok_or(BAD_FRAME)?;
                cursor.varint().ok_or(BAD_FRAME)?;
                let ranges = cursor.varint().ok_or(BAD_FRAME)?;
                // First range, then gap + length per additional range.
                cursor.varint().ok_or(BAD_FRAME)?;
                for _ in 0..ranges {
                    cursor.varint().ok_or(BAD_FRAME)?;
                    cursor.varint().ok_or(BAD_FRAME)?;
                }
                if frame_type == FRAME_ACK_ECN {
                    for _ in 0..3 {
                        cursor.varint().ok_or(BAD_FRAME)?;
                    }
                }
            }
            FRAME_CRYPTO => {
                let offset = cursor.varint().ok_or(BAD_FRAME)?;
                let len = cursor.varint().ok_or(BAD_FRAME)?;
                let data = cursor.bytes(len).ok_or(BAD_FRAME)?;
                crypto.insert(offset, data);
            }
            FRAME_CONNECTION_CLOSE => {
                return Err(QuicError::Malformed("client closed the connection"));
            }
            _ => return Err(QuicError::Malformed("frame not allowed in Initial")),
        }
    }
    Ok(())
}

/// CRYPTO stream reassembly from offset 0.
#[derive(Debug, Default)]
struct CryptoStream {
    assembled: Vec<u8>,
    /// Fragments beyond the contiguous prefix, keyed by offset.
    pending: BTreeMap<u64, Vec<u8>>,
}

impl CryptoStream {
    fn insert(&mut self, offset: u64, data: &[u8]) {
        if offset + data.len() as u64 <= self.assembled.len() as u64 {
            return;
        }
        self.pending
            .entry(offset)
            .and_modify(|held| {
                if data.len() > held.len() {
                    *held = data.to_vec();
                }
            })
            .or_insert_with(|| data.to_vec());

        while let Some(entry) = self.pending.first_entry() {
            let assembled = self.assembled.len() as u64;
            if *entry.key() > assembled {
                break;
            }
            let (offset, data) = entry.remove_entry();
            let end = offset + data.len() as u64;
            if end > assembled {
                let skip = (assembled - offset) as usize;
                self.assembled.extend_from_slice(&data[skip..]);
            }
        }
    }

    fn contiguous(&self) -> &[u8] {
        &self.assembled
    }
}

/// Minimal big-endian reader.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn bytes(&mut self, len: u64) -> Option<&'a [u8]> {
        let len = usize::try_from(len).ok()?;
        let end = self.pos.checked_add(len)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn skip(&mut self, len: u64) -> Option<()> {
        self.bytes(len).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        self.bytes(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Connection ID with its one-byte length prefix.
    fn cid(&mut self) -> Result<&'a [u8], QuicError> {
        let len = self.u8().ok_or(QuicError::Incomplete)? as usize;
        if len > MAX_CID_LEN {
            return Err(QuicError::Malformed("connection ID too long"));
        }
        self.bytes(len as u64).ok_or(QuicError::Incomplete)
    }

    /// Variable-length integer (RFC 9000 Section 16).
    fn varint(&mut self) -> Option<u64> {
        let first = *self.buf.get(self.pos)?;
        let len = 1usize << (first >> 6);
        let raw = self.bytes(len as u64)?;
        let mut value = (first & 0x3f) as u64;
        for byte in &raw[1..] {
            value = value << 8 | *byte as u64;
        }
        Some(value)
    }
}
