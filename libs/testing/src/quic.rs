//! Sealed QUIC client Initial packets.
//!
//! Packets use a 4-byte packet number, an 8-byte source connection ID, an
//! empty token and a 2-byte length varint. Keys follow RFC 9001 section 5.2
//! (v1) and RFC 9369 section 3.3 (v2).

use aes::cipher::{generic_array::GenericArray, BlockEncrypt};
use aes::Aes128;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::tls;

const V1_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];
const V2_SALT: [u8; 20] = [
    0x0d, 0xed, 0xe3, 0xde, 0xf7, 0x00, 0xa6, 0xdb, 0x81, 0x93, 0x81, 0xbe, 0x6e, 0x26, 0x9d, 0xcb,
    0xf9, 0xbd, 0x2e, 0xd9,
];

const SOURCE_CID: [u8; 8] = [0x5e, 0x1f, 0x0c, 0xa1, 0x77, 0x42, 0x9d, 0x03];
const PN_LEN: usize = 4;
const TAG_LEN: usize = 16;

/// Datagram size clients must pad Initial packets to (RFC 9000 section 14.1).
pub const MIN_INITIAL_SIZE: usize = 1200;

/// QUIC versions the fixtures can seal for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicVersion {
    V1,
    V2,
}

impl QuicVersion {
    pub fn number(self) -> u32 {
        match self {
            QuicVersion::V1 => 0x0000_0001,
            QuicVersion::V2 => 0x6b33_43cf,
        }
    }

    fn salt(self) -> &'static [u8] {
        match self {
            QuicVersion::V1 => &V1_SALT,
            QuicVersion::V2 => &V2_SALT,
        }
    }

    fn initial_type_bits(self) -> u8 {
        match self {
            QuicVersion::V1 => 0b00,
            QuicVersion::V2 => 0b01,
        }
    }

    fn label(self, purpose: &str) -> String {
        match self {
            QuicVersion::V1 => format!("quic {purpose}"),
            QuicVersion::V2 => format!("quicv2 {purpose}"),
        }
    }
}

/// Client Initial packet-protection keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialKeys {
    pub key: [u8; 16],
    pub iv: [u8; 12],
    pub hp: [u8; 16],
}

/// Derive the client Initial keys for a destination connection ID.
pub fn client_keys(version: QuicVersion, dcid: &[u8]) -> InitialKeys {
    let initial = Hkdf::<Sha256>::new(Some(version.salt()), dcid);
    let mut client_secret = [0u8; 32];
    expand_label(&initial, "client in", &mut client_secret);

    let client = Hkdf::<Sha256>::from_prk(&client_secret).expect("32-byte PRK is valid");
    let mut keys = InitialKeys {
        key: [0; 16],
        iv: [0; 12],
        hp: [0; 16],
    };
    expand_label(&client, &version.label("key"), &mut keys.key);
    expand_label(&client, &version.label("iv"), &mut keys.iv);
    expand_label(&client, &version.label("hp"), &mut keys.hp);
    keys
}

fn expand_label(hkdf: &Hkdf<Sha256>, label: &str, out: &mut [u8]) {
    let full = format!("tls13 {label}");
    let mut info = Vec::with_capacity(4 + full.len());
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push(full.len() as u8);
    info.extend_from_slice(full.as_bytes());
    info.push(0);
    hkdf.expand(&info, out).expect("HKDF output length is valid");
}

/// Seal one client Initial packet carrying a single CRYPTO frame.
///
/// The payload is zero-padded so the packet is at least `min_len` bytes.
pub fn seal_initial(
    version: QuicVersion,
    dcid: &[u8],
    packet_number: u32,
    crypto_offset: u64,
    crypto: &[u8],
    min_len: usize,
) -> Vec<u8> {
    let mut plaintext = Vec::with_capacity(crypto.len() + 16);
    plaintext.push(0x06);
    push_varint(&mut plaintext, crypto_offset);
    push_varint(&mut plaintext, crypto.len() as u64);
    plaintext.extend_from_slice(crypto);

    let header_len = 1 + 4 + 1 + dcid.len() + 1 + SOURCE_CID.len() + 1 + 2 + PN_LEN;
    let sealed_len = header_len + plaintext.len() + TAG_LEN;
    if sealed_len < min_len {
        plaintext.resize(plaintext.len() + (min_len - sealed_len), 0);
    }

    let length = PN_LEN + plaintext.len() + TAG_LEN;
    assert!(length < 0x4000, "packet too large for a 2-byte length");

    let mut packet = Vec::with_capacity(header_len + length);
    packet.push(0xc0 | (version.initial_type_bits() << 4) | (PN_LEN as u8 - 1));
    packet.extend_from_slice(&version.number().to_be_bytes());
    packet.push(dcid.len() as u8);
    packet.extend_from_slice(dcid);
    packet.push(SOURCE_CID.len() as u8);
    packet.extend_from_slice(&SOURCE_CID);
    packet.push(0x00);
    packet.extend_from_slice(&(0x4000 | length as u16).to_be_bytes());
    let pn_offset = packet.len();
    packet.extend_from_slice(&packet_number.to_be_bytes());

    let keys = client_keys(version, dcid);
    let mut nonce = keys.iv;
    for (slot, byte) in nonce[12 - PN_LEN..].iter_mut().zip(packet_number.to_be_bytes()) {
        *slot ^= byte;
    }
    let cipher = Aes128Gcm::new_from_slice(&keys.key).expect("16-byte key");
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad: &packet,
            },
        )
        .expect("AES-GCM seal");
    packet.extend_from_slice(&sealed);

    let sample_start = pn_offset + PN_LEN;
    let mut mask = GenericArray::clone_from_slice(&packet[sample_start..sample_start + 16]);
    Aes128::new(GenericArray::from_slice(&keys.hp)).encrypt_block(&mut mask);
    packet[0] ^= mask[0] & 0x0f;
    for i in 0..PN_LEN {
        packet[pn_offset + i] ^= mask[1 + i];
    }
    packet
}

/// A complete, padded client Initial whose ClientHello names `server_name`.
pub fn client_initial(version: QuicVersion, dcid: &[u8], server_name: Option<&str>) -> Vec<u8> {
    let hello = tls::client_hello(server_name);
    seal_initial(version, dcid, 0, 0, &hello, MIN_INITIAL_SIZE)
}

/// The ClientHello for `server_name` split across `parts` Initial packets,
/// each one padded to a full datagram.
pub fn split_client_initial(
    version: QuicVersion,
    dcid: &[u8],
    server_name: Option<&str>,
    parts: usize,
) -> Vec<Vec<u8>> {
    let hello = tls::client_hello(server_name);
    let chunk = hello.len().div_ceil(parts.max(1));
    hello
        .chunks(chunk)
        .enumerate()
        .map(|(i, piece)| {
            seal_initial(
                version,
                dcid,
                i as u32,
                (i * chunk) as u64,
                piece,
                MIN_INITIAL_SIZE,
            )
        })
        .collect()
}

fn push_varint(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0x3f => buf.push(value as u8),
        0x40..=0x3fff => buf.extend_from_slice(&(0x4000 | value as u16).to_be_bytes()),
        0x4000..=0x3fff_ffff => buf.extend_from_slice(&(0x8000_0000 | value as u32).to_be_bytes()),
        _ => buf.extend_from_slice(&(0xc000_0000_0000_0000 | value).to_be_bytes()),
    }
}
