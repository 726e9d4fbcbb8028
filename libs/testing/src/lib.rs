//! Test fixtures for sniproute.
//!
//! Builds the bytes a real client would put on the wire:
//! - TLS ClientHello handshake messages and records
//! - QUIC client Initial packets, sealed with the RFC 9001 / RFC 9369 Initial keys

pub mod quic;
pub mod tls;

pub use quic::{client_initial, seal_initial, QuicVersion};
pub use tls::{client_hello, client_hello_record};
