//! PROXY Protocol v2 header generation.
//!
//! Backends with `proxy_protocol` enabled receive one header before any
//! payload: on the stream for TCP, as the first datagram for QUIC.
//!
//! Wire format (HAProxy PROXY protocol, version 2):
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length
//! - variable: addresses and ports

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::ProxyHeaderError;

/// PROXY protocol v2 signature (12 bytes).
const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Address family: AF_INET (IPv4).
const AF_INET: u8 = 0x10;

/// Address family: AF_INET6 (IPv6).
const AF_INET6: u8 = 0x20;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// Length of IPv6 address block (16 + 16 + 2 + 2 = 36 bytes).
const IPV6_ADDR_LEN: u16 = 36;

/// Fixed part of every header.
const HEADER_PREFIX_LEN: usize = 16;

/// Transport carried in the family byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// TCP.
    Stream,
    /// UDP.
    Dgram,
}

impl Transport {
    fn bits(self) -> u8 {
        match self {
            Transport::Stream => 0x01,
            Transport::Dgram => 0x02,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x01 => Some(Transport::Stream),
            0x02 => Some(Transport::Dgram),
            _ => None,
        }
    }
}

/// PROXY v2 header for one proxied connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyProtocolV2 {
    transport: Transport,
    /// Source (client) address.
    src_addr: SocketAddr,
    /// Destination (listener) address.
    dst_addr: SocketAddr,
}

impl ProxyProtocolV2 {
    /// Create a header. Both addresses must share an address family.
    pub fn new(
        transport: Transport,
        src_addr: SocketAddr,
        dst_addr: SocketAddr,
    ) -> Result<Self, ProxyHeaderError> {
        if src_addr.is_ipv4() != dst_addr.is_ipv4() {
            return Err(ProxyHeaderError::MixedFamilies {
                src: src_addr,
                dst: dst_addr,
            });
        }
        Ok(Self {
            transport,
            src_addr,
            dst_addr,
        })
    }

    /// Create a header for addresses observed on a socket.
    ///
    /// A dual-stack listener reports IPv4 clients as IPv4-mapped IPv6
    /// addresses; when both ends map to IPv4 the header is emitted as IPv4.
    pub fn for_connection(
        transport: Transport,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> Result<Self, ProxyHeaderError> {
        match (to_v4(peer.ip()), to_v4(local.ip())) {
            (Some(src), Some(dst)) => Self::new(
                transport,
                SocketAddr::new(IpAddr::V4(src), peer.port()),
                SocketAddr::new(IpAddr::V4(dst), local.port()),
            ),
            _ => Self::new(transport, peer, local),
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn src_addr(&self) -> SocketAddr {
        self.src_addr
    }

    pub fn dst_addr(&self) -> SocketAddr {
        self.dst_addr
    }

    /// Generate the header bytes.
    pub fn encode(&self) -> Vec<u8> {
        let (family, addr_len) = match self.src_addr {
            SocketAddr::V4(_) => (AF_INET, IPV4_ADDR_LEN),
            SocketAddr::V6(_) => (AF_INET6, IPV6_ADDR_LEN),
        };

        let mut buf = Vec::with_capacity(HEADER_PREFIX_LEN + addr_len as usize);
        buf.extend_from_slice(&PROXY_V2_SIGNATURE);
        buf.push(VERSION_COMMAND_PROXY);
        buf.push(family | self.transport.bits());
        buf.extend_from_slice(&addr_len.to_be_bytes());

        push_ip(&mut buf, self.src_addr.ip());
        push_ip(&mut buf, self.dst_addr.ip());
        buf.extend_from_slice(&self.src_addr.port().to_be_bytes());
        buf.extend_from_slice(&self.dst_addr.port().to_be_bytes());
        buf
    }

    /// Get the header size for a given address family.
    pub fn header_size(is_ipv6: bool) -> usize {
        if is_ipv6 {
            HEADER_PREFIX_LEN + IPV6_ADDR_LEN as usize
        } else {
            HEADER_PREFIX_LEN + IPV4_ADDR_LEN as usize
        }
    }
}

/// Encode a header in one step.
pub fn encode(
    transport: Transport,
    src_addr: SocketAddr,
    dst_addr: SocketAddr,
) -> Result<Vec<u8>, ProxyHeaderError> {
    Ok(ProxyProtocolV2::new(transport, src_addr, dst_addr)?.encode())
}

fn push_ip(buf: &mut Vec<u8>, ip: IpAddr) {
    match ip {
        IpAddr::V4(v4) => buf.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => buf.extend_from_slice(&v6.octets()),
    }
}

/// IPv4 view of an address, if it is IPv4 or IPv4-mapped IPv6.
fn to_v4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Parse a PROXY v2 header from a buffer.
///
/// Returns the parsed header and the number of bytes consumed, or `None`
/// if the buffer doesn't start with a complete PROXY command header.
pub fn parse_proxy_v2(data: &[u8]) -> Option<(ProxyProtocolV2, usize)> {
    if data.len() < HEADER_PREFIX_LEN || data[..12] != PROXY_V2_SIGNATURE {
        return None;
    }

    if data[12] != VERSION_COMMAND_PROXY {
        return None;
    }

    let family = data[13] & 0xf0;
    let transport = Transport::from_bits(data[13] & 0x0f)?;
    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;
    let total = HEADER_PREFIX_LEN + addr_len;
    if data.len() < total {
        return None;
    }
    let body = &data[HEADER_PREFIX_LEN..total];

    let (src_ip, dst_ip, ports) = match family {
        AF_INET if addr_len >= IPV4_ADDR_LEN as usize => {
            let src: [u8; 4] = body[0..4].try_into().ok()?;
            let dst: [u8; 4] = body[4..8].try_into().ok()?;
            (
                IpAddr::V4(Ipv4Addr::from(src)),
                IpAddr::V4(Ipv4Addr::from(dst)),
                &body[8..12],
            )
        }
        AF_INET6 if addr_len >= IPV6_ADDR_LEN as usize => {
            let src: [u8; 16] = body[0..16].try_into().ok()?;
            let dst: [u8; 16] = body[16..32].try_into().ok()?;
            (
                IpAddr::V6(Ipv6Addr::from(src)),
                IpAddr::V6(Ipv6Addr::from(dst)),
                &body[32..36],
            )
        }
        _ => return None,
    };

    let src_port = u16::from_be_bytes([ports[0], ports[1]]);
    let dst_port = u16::from_be_bytes([ports[2], ports[3]]);
    let header = ProxyProtocolV2 {
        transport,
        src_addr: SocketAddr::new(src_ip, src_port),
        dst_addr: SocketAddr::new(dst_ip, dst_port),
    };
    Some((header, total))
}
