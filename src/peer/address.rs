use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::BufMut;

/// Address of a remote peer. Converts to and from the compact 6 (IPv4) or 18 (IPv6) byte form
/// used by trackers and peer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(pub SocketAddr);

impl PeerAddress {
    pub const COMPACT_V4: usize = 6;
    pub const COMPACT_V6: usize = 18;

    /// Reads exactly one compact address. The length decides the address family.
    pub fn from_compact(bytes: &[u8]) -> Option<Self> {
        let ip = match bytes.len() {
            Self::COMPACT_V4 => IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])),
            Self::COMPACT_V6 => {
                let octets: [u8; 16] = bytes[..16].try_into().ok()?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return None,
        };
        let port = u16::from_be_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]);
        Some(Self(SocketAddr::new(ip, port)))
    }

    /// Splits a list of concatenated compact addresses of one family.
    /// Returns `None` if the list has a trailing partial entry.
    pub fn from_compact_list(bytes: &[u8], entry_len: usize) -> Option<Vec<Self>> {
        if bytes.len() % entry_len != 0 {
            return None;
        }
        bytes.chunks_exact(entry_len).map(Self::from_compact).collect()
    }

    pub fn to_compact(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::COMPACT_V6);
        match self.0.ip() {
            IpAddr::V4(ip) => bytes.put_slice(&ip.octets()),
            IpAddr::V6(ip) => bytes.put_slice(&ip.octets()),
        }
        bytes.put_u16(self.0.port());
        bytes
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
