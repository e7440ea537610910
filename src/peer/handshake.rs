use bytes::Bytes;

use crate::peer::error::PeerError;

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// reserved byte 5, bit 0x10: extension protocol (BEP 10)
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;
/// reserved byte 7, bit 0x80: DHT support
const DHT_BYTE: usize = 7;
const DHT_BIT: u8 = 0x80;

#[derive(Debug, Copy, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Handshake {
    length: u8,
    protocol: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], reserved: [u8; 8]) -> Self {
        Self {
            length: 19,
            protocol: *PROTOCOL,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, PeerError> {
        let mut handshake_bytes = [0_u8; HANDSHAKE_LEN];
        let written = bincode::encode_into_slice(self, &mut handshake_bytes, config())?;
        debug_assert_eq!(written, HANDSHAKE_LEN);
        Ok(Bytes::copy_from_slice(&handshake_bytes))
    }

    /// Decodes the first 68 bytes of `bytes` and checks the protocol string.
    pub fn decode(bytes: &[u8]) -> Result<Self, PeerError> {
        let bytes = bytes
            .get(..HANDSHAKE_LEN)
            .ok_or(PeerError::ShortHandshake(bytes.len()))?;
        let (handshake, _len) = bincode::decode_from_slice::<Handshake, _>(bytes, config())?;
        if handshake.length != 19 || &handshake.protocol != PROTOCOL {
            return Err(PeerError::InvalidProtocol);
        }
        Ok(handshake)
    }

    pub fn supports_extensions(&self) -> bool {
        supports_extensions(&self.reserved)
    }

    pub fn supports_dht(&self) -> bool {
        supports_dht(&self.reserved)
    }
}

fn config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_big_endian()
        .with_limit::<HANDSHAKE_LEN>()
}

/// Builds the reserved bytes we advertise.
pub fn reserved_bytes(extensions: bool, dht: bool) -> [u8; 8] {
    let mut reserved = [0_u8; 8];
    if extensions {
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
    }
    if dht {
        reserved[DHT_BYTE] |= DHT_BIT;
    }
    reserved
}

pub fn supports_extensions(reserved: &[u8; 8]) -> bool {
    reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
}

pub fn supports_dht(reserved: &[u8; 8]) -> bool {
    reserved[DHT_BYTE] & DHT_BIT != 0
}
