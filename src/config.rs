use rand::{Rng, distr::Alphanumeric};

use crate::peer::handshake;

const PEER_ID_PREFIX: &[u8; 8] = b"-PW0100-";
const CLIENT_NAME: &str = concat!("peerwire ", env!("CARGO_PKG_VERSION"));

/// Everything a connection needs to know about the local side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    /// 0 if unknown; the remote bitfield decides the size then
    pub piece_count: u32,
    pub enable_dht: bool,
    pub dht_port: u16,
    pub listen_port: u16,
    pub client_name: String,
    /// size of the info dictionary if we have it, advertised in the extension handshake
    pub metadata_size: Option<u32>,
}

impl PeerConfig {
    pub fn new(info_hash: [u8; 20]) -> Self {
        Self {
            info_hash,
            peer_id: generate_peer_id(),
            piece_count: 0,
            enable_dht: false,
            dht_port: 0,
            listen_port: 0,
            client_name: CLIENT_NAME.to_string(),
            metadata_size: None,
        }
    }

    pub fn with_peer_id(mut self, peer_id: [u8; 20]) -> Self {
        self.peer_id = peer_id;
        self
    }

    pub fn with_piece_count(mut self, piece_count: u32) -> Self {
        self.piece_count = piece_count;
        self
    }

    /// Enables DHT and announces `port` to peers that support it too.
    pub fn with_dht(mut self, port: u16) -> Self {
        self.enable_dht = true;
        self.dht_port = port;
        self
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_metadata_size(mut self, size: u32) -> Self {
        self.metadata_size = Some(size);
        self
    }

    /// The capability bits we put into our handshake. The extension protocol is always on.
    pub fn reserved_bytes(&self) -> [u8; 8] {
        handshake::reserved_bytes(true, self.enable_dht)
    }
}

/// `-PW0100-` followed by 12 random alphanumeric characters.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0_u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::rng();
    for byte in &mut peer_id[8..] {
        *byte = rng.sample(Alphanumeric);
    }
    peer_id
}
