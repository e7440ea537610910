use strum::Display;

use crate::progress::PiecesProgress;

/// Lifecycle of one connection.
/// `Disconnected -> Connecting -> Connected -> Handshaking -> Idle <-> TransferringData`,
/// any state may drop back to `Disconnected`.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    /// transport is up, no handshake sent or received yet
    Connected,
    /// our handshake is out, waiting for theirs
    Handshaking,
    Idle,
    /// a piece is in flight
    TransferringData,
}

impl ConnectionState {
    /// Whether the handshake exchange is complete.
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Idle | Self::TransferringData)
    }
}

/// Choke and interest flags of both sides.
/// `am_*` is what we told the remote, `peer_*` is what the remote told us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerFlags {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub finished_handshake: bool,
}

impl Default for PeerFlags {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            finished_handshake: false,
        }
    }
}

/// What we learned about the remote peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerInfo {
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
    /// the pieces the remote has
    pub pieces: PiecesProgress,
    /// client name from the extension handshake
    pub client: Option<String>,
    /// size of the info dictionary from the extension handshake
    pub metadata_size: Option<u32>,
}

impl PeerInfo {
    pub fn supports_extensions(&self) -> bool {
        crate::peer::handshake::supports_extensions(&self.reserved)
    }

    pub fn supports_dht(&self) -> bool {
        crate::peer::handshake::supports_dht(&self.reserved)
    }
}
