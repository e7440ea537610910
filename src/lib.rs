pub mod config;
pub mod extensions;
pub mod listener;
pub mod messages;
pub mod peer;
pub mod progress;

pub use config::{PeerConfig, generate_peer_id};
pub use listener::{LoggingListener, NoopListener, PeerListener};
pub use messages::{MessageFramer, PeerMessage};
pub use peer::{
    ConnectionState, PeerAddress, PeerConnection, PeerFlags, PeerInfo,
    pipeline::{BLOCK_MAX, DownloadedPiece, PieceAborted, PieceDownloadInfo},
};
pub use progress::PiecesProgress;
