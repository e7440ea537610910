use std::{io, net::SocketAddr};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Failed to establish a tcp connection to the address `{addr}` with error: `{error:?}`")]
    FailedToConnect { error: io::Error, addr: SocketAddr },
    #[error("The handshake needs 68 bytes, only {0} were provided.")]
    ShortHandshake(usize),
    #[error("The remote peer doesn't speak the BitTorrent protocol.")]
    InvalidProtocol,
    #[error("The remote peer sent the info hash `{0}` which isn't ours.")]
    InfoHashMismatch(String),
    #[error("Failed to decode the handshake received from the peer with the error: `{0}`")]
    DecodeHandshake(#[from] bincode::error::DecodeError),
    #[error("Failed to encode the handshake with the error: `{0}`")]
    EncodeHandshake(#[from] bincode::error::EncodeError),
    #[error("Failed to exchange data with the peer: `{0}`")]
    Transport(#[from] io::Error),
    #[error("The peer unexpectedly disconnected.")]
    PeerDisconnected,
}
