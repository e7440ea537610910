use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    config::PeerConfig,
    extensions::{metadata::MetadataMessage, pex::PexMessage},
    listener::PeerListener,
    messages::PeerMessage,
    peer::{
        PeerConnection,
        pipeline::{DownloadedPiece, PieceAborted},
    },
};

pub(crate) const INFO_HASH: [u8; 20] = [7; 20];
pub(crate) const REMOTE_ID: [u8; 20] = *b"-XX0001-remote-peer-";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Recorded {
    Handshake,
    ExtHandshake,
    Progress,
    Piece(Result<DownloadedPiece, PieceAborted>),
    Closed,
    Message(PeerMessage),
    Pex(PexMessage),
    Metadata(MetadataMessage),
}

/// Records every callback. `close_on_handshake` closes the connection from inside the callback.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    pub(crate) events: Mutex<Vec<Recorded>>,
    pub(crate) close_on_handshake: bool,
}

impl Recorder {
    pub(crate) fn take(&self) -> Vec<Recorded> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Everything but `message_received`.
    pub(crate) fn notifications(&self) -> Vec<Recorded> {
        self.take()
            .into_iter()
            .filter(|event| !matches!(event, Recorded::Message(_)))
            .collect()
    }

    fn push(&self, event: Recorded) {
        self.events.lock().push(event);
    }
}

impl PeerListener for Recorder {
    fn handshake_finished(&self, conn: &PeerConnection) {
        self.push(Recorded::Handshake);
        if self.close_on_handshake {
            conn.close();
        }
    }

    fn ext_handshake_finished(&self, _conn: &PeerConnection) {
        self.push(Recorded::ExtHandshake);
    }

    fn progress_updated(&self, _conn: &PeerConnection) {
        self.push(Recorded::Progress);
    }

    fn piece_receive_finished(
        &self,
        _conn: &PeerConnection,
        piece: Result<DownloadedPiece, PieceAborted>,
    ) {
        self.push(Recorded::Piece(piece));
    }

    fn connection_closed(&self, _conn: &PeerConnection) {
        self.push(Recorded::Closed);
    }

    fn message_received(&self, _conn: &PeerConnection, message: &PeerMessage) {
        self.push(Recorded::Message(message.clone()));
    }

    fn pex_received(&self, _conn: &PeerConnection, pex: &PexMessage) {
        self.push(Recorded::Pex(pex.clone()));
    }

    fn metadata_piece_received(&self, _conn: &PeerConnection, message: &MetadataMessage) {
        self.push(Recorded::Metadata(message.clone()));
    }
}

pub(crate) fn connection(config: PeerConfig) -> (PeerConnection, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    (PeerConnection::new(config, recorder.clone()), recorder)
}

pub(crate) fn config() -> PeerConfig {
    PeerConfig::new(INFO_HASH)
        .with_peer_id(*b"-PW0100-local-peer-0")
        .with_piece_count(9)
}
