use crate::{
    extensions::{metadata::MetadataMessage, pex::PexMessage},
    messages::PeerMessage,
    peer::{
        PeerConnection,
        pipeline::{DownloadedPiece, PieceAborted},
    },
};

/// Receives the events of a connection.
///
/// Callbacks are invoked from the connection's dispatch with no state lock held, so they may
/// call back into the connection, `close` included. They must not block: a `close` on another
/// thread waits until the running dispatch has delivered its events, so `connection_closed` is
/// always the last callback of a session (apart from a piece completion reported by the close
/// itself).
pub trait PeerListener: Send + Sync {
    /// The BitTorrent handshake is complete, the connection is `Idle`.
    fn handshake_finished(&self, _conn: &PeerConnection) {}

    /// The remote's extension handshake arrived.
    fn ext_handshake_finished(&self, _conn: &PeerConnection) {}

    /// The remote's piece set changed (`Have` or `Bitfield`).
    fn progress_updated(&self, _conn: &PeerConnection) {}

    /// A piece scheduled with `request_piece` completed or was given up.
    fn piece_receive_finished(
        &self,
        _conn: &PeerConnection,
        _piece: Result<DownloadedPiece, PieceAborted>,
    ) {
    }

    /// Called exactly once per opened or accepted session.
    fn connection_closed(&self, _conn: &PeerConnection) {}

    /// Every dispatched message, after the connection handled it.
    fn message_received(&self, _conn: &PeerConnection, _message: &PeerMessage) {}

    fn pex_received(&self, _conn: &PeerConnection, _pex: &PexMessage) {}

    fn metadata_piece_received(&self, _conn: &PeerConnection, _message: &MetadataMessage) {}
}

/// Ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl PeerListener for NoopListener {}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl PeerListener for LoggingListener {
    fn handshake_finished(&self, conn: &PeerConnection) {
        let info = conn.info();
        tracing::info!(
            peer = %display_addr(conn),
            peer_id = %String::from_utf8_lossy(&info.peer_id),
            extensions = info.supports_extensions(),
            dht = info.supports_dht(),
            "handshake finished"
        );
    }

    fn ext_handshake_finished(&self, conn: &PeerConnection) {
        let info = conn.info();
        tracing::info!(
            peer = %display_addr(conn),
            client = ?info.client,
            metadata_size = ?info.metadata_size,
            "extension handshake finished"
        );
    }

    fn progress_updated(&self, conn: &PeerConnection) {
        let pieces = conn.info().pieces;
        tracing::debug!(
            peer = %display_addr(conn),
            "peer has {}/{} pieces ({:.1}%)",
            pieces.received_count(),
            pieces.piece_count(),
            pieces.percentage() * 100.0
        );
    }

    fn piece_receive_finished(
        &self,
        conn: &PeerConnection,
        piece: Result<DownloadedPiece, PieceAborted>,
    ) {
        match piece {
            Ok(piece) => tracing::info!(
                peer = %display_addr(conn),
                index = piece.index,
                size = piece.data_size,
                "piece received"
            ),
            Err(e) => tracing::warn!(peer = %display_addr(conn), "{e}"),
        }
    }

    fn connection_closed(&self, conn: &PeerConnection) {
        tracing::info!(peer = %display_addr(conn), "connection closed");
    }

    fn message_received(&self, conn: &PeerConnection, message: &PeerMessage) {
        tracing::trace!(peer = %display_addr(conn), ?message, "message received");
    }

    fn pex_received(&self, conn: &PeerConnection, pex: &PexMessage) {
        tracing::debug!(
            peer = %display_addr(conn),
            added = pex.added.len() + pex.added6.len(),
            dropped = pex.dropped.len() + pex.dropped6.len(),
            "peer exchange"
        );
    }

    fn metadata_piece_received(&self, conn: &PeerConnection, message: &MetadataMessage) {
        tracing::debug!(
            peer = %display_addr(conn),
            msg_type = ?message.msg_type,
            piece = message.piece,
            len = message.data.len(),
            "metadata message"
        );
    }
}

fn display_addr(conn: &PeerConnection) -> String {
    conn.address()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "-".to_string())
}
