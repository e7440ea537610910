use tokio_util::codec::Decoder;

use crate::{
    extensions::{ExtensionProtocol, metadata::MetadataMessage, pex::PexMessage},
    messages::{MessageFramer, PeerMessage, payloads::{PieceBlock, PortPayload}},
    peer::{
        ConnectionState, PeerConnection,
        error::PeerError,
        handshake::Handshake,
        pipeline::{BlockOutcome, DownloadedPiece, PieceAborted},
    },
};

/// The third lost frame boundary in one session closes the connection.
const MAX_DESYNCS: u32 = 3;

/// Listener notifications collected while the connection state is locked and delivered after.
#[derive(Debug)]
pub(super) enum PeerEvent {
    HandshakeFinished,
    ExtHandshakeFinished,
    ProgressUpdated,
    PieceFinished(Result<DownloadedPiece, PieceAborted>),
    MessageReceived(PeerMessage),
    Pex(PexMessage),
    Metadata(MetadataMessage),
}

impl PeerConnection {
    /// Appends `data` to the receive buffer and dispatches every complete message in it, in
    /// wire order.
    pub(crate) fn on_data(&self, session: u64, data: &[u8]) {
        let _dispatch = self.0.dispatch.lock();
        {
            let mut core = self.0.core.lock();
            if !core.is_live(session) {
                return;
            }
            core.inbox.extend_from_slice(data);
        }

        loop {
            let message = {
                let mut core = self.0.core.lock();
                if !core.is_live(session) {
                    return;
                }
                match MessageFramer.decode(&mut core.inbox) {
                    Ok(None) => return,
                    Ok(Some(message)) => message,
                    Err(e) => {
                        core.desyncs += 1;
                        tracing::warn!(peer = ?core.address, desyncs = core.desyncs, "{e}");
                        if core.desyncs < MAX_DESYNCS {
                            return;
                        }
                        drop(core);
                        self.close_session(Some(session));
                        return;
                    }
                }
            };

            let events = self.handle_message(message);
            self.notify(session, events);
        }
    }

    fn handle_message(&self, message: PeerMessage) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        match &message {
            PeerMessage::Handshake(handshake) => self.on_handshake(handshake, &mut events),
            PeerMessage::Piece(block) => self.on_piece_block(block, &mut events),
            PeerMessage::Extended(payload) => self.on_extension_data(payload, &mut events),
            PeerMessage::Bitfield(bits) => {
                self.0.core.lock().info.pieces.from_bitfield(bits);
                events.push(PeerEvent::ProgressUpdated);
            }
            PeerMessage::Have(have) => {
                self.0.core.lock().info.pieces.add_piece(have.piece_index);
                events.push(PeerEvent::ProgressUpdated);
            }
            PeerMessage::Choke => self.0.core.lock().flags.peer_choking = true,
            PeerMessage::Unchoke => self.0.core.lock().flags.peer_choking = false,
            PeerMessage::Interested => self.0.core.lock().flags.peer_interested = true,
            PeerMessage::NotInterested => self.0.core.lock().flags.peer_interested = false,
            PeerMessage::KeepAlive
            | PeerMessage::Request(_)
            | PeerMessage::Cancel(_)
            | PeerMessage::Port(_)
            | PeerMessage::Unknown { .. } => {}
        }
        tracing::trace!(?message, "dispatched");
        events.push(PeerEvent::MessageReceived(message));
        events
    }

    fn on_handshake(&self, handshake: &Handshake, events: &mut Vec<PeerEvent>) {
        let config = &self.0.config;
        if handshake.info_hash != config.info_hash {
            let err = PeerError::InfoHashMismatch(hex::encode(handshake.info_hash));
            tracing::warn!("{err}");
            self.close();
            return;
        }

        let mut core = self.0.core.lock();
        match core.state {
            ConnectionState::Connected | ConnectionState::Handshaking
                if !core.flags.finished_handshake =>
            {
                // inbound connections answer with our handshake
                if core.state == ConnectionState::Connected {
                    core.send(PeerMessage::Handshake(self.local_handshake()));
                }
                core.flags.finished_handshake = true;
                core.info.peer_id = handshake.peer_id;
                core.info.reserved = handshake.reserved;

                if handshake.supports_extensions() {
                    match ExtensionProtocol::handshake_message(config) {
                        Ok(message) => {
                            core.send(message);
                        }
                        Err(e) => tracing::warn!("failed to build the extension handshake: {e}"),
                    }
                }
                if config.enable_dht && handshake.supports_dht() {
                    core.send(PeerMessage::Port(PortPayload {
                        port: config.dht_port,
                    }));
                }

                core.state = ConnectionState::Idle;
                tracing::debug!(
                    peer = ?core.address,
                    peer_id = %String::from_utf8_lossy(&handshake.peer_id),
                    "handshake finished"
                );
                events.push(PeerEvent::HandshakeFinished);
            }
            ConnectionState::Connected | ConnectionState::Handshaking => {
                core.state = ConnectionState::Idle;
            }
            state => tracing::debug!(%state, "ignoring repeated handshake"),
        }
    }

    fn on_piece_block(&self, block: &PieceBlock, events: &mut Vec<PeerEvent>) {
        let mut core = self.0.core.lock();
        let outcome = self.0.pipeline.lock().on_block_received(block);
        match outcome {
            BlockOutcome::Unrequested => {}
            BlockOutcome::Next(next) => {
                core.send(PeerMessage::Request(next));
            }
            BlockOutcome::Aborted(index) => {
                if core.state == ConnectionState::TransferringData {
                    core.state = ConnectionState::Idle;
                }
                events.push(PeerEvent::PieceFinished(Err(PieceAborted { index })));
            }
            BlockOutcome::Finished(piece) => {
                if core.state == ConnectionState::TransferringData {
                    core.state = ConnectionState::Idle;
                }
                tracing::debug!(peer = ?core.address, index = piece.index, "piece finished");
                events.push(PeerEvent::PieceFinished(Ok(piece)));
            }
        }
    }

    /// Calls the listener for each event. Stops once the session is closed, except for piece
    /// completions which the scheduler always has to see.
    fn notify(&self, session: u64, events: Vec<PeerEvent>) {
        let listener = self.listener();
        for event in events {
            if let PeerEvent::PieceFinished(piece) = event {
                listener.piece_receive_finished(self, piece);
                continue;
            }
            if !self.0.core.lock().is_live(session) {
                return;
            }
            match event {
                PeerEvent::HandshakeFinished => listener.handshake_finished(self),
                PeerEvent::ExtHandshakeFinished => listener.ext_handshake_finished(self),
                PeerEvent::ProgressUpdated => listener.progress_updated(self),
                PeerEvent::MessageReceived(message) => listener.message_received(self, &message),
                PeerEvent::Pex(pex) => listener.pex_received(self, &pex),
                PeerEvent::Metadata(message) => listener.metadata_piece_received(self, &message),
                PeerEvent::PieceFinished(_) => {}
            }
        }
    }
}
