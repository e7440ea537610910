use crate::{
    extensions::{ExtensionEvent, ExtensionType, SubProtocolKind, handshake::HandshakeExtension},
    messages::payloads::ExtendedPayload,
    peer::{PeerConnection, event_loop::PeerEvent},
};

impl PeerConnection {
    pub(super) fn on_extension_data(&self, payload: &ExtendedPayload, events: &mut Vec<PeerEvent>) {
        let outcome = {
            let mut core = self.0.core.lock();
            let outcome = core.extensions.load(payload.extension_id, &payload.data);
            if outcome.kind == SubProtocolKind::HandshakeEx {
                let client = core
                    .extensions
                    .remote_handshake()
                    .and_then(HandshakeExtension::client);
                core.info.client = client;
                core.info.metadata_size = core.extensions.remote_metadata_size();
            }
            outcome
        };

        if outcome.kind == SubProtocolKind::HandshakeEx {
            events.push(PeerEvent::ExtHandshakeFinished);
        }
        match outcome.event {
            Some(ExtensionEvent::Pex(pex)) => events.push(PeerEvent::Pex(pex)),
            Some(ExtensionEvent::Metadata(message)) => events.push(PeerEvent::Metadata(message)),
            None => {}
        }
    }

    /// The sub-id the remote announced for `ext`, `None` if it doesn't support it (yet).
    pub fn remote_extension_id(&self, ext: ExtensionType) -> Option<u8> {
        self.0.core.lock().extensions.remote_id(ext)
    }

    /// Asks the remote for one piece of the info dictionary. Returns false if the remote didn't
    /// announce `ut_metadata`.
    pub fn request_metadata_piece(&self, piece: u32) -> bool {
        let core = self.0.core.lock();
        if !core.state.is_established() {
            return false;
        }
        match core.extensions.metadata_request(piece) {
            Ok(Some(message)) => core.send(message),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("failed to build the metadata request: {e}");
                false
            }
        }
    }
}
