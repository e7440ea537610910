use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::PeerConfig,
    extensions::ExtensionProtocol,
    listener::PeerListener,
    messages::{
        PeerMessage,
        payloads::{HavePayload, PieceBlock, PieceBlockInfo, PortPayload},
    },
    peer::{
        handshake::Handshake,
        pipeline::{BlockPipeline, PieceAborted, PieceDownloadInfo},
    },
    progress::PiecesProgress,
};

pub mod address;
pub mod conn;
pub mod error;
mod event_loop;
mod extensions;
pub mod handshake;
pub mod pipeline;
pub mod states;
#[cfg(test)]
mod test_util;

pub use address::PeerAddress;
pub use states::{ConnectionState, PeerFlags, PeerInfo};

/// One connection to a remote peer. Cloning is cheap; all clones drive the same connection.
///
/// Every operation is synchronous. Messages are queued onto the transport's outbox and written
/// by a background task, incoming bytes enter through the reader task.
#[derive(Clone)]
pub struct PeerConnection(Arc<PeerConnectionInner>);

struct PeerConnectionInner {
    config: PeerConfig,
    /// serialises decode-and-dispatch of incoming data and closing; held while the listener is
    /// called, so a listener may close from inside a callback
    dispatch: ReentrantMutex<()>,
    core: Mutex<Core>,
    pipeline: Mutex<BlockPipeline>,
    listener: RwLock<Arc<dyn PeerListener>>,
}

/// Mutable connection state. Lock order is `core` before `pipeline`.
struct Core {
    /// bumped for every open/accept; events of older sessions are ignored
    session: u64,
    state: ConnectionState,
    flags: PeerFlags,
    info: PeerInfo,
    address: Option<PeerAddress>,
    outgoing: bool,
    inbox: BytesMut,
    desyncs: u32,
    outbox: Option<mpsc::UnboundedSender<PeerMessage>>,
    cancel: Option<CancellationToken>,
    extensions: ExtensionProtocol,
}

impl Core {
    fn new() -> Self {
        Self {
            session: 0,
            state: ConnectionState::Disconnected,
            flags: PeerFlags::default(),
            info: PeerInfo::default(),
            address: None,
            outgoing: false,
            inbox: BytesMut::new(),
            desyncs: 0,
            outbox: None,
            cancel: None,
            extensions: ExtensionProtocol::new(),
        }
    }

    fn is_live(&self, session: u64) -> bool {
        self.session == session && self.state != ConnectionState::Disconnected
    }

    /// Queues `message` for the writer. Returns false if there is no transport.
    fn send(&self, message: PeerMessage) -> bool {
        match &self.outbox {
            Some(outbox) => outbox.send(message).is_ok(),
            None => false,
        }
    }

    fn send_established(&self, message: PeerMessage) -> bool {
        self.state.is_established() && self.send(message)
    }
}

impl PeerConnection {
    pub fn new(config: PeerConfig, listener: Arc<dyn PeerListener>) -> Self {
        Self(Arc::new(PeerConnectionInner {
            config,
            dispatch: ReentrantMutex::new(()),
            core: Mutex::new(Core::new()),
            pipeline: Mutex::new(BlockPipeline::new()),
            listener: RwLock::new(listener),
        }))
    }

    pub fn config(&self) -> &PeerConfig {
        &self.0.config
    }

    pub fn set_listener(&self, listener: Arc<dyn PeerListener>) {
        *self.0.listener.write() = listener;
    }

    fn listener(&self) -> Arc<dyn PeerListener> {
        self.0.listener.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.0.core.lock().state
    }

    pub fn flags(&self) -> PeerFlags {
        self.0.core.lock().flags
    }

    pub fn info(&self) -> PeerInfo {
        self.0.core.lock().info.clone()
    }

    /// The handshake is done and the connection wasn't closed since.
    pub fn is_established(&self) -> bool {
        self.state().is_established()
    }

    pub fn is_downloading(&self) -> bool {
        self.state() == ConnectionState::TransferringData
    }

    pub fn address(&self) -> Option<PeerAddress> {
        self.0.core.lock().address
    }

    fn local_handshake(&self) -> Handshake {
        let config = &self.0.config;
        Handshake::new(config.info_hash, config.peer_id, config.reserved_bytes())
    }

    /// Starts a new session from `Disconnected`. Returns the session number.
    fn begin_session(&self, address: PeerAddress, outgoing: bool) -> Option<u64> {
        let mut core = self.0.core.lock();
        if core.state != ConnectionState::Disconnected {
            return None;
        }
        let session = core.session + 1;
        *core = Core::new();
        core.session = session;
        core.info.pieces = PiecesProgress::new(self.0.config.piece_count);
        core.address = Some(address);
        core.outgoing = outgoing;
        core.state = ConnectionState::Connecting;
        tracing::debug!(peer = %address, outgoing, "connecting");
        Some(session)
    }

    pub fn set_interested(&self, interested: bool) {
        let mut core = self.0.core.lock();
        if !core.state.is_established() || core.flags.am_interested == interested {
            return;
        }
        core.flags.am_interested = interested;
        core.send(if interested {
            PeerMessage::Interested
        } else {
            PeerMessage::NotInterested
        });
    }

    pub fn set_choke(&self, choke: bool) {
        let mut core = self.0.core.lock();
        if !core.state.is_established() || core.flags.am_choking == choke {
            return;
        }
        core.flags.am_choking = choke;
        core.send(if choke {
            PeerMessage::Choke
        } else {
            PeerMessage::Unchoke
        });
    }

    /// Starts downloading a piece the remote has. Only one piece can be in flight; returns false
    /// if the connection isn't `Idle` or the remote lacks the piece.
    pub fn request_piece(&self, piece: PieceDownloadInfo) -> bool {
        let mut core = self.0.core.lock();
        if core.state != ConnectionState::Idle || !core.info.pieces.has_piece(piece.index) {
            return false;
        }
        let index = piece.index;
        let Some(first) = self.0.pipeline.lock().schedule(piece) else {
            return false;
        };
        core.state = ConnectionState::TransferringData;
        tracing::debug!(peer = ?core.address, index, "downloading piece");
        core.send(PeerMessage::Request(first));
        true
    }

    pub fn send_have(&self, piece_index: u32) -> bool {
        self.0
            .core
            .lock()
            .send_established(PeerMessage::Have(HavePayload { piece_index }))
    }

    pub fn send_bitfield(&self, bits: &[u8]) -> bool {
        self.0
            .core
            .lock()
            .send_established(PeerMessage::Bitfield(Bytes::copy_from_slice(bits)))
    }

    pub fn send_piece_block(&self, block: PieceBlock) -> bool {
        self.0
            .core
            .lock()
            .send_established(PeerMessage::Piece(block))
    }

    pub fn send_port(&self, port: u16) -> bool {
        self.0
            .core
            .lock()
            .send_established(PeerMessage::Port(PortPayload { port }))
    }

    pub fn send_cancel(&self, info: PieceBlockInfo) -> bool {
        self.0
            .core
            .lock()
            .send_established(PeerMessage::Cancel(info))
    }

    /// Shuts the connection down from any state. A piece in flight is reported as aborted.
    /// Calling it again, or on a connection that was never opened, does nothing.
    pub fn close(&self) {
        self.close_session(None);
    }

    /// Closes only if `session` is still the current one.
    fn close_session(&self, session: Option<u64>) {
        // waits for a dispatch on another thread, its events are delivered before ours
        let _dispatch = self.0.dispatch.lock();
        let aborted = {
            let mut core = self.0.core.lock();
            if core.state == ConnectionState::Disconnected
                || session.is_some_and(|session| session != core.session)
            {
                return;
            }
            tracing::debug!(peer = ?core.address, state = %core.state, "closing connection");
            core.state = ConnectionState::Disconnected;
            // dropping the sender lets the writer flush what is queued and shut down
            core.outbox = None;
            if let Some(cancel) = core.cancel.take() {
                cancel.cancel();
            }
            core.inbox.clear();
            core.flags = PeerFlags::default();
            core.info = PeerInfo {
                pieces: PiecesProgress::new(self.0.config.piece_count),
                ..PeerInfo::default()
            };
            self.0.pipeline.lock().abort()
        };

        let listener = self.listener();
        if let Some(index) = aborted {
            listener.piece_receive_finished(self, Err(PieceAborted { index }));
        }
        listener.connection_closed(self);
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.0.core.lock();
        f.debug_struct("PeerConnection")
            .field("address", &core.address)
            .field("state", &core.state)
            .field("flags", &core.flags)
            .finish()
    }
}

#[cfg(test)]
mod test_peer {
    use std::sync::Arc;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::{
        extensions::{ExtensionType, metadata::MetadataMsgType},
        listener::NoopListener,
        messages::{self, payloads::ExtendedPayload},
        peer::{
            handshake::reserved_bytes,
            pipeline::BLOCK_MAX,
            test_util::{INFO_HASH, REMOTE_ID, Recorded, Recorder, config, connection},
        },
    };

    fn addr() -> PeerAddress {
        PeerAddress("127.0.0.1:6881".parse().unwrap())
    }

    fn remote_handshake(reserved: [u8; 8]) -> Bytes {
        messages::encode_handshake(INFO_HASH, REMOTE_ID, reserved).unwrap()
    }

    fn sent(rx: &mut UnboundedReceiver<PeerMessage>) -> Vec<PeerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// An outgoing connection that finished the handshake with a remote without capabilities.
    fn established(
        config: PeerConfig,
    ) -> (PeerConnection, Arc<Recorder>, u64, UnboundedReceiver<PeerMessage>) {
        let (conn, recorder) = connection(config);
        let (session, mut rx) = conn.attach_channel(addr(), true).unwrap();
        conn.on_data(session, &remote_handshake([0; 8]));
        assert_eq!(conn.state(), ConnectionState::Idle);
        sent(&mut rx);
        recorder.take();
        (conn, recorder, session, rx)
    }

    fn two_block_piece(index: u32) -> PieceDownloadInfo {
        PieceDownloadInfo::for_piece(index, 2 * BLOCK_MAX)
    }

    #[test]
    fn outgoing_handshake() {
        let (conn, recorder) = connection(config());
        let (session, mut rx) = conn.attach_channel(addr(), true).unwrap();

        assert_eq!(conn.state(), ConnectionState::Handshaking);
        let [PeerMessage::Handshake(ours)] = &sent(&mut rx)[..] else {
            panic!("outgoing connections start with the handshake");
        };
        assert_eq!(ours.info_hash, INFO_HASH);
        assert!(ours.supports_extensions());

        conn.on_data(session, &remote_handshake(reserved_bytes(true, false)));

        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(conn.flags().finished_handshake);
        assert_eq!(conn.info().peer_id, REMOTE_ID);
        assert!(conn.info().supports_extensions());
        // no echo, only our extension handshake
        let messages = sent(&mut rx);
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0],
            PeerMessage::Extended(ExtendedPayload { extension_id: 0, .. })
        ));
        assert_eq!(recorder.notifications(), vec![Recorded::Handshake]);
    }

    #[test]
    fn inbound_handshake_is_echoed() {
        let (conn, recorder) = connection(config());
        let (session, mut rx) = conn.attach_channel(addr(), false).unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(sent(&mut rx).is_empty());

        conn.on_data(session, &remote_handshake([0; 8]));

        let [PeerMessage::Handshake(echo)] = &sent(&mut rx)[..] else {
            panic!("inbound connections answer the handshake");
        };
        assert_eq!(echo.peer_id, config().peer_id);
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(
            recorder.take(),
            vec![
                Recorded::Handshake,
                Recorded::Message(PeerMessage::Handshake(
                    handshake::Handshake::decode(&remote_handshake([0; 8])).unwrap()
                )),
            ]
        );
    }

    #[test]
    fn foreign_info_hash_closes() {
        let (conn, recorder) = connection(config());
        let (session, _rx) = conn.attach_channel(addr(), true).unwrap();
        let foreign = messages::encode_handshake([1; 20], REMOTE_ID, [0; 8]).unwrap();

        conn.on_data(session, &foreign);

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(recorder.take(), vec![Recorded::Closed]);
    }

    #[test]
    fn operations_before_the_handshake_do_nothing() {
        let (conn, _recorder) = connection(config());
        assert!(!conn.send_have(1));
        assert!(!conn.request_piece(two_block_piece(0)));
        conn.close();

        let (_session, mut rx) = conn.attach_channel(addr(), false).unwrap();
        conn.set_interested(true);
        conn.set_choke(false);
        assert!(!conn.send_have(1));
        assert!(!conn.send_bitfield(&[0xff]));
        assert!(!conn.send_port(6881));
        assert!(!conn.send_cancel(PieceBlockInfo::new(0, 0, BLOCK_MAX)));
        assert!(!conn.send_piece_block(PieceBlock::new(0, 0, vec![1])));
        assert!(!conn.request_metadata_piece(0));
        assert!(!conn.request_piece(two_block_piece(0)));
        assert!(sent(&mut rx).is_empty());
        assert_eq!(conn.flags(), PeerFlags::default());
    }

    #[test]
    fn open_only_from_disconnected() {
        let (conn, _recorder) = connection(config());
        assert!(conn.attach_channel(addr(), true).is_some());
        assert!(conn.attach_channel(addr(), true).is_none());
        // no runtime
        assert!(!conn.open(addr()));
    }

    #[test]
    fn interest_and_choke_are_sent_on_change() {
        let (conn, _recorder, _session, mut rx) = established(config());

        conn.set_interested(true);
        conn.set_interested(true);
        conn.set_choke(true);
        conn.set_choke(false);
        conn.set_choke(false);
        conn.set_interested(false);

        assert_eq!(
            sent(&mut rx),
            vec![
                PeerMessage::Interested,
                PeerMessage::Unchoke,
                PeerMessage::NotInterested
            ]
        );
        let flags = conn.flags();
        assert!(!flags.am_interested && !flags.am_choking);
    }

    #[test]
    fn remote_flags() {
        let (conn, _recorder, session, _rx) = established(config());
        let mut data = messages::encode_state_message(messages::MessageId::Interested).to_vec();
        data.extend_from_slice(&messages::encode_state_message(messages::MessageId::Unchoke));
        conn.on_data(session, &data);

        let flags = conn.flags();
        assert!(flags.peer_interested);
        assert!(!flags.peer_choking);

        conn.on_data(
            session,
            &messages::encode_state_message(messages::MessageId::NotInterested),
        );
        assert!(!conn.flags().peer_interested);
    }

    #[test]
    fn bitfield_and_have_update_the_remote_pieces() {
        let (conn, recorder, session, _rx) = established(config());

        conn.on_data(session, &messages::encode_bitfield(&[0xff, 0x00]));
        let pieces = conn.info().pieces;
        assert_eq!(pieces.percentage(), 8.0 / 9.0);
        assert!(!pieces.has_piece(8));

        conn.on_data(session, &messages::encode_have(8));
        assert_eq!(conn.info().pieces.percentage(), 1.0);
        assert_eq!(
            recorder.notifications(),
            vec![Recorded::Progress, Recorded::Progress]
        );
    }

    #[test]
    fn partial_frames_wait_for_the_rest() {
        let (conn, recorder, session, _rx) = established(config());
        let have = messages::encode_have(3);

        conn.on_data(session, &have[..5]);
        assert!(recorder.take().is_empty());

        conn.on_data(session, &have[5..]);
        assert_eq!(
            recorder.take(),
            vec![
                Recorded::Progress,
                Recorded::Message(PeerMessage::Have(HavePayload { piece_index: 3 }))
            ]
        );
        assert!(conn.info().pieces.has_piece(3));
    }

    #[test]
    fn downloads_a_piece() {
        let (conn, recorder, session, mut rx) = established(config());
        conn.on_data(session, &messages::encode_bitfield(&[0b0100_0000, 0]));
        recorder.take();

        assert!(!conn.request_piece(two_block_piece(0)));
        assert!(conn.request_piece(two_block_piece(1)));
        assert!(conn.is_downloading());
        // one piece at a time
        assert!(!conn.request_piece(two_block_piece(1)));

        let tail = PieceBlockInfo::new(1, BLOCK_MAX, BLOCK_MAX);
        assert_eq!(sent(&mut rx), vec![PeerMessage::Request(tail)]);

        let block = PieceBlock::new(1, BLOCK_MAX, vec![2; BLOCK_MAX as usize]);
        conn.on_data(session, &messages::encode_piece_block(&block));
        let head = PieceBlockInfo::new(1, 0, BLOCK_MAX);
        assert_eq!(sent(&mut rx), vec![PeerMessage::Request(head)]);

        let block = PieceBlock::new(1, 0, vec![1; BLOCK_MAX as usize]);
        conn.on_data(session, &messages::encode_piece_block(&block));

        assert_eq!(conn.state(), ConnectionState::Idle);
        let notifications = recorder.notifications();
        let [Recorded::Piece(Ok(piece))] = &notifications[..] else {
            panic!("expected one finished piece, got {notifications:?}");
        };
        assert_eq!(piece.index, 1);
        assert_eq!(piece.data_size, 2 * BLOCK_MAX as usize);
        assert_eq!(piece.data[0], 1);
        assert_eq!(piece.data[BLOCK_MAX as usize], 2);
    }

    #[test]
    fn unexpected_block_aborts_the_piece() {
        let (conn, recorder, session, _rx) = established(config());
        conn.on_data(session, &messages::encode_have(1));
        assert!(conn.request_piece(two_block_piece(1)));
        recorder.take();

        let block = PieceBlock::new(1, 0, vec![1; BLOCK_MAX as usize]);
        conn.on_data(session, &messages::encode_piece_block(&block));

        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(
            recorder.notifications(),
            vec![Recorded::Piece(Err(PieceAborted { index: 1 }))]
        );
    }

    #[test]
    fn close_mid_transfer() {
        let (conn, recorder, session, _rx) = established(config());
        conn.on_data(session, &messages::encode_have(1));
        assert!(conn.request_piece(two_block_piece(1)));
        recorder.take();

        conn.close();
        conn.close();
        conn.on_closed(session);

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(
            recorder.take(),
            vec![
                Recorded::Piece(Err(PieceAborted { index: 1 })),
                Recorded::Closed
            ]
        );
        assert!(!conn.is_established());
        assert!(!conn.send_have(1));
        assert_eq!(conn.flags(), PeerFlags::default());
        let info = conn.info();
        assert_eq!(info.peer_id, [0; 20]);
        assert_eq!(info.pieces.received_count(), 0);
        assert_eq!(info.pieces.piece_count(), 9);
        assert_eq!(conn.address(), Some(addr()));

        // data of the old session is ignored
        conn.on_data(session, &messages::encode_have(2));
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn close_from_inside_a_callback() {
        let recorder = Arc::new(Recorder {
            close_on_handshake: true,
            ..Default::default()
        });
        let conn = PeerConnection::new(config(), recorder.clone());
        let (session, _rx) = conn.attach_channel(addr(), true).unwrap();

        let mut data = remote_handshake([0; 8]).to_vec();
        data.extend_from_slice(&messages::encode_have(0));
        conn.on_data(session, &data);

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(recorder.take(), vec![Recorded::Handshake, Recorded::Closed]);
    }

    #[test]
    fn repeated_handshake_keeps_the_transfer() {
        let (conn, recorder, session, _rx) = established(config());
        conn.on_data(session, &messages::encode_have(1));
        assert!(conn.request_piece(two_block_piece(1)));
        recorder.take();

        conn.on_data(session, &remote_handshake([0; 8]));

        assert_eq!(conn.state(), ConnectionState::TransferringData);
        assert!(recorder.notifications().is_empty());
    }

    #[test]
    fn dht_port_needs_both_sides() {
        let (conn, _recorder) = connection(config().with_dht(6881));
        let (session, mut rx) = conn.attach_channel(addr(), true).unwrap();
        sent(&mut rx);
        conn.on_data(session, &remote_handshake(reserved_bytes(false, true)));
        assert_eq!(
            sent(&mut rx),
            vec![PeerMessage::Port(PortPayload { port: 6881 })]
        );

        let (conn, _recorder) = connection(config().with_dht(6881));
        let (session, mut rx) = conn.attach_channel(addr(), true).unwrap();
        sent(&mut rx);
        conn.on_data(session, &remote_handshake([0; 8]));
        assert!(sent(&mut rx).is_empty());

        let (conn, _recorder) = connection(config());
        let (session, mut rx) = conn.attach_channel(addr(), true).unwrap();
        sent(&mut rx);
        conn.on_data(session, &remote_handshake(reserved_bytes(false, true)));
        assert!(sent(&mut rx).is_empty());
    }

    #[test]
    fn third_desync_closes() {
        let (conn, recorder, session, _rx) = established(config());
        let garbage = [0xff, 0xff, 0xff, 0xff, 1];

        conn.on_data(session, &garbage);
        conn.on_data(session, &garbage);
        assert!(conn.is_established());
        // the connection still works between desyncs
        conn.on_data(session, &messages::encode_have(4));
        assert!(conn.info().pieces.has_piece(4));

        conn.on_data(session, &garbage);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(recorder.notifications().ends_with(&[Recorded::Closed]));
    }

    #[test]
    fn extension_messages() {
        let (conn, recorder, session, mut rx) = established(config());

        let ext_handshake = messages::encode_extended(
            0,
            b"d1:md11:ut_metadatai3e6:ut_pexi4ee13:metadata_sizei100e1:v6:remotee",
        );
        conn.on_data(session, &ext_handshake);
        assert_eq!(recorder.notifications(), vec![Recorded::ExtHandshake]);
        assert_eq!(conn.info().client.as_deref(), Some("remote"));
        assert_eq!(conn.info().metadata_size, Some(100));
        assert_eq!(conn.remote_extension_id(ExtensionType::Pex), Some(4));

        assert!(conn.request_metadata_piece(0));
        let [PeerMessage::Extended(request)] = &sent(&mut rx)[..] else {
            panic!("expected the metadata request");
        };
        assert_eq!(request.extension_id, 3);

        // the remote addresses us with our ids
        conn.on_data(
            session,
            &messages::encode_extended(2, b"d8:msg_typei1e5:piecei0e10:total_sizei3eeabc"),
        );
        conn.on_data(
            session,
            &messages::encode_extended(1, b"d7:dropped6:\x0a\x00\x00\x01\x1a\xe1e"),
        );
        let notifications = recorder.notifications();
        let [Recorded::Metadata(metadata), Recorded::Pex(pex)] = &notifications[..] else {
            panic!("unexpected notifications {notifications:?}");
        };
        assert_eq!(metadata.msg_type, MetadataMsgType::Data);
        assert_eq!(&metadata.data[..], b"abc");
        assert_eq!(pex.dropped[0].to_string(), "10.0.0.1:6881");
    }

    #[test]
    fn listener_can_be_replaced() {
        let (conn, first, session, _rx) = established(config());
        let second = Arc::new(Recorder::default());
        conn.set_listener(second.clone());

        conn.on_data(session, &messages::encode_keep_alive());
        assert!(first.take().is_empty());
        assert_eq!(
            second.take(),
            vec![Recorded::Message(PeerMessage::KeepAlive)]
        );

        conn.set_listener(Arc::new(NoopListener));
        conn.on_data(session, &messages::encode_have(4));
        assert!(second.take().is_empty());
        assert!(conn.info().pieces.has_piece(4));
    }

    /// Closes the connection from another thread while a callback is still running.
    #[derive(Default)]
    struct CloseElsewhere {
        events: Mutex<Vec<&'static str>>,
        closer: Mutex<Option<std::thread::JoinHandle<()>>>,
    }

    impl PeerListener for CloseElsewhere {
        fn progress_updated(&self, conn: &PeerConnection) {
            self.events.lock().push("progress");
            let conn = conn.clone();
            *self.closer.lock() = Some(std::thread::spawn(move || conn.close()));
            std::thread::sleep(std::time::Duration::from_millis(50));
        }

        fn message_received(&self, _conn: &PeerConnection, _message: &PeerMessage) {
            self.events.lock().push("message");
        }

        fn connection_closed(&self, _conn: &PeerConnection) {
            self.events.lock().push("closed");
        }
    }

    #[test]
    fn close_on_another_thread_waits_for_dispatch() {
        let listener = Arc::new(CloseElsewhere::default());
        let conn = PeerConnection::new(config(), listener.clone());
        let (session, _rx) = conn.attach_channel(addr(), true).unwrap();
        conn.on_data(session, &remote_handshake([0; 8]));
        listener.events.lock().clear();

        conn.on_data(session, &messages::encode_have(1));
        let closer = listener.closer.lock().take().unwrap();
        closer.join().unwrap();

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(*listener.events.lock(), vec!["progress", "message", "closed"]);
    }
}
