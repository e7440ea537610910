use std::time::Duration;

use bytes::BytesMut;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tokio_util::time::FutureExt;
use tracing::Instrument;

use crate::{
    messages::{MessageFramer, PeerMessage},
    peer::{ConnectionState, PeerAddress, PeerConnection, error::PeerError},
};

/// Without any incoming data for this long we send a keep-alive.
pub const KEEP_ALIVE_AFTER: Duration = Duration::from_secs(120);
const READ_CHUNK: usize = 32 * 1024;

impl PeerConnection {
    /// Connects to `address` in the background. Only valid from `Disconnected` and inside a tokio
    /// runtime, returns false otherwise.
    ///
    /// Once the tcp connection is up our handshake is sent. If connecting fails the listener sees
    /// `connection_closed`.
    pub fn open(&self, address: impl Into<PeerAddress>) -> bool {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("opening a peer connection needs a tokio runtime");
            return false;
        };
        let address = address.into();
        let Some(session) = self.begin_session(address, true) else {
            return false;
        };

        let conn = self.clone();
        let span = tracing::debug_span!("peer", addr = %address);
        runtime.spawn(
            async move {
                match TcpStream::connect(address.socket_addr()).await {
                    Ok(stream) => conn.attach(session, stream),
                    Err(error) => {
                        let err = PeerError::FailedToConnect {
                            error,
                            addr: address.socket_addr(),
                        };
                        tracing::debug!("{err}");
                        conn.on_closed(session);
                    }
                }
            }
            .instrument(span),
        );
        true
    }

    /// Takes over an already established inbound stream. The remote speaks first; our handshake
    /// is sent as the answer to theirs.
    pub fn accept<S>(&self, stream: S, address: impl Into<PeerAddress>) -> bool
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if Handle::try_current().is_err() {
            tracing::warn!("accepting a peer connection needs a tokio runtime");
            return false;
        }
        let Some(session) = self.begin_session(address.into(), false) else {
            return false;
        };
        self.attach(session, stream);
        true
    }

    /// Starts the reader and writer task for `stream`. Must run inside a tokio runtime.
    fn attach<S>(&self, session: u64, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let span = {
            let mut core = self.0.core.lock();
            if core.session != session || core.state != ConnectionState::Connecting {
                tracing::debug!("dropping the stream of a stale session");
                return;
            }
            core.outbox = Some(outbox);
            core.cancel = Some(cancel.clone());
            match core.address {
                Some(addr) => tracing::debug_span!("peer", %addr),
                None => tracing::debug_span!("peer"),
            }
        };

        // the state has to be `Connected` before the first byte can be dispatched
        self.on_connected(session);
        tokio::spawn(write_loop(self.clone(), session, writer, outbox_rx).instrument(span.clone()));
        tokio::spawn(read_loop(self.clone(), session, reader, cancel).instrument(span));
    }

    /// The transport is up: outgoing connections send their handshake right away.
    pub(crate) fn on_connected(&self, session: u64) {
        let mut core = self.0.core.lock();
        if core.session != session || core.state != ConnectionState::Connecting {
            return;
        }
        core.state = ConnectionState::Connected;
        if core.outgoing {
            core.send(PeerMessage::Handshake(self.local_handshake()));
            core.state = ConnectionState::Handshaking;
        }
        tracing::debug!(state = %core.state, "transport connected");
    }

    /// The transport of `session` is gone.
    pub(crate) fn on_closed(&self, session: u64) {
        self.close_session(Some(session));
    }

    /// Nothing was read for `KEEP_ALIVE_AFTER`.
    pub(crate) fn on_idle(&self, session: u64) {
        let core = self.0.core.lock();
        if core.is_live(session) {
            core.send(PeerMessage::KeepAlive);
        }
    }

    /// Attaches a channel in place of a transport and returns the session and the receiving end of
    /// the outbox.
    #[cfg(test)]
    pub(crate) fn attach_channel(
        &self,
        address: PeerAddress,
        outgoing: bool,
    ) -> Option<(u64, mpsc::UnboundedReceiver<PeerMessage>)> {
        let session = self.begin_session(address, outgoing)?;
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        self.0.core.lock().outbox = Some(outbox);
        self.on_connected(session);
        Some((session, outbox_rx))
    }
}

async fn read_loop<R>(conn: PeerConnection, session: u64, mut reader: R, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_buf(&mut buf).timeout(KEEP_ALIVE_AFTER) => read,
        };
        match read {
            Err(_elapsed) => conn.on_idle(session),
            Ok(Ok(0)) => {
                tracing::debug!("{}", PeerError::PeerDisconnected);
                conn.on_closed(session);
                return;
            }
            Ok(Ok(_)) => conn.on_data(session, &buf),
            Ok(Err(e)) => {
                tracing::debug!("{}", PeerError::Transport(e));
                conn.on_closed(session);
                return;
            }
        }
    }
}

async fn write_loop<W>(
    conn: PeerConnection,
    session: u64,
    writer: W,
    mut outbox: mpsc::UnboundedReceiver<PeerMessage>,
) where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, MessageFramer);
    while let Some(message) = outbox.recv().await {
        if let Err(e) = sink.send(message).await {
            tracing::debug!("failed to write to the peer: {e}");
            conn.on_closed(session);
            return;
        }
    }
    // the outbox is dropped on close; everything queued before is flushed by now
    if let Err(e) = sink.close().await {
        tracing::trace!("failed to shut down the stream: {e}");
    }
}
