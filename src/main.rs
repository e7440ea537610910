use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use peerwire::{
    LoggingListener, PeerConfig, PeerConnection, PeerListener,
    extensions::metadata::{MetadataMessage, MetadataMsgType},
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connects to one peer and prints what it offers.
    Probe {
        addr: SocketAddr,
        /// hex encoded info hash of the torrent
        #[arg(long)]
        info_hash: String,
        /// number of pieces of the torrent, taken from the peer's bitfield if omitted
        #[arg(long, default_value_t = 0)]
        pieces: u32,
        /// announce DHT support and this port
        #[arg(long)]
        dht_port: Option<u16>,
        /// seconds to wait for the peer
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        /// also fetch the first piece of the info dictionary
        #[arg(long)]
        metadata: bool,
    },
}

#[derive(Debug)]
enum ProbeEvent {
    Handshake,
    ExtHandshake,
    Progress,
    Metadata(MetadataMessage),
    Closed,
}

/// Logs everything and forwards the events the probe waits for.
struct ProbeListener {
    events: mpsc::UnboundedSender<ProbeEvent>,
}

impl ProbeListener {
    fn forward(&self, event: ProbeEvent) {
        // the probe may already be done
        let _ = self.events.send(event);
    }
}

impl PeerListener for ProbeListener {
    fn handshake_finished(&self, conn: &PeerConnection) {
        LoggingListener.handshake_finished(conn);
        self.forward(ProbeEvent::Handshake);
    }

    fn ext_handshake_finished(&self, conn: &PeerConnection) {
        LoggingListener.ext_handshake_finished(conn);
        self.forward(ProbeEvent::ExtHandshake);
    }

    fn progress_updated(&self, conn: &PeerConnection) {
        LoggingListener.progress_updated(conn);
        self.forward(ProbeEvent::Progress);
    }

    fn connection_closed(&self, conn: &PeerConnection) {
        LoggingListener.connection_closed(conn);
        self.forward(ProbeEvent::Closed);
    }

    fn message_received(&self, conn: &PeerConnection, message: &peerwire::PeerMessage) {
        LoggingListener.message_received(conn, message);
    }

    fn metadata_piece_received(&self, conn: &PeerConnection, message: &MetadataMessage) {
        LoggingListener.metadata_piece_received(conn, message);
        self.forward(ProbeEvent::Metadata(message.clone()));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Probe {
            addr,
            info_hash,
            pieces,
            dht_port,
            timeout,
            metadata,
        } => {
            let info_hash: [u8; 20] = hex::decode(&info_hash)
                .context("decoding the info hash")?
                .try_into()
                .map_err(|_| anyhow::anyhow!("the info hash has to be 20 bytes"))?;
            let mut config = PeerConfig::new(info_hash).with_piece_count(pieces);
            if let Some(port) = dht_port {
                config = config.with_dht(port);
            }

            tokio::time::timeout(Duration::from_secs(timeout), probe(config, addr, metadata))
                .await
                .context("the peer didn't answer in time")?
        }
    }
}

async fn probe(config: PeerConfig, addr: SocketAddr, metadata: bool) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = PeerConnection::new(config, Arc::new(ProbeListener { events: tx }));
    if !conn.open(addr) {
        bail!("couldn't start connecting to {addr}");
    }

    let mut have_pieces = false;
    let mut have_metadata = !metadata;
    while let Some(event) = rx.recv().await {
        match event {
            ProbeEvent::Handshake => {
                let info = conn.info();
                println!("peer id: {}", String::from_utf8_lossy(&info.peer_id));
                println!("extensions: {}", info.supports_extensions());
                println!("dht: {}", info.supports_dht());
                if metadata && !info.supports_extensions() {
                    println!("peer doesn't support the extension protocol");
                    have_metadata = true;
                }
                conn.set_interested(true);
            }
            ProbeEvent::ExtHandshake => {
                let info = conn.info();
                if let Some(client) = info.client {
                    println!("client: {client}");
                }
                if let Some(size) = info.metadata_size {
                    println!("metadata size: {size}");
                }
                if metadata && !conn.request_metadata_piece(0) {
                    println!("peer doesn't support ut_metadata");
                    have_metadata = true;
                }
            }
            ProbeEvent::Progress => {
                let pieces = conn.info().pieces;
                println!(
                    "pieces: {}/{} ({:.1}%)",
                    pieces.received_count(),
                    pieces.piece_count(),
                    pieces.percentage() * 100.0
                );
                have_pieces = true;
            }
            ProbeEvent::Metadata(message) => {
                match message.msg_type {
                    MetadataMsgType::Data => println!(
                        "metadata piece {}: {} bytes of {:?}",
                        message.piece,
                        message.data.len(),
                        message.total_size
                    ),
                    MetadataMsgType::Reject => println!("metadata piece {} rejected", message.piece),
                    MetadataMsgType::Request => continue,
                }
                have_metadata = true;
            }
            ProbeEvent::Closed => bail!("the peer closed the connection"),
        }
        if have_pieces && have_metadata {
            break;
        }
    }
    conn.close();
    Ok(())
}
