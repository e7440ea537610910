use serde::Deserialize;

use crate::{
    extensions::{ExtensionError, ExtensionEvent, ExtensionHandler, ExtensionType},
    peer::PeerAddress,
};

/// Per-peer flags of the `added.f` / `added6.f` lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PexFlags {
    pub encryption: bool,
    pub seed: bool,
    pub utp: bool,
    pub holepunch: bool,
    pub connectable: bool,
}

impl PexFlags {
    pub fn from_byte(b: u8) -> Self {
        Self {
            encryption: (b & 0x01) != 0,
            seed: (b & 0x02) != 0,
            utp: (b & 0x04) != 0,
            holepunch: (b & 0x08) != 0,
            connectable: (b & 0x10) != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PexPeer {
    pub address: PeerAddress,
    pub flags: PexFlags,
}

/// Peers the remote connected to (`added`) or lost (`dropped`) since its last message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<PexPeer>,
    pub added6: Vec<PexPeer>,
    pub dropped: Vec<PeerAddress>,
    pub dropped6: Vec<PeerAddress>,
}

impl PexMessage {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.added6.is_empty()
            && self.dropped.is_empty()
            && self.dropped6.is_empty()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ExtensionError> {
        let raw: RawPex = serde_bencode::from_bytes(data)?;
        Ok(Self {
            added: with_flags(
                compact_list(&raw.added, PeerAddress::COMPACT_V4, "added")?,
                &raw.added_f,
            ),
            added6: with_flags(
                compact_list(&raw.added6, PeerAddress::COMPACT_V6, "added6")?,
                &raw.added6_f,
            ),
            dropped: compact_list(&raw.dropped, PeerAddress::COMPACT_V4, "dropped")?,
            dropped6: compact_list(&raw.dropped6, PeerAddress::COMPACT_V6, "dropped6")?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawPex {
    #[serde(default, with = "serde_bytes")]
    added: Vec<u8>,
    #[serde(default, rename = "added.f", with = "serde_bytes")]
    added_f: Vec<u8>,
    #[serde(default, with = "serde_bytes")]
    added6: Vec<u8>,
    #[serde(default, rename = "added6.f", with = "serde_bytes")]
    added6_f: Vec<u8>,
    #[serde(default, with = "serde_bytes")]
    dropped: Vec<u8>,
    #[serde(default, with = "serde_bytes")]
    dropped6: Vec<u8>,
}

fn compact_list(
    bytes: &[u8],
    entry_len: usize,
    key: &'static str,
) -> Result<Vec<PeerAddress>, ExtensionError> {
    PeerAddress::from_compact_list(bytes, entry_len).ok_or(ExtensionError::MalformedCompactList(key))
}

/// Missing flags default to none set.
fn with_flags(addresses: Vec<PeerAddress>, flags: &[u8]) -> Vec<PexPeer> {
    addresses
        .into_iter()
        .enumerate()
        .map(|(i, address)| PexPeer {
            address,
            flags: flags.get(i).copied().map(PexFlags::from_byte).unwrap_or_default(),
        })
        .collect()
}

#[derive(Debug)]
pub(crate) struct PexHandler;

impl ExtensionHandler for PexHandler {
    fn handle_message(&self, data: &[u8]) -> Result<ExtensionEvent, ExtensionError> {
        PexMessage::from_bytes(data).map(ExtensionEvent::Pex)
    }

    fn get_ext_type(&self) -> ExtensionType {
        ExtensionType::Pex
    }
}
