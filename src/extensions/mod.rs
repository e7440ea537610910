use std::collections::HashMap;
use std::str::FromStr;

use bytes::Bytes;
use strum::{Display, EnumString, FromRepr};
use thiserror::Error;

use crate::{
    config::PeerConfig,
    extensions::{
        factory::ExtensionFactory,
        handshake::HandshakeExtension,
        metadata::MetadataMessage,
        pex::PexMessage,
    },
    messages::{PeerMessage, payloads::ExtendedPayload},
};

pub(crate) mod factory;
pub mod handshake;
pub mod metadata;
pub mod pex;

/// Enum that represents the currently supported extensions.
/// The discriminant is the sub-id we ask the remote to use when addressing us.
#[repr(u8)]
#[derive(Debug, Display, EnumString, FromRepr, Clone, Copy, PartialEq, Eq, PartialOrd, Hash)]
pub enum ExtensionType {
    #[strum(disabled)]
    Handshake = 0,
    #[strum(to_string = "ut_pex")]
    Pex = 1,
    #[strum(to_string = "ut_metadata")]
    Metadata = 2,
}

// the handshake is always active
pub const ACTIVE_EXTENSIONS: &[ExtensionType] = &[ExtensionType::Pex, ExtensionType::Metadata];

/// What an `Extended` message turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubProtocolKind {
    HandshakeEx,
    Pex,
    UtMetadata,
    Unknown,
}

/// Decoded content of a sub-protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionEvent {
    Pex(PexMessage),
    Metadata(MetadataMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionOutcome {
    pub kind: SubProtocolKind,
    pub event: Option<ExtensionEvent>,
}

impl ExtensionOutcome {
    fn unknown() -> Self {
        Self {
            kind: SubProtocolKind::Unknown,
            event: None,
        }
    }
}

/// Handles the messages of one sub-protocol addressed to us.
pub trait ExtensionHandler: Send + Sync + std::fmt::Debug {
    /// Decodes the payload of an extension message (everything after the sub-id).
    fn handle_message(&self, data: &[u8]) -> Result<ExtensionEvent, ExtensionError>;

    fn get_ext_type(&self) -> ExtensionType;
}

#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("Failed to de- or encode a bencoded extension payload: `{0}`")]
    Bencode(#[from] serde_bencode::Error),
    #[error("The compact peer list `{0}` has a partial entry.")]
    MalformedCompactList(&'static str),
    #[error("The metadata message is missing its bencoded header.")]
    MissingMetadataHeader,
}

/// Per-connection state of the extension protocol: our handlers by local sub-id and the
/// sub-ids the remote announced in its extension handshake.
#[derive(Debug)]
pub struct ExtensionProtocol {
    handlers: HashMap<u8, Box<dyn ExtensionHandler>>,
    remote: HashMap<ExtensionType, u8>,
    remote_handshake: Option<HandshakeExtension>,
}

impl Default for ExtensionProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionProtocol {
    pub fn new() -> Self {
        let handlers = ACTIVE_EXTENSIONS
            .iter()
            .filter_map(|ext| {
                ExtensionFactory::build(&ext.to_string()).map(|handler| (*ext as u8, handler))
            })
            .collect();
        Self {
            handlers,
            remote: HashMap::new(),
            remote_handshake: None,
        }
    }

    /// Our extension handshake (sub-id 0).
    pub fn handshake_message(config: &PeerConfig) -> Result<PeerMessage, ExtensionError> {
        let handshake = HandshakeExtension::local(config);
        Ok(PeerMessage::Extended(ExtendedPayload {
            extension_id: ExtensionType::Handshake as u8,
            data: Bytes::from(serde_bencode::to_bytes(&handshake)?),
        }))
    }

    /// Routes one `Extended` message by its sub-id. Malformed payloads are logged and reported
    /// as `Unknown`.
    pub fn load(&mut self, sub_id: u8, payload: &[u8]) -> ExtensionOutcome {
        if sub_id == ExtensionType::Handshake as u8 {
            return match serde_bencode::from_bytes::<HandshakeExtension>(payload) {
                Ok(handshake) => {
                    self.update_remote(handshake);
                    ExtensionOutcome {
                        kind: SubProtocolKind::HandshakeEx,
                        event: None,
                    }
                }
                Err(e) => {
                    tracing::warn!("dropping malformed extension handshake: {e}");
                    ExtensionOutcome::unknown()
                }
            };
        }

        let Some(handler) = self.handlers.get(&sub_id) else {
            tracing::debug!(sub_id, "extension message for an unknown sub-id");
            return ExtensionOutcome::unknown();
        };
        let kind = match handler.get_ext_type() {
            ExtensionType::Pex => SubProtocolKind::Pex,
            ExtensionType::Metadata => SubProtocolKind::UtMetadata,
            ExtensionType::Handshake => SubProtocolKind::HandshakeEx,
        };
        match handler.handle_message(payload) {
            Ok(event) => ExtensionOutcome {
                kind,
                event: Some(event),
            },
            Err(e) => {
                tracing::warn!(?kind, "dropping malformed extension message: {e}");
                ExtensionOutcome::unknown()
            }
        }
    }

    fn update_remote(&mut self, handshake: HandshakeExtension) {
        for (name, id) in &handshake.m {
            let Ok(ext) = ExtensionType::from_str(name) else {
                continue;
            };
            // an id of 0 switches the extension off
            match u8::try_from(*id) {
                Ok(0) => {
                    self.remote.remove(&ext);
                }
                Ok(id) => {
                    self.remote.insert(ext, id);
                }
                Err(_) => tracing::warn!(%ext, id, "ignoring out of range extension id"),
            }
        }
        self.remote_handshake = Some(handshake);
    }

    /// The sub-id the remote wants to see for `ext`, if it supports it.
    pub fn remote_id(&self, ext: ExtensionType) -> Option<u8> {
        self.remote.get(&ext).copied()
    }

    pub fn remote_handshake(&self) -> Option<&HandshakeExtension> {
        self.remote_handshake.as_ref()
    }

    pub fn remote_metadata_size(&self) -> Option<u32> {
        self.remote_handshake.as_ref()?.metadata_size
    }

    /// A `ut_metadata` request for `piece`, addressed with the remote's sub-id.
    pub fn metadata_request(&self, piece: u32) -> Result<Option<PeerMessage>, ExtensionError> {
        let Some(remote_id) = self.remote_id(ExtensionType::Metadata) else {
            return Ok(None);
        };
        let data = MetadataMessage::request(piece).to_bytes()?;
        Ok(Some(PeerMessage::Extended(ExtendedPayload {
            extension_id: remote_id,
            data,
        })))
    }
}
