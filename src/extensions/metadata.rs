use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::extensions::{ExtensionError, ExtensionEvent, ExtensionHandler, ExtensionType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum MetadataMsgType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

/// The bencoded part of a `ut_metadata` message.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct MetadataHeader {
    msg_type: MetadataMsgType,
    piece: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size: Option<u32>,
}

/// A `ut_metadata` message. `data` holds the raw metadata bytes that trail the dictionary of a
/// `Data` message and is empty otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataMessage {
    pub msg_type: MetadataMsgType,
    pub piece: u32,
    pub total_size: Option<u32>,
    pub data: Bytes,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: MetadataMsgType::Request,
            piece,
            total_size: None,
            data: Bytes::new(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ExtensionError> {
        if bytes.first() != Some(&b'd') {
            return Err(ExtensionError::MissingMetadataHeader);
        }
        // the dictionary has no length prefix; re-encoding it tells where the raw data starts
        let value: serde_bencode::value::Value = serde_bencode::from_bytes(bytes)?;
        let header_len = serde_bencode::to_bytes(&value)?.len().min(bytes.len());
        let header: MetadataHeader = serde_bencode::from_bytes(&bytes[..header_len])?;

        Ok(Self {
            msg_type: header.msg_type,
            piece: header.piece,
            total_size: header.total_size,
            data: Bytes::copy_from_slice(&bytes[header_len..]),
        })
    }

    pub fn to_bytes(&self) -> Result<Bytes, ExtensionError> {
        let header = MetadataHeader {
            msg_type: self.msg_type,
            piece: self.piece,
            total_size: self.total_size,
        };
        let mut bytes = serde_bencode::to_bytes(&header)?;
        bytes.extend_from_slice(&self.data);
        Ok(Bytes::from(bytes))
    }
}

#[derive(Debug)]
pub(crate) struct MetadataHandler;

impl ExtensionHandler for MetadataHandler {
    fn handle_message(&self, data: &[u8]) -> Result<ExtensionEvent, ExtensionError> {
        MetadataMessage::from_bytes(data).map(ExtensionEvent::Metadata)
    }

    fn get_ext_type(&self) -> ExtensionType {
        ExtensionType::Metadata
    }
}
