use bytes::{BufMut, Bytes};

/// A payload that can be read from and written to the body of a framed message
/// (everything after the message id).
pub trait Payload: Sized {
    /// Returns `None` if `data` has the wrong size for this payload.
    fn from_be_bytes(data: &[u8]) -> Option<Self>;

    fn to_be_bytes(&self) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HavePayload {
    pub piece_index: u32,
}

impl Payload for HavePayload {
    fn from_be_bytes(data: &[u8]) -> Option<Self> {
        let piece_index = u32::from_be_bytes(data.try_into().ok()?);
        Some(Self { piece_index })
    }

    fn to_be_bytes(&self) -> Vec<u8> {
        self.piece_index.to_be_bytes().to_vec()
    }
}

/// One requested sub-range of a piece. Used by `Request` and `Cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceBlockInfo {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl PieceBlockInfo {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    /// one past the last byte of this block inside its piece
    pub(crate) fn end(&self) -> usize {
        self.begin as usize + self.length as usize
    }
}

impl Payload for PieceBlockInfo {
    fn from_be_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != 12 {
            return None;
        }
        Some(Self {
            index: read_u32(&data[0..4]),
            begin: read_u32(&data[4..8]),
            length: read_u32(&data[8..12]),
        })
    }

    fn to_be_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(12);
        bytes.put_u32(self.index);
        bytes.put_u32(self.begin);
        bytes.put_u32(self.length);
        bytes
    }
}

/// The data of one block, as carried by a `Piece` message.
/// `info.length` always equals `data.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceBlock {
    pub info: PieceBlockInfo,
    pub data: Bytes,
}

impl PieceBlock {
    pub fn new(index: u32, begin: u32, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            info: PieceBlockInfo::new(index, begin, data.len() as u32),
            data,
        }
    }
}

impl Payload for PieceBlock {
    fn from_be_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        Some(Self::new(
            read_u32(&data[0..4]),
            read_u32(&data[4..8]),
            Bytes::copy_from_slice(&data[8..]),
        ))
    }

    fn to_be_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + self.data.len());
        bytes.put_u32(self.info.index);
        bytes.put_u32(self.info.begin);
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

/// Holder for the sub-id and the raw data of an `Extended` message.
/// The sub-protocol is decoded later by the extension dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedPayload {
    pub extension_id: u8,
    pub data: Bytes,
}

impl Payload for ExtendedPayload {
    fn from_be_bytes(data: &[u8]) -> Option<Self> {
        let (&extension_id, rest) = data.split_first()?;
        Some(Self {
            extension_id,
            data: Bytes::copy_from_slice(rest),
        })
    }

    fn to_be_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + 1);
        bytes.put_u8(self.extension_id);
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPayload {
    pub port: u16,
}

impl Payload for PortPayload {
    fn from_be_bytes(data: &[u8]) -> Option<Self> {
        let port = u16::from_be_bytes(data.try_into().ok()?);
        Some(Self { port })
    }

    fn to_be_bytes(&self) -> Vec<u8> {
        self.port.to_be_bytes().to_vec()
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
