use bytes::{Buf, BufMut, Bytes, BytesMut};
use strum::{Display, FromRepr};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::payloads::{
    ExtendedPayload, HavePayload, Payload, PieceBlock, PieceBlockInfo, PortPayload,
};
use crate::peer::handshake::{HANDSHAKE_LEN, Handshake, PROTOCOL};

pub mod payloads;

/// Frames longer than this are never produced by a sane peer. Seeing one means we lost track of
/// the frame boundaries.
pub const MAX_FRAME_LENGTH: u32 = 8 * 1024 * 1024;

#[repr(u8)]
#[derive(Debug, Display, FromRepr, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Handshake(Handshake),
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(HavePayload),
    Bitfield(Bytes),
    Request(PieceBlockInfo),
    Piece(PieceBlock),
    Cancel(PieceBlockInfo),
    Port(PortPayload),
    Extended(ExtendedPayload),
    /// A frame with an id we don't know, or a payload that doesn't fit its id.
    /// `length` is the frame length as declared on the wire.
    Unknown { id: u8, length: u32 },
}

impl PeerMessage {
    /// The wire id, `None` for the handshake, keep-alives and unknown frames.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            PeerMessage::Choke => Some(MessageId::Choke),
            PeerMessage::Unchoke => Some(MessageId::Unchoke),
            PeerMessage::Interested => Some(MessageId::Interested),
            PeerMessage::NotInterested => Some(MessageId::NotInterested),
            PeerMessage::Have(_) => Some(MessageId::Have),
            PeerMessage::Bitfield(_) => Some(MessageId::Bitfield),
            PeerMessage::Request(_) => Some(MessageId::Request),
            PeerMessage::Piece(_) => Some(MessageId::Piece),
            PeerMessage::Cancel(_) => Some(MessageId::Cancel),
            PeerMessage::Port(_) => Some(MessageId::Port),
            PeerMessage::Extended(_) => Some(MessageId::Extended),
            PeerMessage::Handshake(_) | PeerMessage::KeepAlive | PeerMessage::Unknown { .. } => {
                None
            }
        }
    }

    /// Builds the message for a known id from the frame body (everything after the id byte).
    fn from_parts(id: MessageId, payload: &[u8]) -> Option<Self> {
        let message = match id {
            MessageId::Choke if payload.is_empty() => PeerMessage::Choke,
            MessageId::Unchoke if payload.is_empty() => PeerMessage::Unchoke,
            MessageId::Interested if payload.is_empty() => PeerMessage::Interested,
            MessageId::NotInterested if payload.is_empty() => PeerMessage::NotInterested,
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => return None,
            MessageId::Have => PeerMessage::Have(HavePayload::from_be_bytes(payload)?),
            MessageId::Bitfield => PeerMessage::Bitfield(Bytes::copy_from_slice(payload)),
            MessageId::Request => PeerMessage::Request(PieceBlockInfo::from_be_bytes(payload)?),
            MessageId::Piece => PeerMessage::Piece(PieceBlock::from_be_bytes(payload)?),
            MessageId::Cancel => PeerMessage::Cancel(PieceBlockInfo::from_be_bytes(payload)?),
            MessageId::Port => PeerMessage::Port(PortPayload::from_be_bytes(payload)?),
            MessageId::Extended => PeerMessage::Extended(ExtendedPayload::from_be_bytes(payload)?),
        };
        Some(message)
    }
}

/// Result of looking at the front of a receive buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// The next message isn't complete yet. Nothing may be consumed.
    Incomplete,
    /// A complete message; `consumed` bytes have to be discarded from the buffer.
    Message {
        message: PeerMessage,
        consumed: usize,
    },
    /// The buffer doesn't start with a sane frame. All buffered bytes have to be dropped.
    Desync,
}

/// Inspects the front of `src` without modifying it.
pub fn decode_next(src: &[u8]) -> Decoded {
    if src.is_empty() {
        return Decoded::Incomplete;
    }

    // the handshake is the only message without a length prefix.
    // A framed message can't start with 19 since that length would be way above MAX_FRAME_LENGTH.
    if src[0] == PROTOCOL.len() as u8 {
        let known = src.len().min(HANDSHAKE_LEN).min(PROTOCOL.len() + 1);
        if src[1..known] == PROTOCOL[..known - 1] {
            if src.len() < HANDSHAKE_LEN {
                return Decoded::Incomplete;
            }
            return match Handshake::decode(&src[..HANDSHAKE_LEN]) {
                Ok(handshake) => Decoded::Message {
                    message: PeerMessage::Handshake(handshake),
                    consumed: HANDSHAKE_LEN,
                },
                Err(_) => Decoded::Desync,
            };
        }
    }

    if src.len() < 4 {
        // Not enough data to read the length marker.
        return Decoded::Incomplete;
    }
    let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);

    if length == 0 {
        return Decoded::Message {
            message: PeerMessage::KeepAlive,
            consumed: 4,
        };
    }

    // Check that the length is not too large to avoid a denial of
    // service attack where we run out of memory.
    if length > MAX_FRAME_LENGTH {
        return Decoded::Desync;
    }

    let frame_len = 4 + length as usize;
    if src.len() < frame_len {
        return Decoded::Incomplete;
    }

    let id = src[4];
    let payload = &src[5..frame_len];
    let message = MessageId::from_repr(id)
        .and_then(|known| PeerMessage::from_parts(known, payload))
        .unwrap_or(PeerMessage::Unknown { id, length });

    Decoded::Message {
        message,
        consumed: frame_len,
    }
}

pub fn encode_handshake(
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    reserved: [u8; 8],
) -> Result<Bytes, CodecError> {
    Handshake::new(info_hash, peer_id, reserved)
        .to_bytes()
        .map_err(|e| CodecError::Handshake(e.to_string()))
}

pub fn encode_keep_alive() -> Bytes {
    Bytes::from_static(&[0, 0, 0, 0])
}

/// Choke, Unchoke, Interested and NotInterested carry no payload.
pub fn encode_state_message(id: MessageId) -> Bytes {
    frame(id, &[])
}

pub fn encode_have(index: u32) -> Bytes {
    frame(
        MessageId::Have,
        &HavePayload { piece_index: index }.to_be_bytes(),
    )
}

pub fn encode_block_request(info: &PieceBlockInfo) -> Bytes {
    frame(MessageId::Request, &info.to_be_bytes())
}

pub fn encode_cancel(info: &PieceBlockInfo) -> Bytes {
    frame(MessageId::Cancel, &info.to_be_bytes())
}

pub fn encode_bitfield(bits: &[u8]) -> Bytes {
    frame(MessageId::Bitfield, bits)
}

pub fn encode_piece_block(block: &PieceBlock) -> Bytes {
    frame(MessageId::Piece, &block.to_be_bytes())
}

pub fn encode_port(port: u16) -> Bytes {
    frame(MessageId::Port, &PortPayload { port }.to_be_bytes())
}

pub fn encode_extended(extension_id: u8, data: &[u8]) -> Bytes {
    let mut payload = Vec::with_capacity(data.len() + 1);
    payload.put_u8(extension_id);
    payload.extend_from_slice(data);
    frame(MessageId::Extended, &payload)
}

fn frame(id: MessageId, payload: &[u8]) -> Bytes {
    let mut bytes = BytesMut::with_capacity(5 + payload.len());
    bytes.put_u32(payload.len() as u32 + 1);
    bytes.put_u8(id as u8);
    bytes.extend_from_slice(payload);
    bytes.freeze()
}

/// Produces the bytes that go on the wire for `message`.
pub fn encode(message: &PeerMessage) -> Result<Bytes, CodecError> {
    let bytes = match message {
        PeerMessage::Handshake(handshake) => handshake
            .to_bytes()
            .map_err(|e| CodecError::Handshake(e.to_string()))?,
        PeerMessage::KeepAlive => encode_keep_alive(),
        PeerMessage::Choke => encode_state_message(MessageId::Choke),
        PeerMessage::Unchoke => encode_state_message(MessageId::Unchoke),
        PeerMessage::Interested => encode_state_message(MessageId::Interested),
        PeerMessage::NotInterested => encode_state_message(MessageId::NotInterested),
        PeerMessage::Have(have) => encode_have(have.piece_index),
        PeerMessage::Bitfield(bits) => encode_bitfield(bits),
        PeerMessage::Request(info) => encode_block_request(info),
        PeerMessage::Piece(block) => encode_piece_block(block),
        PeerMessage::Cancel(info) => encode_cancel(info),
        PeerMessage::Port(port) => encode_port(port.port),
        PeerMessage::Extended(ext) => encode_extended(ext.extension_id, &ext.data),
        PeerMessage::Unknown { id, .. } => return Err(CodecError::Unencodable(*id)),
    };
    Ok(bytes)
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Lost the frame boundaries, dropped {0} buffered bytes.")]
    FrameDesync(usize),
    #[error("Frame of length {0} is too large.")]
    FrameTooLarge(usize),
    #[error("A message with the unknown id {0} can't be encoded.")]
    Unencodable(u8),
    #[error("Failed to encode the handshake: `{0}`")]
    Handshake(String),
    #[error("An io error occured on the peer stream: `{0}`")]
    Io(#[from] std::io::Error),
}

pub struct MessageFramer;

impl Decoder for MessageFramer {
    type Item = PeerMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode_next(src) {
            Decoded::Incomplete => Ok(None),
            Decoded::Message { message, consumed } => {
                src.advance(consumed);
                Ok(Some(message))
            }
            Decoded::Desync => {
                let dropped = src.len();
                src.clear();
                Err(CodecError::FrameDesync(dropped))
            }
        }
    }
}

impl Encoder<PeerMessage> for MessageFramer {
    type Error = CodecError;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = encode(&item)?;
        // Don't send a message if it is longer than the other end will accept.
        if bytes.len() > MAX_FRAME_LENGTH as usize + 4 {
            return Err(CodecError::FrameTooLarge(bytes.len()));
        }
        dst.reserve(bytes.len());
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod test_codec {
    use super::*;

    #[test]
    fn state_messages() {
        assert_eq!(
            &encode_state_message(MessageId::Interested)[..],
            &[0, 0, 0, 1, 2]
        );
        assert_eq!(&encode_state_message(MessageId::Choke)[..], &[0, 0, 0, 1, 0]);
        assert_eq!(&encode_keep_alive()[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn fixed_layouts() {
        assert_eq!(&encode_have(0x0102)[..], &[0, 0, 0, 5, 4, 0, 0, 1, 2]);
        assert_eq!(&encode_port(6881)[..], &[0, 0, 0, 3, 9, 0x1a, 0xe1]);
        assert_eq!(
            &encode_block_request(&PieceBlockInfo::new(1, 16384, 16384))[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 64, 0, 0, 0, 64, 0]
        );
        assert_eq!(
            &encode_bitfield(&[0xff, 0x80])[..],
            &[0, 0, 0, 3, 5, 0xff, 0x80]
        );
        assert_eq!(
            &encode_piece_block(&PieceBlock::new(2, 0, vec![7, 7]))[..],
            &[0, 0, 0, 11, 7, 0, 0, 0, 2, 0, 0, 0, 0, 7, 7]
        );
        assert_eq!(&encode_extended(3, b"de")[..], &[0, 0, 0, 4, 20, 3, b'd', b'e']);
    }

    #[test]
    fn decodes_every_known_message() {
        let messages = vec![
            PeerMessage::KeepAlive,
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have(HavePayload { piece_index: 42 }),
            PeerMessage::Bitfield(Bytes::from_static(&[0xf0])),
            PeerMessage::Request(PieceBlockInfo::new(1, 0, 16384)),
            PeerMessage::Piece(PieceBlock::new(1, 0, vec![1, 2, 3])),
            PeerMessage::Cancel(PieceBlockInfo::new(1, 0, 16384)),
            PeerMessage::Port(PortPayload { port: 6881 }),
            PeerMessage::Extended(ExtendedPayload {
                extension_id: 0,
                data: Bytes::from_static(b"de"),
            }),
            PeerMessage::Handshake(Handshake::new([3; 20], [4; 20], [0; 8])),
        ];
        for message in messages {
            let bytes = encode(&message).unwrap();
            assert_eq!(
                decode_next(&bytes),
                Decoded::Message {
                    message,
                    consumed: bytes.len()
                }
            );
        }
    }

    #[test]
    fn waits_for_the_whole_frame() {
        let have = encode_have(7);
        assert_eq!(decode_next(&[]), Decoded::Incomplete);
        assert_eq!(decode_next(&have[..3]), Decoded::Incomplete);
        assert_eq!(decode_next(&have[..5]), Decoded::Incomplete);
        assert_eq!(decode_next(&have[..8]), Decoded::Incomplete);

        let handshake = encode_handshake([1; 20], [2; 20], [0; 8]).unwrap();
        assert_eq!(decode_next(&handshake[..1]), Decoded::Incomplete);
        assert_eq!(decode_next(&handshake[..30]), Decoded::Incomplete);
    }

    #[test]
    fn unknown_ids_are_consumed() {
        let bytes = [0, 0, 0, 3, 13, 1, 2, 0, 0, 0, 1, 1];
        assert_eq!(
            decode_next(&bytes),
            Decoded::Message {
                message: PeerMessage::Unknown { id: 13, length: 3 },
                consumed: 7
            }
        );
        assert_eq!(
            decode_next(&bytes[7..]),
            Decoded::Message {
                message: PeerMessage::Unchoke,
                consumed: 5
            }
        );
    }

    #[test]
    fn malformed_payloads_are_consumed() {
        // a have with a 2 byte index
        let bytes = [0, 0, 0, 3, 4, 0, 1];
        assert_eq!(
            decode_next(&bytes),
            Decoded::Message {
                message: PeerMessage::Unknown { id: 4, length: 3 },
                consumed: 7
            }
        );
    }

    #[test]
    fn absurd_length_desyncs() {
        let bytes = [0x7f, 0, 0, 0, 7, 1, 2, 3];
        assert_eq!(decode_next(&bytes), Decoded::Desync);

        let mut buf = BytesMut::from(&bytes[..]);
        let res = MessageFramer.decode(&mut buf);
        assert!(matches!(res, Err(CodecError::FrameDesync(8))));
        assert!(buf.is_empty());
    }

    #[test]
    fn framer_advances_over_messages() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_have(1));
        buf.extend_from_slice(&encode_keep_alive());
        buf.extend_from_slice(&encode_have(2)[..6]);

        assert_eq!(
            MessageFramer.decode(&mut buf).unwrap(),
            Some(PeerMessage::Have(HavePayload { piece_index: 1 }))
        );
        assert_eq!(
            MessageFramer.decode(&mut buf).unwrap(),
            Some(PeerMessage::KeepAlive)
        );
        assert_eq!(MessageFramer.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn unknown_messages_cant_be_sent() {
        let mut dst = BytesMut::new();
        let res = MessageFramer.encode(PeerMessage::Unknown { id: 99, length: 1 }, &mut dst);
        assert!(matches!(res, Err(CodecError::Unencodable(99))));
    }
}
