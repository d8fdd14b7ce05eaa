//! The wire codecs: the one-shot 68 byte handshake and the length-prefixed
//! message stream that follows it.

use std::convert::TryInto;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::PeerError, Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The fixed protocol identifier string sent in every handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Total length of a handshake on the wire: 1 + 19 + 8 + 20 + 20.
const HANDSHAKE_LEN: usize = 68;

/// The peer wire handshake, exchanged once at the start of a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

/// `Decoder`/`Encoder` for the single handshake message.
///
/// Used only for the first message exchanged on a connection; the codec is
/// then swapped out for [`PeerCodec`] via `Framed::into_parts`/`from_parts`
/// so that any bytes already buffered past the handshake aren't lost.
pub(crate) struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let prot_len = src[0] as usize;
        if prot_len != PROTOCOL_STRING.len() || src.len() < 1 + prot_len + 8 + 20 + 20 {
            return Err(PeerError::InvalidHandshake);
        }

        let mut src = src.split_to(HANDSHAKE_LEN);
        src.advance(1 + prot_len + 8);

        let mut info_hash = [0u8; 20];
        src.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = PeerError;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(PROTOCOL_STRING.len() as u8);
        dst.put_slice(PROTOCOL_STRING.as_bytes());
        dst.put_slice(&[0u8; 8]);
        dst.put_slice(&handshake.info_hash);
        dst.put_slice(&handshake.peer_id);
        Ok(())
    }
}

/// The message ids that appear after the length prefix on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl MessageId {
    fn from_u8(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Choke),
            1 => Some(Self::Unchoke),
            2 => Some(Self::Interested),
            3 => Some(Self::NotInterested),
            4 => Some(Self::Have),
            5 => Some(Self::Bitfield),
            6 => Some(Self::Request),
            7 => Some(Self::Piece),
            8 => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// A parsed peer protocol message (excluding the handshake and keep-alive,
/// which [`PeerCodec::decode`] absorbs transparently).
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece { info: BlockInfo, data: Vec<u8> },
    Cancel(BlockInfo),
}

/// `Decoder`/`Encoder` for the peer message stream that follows the
/// handshake.
pub(crate) struct PeerCodec;

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            // keep-alive: no id, no payload
            src.advance(4);
            return self.decode(src);
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        let id = src[4];
        let payload = src[5..4 + len].to_vec();
        src.advance(4 + len);

        let id = match MessageId::from_u8(id) {
            Some(id) => id,
            None => {
                log::debug!("ignoring unknown message id {}", id);
                return self.decode(src);
            }
        };

        let message = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload.len() != 4 {
                    return Err(PeerError::MalformedMessage);
                }
                let index = u32::from_be_bytes(payload[..4].try_into().unwrap());
                Message::Have(index as PieceIndex)
            }
            MessageId::Bitfield => {
                let bits = Bitfield::from_vec(payload);
                Message::Bitfield(bits)
            }
            MessageId::Request => Message::Request(parse_block_info(&payload)?),
            MessageId::Cancel => Message::Cancel(parse_block_info(&payload)?),
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(PeerError::MalformedMessage);
                }
                let piece_index =
                    u32::from_be_bytes(payload[0..4].try_into().unwrap()) as PieceIndex;
                let offset = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                let data = payload[8..].to_vec();
                Message::Piece {
                    info: BlockInfo {
                        piece_index,
                        offset,
                        len: data.len() as u32,
                    },
                    data,
                }
            }
        };

        Ok(Some(message))
    }
}

fn parse_block_info(payload: &[u8]) -> Result<BlockInfo, PeerError> {
    if payload.len() != 12 {
        return Err(PeerError::MalformedMessage);
    }
    let piece_index = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as PieceIndex;
    let offset = u32::from_be_bytes(payload[4..8].try_into().unwrap());
    let len = u32::from_be_bytes(payload[8..12].try_into().unwrap());
    Ok(BlockInfo {
        piece_index,
        offset,
        len,
    })
}

impl Encoder<Message> for PeerCodec {
    type Error = PeerError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match message {
            Message::Choke => write_header(dst, 0, MessageId::Choke),
            Message::Unchoke => write_header(dst, 0, MessageId::Unchoke),
            Message::Interested => write_header(dst, 0, MessageId::Interested),
            Message::NotInterested => write_header(dst, 0, MessageId::NotInterested),
            Message::Have(index) => {
                write_header(dst, 4, MessageId::Have);
                dst.put_u32(index as u32);
            }
            Message::Bitfield(bits) => {
                let bytes = bits.into_vec();
                write_header(dst, bytes.len() as u32, MessageId::Bitfield);
                dst.put_slice(&bytes);
            }
            Message::Request(info) => {
                write_header(dst, 12, MessageId::Request);
                put_block_info(dst, info);
            }
            Message::Cancel(info) => {
                write_header(dst, 12, MessageId::Cancel);
                put_block_info(dst, info);
            }
            Message::Piece { info, data } => {
                write_header(dst, 8 + data.len() as u32, MessageId::Piece);
                dst.put_u32(info.piece_index as u32);
                dst.put_u32(info.offset);
                dst.put_slice(&data);
            }
        }
        Ok(())
    }
}

fn write_header(dst: &mut BytesMut, payload_len: u32, id: MessageId) {
    dst.reserve(5 + payload_len as usize);
    dst.put_u32(payload_len + 1);
    dst.put_u8(id as u8);
}

fn put_block_info(dst: &mut BytesMut, info: BlockInfo) {
    dst.put_u32(info.piece_index as u32);
    dst.put_u32(info.offset);
    dst.put_u32(info.len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn handshake_decode_waits_for_full_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0u8; HANDSHAKE_LEN - 1]);
        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn keep_alive_is_skipped_transparently() {
        let mut buf = BytesMut::new();
        buf.put_u32(0); // keep-alive
        let msg = Message::Interested;
        PeerCodec.encode(msg.clone(), &mut buf).unwrap();

        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn request_round_trips() {
        let info = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(info), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Request(info));
    }

    #[test]
    fn piece_round_trips() {
        let data = vec![9u8; 10];
        let info = BlockInfo {
            piece_index: 1,
            offset: 0,
            len: data.len() as u32,
        };
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(
                Message::Piece {
                    info,
                    data: data.clone(),
                },
                &mut buf,
            )
            .unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Piece { info, data });
    }

    #[test]
    fn unknown_message_id_is_skipped() {
        let mut buf = BytesMut::new();
        // id 99 doesn't exist, followed by a valid Interested message
        buf.put_u32(1);
        buf.put_u8(99);
        PeerCodec.encode(Message::Unchoke, &mut buf).unwrap();

        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Unchoke);
    }
}
