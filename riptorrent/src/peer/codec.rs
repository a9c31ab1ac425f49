//! The two wire formats of the peer protocol: the fixed 68 byte handshake
//! and the length-prefixed messages that follow it.
//!
//! These are distinct framings and must not be mixed: a session decodes
//! exactly one handshake with [`HandshakeCodec`] and then switches the same
//! stream over to [`PeerCodec`], carrying the read buffer across so that
//! bytes the peer sent right on the heels of its handshake are not lost.

use std::{convert::TryFrom, io};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// No message on a well behaved connection comes close to this; anything
/// larger is treated as a protocol error rather than buffered.
pub(crate) const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

/// The handshake exchanged as the first frame in both directions of a peer
/// connection.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, which must equal "BitTorrent protocol".
    pub prot: [u8; 19],
    /// Reserved extension bytes, ignored by this engine.
    pub reserved: [u8; 8],
    /// The torrent's SHA-1 info hash. The session aborts the connection if
    /// it doesn't match its own.
    pub info_hash: Sha1Hash,
    /// The peer's arbitrary id, not used for validation.
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;

        buf.reserve(68);
        buf.put_u8(prot.len() as u8);
        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the protocol string length is checked before waiting for the rest
        // of the frame so that garbage is rejected as early as possible
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake protocol string length must be 19",
            ));
        }

        let frame_len = 1 + prot_len + 8 + 20 + 20;
        if buf.remaining() < frame_len {
            return Ok(None);
        }
        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot[..] != *PROTOCOL_STRING.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake protocol string mismatch",
            ));
        }

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id of a message, which is the 5th byte of every non-keep-alive frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = io::Error;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Block),
            8 => Ok(Self::Cancel),
            9 => Ok(Self::Port),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unknown message id",
            )),
        }
    }
}

/// A message in the protocol that follows the handshake. The piece message
/// is called block here, as it carries a single block of a piece.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    Port(u16),
}

impl Message {
    /// Returns the id of the message, or `None` for a keep-alive.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Port(_) => Some(MessageId::Port),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let data = bitfield.into_vec();
                buf.put_u32(1 + data.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&data);
            }
            Message::Request(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 8 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Port(port) => {
                buf.put_u32(1 + 2);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.remaining() < 4 {
            return Ok(None);
        }

        // peek at the length prefix without consuming it, as the rest of the
        // frame may not have arrived yet
        let mut len_prefix = [0; 4];
        len_prefix.copy_from_slice(&buf[..4]);
        let msg_len = u32::from_be_bytes(len_prefix);
        if msg_len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds the maximum frame length",
            ));
        }

        let msg_len = msg_len as usize;
        if buf.remaining() < 4 + msg_len {
            buf.reserve(4 + msg_len - buf.remaining());
            return Ok(None);
        }
        buf.advance(4);

        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = MessageId::try_from(buf.get_u8())?;
        let payload_len = msg_len - 1;
        let expected_payload_len = match id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => Some(0),
            MessageId::Have => Some(4),
            MessageId::Request | MessageId::Cancel => Some(12),
            MessageId::Port => Some(2),
            // bitfield and block payloads are variable length
            MessageId::Bitfield => None,
            MessageId::Block => {
                if payload_len < 8 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "block message shorter than its header",
                    ));
                }
                None
            }
        };
        if let Some(expected) = expected_payload_len {
            if payload_len != expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message payload length mismatch",
                ));
            }
        }

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have {
                piece_index: buf.get_u32() as PieceIndex,
            },
            MessageId::Bitfield => {
                let mut data = vec![0; payload_len];
                buf.copy_to_slice(&mut data);
                Message::Bitfield(Bitfield::from_vec(data))
            }
            MessageId::Request => Message::Request(BlockInfo {
                piece_index: buf.get_u32() as PieceIndex,
                offset: buf.get_u32(),
                len: buf.get_u32(),
            }),
            MessageId::Block => {
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let mut data = vec![0; payload_len - 8];
                buf.copy_to_slice(&mut data);
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Cancel => Message::Cancel(BlockInfo {
                piece_index: buf.get_u32() as PieceIndex,
                offset: buf.get_u32(),
                len: buf.get_u32(),
            }),
            MessageId::Port => Message::Port(buf.get_u16()),
        };

        Ok(Some(msg))
    }
}
