use crate::MAX_FRAME_LENGTH;
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("handshake carries the wrong info hash")]
    HandshakeMismatch,
    #[error("bitfield has the wrong size or set trailing bits")]
    InvalidBitfield,
    #[error("frame length {0} exceeds the protocol cap")]
    OversizedFrame(u32),
    #[error("malformed or out-of-range request")]
    BadRequest,
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),
    #[error("peer closed the socket")]
    SocketClosed,
    #[error("peer went silent")]
    Timeout,
    #[error("socket: {0}")]
    Io(String),
}

impl From<std::io::Error> for PeerError {
    fn from(e: std::io::Error) -> PeerError {
        PeerError::Io(e.to_string())
    }
}

/// One peer-wire message. Every non-handshake frame on the wire is
/// `u32 length | u8 id | payload`; a zero length is a keep-alive.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    Port(u16),
}

impl Message {
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(..) => Some(6),
            Message::Piece(..) => Some(7),
            Message::Cancel(..) => Some(8),
            Message::Port(_) => Some(9),
        }
    }

    /// Length of id + payload, the value of the frame's length prefix.
    pub fn body_len(&self) -> usize {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have(_) => 5,
            Message::Bitfield(bits) => 1 + bits.len(),
            Message::Request(..) | Message::Cancel(..) => 13,
            Message::Piece(_, _, data) => 9 + data.len(),
            Message::Port(_) => 3,
        }
    }

    /// Full wire frame, length prefix included.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.body_len());
        out.extend_from_slice(&(self.body_len() as u32).to_be_bytes());
        if let Some(id) = self.id() {
            out.push(id);
        }
        match self {
            Message::Have(index) => out.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield(bits) => out.extend_from_slice(bits),
            Message::Request(index, begin, length) | Message::Cancel(index, begin, length) => {
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&begin.to_be_bytes());
                out.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece(index, begin, data) => {
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&begin.to_be_bytes());
                out.extend_from_slice(data);
            }
            Message::Port(port) => out.extend_from_slice(&port.to_be_bytes()),
            _ => {}
        }
        out
    }

    /// Decodes a frame body (id + payload, the length prefix already
    /// stripped). An empty body is a keep-alive.
    pub fn parse(body: &[u8]) -> Result<Message, PeerError> {
        let Some((&id, payload)) = body.split_first() else {
            return Ok(Message::KeepAlive);
        };
        let msg = match id {
            0..=3 if !payload.is_empty() => return Err(PeerError::BadRequest),
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if payload.len() != 4 {
                    return Err(PeerError::BadRequest);
                }
                Message::Have(BigEndian::read_u32(payload))
            }
            5 => Message::Bitfield(payload.to_vec()),
            6 | 8 => {
                if payload.len() != 12 {
                    return Err(PeerError::BadRequest);
                }
                let index = BigEndian::read_u32(&payload[0..4]);
                let begin = BigEndian::read_u32(&payload[4..8]);
                let length = BigEndian::read_u32(&payload[8..12]);
                if id == 6 {
                    Message::Request(index, begin, length)
                } else {
                    Message::Cancel(index, begin, length)
                }
            }
            7 => {
                if payload.len() < 8 {
                    return Err(PeerError::BadRequest);
                }
                Message::Piece(
                    BigEndian::read_u32(&payload[0..4]),
                    BigEndian::read_u32(&payload[4..8]),
                    payload[8..].to_vec(),
                )
            }
            9 => {
                if payload.len() != 2 {
                    return Err(PeerError::BadRequest);
                }
                Message::Port(BigEndian::read_u16(payload))
            }
            other => return Err(PeerError::UnknownMessageId(other)),
        };
        Ok(msg)
    }
}

/// Pops one complete frame off the receive buffer, or `None` when a full
/// frame has not arrived yet. Length prefixes above the protocol cap are a
/// violation, not a long wait.
pub fn next_frame(rx: &mut BytesMut) -> Result<Option<Message>, PeerError> {
    if rx.len() < 4 {
        return Ok(None);
    }
    let length = BigEndian::read_u32(&rx[..4]);
    if length > MAX_FRAME_LENGTH {
        return Err(PeerError::OversizedFrame(length));
    }
    if rx.len() < 4 + length as usize {
        return Ok(None);
    }
    rx.advance(4);
    let body = rx.split_to(length as usize);
    Message::parse(&body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_alive_frame() {
        let msg = Message::KeepAlive;
        assert_eq!(msg.serialize(), vec![0, 0, 0, 0]);
        assert_eq!(Message::parse(&[]).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_flag_messages() {
        assert_eq!(Message::Choke.serialize(), vec![0, 0, 0, 1, 0]);
        assert_eq!(Message::Unchoke.serialize(), vec![0, 0, 0, 1, 1]);
        assert_eq!(Message::Interested.serialize(), vec![0, 0, 0, 1, 2]);
        assert_eq!(Message::NotInterested.serialize(), vec![0, 0, 0, 1, 3]);
        assert_eq!(Message::parse(&[2]).unwrap(), Message::Interested);
    }

    #[test]
    fn test_have_round_trip() {
        let bytes = Message::Have(0x01020304).serialize();
        assert_eq!(bytes, vec![0, 0, 0, 5, 4, 1, 2, 3, 4]);
        assert_eq!(Message::parse(&bytes[4..]).unwrap(), Message::Have(0x01020304));
    }

    #[test]
    fn test_request_round_trip() {
        let msg = Message::Request(2, 16384, 16384);
        let bytes = msg.serialize();
        assert_eq!(bytes.len(), 17);
        assert_eq!(Message::parse(&bytes[4..]).unwrap(), msg);
    }

    #[test]
    fn test_piece_length_prefix_is_u32() {
        // a full 16 KiB block must not wrap the length prefix
        let msg = Message::Piece(0, 0, vec![0xcd; 16384]);
        let bytes = msg.serialize();
        assert_eq!(&bytes[..4], &(16393u32).to_be_bytes());
        assert_eq!(Message::parse(&bytes[4..]).unwrap(), msg);
    }

    #[test]
    fn test_malformed_payloads() {
        assert_eq!(Message::parse(&[4, 0, 0]), Err(PeerError::BadRequest));
        assert_eq!(Message::parse(&[6, 0]), Err(PeerError::BadRequest));
        assert_eq!(Message::parse(&[0, 1]), Err(PeerError::BadRequest));
        assert_eq!(Message::parse(&[42]), Err(PeerError::UnknownMessageId(42)));
    }

    #[test]
    fn test_frame_sequence_parses_back_exactly() {
        let sequence = vec![
            Message::Bitfield(vec![0b10100000]),
            Message::KeepAlive,
            Message::Unchoke,
            Message::Request(0, 0, 16384),
            Message::Piece(0, 0, b"data".to_vec()),
            Message::Cancel(0, 16384, 16384),
            Message::Port(6881),
        ];
        let mut rx = BytesMut::new();
        for msg in &sequence {
            rx.extend_from_slice(&msg.serialize());
        }
        let mut parsed = Vec::new();
        while let Some(msg) = next_frame(&mut rx).unwrap() {
            parsed.push(msg);
        }
        assert_eq!(parsed, sequence);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_incomplete_frame_waits() {
        let mut rx = BytesMut::from(&Message::Have(7).serialize()[..6]);
        assert_eq!(next_frame(&mut rx).unwrap(), None);
        assert_eq!(rx.len(), 6);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut rx = BytesMut::from(&(1u32 << 20).to_be_bytes()[..]);
        assert_eq!(
            next_frame(&mut rx),
            Err(PeerError::OversizedFrame(1 << 20))
        );
    }
}
