use crate::peer::message::PeerError;

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// The handshake is a fixed 68-byte frame, distinct from the
/// length-prefixed messages that follow it:
/// `0x13 | "BitTorrent protocol" | 8 reserved bytes | info_hash | peer_id`.
pub const HANDSHAKE_LENGTH: usize = 68;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake { info_hash, peer_id }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LENGTH] {
        let mut bytes = [0u8; HANDSHAKE_LENGTH];
        bytes[0] = PROTOCOL.len() as u8;
        bytes[1..20].copy_from_slice(PROTOCOL);
        // bytes 20..28 are the reserved extension bits, all zero here
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    /// Reserved bits are ignored; an unknown protocol string is treated
    /// the same as a wrong info hash, the peer is not speaking to us.
    pub fn from_bytes(bytes: &[u8]) -> Result<Handshake, PeerError> {
        if bytes.len() < HANDSHAKE_LENGTH
            || bytes[0] != PROTOCOL.len() as u8
            || &bytes[1..20] != PROTOCOL
        {
            return Err(PeerError::HandshakeMismatch);
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);
        Ok(Handshake { info_hash, peer_id })
    }

    pub fn verify(&self, info_hash: &[u8; 20]) -> bool {
        self.info_hash == *info_hash
    }
}
