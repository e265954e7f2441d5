use crate::bencode::{self, BencodeError, Value};
use crate::BLOCK_LENGTH;
use sha1::{Digest, Sha1};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error("missing or malformed key `{0}`")]
    MissingKey(&'static str),
    #[error("`pieces` is not a whole number of 20-byte digests")]
    BadPiecesLength,
    #[error("multi-file torrents are not supported")]
    MultiFileUnsupported,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything the client needs from a `.torrent` file. Immutable once
/// loaded.
///
/// `info_hash` is the SHA-1 of the `info` dictionary exactly as it appears
/// in the source bytes, which is what trackers and peers identify the
/// torrent by.
#[derive(Debug, Clone)]
pub struct Torrent {
    pub info_hash: [u8; 20],
    pub announce: String,
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
}

impl Torrent {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Torrent, MetaError> {
        let bytes = std::fs::read(path)?;
        Torrent::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Torrent, MetaError> {
        let root = bencode::decode_exact(bytes)?;
        let root = root.as_dict().ok_or(MetaError::MissingKey("info"))?;

        let announce = root
            .get(b"announce".as_slice())
            .and_then(Value::as_bytes)
            .ok_or(MetaError::MissingKey("announce"))?;
        let announce = String::from_utf8_lossy(announce).into_owned();

        let info = root
            .get(b"info".as_slice())
            .and_then(Value::as_dict)
            .ok_or(MetaError::MissingKey("info"))?;
        if info.contains_key(b"files".as_slice()) {
            return Err(MetaError::MultiFileUnsupported);
        }

        let name = info
            .get(b"name".as_slice())
            .and_then(Value::as_bytes)
            .ok_or(MetaError::MissingKey("name"))?;
        let name = String::from_utf8_lossy(name).into_owned();

        let piece_length = info
            .get(b"piece length".as_slice())
            .and_then(Value::as_int)
            .filter(|&n| n > 0)
            .ok_or(MetaError::MissingKey("piece length"))? as u32;

        let total_length = info
            .get(b"length".as_slice())
            .and_then(Value::as_int)
            .filter(|&n| n >= 0)
            .ok_or(MetaError::MissingKey("length"))? as u64;

        let pieces = info
            .get(b"pieces".as_slice())
            .and_then(Value::as_bytes)
            .ok_or(MetaError::MissingKey("pieces"))?;
        if pieces.len() % 20 != 0 {
            return Err(MetaError::BadPiecesLength);
        }
        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();
        let expected = total_length.div_ceil(piece_length as u64) as usize;
        if piece_hashes.len() != expected {
            return Err(MetaError::BadPiecesLength);
        }

        // hash the exact byte span of `info`, not a re-encoding
        let span = bencode::dict_entry_span(bytes, b"info")?
            .ok_or(MetaError::MissingKey("info"))?;
        let info_hash: [u8; 20] = Sha1::digest(&bytes[span]).into();

        Ok(Torrent {
            info_hash,
            announce,
            name,
            piece_length,
            total_length,
            piece_hashes,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`; only the final piece may fall short of
    /// `piece_length`.
    pub fn piece_len(&self, index: u32) -> u32 {
        if index as usize + 1 == self.num_pieces() {
            (self.total_length - self.piece_length as u64 * (self.num_pieces() as u64 - 1)) as u32
        } else {
            self.piece_length
        }
    }

    pub fn blocks_in_piece(&self, index: u32) -> u32 {
        self.piece_len(index).div_ceil(BLOCK_LENGTH)
    }

    /// Length of block `block` inside piece `index`; the final block of a
    /// piece is clipped.
    pub fn block_len(&self, index: u32, block: u32) -> u32 {
        (self.piece_len(index) - block * BLOCK_LENGTH).min(BLOCK_LENGTH)
    }
}
