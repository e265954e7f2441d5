use crate::bitfield::BitField;
use crate::torrent::Torrent;
use crate::BLOCK_LENGTH;
use log::{debug, info, warn};
use sha1::{Digest, Sha1};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("piece {index} offset {begin} length {length} is outside the payload")]
    OutOfRange { index: u32, begin: u32, length: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Blocks of a piece still being assembled in memory.
#[derive(Debug)]
struct PieceBuffer {
    blocks: Vec<Option<Vec<u8>>>,
    received: usize,
}

/// Owns the output file and every bit of download bookkeeping: which
/// pieces are needed, which blocks of each piece are still unclaimed, and
/// the partial buffers for pieces in flight.
///
/// Nothing reaches the file without its SHA-1 matching the metainfo; a bad
/// piece is thrown away and its bits restored so it gets fetched again.
/// Single-writer: only the swarm loop touches this.
#[derive(Debug)]
pub struct PieceStore {
    file: File,
    piece_length: u32,
    total_length: u64,
    piece_hashes: Vec<[u8; 20]>,
    need_pieces: BitField,
    have_pieces: BitField,
    need_blocks: Vec<BitField>,
    buffers: Vec<Option<PieceBuffer>>,
    downloaded: u64,
    uploaded: u64,
}

impl PieceStore {
    /// Opens (or creates) the output file and resumes from whatever valid
    /// pieces are already on disk.
    pub fn create(torrent: &Torrent, path: impl AsRef<Path>) -> Result<PieceStore, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let num_pieces = torrent.num_pieces();
        let mut store = PieceStore {
            file,
            piece_length: torrent.piece_length,
            total_length: torrent.total_length,
            piece_hashes: torrent.piece_hashes.clone(),
            need_pieces: BitField::full(num_pieces),
            have_pieces: BitField::new(num_pieces),
            need_blocks: (0..num_pieces as u32)
                .map(|i| BitField::full(torrent.blocks_in_piece(i) as usize))
                .collect(),
            buffers: (0..num_pieces).map(|_| None).collect(),
            downloaded: 0,
            uploaded: 0,
        };
        store.resume()?;
        Ok(store)
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

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

    /// Expected length of the block starting at `begin` in piece `index`,
    /// or `None` when the offset is unaligned or out of range.
    pub fn block_length(&self, index: u32, begin: u32) -> Option<u32> {
        if index as usize >= self.num_pieces() || begin % BLOCK_LENGTH != 0 {
            return None;
        }
        let block = begin / BLOCK_LENGTH;
        if block >= self.blocks_in_piece(index) {
            return None;
        }
        Some((self.piece_len(index) - begin).min(BLOCK_LENGTH))
    }

    pub fn need_pieces(&self) -> &BitField {
        &self.need_pieces
    }

    pub fn have_pieces(&self) -> &BitField {
        &self.have_pieces
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.have_pieces.is_set(index as usize)
    }

    pub fn piece_needed(&self, index: u32) -> bool {
        self.need_pieces.is_set(index as usize)
    }

    pub fn block_needed(&self, index: u32, block: u32) -> bool {
        self.need_blocks[index as usize].is_set(block as usize)
    }

    pub fn is_complete(&self) -> bool {
        self.have_pieces.all_set()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.uploaded
    }

    pub fn add_uploaded(&mut self, amount: u64) {
        self.uploaded += amount;
    }

    /// Bytes still missing from verified pieces.
    pub fn left(&self) -> u64 {
        let verified: u64 = (0..self.num_pieces() as u32)
            .filter(|&i| self.have_pieces.is_set(i as usize))
            .map(|i| self.piece_len(i) as u64)
            .sum();
        self.total_length - verified
    }

    /// Picks the next block to ask `remote_have` for: the lowest-index
    /// needed piece the peer has, then its lowest unclaimed block. The
    /// block is reserved optimistically; `unreserve` puts it back if the
    /// peer goes away.
    pub fn next_request(&mut self, remote_have: &BitField) -> Option<(u32, u32, u32)> {
        let index = self.need_pieces.first_common(remote_have)?;
        let block = self.need_blocks[index].first_set()?;
        self.need_blocks[index].clear(block);
        if self.need_blocks[index].none_set() {
            self.need_pieces.clear(index);
        }
        let index = index as u32;
        let begin = block as u32 * BLOCK_LENGTH;
        Some((index, begin, (self.piece_len(index) - begin).min(BLOCK_LENGTH)))
    }

    /// Returns a reserved block to the pool after its peer was torn down.
    /// A piece that verified in the meantime stays done.
    pub fn unreserve(&mut self, index: u32, begin: u32) {
        let i = index as usize;
        if i >= self.num_pieces() || self.have_pieces.is_set(i) {
            return;
        }
        self.need_blocks[i].set((begin / BLOCK_LENGTH) as usize);
        self.need_pieces.set(i);
    }

    /// Accepts a downloaded block. When it completes its piece the piece is
    /// verified and either written out or thrown back for re-download.
    pub fn store(&mut self, index: u32, begin: u32, data: &[u8]) -> Result<(), StoreError> {
        let i = index as usize;
        let Some(expected) = self.block_length(index, begin) else {
            warn!("dropping block {}+{}: not on a block boundary", index, begin);
            return Ok(());
        };
        if self.have_pieces.is_set(i) || data.len() as u32 != expected {
            debug!("dropping block {}+{}: stale or mis-sized", index, begin);
            return Ok(());
        }
        let blocks = self.blocks_in_piece(index) as usize;
        let buffer = self.buffers[i].get_or_insert_with(|| PieceBuffer {
            blocks: vec![None; blocks],
            received: 0,
        });
        let slot = &mut buffer.blocks[(begin / BLOCK_LENGTH) as usize];
        if slot.is_some() {
            return Ok(());
        }
        *slot = Some(data.to_vec());
        buffer.received += 1;
        self.downloaded += data.len() as u64;
        if buffer.received == blocks {
            self.finish_piece(index)?;
        }
        Ok(())
    }

    fn finish_piece(&mut self, index: u32) -> Result<(), StoreError> {
        let i = index as usize;
        let Some(buffer) = self.buffers[i].take() else {
            return Ok(());
        };
        let mut piece = Vec::with_capacity(self.piece_len(index) as usize);
        for block in buffer.blocks.into_iter().flatten() {
            piece.extend_from_slice(&block);
        }
        if <[u8; 20]>::from(Sha1::digest(&piece)) == self.piece_hashes[i] {
            self.file
                .seek(SeekFrom::Start(index as u64 * self.piece_length as u64))?;
            self.file.write_all(&piece)?;
            self.have_pieces.set(i);
            self.need_pieces.clear(i);
            debug!("piece {} verified, {} bytes left", index, self.left());
        } else {
            warn!("piece {} failed verification, refetching", index);
            self.need_pieces.set(i);
            self.need_blocks[i] = BitField::full(self.blocks_in_piece(index) as usize);
        }
        Ok(())
    }

    /// Reads a verified byte range back off disk for serving to peers.
    pub fn read(&mut self, index: u32, begin: u32, length: u32) -> Result<Vec<u8>, StoreError> {
        if index as usize >= self.num_pieces()
            || begin as u64 + length as u64 > self.piece_len(index) as u64
        {
            return Err(StoreError::OutOfRange { index, begin, length });
        }
        self.file.seek(SeekFrom::Start(
            index as u64 * self.piece_length as u64 + begin as u64,
        ))?;
        let mut data = vec![0u8; length as usize];
        self.file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Marks every piece already on disk whose bytes still hash correctly.
    fn resume(&mut self) -> Result<(), StoreError> {
        let on_disk = self.file.metadata()?.len();
        if on_disk == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; self.piece_length as usize];
        for index in 0..self.num_pieces() as u32 {
            let len = self.piece_len(index) as usize;
            let offset = index as u64 * self.piece_length as u64;
            if offset + len as u64 > on_disk {
                break;
            }
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut buf[..len])?;
            if <[u8; 20]>::from(Sha1::digest(&buf[..len])) == self.piece_hashes[index as usize] {
                let i = index as usize;
                self.have_pieces.set(i);
                self.need_pieces.clear(i);
                self.need_blocks[i] = BitField::new(self.blocks_in_piece(index) as usize);
            }
        }
        if !self.have_pieces.none_set() {
            info!(
                "resuming: {}/{} pieces already on disk",
                self.have_pieces.count_ones(),
                self.num_pieces()
            );
        }
        Ok(())
    }
}
