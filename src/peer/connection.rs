use crate::bitfield::BitField;
use crate::peer::handshake::{Handshake, HANDSHAKE_LENGTH};
use crate::peer::message::{self, Message, PeerError};
use crate::storage::{PieceStore, StoreError};
use crate::{MAX_FRAME_LENGTH, MAX_REQUESTS};
use bytes::BytesMut;
use log::{debug, trace, warn};
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Enqueue a keep-alive after this long without writing to the peer.
pub const KEEPALIVE_AFTER: Duration = Duration::from_secs(90);
/// Give up on a peer after this long without reading from it.
pub const SILENCE_LIMIT: Duration = Duration::from_secs(120);

/// Why driving a connection stopped. A peer fault tears down that one
/// peer; a store fault is fatal to the whole swarm.
#[derive(Debug, Error)]
pub enum DriveError {
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    HandshakeSent,
    HandshakeRecv,
    Active,
    Closed,
}

/// One peer-wire connection, driven by readiness events from the swarm
/// loop. All I/O is non-blocking; partial reads accumulate in `rx` and a
/// partially-written frame is resumed on the next writable event.
pub struct Connection {
    pub addr: SocketAddr,
    stream: TcpStream,
    state: State,
    info_hash: [u8; 20],
    my_id: [u8; 20],
    pub peer_id: Option<[u8; 20]>,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub remote_have: BitField,
    pending: Vec<(u32, u32)>,
    rx: BytesMut,
    tx: VecDeque<Message>,
    partial: Option<(Vec<u8>, usize)>,
    last_read: Instant,
    last_write: Instant,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("peer_id", &self.peer_id)
            .field("am_choking", &self.am_choking)
            .field("am_interested", &self.am_interested)
            .field("peer_choking", &self.peer_choking)
            .field("peer_interested", &self.peer_interested)
            .field("pending", &self.pending)
            .finish()
    }
}

impl Connection {
    /// Starts a non-blocking connect. The caller registers the stream with
    /// its poll; the handshake goes out on the first writable event.
    pub fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        my_id: [u8; 20],
        num_pieces: usize,
    ) -> io::Result<Connection> {
        let stream = TcpStream::connect(addr)?;
        let now = Instant::now();
        Ok(Connection {
            addr,
            stream,
            state: State::Connecting,
            info_hash,
            my_id,
            peer_id: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            remote_have: BitField::new(num_pieces),
            pending: Vec::with_capacity(MAX_REQUESTS),
            rx: BytesMut::new(),
            tx: VecDeque::new(),
            partial: None,
            last_read: now,
            last_write: now,
        })
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn pending(&self) -> &[(u32, u32)] {
        &self.pending
    }

    /// Whether the socket should be watched for writability: a connect in
    /// flight, a half-sent frame, or queued messages. Everything else is
    /// read-driven.
    pub fn wants_write(&self) -> bool {
        self.state == State::Connecting || self.partial.is_some() || !self.tx.is_empty()
    }

    /// The socket became writable: surface a failed connect, send the
    /// handshake if it has not gone out yet, then drain the queue.
    pub fn on_writable(&mut self, store: &mut PieceStore) -> Result<(), DriveError> {
        if self.state == State::Connecting {
            if let Some(e) = self.stream.take_error().map_err(PeerError::from)? {
                return Err(PeerError::from(e).into());
            }
            let handshake = Handshake::new(self.info_hash, self.my_id);
            self.partial = Some((handshake.to_bytes().to_vec(), 0));
            self.state = State::HandshakeSent;
            trace!("{}: handshake queued", self.addr);
        }
        self.evaluate(store);
        self.flush()?;
        Ok(())
    }

    /// The socket became readable: pull everything available into the
    /// receive buffer and dispatch every complete frame in it.
    pub fn on_readable(&mut self, store: &mut PieceStore) -> Result<(), DriveError> {
        let mut chunk = [0u8; 16384];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(PeerError::SocketClosed.into()),
                Ok(n) => {
                    self.last_read = Instant::now();
                    self.rx.extend_from_slice(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PeerError::from(e).into()),
            }
        }
        self.drain(store)?;
        // an unchoke or a completed block frees request slots; refill and
        // answer within the same wakeup instead of waiting for a tick
        self.evaluate(store);
        self.flush()?;
        Ok(())
    }

    /// Periodic upkeep plus another shot at interest, requests, and
    /// writes. Called every loop iteration, not just on readiness.
    pub fn drive(&mut self, store: &mut PieceStore, now: Instant) -> Result<(), DriveError> {
        if now.duration_since(self.last_read) >= SILENCE_LIMIT {
            return Err(PeerError::Timeout.into());
        }
        if self.state == State::Active
            && now.duration_since(self.last_write) >= KEEPALIVE_AFTER
            && self.tx.is_empty()
            && self.partial.is_none()
        {
            self.tx.push_back(Message::KeepAlive);
        }
        self.evaluate(store);
        self.flush()?;
        Ok(())
    }

    /// Hands every reserved block back to the store and resets the
    /// connection to its initial flags.
    pub fn teardown(&mut self, store: &mut PieceStore) {
        for (index, begin) in self.pending.drain(..) {
            store.unreserve(index, begin);
        }
        self.am_choking = true;
        self.am_interested = false;
        self.peer_choking = true;
        self.peer_interested = false;
        self.rx.clear();
        self.tx.clear();
        self.partial = None;
        self.state = State::Closed;
    }

    /// Best-effort goodbye once the download is complete.
    pub fn farewell(&mut self, store: &mut PieceStore) {
        if self.state == State::Active {
            self.tx.clear();
            self.tx.push_back(Message::NotInterested);
            let _ = self.flush();
        }
        self.teardown(store);
    }

    /// Interest tracking and request scheduling, the per-tick half of the
    /// protocol: declare interest as soon as the peer has something we
    /// need, and keep the request pipeline topped up while unchoked.
    fn evaluate(&mut self, store: &mut PieceStore) {
        if self.state != State::Active {
            return;
        }
        if !self.am_interested && store.need_pieces().intersects(&self.remote_have) {
            self.am_interested = true;
            self.tx.push_back(Message::Interested);
        }
        while !self.peer_choking && self.pending.len() < MAX_REQUESTS {
            let Some((index, begin, length)) = store.next_request(&self.remote_have) else {
                break;
            };
            self.pending.push((index, begin));
            self.tx.push_back(Message::Request(index, begin, length));
        }
    }

    /// Drains the send queue with non-blocking writes, stopping at the
    /// first short write. Nothing queued is ever dropped.
    fn flush(&mut self) -> Result<(), PeerError> {
        loop {
            if self.partial.is_none() {
                match self.tx.pop_front() {
                    Some(msg) => self.partial = Some((msg.serialize(), 0)),
                    None => return Ok(()),
                }
            }
            let Some((frame, sent)) = self.partial.as_mut() else {
                return Ok(());
            };
            match self.stream.write(&frame[*sent..]) {
                Ok(0) => return Err(PeerError::SocketClosed),
                Ok(n) => {
                    *sent += n;
                    self.last_write = Instant::now();
                    if *sent == frame.len() {
                        self.partial = None;
                    } else {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Dispatches every complete frame sitting in the receive buffer.
    fn drain(&mut self, store: &mut PieceStore) -> Result<(), DriveError> {
        loop {
            match self.state {
                State::HandshakeSent => {
                    if self.rx.len() < HANDSHAKE_LENGTH {
                        return Ok(());
                    }
                    let frame = self.rx.split_to(HANDSHAKE_LENGTH);
                    let handshake = Handshake::from_bytes(&frame)?;
                    if !handshake.verify(&self.info_hash) {
                        return Err(PeerError::HandshakeMismatch.into());
                    }
                    self.peer_id = Some(handshake.peer_id);
                    self.state = State::HandshakeRecv;
                    // our bitfield leads, before any other traffic
                    if !store.have_pieces().none_set() {
                        self.tx
                            .push_back(Message::Bitfield(store.have_pieces().as_bytes().to_vec()));
                    }
                    self.state = State::Active;
                    debug!("{}: handshake complete", self.addr);
                }
                State::Active => match message::next_frame(&mut self.rx)? {
                    Some(msg) => self.handle(msg, store)?,
                    None => return Ok(()),
                },
                // nothing to parse before our handshake is on the wire
                _ => return Ok(()),
            }
        }
    }

    fn handle(&mut self, msg: Message, store: &mut PieceStore) -> Result<(), DriveError> {
        trace!("{}: <- {:?}", self.addr, msg.id());
        match msg {
            Message::KeepAlive => {}
            Message::Choke => self.peer_choking = true,
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => {
                self.peer_interested = true;
                if self.am_choking {
                    self.am_choking = false;
                    self.tx.push_back(Message::Unchoke);
                }
            }
            Message::NotInterested => self.peer_interested = false,
            Message::Have(index) => {
                if index as usize >= self.remote_have.len() {
                    return Err(PeerError::InvalidBitfield.into());
                }
                self.remote_have.set(index as usize);
            }
            Message::Bitfield(payload) => {
                let nbits = self.remote_have.len();
                self.remote_have =
                    BitField::from_payload(payload, nbits).ok_or(PeerError::InvalidBitfield)?;
            }
            Message::Request(index, begin, length) => self.serve(index, begin, length, store)?,
            Message::Piece(index, begin, data) => {
                let position = self
                    .pending
                    .iter()
                    .position(|&(i, b)| i == index && b == begin);
                let expected = store.block_length(index, begin);
                match (position, expected) {
                    (Some(slot), Some(length)) if length as usize == data.len() => {
                        self.pending.remove(slot);
                        store.store(index, begin, &data)?;
                    }
                    _ => warn!(
                        "{}: dropping unsolicited or mis-sized block {}+{}",
                        self.addr, index, begin
                    ),
                }
            }
            Message::Cancel(index, begin, length) => {
                // a frame already being written stays; only queued ones go
                self.tx.retain(|queued| {
                    !matches!(queued, Message::Piece(i, b, data)
                        if *i == index && *b == begin && data.len() as u32 == length)
                });
            }
            Message::Port(_) => {}
        }
        Ok(())
    }

    /// Serves a block off disk. Requests while we are choking are ignored;
    /// malformed ones end the connection.
    fn serve(
        &mut self,
        index: u32,
        begin: u32,
        length: u32,
        store: &mut PieceStore,
    ) -> Result<(), DriveError> {
        if self.am_choking {
            return Ok(());
        }
        if length == 0
            || length > MAX_FRAME_LENGTH
            || index as usize >= store.num_pieces()
            || begin as u64 + length as u64 > store.piece_len(index) as u64
        {
            return Err(PeerError::BadRequest.into());
        }
        if !store.has_piece(index) {
            debug!("{}: asked for piece {} we lack", self.addr, index);
            return Ok(());
        }
        let data = store.read(index, begin, length)?;
        store.add_uploaded(length as u64);
        self.tx.push_back(Message::Piece(index, begin, data));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::Torrent;
    use sha1::{Digest, Sha1};
    use std::net::TcpListener;
    use tempfile::NamedTempFile;

    const INFO_HASH: [u8; 20] = [0xaa; 20];
    const MY_ID: [u8; 20] = [0x01; 20];
    const PEER_ID: [u8; 20] = [0x02; 20];

    fn torrent(piece_length: u32, payload: &[u8]) -> Torrent {
        Torrent {
            info_hash: INFO_HASH,
            announce: "http://tracker.local/announce".into(),
            name: "t".into(),
            piece_length,
            total_length: payload.len() as u64,
            piece_hashes: payload
                .chunks(piece_length as usize)
                .map(|chunk| Sha1::digest(chunk).into())
                .collect(),
        }
    }

    /// A connection whose socket peer is a local listener we control.
    fn connected(num_pieces: usize) -> (Connection, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let conn =
            Connection::connect(listener.local_addr().unwrap(), INFO_HASH, MY_ID, num_pieces)
                .unwrap();
        let (peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        (conn, peer)
    }

    /// Skips past Connecting/HandshakeSent by feeding the remote handshake
    /// straight into the buffer.
    fn activate(conn: &mut Connection, store: &mut PieceStore) {
        conn.state = State::HandshakeSent;
        conn.rx
            .extend_from_slice(&Handshake::new(INFO_HASH, PEER_ID).to_bytes());
        conn.drain(store).unwrap();
        assert_eq!(conn.state(), State::Active);
    }

    #[test]
    fn test_handshake_goes_out_then_state_advances() {
        let payload = b"abcdefghijklmnop";
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), payload).unwrap();
        let mut store = PieceStore::create(&torrent(16, payload), file.path()).unwrap();
        let (mut conn, mut peer) = connected(1);

        // first writable event: our 68-byte handshake hits the wire
        conn.on_writable(&mut store).unwrap();
        assert_eq!(conn.state(), State::HandshakeSent);
        let mut theirs = [0u8; HANDSHAKE_LENGTH];
        peer.read_exact(&mut theirs).unwrap();
        let parsed = Handshake::from_bytes(&theirs).unwrap();
        assert_eq!(parsed.info_hash, INFO_HASH);
        assert_eq!(parsed.peer_id, MY_ID);

        // their reply advances us to Active and our bitfield is queued
        conn.rx
            .extend_from_slice(&Handshake::new(INFO_HASH, PEER_ID).to_bytes());
        conn.drain(&mut store).unwrap();
        assert_eq!(conn.state(), State::Active);
        assert_eq!(conn.peer_id, Some(PEER_ID));
        conn.flush().unwrap();
        let mut frame = [0u8; 6];
        peer.read_exact(&mut frame).unwrap();
        assert_eq!(frame, [0, 0, 0, 2, 5, 0b10000000]);
    }

    #[test]
    fn test_handshake_mismatch_closes() {
        let file = NamedTempFile::new().unwrap();
        let mut store = PieceStore::create(&torrent(16, b"abcdefghijklmnop"), file.path()).unwrap();
        let (mut conn, _peer) = connected(1);
        conn.state = State::HandshakeSent;
        conn.rx
            .extend_from_slice(&Handshake::new([0xbb; 20], PEER_ID).to_bytes());
        assert!(matches!(
            conn.drain(&mut store),
            Err(DriveError::Peer(PeerError::HandshakeMismatch))
        ));
    }

    #[test]
    fn test_interest_and_requests_follow_the_bitfield() {
        let payload = b"abcdefghijklmnop";
        let file = NamedTempFile::new().unwrap();
        let mut store = PieceStore::create(&torrent(16, payload), file.path()).unwrap();
        let (mut conn, _peer) = connected(1);
        activate(&mut conn, &mut store);

        conn.rx
            .extend_from_slice(&Message::Bitfield(vec![0b10000000]).serialize());
        conn.rx.extend_from_slice(&Message::Unchoke.serialize());
        conn.drain(&mut store).unwrap();
        assert!(!conn.peer_choking);
        assert!(conn.remote_have.is_set(0));

        conn.evaluate(&mut store);
        assert!(conn.am_interested);
        assert_eq!(conn.pending(), &[(0, 0)]);
        assert_eq!(
            conn.tx.iter().cloned().collect::<Vec<_>>(),
            vec![Message::Interested, Message::Request(0, 0, 16)]
        );
    }

    #[test]
    fn test_mis_sized_piece_is_dropped_without_credit() {
        let payload = b"abcdefghijklmnop";
        let file = NamedTempFile::new().unwrap();
        let mut store = PieceStore::create(&torrent(16, payload), file.path()).unwrap();
        let (mut conn, _peer) = connected(1);
        activate(&mut conn, &mut store);
        conn.rx
            .extend_from_slice(&Message::Bitfield(vec![0b10000000]).serialize());
        conn.rx.extend_from_slice(&Message::Unchoke.serialize());
        conn.drain(&mut store).unwrap();
        conn.evaluate(&mut store);
        assert_eq!(conn.pending(), &[(0, 0)]);

        // 8 bytes instead of the reserved 16: no credit, request stays
        conn.rx
            .extend_from_slice(&Message::Piece(0, 0, b"abcdefgh".to_vec()).serialize());
        conn.drain(&mut store).unwrap();
        assert_eq!(conn.pending(), &[(0, 0)]);
        assert_eq!(store.bytes_downloaded(), 0);

        // the right size lands and completes the piece
        conn.rx
            .extend_from_slice(&Message::Piece(0, 0, payload.to_vec()).serialize());
        conn.drain(&mut store).unwrap();
        assert!(conn.pending().is_empty());
        assert!(store.is_complete());
    }

    #[test]
    fn test_invalid_bitfield_rejected() {
        let file = NamedTempFile::new().unwrap();
        let mut store = PieceStore::create(&torrent(16, b"abcdefghijklmnop"), file.path()).unwrap();
        let (mut conn, _peer) = connected(1);
        activate(&mut conn, &mut store);
        // trailing bit set past num_pieces
        conn.rx
            .extend_from_slice(&Message::Bitfield(vec![0b10100000]).serialize());
        assert!(matches!(
            conn.drain(&mut store),
            Err(DriveError::Peer(PeerError::InvalidBitfield))
        ));
    }

    #[test]
    fn test_teardown_restores_reservations() {
        // four pieces of 32 KiB so piece 3 has two 16 KiB blocks
        let payload: Vec<u8> = (0..4 * 32768u32).map(|i| (i % 13) as u8).collect();
        let file = NamedTempFile::new().unwrap();
        let mut store = PieceStore::create(&torrent(32768, &payload), file.path()).unwrap();
        let (mut conn, _peer) = connected(4);
        activate(&mut conn, &mut store);

        // the peer only has piece 3; claim both of its blocks
        conn.rx
            .extend_from_slice(&Message::Bitfield(vec![0b00010000]).serialize());
        conn.rx.extend_from_slice(&Message::Unchoke.serialize());
        conn.drain(&mut store).unwrap();
        conn.evaluate(&mut store);
        assert_eq!(conn.pending(), &[(3, 0), (3, 16384)]);
        assert!(!store.piece_needed(3));

        conn.teardown(&mut store);
        assert_eq!(conn.state(), State::Closed);
        assert!(store.piece_needed(3));
        assert!(store.block_needed(3, 0));
        assert!(store.block_needed(3, 1));
        assert!(conn.pending().is_empty());
        assert!(conn.peer_choking && conn.am_choking);
        assert!(!conn.am_interested && !conn.peer_interested);
    }

    #[test]
    fn test_request_is_served_after_interested() {
        let payload = b"abcdefghijklmnop";
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), payload).unwrap();
        let mut store = PieceStore::create(&torrent(16, payload), file.path()).unwrap();
        assert!(store.is_complete());
        let (mut conn, mut peer) = connected(1);
        activate(&mut conn, &mut store);
        conn.tx.clear(); // discard the queued bitfield for this test

        conn.rx.extend_from_slice(&Message::Interested.serialize());
        conn.rx
            .extend_from_slice(&Message::Request(0, 4, 8).serialize());
        conn.drain(&mut store).unwrap();
        assert!(conn.peer_interested);
        assert!(!conn.am_choking);
        assert_eq!(store.bytes_uploaded(), 8);
        conn.flush().unwrap();

        let mut unchoke = [0u8; 5];
        peer.read_exact(&mut unchoke).unwrap();
        assert_eq!(unchoke, [0, 0, 0, 1, 1]);
        let mut piece = [0u8; 4 + 9 + 8];
        peer.read_exact(&mut piece).unwrap();
        assert_eq!(&piece[..5], &[0, 0, 0, 17, 7]);
        assert_eq!(&piece[13..], b"efghijkl");
    }

    #[test]
    fn test_oversized_request_closes() {
        let payload = b"abcdefghijklmnop";
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), payload).unwrap();
        let mut store = PieceStore::create(&torrent(16, payload), file.path()).unwrap();
        let (mut conn, _peer) = connected(1);
        activate(&mut conn, &mut store);
        conn.am_choking = false;
        conn.rx
            .extend_from_slice(&Message::Request(0, 0, (1 << 17) + 1).serialize());
        assert!(matches!(
            conn.drain(&mut store),
            Err(DriveError::Peer(PeerError::BadRequest))
        ));
    }

    #[test]
    fn test_cancel_withdraws_a_queued_piece() {
        let payload = b"abcdefghijklmnop";
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), payload).unwrap();
        let mut store = PieceStore::create(&torrent(16, payload), file.path()).unwrap();
        let (mut conn, _peer) = connected(1);
        activate(&mut conn, &mut store);
        conn.tx.clear();
        conn.am_choking = false;

        conn.rx
            .extend_from_slice(&Message::Request(0, 0, 16).serialize());
        conn.rx
            .extend_from_slice(&Message::Cancel(0, 0, 16).serialize());
        conn.drain(&mut store).unwrap();
        assert!(conn.tx.iter().all(|m| !matches!(m, Message::Piece(..))));
    }
}
