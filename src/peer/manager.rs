use crate::peer::connection::{Connection, DriveError};
use crate::storage::PieceStore;
use crate::tracker::client::Stats;
use anyhow::Context;
use crossbeam::channel::Receiver;
use log::{debug, info, warn};
use mio::{Events, Interest, Poll, Token};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll timeout: the upper bound on how stale keep-alive and silence
/// timers can get.
const TICK: Duration = Duration::from_secs(1);

/// Why the swarm loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every piece verified; the payload on disk is complete.
    Complete,
    /// An external stop request ended the loop early.
    Stopped,
}

/// The swarm loop: sole owner of the piece store and every peer
/// connection, multiplexing all of them over one poll. The tracker thread
/// feeds addresses in through a channel; everything else happens between
/// readiness events on this thread.
pub struct PeerManager {
    poll: Poll,
    events: Events,
    store: PieceStore,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    max_connections: usize,
    active: HashMap<Token, Connection>,
    /// Peers currently registered for WRITABLE as well as READABLE. Write
    /// interest tracks queued output; leaving it on permanently would make
    /// every poll return immediately on always-writable sockets.
    write_registered: HashSet<Token>,
    candidates: VecDeque<SocketAddrV4>,
    known: HashSet<SocketAddrV4>,
    peer_rx: Receiver<Vec<SocketAddrV4>>,
    stop: Arc<AtomicBool>,
    next_token: usize,
}

impl PeerManager {
    pub fn new(
        store: PieceStore,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        max_connections: usize,
        peer_rx: Receiver<Vec<SocketAddrV4>>,
    ) -> anyhow::Result<PeerManager> {
        Ok(PeerManager {
            poll: Poll::new().context("creating poll")?,
            events: Events::with_capacity(128),
            store,
            info_hash,
            peer_id,
            max_connections,
            active: HashMap::new(),
            write_registered: HashSet::new(),
            candidates: VecDeque::new(),
            known: HashSet::new(),
            peer_rx,
            stop: Arc::new(AtomicBool::new(false)),
            next_token: 0,
        })
    }

    /// Flag observed once per iteration; raising it ends `run` with
    /// [`Outcome::Stopped`].
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn store(&self) -> &PieceStore {
        &self.store
    }

    pub fn run(&mut self, stats: &Stats) -> anyhow::Result<Outcome> {
        info!(
            "swarm loop starting, {} of {} pieces to go",
            self.store.need_pieces().count_ones(),
            self.store.num_pieces()
        );
        while !self.store.is_complete() {
            if self.stop.load(Ordering::Relaxed) {
                self.shutdown();
                return Ok(Outcome::Stopped);
            }
            self.ingest_candidates();
            self.admit();

            self.poll
                .poll(&mut self.events, Some(TICK))
                .context("polling the swarm")?;
            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();

            let mut failed = Vec::new();
            let mut fatal = None;
            for (token, readable, writable) in ready {
                let Some(conn) = self.active.get_mut(&token) else {
                    continue;
                };
                let mut result = Ok(());
                if writable {
                    result = conn.on_writable(&mut self.store);
                }
                if result.is_ok() && readable {
                    result = conn.on_readable(&mut self.store);
                }
                match result {
                    Ok(()) => {}
                    Err(DriveError::Peer(e)) => {
                        debug!("{}: {}", conn.addr, e);
                        failed.push(token);
                    }
                    Err(DriveError::Store(e)) => {
                        fatal = Some(e);
                        break;
                    }
                }
            }

            // maintenance runs for every peer, not just the ready ones:
            // request pipelines refill and timers fire even on quiet ticks
            let now = Instant::now();
            if fatal.is_none() {
                for (token, conn) in self.active.iter_mut() {
                    if failed.contains(token) {
                        continue;
                    }
                    match conn.drive(&mut self.store, now) {
                        Ok(()) => {}
                        Err(DriveError::Peer(e)) => {
                            debug!("{}: {}", conn.addr, e);
                            failed.push(*token);
                        }
                        Err(DriveError::Store(e)) => {
                            fatal = Some(e);
                            break;
                        }
                    }
                }
            }
            if let Some(e) = fatal {
                self.shutdown();
                return Err(e).context("piece store failed");
            }
            for token in failed {
                self.evict(token);
            }
            self.refresh_interests();

            stats
                .downloaded
                .store(self.store.bytes_downloaded(), Ordering::Relaxed);
            stats
                .uploaded
                .store(self.store.bytes_uploaded(), Ordering::Relaxed);
            stats.left.store(self.store.left(), Ordering::Relaxed);
        }
        info!("download complete");
        self.shutdown();
        Ok(Outcome::Complete)
    }

    /// Pulls tracker-discovered addresses into the candidate queue,
    /// dropping ones already seen.
    fn ingest_candidates(&mut self) {
        while let Ok(batch) = self.peer_rx.try_recv() {
            for addr in batch {
                if self.known.insert(addr) {
                    self.candidates.push_back(addr);
                }
            }
        }
    }

    /// Tops the active set up to the connection bound.
    fn admit(&mut self) {
        while self.active.len() < self.max_connections {
            let Some(addr) = self.candidates.pop_front() else {
                break;
            };
            let mut conn = match Connection::connect(
                SocketAddr::V4(addr),
                self.info_hash,
                self.peer_id,
                self.store.num_pieces(),
            ) {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("{}: connect failed: {}", addr, e);
                    self.candidates.push_back(addr);
                    break;
                }
            };
            let token = Token(self.next_token);
            self.next_token += 1;
            if let Err(e) = self.poll.registry().register(
                conn.stream_mut(),
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!("{}: register failed: {}", addr, e);
                self.candidates.push_back(addr);
                break;
            }
            debug!("{}: connecting", addr);
            self.active.insert(token, conn);
            self.write_registered.insert(token);
        }
    }

    /// Re-registers each peer so WRITABLE is watched exactly while it has
    /// output queued. Sockets with nothing to send are read-only; the poll
    /// then parks for the full tick instead of spinning on writability.
    fn refresh_interests(&mut self) {
        for (token, conn) in self.active.iter_mut() {
            let wants = conn.wants_write();
            if wants == self.write_registered.contains(token) {
                continue;
            }
            let interest = if wants {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            match self.poll.registry().reregister(conn.stream_mut(), *token, interest) {
                Ok(()) => {
                    if wants {
                        self.write_registered.insert(*token);
                    } else {
                        self.write_registered.remove(token);
                    }
                }
                Err(e) => warn!("{}: reregister failed: {}", conn.addr, e),
            }
        }
    }

    /// Tears a peer down and returns its address to the back of the
    /// candidate queue for a later retry.
    fn evict(&mut self, token: Token) {
        let Some(mut conn) = self.active.remove(&token) else {
            return;
        };
        self.write_registered.remove(&token);
        let _ = self.poll.registry().deregister(conn.stream_mut());
        conn.teardown(&mut self.store);
        if let SocketAddr::V4(addr) = conn.addr {
            self.candidates.push_back(addr);
        }
    }

    fn shutdown(&mut self) {
        let tokens: Vec<Token> = self.active.keys().copied().collect();
        for token in tokens {
            let Some(mut conn) = self.active.remove(&token) else {
                continue;
            };
            let _ = self.poll.registry().deregister(conn.stream_mut());
            conn.farewell(&mut self.store);
        }
        self.write_registered.clear();
    }
}
