use crate::tracker::http::HttpTracker;
use crate::tracker::udp::UdpTracker;
use crossbeam::channel::Sender;
use log::{error, info, warn};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("announce url is not usable: {0}")]
    Url(String),
    #[error("tracker answered with http status {0}")]
    HttpStatus(u16),
    #[error("tracker denied the announce: {0}")]
    Denied(String),
    #[error("udp tracker did not answer in time")]
    UdpTimeout,
    #[error("udp tracker error: {0}")]
    UdpActionError(String),
    #[error("response transaction id does not match the request")]
    TransactionMismatch,
    #[error("unparseable tracker response: {0}")]
    BadResponse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Announce events. Periodic re-announces carry no event on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
    Completed,
    Periodic,
}

impl Event {
    /// Value of the `event` query parameter for HTTP announces.
    pub fn http_value(self) -> Option<&'static str> {
        match self {
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
            Event::Completed => Some("completed"),
            Event::Periodic => None,
        }
    }

    /// BEP 15 event code.
    pub fn udp_code(self) -> u32 {
        match self {
            Event::Periodic => 0,
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }
}

/// Parameters common to every announce, whichever transport carries it.
#[derive(Debug, Clone)]
pub struct Announce {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub numwant: Option<u32>,
    pub key: u32,
    pub ip: Option<Ipv4Addr>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds to wait before the next periodic announce.
    pub interval: u64,
    pub min_interval: Option<u64>,
    /// Seeders, when the tracker reports them.
    pub complete: Option<u64>,
    /// Leechers, when the tracker reports them.
    pub incomplete: Option<u64>,
    pub peers: Vec<SocketAddrV4>,
}

/// The two tracker transports behind one announce contract, picked by the
/// announce URL's scheme.
pub enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    pub fn from_url(announce: &str) -> Result<Tracker, TrackerError> {
        let url = Url::parse(announce).map_err(|e| TrackerError::Url(e.to_string()))?;
        match url.scheme() {
            "http" => Ok(Tracker::Http(HttpTracker::new(url)?)),
            "udp" => Ok(Tracker::Udp(UdpTracker::new(&url)?)),
            other => Err(TrackerError::Url(format!("unsupported scheme `{other}`"))),
        }
    }

    pub fn announce(
        &mut self,
        request: &Announce,
        event: Event,
    ) -> Result<AnnounceResponse, TrackerError> {
        match self {
            Tracker::Http(tracker) => tracker.announce(request, event),
            Tracker::Udp(tracker) => tracker.announce(request, event),
        }
    }
}

/// Transfer counters the announce loop snapshots. Written by the swarm
/// loop only; the loop here just reads.
#[derive(Debug, Default)]
pub struct Stats {
    pub uploaded: AtomicU64,
    pub downloaded: AtomicU64,
    pub left: AtomicU64,
}

/// The periodic announce loop, meant for its own thread. Discovered peers
/// go into `peers_tx`; that channel is the only handoff to the swarm loop.
///
/// Announce failures end the loop (the swarm keeps running on the peers it
/// already has). Raising `stop` gets a final `stopped` announce sent, so
/// the tracker can drop us from the swarm promptly.
pub fn run(
    mut tracker: Tracker,
    base: Announce,
    stats: Arc<Stats>,
    peers_tx: Sender<Vec<SocketAddrV4>>,
    stop: Arc<AtomicBool>,
) {
    let mut event = Event::Started;
    let mut announced = false;
    while !stop.load(Ordering::Relaxed) {
        let request = snapshot(&base, &stats);
        match tracker.announce(&request, event) {
            Ok(response) => {
                announced = true;
                info!(
                    "tracker: {} peers, next announce in {}s",
                    response.peers.len(),
                    response.interval
                );
                if !response.peers.is_empty() && peers_tx.send(response.peers).is_err() {
                    // swarm loop is gone
                    return;
                }
                event = Event::Periodic;
                let mut remaining = response.interval;
                while remaining > 0 && !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_secs(1));
                    remaining -= 1;
                }
            }
            Err(TrackerError::Denied(reason)) => {
                error!("tracker denied us: {}", reason);
                return;
            }
            Err(e) => {
                // the swarm keeps its current peers; a parting announce to
                // a tracker that just failed us is not worth the wait
                warn!("announce failed, giving up on the tracker: {}", e);
                return;
            }
        }
    }
    if announced {
        let request = snapshot(&base, &stats);
        if let Err(e) = tracker.announce(&request, Event::Stopped) {
            warn!("parting announce failed: {}", e);
        }
    }
}

fn snapshot(base: &Announce, stats: &Stats) -> Announce {
    Announce {
        uploaded: stats.uploaded.load(Ordering::Relaxed),
        downloaded: stats.downloaded.load(Ordering::Relaxed),
        left: stats.left.load(Ordering::Relaxed),
        ..base.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};
    use crossbeam::channel;
    use std::net::UdpSocket as StdUdpSocket;
    use std::thread;

    #[test]
    fn test_event_wire_values() {
        assert_eq!(Event::Started.http_value(), Some("started"));
        assert_eq!(Event::Stopped.http_value(), Some("stopped"));
        assert_eq!(Event::Completed.http_value(), Some("completed"));
        assert_eq!(Event::Periodic.http_value(), None);
        assert_eq!(Event::Periodic.udp_code(), 0);
        assert_eq!(Event::Completed.udp_code(), 1);
        assert_eq!(Event::Started.udp_code(), 2);
        assert_eq!(Event::Stopped.udp_code(), 3);
    }

    #[test]
    fn test_from_url_dispatches_on_scheme() {
        assert!(matches!(
            Tracker::from_url("http://tracker.local:8080/announce"),
            Ok(Tracker::Http(_))
        ));
        assert!(matches!(
            Tracker::from_url("udp://127.0.0.1:6969"),
            Ok(Tracker::Udp(_))
        ));
        assert!(matches!(
            Tracker::from_url("wss://tracker.local/announce"),
            Err(TrackerError::Url(_))
        ));
        assert!(matches!(
            Tracker::from_url("not a url"),
            Err(TrackerError::Url(_))
        ));
    }

    /// Minimal BEP 15 responder: answers one connect and every announce,
    /// then reports the announce event codes it saw.
    fn spawn_udp_tracker(announces_expected: usize) -> (std::net::SocketAddr, thread::JoinHandle<Vec<u32>>) {
        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut events = Vec::new();
            let mut buf = [0u8; 1024];
            while events.len() < announces_expected {
                let (len, from) = socket.recv_from(&mut buf).unwrap();
                let txn = BigEndian::read_u32(&buf[12..16]);
                let mut reply = Vec::new();
                if len == 16 {
                    reply.extend_from_slice(&0u32.to_be_bytes());
                    reply.extend_from_slice(&txn.to_be_bytes());
                    reply.extend_from_slice(&7u64.to_be_bytes());
                } else {
                    events.push(BigEndian::read_u32(&buf[80..84]));
                    reply.extend_from_slice(&1u32.to_be_bytes());
                    reply.extend_from_slice(&txn.to_be_bytes());
                    reply.extend_from_slice(&1u32.to_be_bytes()); // interval
                    reply.extend_from_slice(&0u32.to_be_bytes());
                    reply.extend_from_slice(&1u32.to_be_bytes());
                    reply.extend_from_slice(&[10, 0, 0, 9, 0x1a, 0xe1]);
                }
                socket.send_to(&reply, from).unwrap();
            }
            events
        });
        (addr, handle)
    }

    #[test]
    fn test_loop_announces_started_then_stopped_on_cancel() {
        let (addr, tracker_thread) = spawn_udp_tracker(2);
        let tracker = Tracker::from_url(&format!("udp://{addr}")).unwrap();
        let base = Announce {
            info_hash: [0x33; 20],
            peer_id: *b"-MN0010-000000000000",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 16,
            numwant: None,
            key: 1,
            ip: None,
        };
        let stats = Arc::new(Stats::default());
        stats.left.store(16, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));
        let (peers_tx, peers_rx) = channel::unbounded();

        let loop_stop = stop.clone();
        let loop_thread = thread::spawn(move || run(tracker, base, stats, peers_tx, loop_stop));

        // the started announce delivers one peer into the handoff channel
        let peers = peers_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("started announce should deliver peers");
        assert_eq!(peers, vec![SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 6881)]);

        stop.store(true, Ordering::Relaxed);
        loop_thread.join().unwrap();
        let events = tracker_thread.join().unwrap();
        assert_eq!(events, vec![Event::Started.udp_code(), Event::Stopped.udp_code()]);
    }
}
