use crate::tracker::client::{Announce, AnnounceResponse, Event, TrackerError};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace, warn};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use rand::Rng;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::time::{Duration, Instant};
use url::Url;

/// Magic connection id of every BEP 15 connect request.
const PROTOCOL_MAGIC: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// A granted connection id is good for a minute; after that the tracker
/// has forgotten us and we connect again.
const CONNECTION_TTL: Duration = Duration::from_secs(60);

/// Base of the 15·2ⁿ retransmit ladder.
const RETRY_BASE: Duration = Duration::from_secs(15);
/// Ladder cap: the ninth timeout (n = 8) is the last one.
const MAX_RETRIES: u32 = 8;

/// UDP announce transport (BEP 15): a connect handshake that yields a
/// short-lived connection id, then fixed-layout announce packets, all
/// big-endian.
pub struct UdpTracker {
    socket: UdpSocket,
    tracker_addr: SocketAddr,
    poll: Poll,
    events: Events,
    connection: Option<(u64, Instant)>,
    retry_base: Duration,
    max_retries: u32,
}

impl UdpTracker {
    pub fn new(url: &Url) -> Result<UdpTracker, TrackerError> {
        let host = url
            .host_str()
            .ok_or_else(|| TrackerError::Url("announce url has no host".into()))?;
        let port = url
            .port()
            .ok_or_else(|| TrackerError::Url("udp announce url has no port".into()))?;
        let tracker_addr = (host, port)
            .to_socket_addrs()
            .map_err(TrackerError::Io)?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| TrackerError::Url(format!("no ipv4 address for {host}")))?;
        UdpTracker::bound(tracker_addr, RETRY_BASE, MAX_RETRIES)
    }

    fn bound(
        tracker_addr: SocketAddr,
        retry_base: Duration,
        max_retries: u32,
    ) -> Result<UdpTracker, TrackerError> {
        let mut socket = UdpSocket::bind("0.0.0.0:0".parse().map_err(|_| {
            TrackerError::Url("bind address".into())
        })?)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, Token(0), Interest::READABLE)?;
        Ok(UdpTracker {
            socket,
            tracker_addr,
            poll,
            events: Events::with_capacity(8),
            connection: None,
            retry_base,
            max_retries,
        })
    }

    pub fn announce(
        &mut self,
        request: &Announce,
        event: Event,
    ) -> Result<AnnounceResponse, TrackerError> {
        let connection_id = self.connect()?;
        let data = self.exchange(|txn| announce_packet(connection_id, txn, request, event))?;
        parse_announce(&data)
    }

    /// Obtains a connection id, reusing the current one while it is fresh.
    fn connect(&mut self) -> Result<u64, TrackerError> {
        if let Some((id, granted)) = self.connection {
            if granted.elapsed() < CONNECTION_TTL {
                return Ok(id);
            }
            debug!("udp connection id expired, reconnecting");
        }
        let data = self.exchange(connect_packet)?;
        if data.len() < 16 || BigEndian::read_u32(&data[..4]) != ACTION_CONNECT {
            return Err(TrackerError::BadResponse("short connect response".into()));
        }
        let id = BigEndian::read_u64(&data[8..16]);
        self.connection = Some((id, Instant::now()));
        trace!("udp connection id {:#x}", id);
        Ok(id)
    }

    /// One request/response exchange under the retransmit ladder. Every
    /// attempt gets a fresh transaction id; an attempt that times out is
    /// retransmitted with the next, doubled window.
    fn exchange<F>(&mut self, build: F) -> Result<Vec<u8>, TrackerError>
    where
        F: Fn(u32) -> Vec<u8>,
    {
        for attempt in 0..=self.max_retries {
            let txn = rand::thread_rng().gen::<u32>();
            self.socket.send_to(&build(txn), self.tracker_addr)?;
            match self.await_reply(txn, self.retry_base * 2u32.pow(attempt)) {
                Ok(data) => return Ok(data),
                Err(TrackerError::UdpTimeout) => {
                    warn!("udp attempt {} timed out", attempt);
                }
                Err(e) => return Err(e),
            }
        }
        Err(TrackerError::UdpTimeout)
    }

    fn await_reply(&mut self, txn: u32, timeout: Duration) -> Result<Vec<u8>, TrackerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(TrackerError::UdpTimeout);
            }
            self.poll.poll(&mut self.events, Some(deadline - now))?;
            let mut buf = [0u8; 4096];
            loop {
                match self.socket.recv_from(&mut buf) {
                    Ok((len, from)) => {
                        if from != self.tracker_addr || len < 8 {
                            continue;
                        }
                        let data = &buf[..len];
                        if BigEndian::read_u32(&data[4..8]) != txn {
                            // stale or spoofed datagram; keep waiting out
                            // the window for the real reply
                            warn!("dropping reply with wrong transaction id");
                            continue;
                        }
                        if BigEndian::read_u32(&data[..4]) == ACTION_ERROR {
                            let message = String::from_utf8_lossy(&data[8..]).into_owned();
                            return Err(TrackerError::UdpActionError(message));
                        }
                        return Ok(data.to_vec());
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

/// 16-byte connect request: magic, action 0, transaction id.
fn connect_packet(txn: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(16);
    packet.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    packet.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    packet.extend_from_slice(&txn.to_be_bytes());
    packet
}

/// 98-byte announce request, fields in BEP 15 order.
fn announce_packet(connection_id: u64, txn: u32, request: &Announce, event: Event) -> Vec<u8> {
    let mut packet = Vec::with_capacity(98);
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    packet.extend_from_slice(&txn.to_be_bytes());
    packet.extend_from_slice(&request.info_hash);
    packet.extend_from_slice(&request.peer_id);
    packet.extend_from_slice(&request.downloaded.to_be_bytes());
    packet.extend_from_slice(&request.left.to_be_bytes());
    packet.extend_from_slice(&request.uploaded.to_be_bytes());
    packet.extend_from_slice(&event.udp_code().to_be_bytes());
    let ip = request.ip.map_or(0u32, u32::from);
    packet.extend_from_slice(&ip.to_be_bytes());
    packet.extend_from_slice(&request.key.to_be_bytes());
    let numwant = request.numwant.map_or(-1i32, |n| n as i32);
    packet.extend_from_slice(&numwant.to_be_bytes());
    packet.extend_from_slice(&request.port.to_be_bytes());
    packet
}

fn parse_announce(data: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    if data.len() < 20 || BigEndian::read_u32(&data[..4]) != ACTION_ANNOUNCE {
        return Err(TrackerError::BadResponse("short announce response".into()));
    }
    let interval = BigEndian::read_u32(&data[8..12]) as u64;
    let leechers = BigEndian::read_u32(&data[12..16]) as u64;
    let seeders = BigEndian::read_u32(&data[16..20]) as u64;
    let entries = &data[20..];
    if entries.len() % 6 != 0 {
        return Err(TrackerError::BadResponse(
            "peer entries are not a multiple of 6 bytes".into(),
        ));
    }
    let peers = entries
        .chunks_exact(6)
        .map(|entry| {
            SocketAddrV4::new(
                Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]),
                u16::from_be_bytes([entry[4], entry[5]]),
            )
        })
        .collect();
    Ok(AnnounceResponse {
        interval,
        min_interval: None,
        complete: Some(seeders),
        incomplete: Some(leechers),
        peers,
    })
}
