use crate::tracker::client::{Announce, AnnounceResponse, Event, TrackerError};
use log::{debug, trace};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};
use url::Url;
use urlencoding::encode_binary;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP announce transport: one short-lived GET per announce over a
/// non-blocking stream, `Connection: close` delimiting the body.
pub struct HttpTracker {
    url: Url,
}

/// Query parameters with ordinary encodings. `info_hash` and `peer_id`
/// are raw 20-byte values and get percent-encoded byte-by-byte outside of
/// this struct.
#[derive(Debug, Serialize)]
struct QueryParams {
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    compact: u8,
    key: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    numwant: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
}

/// Compact peer list: a byte string of 6-byte entries, 4 bytes of
/// big-endian IPv4 then 2 of port.
mod peers {
    use serde::de::{self, Deserializer, Visitor};
    use std::fmt;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[derive(Debug, Clone)]
    pub struct Peers(pub Vec<SocketAddrV4>);

    struct PeersVisitor;

    impl<'de> Visitor<'de> for PeersVisitor {
        type Value = Peers;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("compact peer byte string")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("peer string is not a multiple of 6 bytes"));
            }
            let peers = v
                .chunks_exact(6)
                .map(|entry| {
                    SocketAddrV4::new(
                        Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]),
                        u16::from_be_bytes([entry[4], entry[5]]),
                    )
                })
                .collect();
            Ok(Peers(peers))
        }
    }

    impl<'de> serde::Deserialize<'de> for Peers {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_bytes(PeersVisitor)
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    #[serde(rename = "min interval")]
    min_interval: Option<u64>,
    complete: Option<u64>,
    incomplete: Option<u64>,
    peers: Option<peers::Peers>,
}

impl HttpTracker {
    pub fn new(url: Url) -> Result<HttpTracker, TrackerError> {
        if url.host_str().is_none() {
            return Err(TrackerError::Url("announce url has no host".into()));
        }
        Ok(HttpTracker { url })
    }

    pub fn announce(
        &mut self,
        request: &Announce,
        event: Event,
    ) -> Result<AnnounceResponse, TrackerError> {
        let query = build_query(request, event)?;
        debug!("announce GET {}?{}", self.url, query);
        let raw = self.fetch(&query)?;
        let body = split_body(&raw)?;
        parse_body(body)
    }

    /// One GET over a mio stream: wait writable, push the request, then
    /// collect the response until the server closes the connection.
    fn fetch(&self, query: &str) -> Result<Vec<u8>, TrackerError> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| TrackerError::Url("announce url has no host".into()))?;
        let port = self.url.port().unwrap_or(80);
        let addr = resolve_v4(host, port)?;
        let request = format!(
            "GET {}?{} HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
            self.url.path(),
            query,
            host
        );

        let mut stream = TcpStream::connect(addr)?;
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(8);
        poll.registry()
            .register(&mut stream, Token(0), Interest::WRITABLE)?;

        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        let mut sent = 0;
        let mut raw = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "tracker timed out").into());
            }
            poll.poll(&mut events, Some(deadline - now))?;
            let mut writable = false;
            let mut readable = false;
            for event in events.iter() {
                writable |= event.is_writable();
                readable |= event.is_readable();
            }
            if writable && sent < request.len() {
                loop {
                    match stream.write(&request.as_bytes()[sent..]) {
                        Ok(n) => {
                            sent += n;
                            if sent == request.len() {
                                poll.registry().reregister(
                                    &mut stream,
                                    Token(0),
                                    Interest::READABLE,
                                )?;
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            if readable {
                let mut chunk = [0u8; 4096];
                loop {
                    match stream.read(&mut chunk) {
                        Ok(0) => {
                            trace!("tracker closed, {} bytes", raw.len());
                            return Ok(raw);
                        }
                        Ok(n) => raw.extend_from_slice(&chunk[..n]),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }
}

fn resolve_v4(host: &str, port: u16) -> Result<SocketAddr, TrackerError> {
    (host, port)
        .to_socket_addrs()
        .map_err(TrackerError::Io)?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| TrackerError::Url(format!("no ipv4 address for {host}")))
}

fn build_query(request: &Announce, event: Event) -> Result<String, TrackerError> {
    let params = QueryParams {
        port: request.port,
        uploaded: request.uploaded,
        downloaded: request.downloaded,
        left: request.left,
        compact: 1,
        key: request.key,
        numwant: request.numwant,
        event: event.http_value(),
        ip: request.ip.map(|ip| ip.to_string()),
    };
    let tail =
        serde_urlencoded::to_string(&params).map_err(|e| TrackerError::Url(e.to_string()))?;
    Ok(format!(
        "info_hash={}&peer_id={}&{}",
        encode_binary(&request.info_hash),
        encode_binary(&request.peer_id),
        tail
    ))
}

/// Splits the response head off with httparse and hands back the body.
fn split_body(raw: &[u8]) -> Result<&[u8], TrackerError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(raw) {
        Ok(httparse::Status::Complete(head_len)) => {
            let code = response.code.unwrap_or(0);
            if !(200..300).contains(&code) {
                return Err(TrackerError::HttpStatus(code));
            }
            Ok(&raw[head_len..])
        }
        Ok(httparse::Status::Partial) => {
            Err(TrackerError::BadResponse("truncated http response".into()))
        }
        Err(e) => Err(TrackerError::BadResponse(e.to_string())),
    }
}

fn parse_body(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let raw: RawResponse =
        serde_bencode::from_bytes(body).map_err(|e| TrackerError::BadResponse(e.to_string()))?;
    if let Some(reason) = raw.failure_reason {
        return Err(TrackerError::Denied(reason));
    }
    Ok(AnnounceResponse {
        interval: raw
            .interval
            .ok_or_else(|| TrackerError::BadResponse("missing interval".into()))?,
        min_interval: raw.min_interval,
        complete: raw.complete,
        incomplete: raw.incomplete,
        peers: raw.peers.map(|p| p.0).unwrap_or_default(),
    })
}
