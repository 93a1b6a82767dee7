//! Tracker Client
//!
//! Announces to HTTP (BEP 3) and UDP (BEP 15) trackers and parses the
//! peer lists they return. The coordinator feeds the aggregate transfer
//! counters in and gets fresh peer addresses out; the tracker never sees
//! anything else of the engine.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use url::Url;

use super::bencode::BencodeValue;
use super::wire::Sha1Hash;
use crate::error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result};

/// Default timeout for tracker requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Magic constant opening every UDP tracker conversation
const UDP_PROTOCOL_ID: u64 = 0x41727101980;

/// Bounds applied to the interval a tracker hands back
const MIN_ANNOUNCE_INTERVAL: u32 = 60;
const MAX_ANNOUNCE_INTERVAL: u32 = 3600;

/// Announce event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Regular periodic announce
    None,
    /// Download has started
    Started,
    /// Download has stopped
    Stopped,
    /// Download has completed
    Completed,
}

impl AnnounceEvent {
    fn http_value(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    fn udp_value(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Completed => 1,
            Self::Started => 2,
            Self::Stopped => 3,
        }
    }
}

/// Announce request parameters
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub numwant: u32,
}

/// Parsed announce response
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until the next announce, clamped to sane bounds
    pub interval: u32,
    /// Seeder count, when the tracker reports it
    pub complete: Option<u32>,
    /// Leecher count, when the tracker reports it
    pub incomplete: Option<u32>,
    /// Discovered peer addresses
    pub peers: Vec<SocketAddr>,
}

/// Tracker client for HTTP and UDP trackers
pub struct TrackerClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl TrackerClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Announce to a tracker URL, dispatching on the scheme.
    pub async fn announce(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let url = Url::parse(tracker_url)?;
        match url.scheme() {
            "http" | "https" => self.announce_http(&url, request).await,
            "udp" => self.announce_udp(&url, request).await,
            scheme => Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("Unsupported tracker scheme: {}", scheme),
            )),
        }
    }

    async fn announce_http(
        &self,
        url: &Url,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let full_url = build_http_announce_url(url, request);

        let response = self.http.get(&full_url).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::network(
                NetworkErrorKind::HttpStatus(response.status().as_u16()),
                format!("Tracker returned {}", response.status()),
            ));
        }

        let body = response.bytes().await?;
        parse_http_announce_response(&body)
    }

    async fn announce_udp(&self, url: &Url, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let host = url.host_str().ok_or_else(|| {
            EngineError::protocol(ProtocolErrorKind::TrackerError, "UDP tracker URL has no host")
        })?;
        let port = url.port().ok_or_else(|| {
            EngineError::protocol(ProtocolErrorKind::TrackerError, "UDP tracker URL has no port")
        })?;

        let target = (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                EngineError::network(NetworkErrorKind::Other, format!("DNS failure: {}", e))
            })?
            .next()
            .ok_or_else(|| {
                EngineError::network(NetworkErrorKind::Other, "Tracker host resolved to nothing")
            })?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(target).await?;

        // Connect round-trip
        let transaction_id: u32 = rand::thread_rng().gen();
        let connect = build_udp_connect(transaction_id);
        socket.send(&connect).await?;

        let mut buf = [0u8; 1500];
        let n = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| {
                EngineError::network(NetworkErrorKind::Timeout, "UDP tracker connect timeout")
            })??;
        let connection_id = parse_udp_connect(&buf[..n], transaction_id)?;

        // Announce round-trip
        let transaction_id: u32 = rand::thread_rng().gen();
        let announce = build_udp_announce(connection_id, transaction_id, request);
        socket.send(&announce).await?;

        let n = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| {
                EngineError::network(NetworkErrorKind::Timeout, "UDP tracker announce timeout")
            })??;
        parse_udp_announce(&buf[..n], transaction_id)
    }
}

/// Percent-encode raw bytes for a query string.
fn urlencode_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("%{:02X}", b)).collect()
}

fn build_http_announce_url(url: &Url, request: &AnnounceRequest) -> String {
    let separator = if url.query().is_some() { '&' } else { '?' };
    let mut full = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
        url,
        separator,
        urlencode_bytes(&request.info_hash),
        urlencode_bytes(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
        request.numwant,
    );

    let event = request.event.http_value();
    if !event.is_empty() {
        full.push_str("&event=");
        full.push_str(event);
    }
    full
}

fn tracker_error(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::TrackerError, message)
}

fn parse_http_announce_response(body: &[u8]) -> Result<AnnounceResponse> {
    let root = BencodeValue::parse_exact(body)
        .map_err(|_| tracker_error("Tracker response is not valid bencode"))?;

    if let Some(reason) = root.get("failure reason").and_then(|v| v.as_string()) {
        return Err(tracker_error(format!("Tracker failure: {}", reason)));
    }

    let interval = root
        .get("interval")
        .and_then(|v| v.as_uint())
        .unwrap_or(1800) as u32;

    let complete = root.get("complete").and_then(|v| v.as_uint()).map(|v| v as u32);
    let incomplete = root
        .get("incomplete")
        .and_then(|v| v.as_uint())
        .map(|v| v as u32);

    let peers = match root.get("peers") {
        // Compact form: 6 bytes per peer (4 IP + 2 port, network order)
        Some(BencodeValue::Bytes(bytes)) => parse_compact_peers(bytes),
        // Dictionary form
        Some(BencodeValue::List(entries)) => entries
            .iter()
            .filter_map(|entry| {
                let ip: IpAddr = entry.get("ip")?.as_string()?.parse().ok()?;
                let port = entry.get("port")?.as_uint()? as u16;
                Some(SocketAddr::new(ip, port))
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval: interval.clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL),
        complete,
        incomplete,
        peers,
    })
}

fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .filter(|addr| addr.port() != 0)
        .collect()
}

fn build_udp_connect(transaction_id: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(16);
    packet.extend_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes()); // action: connect
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet
}

fn parse_udp_connect(data: &[u8], expected_transaction: u32) -> Result<u64> {
    if data.len() < 16 {
        return Err(tracker_error("UDP connect response too short"));
    }
    let action = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let transaction = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

    if action != 0 || transaction != expected_transaction {
        return Err(tracker_error("UDP connect response mismatch"));
    }

    Ok(u64::from_be_bytes([
        data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
    ]))
}

fn build_udp_announce(
    connection_id: u64,
    transaction_id: u32,
    request: &AnnounceRequest,
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(98);
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&1u32.to_be_bytes()); // action: announce
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(&request.info_hash);
    packet.extend_from_slice(&request.peer_id);
    packet.extend_from_slice(&request.downloaded.to_be_bytes());
    packet.extend_from_slice(&request.left.to_be_bytes());
    packet.extend_from_slice(&request.uploaded.to_be_bytes());
    packet.extend_from_slice(&request.event.udp_value().to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes()); // IP: default
    packet.extend_from_slice(&0u32.to_be_bytes()); // key
    packet.extend_from_slice(&request.numwant.to_be_bytes());
    packet.extend_from_slice(&request.port.to_be_bytes());
    packet
}

fn parse_udp_announce(data: &[u8], expected_transaction: u32) -> Result<AnnounceResponse> {
    if data.len() < 20 {
        return Err(tracker_error("UDP announce response too short"));
    }
    let action = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let transaction = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

    if action == 3 {
        // Error packet: message follows the transaction id
        let message = String::from_utf8_lossy(&data[8..]).to_string();
        return Err(tracker_error(format!("Tracker failure: {}", message)));
    }
    if action != 1 || transaction != expected_transaction {
        return Err(tracker_error("UDP announce response mismatch"));
    }

    let interval = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let leechers = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
    let seeders = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
    let peers = parse_compact_peers(&data[20..]);

    Ok(AnnounceResponse {
        interval: interval.clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL),
        complete: Some(seeders),
        incomplete: Some(leechers),
        peers,
    })
}
