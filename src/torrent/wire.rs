//! Peer Wire Protocol
//!
//! Message framing and the transport-facing capability trait for a single
//! peer connection (BEP 3). The engine core only ever talks to a peer
//! through [`Wire`]; `TcpWire` is the one concrete implementation. Tests
//! substitute mock wires that record the calls they receive.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bitvec::prelude::*;
use bytes::{Buf, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result};

/// Protocol string for BitTorrent
const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Size of the handshake message: 1 + 19 + 8 + 20 + 20
const HANDSHAKE_SIZE: usize = 68;

/// Timeout for the initial TCP connect to a peer
const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum message size (16 KiB block + overhead)
const MAX_MESSAGE_SIZE: usize = 32 * 1024;

/// Block size: the unit of network request (16 KiB)
pub const BLOCK_SIZE: u32 = 16384;

/// SHA-1 hash (20 bytes)
pub type Sha1Hash = [u8; 20];

/// Peer wire protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Keep connection alive (no payload)
    KeepAlive,
    /// Stop sending data to the peer
    Choke,
    /// Allow the peer to request data
    Unchoke,
    /// We want to download from the peer
    Interested,
    /// We no longer want to download from the peer
    NotInterested,
    /// Peer announces a single piece
    Have { index: u32 },
    /// Peer announces its full piece set
    Bitfield { bytes: Vec<u8> },
    /// Request a block
    Request { index: u32, begin: u32, length: u32 },
    /// Block data (response to a request)
    Block {
        index: u32,
        begin: u32,
        data: Vec<u8>,
    },
    /// Cancel a pending request
    Cancel { index: u32, begin: u32, length: u32 },
    /// DHT port announcement (decoded, ignored)
    Port { port: u16 },
    /// Message id we don't understand (tolerated, ignored)
    Unknown { id: u8 },
}

impl Message {
    /// Encode the message to its wire representation, length prefix
    /// included.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => vec![0, 0, 0, 0],
            Self::Choke => vec![0, 0, 0, 1, 0],
            Self::Unchoke => vec![0, 0, 0, 1, 1],
            Self::Interested => vec![0, 0, 0, 1, 2],
            Self::NotInterested => vec![0, 0, 0, 1, 3],

            Self::Have { index } => {
                let mut buf = vec![0, 0, 0, 5, 4];
                buf.extend_from_slice(&index.to_be_bytes());
                buf
            }

            Self::Bitfield { bytes } => {
                let len = 1 + bytes.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(5);
                buf.extend_from_slice(bytes);
                buf
            }

            Self::Request {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 6];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Block { index, begin, data } => {
                let len = 9 + data.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(7);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }

            Self::Cancel {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 8];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Port { port } => {
                let mut buf = vec![0, 0, 0, 3, 9];
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }

            Self::Unknown { id } => vec![0, 0, 0, 1, *id],
        }
    }

    /// Decode a message body (without the length prefix).
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::KeepAlive);
        }

        let id = data[0];
        let payload = &data[1..];

        let read_u32 = |off: usize| -> Result<u32> {
            payload
                .get(off..off + 4)
                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or_else(|| {
                    EngineError::protocol(
                        ProtocolErrorKind::PeerProtocol,
                        format!("Message {} too short", id),
                    )
                })
        };

        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),

            4 => Ok(Self::Have {
                index: read_u32(0)?,
            }),

            5 => Ok(Self::Bitfield {
                bytes: payload.to_vec(),
            }),

            6 => Ok(Self::Request {
                index: read_u32(0)?,
                begin: read_u32(4)?,
                length: read_u32(8)?,
            }),

            7 => {
                let index = read_u32(0)?;
                let begin = read_u32(4)?;
                Ok(Self::Block {
                    index,
                    begin,
                    data: payload[8..].to_vec(),
                })
            }

            8 => Ok(Self::Cancel {
                index: read_u32(0)?,
                begin: read_u32(4)?,
                length: read_u32(8)?,
            }),

            9 => {
                let port = payload
                    .get(0..2)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]))
                    .ok_or_else(|| {
                        EngineError::protocol(
                            ProtocolErrorKind::PeerProtocol,
                            "Port message too short",
                        )
                    })?;
                Ok(Self::Port { port })
            }

            _ => Ok(Self::Unknown { id }),
        }
    }
}

/// Capability interface a peer session uses to talk to its remote end.
///
/// The session and the piece selector call these; they never marshal bytes
/// themselves.
#[async_trait]
pub trait Wire: Send {
    async fn send_keep_alive(&mut self) -> Result<()>;
    async fn send_choke(&mut self) -> Result<()>;
    async fn send_unchoke(&mut self) -> Result<()>;
    async fn send_interested(&mut self) -> Result<()>;
    async fn send_not_interested(&mut self) -> Result<()>;
    async fn send_have(&mut self, index: u32) -> Result<()>;
    async fn send_bitfield(&mut self, bitfield: &BitVec<u8, Msb0>) -> Result<()>;
    async fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()>;
    async fn send_block(&mut self, index: u32, begin: u32, data: Vec<u8>) -> Result<()>;
    async fn send_cancel(&mut self, index: u32, begin: u32, length: u32) -> Result<()>;

    /// Read the next message from the peer.
    ///
    /// Must be cancel-safe: dropping the future mid-read leaves the stream
    /// in a consistent state, so callers may use it inside `select!`.
    async fn read_message(&mut self) -> Result<Message>;
}

/// TCP implementation of [`Wire`]
pub struct TcpWire {
    stream: TcpStream,
    addr: SocketAddr,
    io_timeout: Duration,
    /// Accumulation buffer; partial frames survive a cancelled read
    read_buffer: BytesMut,
}

impl TcpWire {
    /// Dial a peer and perform the BitTorrent handshake.
    ///
    /// Returns the wire plus the peer id the remote sent in its handshake.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        our_peer_id: [u8; 20],
        io_timeout: Duration,
    ) -> Result<(Self, [u8; 20])> {
        let stream = timeout(PEER_CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                EngineError::network(NetworkErrorKind::Timeout, "Peer connection timeout")
            })?
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::ConnectionRefused,
                    format!("Failed to connect: {}", e),
                )
            })?;

        let mut wire = Self {
            stream,
            addr,
            io_timeout,
            read_buffer: BytesMut::with_capacity(MAX_MESSAGE_SIZE),
        };
        let peer_id = wire.handshake(info_hash, our_peer_id).await?;
        Ok((wire, peer_id))
    }

    /// Wrap an accepted inbound connection and perform the handshake.
    pub async fn accept(
        stream: TcpStream,
        addr: SocketAddr,
        info_hash: Sha1Hash,
        our_peer_id: [u8; 20],
        io_timeout: Duration,
    ) -> Result<(Self, [u8; 20])> {
        let mut wire = Self {
            stream,
            addr,
            io_timeout,
            read_buffer: BytesMut::with_capacity(MAX_MESSAGE_SIZE),
        };
        let peer_id = wire.handshake(info_hash, our_peer_id).await?;
        Ok((wire, peer_id))
    }

    /// Get the remote address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Perform the 68-byte handshake exchange and validate the response.
    async fn handshake(&mut self, info_hash: Sha1Hash, our_peer_id: [u8; 20]) -> Result<[u8; 20]> {
        let mut handshake = Vec::with_capacity(HANDSHAKE_SIZE);
        handshake.push(PROTOCOL_STRING.len() as u8);
        handshake.extend_from_slice(PROTOCOL_STRING);
        handshake.extend_from_slice(&[0u8; 8]);
        handshake.extend_from_slice(&info_hash);
        handshake.extend_from_slice(&our_peer_id);

        timeout(self.io_timeout, self.stream.write_all(&handshake))
            .await
            .map_err(|_| {
                EngineError::network(NetworkErrorKind::Timeout, "Handshake send timeout")
            })?
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("Handshake send failed: {}", e),
                )
            })?;

        let mut response = [0u8; HANDSHAKE_SIZE];
        timeout(self.io_timeout, self.stream.read_exact(&mut response))
            .await
            .map_err(|_| {
                EngineError::network(NetworkErrorKind::Timeout, "Handshake receive timeout")
            })?
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("Handshake receive failed: {}", e),
                )
            })?;

        let pstrlen = response[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() || &response[1..1 + pstrlen] != PROTOCOL_STRING {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                "Invalid protocol string in handshake",
            ));
        }

        if response[28..48] != info_hash {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                "Info hash mismatch",
            ));
        }

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&response[48..68]);
        Ok(peer_id)
    }

    /// Write a full encoded message with the I/O timeout applied.
    async fn send(&mut self, msg: Message) -> Result<()> {
        let data = msg.encode();
        timeout(self.io_timeout, self.stream.write_all(&data))
            .await
            .map_err(|_| EngineError::network(NetworkErrorKind::Timeout, "Send timeout"))?
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("Send failed: {}", e),
                )
            })?;
        Ok(())
    }

    /// Pull a complete frame out of the accumulation buffer, if present.
    fn take_frame(&mut self) -> Result<Option<Message>> {
        if self.read_buffer.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([
            self.read_buffer[0],
            self.read_buffer[1],
            self.read_buffer[2],
            self.read_buffer[3],
        ]) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("Message too large: {} bytes", len),
            ));
        }

        if self.read_buffer.len() < 4 + len {
            return Ok(None);
        }

        self.read_buffer.advance(4);
        let body = self.read_buffer.split_to(len);
        Message::decode(&body).map(Some)
    }
}

#[async_trait]
impl Wire for TcpWire {
    async fn send_keep_alive(&mut self) -> Result<()> {
        self.send(Message::KeepAlive).await
    }

    async fn send_choke(&mut self) -> Result<()> {
        self.send(Message::Choke).await
    }

    async fn send_unchoke(&mut self) -> Result<()> {
        self.send(Message::Unchoke).await
    }

    async fn send_interested(&mut self) -> Result<()> {
        self.send(Message::Interested).await
    }

    async fn send_not_interested(&mut self) -> Result<()> {
        self.send(Message::NotInterested).await
    }

    async fn send_have(&mut self, index: u32) -> Result<()> {
        self.send(Message::Have { index }).await
    }

    async fn send_bitfield(&mut self, bitfield: &BitVec<u8, Msb0>) -> Result<()> {
        self.send(Message::Bitfield {
            bytes: bitfield.as_raw_slice().to_vec(),
        })
        .await
    }

    async fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        self.send(Message::Request {
            index,
            begin,
            length,
        })
        .await
    }

    async fn send_block(&mut self, index: u32, begin: u32, data: Vec<u8>) -> Result<()> {
        self.send(Message::Block { index, begin, data }).await
    }

    async fn send_cancel(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        self.send(Message::Cancel {
            index,
            begin,
            length,
        })
        .await
    }

    async fn read_message(&mut self) -> Result<Message> {
        loop {
            if let Some(msg) = self.take_frame()? {
                return Ok(msg);
            }

            // read_buf appends atomically from the future's point of view,
            // which is what keeps this loop select!-safe
            let n = timeout(self.io_timeout, self.stream.read_buf(&mut self.read_buffer))
                .await
                .map_err(|_| EngineError::network(NetworkErrorKind::Timeout, "Receive timeout"))?
                .map_err(|e| {
                    EngineError::network(
                        NetworkErrorKind::ConnectionReset,
                        format!("Receive failed: {}", e),
                    )
                })?;

            if n == 0 {
                return Err(EngineError::network(
                    NetworkErrorKind::ConnectionReset,
                    "Peer closed the connection",
                ));
            }
        }
    }
}

/// Generate a peer id with our client prefix (Azureus style).
pub fn generate_peer_id() -> [u8; 20] {
    use rand::Rng;

    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-SW0100-");
    let mut rng = rand::thread_rng();
    for byte in peer_id.iter_mut().skip(8) {
        *byte = rng.gen_range(b'0'..=b'9');
    }
    peer_id
}
