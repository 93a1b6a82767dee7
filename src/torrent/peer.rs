//! Peer Session
//!
//! Per-connection protocol state and the transitions it drives against
//! the download table: interest recomputation, choke handling, block
//! acceptance and verification hand-off, and the delayed (cancelable)
//! serving of inbound block requests.
//!
//! One session task owns its wire exclusively. Everything else reaches a
//! session through its command channel: the unchoke scheduler pushes
//! choke/unchoke directives, verified pieces are broadcast as have
//! commands, and delayed block reads complete back into the session that
//! scheduled them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use bitvec::prelude::*;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::choking::Directive;
use super::piece::{BlockWrite, DownloadState, PeerId, RequestPlan};
use super::stats::TransferStats;
use super::storage::Storage;
use super::wire::{Message, Wire, BLOCK_SIZE};
use crate::config::TorrentConfig;
use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Command channel depth per session
const COMMAND_BUFFER: usize = 64;

/// Four-flag connection state. Both sides start choked and uninterested.
#[derive(Debug, Clone, Copy)]
pub struct ConnFlags {
    /// We are choking the peer
    pub am_choking: bool,
    /// We want to download from the peer
    pub am_interested: bool,
    /// The peer is choking us
    pub peer_choking: bool,
    /// The peer wants to download from us
    pub peer_interested: bool,
}

impl Default for ConnFlags {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Session state visible outside the session task (scheduler snapshots)
pub struct SessionShared {
    flags: RwLock<ConnFlags>,
    last_block_at: RwLock<Instant>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            flags: RwLock::new(ConnFlags::default()),
            // Baseline for snub detection is session start
            last_block_at: RwLock::new(Instant::now()),
        }
    }

    /// Current connection flags.
    pub fn flags(&self) -> ConnFlags {
        *self.flags.read()
    }

    /// When the peer last delivered a block (session start if never).
    pub fn last_block_at(&self) -> Instant {
        *self.last_block_at.read()
    }

    fn update(&self, apply: impl FnOnce(&mut ConnFlags)) {
        apply(&mut self.flags.write());
    }

    fn touch_block(&self) {
        *self.last_block_at.write() = Instant::now();
    }
}

/// Directive or work item pushed into a session from outside its task
#[derive(Debug)]
pub enum SessionCommand {
    /// Stop uploading to the peer
    Choke,
    /// Allow the peer to download
    Unchoke,
    /// Announce a freshly verified piece
    Have(u32),
    /// A delayed block read completed; put the block on the wire
    ServeBlock { index: u32, begin: u32, data: Vec<u8> },
    /// Terminate the session
    Close,
}

/// Handle to a live session, held by the registry
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
    shared: Arc<SessionShared>,
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// Connection is done; do not redial
    Closed,
    /// The peer choked us mid-transfer; worth redialing fresh
    Reconnect,
}

#[derive(Debug)]
enum Flow {
    Continue,
    Stop,
    Reconnect,
}

/// Registry of live peer sessions plus the banned set consulted at
/// admission time.
pub struct PeerRegistry {
    max_peers: usize,
    peers: RwLock<HashMap<PeerId, SessionHandle>>,
    banned: RwLock<HashSet<PeerId>>,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            max_peers,
            peers: RwLock::new(HashMap::new()),
            banned: RwLock::new(HashSet::new()),
        }
    }

    /// Admit a new session unless the peer is banned, already connected,
    /// or the connection limit is reached.
    pub fn admit(&self, peer_id: &str, handle: SessionHandle) -> bool {
        if self.banned.read().contains(peer_id) {
            tracing::debug!("Rejecting banned peer {}", peer_id);
            return false;
        }

        let mut peers = self.peers.write();
        if peers.len() >= self.max_peers || peers.contains_key(peer_id) {
            return false;
        }
        peers.insert(peer_id.to_string(), handle);
        true
    }

    /// Drop a session entry. Called from session teardown.
    pub fn remove(&self, peer_id: &str) {
        self.peers.write().remove(peer_id);
    }

    /// Ban peers: future admissions are rejected and any live session is
    /// cancelled (its teardown releases table state).
    pub fn ban_peers(&self, peer_ids: &[PeerId]) {
        let mut banned = self.banned.write();
        let peers = self.peers.read();
        for peer_id in peer_ids {
            banned.insert(peer_id.clone());
            if let Some(handle) = peers.get(peer_id) {
                handle.cancel.cancel();
            }
        }
    }

    /// True if the peer has been banned.
    pub fn is_banned(&self, peer_id: &str) -> bool {
        self.banned.read().contains(peer_id)
    }

    /// True if a session for this peer is live.
    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// True when no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Queue a have announcement to every connected peer.
    pub fn broadcast_have(&self, index: u32) {
        for handle in self.peers.read().values() {
            let _ = handle.cmd_tx.try_send(SessionCommand::Have(index));
        }
    }

    /// Push the scheduler's choke/unchoke directives to their sessions.
    /// A full queue means the session is wedged; the directive is simply
    /// retried at the next tick.
    pub fn apply_directives(&self, directives: Vec<Directive>) {
        let peers = self.peers.read();
        for directive in directives {
            let (peer_id, command) = match directive {
                Directive::Unchoke(id) => (id, SessionCommand::Unchoke),
                Directive::Choke(id) => (id, SessionCommand::Choke),
            };
            if let Some(handle) = peers.get(&peer_id) {
                let _ = handle.cmd_tx.try_send(command);
            }
        }
    }

    /// Snapshot of (peer, flags, last block time) for the scheduler.
    pub fn session_views(&self) -> Vec<(PeerId, ConnFlags, Instant)> {
        self.peers
            .read()
            .iter()
            .map(|(id, handle)| {
                (
                    id.clone(),
                    handle.shared.flags(),
                    handle.shared.last_block_at(),
                )
            })
            .collect()
    }

    /// Cancel every live session.
    pub fn shutdown(&self) {
        for handle in self.peers.read().values() {
            handle.cancel.cancel();
        }
    }
}

/// One peer connection: owns the wire, drives the protocol state machine.
pub struct PeerSession<W: Wire> {
    peer_id: PeerId,
    wire: W,
    table: Arc<DownloadState>,
    storage: Arc<dyn Storage>,
    registry: Arc<PeerRegistry>,
    stats: Arc<TransferStats>,
    config: TorrentConfig,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    cmd_tx: mpsc::Sender<SessionCommand>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    /// Remote-announced piece set
    peer_bits: BitVec<u8, Msb0>,
    /// Blocks this peer has delivered over the session lifetime
    blocks_received: u64,
    /// Scheduled (delayed) block reads, cancelable per request
    pending_reads: HashMap<(u32, u32, u32), CancellationToken>,
    last_sent: Instant,
}

impl<W: Wire> PeerSession<W> {
    /// Build a session and the handle the registry keeps for it.
    pub fn new(
        peer_id: PeerId,
        wire: W,
        table: Arc<DownloadState>,
        storage: Arc<dyn Storage>,
        registry: Arc<PeerRegistry>,
        stats: Arc<TransferStats>,
        config: TorrentConfig,
    ) -> (Self, SessionHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let cancel = CancellationToken::new();
        let shared = Arc::new(SessionShared::new());

        let handle = SessionHandle {
            cmd_tx: cmd_tx.clone(),
            cancel: cancel.clone(),
            shared: Arc::clone(&shared),
        };

        let num_pieces = table.num_pieces();
        let session = Self {
            peer_id,
            wire,
            table,
            storage,
            registry,
            stats,
            config,
            shared,
            cancel,
            cmd_tx,
            cmd_rx,
            peer_bits: bitvec![u8, Msb0; 0; num_pieces],
            blocks_received: 0,
            pending_reads: HashMap::new(),
            last_sent: Instant::now(),
        };

        (session, handle)
    }

    /// Drive the session until the connection ends, then release
    /// everything it held: pending delayed reads, the registry entry,
    /// stats, and the table assignment plus availability counts.
    pub async fn run(mut self) -> Result<SessionExit> {
        self.stats.register_peer(&self.peer_id);
        let result = self.drive().await;

        self.cancel.cancel();
        self.registry.remove(&self.peer_id);
        self.stats.remove_peer(&self.peer_id);
        self.table.peer_stopped(&self.peer_id, Some(&self.peer_bits));

        result
    }

    async fn drive(&mut self) -> Result<SessionExit> {
        // Open by announcing what we already hold
        let bitfield = self.table.bitfield();
        self.wire.send_bitfield(&bitfield).await?;
        self.mark_sent();

        let keepalive_interval = self.config.keepalive_interval();
        let mut keepalive = tokio::time::interval(keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Ok(SessionExit::Closed);
                }

                Some(command) = self.cmd_rx.recv() => {
                    match self.handle_command(command).await? {
                        Flow::Continue => {}
                        Flow::Stop => return Ok(SessionExit::Closed),
                        Flow::Reconnect => return Ok(SessionExit::Reconnect),
                    }
                }

                message = self.wire.read_message() => {
                    match self.handle_message(message?).await? {
                        Flow::Continue => {}
                        Flow::Stop => return Ok(SessionExit::Closed),
                        Flow::Reconnect => return Ok(SessionExit::Reconnect),
                    }
                }

                _ = keepalive.tick() => {
                    if self.last_sent.elapsed() >= keepalive_interval {
                        self.wire.send_keep_alive().await?;
                        self.mark_sent();
                    }
                }
            }
        }
    }

    fn mark_sent(&mut self) {
        self.last_sent = Instant::now();
    }

    fn protocol_violation(&self, message: String) -> EngineError {
        EngineError::protocol(ProtocolErrorKind::PeerProtocol, message)
    }

    async fn handle_message(&mut self, message: Message) -> Result<Flow> {
        match message {
            Message::KeepAlive | Message::Port { .. } | Message::Unknown { .. } => {}

            Message::Choke => {
                if !self.shared.flags().peer_choking {
                    self.shared.update(|f| f.peer_choking = true);
                    self.table.peer_choked(&self.peer_id);

                    // A peer that chokes while we are mid-transfer is
                    // assumed transiently unreliable; drop the connection
                    // and redial fresh rather than leave it half-open
                    if self.shared.flags().am_interested && self.blocks_received > 0 {
                        tracing::debug!(
                            "Peer {} choked us mid-transfer, reconnecting",
                            self.peer_id
                        );
                        return Ok(Flow::Reconnect);
                    }
                }
            }

            Message::Unchoke => {
                if self.shared.flags().peer_choking {
                    self.shared.update(|f| f.peer_choking = false);
                    if self.shared.flags().am_interested {
                        self.request_more().await?;
                    }
                }
            }

            Message::Interested => {
                self.shared.update(|f| f.peer_interested = true);
            }

            Message::NotInterested => {
                self.shared.update(|f| f.peer_interested = false);
            }

            Message::Have { index } => {
                if index as usize >= self.table.num_pieces() {
                    return Err(self.protocol_violation(format!(
                        "Have for out-of-range piece {}",
                        index
                    )));
                }
                self.peer_bits.set(index as usize, true);
                self.table.piece_have(index);
                self.recompute_interest().await?;
            }

            Message::Bitfield { bytes } => {
                self.apply_bitfield(&bytes);

                let useful = self.offers_anything();
                if useful {
                    self.recompute_interest().await?;
                } else if !self.table.is_complete() {
                    // While still downloading, a peer with nothing useful
                    // is not worth holding open
                    tracing::debug!("Peer {} offers nothing, closing", self.peer_id);
                    return Ok(Flow::Stop);
                }
            }

            Message::Request {
                index,
                begin,
                length,
            } => {
                let flags = self.shared.flags();
                if flags.am_choking || !flags.peer_interested {
                    return Err(self.protocol_violation(
                        "Request while choked or not interested".to_string(),
                    ));
                }
                self.schedule_block_read(index, begin, length)?;
            }

            Message::Block { index, begin, data } => {
                let flags = self.shared.flags();
                if flags.peer_choking || !flags.am_interested {
                    // Raced with a choke transition; drop it
                    return Ok(Flow::Continue);
                }
                return self.accept_block(index, begin, data).await;
            }

            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let flags = self.shared.flags();
                if flags.am_choking || !flags.peer_interested {
                    return Err(self.protocol_violation(
                        "Cancel while choked or not interested".to_string(),
                    ));
                }
                if let Some(token) = self.pending_reads.remove(&(index, begin, length)) {
                    token.cancel();
                }
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Result<Flow> {
        match command {
            SessionCommand::Choke => {
                if !self.shared.flags().am_choking {
                    self.shared.update(|f| f.am_choking = true);
                    self.wire.send_choke().await?;
                    self.mark_sent();
                }
            }

            SessionCommand::Unchoke => {
                if self.shared.flags().am_choking {
                    self.shared.update(|f| f.am_choking = false);
                    self.wire.send_unchoke().await?;
                    self.mark_sent();
                }
            }

            SessionCommand::Have(index) => {
                self.wire.send_have(index).await?;
                self.mark_sent();
            }

            SessionCommand::ServeBlock { index, begin, data } => {
                self.pending_reads.remove(&(index, begin, data.len() as u32));
                let length = data.len() as u64;
                self.wire.send_block(index, begin, data).await?;
                self.stats.record_upload(&self.peer_id, length);
                self.mark_sent();
            }

            SessionCommand::Close => return Ok(Flow::Stop),
        }

        Ok(Flow::Continue)
    }

    /// Accept an inbound block: bookkeeping, table write, verification
    /// hand-off, then pipeline the next request.
    async fn accept_block(&mut self, index: u32, begin: u32, data: Vec<u8>) -> Result<Flow> {
        if begin % BLOCK_SIZE != 0 {
            return Err(self.protocol_violation(format!(
                "Block offset {} not aligned to block size",
                begin
            )));
        }
        let block_index = begin / BLOCK_SIZE;

        self.blocks_received += 1;
        self.shared.touch_block();
        self.stats.record_download(&self.peer_id, data.len() as u64);

        match self.table.write_block(&self.peer_id, index, block_index, data) {
            Ok(BlockWrite::Incomplete) => {}

            Ok(BlockWrite::Complete(piece)) => {
                // Persist outside the table lock; the bitfield bit flips
                // only after the write lands
                self.storage.write_piece(piece.index, &piece.data).await?;
                self.table.mark_verified(piece.index)?;
                tracing::debug!("Piece {} verified and saved", piece.index);
                self.registry.broadcast_have(piece.index);
            }

            Err(EngineError::Checksum {
                piece,
                contributors,
            }) => {
                // Any peer that supplied any block of the corrupted piece
                // is banned; this session is among them and terminates
                tracing::warn!(
                    "Piece {} failed verification, banning {} contributing peers",
                    piece,
                    contributors.len()
                );
                self.registry.ban_peers(&contributors);
                return Err(EngineError::Checksum {
                    piece,
                    contributors,
                });
            }

            Err(err) => return Err(err),
        }

        self.request_more().await?;
        Ok(Flow::Continue)
    }

    /// Ask the selector what to fetch next and put it on the wire; an
    /// empty answer while interested downgrades to not-interested.
    async fn request_more(&mut self) -> Result<()> {
        match self.table.request_blocks(&self.peer_id, &self.peer_bits) {
            RequestPlan::NotInterested => {
                if self.shared.flags().am_interested {
                    self.shared.update(|f| f.am_interested = false);
                    self.wire.send_not_interested().await?;
                    self.mark_sent();
                }
            }
            RequestPlan::Requests(requests) => {
                let sent_any = !requests.is_empty();
                for request in requests {
                    self.wire
                        .send_request(request.piece, request.begin, request.length)
                        .await?;
                }
                if sent_any {
                    self.mark_sent();
                }
            }
        }
        Ok(())
    }

    /// Become interested as soon as the peer holds a piece we lack.
    async fn recompute_interest(&mut self) -> Result<()> {
        if self.shared.flags().am_interested {
            return Ok(());
        }
        if self.offers_anything() {
            self.shared.update(|f| f.am_interested = true);
            self.wire.send_interested().await?;
            self.mark_sent();
        }
        Ok(())
    }

    fn offers_anything(&self) -> bool {
        self.peer_bits
            .iter_ones()
            .any(|index| !self.table.have_piece(index as u32))
    }

    fn apply_bitfield(&mut self, bytes: &[u8]) {
        let num_pieces = self.table.num_pieces();
        for (byte_index, byte) in bytes.iter().enumerate() {
            for bit in 0..8 {
                let index = byte_index * 8 + bit;
                if index < num_pieces && (byte & (0x80 >> bit)) != 0 {
                    self.peer_bits.set(index, true);
                    self.table.piece_have(index as u32);
                }
            }
        }
    }

    /// Schedule the delayed disk read for an inbound request. The action
    /// is cancelable: a matching cancel message, or session teardown,
    /// suppresses it before it fires.
    fn schedule_block_read(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        if !self.table.have_piece(index) {
            return Err(self.protocol_violation(format!(
                "Request for piece {} we do not have",
                index
            )));
        }
        // Standard requests are one block; allow slight slack for odd
        // clients, reject anything larger outright
        if length == 0 || length > BLOCK_SIZE + 1024 {
            return Err(self.protocol_violation(format!("Bad request length {}", length)));
        }

        let key = (index, begin, length);
        if self.pending_reads.contains_key(&key) {
            return Ok(());
        }

        let token = self.cancel.child_token();
        self.pending_reads.insert(key, token.clone());

        let storage = Arc::clone(&self.storage);
        let cmd_tx = self.cmd_tx.clone();
        let delay = self.config.block_read_delay();
        let peer_id = self.peer_id.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    match storage.read_block(index, begin, length).await {
                        Ok(data) => {
                            let _ = cmd_tx
                                .send(SessionCommand::ServeBlock { index, begin, data })
                                .await;
                        }
                        Err(err) => {
                            tracing::error!(
                                "Block read for {} failed: {}",
                                peer_id,
                                err
                            );
                            let _ = cmd_tx.send(SessionCommand::Close).await;
                        }
                    }
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sha1::{Digest, Sha1};
    use std::time::Duration;

    /// Wire double that records every outbound call.
    #[derive(Default)]
    struct MockWire {
        sent: Vec<Message>,
    }

    #[async_trait]
    impl Wire for MockWire {
        async fn send_keep_alive(&mut self) -> Result<()> {
            self.sent.push(Message::KeepAlive);
            Ok(())
        }
        async fn send_choke(&mut self) -> Result<()> {
            self.sent.push(Message::Choke);
            Ok(())
        }
        async fn send_unchoke(&mut self) -> Result<()> {
            self.sent.push(Message::Unchoke);
            Ok(())
        }
        async fn send_interested(&mut self) -> Result<()> {
            self.sent.push(Message::Interested);
            Ok(())
        }
        async fn send_not_interested(&mut self) -> Result<()> {
            self.sent.push(Message::NotInterested);
            Ok(())
        }
        async fn send_have(&mut self, index: u32) -> Result<()> {
            self.sent.push(Message::Have { index });
            Ok(())
        }
        async fn send_bitfield(&mut self, bitfield: &BitVec<u8, Msb0>) -> Result<()> {
            self.sent.push(Message::Bitfield {
                bytes: bitfield.as_raw_slice().to_vec(),
            });
            Ok(())
        }
        async fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
            self.sent.push(Message::Request {
                index,
                begin,
                length,
            });
            Ok(())
        }
        async fn send_block(&mut self, index: u32, begin: u32, data: Vec<u8>) -> Result<()> {
            self.sent.push(Message::Block { index, begin, data });
            Ok(())
        }
        async fn send_cancel(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
            self.sent.push(Message::Cancel {
                index,
                begin,
                length,
            });
            Ok(())
        }
        async fn read_message(&mut self) -> Result<Message> {
            std::future::pending().await
        }
    }

    /// Storage double recording piece writes.
    #[derive(Default)]
    struct MockStorage {
        written: parking_lot::Mutex<Vec<(u32, Vec<u8>)>>,
    }

    #[async_trait]
    impl Storage for MockStorage {
        async fn read_block(&self, piece: u32, begin: u32, length: u32) -> Result<Vec<u8>> {
            let _ = (piece, begin);
            Ok(vec![0xAA; length as usize])
        }
        async fn write_piece(&self, piece: u32, data: &[u8]) -> Result<()> {
            self.written.lock().push((piece, data.to_vec()));
            Ok(())
        }
        async fn current_state(&self) -> Result<super::super::storage::DiskState> {
            unimplemented!("not used in session tests")
        }
    }

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    struct Fixture {
        table: Arc<DownloadState>,
        storage: Arc<MockStorage>,
        registry: Arc<PeerRegistry>,
        stats: Arc<TransferStats>,
        blocks: Vec<Vec<u8>>,
    }

    /// Three 64 KiB pieces; piece 1's digest matches four test blocks.
    fn fixture(pipeline: usize) -> Fixture {
        let blocks: Vec<Vec<u8>> =
            (1u8..=4).map(|v| vec![v; BLOCK_SIZE as usize]).collect();
        let hashes = vec![[0u8; 20], sha1(&blocks.concat()), [0u8; 20]];

        Fixture {
            table: Arc::new(DownloadState::new(hashes, 65536, 3 * 65536, pipeline)),
            storage: Arc::new(MockStorage::default()),
            registry: Arc::new(PeerRegistry::new(10)),
            stats: Arc::new(TransferStats::new()),
            blocks,
        }
    }

    fn session_with_delay(
        fx: &Fixture,
        peer_id: &str,
        block_read_delay_secs: u64,
    ) -> (PeerSession<MockWire>, SessionHandle) {
        let storage: Arc<dyn Storage> = fx.storage.clone();
        PeerSession::new(
            peer_id.to_string(),
            MockWire::default(),
            Arc::clone(&fx.table),
            storage,
            Arc::clone(&fx.registry),
            Arc::clone(&fx.stats),
            TorrentConfig {
                block_read_delay_secs,
                ..Default::default()
            },
        )
    }

    fn session(fx: &Fixture, peer_id: &str) -> (PeerSession<MockWire>, SessionHandle) {
        session_with_delay(fx, peer_id, 0)
    }

    fn requests(wire: &MockWire) -> Vec<(u32, u32)> {
        wire.sent
            .iter()
            .filter_map(|m| match m {
                Message::Request { index, begin, .. } => Some((*index, *begin)),
                _ => None,
            })
            .collect()
    }

    /// Bitfield bytes announcing exactly the given pieces (MSB first).
    fn bitfield_bytes(num_pieces: usize, have: &[usize]) -> Vec<u8> {
        let mut bytes = vec![0u8; num_pieces.div_ceil(8)];
        for &index in have {
            bytes[index / 8] |= 0x80 >> (index % 8);
        }
        bytes
    }

    #[tokio::test]
    async fn test_bitfield_with_useful_piece_triggers_interest() {
        let fx = fixture(5);
        let (mut session, _handle) = session(&fx, "p1");

        let flow = session
            .handle_message(Message::Bitfield {
                bytes: bitfield_bytes(3, &[1]),
            })
            .await
            .unwrap();

        assert!(matches!(flow, Flow::Continue));
        assert!(session.wire.sent.contains(&Message::Interested));
        assert_eq!(fx.table.availability(1), Some(1));
        assert!(session.shared.flags().am_interested);
    }

    #[tokio::test]
    async fn test_bitfield_with_nothing_useful_closes_session() {
        let fx = fixture(5);
        let (mut session, _handle) = session(&fx, "p1");

        let flow = session
            .handle_message(Message::Bitfield {
                bytes: bitfield_bytes(3, &[]),
            })
            .await
            .unwrap();

        assert!(matches!(flow, Flow::Stop));
    }

    #[tokio::test]
    async fn test_have_out_of_range_is_protocol_violation() {
        let fx = fixture(5);
        let (mut session, _handle) = session(&fx, "p1");

        let err = session
            .handle_message(Message::Have { index: 99 })
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_unchoke_while_interested_requests_blocks() {
        let fx = fixture(3);
        let (mut session, _handle) = session(&fx, "p1");

        session
            .handle_message(Message::Bitfield {
                bytes: bitfield_bytes(3, &[1]),
            })
            .await
            .unwrap();
        session.handle_message(Message::Unchoke).await.unwrap();

        assert_eq!(
            requests(&session.wire),
            vec![(1, 0), (1, BLOCK_SIZE), (1, 2 * BLOCK_SIZE)]
        );
    }

    #[tokio::test]
    async fn test_choke_mid_transfer_requests_reconnect() {
        let fx = fixture(3);
        let (mut session, _handle) = session(&fx, "p1");

        session
            .handle_message(Message::Bitfield {
                bytes: bitfield_bytes(3, &[1]),
            })
            .await
            .unwrap();
        session.handle_message(Message::Unchoke).await.unwrap();
        session
            .handle_message(Message::Block {
                index: 1,
                begin: 0,
                data: fx.blocks[0].clone(),
            })
            .await
            .unwrap();

        let flow = session.handle_message(Message::Choke).await.unwrap();
        assert!(matches!(flow, Flow::Reconnect));
        // Assignment is released at choke time
        assert_eq!(fx.table.assigned_piece("p1"), None);
    }

    #[tokio::test]
    async fn test_choke_without_transfer_stays_open() {
        let fx = fixture(3);
        let (mut session, _handle) = session(&fx, "p1");

        session
            .handle_message(Message::Bitfield {
                bytes: bitfield_bytes(3, &[1]),
            })
            .await
            .unwrap();
        session.handle_message(Message::Unchoke).await.unwrap();

        let flow = session.handle_message(Message::Choke).await.unwrap();
        assert!(matches!(flow, Flow::Continue));
    }

    #[tokio::test]
    async fn test_full_piece_download_writes_storage_and_uninterests() {
        let fx = fixture(3);
        let (mut session, _handle) = session(&fx, "p1");

        session
            .handle_message(Message::Bitfield {
                bytes: bitfield_bytes(3, &[1]),
            })
            .await
            .unwrap();
        session.handle_message(Message::Unchoke).await.unwrap();

        // Blocks arrive out of order: 1, 0, 2, 3
        for block_index in [1u32, 0, 2, 3] {
            session
                .handle_message(Message::Block {
                    index: 1,
                    begin: block_index * BLOCK_SIZE,
                    data: fx.blocks[block_index as usize].clone(),
                })
                .await
                .unwrap();
        }

        // Exactly 4 requests for blocks 0..=3 despite pipelining at 3
        let mut begins: Vec<u32> = requests(&session.wire).iter().map(|r| r.1).collect();
        begins.sort_unstable();
        assert_eq!(
            begins,
            vec![0, BLOCK_SIZE, 2 * BLOCK_SIZE, 3 * BLOCK_SIZE]
        );

        // One storage write with the blocks concatenated in index order
        let written = fx.storage.written.lock();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, 1);
        assert_eq!(written[0].1, fx.blocks.concat());
        drop(written);

        // Terminal not-interested once nothing eligible remains
        assert!(session.wire.sent.contains(&Message::NotInterested));
        assert!(!session.shared.flags().am_interested);
        assert!(fx.table.have_piece(1));
    }

    #[tokio::test]
    async fn test_checksum_failure_bans_contributors() {
        // Digest for piece 1 will not match the delivered data
        let hashes = vec![[0u8; 20]; 3];
        let table = Arc::new(DownloadState::new(hashes, 65536, 3 * 65536, 5));
        let fx = Fixture {
            table,
            storage: Arc::new(MockStorage::default()),
            registry: Arc::new(PeerRegistry::new(10)),
            stats: Arc::new(TransferStats::new()),
            blocks: (1u8..=4).map(|v| vec![v; BLOCK_SIZE as usize]).collect(),
        };
        let (mut session, _handle) = session(&fx, "p1");

        session
            .handle_message(Message::Bitfield {
                bytes: bitfield_bytes(3, &[1]),
            })
            .await
            .unwrap();
        session.handle_message(Message::Unchoke).await.unwrap();

        let mut result = Ok(Flow::Continue);
        for block_index in 0..4u32 {
            result = session
                .handle_message(Message::Block {
                    index: 1,
                    begin: block_index * BLOCK_SIZE,
                    data: fx.blocks[block_index as usize].clone(),
                })
                .await;
        }

        assert!(matches!(result, Err(EngineError::Checksum { .. })));
        assert!(fx.registry.is_banned("p1"));
        // Nothing was persisted
        assert!(fx.storage.written.lock().is_empty());
    }

    #[tokio::test]
    async fn test_request_while_choking_is_violation() {
        let fx = fixture(5);
        let (mut session, _handle) = session(&fx, "p1");

        let err = session
            .handle_message(Message::Request {
                index: 0,
                begin: 0,
                length: BLOCK_SIZE,
            })
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_cancel_suppresses_pending_read() {
        let fx = fixture(5);
        fx.table.resume_from(&{
            let mut have = bitvec![u8, Msb0; 0; 3];
            have.set(0, true);
            have
        });

        // Long delay so the cancel always lands before the read fires
        let (mut session, _handle) = session_with_delay(&fx, "p1", 30);
        session.shared.update(|f| {
            f.am_choking = false;
            f.peer_interested = true;
        });

        session
            .handle_message(Message::Request {
                index: 0,
                begin: 0,
                length: BLOCK_SIZE,
            })
            .await
            .unwrap();
        let token = session
            .pending_reads
            .get(&(0, 0, BLOCK_SIZE))
            .cloned()
            .unwrap();
        assert!(!token.is_cancelled());

        session
            .handle_message(Message::Cancel {
                index: 0,
                begin: 0,
                length: BLOCK_SIZE,
            })
            .await
            .unwrap();
        assert!(token.is_cancelled());
        assert!(session.pending_reads.is_empty());
    }

    #[tokio::test]
    async fn test_serve_block_records_upload_stats() {
        let fx = fixture(5);
        let (mut session, _handle) = session(&fx, "p1");
        fx.stats.register_peer("p1");

        session
            .handle_command(SessionCommand::ServeBlock {
                index: 0,
                begin: 0,
                data: vec![0xAA; 100],
            })
            .await
            .unwrap();

        assert!(matches!(
            session.wire.sent.last(),
            Some(Message::Block { .. })
        ));
        assert_eq!(fx.stats.totals().1, 100);
    }

    #[tokio::test]
    async fn test_choke_directive_sends_once() {
        let fx = fixture(5);
        let (mut session, _handle) = session(&fx, "p1");

        session
            .handle_command(SessionCommand::Unchoke)
            .await
            .unwrap();
        session
            .handle_command(SessionCommand::Unchoke)
            .await
            .unwrap();

        let unchokes = session
            .wire
            .sent
            .iter()
            .filter(|m| **m == Message::Unchoke)
            .count();
        assert_eq!(unchokes, 1);
    }

    #[tokio::test]
    async fn test_registry_admission() {
        let registry = PeerRegistry::new(1);
        let fx = fixture(5);

        let (_s1, h1) = session(&fx, "p1");
        let (_s2, h2) = session(&fx, "p2");
        let (_s3, h3) = session(&fx, "p1");

        assert!(registry.admit("p1", h1));
        // At capacity
        assert!(!registry.admit("p2", h2));
        registry.remove("p1");
        // Banned peers are refused at admission
        registry.ban_peers(&["p1".to_string()]);
        assert!(!registry.admit("p1", h3));
    }

    #[tokio::test]
    async fn test_run_teardown_releases_table_state() {
        let fx = fixture(3);
        let (mut session, handle) = session(&fx, "p1");
        assert!(fx.registry.admit("p1", handle));

        session
            .handle_message(Message::Bitfield {
                bytes: bitfield_bytes(3, &[1]),
            })
            .await
            .unwrap();
        session.handle_message(Message::Unchoke).await.unwrap();
        assert_eq!(fx.table.assigned_piece("p1"), Some(1));
        assert_eq!(fx.table.availability(1), Some(1));

        // Cancel and let run() drive straight into teardown
        fx.registry.shutdown();
        let exit = session.run().await.unwrap();
        assert_eq!(exit, SessionExit::Closed);

        assert_eq!(fx.table.assigned_piece("p1"), None);
        assert_eq!(fx.table.availability(1), Some(0));
        assert!(!fx.registry.contains("p1"));
    }

    #[tokio::test]
    async fn test_delayed_read_fires_after_delay() {
        let fx = fixture(5);
        fx.table.resume_from(&{
            let mut have = bitvec![u8, Msb0; 0; 3];
            have.set(0, true);
            have
        });

        let (mut session, _handle) = session(&fx, "p1");
        session.shared.update(|f| {
            f.am_choking = false;
            f.peer_interested = true;
        });

        session
            .handle_message(Message::Request {
                index: 0,
                begin: 0,
                length: 512,
            })
            .await
            .unwrap();

        // Delay is zero in the fixture; the read task completes into the
        // command channel
        let command = tokio::time::timeout(Duration::from_secs(2), session.cmd_rx.recv())
            .await
            .expect("scheduled read never fired")
            .unwrap();
        match command {
            SessionCommand::ServeBlock { index, begin, data } => {
                assert_eq!((index, begin), (0, 0));
                assert_eq!(data.len(), 512);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
