//! BitTorrent swarm engine
//!
//! Wires the download table, peer sessions, unchoke scheduler, tracker
//! client and storage into one coordinator per torrent:
//! - the announce loop feeds discovered peers in and reports transfer
//!   counters out,
//! - the connect loop dials known peers and runs one session task per
//!   connection,
//! - the choke loop snapshots sessions and pushes choke/unchoke
//!   directives back to them,
//! - the listener admits inbound connections against the ban set and the
//!   connection limit.

pub mod bencode;
pub mod choking;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod stats;
pub mod storage;
pub mod tracker;
pub mod wire;

pub use choking::{ChokeScheduler, Directive, PeerView};
pub use metainfo::{FileInfo, Info, Metainfo};
pub use peer::{ConnFlags, PeerRegistry, PeerSession, SessionCommand, SessionExit, SessionHandle};
pub use piece::{
    BlockRequest, BlockWrite, CompletedPiece, DownloadState, PeerId, Progress, RequestPlan,
};
pub use stats::{PeerRates, TransferStats};
pub use storage::{DiskState, FileStorage, Storage};
pub use tracker::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient};
pub use wire::{generate_peer_id, Message, Sha1Hash, TcpWire, Wire, BLOCK_SIZE};

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// Interval between peer connection attempts
const CONNECT_INTERVAL: Duration = Duration::from_secs(2);

/// New outbound dials attempted per connect round
const MAX_CONNECT_PER_ROUND: usize = 5;

/// Fallback announce cadence when a tracker gives none
const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

/// Lifecycle state of a torrent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    /// Waiting for the metadata descriptor (magnet-style bootstrap)
    AwaitingMetadata,
    /// Verifying existing files on disk
    Checking,
    /// Downloading pieces
    Downloading,
    /// Complete; uploading only
    Seeding,
    /// Stopped
    Stopped,
}

/// Everything that only exists once the metadata descriptor is known
struct TorrentContent {
    metainfo: Arc<Metainfo>,
    table: Arc<DownloadState>,
    storage: Arc<dyn Storage>,
}

/// Coordinator for a single torrent swarm
pub struct Torrent {
    info_hash: Sha1Hash,
    peer_id: [u8; 20],
    config: EngineConfig,
    content: RwLock<Option<Arc<TorrentContent>>>,
    trackers: RwLock<Vec<String>>,
    known_peers: RwLock<HashSet<SocketAddr>>,
    registry: Arc<PeerRegistry>,
    stats: Arc<TransferStats>,
    tracker: TrackerClient,
    scheduler: ChokeScheduler,
    state: RwLock<TorrentState>,
    completed_announced: AtomicBool,
    shutdown: CancellationToken,
}

impl Torrent {
    /// Create a torrent from a parsed .torrent descriptor.
    pub fn from_metainfo(metainfo: Metainfo, config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let torrent = Self::empty(metainfo.info_hash, metainfo.all_trackers(), config)?;
        torrent.install_content(metainfo)?;
        Ok(torrent)
    }

    /// Create a torrent that is still waiting for its metadata descriptor
    /// (magnet-style bootstrap). Piece selection cannot begin until
    /// [`Torrent::set_metainfo`] delivers the descriptor.
    pub fn awaiting_metadata(
        info_hash: Sha1Hash,
        trackers: Vec<String>,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Self::empty(info_hash, trackers, config)
    }

    fn empty(
        info_hash: Sha1Hash,
        trackers: Vec<String>,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        let scheduler = ChokeScheduler::new(
            config.torrent.downloaders,
            config.torrent.snubbed_period(),
        );

        Ok(Arc::new(Self {
            info_hash,
            peer_id: generate_peer_id(),
            registry: Arc::new(PeerRegistry::new(config.torrent.max_peers)),
            stats: Arc::new(TransferStats::new()),
            tracker: TrackerClient::new()?,
            scheduler,
            config,
            content: RwLock::new(None),
            trackers: RwLock::new(trackers),
            known_peers: RwLock::new(HashSet::new()),
            state: RwLock::new(TorrentState::AwaitingMetadata),
            completed_announced: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Deliver the metadata descriptor for a torrent created with
    /// [`Torrent::awaiting_metadata`], then verify existing data so piece
    /// selection can begin.
    pub async fn set_metainfo(&self, metainfo: Metainfo) -> Result<()> {
        if metainfo.info_hash != self.info_hash {
            return Err(EngineError::protocol(
                crate::error::ProtocolErrorKind::InvalidTorrent,
                "Metadata descriptor does not match the torrent's info hash",
            ));
        }
        let mut trackers = self.trackers.write();
        for url in metainfo.all_trackers() {
            if !trackers.contains(&url) {
                trackers.push(url);
            }
        }
        drop(trackers);

        self.install_content(metainfo)?;
        if let Some(content) = self.content() {
            self.check_existing(&content).await?;
        }
        Ok(())
    }

    fn install_content(&self, metainfo: Metainfo) -> Result<()> {
        let mut content = self.content.write();
        if content.is_some() {
            return Err(EngineError::InvalidState {
                action: "install metadata",
                current_state: "metadata already present".to_string(),
            });
        }

        let metainfo = Arc::new(metainfo);
        let table = Arc::new(DownloadState::from_metainfo(
            &metainfo,
            self.config.torrent.max_outstanding_requests,
        ));
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(
            Arc::clone(&metainfo),
            self.config.download_dir.clone(),
        ));

        *content = Some(Arc::new(TorrentContent {
            metainfo,
            table,
            storage,
        }));
        *self.state.write() = TorrentState::Checking;
        Ok(())
    }

    fn content(&self) -> Option<Arc<TorrentContent>> {
        self.content.read().clone()
    }

    /// The torrent's info hash.
    pub fn info_hash(&self) -> &Sha1Hash {
        &self.info_hash
    }

    /// Info hash as lowercase hex.
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Torrent name from the descriptor, or the info hash before the
    /// descriptor is known.
    pub fn name(&self) -> String {
        match self.content() {
            Some(content) => content.metainfo.info.name.clone(),
            None => self.info_hash_hex(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TorrentState {
        *self.state.read()
    }

    /// Download progress, once the descriptor is known.
    pub fn progress(&self) -> Option<Progress> {
        self.content().map(|c| c.table.progress())
    }

    /// Number of live peer sessions.
    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// True once every piece is verified.
    pub fn is_complete(&self) -> bool {
        self.content().map(|c| c.table.is_complete()).unwrap_or(false)
    }

    /// Feed discovered peer addresses in (tracker, tests, or any external
    /// discovery source).
    pub fn add_known_peers(&self, peers: impl IntoIterator<Item = SocketAddr>) {
        let mut known = self.known_peers.write();
        for peer in peers {
            known.insert(peer);
        }
    }

    /// Start the torrent: verify existing data, then spawn the announce,
    /// connect, choke and listener loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if let Some(content) = self.content() {
            self.check_existing(&content).await?;
        }

        let torrent = Arc::clone(self);
        tokio::spawn(async move { torrent.run_announce_loop().await });

        let torrent = Arc::clone(self);
        tokio::spawn(async move { torrent.run_connect_loop().await });

        let torrent = Arc::clone(self);
        tokio::spawn(async move { torrent.run_choke_loop().await });

        let torrent = Arc::clone(self);
        tokio::spawn(async move { torrent.run_listener().await });

        Ok(())
    }

    /// Stop the torrent: the announce loop fires a final Stopped announce
    /// on its way out, and every session is cancelled.
    pub fn stop(&self) {
        *self.state.write() = TorrentState::Stopped;
        self.shutdown.cancel();
        self.registry.shutdown();
    }

    /// Seed the table from what is already on disk.
    async fn check_existing(&self, content: &TorrentContent) -> Result<()> {
        *self.state.write() = TorrentState::Checking;

        let disk = content.storage.current_state().await?;
        content.table.resume_from(&disk.have);

        tracing::info!(
            "Verified {} existing pieces for {}",
            disk.have.count_ones(),
            self.info_hash_hex()
        );

        *self.state.write() = if disk.completed {
            TorrentState::Seeding
        } else {
            TorrentState::Downloading
        };
        Ok(())
    }

    /// Announce loop: periodic announces at the tracker's cadence, with a
    /// Completed event once and a final Stopped event at shutdown.
    async fn run_announce_loop(self: Arc<Self>) {
        let mut event = AnnounceEvent::Started;

        loop {
            let event_to_send = if event == AnnounceEvent::Started {
                event = AnnounceEvent::None;
                AnnounceEvent::Started
            } else if self.is_complete()
                && !self.completed_announced.swap(true, Ordering::SeqCst)
            {
                AnnounceEvent::Completed
            } else {
                AnnounceEvent::None
            };

            let interval = self.announce_all(event_to_send).await;

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = self.announce_all(AnnounceEvent::Stopped).await;
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Announce to every known tracker; returns the interval to wait
    /// before the next round.
    async fn announce_all(&self, event: AnnounceEvent) -> Duration {
        let trackers = self.trackers.read().clone();
        if trackers.is_empty() {
            return DEFAULT_ANNOUNCE_INTERVAL;
        }

        let (downloaded, uploaded) = self.stats.totals();
        // Before the descriptor arrives the remaining size is unknown;
        // report non-zero so trackers list us as a leecher
        let left = self.progress().map(|p| p.bytes_remaining()).unwrap_or(1);

        let request = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.config.listen_port_range.0,
            uploaded,
            downloaded,
            left,
            event,
            numwant: self.config.torrent.max_peers as u32,
        };

        let mut next_interval = DEFAULT_ANNOUNCE_INTERVAL;

        for tracker_url in trackers {
            match self.tracker.announce(&tracker_url, &request).await {
                Ok(response) => {
                    tracing::info!(
                        "Announced to {}: {} peers, interval {}s",
                        tracker_url,
                        response.peers.len(),
                        response.interval
                    );
                    self.add_known_peers(response.peers);
                    next_interval = next_interval.min(Duration::from_secs(response.interval as u64));
                }
                Err(err) => {
                    tracing::warn!("Announce to {} failed: {}", tracker_url, err);
                }
            }
        }

        if self.config.torrent.announce_interval_secs > 0 {
            next_interval = Duration::from_secs(self.config.torrent.announce_interval_secs);
        }
        next_interval
    }

    /// Connect loop: dial known peers we are not yet connected to.
    async fn run_connect_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(CONNECT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            // Sessions need the descriptor; hold off until it arrives
            if self.content().is_none() {
                continue;
            }
            if self.registry.len() >= self.config.torrent.max_peers {
                continue;
            }

            let candidates: Vec<SocketAddr> = {
                let known = self.known_peers.read();
                known
                    .iter()
                    .filter(|addr| {
                        let key = addr.to_string();
                        !self.registry.contains(&key) && !self.registry.is_banned(&key)
                    })
                    .take(MAX_CONNECT_PER_ROUND)
                    .copied()
                    .collect()
            };

            for addr in candidates {
                let torrent = Arc::clone(&self);
                tokio::spawn(async move { torrent.run_peer(addr, None).await });
            }
        }
    }

    /// Run one peer connection to completion, redialing once per
    /// mid-transfer choke. `inbound` carries an already-accepted stream
    /// for the first round.
    async fn run_peer(self: Arc<Self>, addr: SocketAddr, inbound: Option<tokio::net::TcpStream>) {
        let peer_key = addr.to_string();
        let mut inbound = inbound;

        loop {
            if self.shutdown.is_cancelled() || self.registry.is_banned(&peer_key) {
                return;
            }
            let Some(content) = self.content() else { return };

            let io_timeout = self.config.torrent.peer_timeout();
            let connected = match inbound.take() {
                Some(stream) => {
                    TcpWire::accept(stream, addr, self.info_hash, self.peer_id, io_timeout).await
                }
                None => TcpWire::connect(addr, self.info_hash, self.peer_id, io_timeout).await,
            };

            let (wire, _remote_peer_id) = match connected {
                Ok(ok) => ok,
                Err(err) => {
                    tracing::debug!("Handshake with {} failed: {}", addr, err);
                    return;
                }
            };

            let (session, handle) = PeerSession::new(
                peer_key.clone(),
                wire,
                Arc::clone(&content.table),
                Arc::clone(&content.storage),
                Arc::clone(&self.registry),
                Arc::clone(&self.stats),
                self.config.torrent.clone(),
            );

            if !self.registry.admit(&peer_key, handle) {
                return;
            }
            tracing::info!("Connected to peer {}", addr);

            match session.run().await {
                Ok(SessionExit::Reconnect) => {
                    tracing::debug!("Redialing {}", addr);
                    continue;
                }
                Ok(SessionExit::Closed) => return,
                Err(err) => {
                    tracing::debug!("Session with {} ended: {}", addr, err);
                    return;
                }
            }
        }
    }

    /// Choke loop: one scheduler round per interval.
    async fn run_choke_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.torrent.choke_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }
            self.run_choke_tick();
        }
    }

    fn run_choke_tick(&self) {
        self.refresh_completion();

        let session_views = self.registry.session_views();
        if session_views.is_empty() {
            return;
        }

        let rates = self.stats.all_rates();
        let seeding = *self.state.read() == TorrentState::Seeding;

        let views: Vec<PeerView> = session_views
            .into_iter()
            .map(|(peer_id, flags, last_block_at)| {
                let peer_rates = rates.get(&peer_id).copied().unwrap_or_default();
                PeerView {
                    // Rate in the direction we receive value from the peer
                    rate: if seeding {
                        peer_rates.upload
                    } else {
                        peer_rates.download
                    },
                    peer_interested: flags.peer_interested,
                    am_interested: flags.am_interested,
                    peer_choking: flags.peer_choking,
                    am_choking: flags.am_choking,
                    last_block_at,
                    peer_id,
                }
            })
            .collect();

        let directives = self.scheduler.recalculate(&views);
        if !directives.is_empty() {
            tracing::debug!("Choke round: {} directives", directives.len());
            self.registry.apply_directives(directives);
        }
    }

    /// Flip Downloading -> Seeding once every piece is verified.
    fn refresh_completion(&self) {
        if !self.is_complete() {
            return;
        }
        let mut state = self.state.write();
        if *state == TorrentState::Downloading {
            *state = TorrentState::Seeding;
            tracing::info!("Download complete for {}", self.name());
        }
    }

    /// Inbound listener: first free port in the configured range.
    async fn run_listener(self: Arc<Self>) {
        let (low, high) = self.config.listen_port_range;
        let mut listener = None;
        for port in low..=high {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(bound) => {
                    tracing::info!("Listening for peers on port {}", port);
                    listener = Some(bound);
                    break;
                }
                Err(_) => continue,
            }
        }
        let Some(listener) = listener else {
            tracing::warn!("No listen port free in {}..={}", low, high);
            return;
        };

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let peer_key = addr.to_string();
                    if self.registry.is_banned(&peer_key)
                        || self.registry.len() >= self.config.torrent.max_peers
                    {
                        continue;
                    }
                    let torrent = Arc::clone(&self);
                    tokio::spawn(async move { torrent.run_peer(addr, Some(stream)).await });
                }
                Err(err) => {
                    tracing::warn!("Accept failed: {}", err);
                }
            }
        }
    }
}
