//! # swarm-dl
//!
//! A BitTorrent swarm download engine written in Rust.
//!
//! ## Features
//!
//! - **Rarest-first piece selection**: maximizes swarm piece diversity,
//!   with block-level pipelining per peer
//! - **Per-piece SHA-1 verification**: corrupted pieces are re-downloaded
//!   and every contributing peer is banned
//! - **Choke scheduling**: reciprocity-based unchoking with an optimistic
//!   slot for newcomers and snub detection for unproductive peers
//! - **Partial-failure recovery**: peer disconnects release their
//!   in-flight work back to the swarm; received blocks are never thrown
//!   away
//! - **Async**: built on Tokio, one task per peer connection
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use swarm_dl::{EngineConfig, Metainfo, Torrent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let metainfo = Metainfo::load("example.torrent").await?;
//!
//!     let config = EngineConfig::default();
//!     let torrent = Torrent::from_metainfo(metainfo, config)?;
//!     torrent.start().await?;
//!
//!     while !torrent.is_complete() {
//!         tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!     }
//!
//!     torrent.stop();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod torrent;

// Re-exports for convenience
pub use config::{EngineConfig, TorrentConfig};
pub use error::{
    EngineError, NetworkErrorKind, ProtocolErrorKind, Result, StorageErrorKind,
};
pub use torrent::{
    AnnounceEvent, BlockRequest, BlockWrite, ChokeScheduler, CompletedPiece, Directive,
    DiskState, DownloadState, FileInfo, FileStorage, Info, Message, Metainfo, PeerRegistry,
    PeerSession, PeerView, Progress, RequestPlan, SessionExit, Storage, TcpWire, Torrent,
    TorrentState, TrackerClient, TransferStats, Wire, BLOCK_SIZE,
};
