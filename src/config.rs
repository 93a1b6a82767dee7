//! Engine configuration
//!
//! All tunables for the download engine live here. The defaults are the
//! protocol's conventional values; none of them are derived at runtime.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Main configuration for the download engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory to save downloads
    pub download_dir: PathBuf,

    /// Port range for incoming peer connections
    pub listen_port_range: (u16, u16),

    /// Torrent/swarm behaviour
    pub torrent: TorrentConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            listen_port_range: (6881, 6889),
            torrent: TorrentConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate the configuration, rejecting values the engine cannot
    /// operate with.
    pub fn validate(&self) -> Result<()> {
        if self.listen_port_range.0 > self.listen_port_range.1 {
            return Err(EngineError::Internal(format!(
                "invalid listen port range {}-{}",
                self.listen_port_range.0, self.listen_port_range.1
            )));
        }
        self.torrent.validate()
    }
}

/// Swarm-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentConfig {
    /// Maximum number of connected peers
    pub max_peers: usize,

    /// Maximum outstanding block requests when a peer is first assigned
    /// a piece; continuation requests pipeline one block at a time
    pub max_outstanding_requests: usize,

    /// Interval between unchoke scheduler ticks in seconds
    pub choke_interval_secs: u64,

    /// A peer that has not delivered a block within this many seconds,
    /// while we are interested and it has us unchoked, is snubbed
    pub snubbed_period_secs: u64,

    /// Upload slot count; the top `downloaders - 1` interested peers are
    /// unchoked by rate, plus one optimistic slot
    pub downloaders: usize,

    /// Artificial delay before serving an inbound block request, giving
    /// cancel messages a window to take effect
    pub block_read_delay_secs: u64,

    /// Keep-alive is sent when nothing else has been written for this
    /// long; must stay below the peer timeout or idle connections die
    pub keepalive_interval_secs: u64,

    /// Per-connection I/O timeout in seconds (handshake and steady
    /// state); expiry is fatal for the connection
    pub peer_timeout_secs: u64,

    /// Tracker announce interval override in seconds (0 = honour the
    /// tracker's returned interval)
    pub announce_interval_secs: u64,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            max_peers: 50,
            max_outstanding_requests: 5,
            choke_interval_secs: 10,
            snubbed_period_secs: 60,
            downloaders: 5,
            block_read_delay_secs: 5,
            keepalive_interval_secs: 60,
            peer_timeout_secs: 120,
            announce_interval_secs: 0,
        }
    }
}

impl TorrentConfig {
    /// Validate swarm configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_outstanding_requests == 0 {
            return Err(EngineError::Internal(
                "max_outstanding_requests must be at least 1".to_string(),
            ));
        }
        if self.downloaders < 2 {
            // downloaders - 1 regular slots plus the optimistic slot
            return Err(EngineError::Internal(
                "downloaders must be at least 2".to_string(),
            ));
        }
        if self.keepalive_interval_secs >= self.peer_timeout_secs {
            return Err(EngineError::Internal(
                "keepalive interval must be below the peer timeout".to_string(),
            ));
        }
        Ok(())
    }

    /// Choke scheduler tick interval.
    pub fn choke_interval(&self) -> Duration {
        Duration::from_secs(self.choke_interval_secs)
    }

    /// Snub threshold.
    pub fn snubbed_period(&self) -> Duration {
        Duration::from_secs(self.snubbed_period_secs)
    }

    /// Delay applied before serving an inbound block request.
    pub fn block_read_delay(&self) -> Duration {
        Duration::from_secs(self.block_read_delay_secs)
    }

    /// Keep-alive interval.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Per-connection I/O timeout.
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }
}
