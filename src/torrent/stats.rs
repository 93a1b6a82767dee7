//! Transfer statistics
//!
//! Per-peer smoothed transfer rates plus the aggregate byte counters the
//! tracker announces consume. Sessions record raw byte counts as blocks
//! flow; the unchoke scheduler reads rates from here and nothing else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use super::piece::PeerId;

/// Number of measurements kept per direction per peer
const RATE_WINDOW: usize = 10;

/// Windowed rate estimator: bytes/sec averaged over the most recent
/// measurements.
#[derive(Debug)]
struct RateEstimator {
    measurements: Vec<(u64, Instant)>,
}

impl RateEstimator {
    fn new() -> Self {
        Self {
            measurements: Vec::with_capacity(RATE_WINDOW),
        }
    }

    fn record(&mut self, bytes: u64) {
        if self.measurements.len() >= RATE_WINDOW {
            self.measurements.remove(0);
        }
        self.measurements.push((bytes, Instant::now()));
    }

    fn rate(&self) -> u64 {
        if self.measurements.len() < 2 {
            return 0;
        }

        let first = self.measurements[0].1;
        let last = self.measurements[self.measurements.len() - 1].1;
        let elapsed = last.duration_since(first).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }

        let bytes: u64 = self.measurements.iter().map(|(b, _)| *b).sum();
        (bytes as f64 / elapsed) as u64
    }
}

#[derive(Debug)]
struct PeerTransfer {
    download: RateEstimator,
    upload: RateEstimator,
}

/// Per-peer rate snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerRates {
    /// Bytes/sec received from the peer
    pub download: u64,
    /// Bytes/sec sent to the peer
    pub upload: u64,
}

/// Shared transfer accounting for one torrent
pub struct TransferStats {
    peers: RwLock<HashMap<PeerId, PeerTransfer>>,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
        }
    }

    /// Start tracking a peer. Idempotent.
    pub fn register_peer(&self, peer_id: &str) {
        self.peers
            .write()
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerTransfer {
                download: RateEstimator::new(),
                upload: RateEstimator::new(),
            });
    }

    /// Stop tracking a peer.
    pub fn remove_peer(&self, peer_id: &str) {
        self.peers.write().remove(peer_id);
    }

    /// Record bytes received from a peer.
    pub fn record_download(&self, peer_id: &str, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        if let Some(transfer) = self.peers.write().get_mut(peer_id) {
            transfer.download.record(bytes);
        }
    }

    /// Record bytes sent to a peer.
    pub fn record_upload(&self, peer_id: &str, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
        if let Some(transfer) = self.peers.write().get_mut(peer_id) {
            transfer.upload.record(bytes);
        }
    }

    /// Smoothed rates for one peer.
    pub fn peer_rates(&self, peer_id: &str) -> PeerRates {
        self.peers
            .read()
            .get(peer_id)
            .map(|t| PeerRates {
                download: t.download.rate(),
                upload: t.upload.rate(),
            })
            .unwrap_or_default()
    }

    /// Smoothed rates for every tracked peer.
    pub fn all_rates(&self) -> HashMap<PeerId, PeerRates> {
        self.peers
            .read()
            .iter()
            .map(|(id, t)| {
                (
                    id.clone(),
                    PeerRates {
                        download: t.download.rate(),
                        upload: t.upload.rate(),
                    },
                )
            })
            .collect()
    }

    /// Lifetime (downloaded, uploaded) byte totals.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.downloaded.load(Ordering::Relaxed),
            self.uploaded.load(Ordering::Relaxed),
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
