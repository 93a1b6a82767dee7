//! Choke algorithm
//!
//! Periodically partitions connected peers and decides which may download
//! from us, balancing reciprocity against fairness to newcomers:
//! - the fastest `downloaders - 1` interested peers keep their unchoke
//!   (so they keep us as one of their active downloaders),
//! - faster not-interested peers are unchoked in anticipation (if they
//!   become interested they are likely to reciprocate),
//! - one randomly chosen remaining interested peer gets the optimistic
//!   slot so new and slow peers periodically get a chance to prove
//!   themselves.

use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;

use super::piece::PeerId;

/// Per-peer snapshot the scheduler works from. Rates come from the stats
/// collector; flags and the last-block timestamp come from the session.
#[derive(Debug, Clone)]
pub struct PeerView {
    /// Peer identifier (address string)
    pub peer_id: PeerId,
    /// Transfer rate in the direction the client receives value:
    /// download rate while leeching, upload rate while seeding
    pub rate: u64,
    /// Peer wants to download from us
    pub peer_interested: bool,
    /// We want to download from the peer
    pub am_interested: bool,
    /// Peer is choking us
    pub peer_choking: bool,
    /// We are choking the peer
    pub am_choking: bool,
    /// When the peer last delivered a block (session start if never)
    pub last_block_at: Instant,
}

/// Choke/unchoke directive for a single peer. Only emitted when the
/// peer's current flag differs from the target, so applying a directive
/// never produces redundant protocol traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Unchoke(PeerId),
    Choke(PeerId),
}

/// The unchoke scheduler. Stateless between ticks apart from its
/// configuration; the timer driving it lives in the torrent coordinator.
pub struct ChokeScheduler {
    /// Upload slots: `downloaders - 1` regular plus one optimistic
    downloaders: usize,
    /// Unchoked-and-wanted peers that deliver nothing for this long are
    /// treated as unproductive
    snubbed_period: Duration,
}

impl ChokeScheduler {
    pub fn new(downloaders: usize, snubbed_period: Duration) -> Self {
        Self {
            downloaders,
            snubbed_period,
        }
    }

    /// Run one scheduling round over the given peer snapshots.
    pub fn recalculate(&self, views: &[PeerView]) -> Vec<Directive> {
        self.recalculate_with_rng(views, &mut rand::thread_rng())
    }

    /// Deterministic variant for tests: the optimistic pick draws from the
    /// supplied RNG.
    pub fn recalculate_with_rng<R: Rng>(&self, views: &[PeerView], rng: &mut R) -> Vec<Directive> {
        // Partition into productive interested peers and everyone else
        let mut interested: Vec<&PeerView> = Vec::new();
        let mut not_interested: Vec<&PeerView> = Vec::new();

        for view in views {
            let snubbed = view.am_interested
                && !view.peer_choking
                && view.last_block_at.elapsed() > self.snubbed_period;

            if view.peer_interested && !snubbed {
                interested.push(view);
            } else {
                not_interested.push(view);
            }
        }

        // Stable descending sort: ties keep insertion order
        interested.sort_by(|a, b| b.rate.cmp(&a.rate));
        not_interested.sort_by(|a, b| b.rate.cmp(&a.rate));

        let regular_slots = self.downloaders - 1;
        let mut unchoke: Vec<&PeerId> = Vec::new();

        let mut speed_threshold = 0u64;
        for view in interested.iter().take(regular_slots) {
            unchoke.push(&view.peer_id);
            speed_threshold = view.rate;
        }

        // Anticipatory reciprocity for fast peers that want nothing yet
        for view in &not_interested {
            if view.rate <= speed_threshold {
                break;
            }
            unchoke.push(&view.peer_id);
        }

        // Optimistic slot: one uniformly random peer from the interested
        // remainder
        if interested.len() > regular_slots {
            if let Some(view) = interested[regular_slots..].choose(rng) {
                unchoke.push(&view.peer_id);
            }
        }

        let mut directives = Vec::new();
        for view in views {
            let should_unchoke = unchoke.iter().any(|id| **id == view.peer_id);
            if should_unchoke && view.am_choking {
                directives.push(Directive::Unchoke(view.peer_id.clone()));
            } else if !should_unchoke && !view.am_choking {
                directives.push(Directive::Choke(view.peer_id.clone()));
            }
        }

        directives
    }
}
