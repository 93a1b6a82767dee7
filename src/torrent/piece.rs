//! Download State
//!
//! The shared table describing per-piece/per-block progress, the
//! rarest-first selection algorithm that decides what each peer should be
//! asked for next, and SHA-1 verification of completed pieces with
//! per-peer attribution.
//!
//! Every mutating operation takes the single internal lock for its full
//! duration. The critical sections are short and CPU-bound; disk I/O for
//! a verified piece happens outside the lock, between
//! [`DownloadState::write_block`] returning a completed piece and the
//! caller invoking [`DownloadState::mark_verified`].

use std::collections::{HashMap, HashSet};

use bitvec::prelude::*;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};

use super::metainfo::Metainfo;
use super::wire::{Sha1Hash, Wire, BLOCK_SIZE};
use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Peer identifier: the remote address string, unique per connection
pub type PeerId = String;

/// Piece lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// Not downloaded and not assigned to any peer
    Missing,
    /// Assigned to exactly one peer which is fetching its blocks
    Downloading,
    /// All blocks received and digest matched, not yet persisted
    Downloaded,
    /// Persisted to storage; the client bitfield bit is set
    Verified,
}

/// Block lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Missing,
    Requested,
    Received,
}

/// One block request to put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    /// Piece index
    pub piece: u32,
    /// Byte offset within the piece
    pub begin: u32,
    /// Block length in bytes
    pub length: u32,
}

/// Outcome of the next-requests computation for a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPlan {
    /// The peer holds nothing we still need
    NotInterested,
    /// Blocks to request, already marked Requested in the table
    Requests(Vec<BlockRequest>),
}

/// Outcome of accepting a block
#[derive(Debug)]
pub enum BlockWrite {
    /// Block stored; the piece still has outstanding blocks
    Incomplete,
    /// Piece assembled and digest matched. The caller persists the bytes
    /// and then calls `mark_verified`; until then the piece stays
    /// Downloaded and its bitfield bit stays clear.
    Complete(CompletedPiece),
}

/// A fully received, digest-checked piece awaiting persistence
#[derive(Debug)]
pub struct CompletedPiece {
    /// Piece index
    pub index: u32,
    /// Assembled piece bytes, blocks concatenated in index order
    pub data: Vec<u8>,
    /// Every peer that supplied at least one block
    pub contributors: Vec<PeerId>,
}

struct Block {
    state: BlockState,
    data: Option<Vec<u8>>,
}

struct Piece {
    state: PieceState,
    availability: u32,
    blocks: Vec<Block>,
    contributors: HashSet<PeerId>,
}

impl Piece {
    fn release_requested(&mut self) {
        for block in &mut self.blocks {
            if block.state == BlockState::Requested {
                block.state = BlockState::Missing;
            }
        }
        if self.state == PieceState::Downloading {
            self.state = PieceState::Missing;
        }
    }
}

/// Fixed geometry of the piece/block grid, derived once from the metadata
#[derive(Debug, Clone, Copy)]
struct Layout {
    num_pieces: usize,
    piece_length: u64,
    total_length: u64,
}

impl Layout {
    fn piece_length(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.total_length);
        end - start
    }

    fn num_blocks(&self, index: usize) -> usize {
        self.piece_length(index).div_ceil(BLOCK_SIZE as u64) as usize
    }

    fn block_length(&self, piece: usize, block: usize) -> u32 {
        let piece_len = self.piece_length(piece);
        let begin = block as u64 * BLOCK_SIZE as u64;
        (piece_len - begin).min(BLOCK_SIZE as u64) as u32
    }
}

struct TableInner {
    pieces: Vec<Piece>,
    /// peer id -> piece index currently assigned to that peer
    assignments: HashMap<PeerId, usize>,
    /// Bit set iff the piece is Verified
    bitfield: BitVec<u8, Msb0>,
    verified_bytes: u64,
}

/// Snapshot of overall progress
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub total_pieces: usize,
    pub verified_pieces: usize,
    pub verified_bytes: u64,
    pub total_bytes: u64,
}

impl Progress {
    /// Bytes still to download
    pub fn bytes_remaining(&self) -> u64 {
        self.total_bytes.saturating_sub(self.verified_bytes)
    }
}

/// The shared download table: all pieces, all blocks, the peer-to-piece
/// assignment map and the client bitfield, behind one reader/writer lock.
pub struct DownloadState {
    layout: Layout,
    hashes: Vec<Sha1Hash>,
    /// Requests issued on first assignment of a piece; continuation
    /// requests pipeline a single block
    pipeline: usize,
    inner: RwLock<TableInner>,
}

impl DownloadState {
    /// Build the table from raw piece geometry.
    pub fn new(hashes: Vec<Sha1Hash>, piece_length: u64, total_length: u64, pipeline: usize) -> Self {
        let layout = Layout {
            num_pieces: hashes.len(),
            piece_length,
            total_length,
        };

        let pieces = (0..layout.num_pieces)
            .map(|i| Piece {
                state: PieceState::Missing,
                availability: 0,
                blocks: (0..layout.num_blocks(i))
                    .map(|_| Block {
                        state: BlockState::Missing,
                        data: None,
                    })
                    .collect(),
                contributors: HashSet::new(),
            })
            .collect();

        Self {
            layout,
            hashes,
            pipeline,
            inner: RwLock::new(TableInner {
                pieces,
                assignments: HashMap::new(),
                bitfield: bitvec![u8, Msb0; 0; layout.num_pieces],
                verified_bytes: 0,
            }),
        }
    }

    /// Build the table from parsed metainfo.
    pub fn from_metainfo(metainfo: &Metainfo, pipeline: usize) -> Self {
        Self::new(
            metainfo.info.pieces.clone(),
            metainfo.info.piece_length,
            metainfo.info.total_size,
            pipeline,
        )
    }

    /// Seed the table from the on-disk state discovered at startup.
    /// Pieces whose bit is set are marked Verified without re-downloading.
    /// Already-Verified pieces are left untouched, so re-scanning is safe.
    pub fn resume_from(&self, have: &BitVec<u8, Msb0>) {
        let mut inner = self.inner.write();
        for index in 0..self.layout.num_pieces {
            if have.get(index).map(|b| *b).unwrap_or(false)
                && inner.pieces[index].state != PieceState::Verified
            {
                inner.pieces[index].state = PieceState::Verified;
                inner.bitfield.set(index, true);
                inner.verified_bytes += self.layout.piece_length(index);
            }
        }
    }

    /// Number of pieces in the torrent.
    pub fn num_pieces(&self) -> usize {
        self.layout.num_pieces
    }

    /// A peer announced it holds a piece, either via a have message or a
    /// full-bitfield scan at connect time. Out-of-range indices are
    /// ignored.
    pub fn piece_have(&self, index: u32) {
        let index = index as usize;
        if index >= self.layout.num_pieces {
            return;
        }
        let mut inner = self.inner.write();
        inner.pieces[index].availability = inner.pieces[index].availability.saturating_add(1);
    }

    /// Decide which blocks to request next from a peer.
    ///
    /// If the peer already has an assigned piece, a single continuation
    /// block is chosen. Otherwise the rarest eligible piece from the
    /// peer's bitfield is assigned (ties broken by lowest index) and up to
    /// the pipeline depth of its blocks are chosen.
    ///
    /// Chosen blocks transition Missing -> Requested before this returns;
    /// if the caller's subsequent send fails they stay Requested until
    /// peer teardown reclaims them.
    pub fn request_blocks(&self, peer_id: &str, peer_bitfield: &BitVec<u8, Msb0>) -> RequestPlan {
        let mut inner = self.inner.write();

        let (piece_index, quota) = match inner.assignments.get(peer_id) {
            Some(&index) => (index, 1),
            None => {
                let candidate = (0..self.layout.num_pieces)
                    .filter(|&i| {
                        peer_bitfield.get(i).map(|b| *b).unwrap_or(false)
                            && !inner.bitfield[i]
                            && inner.pieces[i].state == PieceState::Missing
                    })
                    .min_by_key(|&i| (inner.pieces[i].availability, i));

                let Some(index) = candidate else {
                    return RequestPlan::NotInterested;
                };

                inner.pieces[index].state = PieceState::Downloading;
                inner.assignments.insert(peer_id.to_string(), index);
                (index, self.pipeline)
            }
        };

        let mut requests = Vec::new();
        let num_blocks = self.layout.num_blocks(piece_index);
        for block_index in 0..num_blocks {
            if requests.len() == quota {
                break;
            }
            let block = &mut inner.pieces[piece_index].blocks[block_index];
            if block.state == BlockState::Missing {
                block.state = BlockState::Requested;
                requests.push(BlockRequest {
                    piece: piece_index as u32,
                    begin: block_index as u32 * BLOCK_SIZE,
                    length: self.layout.block_length(piece_index, block_index),
                });
            }
        }

        RequestPlan::Requests(requests)
    }

    /// Compute the next requests for a peer and put them on the wire.
    ///
    /// A send failure aborts and surfaces to the caller; the session is
    /// expected to terminate, at which point teardown reclaims any blocks
    /// left in Requested.
    pub async fn send_block_requests<W: Wire + ?Sized>(
        &self,
        peer_id: &str,
        wire: &mut W,
        peer_bitfield: &BitVec<u8, Msb0>,
    ) -> Result<()> {
        match self.request_blocks(peer_id, peer_bitfield) {
            RequestPlan::NotInterested => wire.send_not_interested().await,
            RequestPlan::Requests(requests) => {
                for request in requests {
                    wire.send_request(request.piece, request.begin, request.length)
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Accept a block received from a peer.
    ///
    /// Rejected with a protocol error (no state change) when the peer is
    /// not assigned to the piece, the block was not Requested, or the
    /// length is wrong. On a digest mismatch after assembly, the piece is
    /// reset to Missing with all blocks cleared and the error names every
    /// contributing peer so the caller can ban them.
    pub fn write_block(
        &self,
        peer_id: &str,
        piece_index: u32,
        block_index: u32,
        data: Vec<u8>,
    ) -> Result<BlockWrite> {
        let piece_index = piece_index as usize;
        let block_index = block_index as usize;
        let mut inner = self.inner.write();

        match inner.assignments.get(peer_id) {
            Some(&assigned) if assigned == piece_index => {}
            _ => {
                return Err(EngineError::protocol(
                    ProtocolErrorKind::PeerProtocol,
                    format!("Block for piece {} from unassigned peer {}", piece_index, peer_id),
                ));
            }
        }

        let num_blocks = self.layout.num_blocks(piece_index);
        if block_index >= num_blocks {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("Block index {} out of range for piece {}", block_index, piece_index),
            ));
        }

        if inner.pieces[piece_index].blocks[block_index].state != BlockState::Requested {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("Unrequested block {} of piece {}", block_index, piece_index),
            ));
        }

        let expected_len = self.layout.block_length(piece_index, block_index) as usize;
        if data.len() != expected_len {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!(
                    "Wrong block size for piece {} block {}: expected {}, got {}",
                    piece_index,
                    block_index,
                    expected_len,
                    data.len()
                ),
            ));
        }

        {
            let piece = &mut inner.pieces[piece_index];
            piece.blocks[block_index].state = BlockState::Received;
            piece.blocks[block_index].data = Some(data);
            piece.contributors.insert(peer_id.to_string());

            if piece
                .blocks
                .iter()
                .any(|b| b.state != BlockState::Received)
            {
                return Ok(BlockWrite::Incomplete);
            }
        }

        // All blocks received: assemble in index order and verify
        let piece = &mut inner.pieces[piece_index];
        let mut assembled = Vec::with_capacity(self.layout.piece_length(piece_index) as usize);
        for block in &piece.blocks {
            // Every block is Received at this point, so data is present
            if let Some(data) = &block.data {
                assembled.extend_from_slice(data);
            }
        }

        let mut hasher = Sha1::new();
        hasher.update(&assembled);
        let actual: Sha1Hash = hasher.finalize().into();

        let contributors: Vec<PeerId> = piece.contributors.iter().cloned().collect();

        if actual != self.hashes[piece_index] {
            // Any peer that supplied any block of a corrupted piece is
            // untrusted: attribution below whole-piece granularity is not
            // tracked. Reset so other peers can re-download immediately.
            piece.state = PieceState::Missing;
            piece.contributors.clear();
            for block in &mut piece.blocks {
                block.state = BlockState::Missing;
                block.data = None;
            }
            inner.assignments.remove(peer_id);

            return Err(EngineError::Checksum {
                piece: piece_index as u32,
                contributors,
            });
        }

        piece.state = PieceState::Downloaded;
        inner.assignments.remove(peer_id);

        Ok(BlockWrite::Complete(CompletedPiece {
            index: piece_index as u32,
            data: assembled,
            contributors,
        }))
    }

    /// Mark a Downloaded piece as Verified after its bytes were persisted.
    ///
    /// Only at this point does the client bitfield bit get set; a failed
    /// storage write must leave the piece un-Verified.
    pub fn mark_verified(&self, index: u32) -> Result<()> {
        let index = index as usize;
        let mut inner = self.inner.write();

        if index >= self.layout.num_pieces {
            return Err(EngineError::Internal(format!(
                "mark_verified: piece {} out of range",
                index
            )));
        }
        if inner.pieces[index].state != PieceState::Downloaded {
            return Err(EngineError::InvalidState {
                action: "mark piece verified",
                current_state: format!("{:?}", inner.pieces[index].state),
            });
        }

        inner.pieces[index].state = PieceState::Verified;
        inner.pieces[index].contributors.clear();
        // Block payloads are on disk now; drop the in-memory copies
        for block in &mut inner.pieces[index].blocks {
            block.data = None;
        }
        inner.bitfield.set(index, true);
        inner.verified_bytes += self.layout.piece_length(index);

        Ok(())
    }

    /// The peer choked us: release its Requested blocks back to Missing
    /// (Received blocks are retained for a future assignee) and clear the
    /// assignment. Idempotent.
    pub fn peer_choked(&self, peer_id: &str) {
        let mut inner = self.inner.write();
        if let Some(index) = inner.assignments.remove(peer_id) {
            inner.pieces[index].release_requested();
        }
    }

    /// The peer disconnected or was banned: same release as a choke, plus
    /// the availability of every piece its bitfield announced decrements.
    pub fn peer_stopped(&self, peer_id: &str, peer_bitfield: Option<&BitVec<u8, Msb0>>) {
        let mut inner = self.inner.write();

        if let Some(bitfield) = peer_bitfield {
            for index in 0..self.layout.num_pieces.min(bitfield.len()) {
                if bitfield[index] {
                    inner.pieces[index].availability =
                        inner.pieces[index].availability.saturating_sub(1);
                }
            }
        }

        if let Some(index) = inner.assignments.remove(peer_id) {
            inner.pieces[index].release_requested();
        }
    }

    /// Snapshot of the client bitfield (Verified pieces only).
    pub fn bitfield(&self) -> BitVec<u8, Msb0> {
        self.inner.read().bitfield.clone()
    }

    /// True if the piece is Verified.
    pub fn have_piece(&self, index: u32) -> bool {
        self.inner
            .read()
            .bitfield
            .get(index as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    /// Overall progress snapshot.
    pub fn progress(&self) -> Progress {
        let inner = self.inner.read();
        Progress {
            total_pieces: self.layout.num_pieces,
            verified_pieces: inner.bitfield.count_ones(),
            verified_bytes: inner.verified_bytes,
            total_bytes: self.layout.total_length,
        }
    }

    /// True once every piece is Verified.
    pub fn is_complete(&self) -> bool {
        let inner = self.inner.read();
        inner.bitfield.count_ones() == self.layout.num_pieces
    }

    /// Availability count for a piece (tests and diagnostics).
    pub fn availability(&self, index: u32) -> Option<u32> {
        self.inner
            .read()
            .pieces
            .get(index as usize)
            .map(|p| p.availability)
    }

    /// Piece currently assigned to a peer, if any.
    pub fn assigned_piece(&self, peer_id: &str) -> Option<u32> {
        self.inner
            .read()
            .assignments
            .get(peer_id)
            .map(|&i| i as u32)
    }
}
