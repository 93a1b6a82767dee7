//! Download-state scenarios driven through the wire-facing API.
//!
//! These exercise the selector, verifier and table together the way a
//! peer session does: a mock wire records every outbound call so the
//! request pattern can be asserted exactly.

use async_trait::async_trait;
use bitvec::prelude::*;
use sha1::{Digest, Sha1};
use swarm_dl::{BlockWrite, DownloadState, Result, Wire, BLOCK_SIZE};

/// Outbound calls a session would put on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
    Request { index: u32, begin: u32, length: u32 },
    NotInterested,
}

#[derive(Default)]
struct RecordingWire {
    sent: Vec<Sent>,
}

#[async_trait]
impl Wire for RecordingWire {
    async fn send_keep_alive(&mut self) -> Result<()> {
        Ok(())
    }
    async fn send_choke(&mut self) -> Result<()> {
        Ok(())
    }
    async fn send_unchoke(&mut self) -> Result<()> {
        Ok(())
    }
    async fn send_interested(&mut self) -> Result<()> {
        Ok(())
    }
    async fn send_not_interested(&mut self) -> Result<()> {
        self.sent.push(Sent::NotInterested);
        Ok(())
    }
    async fn send_have(&mut self, _index: u32) -> Result<()> {
        Ok(())
    }
    async fn send_bitfield(&mut self, _bitfield: &BitVec<u8, Msb0>) -> Result<()> {
        Ok(())
    }
    async fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        self.sent.push(Sent::Request {
            index,
            begin,
            length,
        });
        Ok(())
    }
    async fn send_block(&mut self, _index: u32, _begin: u32, _data: Vec<u8>) -> Result<()> {
        Ok(())
    }
    async fn send_cancel(&mut self, _index: u32, _begin: u32, _length: u32) -> Result<()> {
        Ok(())
    }
    async fn read_message(&mut self) -> Result<swarm_dl::Message> {
        unreachable!("scenario tests never read")
    }
}

fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn four_blocks() -> Vec<Vec<u8>> {
    (1u8..=4).map(|v| vec![v; BLOCK_SIZE as usize]).collect()
}

/// Three 64 KiB pieces; piece 1's digest matches the four test blocks.
fn table_for_piece1(blocks: &[Vec<u8>], pipeline: usize) -> DownloadState {
    let hashes = vec![[0u8; 20], sha1(&blocks.concat()), [0u8; 20]];
    DownloadState::new(hashes, 65536, 3 * 65536, pipeline)
}

fn bitfield(num_pieces: usize, have: &[usize]) -> BitVec<u8, Msb0> {
    let mut bits = bitvec![u8, Msb0; 0; num_pieces];
    for &i in have {
        bits.set(i, true);
    }
    bits
}

fn requests(wire: &RecordingWire) -> Vec<(u32, u32, u32)> {
    wire.sent
        .iter()
        .filter_map(|s| match s {
            Sent::Request {
                index,
                begin,
                length,
            } => Some((*index, *begin, *length)),
            Sent::NotInterested => None,
        })
        .collect()
}

/// Canonical flow: a 4-block piece delivered out of order (1, 0, 2, 3)
/// with a pipeline of 3 produces exactly four requests for blocks 0..=3,
/// one storage-sized assembly in index order, and a terminal
/// not-interested once nothing eligible remains.
#[tokio::test]
async fn piece_completed_out_of_order() {
    let blocks = four_blocks();
    let table = table_for_piece1(&blocks, 3);
    let mut wire = RecordingWire::default();
    let peer = "0.0.0.0:6881";
    let bits = bitfield(3, &[1]);

    // Peer unchokes us
    table.send_block_requests(peer, &mut wire, &bits).await.unwrap();

    let mut completed = None;
    for block_index in [1u32, 0, 2, 3] {
        let outcome = table
            .write_block(peer, 1, block_index, blocks[block_index as usize].clone())
            .unwrap();
        if let BlockWrite::Complete(piece) = outcome {
            completed = Some(piece);
        }
        table.send_block_requests(peer, &mut wire, &bits).await.unwrap();
    }

    // Exactly four requests for the four blocks, every length BLOCK_SIZE
    let sent = requests(&wire);
    assert_eq!(sent.len(), 4);
    let mut begins: Vec<u32> = sent.iter().map(|r| r.1).collect();
    begins.sort_unstable();
    assert_eq!(
        begins,
        vec![0, BLOCK_SIZE, 2 * BLOCK_SIZE, 3 * BLOCK_SIZE]
    );
    assert!(sent.iter().all(|r| r.0 == 1 && r.2 == BLOCK_SIZE));

    // One completion carrying the blocks concatenated in index order
    let piece = completed.expect("piece never completed");
    assert_eq!(piece.index, 1);
    assert_eq!(piece.data, blocks.concat());
    assert_eq!(piece.contributors, vec![peer.to_string()]);

    // The final send_block_requests emitted the terminal not-interested
    assert_eq!(wire.sent.last(), Some(&Sent::NotInterested));
    assert_eq!(
        wire.sent
            .iter()
            .filter(|s| **s == Sent::NotInterested)
            .count(),
        1
    );
}

/// Peer A is choked after delivering one block; its requested blocks
/// revert while the received one is kept, and peer B only ever requests
/// the blocks A did not deliver.
#[tokio::test]
async fn choked_peer_work_is_reassigned() {
    let blocks = four_blocks();
    let table = table_for_piece1(&blocks, 2);
    let bits = bitfield(3, &[1]);

    let mut wire_a = RecordingWire::default();
    let mut wire_b = RecordingWire::default();

    // Peer A requests blocks 0 and 1, delivers 1, requests 2, then chokes
    table.send_block_requests("a", &mut wire_a, &bits).await.unwrap();
    table.write_block("a", 1, 1, blocks[1].clone()).unwrap();
    table.send_block_requests("a", &mut wire_a, &bits).await.unwrap();
    table.peer_choked("a");

    assert_eq!(
        requests(&wire_a),
        vec![
            (1, 0, BLOCK_SIZE),
            (1, BLOCK_SIZE, BLOCK_SIZE),
            (1, 2 * BLOCK_SIZE, BLOCK_SIZE),
        ]
    );

    // Peer B picks the piece up; block 1 must never be re-requested
    table.send_block_requests("b", &mut wire_b, &bits).await.unwrap();
    table.write_block("b", 1, 0, blocks[0].clone()).unwrap();
    table.send_block_requests("b", &mut wire_b, &bits).await.unwrap();
    table.write_block("b", 1, 2, blocks[2].clone()).unwrap();
    table.send_block_requests("b", &mut wire_b, &bits).await.unwrap();

    let outcome = table.write_block("b", 1, 3, blocks[3].clone()).unwrap();
    let piece = match outcome {
        BlockWrite::Complete(piece) => piece,
        other => panic!("expected completion, got {:?}", other),
    };

    let begins: Vec<u32> = requests(&wire_b).iter().map(|r| r.1).collect();
    assert_eq!(begins, vec![0, 2 * BLOCK_SIZE, 3 * BLOCK_SIZE]);

    // Both peers contributed to the finished piece
    let mut contributors = piece.contributors.clone();
    contributors.sort();
    assert_eq!(contributors, vec!["a".to_string(), "b".to_string()]);
}

/// The rarest eligible piece wins selection for every peer, so two peers
/// with identical bitfields end up on different pieces.
#[tokio::test]
async fn two_peers_never_share_a_piece() {
    let table = DownloadState::new(vec![[0u8; 20]; 4], 65536, 4 * 65536, 5);
    let bits = bitfield(4, &[0, 1, 2, 3]);

    // Piece 3 is rare, piece 2 next
    for index in [0u32, 1] {
        for _ in 0..3 {
            table.piece_have(index);
        }
    }
    table.piece_have(2);
    table.piece_have(2);
    table.piece_have(3);

    let mut wire_a = RecordingWire::default();
    let mut wire_b = RecordingWire::default();

    table.send_block_requests("a", &mut wire_a, &bits).await.unwrap();
    table.send_block_requests("b", &mut wire_b, &bits).await.unwrap();

    let piece_a = requests(&wire_a)[0].0;
    let piece_b = requests(&wire_b)[0].0;

    assert_eq!(piece_a, 3, "first peer takes the rarest piece");
    assert_eq!(piece_b, 2, "second peer takes the next rarest");
    assert_ne!(piece_a, piece_b);
}

/// A send failure surfaces to the caller and leaves the marked blocks to
/// be reclaimed by teardown, not rolled back inline.
#[tokio::test]
async fn send_failure_surfaces_and_teardown_reclaims() {
    struct FailingWire;

    #[async_trait]
    impl Wire for FailingWire {
        async fn send_keep_alive(&mut self) -> Result<()> {
            Ok(())
        }
        async fn send_choke(&mut self) -> Result<()> {
            Ok(())
        }
        async fn send_unchoke(&mut self) -> Result<()> {
            Ok(())
        }
        async fn send_interested(&mut self) -> Result<()> {
            Ok(())
        }
        async fn send_not_interested(&mut self) -> Result<()> {
            Ok(())
        }
        async fn send_have(&mut self, _index: u32) -> Result<()> {
            Ok(())
        }
        async fn send_bitfield(&mut self, _bitfield: &BitVec<u8, Msb0>) -> Result<()> {
            Ok(())
        }
        async fn send_request(&mut self, _index: u32, _begin: u32, _length: u32) -> Result<()> {
            Err(swarm_dl::EngineError::network(
                swarm_dl::NetworkErrorKind::ConnectionReset,
                "peer went away",
            ))
        }
        async fn send_block(&mut self, _index: u32, _begin: u32, _data: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn send_cancel(&mut self, _index: u32, _begin: u32, _length: u32) -> Result<()> {
            Ok(())
        }
        async fn read_message(&mut self) -> Result<swarm_dl::Message> {
            unreachable!()
        }
    }

    let blocks = four_blocks();
    let table = table_for_piece1(&blocks, 3);
    let bits = bitfield(3, &[1]);

    let err = table
        .send_block_requests("a", &mut FailingWire, &bits)
        .await
        .unwrap_err();
    assert!(matches!(err, swarm_dl::EngineError::Network { .. }));

    // Teardown releases the assignment and the piece becomes selectable
    table.peer_stopped("a", None);
    let mut wire_b = RecordingWire::default();
    table.send_block_requests("b", &mut wire_b, &bits).await.unwrap();
    assert_eq!(requests(&wire_b).len(), 3);
}
