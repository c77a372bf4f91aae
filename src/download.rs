//! Bookkeeping of an in-progress piece download.
//!
//! A [`PieceDownload`] exists for every piece that has at least one
//! outstanding or received block. It is shared by all sessions working
//! on the piece through the torrent's download map and records, per
//! block, who requested it and who delivered it, the latter for blaming
//! peers when the finished piece fails its hash check.

use std::net::SocketAddr;

use crate::{
  blockinfo::{block_count, block_info, BlockInfo},
  PieceIndex,
};

#[derive(Clone, Debug, Default)]
struct BlockState {
  /// The peers with an outstanding request for this block. Outside
  /// endgame there is at most one.
  requesters: Vec<SocketAddr>,
  /// Whether the block's payload has arrived and was handed to storage.
  received: bool,
  /// The peer whose payload we kept.
  source: Option<SocketAddr>,
}

/// The outcome of registering a received block.
#[derive(Debug, PartialEq)]
pub enum BlockReceipt {
  /// The block was new; CANCELs should go out to the listed peers that
  /// also have it on request (endgame).
  Accepted { cancel_peers: Vec<SocketAddr> },
  /// We already had this block; the payload is waste.
  Duplicate,
  /// The block doesn't belong to this piece.
  Invalid,
}

#[derive(Debug)]
pub struct PieceDownload {
  piece_index: PieceIndex,
  piece_len: u32,
  blocks: Vec<BlockState>,
  received_count: usize,
}

impl PieceDownload {
  pub fn new(piece_index: PieceIndex, piece_len: u32) -> Self {
    Self {
      piece_index,
      piece_len,
      blocks: vec![BlockState::default(); block_count(piece_len)],
      received_count: 0,
    }
  }

  pub fn piece_index(&self) -> PieceIndex {
    self.piece_index
  }

  pub fn piece_len(&self) -> u32 {
    self.piece_len
  }

  pub fn block_count(&self) -> usize {
    self.blocks.len()
  }

  pub fn received_block_count(&self) -> usize {
    self.received_count
  }

  /// The number of blocks that have not arrived yet.
  pub fn missing_block_count(&self) -> usize {
    self.blocks.len() - self.received_count
  }

  /// The number of blocks that are neither received nor requested from
  /// anyone.
  pub fn free_block_count(&self) -> usize {
    self
      .blocks
      .iter()
      .filter(|b| !b.received && b.requesters.is_empty())
      .count()
  }

  pub fn is_complete(&self) -> bool {
    self.received_count == self.blocks.len()
  }

  /// Picks up to `count` blocks for `peer` to request and records the
  /// peer against them.
  ///
  /// Free blocks are preferred. In endgame mode blocks requested from
  /// other peers may be picked as well (never blocks the peer itself
  /// already has on request), so the same block can be in flight from
  /// several peers at once.
  pub fn pick_blocks(
    &mut self,
    count: usize,
    peer: SocketAddr,
    in_endgame: bool,
    picked: &mut Vec<BlockInfo>,
  ) {
    let mut remaining = count;
    // first pass: free blocks only
    for (index, block) in self.blocks.iter_mut().enumerate() {
      if remaining == 0 {
        return;
      }
      if !block.received && block.requesters.is_empty() {
        block.requesters.push(peer);
        picked.push(block_info(self.piece_index, self.piece_len, index));
        remaining -= 1;
      }
    }
    if !in_endgame {
      return;
    }
    // endgame pass: double up on blocks other peers have in flight
    for (index, block) in self.blocks.iter_mut().enumerate() {
      if remaining == 0 {
        return;
      }
      if !block.received && !block.requesters.contains(&peer) {
        block.requesters.push(peer);
        picked.push(block_info(self.piece_index, self.piece_len, index));
        remaining -= 1;
      }
    }
  }

  /// Registers a block that arrived from `peer`.
  pub fn received_block(
    &mut self,
    block: &BlockInfo,
    peer: SocketAddr,
  ) -> BlockReceipt {
    if block.piece_index != self.piece_index
      || !block.is_valid(self.piece_len)
    {
      return BlockReceipt::Invalid;
    }
    let state = &mut self.blocks[block.index_in_piece()];
    if state.received {
      return BlockReceipt::Duplicate;
    }
    state.received = true;
    state.source = Some(peer);
    self.received_count += 1;
    let cancel_peers = state
      .requesters
      .drain(..)
      .filter(|requester| *requester != peer)
      .collect();
    BlockReceipt::Accepted { cancel_peers }
  }

  /// Withdraws a single outstanding request of `peer`, after a request
  /// timeout. The block becomes free again once no peer has it on
  /// request.
  pub fn release_block(&mut self, block: &BlockInfo, peer: SocketAddr) {
    if block.piece_index != self.piece_index
      || !block.is_valid(self.piece_len)
    {
      return;
    }
    let state = &mut self.blocks[block.index_in_piece()];
    state.requesters.retain(|requester| *requester != peer);
  }

  /// Withdraws all outstanding requests of `peer`, after a disconnect,
  /// choke, or snooze. Returns how many were withdrawn.
  pub fn release_all_of(&mut self, peer: SocketAddr) -> usize {
    let mut released = 0;
    for block in self.blocks.iter_mut() {
      let before = block.requesters.len();
      block.requesters.retain(|requester| *requester != peer);
      released += before - block.requesters.len();
    }
    released
  }

  /// The deduplicated peers whose payloads make up the received blocks.
  /// Consulted when the assembled piece fails its hash check.
  pub fn contributors(&self) -> Vec<SocketAddr> {
    let mut contributors = Vec::new();
    for block in self.blocks.iter() {
      if let Some(source) = block.source {
        if !contributors.contains(&source) {
          contributors.push(source);
        }
      }
    }
    contributors
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::BLOCK_LEN;

  fn addr(port: u16) -> SocketAddr {
    SocketAddr::new([127, 0, 0, 1].into(), port)
  }

  #[test]
  fn test_pick_blocks_fills_pipeline() {
    let mut download = PieceDownload::new(3, 4 * BLOCK_LEN);
    let mut picked = Vec::new();
    download.pick_blocks(2, addr(1), false, &mut picked);
    assert_eq!(picked.len(), 2);
    assert_eq!(picked[0].piece_index, 3);
    assert_eq!(picked[0].offset, 0);
    assert_eq!(picked[1].offset, BLOCK_LEN);
    assert_eq!(download.free_block_count(), 2);

    // a second peer gets the remaining blocks, no duplicates
    let mut picked2 = Vec::new();
    download.pick_blocks(10, addr(2), false, &mut picked2);
    assert_eq!(picked2.len(), 2);
    assert_eq!(picked2[0].offset, 2 * BLOCK_LEN);
    assert_eq!(download.free_block_count(), 0);
  }

  #[test]
  fn test_no_duplicate_requests_outside_endgame() {
    let mut download = PieceDownload::new(0, 2 * BLOCK_LEN);
    let mut picked = Vec::new();
    download.pick_blocks(10, addr(1), false, &mut picked);
    assert_eq!(picked.len(), 2);
    // all blocks are on request; nothing to pick outside endgame
    let mut picked2 = Vec::new();
    download.pick_blocks(10, addr(2), false, &mut picked2);
    assert!(picked2.is_empty());
  }

  #[test]
  fn test_endgame_doubles_up_and_cancels() {
    let mut download = PieceDownload::new(0, 2 * BLOCK_LEN);
    let mut picked = Vec::new();
    download.pick_blocks(10, addr(1), false, &mut picked);

    // in endgame another peer may request the same blocks
    let mut picked2 = Vec::new();
    download.pick_blocks(10, addr(2), true, &mut picked2);
    assert_eq!(picked2.len(), 2);
    // but the same peer is never doubled up on one block
    let mut picked3 = Vec::new();
    download.pick_blocks(10, addr(2), true, &mut picked3);
    assert!(picked3.is_empty());

    // first arrival wins and the loser is cancelled
    let receipt = download.received_block(&picked[0], addr(1));
    assert_eq!(
      receipt,
      BlockReceipt::Accepted {
        cancel_peers: vec![addr(2)],
      }
    );
    // the duplicate arrival is waste
    let receipt = download.received_block(&picked[0], addr(2));
    assert_eq!(receipt, BlockReceipt::Duplicate);
  }

  #[test]
  fn test_release_returns_block_to_pool() {
    let mut download = PieceDownload::new(0, 2 * BLOCK_LEN);
    let mut picked = Vec::new();
    download.pick_blocks(1, addr(1), false, &mut picked);
    assert_eq!(download.free_block_count(), 1);
    download.release_block(&picked[0], addr(1));
    assert_eq!(download.free_block_count(), 2);

    // release_all after a disconnect
    let mut picked = Vec::new();
    download.pick_blocks(2, addr(1), false, &mut picked);
    assert_eq!(download.release_all_of(addr(1)), 2);
    assert_eq!(download.free_block_count(), 2);
  }

  #[test]
  fn test_completion_and_contributors() {
    let piece_len = 2 * BLOCK_LEN + 100;
    let mut download = PieceDownload::new(0, piece_len);
    assert_eq!(download.block_count(), 3);

    let mut picked = Vec::new();
    download.pick_blocks(2, addr(1), false, &mut picked);
    download.pick_blocks(1, addr(2), false, &mut picked);
    assert_eq!(picked.len(), 3);

    for (i, block) in picked.iter().enumerate() {
      let from = if i < 2 { addr(1) } else { addr(2) };
      assert!(matches!(
        download.received_block(block, from),
        BlockReceipt::Accepted { .. }
      ));
    }
    assert!(download.is_complete());
    assert_eq!(download.missing_block_count(), 0);
    assert_eq!(download.contributors(), vec![addr(1), addr(2)]);
  }

  #[test]
  fn test_invalid_blocks_rejected() {
    let mut download = PieceDownload::new(1, 2 * BLOCK_LEN);
    // wrong piece
    let foreign = BlockInfo {
      piece_index: 0,
      offset: 0,
      len: BLOCK_LEN,
    };
    assert_eq!(
      download.received_block(&foreign, addr(1)),
      BlockReceipt::Invalid
    );
    // unaligned offset
    let unaligned = BlockInfo {
      piece_index: 1,
      offset: 7,
      len: BLOCK_LEN,
    };
    assert_eq!(
      download.received_block(&unaligned, addr(1)),
      BlockReceipt::Invalid
    );
  }
}
