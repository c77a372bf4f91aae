use std::{fmt, ops::Deref, sync::Arc};

use crate::{PieceIndex, BLOCK_LEN};

/// A block is a fixed size chunk of a piece, which in turn is a fixed
/// size chunk of a torrent. Downloading torrents happens at this block
/// level granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
  /// The index of the piece of which this is a block.
  pub piece_index: PieceIndex,
  /// The zero-based byte offset into the piece.
  pub offset: u32,
  /// The block's length in bytes. Always 16 KiB (0x4000 bytes) or less.
  pub len: u32,
}

impl BlockInfo {
  /// Returns the index of the block within its piece, assuming the
  /// default block length of 16 KiB.
  pub fn index_in_piece(&self) -> usize {
    // we need to use "lower than or equal" as this may be the last block
    // in which case it may be shorter than the default block length
    debug_assert!(self.len <= BLOCK_LEN);
    debug_assert!(self.len > 0);
    (self.offset / BLOCK_LEN) as usize
  }

  /// Checks that the block is valid within a piece of the given length:
  /// the offset must be block aligned and the length must reach at most
  /// the piece boundary.
  pub fn is_valid(&self, piece_len: u32) -> bool {
    self.len > 0
      && self.len <= BLOCK_LEN
      && self.offset % BLOCK_LEN == 0
      && self
        .offset
        .checked_add(self.len)
        .map(|end| end <= piece_len)
        .unwrap_or(false)
  }
}

impl fmt::Display for BlockInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "(piece: {} offset: {} len: {})",
      self.piece_index, self.offset, self.len
    )
  }
}

/// Constructs the block info at the given block index of a piece.
pub fn block_info(
  piece_index: PieceIndex,
  piece_len: u32,
  block_index: usize,
) -> BlockInfo {
  BlockInfo {
    piece_index,
    offset: block_index as u32 * BLOCK_LEN,
    len: block_len(piece_len, block_index),
  }
}

/// Returns the length of the block at the index in piece.
///
/// If the piece is not a multiple of the default block length, the
/// returned value is smaller for the last block.
///
/// # Panics
///
/// Panics if the index multiplied by the default block length would
/// exceed the piece length.
pub fn block_len(piece_len: u32, block_index: usize) -> u32 {
  let block_index = block_index as u32;
  let block_offset = block_index * BLOCK_LEN;
  assert!(piece_len > block_offset);
  std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length.
pub fn block_count(piece_len: u32) -> usize {
  // all but the last piece are a multiple of the block length, but the
  // last piece may be shorter so we need to account for this by rounding
  // up before dividing to get the number of blocks in piece
  (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

/// A block with its payload, as exchanged with the disk task and peers.
pub struct Block {
  pub piece_index: PieceIndex,
  pub offset: u32,
  pub data: BlockData,
}

impl Block {
  pub fn info(&self) -> BlockInfo {
    BlockInfo {
      piece_index: self.piece_index,
      offset: self.offset,
      len: self.data.len() as u32,
    }
  }
}

/// Blocks read from disk are cached in memory and shared between the
/// disk task and peer session tasks, so a reference count makes sure a
/// peer still holding a block keeps it valid even after cache eviction.
pub type CachedBlock = Arc<Vec<u8>>;

/// Abstracts over the block data type.
///
/// A block may be just a normal byte buffer, or it may be a reference
/// into the read cache.
#[derive(Debug, PartialEq)]
#[cfg_attr(test, derive(Clone))]
pub enum BlockData {
  Owned(Vec<u8>),
  Cached(CachedBlock),
}

impl BlockData {
  /// Returns the raw block if it's owned.
  ///
  /// # Panics
  ///
  /// This method panics if the block is in the cache.
  pub fn into_owned(self) -> Vec<u8> {
    match self {
      Self::Owned(b) => b,
      _ => panic!("cannot move block out of cache"),
    }
  }
}

impl Deref for BlockData {
  type Target = [u8];
  fn deref(&self) -> &Self::Target {
    match self {
      BlockData::Owned(b) => b.as_ref(),
      BlockData::Cached(b) => b.as_ref(),
    }
  }
}

impl From<Vec<u8>> for BlockData {
  fn from(value: Vec<u8>) -> Self {
    Self::Owned(value)
  }
}

impl From<CachedBlock> for BlockData {
  fn from(value: CachedBlock) -> Self {
    Self::Cached(value)
  }
}
