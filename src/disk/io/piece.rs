use std::{collections::BTreeMap, sync::Mutex};

use sha1::{Digest, Sha1};

use crate::{
  blockinfo::{block_count, CachedBlock},
  error::disk::{ReadError, WriteError},
  storage_info::StorageInfo,
  PieceIndex, Sha1Hash,
};

use super::file::TorrentFile;

/// An in-progress piece download that keeps the blocks received so far
/// in memory together with the piece's expected hash.
pub struct Piece {
  /// The expected hash of the whole piece.
  pub expected_hash: Sha1Hash,
  /// The length of the piece, in bytes.
  pub len: u32,
  /// The blocks downloaded so far. Once the size of the map reaches the
  /// number of blocks in piece, the piece is complete and, if the hash
  /// is correct, saved to disk.
  ///
  /// Blocks are mapped to their offset within piece; the BTreeMap keeps
  /// them sorted by offset, which matters when concatenating them for
  /// hashing and writing.
  pub blocks: BTreeMap<u32, Vec<u8>>,
}

impl Piece {
  /// Places a block into the piece's write buffer if not already there.
  pub fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
    use std::collections::btree_map::Entry;
    let entry = self.blocks.entry(offset);
    if matches!(entry, Entry::Occupied(_)) {
      log::warn!("Duplicate piece block at offset {}", offset);
    } else {
      entry.or_insert(data);
    }
  }

  /// Whether the piece has all its blocks in its write buffer.
  pub fn is_complete(&self) -> bool {
    self.blocks.len() == block_count(self.len)
  }

  /// Concatenates the buffered blocks into the full piece payload.
  ///
  /// # Panics
  ///
  /// Must only be called on a complete piece.
  pub fn assemble(&self) -> Vec<u8> {
    debug_assert!(self.is_complete());
    let mut bytes = Vec::with_capacity(self.len as usize);
    for block in self.blocks.values() {
      bytes.extend_from_slice(block);
    }
    debug_assert_eq!(bytes.len(), self.len as usize);
    bytes
  }

  /// Hashes the assembled piece and compares against the expected hash.
  pub fn matches_hash(piece_bytes: &[u8], expected_hash: &Sha1Hash) -> bool {
    let digest = Sha1::digest(piece_bytes);
    digest.as_slice() == expected_hash
  }
}

/// Writes an assembled piece across the file fragments it overlaps.
///
/// This performs blocking IO and must run on a blocking thread pool, not
/// the async executor.
pub fn write_piece(
  storage: &StorageInfo,
  files: &[Mutex<TorrentFile>],
  index: PieceIndex,
  piece_bytes: &[u8],
) -> Result<(), WriteError> {
  let fragments =
    storage.piece_fragments(index, 0, piece_bytes.len() as u32);
  if fragments.is_empty() {
    return Err(WriteError::InvalidBlockOffset);
  }

  let mut cursor = 0usize;
  for fragment in fragments {
    let end = cursor + fragment.len as usize;
    let mut file = files[fragment.file_index].lock().unwrap();
    file.write_at(fragment.file_offset, &piece_bytes[cursor..end])?;
    cursor = end;
  }
  debug_assert_eq!(cursor, piece_bytes.len());
  Ok(())
}

/// Reads a byte range of a piece from the files it overlaps.
///
/// Ranges past the piece boundary fail with [`ReadError::OutOfRange`].
/// Short files read back as zeros, which recheck relies on.
///
/// Like [`write_piece`], this performs blocking IO.
pub fn read_range(
  storage: &StorageInfo,
  files: &[Mutex<TorrentFile>],
  index: PieceIndex,
  begin: u32,
  len: u32,
) -> Result<Vec<u8>, ReadError> {
  let fragments = storage.piece_fragments(index, begin, len);
  if fragments.is_empty() {
    return Err(ReadError::OutOfRange);
  }

  let mut bytes = vec![0u8; len as usize];
  let mut cursor = 0usize;
  for fragment in fragments {
    let end = cursor + fragment.len as usize;
    let mut file = files[fragment.file_index].lock().unwrap();
    file.read_at(fragment.file_offset, &mut bytes[cursor..end])?;
    cursor = end;
  }
  debug_assert_eq!(cursor, bytes.len());
  Ok(bytes)
}

/// Reads a whole piece and splits it into block sized cache entries.
pub fn read_piece_blocks(
  storage: &StorageInfo,
  files: &[Mutex<TorrentFile>],
  index: PieceIndex,
) -> Result<Vec<CachedBlock>, ReadError> {
  let piece_len = storage.piece_len(index).ok_or(ReadError::OutOfRange)?;
  let bytes = read_range(storage, files, index, 0, piece_len)?;
  let blocks = bytes
    .chunks(crate::BLOCK_LEN as usize)
    .map(|chunk| std::sync::Arc::new(chunk.to_vec()))
    .collect();
  Ok(blocks)
}
