use std::{
  collections::{BTreeMap, HashMap},
  num::NonZeroUsize,
  sync::{Arc, Mutex},
};

use lru::LruCache;
use tokio::task;

use crate::{
  bitfield,
  blockinfo::{Block, BlockInfo},
  error::disk::{NewTorrentError, ReadError},
  storage_info::{StorageInfo, MAX_PIECE_LEN},
  torrent::{self, PieceCompletion},
  PieceIndex, Sha1Hash,
};

use super::{
  file::TorrentFile,
  piece::{self, Piece},
};

/// Pieces kept in the read cache per torrent. Uploads to a handful of
/// peers re-read the same hot pieces, so even a small cache absorbs most
/// of the seek traffic.
const READ_CACHE_PIECES: usize = 16;

/// How many pieces are hashed between recheck progress reports.
const RECHECK_PROGRESS_STEP: usize = 64;

/// The disk task's view of a torrent.
///
/// Holds the in-progress piece write buffer, the open file handles, and
/// the read cache.
pub struct Torrent {
  /// The in-progress piece downloads, the torrent's write buffer. Each
  /// piece is mapped to its index for fast lookups.
  write_buf: HashMap<PieceIndex, Piece>,

  /// Completed pieces recently read for uploads, split into blocks.
  read_cache: LruCache<PieceIndex, Vec<crate::blockinfo::CachedBlock>>,

  /// The fields that blocking IO worker threads need, in a single arc
  /// so spawning a worker costs one reference bump.
  ctx: Arc<ThreadContext>,
}

/// Fields shared with the blocking IO workers of this torrent.
pub struct ThreadContext {
  pub storage: StorageInfo,
  /// The open file handles, in torrent file order. Each file is behind
  /// its own lock so writes to one file serialize while other files
  /// proceed.
  pub files: Vec<Mutex<TorrentFile>>,
  /// The concatenation of all expected piece hashes.
  pub piece_hashes: Vec<u8>,
  /// The channel on which IO results are posted back to the torrent.
  pub torrent_tx: torrent::Sender,
}

impl ThreadContext {
  fn expected_hash(&self, index: PieceIndex) -> Option<Sha1Hash> {
    let bytes = self.piece_hashes.get(index * 20..index * 20 + 20)?;
    let mut hash = [0; 20];
    hash.copy_from_slice(bytes);
    Some(hash)
  }
}

impl Torrent {
  /// Allocates the torrent on disk: validates the piece size, creates
  /// the download directory, and opens (creating if absent) all its
  /// files.
  pub fn new(
    storage: StorageInfo,
    piece_hashes: Vec<u8>,
    torrent_tx: torrent::Sender,
  ) -> Result<Self, NewTorrentError> {
    if storage.piece_len > MAX_PIECE_LEN {
      return Err(NewTorrentError::UnsupportedPieceSize(storage.piece_len));
    }

    std::fs::create_dir_all(&storage.download_dir)?;

    let mut files = Vec::with_capacity(storage.files.len());
    for info in storage.files.iter() {
      files.push(Mutex::new(TorrentFile::new(
        &storage.download_dir,
        info.clone(),
      )?));
    }

    Ok(Self {
      write_buf: HashMap::new(),
      read_cache: LruCache::new(
        NonZeroUsize::new(READ_CACHE_PIECES).unwrap(),
      ),
      ctx: Arc::new(ThreadContext {
        storage,
        files,
        piece_hashes,
        torrent_tx,
      }),
    })
  }

  /// Buffers a block in its piece's write buffer. When the block
  /// completes its piece, verification and the actual file writes are
  /// spawned onto the blocking pool; the result is posted to the
  /// torrent as a `PieceCompletion`.
  pub fn write_block(&mut self, info: BlockInfo, data: Vec<u8>) {
    let piece_index = info.piece_index;
    let piece_len = match self.ctx.storage.piece_len(piece_index) {
      Some(len) => len,
      None => {
        log::warn!("Write for invalid piece {}", piece_index);
        return;
      }
    };
    let expected_hash = match self.ctx.expected_hash(piece_index) {
      Some(hash) => hash,
      None => {
        log::warn!("No hash for piece {}", piece_index);
        return;
      }
    };

    let piece = self.write_buf.entry(piece_index).or_insert_with(|| Piece {
      expected_hash,
      len: piece_len,
      blocks: BTreeMap::new(),
    });
    piece.enqueue_block(info.offset, data);

    if piece.is_complete() {
      let piece = self
        .write_buf
        .remove(&piece_index)
        .expect("completed piece must be buffered");
      // a write invalidates whatever the cache held for this piece
      self.read_cache.pop(&piece_index);

      let ctx = Arc::clone(&self.ctx);
      task::spawn_blocking(move || {
        let bytes = piece.assemble();
        let is_valid = Piece::matches_hash(&bytes, &piece.expected_hash);
        let result = if is_valid {
          piece::write_piece(&ctx.storage, &ctx.files, piece_index, &bytes)
            .map(|_| PieceCompletion {
              index: piece_index,
              is_valid: true,
            })
        } else {
          log::warn!("Piece {} failed its hash check", piece_index);
          Ok(PieceCompletion {
            index: piece_index,
            is_valid: false,
          })
        };
        // the torrent may be shutting down; nothing to do then
        ctx.torrent_tx.send(torrent::Command::PieceCompletion(result)).ok();
      });
    }
  }

  /// Serves a block read, from cache if possible. Cache misses read and
  /// cache the whole piece. Returns the block or the read error; the
  /// caller routes either to the requesting session.
  pub async fn read_block(
    &mut self,
    info: BlockInfo,
  ) -> Result<Block, ReadError> {
    let block_index = info.index_in_piece();
    if !self
      .ctx
      .storage
      .piece_len(info.piece_index)
      .map(|len| info.is_valid(len))
      .unwrap_or(false)
    {
      return Err(ReadError::OutOfRange);
    }

    if let Some(blocks) = self.read_cache.get(&info.piece_index) {
      log::trace!("Piece {} read cache hit", info.piece_index);
      return cached_to_block(&info, block_index, blocks);
    }

    let ctx = Arc::clone(&self.ctx);
    let piece_index = info.piece_index;
    let blocks = task::spawn_blocking(move || {
      piece::read_piece_blocks(&ctx.storage, &ctx.files, piece_index)
    })
    .await
    .map_err(|_| {
      ReadError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "read worker died",
      ))
    })??;

    let block = cached_to_block(&info, block_index, &blocks);
    self.read_cache.put(info.piece_index, blocks);
    block
  }

  /// Hashes every piece of the torrent from disk on the blocking pool
  /// and posts the resulting bitfield to the torrent, with progress
  /// reports along the way. Missing or short file contents hash as
  /// zeros and simply fail their piece's check.
  pub fn recheck(&mut self) {
    // buffered partial pieces are stale after a recheck
    self.write_buf.clear();
    self.read_cache.clear();

    let ctx = Arc::clone(&self.ctx);
    task::spawn_blocking(move || {
      let piece_count = ctx.storage.piece_count;
      let mut have = bitfield::new(piece_count);
      for index in 0..piece_count {
        let piece_len = match ctx.storage.piece_len(index) {
          Some(len) => len,
          None => break,
        };
        let expected = match ctx.expected_hash(index) {
          Some(hash) => hash,
          None => break,
        };
        match piece::read_range(&ctx.storage, &ctx.files, index, 0, piece_len)
        {
          Ok(bytes) => {
            if Piece::matches_hash(&bytes, &expected) {
              have.set(index, true);
            }
          }
          Err(ReadError::Io(e)) => {
            ctx
              .torrent_tx
              .send(torrent::Command::RecheckCompleted(Err(ReadError::Io(e))))
              .ok();
            return;
          }
          Err(_) => {}
        }
        if (index + 1) % RECHECK_PROGRESS_STEP == 0 {
          ctx
            .torrent_tx
            .send(torrent::Command::RecheckProgress {
              num_checked: index + 1,
              total: piece_count,
            })
            .ok();
        }
      }
      ctx
        .torrent_tx
        .send(torrent::Command::RecheckCompleted(Ok(have)))
        .ok();
    });
  }

  /// Deletes the torrent's files and, when left empty, its download
  /// directory. Best effort.
  pub fn delete_data(&mut self) {
    for file in self.ctx.files.iter() {
      let path = {
        let file = file.lock().unwrap();
        self.ctx.storage.download_dir.join(&file.info.path)
      };
      if let Err(e) = std::fs::remove_file(&path) {
        log::warn!("Failed to delete {:?}: {}", path, e);
      }
    }
    // removes the directory only if nothing else is in it
    std::fs::remove_dir(&self.ctx.storage.download_dir).ok();
  }
}

fn cached_to_block(
  info: &BlockInfo,
  block_index: usize,
  blocks: &[crate::blockinfo::CachedBlock],
) -> Result<Block, ReadError> {
  let cached = blocks.get(block_index).ok_or(ReadError::OutOfRange)?;
  if cached.len() == info.len as usize {
    Ok(Block {
      piece_index: info.piece_index,
      offset: info.offset,
      data: Arc::clone(cached).into(),
    })
  } else if cached.len() > info.len as usize {
    // a shorter read than the canonical block; serve an owned copy
    Ok(Block {
      piece_index: info.piece_index,
      offset: info.offset,
      data: cached[..info.len as usize].to_vec().into(),
    })
  } else {
    Err(ReadError::OutOfRange)
  }
}
