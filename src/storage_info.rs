use std::{ops::Range, path::PathBuf};

use crate::{metainfo::Metainfo, FileIndex, PieceIndex};

/// The largest piece length the engine is willing to buffer and verify.
/// Torrents above this enter the error state at metadata time.
pub const MAX_PIECE_LEN: u32 = 64 * 1024 * 1024;

/// Information about a torrent's file.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
  /// The file's relative path from the download directory.
  pub path: PathBuf,
  /// The file's length, in bytes.
  pub len: u64,
  /// The byte offset of the file within the torrent, when all files in
  /// torrent are viewed as a single contiguous byte array. This is
  /// always 0 for a single file torrent.
  pub torrent_offset: u64,
}

impl FileInfo {
  /// Returns a range that represents the file's first and one past the
  /// last bytes' offsets in the torrent.
  pub fn byte_range(&self) -> Range<u64> {
    self.torrent_offset..self.torrent_end_offset()
  }

  /// Returns the file's one past the last byte's offset in the torrent.
  pub fn torrent_end_offset(&self) -> u64 {
    self.torrent_offset + self.len
  }
}

/// A contiguous byte range of a piece within a single file.
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
  pub file_index: FileIndex,
  /// Offset of the fragment within the file.
  pub file_offset: u64,
  pub len: u64,
}

/// A torrent's storage geometry: how the pieces map onto the files.
#[derive(Clone, Debug)]
pub struct StorageInfo {
  /// The number of pieces in the torrent.
  pub piece_count: usize,
  /// The nominal length of a piece.
  pub piece_len: u32,
  /// The length of the last piece in torrent, which may differ from the
  /// normal piece length if the download size is not an exact multiple
  /// of the piece length.
  pub last_piece_len: u32,
  /// The sum of the length of all files in the torrent.
  pub download_len: u64,
  /// The download destination directory of the torrent.
  ///
  /// For single file downloads this is the directory the file goes
  /// into; for archives it is the download directory joined with the
  /// torrent name, so a multi-entry torrent doesn't scatter its files
  /// across the user's download root.
  pub download_dir: PathBuf,
  /// The torrent's files in torrent order.
  pub files: Vec<FileInfo>,
}

impl StorageInfo {
  /// Extracts the storage geometry from a torrent's metainfo.
  pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
    let piece_count = metainfo.piece_count();
    let download_len = metainfo.download_len();
    let piece_len = metainfo.piece_len;
    let last_piece_len =
      download_len - piece_len as u64 * (piece_count as u64 - 1);
    let last_piece_len = last_piece_len as u32;

    let download_dir = if metainfo.is_archive() {
      download_dir.join(&metainfo.name)
    } else {
      download_dir
    };

    Self {
      piece_count,
      piece_len,
      last_piece_len,
      download_len,
      download_dir,
      files: metainfo.files.clone(),
    }
  }

  /// Returns the length of the piece at the given index, or `None` for
  /// an out of bounds index.
  pub fn piece_len(&self, index: PieceIndex) -> Option<u32> {
    if index + 1 == self.piece_count {
      Some(self.last_piece_len)
    } else if index + 1 < self.piece_count {
      Some(self.piece_len)
    } else {
      None
    }
  }

  /// The absolute offset of the piece's first byte in the torrent byte
  /// stream.
  pub fn piece_offset(&self, index: PieceIndex) -> u64 {
    index as u64 * self.piece_len as u64
  }

  /// Returns the zero-based indices of the files that intersect with
  /// the piece.
  pub fn files_intersecting_piece(
    &self,
    index: PieceIndex,
  ) -> Range<FileIndex> {
    let piece_offset = self.piece_offset(index);
    let piece_end =
      piece_offset + self.piece_len(index).unwrap_or(0) as u64;
    self.files_intersecting_bytes(piece_offset..piece_end)
  }

  /// Returns the files that overlap with the given left-inclusive range
  /// of torrent byte offsets.
  pub fn files_intersecting_bytes(
    &self,
    byte_range: Range<u64>,
  ) -> Range<FileIndex> {
    let first = match self
      .files
      .iter()
      .position(|f| f.byte_range().contains(&byte_range.start))
    {
      Some(index) => index,
      None => return 0..0,
    };
    let mut range = first..first + 1;
    for (index, file) in self.files.iter().enumerate().skip(first + 1) {
      if !byte_range.contains(&file.torrent_offset) {
        break;
      }
      range.end = index + 1;
    }
    range
  }

  /// Computes the ordered file fragments covering `len` bytes starting
  /// at `begin` within the piece. Returns an empty vector when the range
  /// leaves the piece or the torrent.
  pub fn piece_fragments(
    &self,
    index: PieceIndex,
    begin: u32,
    len: u32,
  ) -> Vec<Fragment> {
    let piece_len = match self.piece_len(index) {
      Some(len) => len,
      None => return Vec::new(),
    };
    if begin
      .checked_add(len)
      .map(|end| end > piece_len)
      .unwrap_or(true)
    {
      return Vec::new();
    }

    let mut torrent_offset = self.piece_offset(index) + begin as u64;
    let mut remaining = len as u64;
    let mut fragments = Vec::new();

    let file_range =
      self.files_intersecting_bytes(torrent_offset..torrent_offset + remaining);
    for file_index in file_range {
      if remaining == 0 {
        break;
      }
      let file = &self.files[file_index];
      debug_assert!(torrent_offset >= file.torrent_offset);
      let file_offset = torrent_offset - file.torrent_offset;
      let fragment_len = remaining.min(file.len - file_offset);
      debug_assert!(fragment_len > 0);
      fragments.push(Fragment {
        file_index,
        file_offset,
        len: fragment_len,
      });
      torrent_offset += fragment_len;
      remaining -= fragment_len;
    }

    debug_assert_eq!(remaining, 0);
    fragments
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn files(lens: &[u64]) -> Vec<FileInfo> {
    let mut offset = 0;
    lens
      .iter()
      .enumerate()
      .map(|(i, &len)| {
        let file = FileInfo {
          path: PathBuf::from(format!("f{}", i)),
          len,
          torrent_offset: offset,
        };
        offset += len;
        file
      })
      .collect()
  }

  fn info(piece_len: u32, file_lens: &[u64]) -> StorageInfo {
    let files = files(file_lens);
    let download_len: u64 = file_lens.iter().sum();
    let piece_count =
      ((download_len + piece_len as u64 - 1) / piece_len as u64) as usize;
    let last_piece_len =
      (download_len - piece_len as u64 * (piece_count as u64 - 1)) as u32;
    StorageInfo {
      piece_count,
      piece_len,
      last_piece_len,
      download_len,
      download_dir: PathBuf::from("/"),
      files,
    }
  }

  #[test]
  fn test_piece_len() {
    let info = info(16, &[3 * 16 + 4]);
    assert_eq!(info.piece_count, 4);
    assert_eq!(info.piece_len(0), Some(16));
    assert_eq!(info.piece_len(2), Some(16));
    assert_eq!(info.piece_len(3), Some(4));
    assert_eq!(info.piece_len(4), None);
  }

  #[test]
  fn test_files_intersecting_pieces() {
    // pieces: (index: first byte offset)
    // ------------------------------------------------------------------
    // |0:0         |1:16          |2:32          |3:48          |4:64  |
    // ------------------------------------------------------------------
    // files: (index: first byte offset, last byte offset)
    // ------------------------------------------------------------------
    // |0:0,8 |1:9,19 |2:20,26|3:27,35 |4:36,47 |5:48,63         |6:64,71|
    // ------------------------------------------------------------------
    let info = info(16, &[9, 11, 7, 9, 12, 16, 8]);
    assert_eq!(info.piece_count, 5);
    assert_eq!(info.last_piece_len, 8);

    assert_eq!(info.files_intersecting_piece(0), 0..2);
    assert_eq!(info.files_intersecting_piece(1), 1..4);
    assert_eq!(info.files_intersecting_piece(2), 3..5);
    assert_eq!(info.files_intersecting_piece(3), 5..6);
    assert_eq!(info.files_intersecting_piece(4), 6..7);
  }

  #[test]
  fn test_files_intersecting_bytes() {
    let info = info(16, &[4, 9, 3, 10]);
    assert_eq!(info.files_intersecting_bytes(0..4), 0..1);
    assert_eq!(info.files_intersecting_bytes(0..5), 0..2);
    assert_eq!(info.files_intersecting_bytes(0..13), 0..2);
    assert_eq!(info.files_intersecting_bytes(0..15), 0..3);
    assert_eq!(info.files_intersecting_bytes(0..18), 0..4);
    assert_eq!(info.files_intersecting_bytes(25..26), 3..4);
    assert_eq!(info.files_intersecting_bytes(4..16), 1..3);
    assert_eq!(info.files_intersecting_bytes(13..14), 2..3);
    assert_eq!(info.files_intersecting_bytes(30..38), 0..0);
  }

  #[test]
  fn test_piece_fragments_cross_files() {
    let info = info(16, &[9, 11, 7, 9, 12, 16, 8]);
    // piece 1 covers bytes 16..32: files 1 (9..20), 2 (20..27), 3 (27..36)
    let fragments = info.piece_fragments(1, 0, 16);
    assert_eq!(
      fragments,
      vec![
        Fragment {
          file_index: 1,
          file_offset: 7,
          len: 4,
        },
        Fragment {
          file_index: 2,
          file_offset: 0,
          len: 7,
        },
        Fragment {
          file_index: 3,
          file_offset: 0,
          len: 5,
        },
      ]
    );
    // the fragments cover exactly the requested range
    assert_eq!(fragments.iter().map(|f| f.len).sum::<u64>(), 16);
  }

  #[test]
  fn test_piece_fragments_with_offset() {
    let info = info(16, &[9, 11, 7, 9, 12, 16, 8]);
    // bytes 20..24 of the torrent: wholly within file 2
    let fragments = info.piece_fragments(1, 4, 4);
    assert_eq!(
      fragments,
      vec![Fragment {
        file_index: 2,
        file_offset: 0,
        len: 4,
      }]
    );
  }

  #[test]
  fn test_piece_fragments_out_of_range() {
    let info = info(16, &[32]);
    // past the piece end
    assert!(info.piece_fragments(0, 8, 16).is_empty());
    // invalid piece
    assert!(info.piece_fragments(2, 0, 1).is_empty());
    // length overflow
    assert!(info.piece_fragments(0, u32::MAX, 2).is_empty());
  }
}
