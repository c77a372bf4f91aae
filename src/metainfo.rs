use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use url::Url;

use crate::error::metainfo::MetainfoError;
use crate::storage_info::FileInfo;
use crate::Sha1Hash;

pub(crate) type Result<T> = std::result::Result<T, MetainfoError>;

/// The parsed metadata of a torrent.
///
/// This is built either from a `.torrent` file or, for magnet downloads,
/// from the raw info dictionary fetched over the ut_metadata extension.
#[derive(Clone)]
pub struct Metainfo {
  /// The torrent name, which forms the download path.
  pub name: String,
  /// SHA-1 of the canonical bencoded info dictionary.
  pub info_hash: Sha1Hash,
  /// A concatenation of each piece's SHA-1, so a multiple of 20 bytes,
  /// ordered by piece index.
  pub pieces: Vec<u8>,
  /// The nominal piece length; the last piece may be shorter.
  pub piece_len: u32,
  /// The torrent's files in order. The concatenation of these files
  /// defines the byte stream the piece hashes commit to.
  pub files: Vec<FileInfo>,
  /// The trackers that we can announce to.
  pub trackers: Vec<Url>,
  /// The canonical bencoded info dictionary bytes, kept verbatim so the
  /// info hash survives re-serialization and so we can serve ut_metadata
  /// requests.
  pub info_bytes: Vec<u8>,
}

impl fmt::Debug for Metainfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Metainfo")
      .field("name", &self.name)
      .field("info_hash", &hex::encode(self.info_hash))
      .field("pieces", &"<pieces...>")
      .field("piece_len", &self.piece_len)
      .field("files", &self.files)
      .finish()
  }
}

impl Metainfo {
  /// Parses a `.torrent` file buffer into a [`Metainfo`] instance, or
  /// returns an error about the invalid format or syntax.
  ///
  /// The rules:
  /// - the bencode format and syntax must be correct;
  /// - the length of `pieces` must be a multiple of 20;
  /// - the info must not contain both `length` (single file) and `files`
  ///   (multi file), and must contain one of them;
  /// - file lengths must be positive and paths relative and non-empty;
  /// - the piece count must cover the download length exactly.
  pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
    let metainfo: raw::Metainfo = serde_bencode::from_bytes(bytes)?;

    // the info hash must be computed over the info dictionary's exact
    // byte span in the source buffer; re-encoding would drop unknown
    // keys and change the hash
    let info_span =
      find_info_span(bytes).ok_or(MetainfoError::InvalidMetainfo)?;
    let info_bytes = bytes[info_span].to_vec();

    let mut trackers = Vec::new();
    if !metainfo.announce_list.is_empty() {
      for tier in metainfo.announce_list.iter() {
        for tracker in tier.iter() {
          let url = Url::parse(tracker)?;
          if is_supported_tracker(&url) && !trackers.contains(&url) {
            trackers.push(url);
          }
        }
      }
    } else if let Some(tracker) = &metainfo.announce {
      let url = Url::parse(tracker)?;
      if is_supported_tracker(&url) {
        trackers.push(url);
      }
    }
    if trackers.is_empty() {
      log::warn!("No supported trackers in metainfo");
    }

    Self::build(metainfo.info, info_bytes, trackers)
  }

  /// Builds a [`Metainfo`] from the raw info dictionary alone, as
  /// received via the metadata exchange extension. The caller supplies
  /// the trackers it learned from the magnet URI.
  ///
  /// The returned instance's info hash is the SHA-1 of `info_bytes`; the
  /// caller is expected to have verified it against the expected hash
  /// already.
  pub fn from_info_bytes(
    info_bytes: &[u8],
    trackers: Vec<Url>,
  ) -> Result<Self> {
    let info: raw::Info = serde_bencode::from_bytes(info_bytes)?;
    Self::build(info, info_bytes.to_vec(), trackers)
  }

  fn build(
    info: raw::Info,
    info_bytes: Vec<u8>,
    trackers: Vec<Url>,
  ) -> Result<Self> {
    // the pieces field is a concatenation of 20 byte SHA-1 hashes, so it
    // must be a multiple of 20
    if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
      return Err(MetainfoError::InvalidPieces);
    }

    // verify download structure and build up the file metadata
    let mut files = Vec::new();
    if let Some(len) = info.len {
      if info.files.is_some() {
        log::warn!("Metainfo cannot contain both `length` and `files`");
        return Err(MetainfoError::InvalidMetainfo);
      }
      if len == 0 {
        log::warn!("File length is 0");
        return Err(MetainfoError::InvalidMetainfo);
      }

      // the path of this file is just the torrent name
      files.push(FileInfo {
        path: info.name.clone().into(),
        len,
        torrent_offset: 0,
      });
    } else if let Some(raw_files) = &info.files {
      if raw_files.is_empty() {
        log::warn!("Metainfo files must not be empty");
        return Err(MetainfoError::InvalidMetainfo);
      }

      files.reserve_exact(raw_files.len());

      // the running offset of each file in the torrent byte stream
      let mut torrent_offset = 0;
      for file in raw_files.iter() {
        if file.len == 0 {
          log::warn!("File {:?} length is 0", file.path);
          return Err(MetainfoError::InvalidMetainfo);
        }

        let path: PathBuf = file.path.iter().collect();
        if path.as_os_str().is_empty() {
          log::warn!("Path in metainfo is empty");
          return Err(MetainfoError::InvalidMetainfo);
        }
        if path.is_absolute() || path == Path::new("/") {
          log::warn!("Path {:?} is not relative", path);
          return Err(MetainfoError::InvalidMetainfo);
        }
        if file.path.iter().any(|c| c == ".." || c == ".") {
          log::warn!("Path {:?} escapes the download root", path);
          return Err(MetainfoError::InvalidMetainfo);
        }

        files.push(FileInfo {
          path,
          torrent_offset,
          len: file.len,
        });

        torrent_offset += file.len;
      }
    } else {
      log::warn!("No `length` or `files` key present in metainfo");
      return Err(MetainfoError::InvalidMetainfo);
    }

    let piece_len: u32 = info
      .piece_len
      .try_into()
      .map_err(|_| MetainfoError::InvalidMetainfo)?;
    if piece_len == 0 {
      return Err(MetainfoError::InvalidMetainfo);
    }

    // the piece hashes must cover the download length exactly
    let download_len: u64 = files.iter().map(|f| f.len).sum();
    let piece_count = (info.pieces.len() / 20) as u64;
    let expected_count =
      (download_len + piece_len as u64 - 1) / piece_len as u64;
    if piece_count != expected_count {
      log::warn!(
        "Metainfo has {} piece hashes but the content needs {}",
        piece_count,
        expected_count
      );
      return Err(MetainfoError::InvalidPieces);
    }

    let info_hash = {
      let digest = Sha1::digest(&info_bytes);
      let mut hash = [0; 20];
      hash.copy_from_slice(&digest);
      hash
    };

    Ok(Metainfo {
      name: info.name,
      info_hash,
      pieces: info.pieces,
      piece_len,
      files,
      trackers,
      info_bytes,
    })
  }

  /// Returns true if the download is spread over multiple files.
  pub fn is_archive(&self) -> bool {
    self.files.len() > 1
  }

  /// The number of pieces in the torrent.
  pub fn piece_count(&self) -> usize {
    self.pieces.len() / 20
  }

  /// The total download length in bytes.
  pub fn download_len(&self) -> u64 {
    self.files.iter().map(|f| f.len).sum()
  }

  /// The expected SHA-1 of the piece at the given index.
  pub fn piece_hash(&self, index: usize) -> Option<Sha1Hash> {
    let bytes = self.pieces.get(index * 20..index * 20 + 20)?;
    let mut hash = [0; 20];
    hash.copy_from_slice(bytes);
    Some(hash)
  }

  /// Synthesizes a magnet URI for this torrent, carrying the info hash,
  /// display name, and trackers.
  pub fn to_magnet(&self) -> String {
    use std::fmt::Write;
    let mut uri =
      format!("magnet:?xt=urn:btih:{}", hex::encode(self.info_hash));
    let _ = write!(
      uri,
      "&dn={}",
      percent_encoding::utf8_percent_encode(
        &self.name,
        percent_encoding::NON_ALPHANUMERIC
      )
    );
    for tracker in &self.trackers {
      let _ = write!(
        uri,
        "&tr={}",
        percent_encoding::utf8_percent_encode(
          tracker.as_str(),
          percent_encoding::NON_ALPHANUMERIC
        )
      );
    }
    uri
  }
}

fn is_supported_tracker(url: &Url) -> bool {
  matches!(url.scheme(), "http" | "https" | "udp")
}

/// Returns the byte range of the value of the top-level `info` key.
fn find_info_span(bytes: &[u8]) -> Option<Range<usize>> {
  if bytes.first() != Some(&b'd') {
    return None;
  }
  let mut pos = 1;
  while pos < bytes.len() && bytes[pos] != b'e' {
    // dict keys are bencode strings
    let key_end = bencode_value_end(bytes, pos)?;
    let key = string_payload(bytes, pos, key_end);
    let value_end = bencode_value_end(bytes, key_end)?;
    if key == Some(&b"info"[..]) {
      return Some(key_end..value_end);
    }
    pos = value_end;
  }
  None
}

fn string_payload(bytes: &[u8], start: usize, end: usize) -> Option<&[u8]> {
  let colon = bytes[start..end].iter().position(|&b| b == b':')?;
  Some(&bytes[start + colon + 1..end])
}

/// Returns the index one past the end of the bencode value starting at
/// `pos`, without validating leaf contents.
pub(crate) fn bencode_value_end(bytes: &[u8], pos: usize) -> Option<usize> {
  match bytes.get(pos)? {
    b'i' => {
      let end = bytes[pos..].iter().position(|&b| b == b'e')?;
      Some(pos + end + 1)
    }
    b'l' | b'd' => {
      let mut cur = pos + 1;
      while *bytes.get(cur)? != b'e' {
        cur = bencode_value_end(bytes, cur)?;
      }
      Some(cur + 1)
    }
    b'0'..=b'9' => {
      let colon =
        pos + bytes[pos..].iter().position(|&b| b == b':')?;
      let len: usize =
        std::str::from_utf8(&bytes[pos..colon]).ok()?.parse().ok()?;
      let end = colon + 1 + len;
      if end <= bytes.len() {
        Some(end)
      } else {
        None
      }
    }
    _ => None,
  }
}

mod raw {
  //! The serde mirror of the on-disk metainfo format; only used as a
  //! deserialization target.
  use serde_derive::Deserialize;

  /// Field meanings per the
  /// [.torrent file format](https://en.wikipedia.org/wiki/Torrent_file).
  #[derive(Debug, Deserialize)]
  pub struct Metainfo {
    /// Maps to a dictionary whose keys depend on whether one or more
    /// files are being shared.
    pub info: Info,
    /// The URL of the tracker.
    pub announce: Option<String>,
    #[serde(default)]
    #[serde(rename = "announce-list")]
    pub announce_list: Vec<Vec<String>>,
  }

  #[derive(Debug, Deserialize)]
  pub struct Info {
    /// Suggested file name (single file) or directory name (multi file).
    pub name: String,
    /// Concatenation of each piece's SHA-1 hash; as SHA-1 is a 160 bit
    /// digest, the length is a multiple of 20 bytes.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    /// Number of bytes per piece, commonly a power of two.
    #[serde(rename = "piece length")]
    pub piece_len: i64,
    /// Size of the file in bytes (only when one file is being shared).
    #[serde(rename = "length")]
    pub len: Option<u64>,
    /// A list of dictionaries, one per file (only when multiple files
    /// are being shared).
    pub files: Option<Vec<File>>,
  }

  #[derive(Debug, Deserialize)]
  pub struct File {
    /// A list of strings corresponding to subdirectory names, the last
    /// of which is the actual file name.
    pub path: Vec<String>,
    #[serde(rename = "length")]
    pub len: u64,
  }
}
