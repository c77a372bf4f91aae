//! The metadata acquirer: downloads the info dictionary over the
//! ut_metadata extension (BEP 9) for torrents added from a magnet URI.
//!
//! The torrent drives this from its tick: peers that advertised
//! ut_metadata and a plausible `metadata_size` are asked for the 16 KiB
//! metadata pieces round-robin, outstanding requests rotate to other
//! peers on reject or timeout, and the assembled dictionary is only
//! accepted if its SHA-1 equals the torrent's info hash. On a mismatch
//! everything is discarded and the contributors are reported for
//! banning.

use std::collections::HashMap;
use std::net::SocketAddr;

use sha1::{Digest, Sha1};
use tokio::time::Instant;

use crate::{extension::METADATA_PIECE_LEN, Sha1Hash};

/// An upper bound on plausible info dictionary sizes. The largest real
/// world torrents stay well under this.
pub const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

/// What became of a received metadata data message.
#[derive(Debug, PartialEq)]
pub enum DataReceipt {
  /// Stored; more pieces are still missing.
  Stored,
  /// This was the last piece and the SHA-1 gate passed; here is the
  /// full info dictionary.
  Complete(Vec<u8>),
  /// The last piece arrived but the assembled bytes do not hash to the
  /// info hash. State was reset; the listed contributors supplied the
  /// bad data.
  HashMismatch { contributors: Vec<SocketAddr> },
  /// The message was out of range, mis-sized, or redundant.
  Ignored,
}

/// The in-progress download of one torrent's info dictionary.
pub struct MetadataDownload {
  expected_hash: Sha1Hash,
  total_size: usize,
  pieces: Vec<Option<Vec<u8>>>,
  /// Which peer supplied each stored piece.
  sources: Vec<Option<SocketAddr>>,
  /// Outstanding piece requests and when they went out.
  requested: HashMap<usize, (SocketAddr, Instant)>,
}

impl MetadataDownload {
  /// Starts a download once the first peer announced the metadata size.
  /// Returns `None` for implausible sizes.
  pub fn new(expected_hash: Sha1Hash, total_size: usize) -> Option<Self> {
    if total_size == 0 || total_size > MAX_METADATA_SIZE {
      return None;
    }
    let piece_count = (total_size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN;
    Some(Self {
      expected_hash,
      total_size,
      pieces: vec![None; piece_count],
      sources: vec![None; piece_count],
      requested: HashMap::new(),
    })
  }

  pub fn total_size(&self) -> usize {
    self.total_size
  }

  pub fn piece_count(&self) -> usize {
    self.pieces.len()
  }

  /// Whether a peer announcing a different total size agrees with this
  /// download. Disagreeing peers are not used for metadata.
  pub fn size_matches(&self, announced: usize) -> bool {
    self.total_size == announced
  }

  /// Picks the next piece to request from `peer`: the first piece that
  /// is neither stored nor outstanding. Records the request.
  pub fn next_request(
    &mut self,
    peer: SocketAddr,
    now: Instant,
  ) -> Option<usize> {
    let piece = (0..self.pieces.len()).find(|index| {
      self.pieces[*index].is_none() && !self.requested.contains_key(index)
    })?;
    self.requested.insert(piece, (peer, now));
    Some(piece)
  }

  /// Clears an outstanding request the peer rejected so it rotates to
  /// another peer.
  pub fn on_reject(&mut self, piece: usize, peer: SocketAddr) {
    if let Some((requested_from, _)) = self.requested.get(&piece) {
      if *requested_from == peer {
        self.requested.remove(&piece);
      }
    }
  }

  /// Clears all outstanding requests to a disconnecting peer.
  pub fn release_peer(&mut self, peer: SocketAddr) {
    self
      .requested
      .retain(|_, (requested_from, _)| *requested_from != peer);
  }

  /// Clears requests that have been outstanding longer than `timeout`,
  /// so the tick can rotate them to other peers.
  pub fn release_timed_out(
    &mut self,
    now: Instant,
    timeout: std::time::Duration,
  ) {
    self.requested.retain(|piece, (_, at)| {
      let expired = now.saturating_duration_since(*at) >= timeout;
      if expired {
        log::debug!("Metadata piece {} request timed out", piece);
      }
      !expired
    });
  }

  /// Expected byte length of a metadata piece.
  fn piece_len(&self, piece: usize) -> usize {
    if piece + 1 == self.pieces.len() {
      self.total_size - METADATA_PIECE_LEN * (self.pieces.len() - 1)
    } else {
      METADATA_PIECE_LEN
    }
  }

  /// Stores a received data piece. On the final piece the assembly is
  /// hashed against the info hash: a match completes the download, a
  /// mismatch throws everything away and reports the contributors.
  pub fn on_data(
    &mut self,
    piece: usize,
    total_size: usize,
    data: &[u8],
    peer: SocketAddr,
  ) -> DataReceipt {
    if piece >= self.pieces.len()
      || !self.size_matches(total_size)
      || data.len() != self.piece_len(piece)
    {
      log::warn!("Ignoring bad metadata piece {} from {}", piece, peer);
      return DataReceipt::Ignored;
    }
    if self.pieces[piece].is_some() {
      return DataReceipt::Ignored;
    }

    self.requested.remove(&piece);
    self.pieces[piece] = Some(data.to_vec());
    self.sources[piece] = Some(peer);

    if self.pieces.iter().any(|piece| piece.is_none()) {
      return DataReceipt::Stored;
    }

    // assemble and run the SHA-1 gate
    let mut assembled = Vec::with_capacity(self.total_size);
    for piece in self.pieces.iter() {
      assembled.extend_from_slice(piece.as_ref().unwrap());
    }
    let digest = Sha1::digest(&assembled);
    if digest.as_slice() == self.expected_hash {
      DataReceipt::Complete(assembled)
    } else {
      log::warn!("Assembled metadata does not match the info hash");
      let contributors = self.reset();
      DataReceipt::HashMismatch { contributors }
    }
  }

  /// Throws away all progress, returning the peers that had contributed
  /// pieces.
  fn reset(&mut self) -> Vec<SocketAddr> {
    let mut contributors = Vec::new();
    for source in self.sources.iter_mut() {
      if let Some(peer) = source.take() {
        if !contributors.contains(&peer) {
          contributors.push(peer);
        }
      }
    }
    for piece in self.pieces.iter_mut() {
      *piece = None;
    }
    self.requested.clear();
    contributors
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  fn addr(port: u16) -> SocketAddr {
    SocketAddr::new([127, 0, 0, 1].into(), port)
  }

  fn info_dict() -> (Vec<u8>, Sha1Hash) {
    // large enough for three metadata pieces
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"d4:name4:test6:filler");
    let filler = vec![b'x'; 2 * METADATA_PIECE_LEN + 100];
    bytes.extend_from_slice(format!("{}:", filler.len()).as_bytes());
    bytes.extend_from_slice(&filler);
    bytes.push(b'e');
    let mut hash = [0; 20];
    hash.copy_from_slice(&Sha1::digest(&bytes));
    (bytes, hash)
  }

  #[tokio::test(start_paused = true)]
  async fn test_rejects_implausible_sizes() {
    assert!(MetadataDownload::new([0; 20], 0).is_none());
    assert!(MetadataDownload::new([0; 20], MAX_METADATA_SIZE + 1).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_round_robin_requests() {
    let (bytes, hash) = info_dict();
    let mut download = MetadataDownload::new(hash, bytes.len()).unwrap();
    assert_eq!(download.piece_count(), 3);

    let now = Instant::now();
    // each peer gets a different piece
    assert_eq!(download.next_request(addr(1), now), Some(0));
    assert_eq!(download.next_request(addr(2), now), Some(1));
    assert_eq!(download.next_request(addr(1), now), Some(2));
    // everything is outstanding
    assert_eq!(download.next_request(addr(3), now), None);

    // a reject rotates the piece to the next peer
    download.on_reject(1, addr(2));
    assert_eq!(download.next_request(addr(3), now), Some(1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_rotation() {
    let (bytes, hash) = info_dict();
    let mut download = MetadataDownload::new(hash, bytes.len()).unwrap();
    let now = Instant::now();
    assert_eq!(download.next_request(addr(1), now), Some(0));

    tokio::time::advance(Duration::from_secs(20)).await;
    download.release_timed_out(Instant::now(), Duration::from_secs(15));
    assert_eq!(download.next_request(addr(2), Instant::now()), Some(0));
  }

  #[tokio::test(start_paused = true)]
  async fn test_assembly_and_hash_gate() {
    let (bytes, hash) = info_dict();
    let mut download = MetadataDownload::new(hash, bytes.len()).unwrap();
    let total = bytes.len();

    let pieces: Vec<&[u8]> = bytes.chunks(METADATA_PIECE_LEN).collect();
    assert_eq!(
      download.on_data(0, total, pieces[0], addr(1)),
      DataReceipt::Stored
    );
    // a duplicate is ignored
    assert_eq!(
      download.on_data(0, total, pieces[0], addr(2)),
      DataReceipt::Ignored
    );
    // wrong length is ignored
    assert_eq!(
      download.on_data(1, total, &pieces[1][1..], addr(1)),
      DataReceipt::Ignored
    );
    assert_eq!(
      download.on_data(1, total, pieces[1], addr(2)),
      DataReceipt::Stored
    );
    match download.on_data(2, total, pieces[2], addr(1)) {
      DataReceipt::Complete(assembled) => assert_eq!(assembled, bytes),
      other => panic!("expected completion, got {:?}", other),
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_mismatch_blames_and_resets() {
    let (bytes, hash) = info_dict();
    let mut download = MetadataDownload::new(hash, bytes.len()).unwrap();
    let total = bytes.len();
    let pieces: Vec<&[u8]> = bytes.chunks(METADATA_PIECE_LEN).collect();

    // peer 1 poisons the first piece
    let mut poisoned = pieces[0].to_vec();
    poisoned[0] ^= 0xff;
    download.on_data(0, total, &poisoned, addr(1));
    download.on_data(1, total, pieces[1], addr(2));
    match download.on_data(2, total, pieces[2], addr(2)) {
      DataReceipt::HashMismatch { contributors } => {
        assert!(contributors.contains(&addr(1)));
        assert!(contributors.contains(&addr(2)));
      }
      other => panic!("expected mismatch, got {:?}", other),
    }

    // state restarted from zero
    assert_eq!(
      download.next_request(addr(3), Instant::now()),
      Some(0)
    );
  }
}
