//! Aggregated per-torrent statistics, shipped to the embedder with the
//! periodic stats alert.

/// What the torrent is doing right now, derived from its metadata,
/// bitfield, recheck, and error state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityState {
  /// Active but still waiting for metadata or its first pieces of
  /// availability.
  Queued,
  /// Hashing what is already on disk.
  Checking,
  Downloading,
  Seeding,
  Error,
}

#[derive(Clone, Debug)]
pub struct TorrentStats {
  pub activity: ActivityState,
  /// The torrent's name, once known.
  pub name: Option<String>,

  pub piece_count: usize,
  pub missing_piece_count: usize,
  /// Completed fraction in `[0, 1]`; zero before metadata.
  pub progress: f64,

  /// Payload bytes per second over the last second.
  pub download_rate: u64,
  pub upload_rate: u64,

  /// Payload byte totals over the life of the torrent, persisted
  /// across sessions.
  pub downloaded: u64,
  pub uploaded: u64,

  pub connected_peer_count: usize,
  pub known_peer_count: usize,
}
