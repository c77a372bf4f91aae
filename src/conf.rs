//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The Azureus-style prefix of the peer ids this client generates. The
/// remaining 12 bytes are random per engine instance.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-RI0001-";

/// Generates a fresh peer id: the client prefix followed by random
/// printable bytes.
pub fn gen_client_id() -> PeerId {
  use rand::Rng;
  let mut id = [0u8; 20];
  id[..8].copy_from_slice(CLIENT_ID_PREFIX);
  let mut rng = rand::thread_rng();
  for b in id[8..].iter_mut() {
    *b = rng.gen_range(b'0'..=b'9');
  }
  id
}

/// The global configuration for the torrent engine and all its parts.
#[derive(Debug, Clone)]
pub struct Conf {
  pub engine: EngineConf,
  pub torrent: TorrentConf,
}

impl Conf {
  /// Returns the configuration with reasonable defaults, except for the
  /// download directory, as it is not sensible to guess that for the
  /// user.
  pub fn new(download_dir: impl Into<PathBuf>) -> Self {
    Self {
      engine: EngineConf {
        client_id: gen_client_id(),
        download_dir: download_dir.into(),
        state_dir: None,
        listen_port: 0,
        max_connection_count: 200,
        download_rate_limit: 0,
        upload_rate_limit: 0,
      },
      torrent: TorrentConf::default(),
    }
  }
}

/// Configuration related to the engine itself.
#[derive(Debug, Clone)]
pub struct EngineConf {
  /// The ID of the client to announce to trackers and other peers.
  pub client_id: PeerId,
  /// The directory in which a torrent's files are placed upon download
  /// and from which they are seeded.
  pub download_dir: PathBuf,
  /// Where per-torrent session state records are persisted. When `None`,
  /// state is held in memory only and lost on shutdown.
  pub state_dir: Option<PathBuf>,
  /// The TCP port on which the engine listens for inbound peers. Zero
  /// asks the OS for an ephemeral port.
  pub listen_port: u16,
  /// The cap on peer connections across all torrents.
  pub max_connection_count: usize,
  /// Engine-wide download rate limit in bytes per second. Zero means
  /// unlimited.
  pub download_rate_limit: u64,
  /// Engine-wide upload rate limit in bytes per second. Zero means
  /// unlimited.
  pub upload_rate_limit: u64,
}

/// Configuration for a torrent.
///
/// The engine applies a default instance of this to all torrents, but
/// individual torrents may override it.
#[derive(Debug, Clone)]
pub struct TorrentConf {
  /// The minimum number of peers we want to keep in torrent at all times.
  pub min_requested_peer_count: usize,
  /// The max number of connected peers the torrent should have.
  pub max_connected_peer_count: usize,

  /// If the tracker doesn't provide an announce interval, we default to
  /// announcing this often.
  pub announce_interval: Duration,
  /// The cap on the tracker failure backoff.
  pub tracker_backoff_max: Duration,
  /// After this many consecutive failures a tracker is demoted within its
  /// tier.
  pub tracker_error_threshold: usize,

  /// The upper bound on outstanding block requests to a single peer.
  pub pipeline_depth: usize,
  /// How long to wait for a requested block before handing it back to
  /// the scheduler.
  pub request_timeout: Duration,
  /// After this many request timeouts in a row, a peer is snoozed.
  pub request_timeout_limit: usize,
  /// How long a snoozed peer is left alone before requesting resumes.
  pub snooze_duration: Duration,

  /// A keep-alive frame is sent if nothing else was sent for this long.
  pub keep_alive_interval: Duration,
  /// The connection is closed if nothing was received for this long.
  pub inactivity_timeout: Duration,

  /// The number of reciprocation unchoke slots.
  pub unchoke_slots: usize,
  /// How often the optimistic unchoke slot is rotated.
  pub optimistic_unchoke_interval: Duration,
  /// The cap on queued upload requests per peer. Overflow chokes the
  /// peer until the queue drains.
  pub upload_queue_limit: usize,

  /// How long an outstanding ut_metadata piece request may remain
  /// unanswered before it is rotated to another peer.
  pub metadata_request_timeout: Duration,

  /// A peer whose fault score reaches this threshold is banned.
  pub ban_threshold: u32,
  /// How long a banned address is refused before it may be dialed again.
  pub ban_duration: Duration,
  /// How long an unreachable address is skipped before re-dialing.
  pub dead_address_cooldown: Duration,

  /// The session state is re-persisted whenever unflushed transfer
  /// counters exceed this many bytes.
  pub persist_threshold: u64,
}

impl Default for TorrentConf {
  fn default() -> Self {
    TorrentConf {
      // We always request at least 10 peers as anything less is a waste
      // of a network round trip.
      min_requested_peer_count: 10,
      // This value is mostly picked for performance while keeping in
      // mind not to overwhelm the host.
      max_connected_peer_count: 50,
      announce_interval: Duration::from_secs(30 * 60),
      tracker_backoff_max: Duration::from_secs(30 * 60),
      tracker_error_threshold: 5,
      pipeline_depth: 32,
      request_timeout: Duration::from_secs(30),
      request_timeout_limit: 3,
      snooze_duration: Duration::from_secs(60),
      keep_alive_interval: Duration::from_secs(90),
      inactivity_timeout: Duration::from_secs(120),
      unchoke_slots: 3,
      optimistic_unchoke_interval: Duration::from_secs(30),
      upload_queue_limit: 64,
      metadata_request_timeout: Duration::from_secs(15),
      ban_threshold: 3,
      ban_duration: Duration::from_secs(10 * 60),
      dead_address_cooldown: Duration::from_secs(5 * 60),
      persist_threshold: 8 * 1024 * 1024,
    }
  }
}
