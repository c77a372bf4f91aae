//! The per-torrent controller task.
//!
//! A torrent owns its swarm of peer sessions, its tracker entries, the
//! shared scheduling state ([`TorrentContext`]) its sessions work from,
//! and the metadata acquirer while the info dictionary is still
//! missing. It reacts to commands from the engine, the disk task, and
//! its sessions, and runs a once-a-second tick for announces,
//! connection top-up, choke rotation, endgame detection, and
//! persistence.

pub mod stats;

use std::{
  collections::{HashMap, HashSet},
  net::SocketAddr,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, RwLock,
  },
  time::Duration,
};

use tokio::{
  net::TcpStream,
  sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
  task,
  time::Instant,
};
use url::Url;

use crate::{
  alert::{Alert, AlertSender},
  bandwidth,
  bitfield,
  blockinfo::{block_count, BlockInfo},
  conf::TorrentConf,
  counter::ThruputCounters,
  disk,
  download::PieceDownload,
  engine::ConnectionSlots,
  error::{
    disk::{NewTorrentError, ReadError, WriteError},
    peer::PeerError,
    tracker::TrackerError,
    TorrentResult,
  },
  extension::PexMsg,
  metadata::{DataReceipt, MetadataDownload},
  metainfo::Metainfo,
  peer::{self, codec::Handshake, PeerSession, SessionTick},
  piece_picker::PiecePicker,
  storage_info::{StorageInfo, MAX_PIECE_LEN},
  store::{OriginRecord, SessionStore, TorrentState},
  swarm::{PeerOrigin, Swarm},
  timing::ConnectTimer,
  tracker::{
    announce::{Announce, Event},
    response::Response,
    Tracker, TrackerEntry,
  },
  Bitfield, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

use stats::{ActivityState, TorrentStats};

/// The channel for communication with a torrent.
pub type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The type returned on completing a piece.
#[derive(Debug)]
pub struct PieceCompletion {
  /// The index of the piece.
  pub index: PieceIndex,
  /// Whether the piece passed its hash check. If it did not, it was
  /// not written to disk.
  pub is_valid: bool,
}

/// The messages a torrent can receive from the engine, the disk task,
/// and its peer sessions.
pub enum Command {
  /// The disk task finished (or failed) allocating the torrent.
  TorrentAllocation(Result<(), NewTorrentError>),
  /// A piece's blocks were all written: either verified and stored, or
  /// discarded on hash mismatch, or the write failed.
  PieceCompletion(Result<PieceCompletion, WriteError>),
  /// The disk task finished rehashing everything.
  RecheckCompleted(Result<Bitfield, ReadError>),
  /// Recheck progress report.
  RecheckProgress { num_checked: usize, total: usize },

  /// A session completed its handshake.
  PeerConnected {
    addr: SocketAddr,
    id: PeerId,
    /// Dial duration for outbound connections, feeding the adaptive
    /// connect timeout.
    connect_time: Option<Duration>,
  },
  /// A session is gone, with the error that ended it if any.
  PeerDisconnected {
    addr: SocketAddr,
    error: Option<PeerError>,
  },
  /// A session's periodic state report.
  PeerState { addr: SocketAddr, info: SessionTick },
  /// A session completed the extension handshake.
  PeerExtensions {
    addr: SocketAddr,
    supports_metadata: bool,
    metadata_size: Option<u32>,
  },
  /// A session received a metadata piece.
  MetadataPiece {
    addr: SocketAddr,
    piece: usize,
    total_size: usize,
    data: Vec<u8>,
  },
  /// A session's metadata request was rejected (or unservable).
  MetadataReject { addr: SocketAddr, piece: usize },
  /// A block arrived that other peers still have on request; they
  /// should send CANCELs.
  BlockReceived {
    block: BlockInfo,
    cancel_peers: Vec<SocketAddr>,
  },
  /// New peer addresses learned from PEX or elsewhere.
  PeersFound {
    addrs: Vec<SocketAddr>,
    origin: PeerOrigin,
  },

  /// The engine accepted an inbound connection for this torrent; its
  /// handshake has been read. The global connection slot is already
  /// held.
  PeerAccepted {
    stream: TcpStream,
    read_buf: bytes::BytesMut,
    handshake: Handshake,
  },
  /// An announce task finished.
  AnnounceResult {
    url: Url,
    event: Option<Event>,
    result: Result<Response, TrackerError>,
  },

  /// Activate the torrent.
  Start,
  /// Deactivate the torrent: no new dials, sessions drain.
  Stop,
  /// Pause all network activity without touching the user state; the
  /// embedding environment backgrounded us.
  Suspend,
  /// Undo a suspension: torrents the user had active go back to work.
  Resume,
  /// Re-hash everything on disk and rebuild the bitfield.
  Recheck,
  /// Gracefully shut the torrent down.
  ///
  /// This tells all active peer sessions of the torrent to do the
  /// same, waits for them, and announces our exit to the trackers.
  Shutdown,
}

/// State shared between a torrent and all its peer sessions.
pub struct TorrentContext {
  pub id: TorrentId,
  pub info_hash: Sha1Hash,
  pub client_id: PeerId,
  /// The torrent's command channel.
  pub cmd_tx: Sender,
  pub disk_tx: disk::Sender,
  pub conf: TorrentConf,
  /// The engine-wide bandwidth tracker and token buckets.
  pub rate_limiter: Arc<bandwidth::Tracker>,
  /// The port the engine listens on, advertised in extension
  /// handshakes.
  pub listen_port: u16,

  /// The piece picker and our own bitfield; empty before metadata.
  pub piece_picker: RwLock<PiecePicker>,
  /// The active piece downloads, shared by all sessions.
  pub downloads: RwLock<HashMap<PieceIndex, Mutex<PieceDownload>>>,

  /// The storage geometry, set once metadata is known.
  storage: RwLock<Option<StorageInfo>>,
  /// The raw bencoded info dictionary, for serving ut_metadata.
  info_raw: RwLock<Option<Arc<Vec<u8>>>>,

  /// Set while the scheduler is in endgame.
  pub in_endgame: AtomicBool,
  /// Set while stopped or rechecking: sessions stop requesting.
  pub paused: AtomicBool,
}

impl TorrentContext {
  pub fn has_metadata(&self) -> bool {
    self.storage.read().unwrap().is_some()
  }

  /// The size of the raw info dictionary, advertised to peers.
  pub fn metadata_size(&self) -> Option<u32> {
    self
      .info_raw
      .read()
      .unwrap()
      .as_ref()
      .map(|info| info.len() as u32)
  }

  pub fn info_raw(&self) -> Option<Arc<Vec<u8>>> {
    self.info_raw.read().unwrap().clone()
  }

  pub fn piece_count(&self) -> Option<usize> {
    self.storage.read().unwrap().as_ref().map(|s| s.piece_count)
  }

  pub fn piece_len(&self, index: PieceIndex) -> Option<u32> {
    self
      .storage
      .read()
      .unwrap()
      .as_ref()
      .and_then(|s| s.piece_len(index))
  }

  fn set_metadata(&self, storage: StorageInfo, info_raw: Vec<u8>) {
    *self.storage.write().unwrap() = Some(storage);
    *self.info_raw.write().unwrap() = Some(Arc::new(info_raw));
  }
}

/// Everything needed to construct a torrent task.
pub struct Params {
  pub id: TorrentId,
  pub info_hash: Sha1Hash,
  pub client_id: PeerId,
  pub conf: TorrentConf,
  pub disk_tx: disk::Sender,
  pub alert_tx: AlertSender,
  pub rate_limiter: Arc<bandwidth::Tracker>,
  pub conn_slots: Arc<ConnectionSlots>,
  pub store: Arc<dyn SessionStore>,
  pub listen_port: u16,
  pub download_dir: std::path::PathBuf,

  /// Where the torrent came from, for persistence.
  pub origin: OriginRecord,
  /// Display name before metadata (e.g. the magnet `dn`).
  pub name: Option<String>,
  /// Announce URLs in tier order.
  pub announce: Vec<Url>,
  /// Static peer hints (magnet `x.pe`, restore), re-ingested on every
  /// start.
  pub peer_hints: Vec<SocketAddr>,
  /// Present when added from a `.torrent` file or a restore with known
  /// info dict.
  pub metainfo: Option<Metainfo>,
  /// Restored counters and bitfield.
  pub resume_bitfield: Option<Bitfield>,
  pub resume_downloaded: u64,
  pub resume_uploaded: u64,
  /// Whether to start active.
  pub start_active: bool,
  /// Restore-time construction skips the initial persistence write.
  pub is_restore: bool,
}

/// A connected (or connecting) peer session owned by the torrent.
struct PeerHandle {
  tx: peer::Sender,
  join: Option<task::JoinHandle<()>>,
  /// Set once the handshake completed.
  connected: bool,
  /// The latest session tick.
  state: Option<SessionTick>,
  /// Whether the peer advertises ut_metadata with an agreeing size.
  metadata_ok: bool,
  /// Whether we currently grant the peer an unchoke slot.
  unchoked: bool,
}

pub struct Torrent {
  ctx: Arc<TorrentContext>,
  cmd_rx: Receiver,
  alert_tx: AlertSender,
  store: Arc<dyn SessionStore>,
  conn_slots: Arc<ConnectionSlots>,
  download_dir: std::path::PathBuf,

  origin: OriginRecord,
  name: Option<String>,
  metainfo: Option<Metainfo>,

  trackers: Vec<TrackerEntry>,
  swarm: Swarm,
  peers: HashMap<SocketAddr, PeerHandle>,
  peer_hints: Vec<SocketAddr>,

  is_active: bool,
  /// Set while the engine is suspended; network activity rests but the
  /// user state is untouched.
  suspended: bool,
  error: Option<String>,
  recheck_in_progress: bool,
  /// Whether the disk task has the torrent's files open.
  allocated: bool,

  metadata_download: Option<MetadataDownload>,

  /// Aggregate transfer counters, merged from session ticks.
  counters: ThruputCounters,
  /// Life-of-torrent payload totals; monotonic, persisted.
  downloaded: u64,
  uploaded: u64,
  /// Payload bytes accumulated since the last persist.
  unflushed: u64,
  /// Something worth persisting happened.
  dirty: bool,

  connect_timer: ConnectTimer,
  /// Once complete, the `completed` event still owed to the trackers.
  completed_event_pending: bool,
  last_choke_eval: Instant,
  last_optimistic_rotate: Instant,
  optimistic_unchoke: Option<SocketAddr>,
  last_pex: Instant,
}

/// How often the choke slots are re-evaluated.
const CHOKE_EVAL_INTERVAL: Duration = Duration::from_secs(10);
/// How often PEX gossip goes out.
const PEX_INTERVAL: Duration = Duration::from_secs(60);
/// How many addresses a PEX message carries at most.
const PEX_SAMPLE_LEN: usize = 50;

impl Torrent {
  /// Creates the torrent and its context. The task must then be
  /// spawned with [`Torrent::run`].
  pub fn new(params: Params) -> (Self, Sender) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    let piece_picker = match (&params.metainfo, &params.resume_bitfield) {
      (Some(metainfo), Some(resumed)) => {
        debug_assert_eq!(resumed.len(), metainfo.piece_count());
        PiecePicker::new(resumed.clone())
      }
      (Some(metainfo), None) => {
        PiecePicker::new(bitfield::new(metainfo.piece_count()))
      }
      _ => PiecePicker::empty(),
    };

    let storage = params
      .metainfo
      .as_ref()
      .map(|m| StorageInfo::new(m, params.download_dir.clone()));
    let info_raw = params
      .metainfo
      .as_ref()
      .map(|m| Arc::new(m.info_bytes.clone()));

    let ctx = Arc::new(TorrentContext {
      id: params.id,
      info_hash: params.info_hash,
      client_id: params.client_id,
      cmd_tx: cmd_tx.clone(),
      disk_tx: params.disk_tx,
      conf: params.conf,
      rate_limiter: params.rate_limiter,
      listen_port: params.listen_port,
      piece_picker: RwLock::new(piece_picker),
      downloads: RwLock::new(HashMap::new()),
      storage: RwLock::new(storage),
      info_raw: RwLock::new(info_raw),
      in_endgame: AtomicBool::new(false),
      paused: AtomicBool::new(!params.start_active),
    });

    let now = Instant::now();
    let trackers = params
      .announce
      .iter()
      .cloned()
      .filter_map(Tracker::from_url)
      .map(TrackerEntry::new)
      .collect();

    let name = params
      .metainfo
      .as_ref()
      .map(|m| m.name.clone())
      .or(params.name);

    let torrent = Self {
      ctx,
      cmd_rx,
      alert_tx: params.alert_tx,
      store: params.store,
      conn_slots: params.conn_slots,
      download_dir: params.download_dir,
      origin: params.origin,
      name,
      metainfo: params.metainfo,
      trackers,
      swarm: Swarm::new(),
      peers: HashMap::new(),
      peer_hints: params.peer_hints,
      is_active: false,
      suspended: false,
      error: None,
      recheck_in_progress: false,
      allocated: false,
      metadata_download: None,
      counters: ThruputCounters::default(),
      downloaded: params.resume_downloaded,
      uploaded: params.resume_uploaded,
      unflushed: 0,
      dirty: !params.is_restore,
      connect_timer: ConnectTimer::default(),
      completed_event_pending: false,
      last_choke_eval: now,
      last_optimistic_rotate: now,
      optimistic_unchoke: None,
      last_pex: now,
    };
    (torrent, cmd_tx)
  }

  /// Runs the torrent until it is shut down.
  pub async fn run(&mut self, start_active: bool) -> TorrentResult<()> {
    log::info!("Starting torrent {}", self.ctx.id);
    if start_active {
      self.start();
    }

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        cmd = self.cmd_rx.recv() => {
          let cmd = match cmd {
            Some(cmd) => cmd,
            None => break,
          };
          if self.handle_cmd(cmd).await? {
            break;
          }
        }
        _ = tick.tick() => {
          self.tick().await;
        }
      }
    }

    self.shutdown().await;
    Ok(())
  }

  /// Executes a command; returns true when the torrent should shut
  /// down.
  async fn handle_cmd(&mut self, cmd: Command) -> TorrentResult<bool> {
    match cmd {
      Command::TorrentAllocation(result) => match result {
        Ok(()) => {
          log::info!("Torrent {} allocated on disk", self.ctx.id);
        }
        Err(NewTorrentError::UnsupportedPieceSize(len)) => {
          self.enter_error(format!(
            "piece length {} exceeds the supported maximum",
            len
          ));
        }
        Err(e) => {
          self.enter_error(format!("disk allocation failed: {}", e));
        }
      },
      Command::PieceCompletion(result) => match result {
        Ok(completion) => self.handle_piece_completion(completion),
        Err(e) => {
          // a failed write means the data is not safe on disk
          self.enter_error(format!("storage write failed: {}", e));
        }
      },
      Command::RecheckCompleted(result) => self.handle_recheck_done(result),
      Command::RecheckProgress { num_checked, total } => {
        log::info!(
          "Torrent {} recheck progress {}/{}",
          self.ctx.id,
          num_checked,
          total
        );
      }
      Command::PeerConnected {
        addr,
        id,
        connect_time,
      } => {
        self.handle_peer_connected(addr, id, connect_time);
      }
      Command::PeerDisconnected { addr, error } => {
        self.handle_peer_disconnected(addr, error);
      }
      Command::PeerState { addr, info } => {
        self.handle_peer_state(addr, info);
      }
      Command::PeerExtensions {
        addr,
        supports_metadata,
        metadata_size,
      } => {
        self.handle_peer_extensions(addr, supports_metadata, metadata_size);
      }
      Command::MetadataPiece {
        addr,
        piece,
        total_size,
        data,
      } => {
        self.handle_metadata_piece(addr, piece, total_size, &data);
      }
      Command::MetadataReject { addr, piece } => {
        if let Some(download) = &mut self.metadata_download {
          download.on_reject(piece, addr);
        }
      }
      Command::BlockReceived {
        block,
        cancel_peers,
      } => {
        for addr in cancel_peers {
          if let Some(peer) = self.peers.get(&addr) {
            peer.tx.send(peer::Command::CancelRequest(block)).ok();
          }
        }
      }
      Command::PeersFound { addrs, origin } => {
        for addr in addrs {
          self.swarm.insert(addr, origin);
        }
      }
      Command::PeerAccepted {
        stream,
        read_buf,
        handshake,
      } => {
        self.handle_peer_accepted(stream, read_buf, handshake);
      }
      Command::AnnounceResult { url, event, result } => {
        self.handle_announce_result(url, event, result);
      }
      Command::Start => self.start(),
      Command::Stop => self.stop(),
      Command::Suspend => self.suspend(),
      Command::Resume => self.resume(),
      Command::Recheck => self.start_recheck(),
      Command::Shutdown => return Ok(true),
    }
    Ok(false)
  }

  fn start(&mut self) {
    if self.is_active {
      return;
    }
    if self.error.is_some() {
      log::warn!("Torrent {} is in error state, not starting", self.ctx.id);
      return;
    }
    log::info!("Torrent {} starting", self.ctx.id);
    self.is_active = true;
    self.ctx.paused.store(self.recheck_in_progress, Ordering::Relaxed);
    self.dirty = true;

    // peer hints are attached on every start, not only the first
    let hints: Vec<SocketAddr> = self.peer_hints.clone();
    for addr in hints {
      self.swarm.insert(addr, PeerOrigin::MagnetHint);
    }

    // the `started` event is owed to every tracker anew
    for entry in self.trackers.iter_mut() {
      entry.sent_started = false;
      entry.next_announce = None;
    }

    self.ensure_allocated();
  }

  fn stop(&mut self) {
    if !self.is_active {
      return;
    }
    log::info!("Torrent {} stopping", self.ctx.id);
    self.is_active = false;
    self.ctx.paused.store(true, Ordering::Relaxed);
    self.dirty = true;

    // in-flight connections drain; no new dials are made
    for (_, peer) in self.peers.iter() {
      peer.tx.send(peer::Command::Shutdown).ok();
    }

    self.announce_all(Some(Event::Stopped));
    self.persist();
  }

  /// Rests all network activity without touching the user state.
  fn suspend(&mut self) {
    if self.suspended {
      return;
    }
    log::info!("Torrent {} suspending", self.ctx.id);
    self.suspended = true;
    self.ctx.paused.store(true, Ordering::Relaxed);
    for (_, peer) in self.peers.iter() {
      peer.tx.send(peer::Command::Shutdown).ok();
    }
    if self.is_active {
      self.announce_all(Some(Event::Stopped));
    }
  }

  /// Ends a suspension; a torrent the user had active goes back to
  /// work.
  fn resume(&mut self) {
    if !self.suspended {
      return;
    }
    log::info!("Torrent {} resuming", self.ctx.id);
    self.suspended = false;
    if self.is_active {
      self
        .ctx
        .paused
        .store(self.recheck_in_progress, Ordering::Relaxed);
      for entry in self.trackers.iter_mut() {
        entry.sent_started = false;
        entry.next_announce = None;
      }
      let hints: Vec<SocketAddr> = self.peer_hints.clone();
      for addr in hints {
        self.swarm.insert(addr, PeerOrigin::MagnetHint);
      }
    }
  }

  /// Makes sure the disk task has the torrent's files open.
  fn ensure_allocated(&mut self) {
    if self.allocated || !self.ctx.has_metadata() {
      return;
    }
    let metainfo = match &self.metainfo {
      Some(metainfo) => metainfo,
      None => return,
    };
    let storage = self.ctx.storage.read().unwrap().clone();
    if let Some(storage) = storage {
      self
        .ctx
        .disk_tx
        .send(disk::Command::NewTorrent {
          id: self.ctx.id,
          storage_info: storage,
          piece_hashes: metainfo.pieces.clone(),
          torrent_tx: self.ctx.cmd_tx.clone(),
        })
        .ok();
      self.allocated = true;
    }
  }

  /// The once-a-second maintenance pass.
  async fn tick(&mut self) {
    if self.is_active && !self.suspended && self.error.is_none() {
      self.announce_due();
      self.top_up_connections();
      self.metadata_tick();
      self.evaluate_endgame();
      self.evaluate_chokes();
      self.send_pex();
    }

    self.emit_stats();
    self.counters.tick();

    if self.dirty || self.unflushed >= self.ctx.conf.persist_threshold {
      self.persist();
    }
  }

  // ------------------------------------------------------------------
  // trackers
  // ------------------------------------------------------------------

  /// Launches an announce to the highest-priority tracker that is due.
  /// Lower entries get their turn while earlier ones back off after
  /// failures.
  fn announce_due(&mut self) {
    let now = Instant::now();
    let url = self
      .trackers
      .iter()
      .find(|entry| entry.is_due(now))
      .map(|entry| entry.tracker.url().clone());
    if let Some(url) = url {
      let event = self.next_event_for(&url);
      self.spawn_announce(url, event);
    }
  }

  fn next_event_for(&self, url: &Url) -> Option<Event> {
    let entry = self
      .trackers
      .iter()
      .find(|entry| entry.tracker.url() == url)?;
    if !entry.sent_started {
      Some(Event::Started)
    } else if self.completed_event_pending {
      Some(Event::Completed)
    } else {
      None
    }
  }

  fn spawn_announce(&mut self, url: Url, event: Option<Event>) {
    let left = self.bytes_left();
    let entry = match self
      .trackers
      .iter_mut()
      .find(|entry| entry.tracker.url() == &url)
    {
      Some(entry) => entry,
      None => return,
    };
    entry.in_flight = true;
    let tracker = entry.tracker.clone();

    let cmd_tx = self.ctx.cmd_tx.clone();
    let params = Announce {
      info_hash: self.ctx.info_hash,
      peer_id: self.ctx.client_id,
      port: self.ctx.listen_port,
      ip: None,
      downloaded: self.downloaded,
      uploaded: self.uploaded,
      left,
      peer_count: Some(self.ctx.conf.min_requested_peer_count.max(30)),
      event,
    };
    log::debug!("Announcing to {} (event {:?})", url, event);
    task::spawn(async move {
      let result = tracker.announce(params).await;
      cmd_tx
        .send(Command::AnnounceResult { url, event, result })
        .ok();
    });
  }

  fn handle_announce_result(
    &mut self,
    url: Url,
    event: Option<Event>,
    result: Result<Response, TrackerError>,
  ) {
    let now = Instant::now();
    let default_interval = self.ctx.conf.announce_interval;
    let backoff_cap = self.ctx.conf.tracker_backoff_max;
    let error_threshold = self.ctx.conf.tracker_error_threshold;

    let position = match self
      .trackers
      .iter()
      .position(|entry| entry.tracker.url() == &url)
    {
      Some(position) => position,
      None => return,
    };

    let mut demote = false;
    {
      let entry = &mut self.trackers[position];
      entry.in_flight = false;
      match &result {
        Ok(response) => {
          log::info!(
            "Tracker {} returned {} peers",
            url,
            response.peers.len() + response.peers6.len()
          );
          entry.record_success(response, now, default_interval);
          if event == Some(Event::Started) {
            entry.sent_started = true;
          }
          if event == Some(Event::Completed) {
            self.completed_event_pending = false;
          }
        }
        Err(e) => {
          log::warn!("Tracker {} announce error: {}", url, e);
          entry.record_failure(now, backoff_cap);
          demote = entry.consecutive_failures == error_threshold;
        }
      }
    }

    if let Ok(response) = result {
      for addr in response.all_peers() {
        self.swarm.insert(addr, PeerOrigin::Tracker);
      }
    }
    if demote && self.trackers.len() > 1 {
      log::info!("Demoting tracker {}", url);
      let entry = self.trackers.remove(position);
      self.trackers.push(entry);
    }
  }

  /// Fires an event-bearing announce at every tracker, regardless of
  /// schedule. Used for `stopped` and `completed`.
  fn announce_all(&mut self, event: Option<Event>) {
    let urls: Vec<Url> = self
      .trackers
      .iter()
      .filter(|entry| entry.sent_started || event == Some(Event::Stopped))
      .map(|entry| entry.tracker.url().clone())
      .collect();
    for url in urls {
      self.spawn_announce(url, event);
    }
  }

  fn bytes_left(&self) -> u64 {
    let storage = self.ctx.storage.read().unwrap();
    let storage = match storage.as_ref() {
      Some(storage) => storage,
      // metadata still unknown: pretend one block remains so trackers
      // treat us as a leecher
      None => return crate::BLOCK_LEN as u64,
    };
    let picker = self.ctx.piece_picker.read().unwrap();
    let have_count = storage.piece_count - picker.missing_piece_count();
    let mut have_bytes = have_count as u64 * storage.piece_len as u64;
    if picker.have_piece(storage.piece_count.saturating_sub(1)) {
      have_bytes -=
        (storage.piece_len - storage.last_piece_len) as u64;
    }
    storage.download_len.saturating_sub(have_bytes)
  }

  // ------------------------------------------------------------------
  // peers
  // ------------------------------------------------------------------

  /// Dials known addresses until the torrent reaches its connection
  /// target, respecting the engine-wide admission cap.
  fn top_up_connections(&mut self) {
    let target = self.ctx.conf.max_connected_peer_count;
    if self.peers.len() >= target {
      return;
    }
    let want = target - self.peers.len();

    let connected: HashSet<SocketAddr> = self.peers.keys().copied().collect();
    let candidates =
      self.swarm.candidates(want, Instant::now(), &connected);
    if candidates.is_empty() {
      return;
    }
    let connect_timeout = self.connect_timer.timeout();

    for addr in candidates {
      // global admission: dials and accepts share the same counter
      if !self.conn_slots.try_acquire() {
        log::debug!("Engine connection limit reached, not dialing");
        break;
      }
      log::debug!("Dialing peer {}", addr);
      let (mut session, tx) = PeerSession::outbound(Arc::clone(&self.ctx), addr);
      let join =
        task::spawn(
          async move { session.start_outbound(connect_timeout).await },
        );
      self.peers.insert(
        addr,
        PeerHandle {
          tx,
          join: Some(join),
          connected: false,
          state: None,
          metadata_ok: false,
          unchoked: false,
        },
      );
    }
  }

  fn handle_peer_accepted(
    &mut self,
    stream: TcpStream,
    read_buf: bytes::BytesMut,
    handshake: Handshake,
  ) {
    let addr = match stream.peer_addr() {
      Ok(addr) => addr,
      Err(_) => {
        self.conn_slots.release();
        return;
      }
    };
    if !self.is_active
      || self.error.is_some()
      || self.swarm.is_banned(&addr)
      || self.peers.contains_key(&addr)
      || self.peers.len() >= self.ctx.conf.max_connected_peer_count
    {
      log::info!("Refusing inbound peer {}", addr);
      self.conn_slots.release();
      return;
    }

    log::info!("Accepted inbound peer {}", addr);
    self.swarm.insert(addr, PeerOrigin::Accepted);
    let (mut session, tx) = PeerSession::inbound(Arc::clone(&self.ctx), addr);
    let join = task::spawn(async move {
      session.start_inbound(stream, read_buf, handshake).await
    });
    self.peers.insert(
      addr,
      PeerHandle {
        tx,
        join: Some(join),
        connected: false,
        state: None,
        metadata_ok: false,
        unchoked: false,
      },
    );
  }

  fn handle_peer_connected(
    &mut self,
    addr: SocketAddr,
    id: PeerId,
    connect_time: Option<Duration>,
  ) {
    log::info!(
      "Peer {} connected with id {:?}",
      addr,
      String::from_utf8_lossy(&id[..8.min(id.len())])
    );
    if let Some(time) = connect_time {
      self.connect_timer.record(time);
    }
    if let Some(peer) = self.peers.get_mut(&addr) {
      peer.connected = true;
    }
    self.swarm.record_success(addr);
    self
      .alert_tx
      .send(Alert::PeerAdded {
        id: self.ctx.id,
        addr,
      })
      .ok();
  }

  fn handle_peer_disconnected(
    &mut self,
    addr: SocketAddr,
    error: Option<PeerError>,
  ) {
    let peer = match self.peers.remove(&addr) {
      Some(peer) => peer,
      None => return,
    };
    self.conn_slots.release();

    let was_connected = peer.connected;
    match &error {
      Some(PeerError::SelfConnect) => {
        // never dial an address that turned out to be us
        self.swarm.ban(addr, Duration::from_secs(24 * 60 * 60));
      }
      Some(
        PeerError::BitfieldNotAfterHandshake
        | PeerError::InvalidBlockInfo
        | PeerError::InvalidPieceIndex
        | PeerError::InvalidInfoHash
        | PeerError::RequestWhileChoked
        | PeerError::UnknownExtension
        | PeerError::ExtensionCodec(_)
        | PeerError::UploadQueueOverflow,
      ) => {
        self.record_peer_fault(addr, 1);
      }
      Some(PeerError::Io(_)) if !was_connected => {
        // never finished the handshake: unreachable, not hostile
        self
          .swarm
          .record_unreachable(addr, self.ctx.conf.dead_address_cooldown);
      }
      _ => {}
    }

    if let Some(download) = &mut self.metadata_download {
      download.release_peer(addr);
    }
    if was_connected {
      self
        .alert_tx
        .send(Alert::PeerRemoved {
          id: self.ctx.id,
          addr,
        })
        .ok();
    }
  }

  fn record_peer_fault(&mut self, addr: SocketAddr, weight: u32) {
    let banned = self.swarm.record_fault(
      addr,
      weight,
      self.ctx.conf.ban_threshold,
      self.ctx.conf.ban_duration,
    );
    if banned {
      if let Some(peer) = self.peers.get(&addr) {
        peer.tx.send(peer::Command::Shutdown).ok();
      }
    }
  }

  fn handle_peer_state(&mut self, addr: SocketAddr, info: SessionTick) {
    // fold the session's round into the torrent totals
    self.counters.merge(&info.counters);
    let down = info.counters.down.payload.round();
    let up = info.counters.up.payload.round();
    self.downloaded += down;
    self.uploaded += up;
    self.unflushed += down + up;

    if let Some(peer) = self.peers.get_mut(&addr) {
      peer.state = Some(info);
    }
  }

  fn handle_peer_extensions(
    &mut self,
    addr: SocketAddr,
    supports_metadata: bool,
    metadata_size: Option<u32>,
  ) {
    let metadata_ok = if !supports_metadata {
      false
    } else if self.ctx.has_metadata() {
      true
    } else if let Some(size) = metadata_size {
      if self.metadata_download.is_none() {
        // the first peer to announce a size establishes it
        self.metadata_download =
          MetadataDownload::new(self.ctx.info_hash, size as usize);
      }
      // peers announcing a conflicting size are not used for metadata
      self
        .metadata_download
        .as_ref()
        .map(|download| download.size_matches(size as usize))
        .unwrap_or(false)
    } else {
      // supports the extension but has no metadata itself
      false
    };
    if let Some(peer) = self.peers.get_mut(&addr) {
      peer.metadata_ok = metadata_ok;
    }
  }

  // ------------------------------------------------------------------
  // metadata
  // ------------------------------------------------------------------

  /// Rotates timed out metadata requests and keeps willing peers busy
  /// with one piece each.
  fn metadata_tick(&mut self) {
    if self.ctx.has_metadata() {
      return;
    }
    let download = match &mut self.metadata_download {
      Some(download) => download,
      None => return,
    };
    let now = Instant::now();
    download.release_timed_out(now, self.ctx.conf.metadata_request_timeout);

    for (addr, peer) in self.peers.iter() {
      if !peer.connected || !peer.metadata_ok {
        continue;
      }
      match download.next_request(*addr, now) {
        Some(piece) => {
          log::debug!("Requesting metadata piece {} from {}", piece, addr);
          peer
            .tx
            .send(peer::Command::RequestMetadataPiece(piece))
            .ok();
        }
        None => break,
      }
    }
  }

  fn handle_metadata_piece(
    &mut self,
    addr: SocketAddr,
    piece: usize,
    total_size: usize,
    data: &[u8],
  ) {
    if self.ctx.has_metadata() {
      return;
    }
    let download = match &mut self.metadata_download {
      Some(download) => download,
      None => return,
    };
    match download.on_data(piece, total_size, data, addr) {
      DataReceipt::Stored | DataReceipt::Ignored => {}
      DataReceipt::Complete(info_bytes) => {
        self.finish_metadata(info_bytes);
      }
      DataReceipt::HashMismatch { contributors } => {
        log::warn!(
          "Metadata hash mismatch; banning {} contributors",
          contributors.len()
        );
        for addr in contributors {
          self.swarm.ban(addr, self.ctx.conf.ban_duration);
          if let Some(peer) = self.peers.get(&addr) {
            peer.tx.send(peer::Command::Shutdown).ok();
          }
        }
      }
    }
  }

  /// The verified info dictionary is in: initialize the manifest, the
  /// storage geometry, and the picker, through the same path the
  /// `.torrent` flow uses.
  fn finish_metadata(&mut self, info_bytes: Vec<u8>) {
    log::info!("Torrent {} metadata complete", self.ctx.id);
    let trackers: Vec<Url> = self
      .trackers
      .iter()
      .map(|entry| entry.tracker.url().clone())
      .collect();
    let metainfo = match Metainfo::from_info_bytes(&info_bytes, trackers) {
      Ok(metainfo) => metainfo,
      Err(e) => {
        // the hash matched but the contents are unusable
        self.enter_error(format!("invalid metadata: {}", e));
        return;
      }
    };
    if metainfo.piece_len > MAX_PIECE_LEN {
      self.enter_error(format!(
        "piece length {} exceeds the supported maximum",
        metainfo.piece_len
      ));
      return;
    }

    let storage = StorageInfo::new(&metainfo, self.download_dir.clone());
    {
      let mut picker = self.ctx.piece_picker.write().unwrap();
      *picker = PiecePicker::new(bitfield::new(storage.piece_count));
    }
    self.ctx.set_metadata(storage, info_bytes);
    self.name = Some(metainfo.name.clone());
    self.metainfo = Some(metainfo);
    self.metadata_download = None;
    self.dirty = true;

    self.ensure_allocated();
    self
      .alert_tx
      .send(Alert::Metadata { id: self.ctx.id })
      .ok();
    // sessions pick up the new picker on their next tick and register
    // the bitfields their peers sent pre-metadata
  }

  // ------------------------------------------------------------------
  // pieces
  // ------------------------------------------------------------------

  fn handle_piece_completion(&mut self, completion: PieceCompletion) {
    let index = completion.index;
    let download = self.ctx.downloads.write().unwrap().remove(&index);

    if completion.is_valid {
      {
        let mut picker = self.ctx.piece_picker.write().unwrap();
        picker.received_piece(index);
      }
      log::info!("Torrent {} piece {} complete", self.ctx.id, index);
      self.dirty = true;

      for (_, peer) in self.peers.iter() {
        peer.tx.send(peer::Command::PieceCompleted(index)).ok();
      }
      self
        .alert_tx
        .send(Alert::PieceCompleted {
          id: self.ctx.id,
          piece: index,
        })
        .ok();

      let complete = {
        let picker = self.ctx.piece_picker.read().unwrap();
        picker.is_complete()
      };
      if complete {
        log::info!("Torrent {} complete", self.ctx.id);
        self.ctx.in_endgame.store(false, Ordering::Relaxed);
        self.completed_event_pending = true;
        self
          .alert_tx
          .send(Alert::TorrentComplete(self.ctx.id))
          .ok();
        self.announce_all(Some(Event::Completed));
        self.persist();
      }
    } else {
      // hash mismatch: blame whoever contributed and re-request
      log::warn!(
        "Torrent {} piece {} failed its hash check",
        self.ctx.id,
        index
      );
      let contributors = download
        .as_ref()
        .map(|download| download.lock().unwrap().contributors())
        .unwrap_or_default();
      if contributors.len() == 1 {
        // a single peer supplied every block; no doubt who is at fault
        let addr = contributors[0];
        self.swarm.ban(addr, self.ctx.conf.ban_duration);
        if let Some(peer) = self.peers.get(&addr) {
          peer.tx.send(peer::Command::Shutdown).ok();
        }
      } else {
        for addr in contributors {
          self.record_peer_fault(addr, 1);
        }
      }
      let mut picker = self.ctx.piece_picker.write().unwrap();
      picker.abort_download(index);
    }
  }

  // ------------------------------------------------------------------
  // recheck
  // ------------------------------------------------------------------

  fn start_recheck(&mut self) {
    if self.recheck_in_progress || !self.ctx.has_metadata() {
      return;
    }
    log::info!("Torrent {} recheck starting", self.ctx.id);
    // a recheck clears a previous storage error; the re-derived
    // bitfield decides what is actually usable
    self.error = None;
    self.recheck_in_progress = true;
    self.ctx.paused.store(true, Ordering::Relaxed);
    self.ctx.downloads.write().unwrap().clear();
    self.ensure_allocated();
    self
      .ctx
      .disk_tx
      .send(disk::Command::Recheck { id: self.ctx.id })
      .ok();
  }

  fn handle_recheck_done(&mut self, result: Result<Bitfield, ReadError>) {
    self.recheck_in_progress = false;
    self
      .ctx
      .paused
      .store(!self.is_active, Ordering::Relaxed);
    match result {
      Ok(have) => {
        log::info!(
          "Torrent {} recheck found {} pieces",
          self.ctx.id,
          bitfield::cardinality(&have)
        );
        let mut picker = self.ctx.piece_picker.write().unwrap();
        picker.reset_own_pieces(have);
        drop(picker);
        self.dirty = true;
        self.persist();
      }
      Err(e) => {
        self.enter_error(format!("recheck failed: {}", e));
      }
    }
  }

  // ------------------------------------------------------------------
  // scheduling policy
  // ------------------------------------------------------------------

  /// Endgame begins when the remaining unreceived blocks fit within the
  /// swarm's aggregate pipeline capacity.
  fn evaluate_endgame(&mut self) {
    if !self.ctx.has_metadata() {
      return;
    }
    let piece_len = {
      let storage = self.ctx.storage.read().unwrap();
      match storage.as_ref() {
        Some(storage) => storage.piece_len,
        None => return,
      }
    };
    let missing_pieces = {
      let picker = self.ctx.piece_picker.read().unwrap();
      picker.missing_piece_count()
    };
    if missing_pieces == 0 {
      self.ctx.in_endgame.store(false, Ordering::Relaxed);
      return;
    }

    let received_blocks: usize = {
      let downloads = self.ctx.downloads.read().unwrap();
      downloads
        .values()
        .map(|download| download.lock().unwrap().received_block_count())
        .sum()
    };
    let remaining_blocks =
      missing_pieces * block_count(piece_len) - received_blocks;

    let downloading_peers = self
      .peers
      .values()
      .filter(|peer| {
        peer
          .state
          .as_ref()
          .map(|s| !s.state.is_peer_choking)
          .unwrap_or(false)
      })
      .count();
    let capacity = self.ctx.conf.pipeline_depth * downloading_peers.max(1);

    let in_endgame = remaining_blocks <= capacity;
    if in_endgame != self.ctx.in_endgame.load(Ordering::Relaxed) {
      log::info!(
        "Torrent {} endgame: {} ({} blocks left)",
        self.ctx.id,
        in_endgame,
        remaining_blocks
      );
      self.ctx.in_endgame.store(in_endgame, Ordering::Relaxed);
    }
  }

  /// The fixed-slots choke policy: the best recent uploaders to us get
  /// the slots, plus one rotating optimistic slot for discovery.
  fn evaluate_chokes(&mut self) {
    let now = Instant::now();
    if now.saturating_duration_since(self.last_choke_eval)
      < CHOKE_EVAL_INTERVAL
    {
      return;
    }
    self.last_choke_eval = now;

    let rotate_optimistic = now
      .saturating_duration_since(self.last_optimistic_rotate)
      >= self.ctx.conf.optimistic_unchoke_interval;

    // rank interested peers by what they gave us lately
    let mut interested: Vec<(SocketAddr, u64)> = self
      .peers
      .iter()
      .filter_map(|(addr, peer)| {
        let state = peer.state.as_ref()?;
        if state.state.is_peer_interested && peer.connected {
          Some((*addr, state.counters.down.payload.round()))
        } else {
          None
        }
      })
      .collect();
    interested.sort_by_key(|(_, rate)| std::cmp::Reverse(*rate));

    let mut unchoked: HashSet<SocketAddr> = interested
      .iter()
      .take(self.ctx.conf.unchoke_slots)
      .map(|(addr, _)| *addr)
      .collect();

    // the optimistic slot goes to a random other interested peer
    if rotate_optimistic {
      self.last_optimistic_rotate = now;
      use rand::seq::SliceRandom;
      let candidates: Vec<SocketAddr> = interested
        .iter()
        .map(|(addr, _)| *addr)
        .filter(|addr| !unchoked.contains(addr))
        .collect();
      self.optimistic_unchoke =
        candidates.choose(&mut rand::thread_rng()).copied();
    }
    if let Some(addr) = self.optimistic_unchoke {
      if self.peers.contains_key(&addr) {
        unchoked.insert(addr);
      } else {
        self.optimistic_unchoke = None;
      }
    }

    for (addr, peer) in self.peers.iter_mut() {
      let should_unchoke = unchoked.contains(addr);
      if should_unchoke && !peer.unchoked {
        peer.tx.send(peer::Command::Unchoke).ok();
        peer.unchoked = true;
      } else if !should_unchoke && peer.unchoked {
        peer.tx.send(peer::Command::Choke).ok();
        peer.unchoked = false;
      }
    }
  }

  /// Gossips a sample of known addresses to every PEX-capable peer.
  fn send_pex(&mut self) {
    let now = Instant::now();
    if now.saturating_duration_since(self.last_pex) < PEX_INTERVAL {
      return;
    }
    self.last_pex = now;

    for (addr, peer) in self.peers.iter() {
      if !peer.connected {
        continue;
      }
      let sample = self.swarm.pex_sample(*addr, PEX_SAMPLE_LEN);
      if sample.is_empty() {
        continue;
      }
      let msg = PexMsg::added_from(sample.into_iter());
      peer.tx.send(peer::Command::Pex(msg)).ok();
    }
  }

  // ------------------------------------------------------------------
  // state, stats, persistence
  // ------------------------------------------------------------------

  fn enter_error(&mut self, message: String) {
    log::error!("Torrent {} error: {}", self.ctx.id, message);
    self.error = Some(message.clone());
    self.ctx.paused.store(true, Ordering::Relaxed);
    for (_, peer) in self.peers.iter() {
      peer.tx.send(peer::Command::Shutdown).ok();
    }
    self
      .alert_tx
      .send(Alert::TorrentError {
        id: self.ctx.id,
        message,
      })
      .ok();
    self.dirty = true;
  }

  fn activity(&self) -> ActivityState {
    if self.error.is_some() {
      ActivityState::Error
    } else if self.recheck_in_progress {
      ActivityState::Checking
    } else if !self.ctx.has_metadata() {
      ActivityState::Queued
    } else {
      let picker = self.ctx.piece_picker.read().unwrap();
      if picker.is_complete() {
        ActivityState::Seeding
      } else {
        ActivityState::Downloading
      }
    }
  }

  fn emit_stats(&mut self) {
    let (piece_count, missing) = {
      let picker = self.ctx.piece_picker.read().unwrap();
      (picker.piece_count(), picker.missing_piece_count())
    };
    let progress = if piece_count > 0 {
      (piece_count - missing) as f64 / piece_count as f64
    } else {
      0.0
    };
    let stats = TorrentStats {
      activity: self.activity(),
      name: self.name.clone(),
      piece_count,
      missing_piece_count: missing,
      progress,
      // the torrent's own payload traffic over the tick that is about
      // to be closed out
      download_rate: self.counters.down.payload.round(),
      upload_rate: self.counters.up.payload.round(),
      downloaded: self.downloaded,
      uploaded: self.uploaded,
      connected_peer_count: self
        .peers
        .values()
        .filter(|peer| peer.connected)
        .count(),
      known_peer_count: self.swarm.known_count(),
    };
    self
      .alert_tx
      .send(Alert::TorrentStats {
        id: self.ctx.id,
        stats: Box::new(stats),
      })
      .ok();
  }

  /// Builds the persistence record of the current state.
  fn state_record(&self) -> TorrentState {
    let (bitfield_hex, piece_count) = {
      let picker = self.ctx.piece_picker.read().unwrap();
      if picker.piece_count() > 0 {
        (
          Some(bitfield::to_hex(picker.own_pieces())),
          Some(picker.piece_count()),
        )
      } else {
        (None, None)
      }
    };
    TorrentState {
      info_hash: crate::info_hash_hex(&self.ctx.info_hash),
      origin: self.origin.clone(),
      name: self.name.clone(),
      announce: self
        .trackers
        .iter()
        .map(|entry| entry.tracker.url().to_string())
        .collect(),
      is_active: self.is_active,
      downloaded: self.downloaded,
      uploaded: self.uploaded,
      bitfield_hex,
      piece_count,
      info_b64: self.metainfo.as_ref().map(|metainfo| {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        STANDARD.encode(&metainfo.info_bytes)
      }),
    }
  }

  fn persist(&mut self) {
    let record = self.state_record();
    if let Err(e) = self.store.save(&record) {
      log::error!("Failed to persist torrent {}: {}", self.ctx.id, e);
    }
    self.dirty = false;
    self.unflushed = 0;
  }

  /// Winds the torrent down: sessions, a best-effort stopped announce,
  /// and a final persist.
  async fn shutdown(&mut self) {
    log::info!("Torrent {} shutting down", self.ctx.id);
    if self.is_active {
      self.announce_all(Some(Event::Stopped));
    }

    for (_, peer) in self.peers.iter() {
      peer.tx.send(peer::Command::Shutdown).ok();
    }
    let handles: Vec<_> = self
      .peers
      .values_mut()
      .filter_map(|peer| peer.join.take())
      .collect();
    for join in handles {
      join.await.ok();
      self.conn_slots.release();
    }
    self.peers.clear();

    self.persist();
  }
}
