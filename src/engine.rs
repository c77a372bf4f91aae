//! The engine is the top-level coordinator that runs and manages all
//! entities in the torrent engine. The user interacts with it via the
//! [`EngineHandle`], which exposes a restricted public API; the
//! underlying communication method is a [tokio mpsc channel].
//!
//! The engine is spawned as a tokio task and runs in the background: it
//! owns the torrent map, the inbound listener, the global connection
//! admission, the engine-wide rate limiter, and the session store. It
//! runs until an unrecoverable error occurs or until the user sends a
//! shutdown command.

use std::{
  collections::HashMap,
  net::{Ipv4Addr, SocketAddr},
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
  time::Duration,
};

use futures::StreamExt;
use tokio::{
  net::{TcpListener, TcpStream},
  sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
  task,
};
use tokio_util::codec::Framed;
use url::Url;

use crate::{
  alert::{AlertReceiver, AlertSender},
  bandwidth,
  bitfield,
  conf::Conf,
  disk,
  error::{EngineResult, Error},
  logstore::LogStore,
  magnet::MagnetUri,
  metainfo::Metainfo,
  peer::codec::{Handshake, HandshakeCodec},
  store::{
    FsSessionStore, MemorySessionStore, OriginRecord, SessionStore,
    TorrentState,
  },
  torrent::{self, Torrent},
  Bitfield, Sha1Hash, TorrentId,
};

/// The channel through which the user can send commands to the engine.
pub type Sender = UnboundedSender<Command>;
/// The channel on which the engine listens for commands.
type Receiver = UnboundedReceiver<Command>;

/// The engine-wide connection admission counter, shared with every
/// torrent. A torrent may open (or accept) a peer connection iff a slot
/// can be acquired; the acquiring side wins races by virtue of the
/// atomic update.
#[derive(Debug)]
pub struct ConnectionSlots {
  used: AtomicUsize,
  max: AtomicUsize,
}

impl ConnectionSlots {
  pub fn new(max: usize) -> Self {
    Self {
      used: AtomicUsize::new(0),
      max: AtomicUsize::new(max),
    }
  }

  /// Reserves a slot if one is free.
  pub fn try_acquire(&self) -> bool {
    let max = self.max.load(Ordering::Relaxed);
    self
      .used
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
        if used < max {
          Some(used + 1)
        } else {
          None
        }
      })
      .is_ok()
  }

  pub fn release(&self) {
    let previous = self.used.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(previous > 0);
  }

  pub fn used(&self) -> usize {
    self.used.load(Ordering::Relaxed)
  }

  /// Lowering the cap does not close existing connections; they drain
  /// naturally and no new ones are admitted meanwhile.
  pub fn set_max(&self, max: usize) {
    self.max.store(max, Ordering::Relaxed);
  }
}

/// Where a new torrent comes from.
pub enum TorrentSource {
  /// A magnet URI.
  Magnet(Box<MagnetUri>, String),
  /// The raw contents of a `.torrent` file.
  File(Box<Metainfo>, Vec<u8>),
  /// A record loaded from the session store.
  Restore(Box<TorrentState>),
}

/// The commands the engine can receive.
pub enum Command {
  /// Create a new torrent from the given source.
  CreateTorrent {
    id: TorrentId,
    source: TorrentSource,
    start_active: bool,
  },
  /// Forwarded user commands for one torrent.
  StartTorrent(TorrentId),
  StopTorrent(TorrentId),
  RecheckTorrent(TorrentId),
  /// Remove the torrent from the engine, optionally deleting its data
  /// from disk.
  RemoveTorrent {
    id: TorrentId,
    delete_data: bool,
  },
  /// The listener read an inbound peer's handshake; route it to its
  /// torrent.
  InboundPeer {
    stream: TcpStream,
    read_buf: bytes::BytesMut,
    handshake: Handshake,
  },
  SetDownloadLimit(u64),
  SetUploadLimit(u64),
  SetConnectionLimit(usize),
  /// Reply with the persisted state records of all torrents.
  GetTorrentStates(tokio::sync::oneshot::Sender<Vec<TorrentState>>),
  /// Stop all network activity, keeping torrent state for `Resume`.
  Suspend,
  /// Restart the torrents that were active before `Suspend`.
  Resume,
  /// Gracefully shuts down the engine and waits for all its torrents
  /// to do the same.
  Shutdown,
}

/// Spawns the engine as a tokio task.
///
/// The return value is a tuple of an [`EngineHandle`], which may be
/// used to send the engine commands, and an [`AlertReceiver`], to which
/// various components in the engine send alerts of events.
pub fn spawn(conf: Conf) -> EngineResult<(EngineHandle, AlertReceiver)> {
  log::info!("Spawning engine task");

  let (alert_tx, alert_rx) = mpsc::unbounded_channel();
  let log_store = Arc::new(LogStore::default());
  let (mut engine, cmd_tx) = Engine::new(conf, alert_tx)?;
  let join_handle = task::spawn(async move { engine.run().await });

  Ok((
    EngineHandle {
      cmd_tx,
      join_handle: Some(join_handle),
      log_store,
    },
    alert_rx,
  ))
}

/// A running torrent's entry in the engine.
struct TorrentEntry {
  tx: torrent::Sender,
  join: Option<task::JoinHandle<crate::error::TorrentResult<()>>>,
  info_hash: Sha1Hash,
}

struct Engine {
  conf: Conf,
  cmd_rx: Receiver,
  cmd_tx: Sender,
  alert_tx: AlertSender,

  disk_tx: disk::Sender,
  disk_join: Option<disk::JoinHandle>,

  store: Arc<dyn SessionStore>,
  rate_limiter: Arc<bandwidth::Tracker>,
  conn_slots: Arc<ConnectionSlots>,

  torrents: HashMap<TorrentId, TorrentEntry>,
  /// Inbound routing: info hash to torrent id.
  index: HashMap<Sha1Hash, TorrentId>,
  next_torrent_id: TorrentId,

  /// The actual port the listener bound, advertised in handshakes.
  listen_port: u16,
  listener_join: Option<task::JoinHandle<()>>,
}

impl Engine {
  fn new(conf: Conf, alert_tx: AlertSender) -> EngineResult<(Self, Sender)> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (disk_join, disk_tx) = disk::spawn();

    let store: Arc<dyn SessionStore> = match &conf.engine.state_dir {
      Some(dir) => Arc::new(FsSessionStore::new(dir)?),
      None => Arc::new(MemorySessionStore::new()),
    };
    let rate_limiter = Arc::new(bandwidth::Tracker::new(
      conf.engine.download_rate_limit,
      conf.engine.upload_rate_limit,
    ));
    let conn_slots =
      Arc::new(ConnectionSlots::new(conf.engine.max_connection_count));

    Ok((
      Engine {
        conf,
        cmd_rx,
        cmd_tx: cmd_tx.clone(),
        alert_tx,
        disk_tx,
        disk_join: Some(disk_join),
        store,
        rate_limiter,
        conn_slots,
        torrents: HashMap::new(),
        index: HashMap::new(),
        next_torrent_id: 1,
        listen_port: 0,
        listener_join: None,
      },
      cmd_tx,
    ))
  }

  async fn run(&mut self) -> EngineResult<()> {
    log::info!("Starting engine");

    self.start_listener().await?;
    self.replay_saved_torrents();

    while let Some(cmd) = self.cmd_rx.recv().await {
      match cmd {
        Command::CreateTorrent {
          id,
          source,
          start_active,
        } => {
          if let Err(e) = self.create_torrent(id, source, start_active) {
            log::error!("Failed to create torrent {}: {}", id, e);
            self
              .alert_tx
              .send(crate::alert::Alert::TorrentError {
                id,
                message: e.to_string(),
              })
              .ok();
          }
        }
        Command::StartTorrent(id) => {
          self.forward(id, torrent::Command::Start);
        }
        Command::StopTorrent(id) => {
          self.forward(id, torrent::Command::Stop);
        }
        Command::RecheckTorrent(id) => {
          self.forward(id, torrent::Command::Recheck);
        }
        Command::RemoveTorrent { id, delete_data } => {
          self.remove_torrent(id, delete_data);
        }
        Command::InboundPeer {
          stream,
          read_buf,
          handshake,
        } => {
          self.route_inbound_peer(stream, read_buf, handshake);
        }
        Command::SetDownloadLimit(rate) => {
          log::info!("Setting download limit to {} B/s", rate);
          self
            .rate_limiter
            .set_limit(bandwidth::Direction::Down, rate);
        }
        Command::SetUploadLimit(rate) => {
          log::info!("Setting upload limit to {} B/s", rate);
          self.rate_limiter.set_limit(bandwidth::Direction::Up, rate);
        }
        Command::SetConnectionLimit(max) => {
          log::info!("Setting global connection limit to {}", max);
          self.conn_slots.set_max(max);
        }
        Command::GetTorrentStates(reply) => {
          let states = self.store.load_all().unwrap_or_default();
          reply.send(states).ok();
        }
        Command::Suspend => {
          log::info!("Suspending engine");
          for entry in self.torrents.values() {
            entry.tx.send(torrent::Command::Suspend).ok();
          }
        }
        Command::Resume => {
          log::info!("Resuming engine");
          for entry in self.torrents.values() {
            entry.tx.send(torrent::Command::Resume).ok();
          }
        }
        Command::Shutdown => {
          self.shutdown().await?;
          break;
        }
      }
    }

    Ok(())
  }

  /// Opens the inbound listener and spawns its accept loop. Each
  /// accepted socket gets its handshake read by a short-lived task
  /// before being routed, so a slow peer can't stall the loop.
  async fn start_listener(&mut self) -> EngineResult<()> {
    let addr =
      SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), self.conf.engine.listen_port);
    let listener = TcpListener::bind(addr).await?;
    self.listen_port = listener.local_addr()?.port();
    log::info!("Listening for peers on port {}", self.listen_port);

    let cmd_tx = self.cmd_tx.clone();
    self.listener_join = Some(task::spawn(async move {
      loop {
        let (stream, addr) = match listener.accept().await {
          Ok(accepted) => accepted,
          Err(e) => {
            log::warn!("Accept error: {}", e);
            continue;
          }
        };
        log::debug!("Inbound connection from {}", addr);
        let cmd_tx = cmd_tx.clone();
        task::spawn(async move {
          let mut socket = Framed::new(stream, HandshakeCodec);
          let handshake = tokio::time::timeout(
            Duration::from_secs(30),
            socket.next(),
          )
          .await;
          match handshake {
            Ok(Some(Ok(handshake))) => {
              let parts = socket.into_parts();
              cmd_tx
                .send(Command::InboundPeer {
                  stream: parts.io,
                  read_buf: parts.read_buf,
                  handshake,
                })
                .ok();
            }
            _ => {
              log::debug!("Inbound peer {} sent no valid handshake", addr);
            }
          }
        });
      }
    }));
    Ok(())
  }

  /// Loads all persisted torrents back into the engine, in stopped or
  /// active state per their saved user state.
  fn replay_saved_torrents(&mut self) {
    let states = match self.store.load_all() {
      Ok(states) => states,
      Err(e) => {
        log::error!("Failed to load session store: {}", e);
        return;
      }
    };
    log::info!("Restoring {} saved torrents", states.len());
    for state in states {
      let id = self.next_id();
      let start_active = state.is_active;
      if let Err(e) = self.create_torrent(
        id,
        TorrentSource::Restore(Box::new(state)),
        start_active,
      ) {
        log::error!("Failed to restore torrent: {}", e);
      }
    }
  }

  fn next_id(&mut self) -> TorrentId {
    let id = self.next_torrent_id;
    self.next_torrent_id += 1;
    id
  }

  fn forward(&self, id: TorrentId, cmd: torrent::Command) {
    match self.torrents.get(&id) {
      Some(entry) => {
        entry.tx.send(cmd).ok();
      }
      None => log::warn!("Command for unknown torrent {}", id),
    }
  }

  /// Creates and spawns a new torrent from any of the three sources.
  fn create_torrent(
    &mut self,
    id: TorrentId,
    source: TorrentSource,
    start_active: bool,
  ) -> EngineResult<()> {
    let params = self.torrent_params(id, source, start_active)?;

    if self.index.contains_key(&params.info_hash) {
      return Err(Error::TorrentAlreadyExists);
    }

    let info_hash = params.info_hash;
    let (mut torrent, torrent_tx) = Torrent::new(params);
    let join =
      task::spawn(async move { torrent.run(start_active).await });

    self.index.insert(info_hash, id);
    self.torrents.insert(
      id,
      TorrentEntry {
        tx: torrent_tx,
        join: Some(join),
        info_hash,
      },
    );
    Ok(())
  }

  /// Assembles torrent params from a source.
  fn torrent_params(
    &self,
    id: TorrentId,
    source: TorrentSource,
    start_active: bool,
  ) -> EngineResult<torrent::Params> {
    let common = |info_hash,
                  origin,
                  name,
                  announce,
                  peer_hints,
                  metainfo,
                  resume_bitfield,
                  resume_downloaded,
                  resume_uploaded,
                  is_restore| {
      torrent::Params {
        id,
        info_hash,
        client_id: self.conf.engine.client_id,
        conf: self.conf.torrent.clone(),
        disk_tx: self.disk_tx.clone(),
        alert_tx: self.alert_tx.clone(),
        rate_limiter: Arc::clone(&self.rate_limiter),
        conn_slots: Arc::clone(&self.conn_slots),
        store: Arc::clone(&self.store),
        listen_port: self.listen_port,
        download_dir: self.conf.engine.download_dir.clone(),
        origin,
        name,
        announce,
        peer_hints,
        metainfo,
        resume_bitfield,
        resume_downloaded,
        resume_uploaded,
        start_active,
        is_restore,
      }
    };

    match source {
      TorrentSource::Magnet(magnet, uri) => Ok(common(
        magnet.info_hash,
        OriginRecord::Magnet(uri),
        magnet.name.clone(),
        magnet.trackers.clone(),
        magnet.peers.clone(),
        None,
        None,
        0,
        0,
        false,
      )),
      TorrentSource::File(metainfo, raw) => Ok(common(
        metainfo.info_hash,
        OriginRecord::from_torrent_bytes(&raw),
        Some(metainfo.name.clone()),
        metainfo.trackers.clone(),
        Vec::new(),
        Some(*metainfo),
        None,
        0,
        0,
        false,
      )),
      TorrentSource::Restore(state) => {
        let info_hash = state
          .info_hash_bytes()
          .ok_or(Error::CorruptStateRecord)?;
        let announce: Vec<Url> = state
          .announce
          .iter()
          .filter_map(|url| Url::parse(url).ok())
          .collect();

        // hints come back from the original magnet so a magnet-added
        // torrent stopped before its metadata can still bootstrap
        let peer_hints = match &state.origin {
          OriginRecord::Magnet(uri) => MagnetUri::parse(uri)
            .map(|magnet| magnet.peers)
            .unwrap_or_default(),
          OriginRecord::TorrentFile(_) => Vec::new(),
        };

        let metainfo = match state.info_bytes() {
          Some(info) => {
            Some(Metainfo::from_info_bytes(&info, announce.clone())?)
          }
          None => match state.origin.torrent_bytes() {
            Some(bytes) => Some(Metainfo::from_bytes(&bytes)?),
            None => None,
          },
        };

        let resume_bitfield: Option<Bitfield> =
          match (&metainfo, &state.bitfield_hex, state.piece_count) {
            (Some(metainfo), Some(hex), Some(count))
              if count == metainfo.piece_count() =>
            {
              bitfield::from_hex(count, hex)
            }
            _ => None,
          };

        Ok(common(
          info_hash,
          state.origin.clone(),
          state.name.clone(),
          announce,
          peer_hints,
          metainfo,
          resume_bitfield,
          state.downloaded,
          state.uploaded,
          true,
        ))
      }
    }
  }

  fn remove_torrent(&mut self, id: TorrentId, delete_data: bool) {
    let entry = match self.torrents.remove(&id) {
      Some(entry) => entry,
      None => {
        log::warn!("Remove for unknown torrent {}", id);
        return;
      }
    };
    log::info!("Removing torrent {}", id);
    self.index.remove(&entry.info_hash);
    if let Err(e) = self.store.remove(&entry.info_hash) {
      log::warn!("Failed to remove torrent {} state: {}", id, e);
    }

    entry.tx.send(torrent::Command::Shutdown).ok();
    let disk_tx = self.disk_tx.clone();
    let mut join = entry.join;
    task::spawn(async move {
      if let Some(join) = join.take() {
        join.await.ok();
      }
      // only delete files once the torrent's sessions are gone
      disk_tx
        .send(disk::Command::RemoveTorrent { id, delete_data })
        .ok();
    });
  }

  /// Routes an accepted connection to the torrent its handshake names,
  /// acquiring a global connection slot on its behalf. Unknown info
  /// hashes and a full engine close the socket by dropping it.
  fn route_inbound_peer(
    &mut self,
    stream: TcpStream,
    read_buf: bytes::BytesMut,
    handshake: Handshake,
  ) {
    let id = match self.index.get(&handshake.info_hash) {
      Some(id) => *id,
      None => {
        log::info!("Inbound peer for unknown torrent, closing");
        return;
      }
    };
    if !self.conn_slots.try_acquire() {
      log::info!("Inbound peer refused: connection limit");
      return;
    }
    match self.torrents.get(&id) {
      Some(entry) => {
        entry
          .tx
          .send(torrent::Command::PeerAccepted {
            stream,
            read_buf,
            handshake,
          })
          .ok();
      }
      None => self.conn_slots.release(),
    }
  }

  async fn shutdown(&mut self) -> EngineResult<()> {
    log::info!("Shutting down engine");

    if let Some(listener) = self.listener_join.take() {
      listener.abort();
    }

    // tell all torrents to shut down and join their tasks
    for entry in self.torrents.values_mut() {
      // the torrent task may no longer be running, so don't panic here
      entry.tx.send(torrent::Command::Shutdown).ok();
    }
    for entry in self.torrents.values_mut() {
      if let Some(join) = entry.join.take() {
        match join.await {
          Ok(Ok(())) => {}
          Ok(Err(e)) => log::error!("Torrent error: {}", e),
          Err(e) => log::error!("Torrent task panicked: {}", e),
        }
      }
    }
    self.torrents.clear();
    self.index.clear();

    // then the disk task
    self.disk_tx.send(disk::Command::Shutdown)?;
    if let Some(join) = self.disk_join.take() {
      join
        .await
        .expect("disk task has panicked")
        .map_err(Error::from)?;
    }

    Ok(())
  }
}

/// A handle to the currently running torrent engine.
pub struct EngineHandle {
  cmd_tx: Sender,
  join_handle: Option<task::JoinHandle<EngineResult<()>>>,
  log_store: Arc<LogStore>,
}

impl EngineHandle {
  /// Adds a torrent from a magnet URI and returns its id. The torrent
  /// starts active unless `start_active` says otherwise.
  pub fn add_magnet(
    &self,
    uri: &str,
    start_active: bool,
  ) -> EngineResult<TorrentId> {
    let magnet = MagnetUri::parse(uri)?;
    self.add(
      TorrentSource::Magnet(Box::new(magnet), uri.to_string()),
      start_active,
    )
  }

  /// Adds a torrent from the raw bytes of a `.torrent` file.
  pub fn add_torrent_file(
    &self,
    bytes: &[u8],
    start_active: bool,
  ) -> EngineResult<TorrentId> {
    let metainfo = Metainfo::from_bytes(bytes)?;
    self.add(
      TorrentSource::File(Box::new(metainfo), bytes.to_vec()),
      start_active,
    )
  }

  fn add(
    &self,
    source: TorrentSource,
    start_active: bool,
  ) -> EngineResult<TorrentId> {
    // ids are only handed out here and in the engine's restore path,
    // which runs before any user command is processed
    static NEXT_ID: AtomicUsize = AtomicUsize::new(1 << 16);
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed) as TorrentId;
    self.cmd_tx.send(Command::CreateTorrent {
      id,
      source,
      start_active,
    })?;
    Ok(id)
  }

  pub fn start_torrent(&self, id: TorrentId) -> EngineResult<()> {
    Ok(self.cmd_tx.send(Command::StartTorrent(id))?)
  }

  pub fn stop_torrent(&self, id: TorrentId) -> EngineResult<()> {
    Ok(self.cmd_tx.send(Command::StopTorrent(id))?)
  }

  pub fn recheck_torrent(&self, id: TorrentId) -> EngineResult<()> {
    Ok(self.cmd_tx.send(Command::RecheckTorrent(id))?)
  }

  pub fn remove_torrent(
    &self,
    id: TorrentId,
    delete_data: bool,
  ) -> EngineResult<()> {
    Ok(self.cmd_tx.send(Command::RemoveTorrent { id, delete_data })?)
  }

  pub fn set_download_limit(&self, bytes_per_s: u64) -> EngineResult<()> {
    Ok(self.cmd_tx.send(Command::SetDownloadLimit(bytes_per_s))?)
  }

  pub fn set_upload_limit(&self, bytes_per_s: u64) -> EngineResult<()> {
    Ok(self.cmd_tx.send(Command::SetUploadLimit(bytes_per_s))?)
  }

  pub fn set_connection_limit(&self, max: usize) -> EngineResult<()> {
    Ok(self.cmd_tx.send(Command::SetConnectionLimit(max))?)
  }

  /// The persisted state records of all torrents in the engine.
  pub async fn torrent_states(&self) -> EngineResult<Vec<TorrentState>> {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    self.cmd_tx.send(Command::GetTorrentStates(reply_tx))?;
    reply_rx.await.map_err(|_| Error::Channel)
  }

  /// The engine's bounded log buffer. It only fills if the embedder
  /// installs it (or a logger delegating to it) as the `log` sink.
  pub fn log_store(&self) -> Arc<LogStore> {
    Arc::clone(&self.log_store)
  }

  /// Stops all network activity while keeping torrent state, for when
  /// the embedding environment backgrounds us.
  pub fn suspend(&self) -> EngineResult<()> {
    Ok(self.cmd_tx.send(Command::Suspend)?)
  }

  /// Restarts the torrents that were active before [`Self::suspend`].
  pub fn resume(&self) -> EngineResult<()> {
    Ok(self.cmd_tx.send(Command::Resume)?)
  }

  /// Gracefully shuts down the engine and waits for all its torrents
  /// to do the same.
  ///
  /// # Panics
  ///
  /// This method panics if the engine has already been shut down.
  pub async fn shutdown(mut self) -> EngineResult<()> {
    log::trace!("Shutting down engine task");
    self.cmd_tx.send(Command::Shutdown)?;
    if let Err(e) = self
      .join_handle
      .take()
      .expect("engine already shut down")
      .await
      .expect("task error")
    {
      log::error!("Engine error: {}", e);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_connection_slots() {
    let slots = ConnectionSlots::new(2);
    assert!(slots.try_acquire());
    assert!(slots.try_acquire());
    assert!(!slots.try_acquire());
    assert_eq!(slots.used(), 2);

    slots.release();
    assert!(slots.try_acquire());

    // lowering the cap below usage admits nothing new
    slots.set_max(1);
    assert!(!slots.try_acquire());
    slots.release();
    slots.release();
    assert!(slots.try_acquire());
  }
}
