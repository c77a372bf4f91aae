//! The disk task: the torrents' content storage layer.
//!
//! A single task owns all torrents' write buffers, file handles, and
//! read caches. Sessions send it blocks to persist and read requests to
//! serve; verification and file IO run on the blocking thread pool and
//! results flow back to the torrents and sessions via their command
//! channels. A piece only ever reaches a file after its SHA-1 matched
//! the manifest.

use std::collections::HashMap;

use tokio::{
  sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
  task,
};

use crate::{
  blockinfo::BlockInfo, error::*, peer, storage_info::StorageInfo, torrent,
  TorrentId,
};

pub mod io;

use io::torrent::Torrent;

pub type JoinHandle = task::JoinHandle<DiskResult<()>>;

/// The channel for sending commands to the disk task.
pub type Sender = UnboundedSender<Command>;
/// The channel on which the disk task listens for commands.
type Receiver = UnboundedReceiver<Command>;

/// The commands that the disk task executes.
pub enum Command {
  /// Allocate a new torrent in `Disk`: create and open its files. The
  /// allocation result is posted back on `torrent_tx`.
  NewTorrent {
    id: TorrentId,
    storage_info: StorageInfo,
    piece_hashes: Vec<u8>,
    torrent_tx: torrent::Sender,
  },
  /// Request to eventually write a block to disk.
  WriteBlock {
    id: TorrentId,
    block_info: BlockInfo,
    data: Vec<u8>,
  },
  /// Request to eventually read a block from disk and return it via the
  /// sender.
  ReadBlock {
    id: TorrentId,
    block_info: BlockInfo,
    result_tx: peer::Sender,
  },
  /// Re-hash everything on disk and post the fresh bitfield back to the
  /// torrent.
  Recheck { id: TorrentId },
  /// Drop the torrent's entry, optionally deleting its files.
  RemoveTorrent { id: TorrentId, delete_data: bool },
  /// Eventually shut down the disk task.
  Shutdown,
}

/// Spawns the disk task, returning its join handle and command channel.
pub fn spawn() -> (JoinHandle, Sender) {
  log::info!("Spawning disk task");
  let (tx, rx) = mpsc::unbounded_channel();
  let mut disk = Disk {
    torrents: HashMap::new(),
    cmd_rx: rx,
  };
  let join_handle = task::spawn(async move { disk.run().await });
  (join_handle, tx)
}

struct Disk {
  torrents: HashMap<TorrentId, Torrent>,
  cmd_rx: Receiver,
}

impl Disk {
  async fn run(&mut self) -> DiskResult<()> {
    while let Some(cmd) = self.cmd_rx.recv().await {
      match cmd {
        Command::NewTorrent {
          id,
          storage_info,
          piece_hashes,
          torrent_tx,
        } => {
          self.new_torrent(id, storage_info, piece_hashes, torrent_tx);
        }
        Command::WriteBlock {
          id,
          block_info,
          data,
        } => {
          if let Some(torrent) = self.torrents.get_mut(&id) {
            torrent.write_block(block_info, data);
          } else {
            log::warn!("Write for unknown torrent {}", id);
          }
        }
        Command::ReadBlock {
          id,
          block_info,
          result_tx,
        } => {
          if let Some(torrent) = self.torrents.get_mut(&id) {
            match torrent.read_block(block_info).await {
              Ok(block) => {
                result_tx.send(peer::Command::Block(block)).ok();
              }
              Err(error) => {
                log::warn!(
                  "Torrent {} block {} read error: {}",
                  id,
                  block_info,
                  error
                );
                result_tx
                  .send(peer::Command::BlockReadError { block_info, error })
                  .ok();
              }
            }
          }
        }
        Command::Recheck { id } => {
          if let Some(torrent) = self.torrents.get_mut(&id) {
            torrent.recheck();
          }
        }
        Command::RemoveTorrent { id, delete_data } => {
          if let Some(mut torrent) = self.torrents.remove(&id) {
            if delete_data {
              torrent.delete_data();
            }
          }
        }
        Command::Shutdown => {
          log::info!("Shutting down disk task");
          break;
        }
      }
    }
    Ok(())
  }

  fn new_torrent(
    &mut self,
    id: TorrentId,
    storage_info: StorageInfo,
    piece_hashes: Vec<u8>,
    torrent_tx: torrent::Sender,
  ) {
    use std::collections::hash_map::Entry;
    let entry = match self.torrents.entry(id) {
      Entry::Occupied(_) => {
        torrent_tx
          .send(torrent::Command::TorrentAllocation(Err(
            NewTorrentError::AlreadyExists,
          )))
          .ok();
        return;
      }
      Entry::Vacant(entry) => entry,
    };
    match Torrent::new(storage_info, piece_hashes, torrent_tx.clone()) {
      Ok(torrent) => {
        log::info!("Torrent {} allocated on disk", id);
        entry.insert(torrent);
        torrent_tx.send(torrent::Command::TorrentAllocation(Ok(()))).ok();
      }
      Err(e) => {
        log::error!("Error allocating torrent {} on disk: {}", id, e);
        torrent_tx.send(torrent::Command::TorrentAllocation(Err(e))).ok();
      }
    }
  }
}
