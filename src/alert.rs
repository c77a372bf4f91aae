//! The alerts the API user may receive from the torrent engine.
//!
//! Alerts are pushed over an unbounded [`tokio::sync::mpsc`] channel;
//! the application embedding the engine may be driven partly or
//! entirely by them. Alerts are one-way: the engine never blocks on the
//! receiver.

use std::net::SocketAddr;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{torrent::stats::TorrentStats, PieceIndex, TorrentId};

pub type AlertSender = UnboundedSender<Alert>;
/// The receiver end handed to the embedder.
pub type AlertReceiver = UnboundedReceiver<Alert>;

/// The events the engine and its torrents emit.
#[derive(Debug)]
pub enum Alert {
  /// A torrent added from a magnet link acquired and verified its
  /// metadata.
  Metadata { id: TorrentId },
  /// A piece was verified against the manifest and written to storage.
  PieceCompleted { id: TorrentId, piece: PieceIndex },
  /// All of a torrent's pieces are verified and stored.
  TorrentComplete(TorrentId),
  /// The torrent entered the error state.
  TorrentError { id: TorrentId, message: String },
  /// A peer connection completed its handshake.
  PeerAdded { id: TorrentId, addr: SocketAddr },
  /// A peer connection went away.
  PeerRemoved { id: TorrentId, addr: SocketAddr },
  /// Periodic per-torrent statistics.
  TorrentStats {
    id: TorrentId,
    stats: Box<TorrentStats>,
  },
}
