//! Set of module Error
pub mod disk;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod torrent;
pub mod tracker;

use std::net::SocketAddr;

pub use disk::{NewTorrentError, ReadError, Result as DiskResult, WriteError};
pub use magnet::MagnetError;
pub use metainfo::MetainfoError;
pub use peer::{PeerError, Result as PeerResult};
pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};
pub use torrent::{Result as TorrentResult, TorrentError};
pub use tracker::{Result as TrackerResult, TrackerError};

use crate::TorrentId;

pub type EngineResult<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
  #[error("channel error")]
  /// The channel on which some component in engine was listening or
  /// sending died.
  Channel,

  #[error("invalid download path")]
  /// The torrent download location is not valid.
  InvalidDownloadPath,

  #[error("invalid torrent id")]
  /// The torrent ID did not correspond to any entry. This is returned
  /// when the user specified a torrent that does not exist.
  InvalidTorrentId,

  #[error("torrent already exists")]
  /// A torrent with the same info hash is already in the engine.
  TorrentAlreadyExists,

  #[error("corrupt session state record")]
  /// A persisted torrent state could not be decoded.
  CorruptStateRecord,

  #[error("{0}")]
  /// The torrent source could not be parsed as a metainfo file.
  Metainfo(MetainfoError),

  #[error("{0}")]
  /// The torrent source could not be parsed as a magnet URI.
  Magnet(MagnetError),

  #[error("{0}")]
  /// Holds global IO related errors.
  Io(IoError),

  #[error("torrent {id} error: {error}")]
  /// An error specific to a torrent.
  Torrent { id: TorrentId, error: TorrentError },

  #[error("torrent {id} tracker error: {error}")]
  /// An error that occurred while a torrent was announcing to a tracker.
  Tracker { id: TorrentId, error: TrackerError },

  #[error("torrent {id} peer {addr} error: {error}")]
  /// An error that occurred in a torrent's session with a peer.
  Peer {
    id: TorrentId,
    addr: SocketAddr,
    error: PeerError,
  },
}

impl From<IoError> for Error {
  fn from(value: IoError) -> Self {
    Self::Io(value)
  }
}

impl<T> From<SendError<T>> for Error {
  fn from(_: SendError<T>) -> Self {
    Self::Channel
  }
}

impl From<MetainfoError> for Error {
  fn from(value: MetainfoError) -> Self {
    Self::Metainfo(value)
  }
}

impl From<MagnetError> for Error {
  fn from(value: MagnetError) -> Self {
    Self::Magnet(value)
  }
}
