use tokio::io::Error as IoError;
use tokio::sync::mpsc::error::SendError;

pub type Result<T, E = TorrentError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
  #[error("channel error")]
  /// The channel on which some component in engine was listening or
  /// sending died.
  Channel,

  #[error("missing download root")]
  /// The torrent was started without a usable download directory.
  Config,

  #[error("storage failure: {0}")]
  /// A write to the content storage failed; the torrent enters the
  /// error state.
  Storage(String),

  #[error("piece length {0} exceeds the supported maximum")]
  /// The piece length announced in the metadata is larger than the
  /// engine supports.
  UnsupportedPieceSize(u32),

  #[error("{0}")]
  /// An IO error occurred.
  Io(std::io::Error),
}

impl From<IoError> for TorrentError {
  fn from(value: IoError) -> Self {
    Self::Io(value)
  }
}

impl<T> From<SendError<T>> for TorrentError {
  fn from(_: SendError<T>) -> Self {
    Self::Channel
  }
}
