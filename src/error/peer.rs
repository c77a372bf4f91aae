pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};

pub type Result<T, E = PeerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
  #[error("received unexpected bitfield")]
  /// The bitfield message was not sent directly after the handshake.
  /// According to the protocol, it should only be accepted right after
  /// the handshake; received at any other time, the connection is
  /// severed.
  BitfieldNotAfterHandshake,

  #[error("channel error")]
  /// The channel on which some component in engine was listening or
  /// sending died.
  Channel,

  #[error("choked peer sent request")]
  /// Peers are not allowed to request blocks while they are choked. If
  /// they do so, their connection is severed.
  RequestWhileChoked,

  #[error("inactivity timeout")]
  /// The peer went silent for longer than the inactivity timeout.
  InactivityTimeout,

  #[error("invalid block info")]
  /// The block information the peer sent is invalid.
  InvalidBlockInfo,

  #[error("invalid piece index")]
  /// The block's piece index is invalid.
  InvalidPieceIndex,

  #[error("invalid info hash")]
  /// Peer's torrent info hash did not match ours.
  InvalidInfoHash,

  #[error("connected to ourselves")]
  /// The remote handshake carried our own peer id.
  SelfConnect,

  #[error("peer sent a message for an extension it did not advertise")]
  /// An extension message arrived with an id that was never negotiated
  /// in the extension handshake.
  UnknownExtension,

  #[error("malformed extension payload: {0}")]
  /// An extension message payload failed to parse as bencode.
  ExtensionCodec(serde_bencode::Error),

  #[error("upload queue overflow")]
  /// The peer kept requesting blocks past the bounded upload queue.
  UploadQueueOverflow,

  #[error("{0}")]
  /// An IO error occurred.
  Io(std::io::Error),
}

impl From<IoError> for PeerError {
  fn from(value: IoError) -> Self {
    Self::Io(value)
  }
}

impl<T> From<SendError<T>> for PeerError {
  fn from(_: SendError<T>) -> Self {
    Self::Channel
  }
}

impl From<serde_bencode::Error> for PeerError {
  fn from(value: serde_bencode::Error) -> Self {
    Self::ExtensionCodec(value)
  }
}
