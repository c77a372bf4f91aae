use crate::error::metainfo::BencodeError;
use reqwest::Error as HttpError;

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
  #[error("{0}")]
  Bencode(BencodeError),

  #[error("{0}")]
  Http(HttpError),

  #[error("{0}")]
  Io(std::io::Error),

  #[error("tracker url has no usable host")]
  InvalidUrl,

  #[error("udp tracker transaction id mismatch")]
  /// The transaction id in the tracker's reply did not match the one we
  /// sent.
  TransactionMismatch,

  #[error("udp tracker sent a truncated or malformed packet")]
  MalformedResponse,

  #[error("tracker timed out")]
  /// All retransmits of a UDP request went unanswered.
  Timeout,

  #[error("tracker failure: {0}")]
  /// The tracker answered with an explicit failure reason.
  Failure(String),
}

impl From<BencodeError> for TrackerError {
  fn from(value: BencodeError) -> Self {
    Self::Bencode(value)
  }
}

impl From<HttpError> for TrackerError {
  fn from(value: HttpError) -> Self {
    Self::Http(value)
  }
}

impl From<std::io::Error> for TrackerError {
  fn from(value: std::io::Error) -> Self {
    Self::Io(value)
  }
}
