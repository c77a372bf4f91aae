pub use serde_bencode::Error as BencodeError;

pub(crate) type Result<T> = std::result::Result<T, MetainfoError>;

#[derive(thiserror::Error, Debug)]
pub enum MetainfoError {
  #[error("{0}")]
  Bencode(BencodeError),

  #[error("invalid metainfo")]
  InvalidMetainfo,

  #[error("invalid pieces")]
  InvalidPieces,

  #[error("invalid tracker url")]
  InvalidTrackerUrl,
}

impl From<BencodeError> for MetainfoError {
  fn from(error: BencodeError) -> Self {
    Self::Bencode(error)
  }
}

impl From<url::ParseError> for MetainfoError {
  fn from(_: url::ParseError) -> Self {
    Self::InvalidTrackerUrl
  }
}
