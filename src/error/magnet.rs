#[derive(thiserror::Error, Debug)]
pub enum MagnetError {
  #[error("not a magnet uri")]
  NotMagnet,

  #[error("magnet uri has no btih exact topic")]
  /// The `xt` parameter is missing or is not a `urn:btih` topic.
  MissingTopic,

  #[error("invalid info hash encoding")]
  /// The btih value is neither 40 hex characters nor 32 base32
  /// characters.
  InvalidInfoHash,
}

impl From<url::ParseError> for MagnetError {
  fn from(_: url::ParseError) -> Self {
    Self::NotMagnet
  }
}
