use std::fmt;

use crate::{
  blockinfo::{BlockData, BlockInfo},
  Bitfield, PieceIndex,
};

/// The id of a peer-wire message, the first byte of a non-empty frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
  Choke = 0,
  Unchoke = 1,
  Interested = 2,
  NotInterested = 3,
  Have = 4,
  Bitfield = 5,
  Request = 6,
  Block = 7,
  Cancel = 8,
  Port = 9,
  Extended = 20,
}

impl TryFrom<u8> for MessageId {
  type Error = u8;

  fn try_from(value: u8) -> Result<Self, u8> {
    match value {
      0 => Ok(Self::Choke),
      1 => Ok(Self::Unchoke),
      2 => Ok(Self::Interested),
      3 => Ok(Self::NotInterested),
      4 => Ok(Self::Have),
      5 => Ok(Self::Bitfield),
      6 => Ok(Self::Request),
      7 => Ok(Self::Block),
      8 => Ok(Self::Cancel),
      9 => Ok(Self::Port),
      20 => Ok(Self::Extended),
      other => Err(other),
    }
  }
}

/// The actual messages exchanged by peers after the handshake.
#[derive(Debug, PartialEq)]
#[cfg_attr(test, derive(Clone))]
pub enum Message {
  KeepAlive,
  Bitfield(Bitfield),
  Choke,
  Unchoke,
  Interested,
  NotInterested,
  Have {
    piece_index: PieceIndex,
  },
  Request(BlockInfo),
  Block {
    piece_index: PieceIndex,
    offset: u32,
    data: BlockData,
  },
  Cancel(BlockInfo),
  /// The peer's DHT port. The engine has no DHT, so this is parsed and
  /// dropped.
  Port {
    port: u16,
  },
  /// A BEP 10 extension protocol message: the extension id as mapped by
  /// the extension handshake, followed by its payload.
  Extended {
    ext_id: u8,
    payload: Vec<u8>,
  },
}

impl Message {
  /// Returns the id of the message, or `None` for a keep-alive.
  pub fn id(&self) -> Option<MessageId> {
    match self {
      Self::KeepAlive => None,
      Self::Bitfield(_) => Some(MessageId::Bitfield),
      Self::Choke => Some(MessageId::Choke),
      Self::Unchoke => Some(MessageId::Unchoke),
      Self::Interested => Some(MessageId::Interested),
      Self::NotInterested => Some(MessageId::NotInterested),
      Self::Have { .. } => Some(MessageId::Have),
      Self::Request(_) => Some(MessageId::Request),
      Self::Block { .. } => Some(MessageId::Block),
      Self::Cancel(_) => Some(MessageId::Cancel),
      Self::Port { .. } => Some(MessageId::Port),
      Self::Extended { .. } => Some(MessageId::Extended),
    }
  }

  /// The number of protocol overhead bytes the message costs on the
  /// wire, that is everything except block payload. Used by the
  /// transfer counters.
  pub fn protocol_len(&self) -> u64 {
    match self {
      Self::KeepAlive => 4,
      Self::Bitfield(bitfield) => 4 + 1 + (bitfield.len() as u64 + 7) / 8,
      Self::Choke
      | Self::Unchoke
      | Self::Interested
      | Self::NotInterested => 4 + 1,
      Self::Have { .. } => 4 + 1 + 4,
      Self::Request(_) | Self::Cancel(_) => 4 + 1 + 3 * 4,
      Self::Block { .. } => 4 + 1 + 2 * 4,
      Self::Port { .. } => 4 + 1 + 2,
      Self::Extended { payload, .. } => 4 + 1 + 1 + payload.len() as u64,
    }
  }
}

impl fmt::Display for Message {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.id() {
      Some(id) => write!(f, "{:?}", id),
      None => write!(f, "KeepAlive"),
    }
  }
}
