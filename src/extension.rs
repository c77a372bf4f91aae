//! BEP 10 extension protocol types.
//!
//! After both sides advertise reserved bit 20 in the handshake, they
//! exchange a bencoded extension handshake mapping extension names to
//! the message ids they want to receive them under. We support and
//! advertise `ut_metadata` (BEP 9 metadata exchange), `ut_pex` (BEP 11
//! peer exchange) and `lt_donthave`.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use serde_derive::{Deserialize, Serialize};

use crate::{metainfo::bencode_value_end, PieceIndex};

pub type Result<T, E = serde_bencode::Error> = std::result::Result<T, E>;

/// The extension message id of the extension handshake itself.
pub const EXT_HANDSHAKE_ID: u8 = 0;

/// The ids under which we want to receive the named extensions, as
/// advertised in our handshake's `m` dictionary.
pub const LOCAL_UT_METADATA_ID: u8 = 1;
pub const LOCAL_UT_PEX_ID: u8 = 2;
pub const LOCAL_LT_DONTHAVE_ID: u8 = 3;

pub const UT_METADATA: &str = "ut_metadata";
pub const UT_PEX: &str = "ut_pex";
pub const LT_DONTHAVE: &str = "lt_donthave";

/// The metadata exchange transfers the info dictionary in pieces of this
/// size (the last piece may be shorter).
pub const METADATA_PIECE_LEN: usize = 0x4000;

/// The bencoded dictionary sent as extension message 0 right after the
/// handshake.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionHandshake {
  // fields are declared in bencode key order so the serialized dict
  // comes out canonically sorted

  /// Extension name to message id map. An id of zero disables the
  /// extension.
  #[serde(default)]
  pub m: BTreeMap<String, u8>,

  /// The size of the info dictionary in bytes; sent by peers that have
  /// the metadata and support ut_metadata.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub metadata_size: Option<u32>,

  /// The port we listen on for inbound peers.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub p: Option<u16>,

  /// Client name and version, informational.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub v: Option<String>,
}

impl ExtensionHandshake {
  /// Builds the handshake we send: all supported extensions, our listen
  /// port, and the metadata size if we already have the info dict.
  pub fn ours(listen_port: u16, metadata_size: Option<u32>) -> Self {
    let mut m = BTreeMap::new();
    m.insert(UT_METADATA.into(), LOCAL_UT_METADATA_ID);
    m.insert(UT_PEX.into(), LOCAL_UT_PEX_ID);
    m.insert(LT_DONTHAVE.into(), LOCAL_LT_DONTHAVE_ID);
    Self {
      m,
      p: Some(listen_port),
      v: Some(concat!("riptide ", env!("CARGO_PKG_VERSION")).into()),
      metadata_size,
    }
  }

  /// The id the remote wants to receive the named extension under, if
  /// it supports it.
  pub fn remote_id(&self, name: &str) -> Option<u8> {
    match self.m.get(name) {
      // zero disables the extension
      Some(0) | None => None,
      Some(id) => Some(*id),
    }
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    serde_bencode::to_bytes(self)
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
    serde_bencode::from_bytes(bytes)
  }
}

/// A BEP 9 metadata exchange message.
#[derive(Clone, Debug, PartialEq)]
pub enum UtMetadataMsg {
  Request {
    piece: usize,
  },
  Data {
    piece: usize,
    /// The total size of the info dictionary in bytes.
    total_size: usize,
    payload: Vec<u8>,
  },
  Reject {
    piece: usize,
  },
}

/// The serde mirror of the ut_metadata header dictionary.
#[derive(Debug, Serialize, Deserialize)]
struct UtMetadataHeader {
  msg_type: u8,
  piece: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  total_size: Option<usize>,
}

const UT_METADATA_REQUEST: u8 = 0;
const UT_METADATA_DATA: u8 = 1;
const UT_METADATA_REJECT: u8 = 2;

impl UtMetadataMsg {
  /// Encodes the message: the bencoded header dictionary with the raw
  /// metadata piece appended for data messages.
  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    let (header, payload) = match self {
      Self::Request { piece } => (
        UtMetadataHeader {
          msg_type: UT_METADATA_REQUEST,
          piece: *piece,
          total_size: None,
        },
        None,
      ),
      Self::Data {
        piece,
        total_size,
        payload,
      } => (
        UtMetadataHeader {
          msg_type: UT_METADATA_DATA,
          piece: *piece,
          total_size: Some(*total_size),
        },
        Some(payload),
      ),
      Self::Reject { piece } => (
        UtMetadataHeader {
          msg_type: UT_METADATA_REJECT,
          piece: *piece,
          total_size: None,
        },
        None,
      ),
    };
    let mut bytes = serde_bencode::to_bytes(&header)?;
    if let Some(payload) = payload {
      bytes.extend_from_slice(payload);
    }
    Ok(bytes)
  }

  /// Decodes a message: parses the header dictionary and, for data
  /// messages, slices off whatever trails it as the metadata piece.
  pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
    let header_end = bencode_value_end(bytes, 0).ok_or_else(|| {
      serde_bencode::Error::Custom("truncated ut_metadata header".into())
    })?;
    let header: UtMetadataHeader =
      serde_bencode::from_bytes(&bytes[..header_end])?;
    match header.msg_type {
      UT_METADATA_REQUEST => Ok(Self::Request {
        piece: header.piece,
      }),
      UT_METADATA_DATA => Ok(Self::Data {
        piece: header.piece,
        total_size: header.total_size.unwrap_or(0),
        payload: bytes[header_end..].to_vec(),
      }),
      UT_METADATA_REJECT => Ok(Self::Reject {
        piece: header.piece,
      }),
      other => Err(serde_bencode::Error::Custom(format!(
        "unknown ut_metadata message type {}",
        other
      ))),
    }
  }
}

/// A BEP 11 peer exchange message with compact peer lists.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PexMsg {
  /// Peers that joined the swarm, 6 bytes each (IPv4 + port).
  #[serde(default, with = "serde_bytes", skip_serializing_if = "Vec::is_empty")]
  pub added: Vec<u8>,

  /// Flag byte per added peer; carried through but unused.
  #[serde(
    default,
    rename = "added.f",
    with = "serde_bytes",
    skip_serializing_if = "Vec::is_empty"
  )]
  pub added_f: Vec<u8>,

  /// Peers that joined, 18 bytes each (IPv6 + port).
  #[serde(default, with = "serde_bytes", skip_serializing_if = "Vec::is_empty")]
  pub added6: Vec<u8>,

  /// Peers that left the swarm, 6 bytes each.
  #[serde(default, with = "serde_bytes", skip_serializing_if = "Vec::is_empty")]
  pub dropped: Vec<u8>,
}

impl PexMsg {
  /// Builds a message announcing the given peers as added.
  pub fn added_from(addrs: impl Iterator<Item = SocketAddr>) -> Self {
    let mut msg = Self::default();
    for addr in addrs {
      match addr.ip() {
        IpAddr::V4(ip) => {
          msg.added.extend_from_slice(&ip.octets());
          msg.added.extend_from_slice(&addr.port().to_be_bytes());
          msg.added_f.push(0);
        }
        IpAddr::V6(ip) => {
          msg.added6.extend_from_slice(&ip.octets());
          msg.added6.extend_from_slice(&addr.port().to_be_bytes());
        }
      }
    }
    msg
  }

  /// The added peers as socket addresses. Malformed tails are dropped.
  pub fn added_addrs(&self) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();
    for entry in self.added.chunks_exact(6) {
      let mut ip = [0u8; 4];
      ip.copy_from_slice(&entry[..4]);
      let port = u16::from_be_bytes([entry[4], entry[5]]);
      addrs.push(SocketAddr::new(IpAddr::from(ip), port));
    }
    for entry in self.added6.chunks_exact(18) {
      let mut ip = [0u8; 16];
      ip.copy_from_slice(&entry[..16]);
      let port = u16::from_be_bytes([entry[16], entry[17]]);
      addrs.push(SocketAddr::new(IpAddr::from(ip), port));
    }
    addrs
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    serde_bencode::to_bytes(self)
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
    serde_bencode::from_bytes(bytes)
  }
}

/// Encodes an lt_donthave payload: the piece index the peer no longer
/// has.
pub fn encode_donthave(piece_index: PieceIndex) -> Vec<u8> {
  (piece_index as u32).to_be_bytes().to_vec()
}

/// Decodes an lt_donthave payload.
pub fn decode_donthave(payload: &[u8]) -> Option<PieceIndex> {
  let bytes: [u8; 4] = payload.try_into().ok()?;
  Some(u32::from_be_bytes(bytes) as PieceIndex)
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn test_handshake_round_trip() {
    let ours = ExtensionHandshake::ours(6881, Some(12345));
    let bytes = ours.to_bytes().unwrap();
    let parsed = ExtensionHandshake::from_bytes(&bytes).unwrap();
    assert_eq!(parsed, ours);
    assert_eq!(parsed.remote_id(UT_METADATA), Some(LOCAL_UT_METADATA_ID));
    assert_eq!(parsed.remote_id(UT_PEX), Some(LOCAL_UT_PEX_ID));
    assert_eq!(parsed.remote_id(LT_DONTHAVE), Some(LOCAL_LT_DONTHAVE_ID));
    assert_eq!(parsed.p, Some(6881));
    assert_eq!(parsed.metadata_size, Some(12345));
  }

  #[test]
  fn test_handshake_foreign_dict() {
    // a dict a real client might send, with keys we don't know
    let bytes =
      b"d1:md11:lt_donthavei5e11:ut_metadatai3e6:ut_pexi0ee13:metadata_sizei31235e1:pi51413e4:reqqi500e1:v13:transmissionse";
    let parsed = ExtensionHandshake::from_bytes(&bytes[..]).unwrap();
    assert_eq!(parsed.remote_id(UT_METADATA), Some(3));
    // id zero means the extension is off
    assert_eq!(parsed.remote_id(UT_PEX), None);
    assert_eq!(parsed.remote_id(LT_DONTHAVE), Some(5));
    assert_eq!(parsed.metadata_size, Some(31235));
    assert_eq!(parsed.p, Some(51413));
  }

  #[test]
  fn test_ut_metadata_request_round_trip() {
    let msg = UtMetadataMsg::Request { piece: 3 };
    let bytes = msg.to_bytes().unwrap();
    assert_eq!(&bytes, b"d8:msg_typei0e5:piecei3ee");
    assert_eq!(UtMetadataMsg::from_bytes(&bytes).unwrap(), msg);
  }

  #[test]
  fn test_ut_metadata_data_carries_trailing_payload() {
    let payload = vec![0xabu8; 100];
    let msg = UtMetadataMsg::Data {
      piece: 1,
      total_size: 100,
      payload: payload.clone(),
    };
    let bytes = msg.to_bytes().unwrap();
    // the header dict is followed by the raw piece bytes
    assert!(bytes.starts_with(b"d8:msg_typei1e5:piecei1e10:total_sizei100ee"));
    assert!(bytes.ends_with(&payload));
    assert_eq!(UtMetadataMsg::from_bytes(&bytes).unwrap(), msg);
  }

  #[test]
  fn test_ut_metadata_reject_round_trip() {
    let msg = UtMetadataMsg::Reject { piece: 7 };
    let bytes = msg.to_bytes().unwrap();
    assert_eq!(UtMetadataMsg::from_bytes(&bytes).unwrap(), msg);
  }

  #[test]
  fn test_ut_metadata_rejects_garbage() {
    assert!(UtMetadataMsg::from_bytes(b"").is_err());
    assert!(UtMetadataMsg::from_bytes(b"d8:msg_typei9e5:piecei0ee").is_err());
  }

  #[test]
  fn test_pex_round_trip() {
    let v4: SocketAddr = "10.0.0.1:6881".parse().unwrap();
    let v6: SocketAddr = "[2001:db8::1]:51413".parse().unwrap();
    let msg = PexMsg::added_from([v4, v6].into_iter());
    let bytes = msg.to_bytes().unwrap();
    let parsed = PexMsg::from_bytes(&bytes).unwrap();
    assert_eq!(parsed.added_addrs(), vec![v4, v6]);
  }

  #[test]
  fn test_pex_drops_malformed_tail() {
    let msg = PexMsg {
      // 6 valid bytes and a truncated seventh entry byte
      added: vec![127, 0, 0, 1, 0x1a, 0xe1, 9],
      ..Default::default()
    };
    let addrs = msg.added_addrs();
    assert_eq!(addrs.len(), 1);
    assert_eq!(addrs[0], "127.0.0.1:6881".parse().unwrap());
  }

  #[test]
  fn test_donthave_round_trip() {
    let bytes = encode_donthave(42);
    assert_eq!(bytes, vec![0, 0, 0, 42]);
    assert_eq!(decode_donthave(&bytes), Some(42));
    assert_eq!(decode_donthave(&bytes[..3]), None);
  }
}
