use std::io::{self, Cursor};

use bytes::{Buf, BufMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{PeerId, Sha1Hash};

pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The reserved byte carrying the BEP 10 extension protocol flag.
pub const EXTENSION_RESERVED_BYTE: usize = 5;
/// Bit 20 counted from the most significant bit of the reserved field,
/// that is `0x10` in byte 5.
pub const EXTENSION_RESERVED_FLAG: u8 = 0x10;

/// The message sent at the beginning of a peer session by both sides of
/// the connection.
///
/// Handshake data format:
///
/// ```txt
/// <Protocol Identifier length><Protocol Identifier><Reserved><Info hash><Peer id>
/// |       -- 1 byte --       |   -- 19 bytes --   |-8 bytes-|-20 bytes-|-20 bytes-|
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Handshake {
  /// The protocol string, which must equal "BitTorrent protocol", as
  /// otherwise the connection is aborted.
  pub prot: [u8; 19],
  /// The reserved extension flag bits. We always advertise the
  /// extension protocol (bit 20).
  pub reserved: [u8; 8],
  /// The torrent's SHA-1 info hash, used to identify the torrent in the
  /// handshake and to verify the peer.
  pub info_hash: Sha1Hash,
  /// The arbitrary peer id, usually identifying the torrent client.
  pub peer_id: PeerId,
}

impl Handshake {
  /// Creates a new protocol version 1 handshake with the given info hash
  /// and peer id, advertising extension protocol support.
  pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
    let mut prot = [0; 19];
    prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
    let mut reserved = [0; 8];
    reserved[EXTENSION_RESERVED_BYTE] |= EXTENSION_RESERVED_FLAG;
    Handshake {
      prot,
      reserved,
      info_hash,
      peer_id,
    }
  }

  /// Whether the handshake's sender supports the BEP 10 extension
  /// protocol.
  pub fn supports_extensions(&self) -> bool {
    self.reserved[EXTENSION_RESERVED_BYTE] & EXTENSION_RESERVED_FLAG != 0
  }

  /// Returns the length of the handshake, in bytes.
  #[allow(clippy::len_without_is_empty)]
  pub const fn len(&self) -> u64 {
    1 + 19 + 8 + 20 + 20
  }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
  type Error = io::Error;

  fn encode(
    &mut self,
    handshake: Handshake,
    buf: &mut bytes::BytesMut,
  ) -> io::Result<()> {
    let Handshake {
      prot,
      reserved,
      info_hash,
      peer_id,
    } = handshake;

    // protocol length prefix
    debug_assert_eq!(prot.len(), 19);
    buf.put_u8(prot.len() as u8);
    // we should only be sending the bittorrent protocol string
    debug_assert_eq!(prot, PROTOCOL_STRING.as_bytes());

    // payload
    buf.extend_from_slice(&prot);
    buf.extend_from_slice(&reserved);
    buf.extend_from_slice(&info_hash);
    buf.extend_from_slice(&peer_id);

    Ok(())
  }
}

impl Decoder for HandshakeCodec {
  type Item = Handshake;
  type Error = io::Error;

  fn decode(&mut self, buf: &mut bytes::BytesMut) -> io::Result<Option<Handshake>> {
    if buf.is_empty() {
      return Ok(None);
    }

    // `get_*` integer extractors consume the message bytes by advancing
    // buf's internal cursor. However, we don't want to do this yet as at
    // this point we aren't sure we have the full message in the buffer,
    // so we just peek at this value.
    let mut tmp_buf = Cursor::new(&buf);
    let prot_len = tmp_buf.get_u8() as usize;
    if prot_len != PROTOCOL_STRING.len() {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        r#"handshake must start with the string "BitTorrent protocol""#,
      ));
    }

    // check that we got the full payload in the buffer; the length
    // prefix byte itself was not consumed above so account for it
    let payload_len = prot_len + 8 + 20 + 20;
    if buf.remaining() >= 1 + payload_len {
      // we have the full message in the buffer so advance the buffer
      // cursor past the length prefix
      buf.advance(1);
    } else {
      return Ok(None);
    }

    // protocol string
    let mut prot = [0; 19];
    buf.copy_to_slice(&mut prot);
    if prot != PROTOCOL_STRING.as_bytes() {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "invalid protocol string in handshake",
      ));
    }
    // reserved field
    let mut reserved = [0; 8];
    buf.copy_to_slice(&mut reserved);
    // info hash
    let mut info_hash = [0; 20];
    buf.copy_to_slice(&mut info_hash);
    // peer id
    let mut peer_id = [0; 20];
    buf.copy_to_slice(&mut peer_id);

    Ok(Some(Handshake {
      prot,
      reserved,
      info_hash,
      peer_id,
    }))
  }
}
