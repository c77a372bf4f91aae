use std::io::{self, Cursor};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{blockinfo::BlockInfo, Bitfield, BLOCK_LEN};

use super::message::{Message, MessageId};

/// The largest frame we accept: a full block message plus generous slack
/// for extension headers and oversized bitfields. Anything longer is a
/// protocol violation and closes the connection.
const MAX_FRAME_LEN: u32 = BLOCK_LEN + 0x4000;

/// Codec for the length-prefixed peer messages exchanged after the
/// handshake.
///
/// Frame format: `[length: u32 big endian][payload]`, where a zero
/// length is a keep-alive and the first payload byte otherwise is the
/// message id.
pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
  type Error = io::Error;

  fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
    use Message::*;
    match msg {
      KeepAlive => {
        // message length prefix of zero, no payload
        buf.put_u32(0);
      }
      Bitfield(bitfield) => {
        // 1 byte message id and the byte-padded bitfield
        let msg_len = 1 + (bitfield.len() + 7) / 8;
        buf.put_u32(msg_len as u32);
        buf.put_u8(MessageId::Bitfield as u8);
        buf.extend_from_slice(bitfield.as_raw_slice());
      }
      Choke => {
        encode_empty(buf, MessageId::Choke);
      }
      Unchoke => {
        encode_empty(buf, MessageId::Unchoke);
      }
      Interested => {
        encode_empty(buf, MessageId::Interested);
      }
      NotInterested => {
        encode_empty(buf, MessageId::NotInterested);
      }
      Have { piece_index } => {
        let piece_index = piece_index
          .try_into()
          .map_err(|_| invalid_data("piece index overflow"))?;
        // 1 byte message id and 4 byte piece index
        buf.put_u32(1 + 4);
        buf.put_u8(MessageId::Have as u8);
        buf.put_u32(piece_index);
      }
      Request(block) => {
        encode_block_info(buf, MessageId::Request, &block)?;
      }
      Block {
        piece_index,
        offset,
        data,
      } => {
        let piece_index = piece_index
          .try_into()
          .map_err(|_| invalid_data("piece index overflow"))?;
        // 1 byte message id, 4 byte piece index, 4 byte offset, and the
        // block payload
        let msg_len = 1 + 4 + 4 + data.len();
        buf.put_u32(msg_len as u32);
        buf.put_u8(MessageId::Block as u8);
        buf.put_u32(piece_index);
        buf.put_u32(offset);
        buf.extend_from_slice(&data);
      }
      Cancel(block) => {
        encode_block_info(buf, MessageId::Cancel, &block)?;
      }
      Port { port } => {
        buf.put_u32(1 + 2);
        buf.put_u8(MessageId::Port as u8);
        buf.put_u16(port);
      }
      Extended { ext_id, payload } => {
        // 1 byte message id, 1 byte extension id, and the payload
        let msg_len = 1 + 1 + payload.len();
        buf.put_u32(msg_len as u32);
        buf.put_u8(MessageId::Extended as u8);
        buf.put_u8(ext_id);
        buf.extend_from_slice(&payload);
      }
    }
    Ok(())
  }
}

impl Decoder for PeerCodec {
  type Item = Message;
  type Error = io::Error;

  fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
    if buf.remaining() < 4 {
      return Ok(None);
    }

    // peek at the length prefix without advancing the buffer, as the
    // rest of the frame may not have arrived yet
    let mut peek = Cursor::new(&buf);
    let msg_len = peek.get_u32();
    if msg_len > MAX_FRAME_LEN {
      return Err(invalid_data("frame length exceeds the protocol maximum"));
    }

    if buf.remaining() < 4 + msg_len as usize {
      return Ok(None);
    }
    buf.advance(4);

    if msg_len == 0 {
      return Ok(Some(Message::KeepAlive));
    }

    let id = buf.get_u8();
    let id = MessageId::try_from(id)
      .map_err(|id| invalid_data(&format!("unknown message id {}", id)))?;
    let payload_len = msg_len as usize - 1;

    let msg = match id {
      MessageId::Choke => Message::Choke,
      MessageId::Unchoke => Message::Unchoke,
      MessageId::Interested => Message::Interested,
      MessageId::NotInterested => Message::NotInterested,
      MessageId::Have => {
        check_len(payload_len, 4)?;
        Message::Have {
          piece_index: buf.get_u32() as usize,
        }
      }
      MessageId::Bitfield => {
        let raw = buf.copy_to_bytes(payload_len);
        Message::Bitfield(Bitfield::from_vec(raw.to_vec()))
      }
      MessageId::Request => {
        check_len(payload_len, 12)?;
        Message::Request(decode_block_info(buf))
      }
      MessageId::Block => {
        if payload_len < 8 {
          return Err(invalid_data("truncated block message"));
        }
        let piece_index = buf.get_u32() as usize;
        let offset = buf.get_u32();
        let data = buf.copy_to_bytes(payload_len - 8).to_vec();
        Message::Block {
          piece_index,
          offset,
          data: data.into(),
        }
      }
      MessageId::Cancel => {
        check_len(payload_len, 12)?;
        Message::Cancel(decode_block_info(buf))
      }
      MessageId::Port => {
        check_len(payload_len, 2)?;
        Message::Port {
          port: buf.get_u16(),
        }
      }
      MessageId::Extended => {
        if payload_len < 1 {
          return Err(invalid_data("extension message without extension id"));
        }
        let ext_id = buf.get_u8();
        let payload = buf.copy_to_bytes(payload_len - 1).to_vec();
        Message::Extended { ext_id, payload }
      }
    };

    Ok(Some(msg))
  }
}

fn encode_empty(buf: &mut BytesMut, id: MessageId) {
  // 1 byte message id, no payload
  buf.put_u32(1);
  buf.put_u8(id as u8);
}

fn encode_block_info(
  buf: &mut BytesMut,
  id: MessageId,
  block: &BlockInfo,
) -> io::Result<()> {
  let piece_index = block
    .piece_index
    .try_into()
    .map_err(|_| invalid_data("piece index overflow"))?;
  // 1 byte message id, three 4 byte fields
  buf.put_u32(1 + 3 * 4);
  buf.put_u8(id as u8);
  buf.put_u32(piece_index);
  buf.put_u32(block.offset);
  buf.put_u32(block.len);
  Ok(())
}

fn decode_block_info(buf: &mut BytesMut) -> BlockInfo {
  BlockInfo {
    piece_index: buf.get_u32() as usize,
    offset: buf.get_u32(),
    len: buf.get_u32(),
  }
}

fn check_len(actual: usize, expected: usize) -> io::Result<()> {
  if actual != expected {
    Err(invalid_data("message payload has the wrong length"))
  } else {
    Ok(())
  }
}

fn invalid_data(msg: &str) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
