//! Helpers over the wire-order piece bitfield.
//!
//! The engine persists bitfields as hex strings and receives them off the
//! wire with byte-granular padding, so the helpers here take care to keep
//! the invariant that bits beyond the piece count are always zero.

use crate::Bitfield;

/// Creates an all-zero bitfield for the given number of pieces.
pub fn new(piece_count: usize) -> Bitfield {
  Bitfield::repeat(false, piece_count)
}

/// Returns the number of set bits.
///
/// This delegates to the word-wise popcount of the underlying storage, so
/// it is linear in bytes, not bits.
pub fn cardinality(bitfield: &Bitfield) -> usize {
  bitfield.count_ones()
}

/// Encodes the bitfield as a hex string of its wire representation.
///
/// Trailing bits in the last byte beyond the logical length are masked to
/// zero so that the encoding is canonical.
pub fn to_hex(bitfield: &Bitfield) -> String {
  let mut bytes = bitfield.as_raw_slice().to_vec();
  mask_trailing(&mut bytes, bitfield.len());
  hex::encode(bytes)
}

/// Decodes a bitfield of `piece_count` bits from its hex form.
///
/// Returns `None` if the string is not valid hex, if the byte length does
/// not match the piece count, or if padding bits beyond the piece count
/// are set.
pub fn from_hex(piece_count: usize, hex_str: &str) -> Option<Bitfield> {
  let bytes = hex::decode(hex_str).ok()?;
  if bytes.len() != (piece_count + 7) / 8 {
    return None;
  }
  let mut canonical = bytes.clone();
  mask_trailing(&mut canonical, piece_count);
  if canonical != bytes {
    return None;
  }
  let mut bitfield = Bitfield::from_vec(bytes);
  bitfield.truncate(piece_count);
  Some(bitfield)
}

fn mask_trailing(bytes: &mut [u8], bit_len: usize) {
  let used = bit_len % 8;
  if used != 0 {
    if let Some(last) = bytes.last_mut() {
      *last &= 0xffu8 << (8 - used);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_new_is_empty() {
    let bf = new(11);
    assert_eq!(bf.len(), 11);
    assert_eq!(cardinality(&bf), 0);
  }

  #[test]
  fn test_cardinality() {
    let mut bf = new(20);
    bf.set(0, true);
    bf.set(7, true);
    bf.set(19, true);
    assert_eq!(cardinality(&bf), 3);
  }

  #[test]
  fn test_msb_first_encoding() {
    // bit 0 must land in the most significant bit of byte 0
    let mut bf = new(9);
    bf.set(0, true);
    assert_eq!(to_hex(&bf), "8000");
    bf.set(8, true);
    assert_eq!(to_hex(&bf), "8080");
  }

  #[test]
  fn test_hex_round_trip() {
    for piece_count in [1usize, 7, 8, 9, 63, 64, 65, 123] {
      let mut bf = new(piece_count);
      // a fixed but irregular pattern
      for i in (0..piece_count).step_by(3) {
        bf.set(i, true);
      }
      let hex = to_hex(&bf);
      let decoded =
        from_hex(piece_count, &hex).expect("round trip must succeed");
      assert_eq!(decoded, bf, "piece count {}", piece_count);
    }
  }

  #[test]
  fn test_from_hex_rejects_bad_input() {
    // not hex at all
    assert!(from_hex(8, "zz").is_none());
    // wrong length for the piece count
    assert!(from_hex(16, "ff").is_none());
    // padding bits beyond the piece count set
    assert!(from_hex(4, "0f").is_none());
    // same byte is fine when all set bits are within range
    assert!(from_hex(4, "f0").is_some());
  }
}
