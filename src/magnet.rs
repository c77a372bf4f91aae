//! Magnet URI parsing.
//!
//! Only the `urn:btih` exact topic is supported. Display name, any
//! number of trackers, and any number of `x.pe` peer hints are carried
//! through to the torrent; everything else is ignored.

use std::net::SocketAddr;

use url::Url;

use crate::{error::magnet::MagnetError, Sha1Hash};

pub type Result<T, E = MagnetError> = std::result::Result<T, E>;

/// The parsed form of a `magnet:?xt=urn:btih:...` URI.
#[derive(Clone, Debug)]
pub struct MagnetUri {
  pub info_hash: Sha1Hash,
  /// The display name (`dn`), used as the torrent name until the real
  /// metadata arrives.
  pub name: Option<String>,
  /// Tracker URLs from `tr` parameters, in order.
  pub trackers: Vec<Url>,
  /// Static peer hints from `x.pe` parameters.
  pub peers: Vec<SocketAddr>,
}

impl MagnetUri {
  pub fn parse(uri: &str) -> Result<Self> {
    let url = Url::parse(uri)?;
    if url.scheme() != "magnet" {
      return Err(MagnetError::NotMagnet);
    }

    let mut info_hash = None;
    let mut name = None;
    let mut trackers = Vec::new();
    let mut peers = Vec::new();

    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "xt" => {
          if let Some(encoded) = value.strip_prefix("urn:btih:") {
            // the first valid topic wins; extra topics are ignored
            if info_hash.is_none() {
              info_hash =
                Some(decode_btih(encoded).ok_or(MagnetError::InvalidInfoHash)?);
            }
          }
        }
        "dn" => {
          if name.is_none() {
            name = Some(value.into_owned());
          }
        }
        "tr" => {
          if let Ok(tracker) = Url::parse(&value) {
            trackers.push(tracker);
          } else {
            log::warn!("Skipping unparseable tracker in magnet: {}", value);
          }
        }
        "x.pe" => {
          if let Ok(addr) = value.parse() {
            peers.push(addr);
          } else {
            log::warn!("Skipping unparseable peer hint in magnet: {}", value);
          }
        }
        _ => {}
      }
    }

    Ok(Self {
      info_hash: info_hash.ok_or(MagnetError::MissingTopic)?,
      name,
      trackers,
      peers,
    })
  }
}

/// Decodes the btih topic value: 40 hex characters or 32 base32
/// characters.
fn decode_btih(encoded: &str) -> Option<Sha1Hash> {
  let bytes = match encoded.len() {
    40 => hex::decode(encoded).ok()?,
    32 => base32_decode(encoded)?,
    _ => return None,
  };
  let mut hash = [0; 20];
  hash.copy_from_slice(&bytes);
  Some(hash)
}

/// RFC 4648 base32 without padding, as used by older magnet links.
fn base32_decode(encoded: &str) -> Option<Vec<u8>> {
  let mut acc: u64 = 0;
  let mut bits = 0;
  let mut out = Vec::with_capacity(encoded.len() * 5 / 8);
  for c in encoded.bytes() {
    let value = match c {
      b'A'..=b'Z' => c - b'A',
      b'a'..=b'z' => c - b'a',
      b'2'..=b'7' => c - b'2' + 26,
      _ => return None,
    };
    acc = (acc << 5) | value as u64;
    bits += 5;
    if bits >= 8 {
      bits -= 8;
      out.push((acc >> bits) as u8);
    }
  }
  Some(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  const HASH_HEX: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

  #[test]
  fn test_parse_hex_topic() {
    let uri = format!("magnet:?xt=urn:btih:{}", HASH_HEX);
    let magnet = MagnetUri::parse(&uri).unwrap();
    assert_eq!(hex::encode(magnet.info_hash), HASH_HEX);
    assert!(magnet.name.is_none());
    assert!(magnet.trackers.is_empty());
  }

  #[test]
  fn test_parse_base32_topic() {
    // the same 20 bytes in base32
    let hash = hex::decode(HASH_HEX).unwrap();
    let uri = format!("magnet:?xt=urn:btih:{}", base32_encode(&hash));
    let magnet = MagnetUri::parse(&uri).unwrap();
    assert_eq!(hex::encode(magnet.info_hash), HASH_HEX);
  }

  #[test]
  fn test_parse_full_uri() {
    let uri = format!(
      "magnet:?xt=urn:btih:{}&dn=test%20name\
       &tr=http%3A%2F%2Ftracker.one%2Fannounce\
       &tr=udp%3A%2F%2Ftracker.two%3A6969\
       &x.pe=127.0.0.1:6881&x.pe=10.0.0.2:51413",
      HASH_HEX
    );
    let magnet = MagnetUri::parse(&uri).unwrap();
    assert_eq!(magnet.name.as_deref(), Some("test name"));
    assert_eq!(magnet.trackers.len(), 2);
    assert_eq!(magnet.trackers[0].scheme(), "http");
    assert_eq!(magnet.trackers[1].scheme(), "udp");
    assert_eq!(magnet.peers.len(), 2);
    assert_eq!(magnet.peers[0], "127.0.0.1:6881".parse().unwrap());
  }

  #[test]
  fn test_reject_non_magnet() {
    assert!(matches!(
      MagnetUri::parse("http://example.com"),
      Err(MagnetError::NotMagnet)
    ));
  }

  #[test]
  fn test_reject_missing_or_bad_topic() {
    assert!(matches!(
      MagnetUri::parse("magnet:?dn=name"),
      Err(MagnetError::MissingTopic)
    ));
    assert!(matches!(
      MagnetUri::parse("magnet:?xt=urn:btih:tooshort"),
      Err(MagnetError::InvalidInfoHash)
    ));
  }

  fn base32_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut acc: u64 = 0;
    let mut bits = 0;
    let mut out = String::new();
    for &b in bytes {
      acc = (acc << 8) | b as u64;
      bits += 8;
      while bits >= 5 {
        bits -= 5;
        out.push(ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
      }
    }
    if bits > 0 {
      out.push(ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
  }
}
