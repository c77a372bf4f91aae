use sha1::{Digest, Sha1};

/// Builds the bencoding of a single file `.torrent` without trackers.
pub fn build_torrent_file(
  name: &str,
  piece_len: usize,
  content: &[u8],
) -> Vec<u8> {
  let mut pieces = Vec::new();
  for piece in content.chunks(piece_len) {
    pieces.extend_from_slice(&Sha1::digest(piece));
  }

  let mut buf = Vec::new();
  buf.extend_from_slice(b"d4:info");
  // info dict keys in bencode order: length, name, piece length, pieces
  buf.extend_from_slice(
    format!(
      "d6:lengthi{}e4:name{}:{}12:piece lengthi{}e",
      content.len(),
      name.len(),
      name,
      piece_len
    )
    .as_bytes(),
  );
  buf.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
  buf.extend_from_slice(&pieces);
  buf.extend_from_slice(b"ee");
  buf
}

/// The byte pattern the swarm scenarios transfer.
pub fn test_content(len: usize) -> Vec<u8> {
  (0..len).map(|i| (i % 256) as u8).collect()
}
