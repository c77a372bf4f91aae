/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The 20 byte SHA-1 of a torrent's bencoded info dictionary, used as its
/// globally unique identifier.
pub type InfoHash = Sha1Hash;

/// The peer ID is an arbitrary 20 byte string.
///
/// [`Guidelines for choosing a peer ID`](http://bittorrent.org/beps/bep_0020.html).
pub type PeerId = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least
/// significant bits, that is, where the highest bit represents the first
/// piece, the second highest the second piece, and so on (the BitTorrent
/// wire convention). A truthy boolean value of a piece's position in this
/// vector means that the peer has the piece, while a falsy value means it
/// doesn't have the piece.
pub type Bitfield = bitvec::prelude::BitVec<u8, bitvec::prelude::Msb0>;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in
/// the source code we use `usize` to be consistent with other index types
/// in Rust.
pub type PieceIndex = usize;

/// The type of a file's index within a torrent.
pub type FileIndex = usize;

/// Each torrent gets an engine-unique id when it is added.
pub type TorrentId = u32;

/// This is the only block length we're dealing with (except for possibly
/// the last block). It is the widely used and accepted 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// Returns the hex string form of an info hash, used to key torrents in
/// the session store and in logs.
pub fn info_hash_hex(info_hash: &Sha1Hash) -> String {
  hex::encode(info_hash)
}
