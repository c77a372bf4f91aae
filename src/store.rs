//! The session store: persistence of per-torrent state across engine
//! runs.
//!
//! The engine is polymorphic over the store so embedders can supply
//! their own backend; the crate ships a filesystem store writing one
//! JSON record per torrent and an in-memory store for tests. Records
//! round-trip: loading a saved state and re-adding it reconstructs a
//! semantically equivalent torrent.

use std::{
  collections::HashMap,
  io,
  path::PathBuf,
  sync::Mutex,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_derive::{Deserialize, Serialize};

use crate::{info_hash_hex, Sha1Hash};

/// Where a torrent came from; enough to re-add it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum OriginRecord {
  /// The magnet URI the torrent was added from.
  #[serde(rename = "magnet")]
  Magnet(String),
  /// The base64 of the `.torrent` file the torrent was added from.
  #[serde(rename = "torrent")]
  TorrentFile(String),
}

impl OriginRecord {
  pub fn from_torrent_bytes(bytes: &[u8]) -> Self {
    Self::TorrentFile(BASE64.encode(bytes))
  }

  /// The raw `.torrent` bytes, if this is a file origin.
  pub fn torrent_bytes(&self) -> Option<Vec<u8>> {
    match self {
      Self::TorrentFile(encoded) => BASE64.decode(encoded).ok(),
      Self::Magnet(_) => None,
    }
  }
}

/// The persisted state of one torrent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TorrentState {
  /// Hex form of the info hash; keys the record.
  pub info_hash: String,
  pub origin: OriginRecord,
  pub name: Option<String>,
  /// Announce URLs in tier order.
  pub announce: Vec<String>,
  /// Whether the user last had the torrent active.
  pub is_active: bool,
  /// Life-of-torrent payload counters; monotonic.
  pub downloaded: u64,
  pub uploaded: u64,
  /// The verified pieces as hex, present once metadata is known.
  pub bitfield_hex: Option<String>,
  pub piece_count: Option<usize>,
  /// Base64 of the raw bencoded info dictionary, once known. Restoring
  /// with this skips the metadata download.
  pub info_b64: Option<String>,
}

impl TorrentState {
  pub fn info_hash_bytes(&self) -> Option<Sha1Hash> {
    let bytes = hex::decode(&self.info_hash).ok()?;
    let mut hash = [0; 20];
    if bytes.len() != 20 {
      return None;
    }
    hash.copy_from_slice(&bytes);
    Some(hash)
  }

  pub fn info_bytes(&self) -> Option<Vec<u8>> {
    self
      .info_b64
      .as_ref()
      .and_then(|encoded| BASE64.decode(encoded).ok())
  }
}

/// The persistence capability consumed by the engine.
pub trait SessionStore: Send + Sync {
  /// Saves or overwrites a torrent's record.
  fn save(&self, state: &TorrentState) -> io::Result<()>;
  /// Loads every stored record.
  fn load_all(&self) -> io::Result<Vec<TorrentState>>;
  /// Removes a torrent's record, if present.
  fn remove(&self, info_hash: &Sha1Hash) -> io::Result<()>;
}

/// A session store that keeps one `<info_hash>.json` per torrent under
/// a state directory.
pub struct FsSessionStore {
  dir: PathBuf,
}

impl FsSessionStore {
  /// Creates the state directory if needed.
  pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
    let dir = dir.into();
    std::fs::create_dir_all(&dir)?;
    Ok(Self { dir })
  }

  fn path_of(&self, info_hash_hex: &str) -> PathBuf {
    self.dir.join(format!("{}.json", info_hash_hex))
  }
}

impl SessionStore for FsSessionStore {
  fn save(&self, state: &TorrentState) -> io::Result<()> {
    let path = self.path_of(&state.info_hash);
    let json = serde_json::to_vec_pretty(state)?;
    // write-then-rename so a crash never leaves a torn record
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)?;
    std::fs::rename(&tmp, &path)?;
    log::trace!("Saved torrent state to {:?}", path);
    Ok(())
  }

  fn load_all(&self) -> io::Result<Vec<TorrentState>> {
    let mut states = Vec::new();
    for entry in std::fs::read_dir(&self.dir)? {
      let path = entry?.path();
      if path.extension().map(|e| e != "json").unwrap_or(true) {
        continue;
      }
      match std::fs::read(&path)
        .map_err(|e| e.to_string())
        .and_then(|json| {
          serde_json::from_slice(&json).map_err(|e| e.to_string())
        }) {
        Ok(state) => states.push(state),
        Err(e) => {
          log::warn!("Skipping unreadable torrent state {:?}: {}", path, e)
        }
      }
    }
    Ok(states)
  }

  fn remove(&self, info_hash: &Sha1Hash) -> io::Result<()> {
    let path = self.path_of(&info_hash_hex(info_hash));
    match std::fs::remove_file(&path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e),
    }
  }
}

/// An in-memory store for tests and embedders that persist elsewhere.
#[derive(Default)]
pub struct MemorySessionStore {
  states: Mutex<HashMap<String, TorrentState>>,
}

impl MemorySessionStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl SessionStore for MemorySessionStore {
  fn save(&self, state: &TorrentState) -> io::Result<()> {
    self
      .states
      .lock()
      .unwrap()
      .insert(state.info_hash.clone(), state.clone());
    Ok(())
  }

  fn load_all(&self) -> io::Result<Vec<TorrentState>> {
    Ok(self.states.lock().unwrap().values().cloned().collect())
  }

  fn remove(&self, info_hash: &Sha1Hash) -> io::Result<()> {
    self
      .states
      .lock()
      .unwrap()
      .remove(&info_hash_hex(info_hash));
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn state() -> TorrentState {
    TorrentState {
      info_hash: "c12fe1c06bba254a9dc9f519b335aa7c1367a88a".into(),
      origin: OriginRecord::Magnet(
        "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a".into(),
      ),
      name: Some("test".into()),
      announce: vec!["http://tracker/announce".into()],
      is_active: true,
      downloaded: 12345,
      uploaded: 678,
      bitfield_hex: Some("a0".into()),
      piece_count: Some(3),
      info_b64: None,
    }
  }

  #[test]
  fn test_fs_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsSessionStore::new(dir.path()).unwrap();
    let state = state();

    store.save(&state).unwrap();
    let loaded = store.load_all().unwrap();
    assert_eq!(loaded, vec![state.clone()]);

    // overwriting keeps one record
    let mut updated = state.clone();
    updated.downloaded += 1;
    store.save(&updated).unwrap();
    let loaded = store.load_all().unwrap();
    assert_eq!(loaded, vec![updated]);

    // removal
    let hash = state.info_hash_bytes().unwrap();
    store.remove(&hash).unwrap();
    assert!(store.load_all().unwrap().is_empty());
    // removing again is fine
    store.remove(&hash).unwrap();
  }

  #[test]
  fn test_origin_record_torrent_bytes() {
    let bytes = b"d4:infod4:name1:aee".to_vec();
    let origin = OriginRecord::from_torrent_bytes(&bytes);
    assert_eq!(origin.torrent_bytes(), Some(bytes));
    assert_eq!(
      OriginRecord::Magnet("magnet:?".into()).torrent_bytes(),
      None
    );
  }

  #[test]
  fn test_state_decoders() {
    let state = state();
    assert!(state.info_hash_bytes().is_some());
    assert!(state.info_bytes().is_none());

    let mut with_info = state;
    with_info.info_b64 = Some(BASE64.encode(b"d4:name1:ae"));
    assert_eq!(with_info.info_bytes(), Some(b"d4:name1:ae".to_vec()));
  }
}
