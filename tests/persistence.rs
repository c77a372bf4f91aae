//! Session store fidelity: a torrent saved by one engine run is
//! reconstructed by the next.

mod common;

use std::time::Duration;

use riptide::{
  alert::Alert,
  conf::Conf,
  engine,
  metainfo::Metainfo,
  store::{FsSessionStore, SessionStore},
};

const PIECE_LEN: usize = 0x4000;

#[tokio::test(flavor = "multi_thread")]
async fn test_torrent_state_survives_restart() {
  let download_dir = tempfile::tempdir().unwrap();
  let state_dir = tempfile::tempdir().unwrap();

  let content = common::test_content(3 * PIECE_LEN);
  let torrent_file =
    common::build_torrent_file("persisted.bin", PIECE_LEN, &content);
  let metainfo = Metainfo::from_bytes(&torrent_file).unwrap();

  // first engine run: add the torrent stopped and shut down
  {
    let mut conf = Conf::new(download_dir.path());
    conf.engine.state_dir = Some(state_dir.path().to_path_buf());
    let (engine, _alerts) = engine::spawn(conf).unwrap();
    engine.add_torrent_file(&torrent_file, false).unwrap();
    // give the engine task a moment to create and persist the torrent
    tokio::time::sleep(Duration::from_secs(2)).await;
    engine.shutdown().await.unwrap();
  }

  // the record on disk has everything needed to rebuild the torrent
  let store = FsSessionStore::new(state_dir.path()).unwrap();
  let states = store.load_all().unwrap();
  assert_eq!(states.len(), 1);
  let state = &states[0];
  assert_eq!(state.info_hash, hex::encode(metainfo.info_hash));
  assert_eq!(state.name.as_deref(), Some("persisted.bin"));
  assert!(!state.is_active);
  assert_eq!(state.piece_count, Some(3));
  assert_eq!(
    state.info_bytes().as_deref(),
    Some(&metainfo.info_bytes[..])
  );

  // second engine run: the torrent comes back with the same identity
  {
    let mut conf = Conf::new(download_dir.path());
    conf.engine.state_dir = Some(state_dir.path().to_path_buf());
    let (engine, mut alerts) = engine::spawn(conf).unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(10), async {
      loop {
        if let Some(Alert::TorrentStats { stats, .. }) = alerts.recv().await {
          return stats;
        }
      }
    })
    .await
    .expect("no stats from the restored torrent");

    assert_eq!(stats.name.as_deref(), Some("persisted.bin"));
    assert_eq!(stats.piece_count, 3);
    assert_eq!(stats.missing_piece_count, 3);

    engine.shutdown().await.unwrap();
  }
}
