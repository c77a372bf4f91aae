use std::{
  fs::{File, OpenOptions},
  io::{Read, Seek, SeekFrom, Write},
  path::Path,
};

use crate::{error::disk::*, storage_info::FileInfo};

/// An open file of a torrent with its geometry.
pub struct TorrentFile {
  pub info: FileInfo,
  pub handle: File,
}

impl TorrentFile {
  /// Opens the file in create, read, and write modes at the path formed
  /// by the download directory and the relative path in the file info,
  /// creating missing parent directories.
  pub fn new(
    download_dir: &Path,
    info: FileInfo,
  ) -> Result<Self, NewTorrentError> {
    log::trace!(
      "Opening and creating file {:?} in dir {:?}",
      info,
      download_dir
    );

    let path = download_dir.join(&info.path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let handle = OpenOptions::new()
      .create(true)
      .write(true)
      .read(true)
      .open(&path)
      .map_err(|e| {
        log::warn!("Failed to open file {:?}", path);
        NewTorrentError::Io(e)
      })?;

    debug_assert!(path.exists());
    Ok(Self { info, handle })
  }

  /// Writes the whole buffer at the given offset within the file.
  pub fn write_at(
    &mut self,
    offset: u64,
    data: &[u8],
  ) -> Result<(), WriteError> {
    self.handle.seek(SeekFrom::Start(offset))?;
    self.handle.write_all(data)?;
    Ok(())
  }

  /// Reads into the whole buffer from the given offset within the file.
  /// Reading past the end of file zero-fills the remainder, which is how
  /// sparse and partially downloaded files behave anyway.
  pub fn read_at(
    &mut self,
    offset: u64,
    buf: &mut [u8],
  ) -> Result<(), ReadError> {
    self.handle.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
      match self.handle.read(&mut buf[filled..]) {
        Ok(0) => break,
        Ok(n) => filled += n,
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
        Err(e) => return Err(ReadError::Io(e)),
      }
    }
    // zero whatever the file couldn't provide
    for byte in buf[filled..].iter_mut() {
      *byte = 0;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;

  #[test]
  fn test_write_then_read_at_offset() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = TorrentFile::new(
      dir.path(),
      FileInfo {
        path: PathBuf::from("nested/dir/file"),
        len: 100,
        torrent_offset: 0,
      },
    )
    .unwrap();

    file.write_at(10, b"hello").unwrap();
    let mut buf = [0u8; 5];
    file.read_at(10, &mut buf).unwrap();
    assert_eq!(&buf, b"hello");
  }

  #[test]
  fn test_read_past_end_zero_fills() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = TorrentFile::new(
      dir.path(),
      FileInfo {
        path: PathBuf::from("file"),
        len: 100,
        torrent_offset: 0,
      },
    )
    .unwrap();

    file.write_at(0, b"abc").unwrap();
    let mut buf = [0xffu8; 6];
    file.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"abc\0\0\0");
  }
}
