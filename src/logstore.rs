//! A bounded in-memory sink for the engine's log events.
//!
//! The crate logs through the `log` facade like the rest of the
//! ecosystem; embedders that want to show recent engine events in a UI
//! can install the engine's [`LogStore`] as the logger (or as part of a
//! fan-out logger) and query it. The buffer is a ring: when it grows
//! half again past its capacity, the oldest entries are evicted in
//! bulk rather than one by one.

use std::{
  collections::VecDeque,
  sync::Mutex,
  time::SystemTime,
};

use log::{Level, Metadata, Record};

/// Entries kept after an eviction pass.
const DEFAULT_CAPACITY: usize = 1000;

/// One captured log event.
#[derive(Clone, Debug)]
pub struct LogEntry {
  pub at: SystemTime,
  pub level: Level,
  pub target: String,
  pub message: String,
}

/// A bounded buffer of recent log events.
pub struct LogStore {
  capacity: usize,
  entries: Mutex<VecDeque<LogEntry>>,
}

impl Default for LogStore {
  fn default() -> Self {
    Self::with_capacity(DEFAULT_CAPACITY)
  }
}

impl LogStore {
  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      capacity,
      entries: Mutex::new(VecDeque::new()),
    }
  }

  /// Appends an entry, evicting the oldest half-capacity worth when the
  /// buffer runs 50% over.
  pub fn push(&self, entry: LogEntry) {
    let mut entries = self.entries.lock().unwrap();
    entries.push_back(entry);
    if entries.len() > self.capacity + self.capacity / 2 {
      let excess = entries.len() - self.capacity;
      entries.drain(..excess);
    }
  }

  /// A snapshot of the buffered entries, oldest first.
  pub fn entries(&self) -> Vec<LogEntry> {
    self.entries.lock().unwrap().iter().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.entries.lock().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl log::Log for LogStore {
  fn enabled(&self, metadata: &Metadata) -> bool {
    metadata.level() <= Level::Debug
  }

  fn log(&self, record: &Record) {
    if !self.enabled(record.metadata()) {
      return;
    }
    self.push(LogEntry {
      at: SystemTime::now(),
      level: record.level(),
      target: record.target().to_string(),
      message: record.args().to_string(),
    });
  }

  fn flush(&self) {}
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(message: &str) -> LogEntry {
    LogEntry {
      at: SystemTime::now(),
      level: Level::Info,
      target: "test".into(),
      message: message.into(),
    }
  }

  #[test]
  fn test_bulk_eviction() {
    let store = LogStore::with_capacity(10);
    // filling up to 150% keeps everything
    for i in 0..15 {
      store.push(entry(&i.to_string()));
    }
    assert_eq!(store.len(), 15);

    // one more trips the bulk eviction back down to capacity
    store.push(entry("16"));
    assert_eq!(store.len(), 10);

    // the oldest entries are the ones that went
    let entries = store.entries();
    assert_eq!(entries.first().unwrap().message, "6");
    assert_eq!(entries.last().unwrap().message, "16");
  }
}
