//! Transfer statistics counters.
//!
//! Peer sessions tally their traffic into these counters and ship a
//! snapshot to their torrent with every session tick; the torrent sums
//! them into its own aggregate. Counters distinguish payload bytes
//! (block data) from protocol chatter, which is what the per-torrent
//! `downloaded`/`uploaded` totals are built from.

/// A single monotonic counter with a per-round tally.
#[derive(Clone, Copy, Debug, Default)]
pub struct Counter {
  /// Bytes since the counter was created.
  total: u64,
  /// Bytes since the last `tick`.
  round: u64,
  /// The largest per-round tally seen.
  peak: u64,
}

impl Counter {
  pub fn add(&mut self, bytes: u64) {
    self.total += bytes;
    self.round += bytes;
  }

  /// Finishes the current round, returning its tally. Rounds are
  /// expected to be about a second long, making the tally a rate.
  pub fn tick(&mut self) -> u64 {
    let round = self.round;
    self.peak = self.peak.max(round);
    self.round = 0;
    round
  }

  pub fn total(&self) -> u64 {
    self.total
  }

  pub fn round(&self) -> u64 {
    self.round
  }

  pub fn peak(&self) -> u64 {
    self.peak
  }
}

/// Counters of one transfer direction.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelCounter {
  /// Block payload bytes.
  pub payload: Counter,
  /// Everything else: handshakes, requests, haves, keep-alives.
  pub protocol: Counter,
}

impl ChannelCounter {
  /// The sum of payload and protocol bytes ever recorded.
  pub fn total(&self) -> u64 {
    self.payload.total() + self.protocol.total()
  }

  pub fn tick(&mut self) {
    self.payload.tick();
    self.protocol.tick();
  }
}

/// The full set of a session's (or torrent's) transfer counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThruputCounters {
  pub down: ChannelCounter,
  pub up: ChannelCounter,
  /// Payload bytes that had to be thrown away: duplicate or unexpected
  /// blocks.
  pub waste: Counter,
}

impl ThruputCounters {
  pub fn tick(&mut self) {
    self.down.tick();
    self.up.tick();
    self.waste.tick();
  }

  /// Folds another snapshot's round tallies into this aggregate.
  pub fn merge(&mut self, other: &ThruputCounters) {
    self.down.payload.add(other.down.payload.round());
    self.down.protocol.add(other.down.protocol.round());
    self.up.payload.add(other.up.payload.round());
    self.up.protocol.add(other.up.protocol.round());
    self.waste.add(other.waste.round());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_round_and_total() {
    let mut c = Counter::default();
    c.add(100);
    c.add(50);
    assert_eq!(c.total(), 150);
    assert_eq!(c.round(), 150);
    assert_eq!(c.tick(), 150);
    assert_eq!(c.round(), 0);
    assert_eq!(c.total(), 150);
    assert_eq!(c.peak(), 150);

    c.add(10);
    assert_eq!(c.tick(), 10);
    // peak keeps the best round
    assert_eq!(c.peak(), 150);
  }

  #[test]
  fn test_merge_takes_rounds() {
    let mut aggregate = ThruputCounters::default();
    let mut session = ThruputCounters::default();
    session.down.payload.add(1000);
    session.up.protocol.add(20);
    aggregate.merge(&session);
    session.tick();
    // a second merge after the tick adds nothing new
    aggregate.merge(&session);
    assert_eq!(aggregate.down.payload.total(), 1000);
    assert_eq!(aggregate.up.protocol.total(), 20);
  }
}
