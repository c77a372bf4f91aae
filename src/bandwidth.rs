//! Bandwidth accounting and rate limiting.
//!
//! Each transfer direction keeps a ring-aggregated history at tiered
//! resolutions for rate queries, plus a token bucket that gates the
//! actual transfers. The tracker is shared between the engine, torrents
//! and peer sessions behind an `Arc`; all internal state sits behind
//! short-lived mutexes.

use std::{sync::Mutex, time::Duration};

use tokio::time::Instant;

/// A transfer direction, from our point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
  Down,
  Up,
}

/// A token bucket limiter with a burst capacity of two seconds worth of
/// the configured rate.
///
/// Refill is lazy: tokens accumulate based on the monotonic time elapsed
/// since the previous refill, clamped to the capacity.
#[derive(Debug)]
pub struct TokenBucket {
  /// Bytes per second. Zero disables limiting.
  rate: u64,
  /// Always `rate * 2`.
  capacity: f64,
  tokens: f64,
  last_refill: Instant,
}

impl TokenBucket {
  pub fn new(rate: u64, now: Instant) -> Self {
    let capacity = (rate * 2) as f64;
    Self {
      rate,
      capacity,
      // a full bucket lets the first transfers through immediately
      tokens: capacity,
      last_refill: now,
    }
  }

  fn refill(&mut self, now: Instant) {
    if self.rate == 0 {
      return;
    }
    let elapsed = now.saturating_duration_since(self.last_refill);
    self.tokens = self
      .capacity
      .min(self.tokens + elapsed.as_secs_f64() * self.rate as f64);
    self.last_refill = now;
  }

  /// Deducts `bytes` tokens if available. Always succeeds when the
  /// bucket is unlimited.
  pub fn try_consume(&mut self, bytes: u64, now: Instant) -> bool {
    if self.rate == 0 {
      return true;
    }
    self.refill(now);
    if self.tokens >= bytes as f64 {
      self.tokens -= bytes as f64;
      true
    } else {
      false
    }
  }

  /// Returns the number of milliseconds until `bytes` tokens could be
  /// consumed, zero when they are already available or the bucket is
  /// unlimited.
  pub fn ms_until(&mut self, bytes: u64, now: Instant) -> u64 {
    if self.rate == 0 {
      return 0;
    }
    self.refill(now);
    let missing = bytes as f64 - self.tokens;
    if missing <= 0.0 {
      return 0;
    }
    (missing * 1000.0 / self.rate as f64).ceil() as u64
  }

  /// Updates the rate and capacity. Remaining tokens are clamped to the
  /// new capacity but never reset, so a limit change does not stall
  /// transfers already in flight.
  pub fn set_limit(&mut self, rate: u64, now: Instant) {
    self.refill(now);
    self.rate = rate;
    self.capacity = (rate * 2) as f64;
    if rate != 0 {
      self.tokens = self.tokens.min(self.capacity);
    }
  }
}

/// Slot lengths of the history tiers. The finest tier answers the 1 s
/// rate queries the UI makes; the coarser tiers cover minute-scale
/// averages without keeping thousands of slots.
const TIER_SLOT_MS: [u64; 3] = [1_000, 5_000, 60_000];
/// Slots kept per tier.
const TIER_SLOTS: usize = 60;

#[derive(Debug)]
struct Tier {
  slot_ms: u64,
  /// Ring of per-slot byte counts.
  slots: [u64; TIER_SLOTS],
  /// Absolute index of the most recently written slot.
  head: u64,
}

impl Tier {
  fn new(slot_ms: u64) -> Self {
    Self {
      slot_ms,
      slots: [0; TIER_SLOTS],
      head: 0,
    }
  }

  fn record(&mut self, elapsed_ms: u64, bytes: u64) {
    let slot = elapsed_ms / self.slot_ms;
    if slot != self.head {
      // zero out the slots we skipped over since the last record
      let gap = (slot - self.head).min(TIER_SLOTS as u64);
      for i in 0..gap {
        let idx = ((self.head + 1 + i) % TIER_SLOTS as u64) as usize;
        self.slots[idx] = 0;
      }
      self.head = slot;
    }
    self.slots[(slot % TIER_SLOTS as u64) as usize] += bytes;
  }

  /// Sums the bytes recorded over the trailing window, excluding slots
  /// older than it.
  fn sum(&self, elapsed_ms: u64, window: Duration) -> u64 {
    let now_slot = elapsed_ms / self.slot_ms;
    let window_slots =
      ((window.as_millis() as u64 + self.slot_ms - 1) / self.slot_ms).max(1);
    let window_slots = window_slots.min(TIER_SLOTS as u64);
    let mut total = 0;
    for back in 0..window_slots {
      if back > now_slot {
        break;
      }
      let slot = now_slot - back;
      // slots older than the ring are long overwritten
      if self.head.saturating_sub(slot) >= TIER_SLOTS as u64 {
        break;
      }
      if slot <= self.head {
        total += self.slots[(slot % TIER_SLOTS as u64) as usize];
      }
    }
    total
  }
}

/// Ring-aggregated transfer history of one direction.
#[derive(Debug)]
pub struct History {
  start: Instant,
  tiers: [Tier; 3],
}

impl History {
  fn new(start: Instant) -> Self {
    Self {
      start,
      tiers: [
        Tier::new(TIER_SLOT_MS[0]),
        Tier::new(TIER_SLOT_MS[1]),
        Tier::new(TIER_SLOT_MS[2]),
      ],
    }
  }

  fn record(&mut self, bytes: u64, now: Instant) {
    let elapsed = now.saturating_duration_since(self.start).as_millis() as u64;
    for tier in self.tiers.iter_mut() {
      tier.record(elapsed, bytes);
    }
  }

  /// The transfer rate in bytes per second over the trailing window,
  /// answered from the finest tier that covers it.
  fn rate(&self, window: Duration, now: Instant) -> u64 {
    let elapsed = now.saturating_duration_since(self.start).as_millis() as u64;
    let window_ms = window.as_millis() as u64;
    let tier = self
      .tiers
      .iter()
      .find(|t| t.slot_ms * TIER_SLOTS as u64 >= window_ms)
      .unwrap_or(&self.tiers[2]);
    let sum = tier.sum(elapsed, window);
    sum * 1000 / window_ms.max(1)
  }
}

#[derive(Debug)]
struct Channel {
  history: History,
  bucket: TokenBucket,
}

/// Bandwidth tracker for both transfer directions.
#[derive(Debug)]
pub struct Tracker {
  down: Mutex<Channel>,
  up: Mutex<Channel>,
}

impl Tracker {
  /// Creates a tracker with the given per-direction rate limits in bytes
  /// per second. Zero means unlimited.
  pub fn new(download_rate: u64, upload_rate: u64) -> Self {
    let now = Instant::now();
    Self {
      down: Mutex::new(Channel {
        history: History::new(now),
        bucket: TokenBucket::new(download_rate, now),
      }),
      up: Mutex::new(Channel {
        history: History::new(now),
        bucket: TokenBucket::new(upload_rate, now),
      }),
    }
  }

  fn channel(&self, direction: Direction) -> &Mutex<Channel> {
    match direction {
      Direction::Down => &self.down,
      Direction::Up => &self.up,
    }
  }

  /// Adds transferred bytes to the direction's history.
  pub fn record(&self, direction: Direction, bytes: u64) {
    let mut chan = self.channel(direction).lock().unwrap();
    chan.history.record(bytes, Instant::now());
  }

  /// Attempts to win tokens for a transfer of `bytes`.
  pub fn try_consume(&self, direction: Direction, bytes: u64) -> bool {
    let mut chan = self.channel(direction).lock().unwrap();
    chan.bucket.try_consume(bytes, Instant::now())
  }

  /// Milliseconds until a transfer of `bytes` could win tokens.
  pub fn ms_until(&self, direction: Direction, bytes: u64) -> u64 {
    let mut chan = self.channel(direction).lock().unwrap();
    chan.bucket.ms_until(bytes, Instant::now())
  }

  /// Updates a direction's rate limit.
  pub fn set_limit(&self, direction: Direction, rate: u64) {
    let mut chan = self.channel(direction).lock().unwrap();
    chan.bucket.set_limit(rate, Instant::now());
  }

  /// The observed transfer rate in bytes per second over the given
  /// trailing window.
  pub fn rate(&self, direction: Direction, window: Duration) -> u64 {
    let chan = self.channel(direction).lock().unwrap();
    chan.history.rate(window, Instant::now())
  }
}
