//! Adaptive connect timeout derived from observed connect latencies.
//!
//! Each torrent keeps one of these trackers and feeds it the duration of
//! every successful dial. The effective timeout for new dials follows the
//! 95th percentile of recent samples; timeouts themselves contribute only
//! to statistics and never shrink the window.

use std::{collections::VecDeque, time::Duration};

/// Samples kept for the percentile calculation.
const SAMPLE_WINDOW: usize = 50;
/// Below this many samples the default timeout applies.
const MIN_SAMPLES: usize = 5;
const MULTIPLIER: f64 = 2.5;
const MIN_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tracks connect durations and derives the dial timeout from them.
#[derive(Debug, Default)]
pub struct ConnectTimer {
  samples: VecDeque<Duration>,
}

impl ConnectTimer {
  /// Records the duration of a successful connect.
  pub fn record(&mut self, elapsed: Duration) {
    if self.samples.len() == SAMPLE_WINDOW {
      self.samples.pop_front();
    }
    self.samples.push_back(elapsed);
  }

  /// The timeout to apply to the next dial:
  /// `clamp(p95 * 2.5, 3 s, 30 s)`, or 10 s while there are too few
  /// samples to be meaningful.
  pub fn timeout(&self) -> Duration {
    if self.samples.len() < MIN_SAMPLES {
      return DEFAULT_TIMEOUT;
    }
    let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
    sorted.sort_unstable();
    let rank = ((sorted.len() as f64 * 0.95).ceil() as usize).max(1);
    let p95 = sorted[rank - 1];
    p95.mul_f64(MULTIPLIER).clamp(MIN_TIMEOUT, MAX_TIMEOUT)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_until_enough_samples() {
    let mut timer = ConnectTimer::default();
    for _ in 0..MIN_SAMPLES - 1 {
      timer.record(Duration::from_millis(100));
      assert_eq!(timer.timeout(), DEFAULT_TIMEOUT);
    }
    timer.record(Duration::from_millis(100));
    assert_ne!(timer.timeout(), DEFAULT_TIMEOUT);
  }

  #[test]
  fn test_p95_with_multiplier() {
    let mut timer = ConnectTimer::default();
    for i in 1..=20u64 {
      timer.record(Duration::from_secs(i));
    }
    // p95 of 1..=20 s is 19 s; multiplied it exceeds the cap
    assert_eq!(timer.timeout(), MAX_TIMEOUT);
  }

  #[test]
  fn test_fast_connects_hit_the_floor() {
    let mut timer = ConnectTimer::default();
    for _ in 0..10 {
      timer.record(Duration::from_millis(20));
    }
    // 20 ms * 2.5 is far below the floor
    assert_eq!(timer.timeout(), MIN_TIMEOUT);
  }

  #[test]
  fn test_window_slides() {
    let mut timer = ConnectTimer::default();
    for _ in 0..SAMPLE_WINDOW {
      timer.record(Duration::from_secs(20));
    }
    // refill the window with fast samples; the slow ones must age out
    for _ in 0..SAMPLE_WINDOW {
      timer.record(Duration::from_millis(10));
    }
    assert_eq!(timer.timeout(), MIN_TIMEOUT);
  }
}
