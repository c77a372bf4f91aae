use std::time::Duration;

/// A running average accumulator.
///
/// The algorithm addresses the initial bias that occurs when all values
/// are initialized with zero or with the first sample (which would bias
/// the average toward the first value). This is achieved by initially
/// giving a low gain for the average and slowly increasing it until the
/// inverted gain is reached.
///
/// For example, the first sample has a gain of 1 as the average has no
/// meaning yet. With the second sample the average has some meaning, but
/// with only one sample in it the gain stays low, and so on until the
/// inverted gain is reached. This way even early samples have a
/// reasonable impact on the average, which matters in a torrent engine
/// where request timeouts are tuned from it.
///
/// Ported from libtorrent: https://blog.libtorrent.org/2014/09/running-averages/
#[derive(Debug)]
pub struct SlidingAvg {
  /// The current running average, effectively the mean.
  ///
  /// This is a fixed-point value: samples are multiplied by 64 before
  /// adding, and 32 is added before dividing back by 64 when the mean is
  /// read, to eliminate integer truncation bias. Fixed point is used as
  /// the main use is with integers and float conversions would be both
  /// slower and more cumbersome.
  mean: i64,
  /// The average deviation, in the same fixed-point representation.
  deviation: i64,
  /// The number of samples received, but no more than `inverted_gain`.
  sample_count: usize,
  /// How many initial samples are given a higher gain than the current
  /// average.
  inverted_gain: usize,
}

impl SlidingAvg {
  pub fn new(inverted_gain: usize) -> Self {
    SlidingAvg {
      mean: 0,
      deviation: 0,
      sample_count: 0,
      inverted_gain,
    }
  }

  pub fn update(&mut self, mut sample: i64) {
    sample *= 64;

    let deviation = if self.sample_count > 0 {
      (self.mean - sample).abs()
    } else {
      0
    };

    if self.sample_count < self.inverted_gain {
      self.sample_count += 1;
    }

    self.mean += (sample - self.mean) / self.sample_count as i64;

    if self.sample_count > 1 {
      self.deviation +=
        (deviation - self.deviation) / (self.sample_count - 1) as i64;
    }
  }

  pub fn mean(&self) -> i64 {
    if self.sample_count == 0 {
      0
    } else {
      (self.mean + 32) / 64
    }
  }

  pub fn deviation(&self) -> i64 {
    if self.sample_count == 0 {
      0
    } else {
      (self.deviation + 32) / 64
    }
  }

  pub fn sample_count(&self) -> usize {
    self.sample_count
  }
}

impl Default for SlidingAvg {
  /// Creates a sliding average with an inverted gain of 20.
  fn default() -> Self {
    Self::new(20)
  }
}

/// Wraps a [`SlidingAvg`] and converts the statistic to
/// [`std::time::Duration`] units, keeping milliseconds underneath.
#[derive(Debug, Default)]
pub struct SlidingDurationAvg(SlidingAvg);

impl SlidingDurationAvg {
  pub fn new(inverted_gain: usize) -> Self {
    SlidingDurationAvg(SlidingAvg::new(inverted_gain))
  }

  pub fn update(&mut self, sample: Duration) {
    let ms = sample.as_millis().try_into().expect("millisecond overflow");
    self.0.update(ms);
  }

  pub fn mean(&self) -> Duration {
    let ms = self.0.mean() as u64;
    Duration::from_millis(ms)
  }

  pub fn deviation(&self) -> Duration {
    let ms = self.0.deviation() as u64;
    Duration::from_millis(ms)
  }

  pub fn sample_count(&self) -> usize {
    self.0.sample_count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sliding_average() {
    let inverted_gain = 4;
    let mut a = SlidingAvg::new(inverted_gain);

    // the first sample should have a weight of 100%
    let sample = 10;
    a.update(sample);
    assert_eq!(a.sample_count, 1);
    assert_eq!(a.mean(), sample);

    // the second sample should have less weight
    let sample = 15;
    a.update(sample);
    assert_eq!(a.sample_count, 2);
    assert_eq!(a.mean(), 13);

    // the third sample even less
    let sample = 20;
    a.update(sample);
    assert_eq!(a.sample_count, 3);
    assert_eq!(a.mean(), 15);

    // The fourth sample reaches the inverted gain. To test that it has
    // an effect on the average, choose samples from which the current
    // mean subtracted and divided by the (now fixed) sample count is an
    // integer; for simplicity samples that increase the mean by 1.

    let sample = 19;
    a.update(sample);
    assert_eq!(a.sample_count, 4);
    assert_eq!(a.mean(), 16);

    let sample = 20;
    a.update(sample);
    assert_eq!(a.sample_count, 4);
    assert_eq!(a.mean(), 17);

    let sample = 21;
    a.update(sample);
    assert_eq!(a.sample_count, 4);
    assert_eq!(a.mean(), 18);

    // also make sure that a large sample only increases the mean by a
    // value proportional to its weight, that is by (sample - mean) / 4
    let sample = 118;
    // increase should be: (118 - 18) / 4 = 25
    a.update(sample);
    assert_eq!(a.mean(), 43);
  }

  #[test]
  fn test_sliding_duration_average() {
    // since the implementation of the moving average is the same as for
    // `SlidingAvg`, we only need to test that the i64 <-> duration
    // conversions are correct
    let mut a = SlidingDurationAvg::default();

    // initially the mean is the same as the first sample
    let sample = Duration::from_secs(10);
    a.update(sample);
    assert_eq!(a.0.sample_count, 1);
    assert_eq!(a.mean(), sample);
  }
}
