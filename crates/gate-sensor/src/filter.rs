//! Burst median filter for noisy ultrasonic readings

use std::time::Duration;

use gate_core::{DistanceSource, SensorConfig};

/// Converts a burst of raw samples into one robust distance
///
/// Invalid samples are pushed past the valid range before sorting so they
/// collect at the high end. A minority of dropouts therefore never drags
/// the median down, and a majority of dropouts yields no reading at all.
#[derive(Clone, Debug)]
pub struct SampleFilter {
    samples: usize,
    inter_sample_delay: Duration,
    min_valid_distance: f64,
    max_valid_distance: f64,
}

impl SampleFilter {
    pub fn new(config: &SensorConfig) -> Self {
        SampleFilter {
            samples: config.filter_samples.max(1),
            inter_sample_delay: config.inter_sample_delay,
            min_valid_distance: config.min_valid_distance,
            max_valid_distance: config.max_valid_distance,
        }
    }

    /// Configured burst size
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Take one burst of the configured size
    pub fn filter<S: DistanceSource + ?Sized>(&self, source: &mut S) -> Option<f64> {
        self.filter_n(source, self.samples)
    }

    /// Take a burst of `n` raw samples and return its median
    ///
    /// Returns `None` when the median falls among invalid samples.
    pub fn filter_n<S: DistanceSource + ?Sized>(&self, source: &mut S, n: usize) -> Option<f64> {
        let mut burst = Vec::with_capacity(n.max(1));
        for i in 0..n.max(1) {
            if i > 0 && !self.inter_sample_delay.is_zero() {
                std::thread::sleep(self.inter_sample_delay);
            }
            burst.push(source.measure());
        }
        self.median_of(&mut burst)
    }

    /// Median of an already collected burst
    pub fn median_of(&self, burst: &mut [f64]) -> Option<f64> {
        if burst.is_empty() {
            return None;
        }

        let sentinel = self.max_valid_distance + 1.0;
        for value in burst.iter_mut() {
            if !self.is_valid(*value) {
                *value = sentinel;
            }
        }
        burst.sort_by(f64::total_cmp);

        let median = burst[burst.len() / 2];
        if median > self.max_valid_distance {
            None
        } else {
            Some(median)
        }
    }

    #[inline]
    fn is_valid(&self, distance: f64) -> bool {
        distance > self.min_valid_distance && distance < self.max_valid_distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScriptedSource;

    fn filter() -> SampleFilter {
        SampleFilter::new(&SensorConfig {
            inter_sample_delay: Duration::ZERO,
            ..Default::default()
        })
    }

    #[test]
    fn test_minority_invalid_returns_median() {
        // [10, 11, 12, 401, 401] -> 12
        let mut burst = [10.0, 12.0, 11.0, -1.0, -1.0];
        assert_eq!(filter().median_of(&mut burst), Some(12.0));
    }

    #[test]
    fn test_majority_invalid_returns_none() {
        let mut burst = [-1.0, -1.0, -1.0, 10.0, 11.0];
        assert_eq!(filter().median_of(&mut burst), None);
    }

    #[test]
    fn test_out_of_range_counts_as_invalid() {
        // 1.0 is below the minimum, 500 above the maximum
        let mut burst = [1.0, 500.0, 1.5, 80.0, 81.0];
        assert_eq!(filter().median_of(&mut burst), None);

        let mut burst = [1.0, 79.0, 80.0, 81.0, 500.0];
        assert_eq!(filter().median_of(&mut burst), Some(81.0));
    }

    #[test]
    fn test_spurious_short_echo_rejected() {
        let mut burst = [100.0, 100.5, 3.0, 99.5, 100.2];
        assert_eq!(filter().median_of(&mut burst), Some(100.0));
    }

    #[test]
    fn test_filter_reads_from_source() {
        let mut source = ScriptedSource::new(vec![10.0, 12.0, 11.0, -1.0, -1.0]);
        let f = filter();

        assert_eq!(f.filter(&mut source), Some(12.0));
        assert_eq!(source.reads(), 5);
    }

    #[test]
    fn test_filter_n_single_sample() {
        let mut source = ScriptedSource::constant(42.0);
        assert_eq!(filter().filter_n(&mut source, 1), Some(42.0));
        assert_eq!(filter().filter_n(&mut ScriptedSource::constant(-1.0), 1), None);
    }
}
