//! Simulated distance sources
//!
//! Used by the test harness and by the binaries when no sensor driver is
//! attached. Real hardware plugs in through [`DistanceSource`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gate_core::DistanceSource;

/// Value reported for a missing echo
pub const NO_ECHO: f64 = -1.0;

/// Replays a fixed list of readings, then repeats the last one
#[derive(Clone, Debug)]
pub struct ScriptedSource {
    queue: VecDeque<f64>,
    last: f64,
    reads: usize,
}

impl ScriptedSource {
    pub fn new(readings: Vec<f64>) -> Self {
        ScriptedSource {
            queue: readings.into(),
            last: NO_ECHO,
            reads: 0,
        }
    }

    pub fn constant(distance: f64) -> Self {
        ScriptedSource {
            queue: VecDeque::new(),
            last: distance,
            reads: 0,
        }
    }

    /// Append readings to the script
    pub fn extend(&mut self, readings: impl IntoIterator<Item = f64>) {
        self.queue.extend(readings);
    }

    /// Number of raw measurements taken so far
    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl DistanceSource for ScriptedSource {
    fn measure(&mut self) -> f64 {
        self.reads += 1;
        if let Some(next) = self.queue.pop_front() {
            self.last = next;
        }
        self.last
    }
}

/// Distance that a test or operator moves by hand
///
/// Clones share the same value; the node owns one clone and the harness
/// keeps another to place and remove objects.
#[derive(Clone, Debug)]
pub struct SimulatedGate {
    distance: Arc<Mutex<f64>>,
}

impl SimulatedGate {
    pub fn new(distance: f64) -> Self {
        SimulatedGate {
            distance: Arc::new(Mutex::new(distance)),
        }
    }

    pub fn set(&self, distance: f64) {
        *self.distance.lock() = distance;
    }

    pub fn get(&self) -> f64 {
        *self.distance.lock()
    }
}

impl DistanceSource for SimulatedGate {
    fn measure(&mut self) -> f64 {
        self.get()
    }
}

/// Sensor noise model
#[derive(Clone, Debug)]
pub struct NoiseConfig {
    /// Uniform jitter amplitude (cm)
    pub jitter_cm: f64,
    /// Probability of a missing echo (0.0 - 1.0)
    pub dropout_prob: f64,
    /// Probability of a spurious short echo (0.0 - 1.0)
    pub ghost_prob: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        NoiseConfig {
            jitter_cm: 0.5,
            dropout_prob: 0.05,
            ghost_prob: 0.02,
        }
    }
}

/// Wraps another source with jitter, dropouts and ghost echoes
pub struct NoisySource<S> {
    inner: S,
    config: NoiseConfig,
    rng: StdRng,
}

impl<S: DistanceSource> NoisySource<S> {
    pub fn new(inner: S, config: NoiseConfig) -> Self {
        NoisySource {
            inner,
            config,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic noise for reproducible runs
    pub fn with_seed(inner: S, config: NoiseConfig, seed: u64) -> Self {
        NoisySource {
            inner,
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: DistanceSource> DistanceSource for NoisySource<S> {
    fn measure(&mut self) -> f64 {
        let truth = self.inner.measure();
        if self.rng.gen_bool(self.config.dropout_prob.clamp(0.0, 1.0)) {
            return NO_ECHO;
        }
        if self.rng.gen_bool(self.config.ghost_prob.clamp(0.0, 1.0)) {
            return self.rng.gen_range(2.5..20.0);
        }
        if truth <= 0.0 || self.config.jitter_cm <= 0.0 {
            return truth;
        }
        let jitter = self.rng.gen_range(-self.config.jitter_cm..=self.config.jitter_cm);
        (truth + jitter).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SampleFilter;
    use gate_core::SensorConfig;
    use std::time::Duration;

    #[test]
    fn test_scripted_repeats_last() {
        let mut source = ScriptedSource::new(vec![1.0, 2.0]);
        assert_eq!(source.measure(), 1.0);
        assert_eq!(source.measure(), 2.0);
        assert_eq!(source.measure(), 2.0);
        assert_eq!(source.reads(), 3);
    }

    #[test]
    fn test_simulated_gate_shared() {
        let gate = SimulatedGate::new(100.0);
        let mut sensor = gate.clone();
        gate.set(40.0);
        assert_eq!(sensor.measure(), 40.0);
    }

    #[test]
    fn test_noisy_source_filtered_stays_close() {
        let config = SensorConfig {
            inter_sample_delay: Duration::ZERO,
            ..Default::default()
        };
        let filter = SampleFilter::new(&config);
        let mut source = NoisySource::with_seed(
            ScriptedSource::constant(100.0),
            NoiseConfig::default(),
            7,
        );

        let close = (0..200)
            .filter_map(|_| filter.filter(&mut source))
            .filter(|d| (d - 100.0).abs() <= 0.5 + 1e-9)
            .count();
        assert!(close >= 190, "only {} of 200 bursts near truth", close);
    }
}
