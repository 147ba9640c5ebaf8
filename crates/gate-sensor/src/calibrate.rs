//! Reference distance calibration at rest

use gate_core::{CalibratedGate, CalibrationMode, DistanceSource, GateError, GateResult, SensorConfig};

use crate::SampleFilter;

/// Establishes the reference distance of an empty gate
///
/// Re-runnable: nodes call it at start-up and again when recovering from
/// a fault.
#[derive(Clone, Debug)]
pub struct GateCalibrator {
    filter: SampleFilter,
    config: SensorConfig,
}

impl GateCalibrator {
    pub fn new(config: SensorConfig) -> Self {
        GateCalibrator {
            filter: SampleFilter::new(&config),
            config,
        }
    }

    pub fn filter(&self) -> &SampleFilter {
        &self.filter
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// Calibrate with the configured number of reference readings
    pub fn calibrate<S: DistanceSource + ?Sized>(&self, source: &mut S) -> GateResult<CalibratedGate> {
        self.calibrate_n(source, self.config.reference_samples)
    }

    /// Take `sample_count` reference readings and average the valid ones
    pub fn calibrate_n<S: DistanceSource + ?Sized>(
        &self,
        source: &mut S,
        sample_count: usize,
    ) -> GateResult<CalibratedGate> {
        let mut readings = Vec::with_capacity(sample_count);
        for i in 0..sample_count {
            if i > 0 && !self.config.calibration_interval.is_zero() {
                std::thread::sleep(self.config.calibration_interval);
            }
            let reading = match self.config.calibration_mode {
                CalibrationMode::Filtered => self.filter.filter(source).unwrap_or(-1.0),
                CalibrationMode::Raw => source.measure(),
            };
            tracing::trace!(sample = i + 1, of = sample_count, reading, "calibration sample");
            readings.push(reading);
        }

        let result = reference_from(&readings, &self.config);
        match &result {
            Ok(gate) => tracing::info!(
                reference_cm = gate.reference_distance(),
                trigger_cm = gate.trigger_threshold(),
                "calibration complete"
            ),
            Err(e) => tracing::warn!("calibration failed: {}", e),
        }
        result
    }

    /// Calibrate, substituting the configured fallback reference on failure
    ///
    /// Without a fallback the failure is returned unchanged.
    pub fn calibrate_or_fallback<S: DistanceSource + ?Sized>(
        &self,
        source: &mut S,
    ) -> GateResult<CalibratedGate> {
        match (self.calibrate(source), self.config.fallback_reference) {
            (Ok(gate), _) => Ok(gate),
            (Err(e), Some(fallback)) => {
                tracing::warn!(
                    fallback_cm = fallback,
                    "{}; running degraded on fallback reference",
                    e
                );
                Ok(CalibratedGate::fallback(fallback))
            }
            (Err(e), None) => Err(e),
        }
    }
}

/// Average the valid subset of `readings`
///
/// At least half of the readings (rounded down, minimum one) must be valid.
pub fn reference_from(readings: &[f64], config: &SensorConfig) -> GateResult<CalibratedGate> {
    let required = (readings.len() / 2).max(1);
    let valid: Vec<f64> = readings
        .iter()
        .copied()
        .filter(|d| config.is_valid(*d))
        .collect();

    if valid.len() < required {
        return Err(GateError::CalibrationFailure {
            valid: valid.len(),
            required,
        });
    }

    let mean = valid.iter().sum::<f64>() / valid.len() as f64;
    Ok(CalibratedGate::new(mean))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScriptedSource;
    use proptest::prelude::*;
    use std::time::Duration;

    fn fast_config(mode: CalibrationMode) -> SensorConfig {
        SensorConfig {
            inter_sample_delay: Duration::ZERO,
            calibration_interval: Duration::ZERO,
            calibration_mode: mode,
            ..Default::default()
        }
    }

    #[test]
    fn test_calibrate_raw_mean_of_valid() {
        let calibrator = GateCalibrator::new(fast_config(CalibrationMode::Raw));
        let mut source = ScriptedSource::new(vec![100.0, 102.0, -1.0, 98.0]);

        let gate = calibrator.calibrate_n(&mut source, 4).unwrap();
        assert!((gate.reference_distance() - 100.0).abs() < 1e-9);
        assert!((gate.trigger_threshold() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_calibrate_filtered() {
        let calibrator = GateCalibrator::new(fast_config(CalibrationMode::Filtered));
        let mut source = ScriptedSource::constant(120.0);

        let gate = calibrator.calibrate(&mut source).unwrap();
        assert_eq!(gate.reference_distance(), 120.0);
        // 15 readings of 5 samples
        assert_eq!(source.reads(), 75);
    }

    #[test]
    fn test_calibration_failure() {
        let calibrator = GateCalibrator::new(fast_config(CalibrationMode::Raw));
        let mut source = ScriptedSource::constant(-1.0);

        let err = calibrator.calibrate(&mut source).unwrap_err();
        assert_eq!(err, GateError::CalibrationFailure { valid: 0, required: 7 });
    }

    #[test]
    fn test_fallback_is_degraded() {
        let config = SensorConfig {
            fallback_reference: Some(50.0),
            ..fast_config(CalibrationMode::Raw)
        };
        let calibrator = GateCalibrator::new(config);
        let mut source = ScriptedSource::constant(-1.0);

        let gate = calibrator.calibrate_or_fallback(&mut source).unwrap();
        assert!(gate.is_degraded());
        assert_eq!(gate.trigger_threshold(), 25.0);
    }

    #[test]
    fn test_no_fallback_propagates_failure() {
        let calibrator = GateCalibrator::new(fast_config(CalibrationMode::Raw));
        let mut source = ScriptedSource::constant(-1.0);
        assert!(calibrator.calibrate_or_fallback(&mut source).is_err());
    }

    #[test]
    fn test_exactly_half_valid_is_enough() {
        let config = SensorConfig::default();
        let readings = [80.0, -1.0, 82.0, -1.0];
        let gate = reference_from(&readings, &config).unwrap();
        assert_eq!(gate.reference_distance(), 81.0);
    }

    #[test]
    fn test_empty_readings_fail() {
        let config = SensorConfig::default();
        assert!(reference_from(&[], &config).is_err());
    }

    proptest! {
        #[test]
        fn prop_reference_is_mean_of_valid_subset(
            valid in prop::collection::vec(2.5f64..399.5, 1..20),
            invalid in prop::collection::vec(prop_oneof![Just(-1.0f64), 400.0f64..1000.0, -50.0f64..2.0], 0..20),
        ) {
            prop_assume!(invalid.len() <= valid.len());
            let config = SensorConfig::default();

            let mut readings = valid.clone();
            readings.extend(invalid.iter().copied());
            // Interleave so position does not matter
            let shift = readings.len() / 3;
            readings.rotate_left(shift);

            let gate = reference_from(&readings, &config).unwrap();
            let expected = valid.iter().sum::<f64>() / valid.len() as f64;

            prop_assert!((gate.reference_distance() - expected).abs() < 1e-6);
            prop_assert!((gate.trigger_threshold() - gate.reference_distance() / 2.0).abs() < 1e-9);
            prop_assert!(gate.trigger_threshold() >= 0.0);
        }
    }
}
