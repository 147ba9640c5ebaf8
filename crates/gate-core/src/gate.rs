//! Gate geometry: samples, calibrated thresholds and signal lamps

use std::fmt;

use crate::SensorConfig;

/// Relative slack on the departure bound so `threshold * factor` rounding
/// never moves a reading that sits exactly on the bound
const BOUND_EPSILON: f64 = 1e-9;

/// One raw distance reading
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    /// Distance in cm; non-positive means no echo
    pub distance: f64,
    pub valid: bool,
}

impl Sample {
    /// Classify a raw reading against the sensor's physical limits
    pub fn classify(distance: f64, config: &SensorConfig) -> Self {
        Sample {
            distance,
            valid: config.is_valid(distance),
        }
    }
}

/// Reference distance and the trigger threshold derived from it
///
/// INVARIANT: `trigger_threshold == reference_distance / 2`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibratedGate {
    reference_distance: f64,
    trigger_threshold: f64,
    /// Built from the configured fallback rather than a measurement
    degraded: bool,
}

impl CalibratedGate {
    /// Build a gate from a measured reference distance
    pub fn new(reference_distance: f64) -> Self {
        CalibratedGate {
            reference_distance,
            trigger_threshold: reference_distance / 2.0,
            degraded: false,
        }
    }

    /// Build a gate from a fixed fallback reference
    pub fn fallback(reference_distance: f64) -> Self {
        CalibratedGate {
            degraded: true,
            ..Self::new(reference_distance)
        }
    }

    #[inline]
    pub fn reference_distance(&self) -> f64 {
        self.reference_distance
    }

    #[inline]
    pub fn trigger_threshold(&self) -> f64 {
        self.trigger_threshold
    }

    #[inline]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Departure bound, always above the trigger threshold for factor > 1
    #[inline]
    pub fn hysteresis_bound(&self, factor: f64) -> f64 {
        self.trigger_threshold * factor
    }

    /// Object is inside the gate zone
    #[inline]
    pub fn is_arrival(&self, distance: f64) -> bool {
        distance <= self.trigger_threshold
    }

    /// Object has cleared the gate zone including the hysteresis margin
    ///
    /// A reading on the bound is not a departure.
    #[inline]
    pub fn is_departure(&self, distance: f64, factor: f64) -> bool {
        let bound = self.hysteresis_bound(factor);
        distance > bound + bound.abs() * BOUND_EPSILON
    }
}

/// Signal lamp outputs; independent, so all-on is a valid pattern
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash)]
pub struct Lamps {
    pub stop: bool,
    pub caution: bool,
    pub go: bool,
}

impl Lamps {
    pub const DARK: Lamps = Lamps::new(false, false, false);
    pub const GO: Lamps = Lamps::new(false, false, true);
    pub const CAUTION: Lamps = Lamps::new(false, true, false);
    pub const STOP: Lamps = Lamps::new(true, false, false);
    /// Timing in progress
    pub const ALL: Lamps = Lamps::new(true, true, true);
    /// Calibration in progress
    pub const CALIBRATING: Lamps = Lamps::new(true, true, false);

    pub const fn new(stop: bool, caution: bool, go: bool) -> Self {
        Lamps { stop, caution, go }
    }
}

impl fmt::Display for Lamps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let on_off = |b: bool| if b { "ON" } else { "OFF" };
        write!(
            f,
            "R:{} Y:{} G:{}",
            on_off(self.stop),
            on_off(self.caution),
            on_off(self.go)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_half_reference() {
        let gate = CalibratedGate::new(100.0);
        assert_eq!(gate.trigger_threshold(), 50.0);
        assert!(!gate.is_degraded());
        assert!(CalibratedGate::fallback(50.0).is_degraded());
    }

    #[test]
    fn test_hysteresis_asymmetry() {
        let gate = CalibratedGate::new(100.0);

        assert!(gate.is_arrival(50.0));
        assert!(!gate.is_arrival(50.1));

        // 50 * 1.15 = 57.5
        assert!(!gate.is_departure(55.0, 1.15));
        assert!(!gate.is_departure(57.5, 1.15));
        assert!(gate.is_departure(58.0, 1.15));
        assert!(gate.hysteresis_bound(1.15) > gate.trigger_threshold());
    }

    #[test]
    fn test_departure_bound_is_exclusive() {
        // 50.0 * 1.15 rounds to 57.499999999999996
        let gate = CalibratedGate::new(100.0);
        assert!(!gate.is_departure(57.5, 1.15));
        assert!(gate.is_departure(57.501, 1.15));

        let gate = CalibratedGate::new(137.0);
        let bound = 68.5 * 1.15;
        assert!(!gate.is_departure(bound, 1.15));
        assert!(gate.is_departure(bound + 0.01, 1.15));

        let gate = CalibratedGate::new(90.0);
        assert!(!gate.is_departure(51.75, 1.15));
        assert!(gate.is_departure(51.76, 1.15));
    }

    #[test]
    fn test_sample_classification() {
        let config = SensorConfig::default();
        assert!(Sample::classify(120.0, &config).valid);
        assert!(!Sample::classify(-1.0, &config).valid);
        assert!(!Sample::classify(450.0, &config).valid);
    }

    #[test]
    fn test_lamps_display() {
        assert_eq!(Lamps::ALL.to_string(), "R:ON Y:ON G:ON");
        assert_eq!(Lamps::GO.to_string(), "R:OFF Y:OFF G:ON");
    }
}
