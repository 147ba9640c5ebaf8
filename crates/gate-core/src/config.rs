//! Tunable constants for both node roles
//!
//! Defaults match the deployed hardware: an HC-SR04 class ultrasonic sensor
//! sampled at roughly 50 Hz and a WiFi link between the two nodes.

use std::net::SocketAddr;
use std::time::Duration;

use crate::{GateError, GateResult};

/// How the calibrator collects its reference readings
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CalibrationMode {
    /// One median-filtered burst per reference reading
    #[default]
    Filtered,
    /// One raw sensor sample per reference reading
    Raw,
}

/// Sensor limits, filtering and calibration
#[derive(Clone, Debug)]
pub struct SensorConfig {
    /// Readings at or below this are treated as invalid (cm)
    pub min_valid_distance: f64,
    /// Readings at or above this are treated as invalid (cm)
    pub max_valid_distance: f64,
    /// Raw samples per filtered reading (odd)
    pub filter_samples: usize,
    /// Pause between raw samples to avoid echo cross-talk
    pub inter_sample_delay: Duration,
    /// Reference readings taken per calibration run
    pub reference_samples: usize,
    /// Pause between reference readings
    pub calibration_interval: Duration,
    pub calibration_mode: CalibrationMode,
    /// Reference used when calibration fails; `None` means fail hard
    pub fallback_reference: Option<f64>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        SensorConfig {
            min_valid_distance: 2.0,
            max_valid_distance: 400.0,
            filter_samples: 5,
            inter_sample_delay: Duration::from_micros(500),
            reference_samples: 15,
            calibration_interval: Duration::from_millis(100),
            calibration_mode: CalibrationMode::Filtered,
            fallback_reference: None,
        }
    }
}

impl SensorConfig {
    /// Sensor profile used on the timer node: raw calibration with a
    /// 50 cm degraded-mode fallback
    pub fn timer_defaults() -> Self {
        SensorConfig {
            calibration_mode: CalibrationMode::Raw,
            fallback_reference: Some(50.0),
            ..Default::default()
        }
    }

    /// Whether a raw distance lies strictly inside the physical range
    #[inline]
    pub fn is_valid(&self, distance: f64) -> bool {
        distance > self.min_valid_distance && distance < self.max_valid_distance
    }

    pub fn validate(&self) -> GateResult<()> {
        if !(self.min_valid_distance < self.max_valid_distance) {
            return Err(GateError::Config(format!(
                "min_valid_distance {} must be below max_valid_distance {}",
                self.min_valid_distance, self.max_valid_distance
            )));
        }
        if self.filter_samples == 0 || self.filter_samples % 2 == 0 {
            return Err(GateError::Config(format!(
                "filter_samples must be odd, got {}",
                self.filter_samples
            )));
        }
        if self.reference_samples == 0 {
            return Err(GateError::Config("reference_samples must be positive".into()));
        }
        if let Some(fallback) = self.fallback_reference {
            if !self.is_valid(fallback) {
                return Err(GateError::Config(format!(
                    "fallback_reference {} is outside the valid range",
                    fallback
                )));
            }
        }
        Ok(())
    }
}

/// Controller state machine timing
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Dark phase between arrival and caution
    pub yellow_pending_delay: Duration,
    /// Caution phase before stop
    pub caution_duration: Duration,
    /// Departure threshold multiplier over the trigger threshold
    pub hysteresis_factor: f64,
    /// Safety abort while waiting for the timer's result
    pub max_timing_duration: Duration,
    /// Cooldown between completed measurements
    pub min_time_between_measurements: Duration,
    /// Longest a cooldown waits for the timer to report ready again
    pub peer_ready_timeout: Duration,
    /// Consecutive invalid readings that count as a sensor fault
    pub max_invalid_readings: u32,
    /// Wait in `Fault` before attempting recalibration
    pub fault_backoff: Duration,
    pub fault_blink_count: u32,
    pub fault_blink_period: Duration,
    /// Minimum spacing of "timing still open" warnings
    pub timing_warning_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            yellow_pending_delay: Duration::from_millis(500),
            caution_duration: Duration::from_millis(2000),
            hysteresis_factor: 1.15,
            max_timing_duration: Duration::from_secs(30),
            min_time_between_measurements: Duration::from_secs(2),
            peer_ready_timeout: Duration::from_secs(10),
            max_invalid_readings: 10,
            fault_backoff: Duration::from_secs(5),
            fault_blink_count: 5,
            fault_blink_period: Duration::from_millis(200),
            timing_warning_interval: Duration::from_secs(5),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> GateResult<()> {
        if !(self.hysteresis_factor > 1.0) {
            return Err(GateError::Config(format!(
                "hysteresis_factor must exceed 1.0, got {}",
                self.hysteresis_factor
            )));
        }
        if self.max_invalid_readings == 0 {
            return Err(GateError::Config("max_invalid_readings must be positive".into()));
        }
        if self.peer_ready_timeout < self.min_time_between_measurements {
            return Err(GateError::Config(format!(
                "peer_ready_timeout {:?} must not be shorter than min_time_between_measurements {:?}",
                self.peer_ready_timeout, self.min_time_between_measurements
            )));
        }
        Ok(())
    }
}

/// Timer state machine timing
#[derive(Clone, Debug)]
pub struct TimerConfig {
    /// How long a result stays on screen before re-arming
    pub display_duration: Duration,
    /// Live elapsed-time refresh while timing
    pub display_refresh: Duration,
    /// Abandon a cycle that never sees the object
    pub max_timing_duration: Duration,
    /// Recalibrate on every fresh connection instead of keeping the gate
    pub recalibrate_on_connect: bool,
    /// Wait before retrying a failed calibration (only without a fallback)
    pub calibration_retry: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        TimerConfig {
            display_duration: Duration::from_secs(5),
            display_refresh: Duration::from_millis(100),
            max_timing_duration: Duration::from_secs(30),
            recalibrate_on_connect: false,
            calibration_retry: Duration::from_secs(5),
        }
    }
}

/// Session link liveness and reconnection
#[derive(Clone, Debug)]
pub struct LinkConfig {
    pub heartbeat_interval: Duration,
    /// Silence after which the link is force-closed
    pub heartbeat_timeout: Duration,
    /// Spacing between connection attempts
    pub reconnect_delay: Duration,
    /// Upper bound on one connection attempt
    pub connection_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(2),
            connection_timeout: Duration::from_secs(15),
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> GateResult<()> {
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(GateError::Config(format!(
                "heartbeat_timeout {:?} must exceed heartbeat_interval {:?}",
                self.heartbeat_timeout, self.heartbeat_interval
            )));
        }
        Ok(())
    }
}

/// Tick driver settings
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub tick_period: Duration,
    /// Spacing of periodic status log lines
    pub status_interval: Duration,
    /// Controller listen address / timer peer address
    pub address: SocketAddr,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            tick_period: Duration::from_millis(20),
            status_interval: Duration::from_secs(5),
            address: SocketAddr::from(([192, 168, 4, 1], 80)),
        }
    }
}
