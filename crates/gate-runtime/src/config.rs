//! Node settings loaded from an optional JSON file
//!
//! Every key is optional; missing keys keep the built-in defaults. Durations
//! are written the human way (`"500ms"`, `"2s"`, `"1m 30s"`).
//!
//! ```json
//! {
//!   "node": { "address": "0.0.0.0:8080", "tick_period": "20ms" },
//!   "controller": { "caution_duration": "3s" },
//!   "link": { "heartbeat_timeout": "20s" },
//!   "log": { "format": "json" }
//! }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use gate_core::{
    CalibrationMode, ControllerConfig, GateError, GateResult, LinkConfig, NodeConfig, SensorConfig,
    TimerConfig,
};

use crate::{LogFormat, LoggingConfig};

/// Which node the settings are for; picks the sensor defaults
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Controller,
    Timer,
}

fn duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let text: Option<String> = Option::deserialize(deserializer)?;
    text.map(|t| humantime::parse_duration(&t).map_err(serde::de::Error::custom))
        .transpose()
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct NodeSection {
    address: Option<SocketAddr>,
    #[serde(deserialize_with = "duration")]
    tick_period: Option<Duration>,
    #[serde(deserialize_with = "duration")]
    status_interval: Option<Duration>,
    log_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct SensorSection {
    min_valid_distance: Option<f64>,
    max_valid_distance: Option<f64>,
    filter_samples: Option<usize>,
    #[serde(deserialize_with = "duration")]
    inter_sample_delay: Option<Duration>,
    reference_samples: Option<usize>,
    #[serde(deserialize_with = "duration")]
    calibration_interval: Option<Duration>,
    /// `"filtered"` or `"raw"`
    calibration_mode: Option<String>,
    fallback_reference: Option<f64>,
    /// Explicitly disable the fallback
    no_fallback: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct ControllerSection {
    #[serde(deserialize_with = "duration")]
    yellow_pending_delay: Option<Duration>,
    #[serde(deserialize_with = "duration")]
    caution_duration: Option<Duration>,
    hysteresis_factor: Option<f64>,
    #[serde(deserialize_with = "duration")]
    max_timing_duration: Option<Duration>,
    #[serde(deserialize_with = "duration")]
    min_time_between_measurements: Option<Duration>,
    #[serde(deserialize_with = "duration")]
    peer_ready_timeout: Option<Duration>,
    max_invalid_readings: Option<u32>,
    #[serde(deserialize_with = "duration")]
    fault_backoff: Option<Duration>,
    fault_blink_count: Option<u32>,
    #[serde(deserialize_with = "duration")]
    fault_blink_period: Option<Duration>,
    #[serde(deserialize_with = "duration")]
    timing_warning_interval: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct TimerSection {
    #[serde(deserialize_with = "duration")]
    display_duration: Option<Duration>,
    #[serde(deserialize_with = "duration")]
    display_refresh: Option<Duration>,
    #[serde(deserialize_with = "duration")]
    max_timing_duration: Option<Duration>,
    recalibrate_on_connect: Option<bool>,
    #[serde(deserialize_with = "duration")]
    calibration_retry: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct LinkSection {
    #[serde(deserialize_with = "duration")]
    heartbeat_interval: Option<Duration>,
    #[serde(deserialize_with = "duration")]
    heartbeat_timeout: Option<Duration>,
    #[serde(deserialize_with = "duration")]
    reconnect_delay: Option<Duration>,
    #[serde(deserialize_with = "duration")]
    connection_timeout: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct LogSection {
    format: Option<LogFormat>,
    filter: Option<String>,
}

/// Raw file contents
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct SettingsFile {
    node: NodeSection,
    sensor: SensorSection,
    controller: ControllerSection,
    timer: TimerSection,
    link: LinkSection,
    log: LogSection,
}

/// Fully resolved settings for one node
#[derive(Clone, Debug)]
pub struct GateSettings {
    pub role: NodeRole,
    pub node: NodeConfig,
    pub sensor: SensorConfig,
    pub controller: ControllerConfig,
    pub timer: TimerConfig,
    pub link: LinkConfig,
    pub logging: LoggingConfig,
    /// CSV measurement log (controller only)
    pub log_file: Option<PathBuf>,
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *target = v;
    }
}

impl GateSettings {
    /// Built-in defaults for a role
    pub fn defaults(role: NodeRole) -> Self {
        GateSettings {
            role,
            node: NodeConfig::default(),
            sensor: match role {
                NodeRole::Controller => SensorConfig::default(),
                NodeRole::Timer => SensorConfig::timer_defaults(),
            },
            controller: ControllerConfig::default(),
            timer: TimerConfig::default(),
            link: LinkConfig::default(),
            logging: LoggingConfig::default(),
            log_file: None,
        }
    }

    /// Load from a file, or use defaults when no path is given
    pub fn load(role: NodeRole, path: Option<&Path>) -> GateResult<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| GateError::Config(format!("{}: {}", path.display(), e)))?;
                Self::from_json(role, &text)
            }
            None => Ok(Self::defaults(role)),
        }
    }

    /// Parse settings from JSON text and validate them
    pub fn from_json(role: NodeRole, text: &str) -> GateResult<Self> {
        let file: SettingsFile =
            serde_json::from_str(text).map_err(|e| GateError::Config(e.to_string()))?;

        let mut settings = Self::defaults(role);
        settings.apply(file)?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply(&mut self, file: SettingsFile) -> GateResult<()> {
        let n = file.node;
        set(&mut self.node.address, n.address);
        set(&mut self.node.tick_period, n.tick_period);
        set(&mut self.node.status_interval, n.status_interval);
        self.log_file = n.log_file;

        let s = file.sensor;
        set(&mut self.sensor.min_valid_distance, s.min_valid_distance);
        set(&mut self.sensor.max_valid_distance, s.max_valid_distance);
        set(&mut self.sensor.filter_samples, s.filter_samples);
        set(&mut self.sensor.inter_sample_delay, s.inter_sample_delay);
        set(&mut self.sensor.reference_samples, s.reference_samples);
        set(&mut self.sensor.calibration_interval, s.calibration_interval);
        if let Some(mode) = s.calibration_mode {
            self.sensor.calibration_mode = match mode.as_str() {
                "filtered" => CalibrationMode::Filtered,
                "raw" => CalibrationMode::Raw,
                other => {
                    return Err(GateError::Config(format!(
                        "unknown calibration_mode '{}'",
                        other
                    )))
                }
            };
        }
        if s.fallback_reference.is_some() {
            self.sensor.fallback_reference = s.fallback_reference;
        }
        if s.no_fallback == Some(true) {
            self.sensor.fallback_reference = None;
        }

        let c = file.controller;
        set(&mut self.controller.yellow_pending_delay, c.yellow_pending_delay);
        set(&mut self.controller.caution_duration, c.caution_duration);
        set(&mut self.controller.hysteresis_factor, c.hysteresis_factor);
        set(&mut self.controller.max_timing_duration, c.max_timing_duration);
        set(
            &mut self.controller.min_time_between_measurements,
            c.min_time_between_measurements,
        );
        set(&mut self.controller.peer_ready_timeout, c.peer_ready_timeout);
        set(&mut self.controller.max_invalid_readings, c.max_invalid_readings);
        set(&mut self.controller.fault_backoff, c.fault_backoff);
        set(&mut self.controller.fault_blink_count, c.fault_blink_count);
        set(&mut self.controller.fault_blink_period, c.fault_blink_period);
        set(&mut self.controller.timing_warning_interval, c.timing_warning_interval);

        let t = file.timer;
        set(&mut self.timer.display_duration, t.display_duration);
        set(&mut self.timer.display_refresh, t.display_refresh);
        set(&mut self.timer.max_timing_duration, t.max_timing_duration);
        set(&mut self.timer.recalibrate_on_connect, t.recalibrate_on_connect);
        set(&mut self.timer.calibration_retry, t.calibration_retry);

        let l = file.link;
        set(&mut self.link.heartbeat_interval, l.heartbeat_interval);
        set(&mut self.link.heartbeat_timeout, l.heartbeat_timeout);
        set(&mut self.link.reconnect_delay, l.reconnect_delay);
        set(&mut self.link.connection_timeout, l.connection_timeout);

        set(&mut self.logging.format, file.log.format);
        self.logging.filter = file.log.filter;
        Ok(())
    }

    pub fn validate(&self) -> GateResult<()> {
        self.sensor.validate()?;
        self.controller.validate()?;
        self.link.validate()?;
        if self.node.tick_period.is_zero() {
            return Err(GateError::Config("tick_period must be positive".into()));
        }
        Ok(())
    }
}
