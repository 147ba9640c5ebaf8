//! Error types for gate timing

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why a session link was considered lost
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkLossReason {
    /// The transport connection was closed or failed
    TransportClosed,
    /// No traffic from the peer within the heartbeat timeout
    HeartbeatTimeout,
    /// A newer inbound connection took over
    Replaced,
}

impl fmt::Display for LinkLossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkLossReason::TransportClosed => write!(f, "transport closed"),
            LinkLossReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            LinkLossReason::Replaced => write!(f, "replaced by new connection"),
        }
    }
}

/// Core gate errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GateError {
    // Sensor errors
    #[error("Sensor fault: {consecutive} consecutive invalid readings")]
    SensorFault { consecutive: u32 },

    #[error("Calibration failed: {valid} valid samples, {required} required")]
    CalibrationFailure { valid: usize, required: usize },

    // Link errors
    #[error("Link lost: {0}")]
    LinkLoss(LinkLossReason),

    #[error("No peer connected")]
    NotConnected,

    #[error("No peer connected to start timing")]
    NoPeerForStart,

    #[error("Transport error: {0}")]
    Transport(String),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed {command} payload: {payload:?}")]
    MalformedPayload { command: &'static str, payload: String },

    // Timing errors
    #[error("Timing timeout: no result after {waited:?}")]
    TimingTimeout { waited: Duration },

    // Setup errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for GateError {
    fn from(e: std::io::Error) -> Self {
        GateError::Io(e.to_string())
    }
}

/// Result type for gate operations
pub type GateResult<T> = Result<T, GateError>;
