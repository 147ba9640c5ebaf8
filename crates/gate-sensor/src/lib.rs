//! Gate Sensor - Distance filtering and calibration
//!
//! This crate turns raw ultrasonic readings into gate decisions:
//! - Burst median filtering with dropout rejection
//! - Reference calibration at rest with degraded-mode fallback
//! - Simulated sources for tests and hardware-less runs

pub mod calibrate;
pub mod filter;
pub mod source;

pub use calibrate::*;
pub use filter::*;
pub use source::*;
