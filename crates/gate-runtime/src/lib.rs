//! Gate Runtime - Node state machines and tick drivers
//!
//! This crate provides:
//! - The controller and timer state machines
//! - Measurement statistics
//! - Node drivers running the fixed-order tick loop
//! - Settings file loading and logging setup
//! - Fallback lamps, display and measurement log

pub mod config;
pub mod controller;
pub mod node;
pub mod sinks;
pub mod stats;
pub mod telemetry;
pub mod timer;

pub use config::*;
pub use controller::*;
pub use node::*;
pub use sinks::*;
pub use stats::*;
pub use telemetry::*;
pub use timer::*;
