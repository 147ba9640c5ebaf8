//! Gate Test Harness - Two-node simulation and end-to-end scenarios
//!
//! This crate provides:
//! - A controller and timer wired over the in-memory network
//! - A shared manual clock so every run is deterministic
//! - Scripted object passes through both gates
//! - End-to-end scenarios for timing, link loss and faults

pub mod harness;
pub mod scenarios;

pub use harness::*;
pub use scenarios::*;
