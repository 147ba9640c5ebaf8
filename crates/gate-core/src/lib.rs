//! Gate Core - Fundamental types and primitives
//!
//! This crate defines the types shared by both node roles:
//! - Error taxonomy
//! - Node-local time and clocks
//! - Samples, calibrated gates and signal lamps
//! - Collaborator traits for sensors, lamps, displays and logs
//! - Configuration with deployment defaults

pub mod config;
pub mod error;
pub mod gate;
pub mod io;
pub mod time;

pub use config::*;
pub use error::*;
pub use gate::*;
pub use io::*;
pub use time::*;
