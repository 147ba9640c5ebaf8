//! Gate Wire Protocol - Line-oriented text commands
//!
//! This crate implements the controller/timer wire format:
//! - Command vocabulary and payload parsing
//! - Newline framing over a byte stream

pub mod line;
pub mod message;

pub use line::*;
pub use message::*;
