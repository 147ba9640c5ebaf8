//! Gate Transport Layer - Peer connection and session liveness
//!
//! This crate provides:
//! - Connection, acceptor and connector seams
//! - TCP transport
//! - In-memory transport for simulation
//! - The session link (handshake bookkeeping, heartbeat, reconnection)

pub mod conn;
pub mod memory;
pub mod session;
pub mod tcp;

pub use conn::*;
pub use memory::*;
pub use session::*;
pub use tcp::*;
