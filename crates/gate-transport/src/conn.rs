//! Transport seams between the session link and the network

use std::time::Duration;

use gate_core::GateResult;
use gate_wire::Message;

/// One established peer connection
///
/// All operations except `flush` are non-blocking; they are called from
/// the tick loop.
#[allow(async_fn_in_trait)]
pub trait Connection {
    /// Encode and send a message, buffering whatever cannot be written yet
    fn send(&mut self, message: &Message) -> GateResult<()>;

    /// Push buffered output to the peer, waiting at most `wait` for the
    /// transport to take it
    async fn flush(&mut self, wait: Duration) -> GateResult<()>;

    /// Next complete inbound line, if one has arrived
    fn try_recv(&mut self) -> GateResult<Option<String>>;

    /// False once the peer closed or the transport failed
    fn is_open(&self) -> bool;

    fn close(&mut self);

    /// Peer description for logs
    fn peer(&self) -> String;
}

/// Listening side: hands out inbound connections
#[allow(async_fn_in_trait)]
pub trait Acceptor {
    type Conn: Connection;

    /// Return a pending inbound connection without waiting for one
    async fn try_accept(&mut self) -> GateResult<Option<Self::Conn>>;
}

/// Initiating side: dials the fixed peer address
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Conn: Connection;

    /// One connection attempt, bounded by `timeout`
    async fn connect(&mut self, timeout: Duration) -> GateResult<Self::Conn>;
}
