//! In-process transport for simulation and tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use gate_core::{GateError, GateResult};
use gate_wire::Message;

use crate::{Acceptor, Connection, Connector};

/// One direction of a duplex pipe
#[derive(Debug, Default)]
struct Pipe {
    lines: VecDeque<String>,
    open: bool,
}

type SharedPipe = Arc<Mutex<Pipe>>;

fn open_pipe() -> SharedPipe {
    Arc::new(Mutex::new(Pipe {
        lines: VecDeque::new(),
        open: true,
    }))
}

/// One end of an in-memory duplex line pipe
#[derive(Clone, Debug)]
pub struct MemoryConnection {
    inbound: SharedPipe,
    outbound: SharedPipe,
    label: String,
}

/// Create both ends of a connected pipe
pub fn memory_pair(a: &str, b: &str) -> (MemoryConnection, MemoryConnection) {
    let a_to_b = open_pipe();
    let b_to_a = open_pipe();
    (
        MemoryConnection {
            inbound: Arc::clone(&b_to_a),
            outbound: Arc::clone(&a_to_b),
            label: b.to_string(),
        },
        MemoryConnection {
            inbound: a_to_b,
            outbound: b_to_a,
            label: a.to_string(),
        },
    )
}

impl MemoryConnection {
    /// Push an arbitrary line, bypassing the codec
    pub fn send_raw(&mut self, line: &str) -> GateResult<()> {
        let mut pipe = self.outbound.lock();
        if !pipe.open {
            return Err(GateError::NotConnected);
        }
        pipe.lines.push_back(line.to_string());
        Ok(())
    }

    /// Lines sent by the peer and not yet received
    pub fn queued(&self) -> usize {
        self.inbound.lock().lines.len()
    }
}

impl Connection for MemoryConnection {
    fn send(&mut self, message: &Message) -> GateResult<()> {
        self.send_raw(message.encode().trim_end())
    }

    async fn flush(&mut self, _wait: Duration) -> GateResult<()> {
        Ok(())
    }

    fn try_recv(&mut self) -> GateResult<Option<String>> {
        Ok(self.inbound.lock().lines.pop_front().map(|l| l.trim().to_string()))
    }

    fn is_open(&self) -> bool {
        let inbound = self.inbound.lock().open;
        let outbound = self.outbound.lock().open;
        inbound && outbound
    }

    fn close(&mut self) {
        self.inbound.lock().open = false;
        self.outbound.lock().open = false;
    }

    fn peer(&self) -> String {
        self.label.clone()
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    pending: VecDeque<MemoryConnection>,
    live: Vec<MemoryConnection>,
    listening: bool,
    reachable: bool,
}

/// Simulated network joining one listener and any number of dialers
#[derive(Clone, Debug)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        MemoryNetwork {
            state: Arc::new(Mutex::new(NetworkState {
                reachable: true,
                ..Default::default()
            })),
        }
    }

    /// Listening end; only one should exist per network
    pub fn acceptor(&self) -> MemoryAcceptor {
        self.state.lock().listening = true;
        MemoryAcceptor {
            state: Arc::clone(&self.state),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            state: Arc::clone(&self.state),
        }
    }

    /// Make new connection attempts fail (existing links are untouched)
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Drop every established connection, as if the radio went away
    pub fn sever(&self) {
        let mut state = self.state.lock();
        for conn in state.live.iter_mut() {
            conn.close();
        }
        state.live.clear();
        state.pending.clear();
    }

    /// Connections established and not yet closed
    pub fn live_connections(&self) -> usize {
        let mut state = self.state.lock();
        state.live.retain(|c| c.is_open());
        state.live.len()
    }
}

/// Listening end of a [`MemoryNetwork`]
pub struct MemoryAcceptor {
    state: Arc<Mutex<NetworkState>>,
}

impl Acceptor for MemoryAcceptor {
    type Conn = MemoryConnection;

    async fn try_accept(&mut self) -> GateResult<Option<MemoryConnection>> {
        Ok(self.state.lock().pending.pop_front())
    }
}

/// Dialing end of a [`MemoryNetwork`]
pub struct MemoryConnector {
    state: Arc<Mutex<NetworkState>>,
}

impl Connector for MemoryConnector {
    type Conn = MemoryConnection;

    async fn connect(&mut self, _timeout: Duration) -> GateResult<MemoryConnection> {
        let mut state = self.state.lock();
        if !state.listening || !state.reachable {
            return Err(GateError::Transport("connection refused".into()));
        }
        let (local, remote) = memory_pair("timer", "controller");
        state.live.push(local.clone());
        state.pending.push_back(remote);
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_exchange() {
        let (mut a, mut b) = memory_pair("a", "b");
        a.send(&Message::StartTimer).unwrap();
        assert_eq!(b.queued(), 1);
        assert_eq!(b.try_recv().unwrap().as_deref(), Some("START_TIMER"));
        assert_eq!(b.try_recv().unwrap(), None);
    }

    #[test]
    fn test_close_visible_on_both_ends() {
        let (mut a, b) = memory_pair("a", "b");
        a.close();
        assert!(!b.is_open());
        assert!(matches!(a.send(&Message::Heartbeat), Err(GateError::NotConnected)));
    }

    #[tokio::test]
    async fn test_network_connect_and_accept() {
        let net = MemoryNetwork::new();
        let mut acceptor = net.acceptor();
        let mut connector = net.connector();

        let mut dialed = connector.connect(Duration::from_secs(1)).await.unwrap();
        let mut accepted = acceptor.try_accept().await.unwrap().unwrap();

        dialed.send(&Message::ClientReady).unwrap();
        assert_eq!(accepted.try_recv().unwrap().as_deref(), Some("CLIENT_READY"));
        assert_eq!(net.live_connections(), 1);

        net.sever();
        assert!(!accepted.is_open());
        assert!(!dialed.is_open());
    }

    #[tokio::test]
    async fn test_unreachable_refuses() {
        let net = MemoryNetwork::new();
        let _acceptor = net.acceptor();
        net.set_reachable(false);

        assert!(net.connector().connect(Duration::from_secs(1)).await.is_err());
    }
}
