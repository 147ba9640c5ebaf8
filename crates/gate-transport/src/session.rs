//! Session link: one peer connection, handshake bookkeeping and liveness
//!
//! The controller listens and accepts; the newest inbound connection always
//! wins. The timer dials at a fixed retry interval. Both sides treat a
//! closed transport as lost immediately, and treat silence longer than the
//! heartbeat timeout as lost too.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use gate_core::{GateError, GateResult, LinkConfig, LinkLossReason, LinkStatus, Timestamp};
use gate_wire::Message;

use crate::{Acceptor, Connection, Connector};

/// Longest a tick waits for the transport to take buffered output
const FLUSH_WAIT: Duration = Duration::from_millis(10);

/// Connection lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Which end of the link this node is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkRole {
    /// Listens, sends heartbeats
    Controller,
    /// Dials, acknowledges heartbeats
    Timer,
}

/// Connection transitions reported to the owning state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Lost(LinkLossReason),
}

/// Link counters
#[derive(Clone, Debug, Default)]
pub struct LinkStats {
    pub connects: u64,
    pub losses: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub unknown_messages: u64,
    pub protocol_errors: u64,
}

/// Owns the single peer connection of a node
pub struct SessionLink<C: Connection> {
    role: LinkRole,
    config: LinkConfig,
    state: SessionState,
    conn: Option<C>,
    connected_at: Option<Timestamp>,
    last_heartbeat_sent: Option<Timestamp>,
    /// Last time anything arrived from the peer
    last_heartbeat_received: Option<Timestamp>,
    last_attempt: Option<Timestamp>,
    last_loss: Option<LinkLossReason>,
    inbox: VecDeque<Message>,
    stats: LinkStats,
}

impl<C: Connection> SessionLink<C> {
    pub fn new(role: LinkRole, config: LinkConfig) -> Self {
        SessionLink {
            role,
            config,
            state: SessionState::Disconnected,
            conn: None,
            connected_at: None,
            last_heartbeat_sent: None,
            last_heartbeat_received: None,
            last_attempt: None,
            last_loss: None,
            inbox: VecDeque::new(),
            stats: LinkStats::default(),
        }
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn link_status(&self) -> LinkStatus {
        if self.is_connected() {
            LinkStatus::Ok
        } else {
            LinkStatus::NoClient
        }
    }

    pub fn connected_at(&self) -> Option<Timestamp> {
        self.connected_at
    }

    pub fn last_heartbeat_sent(&self) -> Option<Timestamp> {
        self.last_heartbeat_sent
    }

    pub fn last_heartbeat_received(&self) -> Option<Timestamp> {
        self.last_heartbeat_received
    }

    /// Why the previous connection ended, if one has
    pub fn last_loss(&self) -> Option<LinkLossReason> {
        self.last_loss
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn peer(&self) -> Option<String> {
        self.conn.as_ref().map(|c| c.peer())
    }

    /// Adopt a freshly established connection, closing any previous one
    pub fn attach(&mut self, conn: C, now: Timestamp) -> LinkEvent {
        if let Some(mut old) = self.conn.take() {
            let reason = LinkLossReason::Replaced;
            tracing::info!(old = %old.peer(), new = %conn.peer(), "link lost: {}", reason);
            old.close();
            self.last_loss = Some(reason);
            self.stats.losses += 1;
        }

        tracing::info!(peer = %conn.peer(), "peer connected");
        self.conn = Some(conn);
        self.state = SessionState::Connected;
        self.connected_at = Some(now);
        self.last_heartbeat_sent = None;
        // Liveness is measured from the moment of connection
        self.last_heartbeat_received = Some(now);
        self.inbox.clear();
        self.stats.connects += 1;
        LinkEvent::Connected
    }

    /// Close the connection and report why
    pub fn disconnect(&mut self, reason: LinkLossReason) -> LinkEvent {
        if let Some(mut conn) = self.conn.take() {
            tracing::warn!(peer = %conn.peer(), "link lost: {}", reason);
            conn.close();
        }
        self.state = SessionState::Disconnected;
        self.connected_at = None;
        self.inbox.clear();
        self.last_loss = Some(reason);
        self.stats.losses += 1;
        LinkEvent::Lost(reason)
    }

    /// Stage 1 of every tick: detect transport loss, then heartbeat silence
    pub fn check_liveness(&mut self, now: Timestamp) -> Option<LinkEvent> {
        if self.state != SessionState::Connected {
            return None;
        }

        let open = self.conn.as_ref().is_some_and(|c| c.is_open());
        if !open {
            return Some(self.disconnect(LinkLossReason::TransportClosed));
        }

        let heard = self.last_heartbeat_received.unwrap_or(now);
        if now - heard >= self.config.heartbeat_timeout {
            return Some(self.disconnect(LinkLossReason::HeartbeatTimeout));
        }
        None
    }

    /// Controller side: adopt a pending inbound connection, if any
    pub async fn accept_from<A>(&mut self, acceptor: &mut A, now: Timestamp) -> Option<LinkEvent>
    where
        A: Acceptor<Conn = C>,
    {
        match acceptor.try_accept().await {
            Ok(Some(conn)) => Some(self.attach(conn, now)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                None
            }
        }
    }

    /// Timer side: dial the peer if disconnected and the retry delay passed
    ///
    /// Blocks for at most `connection_timeout`.
    pub async fn connect_with<K>(&mut self, connector: &mut K, now: Timestamp) -> Option<LinkEvent>
    where
        K: Connector<Conn = C>,
    {
        if self.state == SessionState::Connected || !self.should_attempt(now) {
            return None;
        }

        self.state = SessionState::Connecting;
        self.last_attempt = Some(now);
        match connector.connect(self.config.connection_timeout).await {
            Ok(conn) => Some(self.attach(conn, now)),
            Err(e) => {
                tracing::warn!("connection attempt failed: {}", e);
                self.state = SessionState::Disconnected;
                None
            }
        }
    }

    /// Whether the fixed reconnect interval has elapsed
    pub fn should_attempt(&self, now: Timestamp) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => now - last >= self.config.reconnect_delay,
        }
    }

    /// Send one message to the peer
    ///
    /// A transport that closed since the last liveness check fails with
    /// [`GateError::LinkLoss`]; the loss itself is reported next tick.
    pub fn send(&mut self, message: &Message, now: Timestamp) -> GateResult<()> {
        let conn = self.conn.as_mut().ok_or(GateError::NotConnected)?;
        if !conn.is_open() {
            return Err(GateError::LinkLoss(LinkLossReason::TransportClosed));
        }
        conn.send(message)?;

        if message.is_heartbeat() {
            tracing::trace!(message = %message, "sent");
        } else {
            tracing::debug!(message = %message, "sent");
        }
        self.stats.messages_out += 1;
        if *message == Message::Heartbeat {
            self.last_heartbeat_sent = Some(now);
            self.stats.heartbeats_sent += 1;
        }
        Ok(())
    }

    /// Controller side: send a heartbeat once per interval while connected
    pub fn maintain_heartbeat(&mut self, now: Timestamp) {
        if self.role != LinkRole::Controller || !self.is_connected() {
            return;
        }
        let due = match self.last_heartbeat_sent {
            None => true,
            Some(sent) => now - sent >= self.config.heartbeat_interval,
        };
        if due {
            if let Err(e) = self.send(&Message::Heartbeat, now) {
                tracing::warn!("heartbeat send failed: {}", e);
            }
        }
    }

    /// Read every complete line the peer has sent
    ///
    /// Heartbeats are answered here; application messages are queued for
    /// the state machine. Unknown and malformed lines are logged and dropped.
    /// Returns the number of lines read.
    pub fn poll_incoming(&mut self, now: Timestamp) -> usize {
        let mut read = 0;
        loop {
            let Some(conn) = self.conn.as_mut() else {
                break;
            };
            let line = match conn.try_recv() {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("receive failed: {}", e);
                    self.stats.protocol_errors += 1;
                    break;
                }
            };

            read += 1;
            self.last_heartbeat_received = Some(now);
            if line.is_empty() {
                continue;
            }
            self.stats.messages_in += 1;
            self.handle_line(&line, now);
        }
        read
    }

    fn handle_line(&mut self, line: &str, now: Timestamp) {
        match Message::decode(line) {
            Ok(Message::Heartbeat) => {
                self.stats.heartbeats_received += 1;
                if self.role == LinkRole::Timer {
                    if let Err(e) = self.send(&Message::HeartbeatAck, now) {
                        tracing::warn!("heartbeat ack failed: {}", e);
                    }
                }
            }
            Ok(Message::HeartbeatAck) => {
                self.stats.heartbeats_received += 1;
            }
            Ok(Message::Unknown(raw)) => {
                tracing::warn!(line = %raw, "unknown message ignored");
                self.stats.unknown_messages += 1;
            }
            Ok(message) => {
                tracing::debug!(message = %message, "received");
                self.inbox.push_back(message);
            }
            Err(e) => {
                tracing::warn!(line = %line, "discarding message: {}", e);
                self.stats.protocol_errors += 1;
            }
        }
    }

    /// Last stage of every tick: hand buffered output to the transport
    ///
    /// A failure closes the connection; the next liveness check reports it.
    pub async fn flush(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if let Err(e) = conn.flush(FLUSH_WAIT).await {
            tracing::warn!(peer = %conn.peer(), "flush failed: {}", e);
            self.stats.protocol_errors += 1;
        }
    }

    /// Take the queued application messages in arrival order
    pub fn drain_inbox(&mut self) -> Vec<Message> {
        self.inbox.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory_pair, MemoryConnection, MemoryNetwork};
    use std::time::Duration;

    fn ms(v: u64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn controller_link() -> SessionLink<MemoryConnection> {
        SessionLink::new(LinkRole::Controller, LinkConfig::default())
    }

    fn timer_link() -> SessionLink<MemoryConnection> {
        SessionLink::new(LinkRole::Timer, LinkConfig::default())
    }

    #[test]
    fn test_heartbeat_timeout_exact() {
        let mut link = controller_link();
        let (local, _silent_peer) = memory_pair("controller", "timer");
        link.attach(local, ms(0));

        assert_eq!(link.check_liveness(ms(14_999)), None);
        assert!(link.is_connected());
        assert_eq!(
            link.check_liveness(ms(15_000)),
            Some(LinkEvent::Lost(LinkLossReason::HeartbeatTimeout))
        );
        assert_eq!(link.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_traffic_refreshes_liveness() {
        let mut link = controller_link();
        let (local, mut peer) = memory_pair("controller", "timer");
        link.attach(local, ms(0));

        peer.send(&Message::HeartbeatAck).unwrap();
        link.poll_incoming(ms(10_000));

        assert_eq!(link.check_liveness(ms(24_999)), None);
        assert!(link.check_liveness(ms(25_000)).is_some());
    }

    #[test]
    fn test_transport_close_takes_priority() {
        let mut link = controller_link();
        let (local, mut peer) = memory_pair("controller", "timer");
        link.attach(local, ms(0));

        peer.close();
        assert_eq!(
            link.check_liveness(ms(20_000)),
            Some(LinkEvent::Lost(LinkLossReason::TransportClosed))
        );
    }

    #[test]
    fn test_new_connection_replaces_old() {
        let mut link = controller_link();
        let (first, first_peer) = memory_pair("controller", "timer-1");
        let (second, _second_peer) = memory_pair("controller", "timer-2");

        link.attach(first, ms(0));
        assert_eq!(link.attach(second, ms(100)), LinkEvent::Connected);

        assert!(!first_peer.is_open());
        assert_eq!(link.peer().as_deref(), Some("timer-2"));
        assert_eq!(link.connected_at(), Some(ms(100)));
        assert_eq!(link.last_loss(), Some(LinkLossReason::Replaced));
        assert_eq!(link.stats().losses, 1);
    }

    #[test]
    fn test_send_on_closed_transport_is_link_loss() {
        let mut link = controller_link();
        let (local, mut peer) = memory_pair("controller", "timer");
        link.attach(local, ms(0));
        assert_eq!(link.last_loss(), None);

        peer.close();
        assert_eq!(
            link.send(&Message::StartTimer, ms(10)),
            Err(GateError::LinkLoss(LinkLossReason::TransportClosed))
        );
        assert_eq!(link.stats().messages_out, 0);

        link.check_liveness(ms(20));
        assert_eq!(link.last_loss(), Some(LinkLossReason::TransportClosed));
        assert_eq!(link.send(&Message::StartTimer, ms(30)), Err(GateError::NotConnected));
    }

    #[test]
    fn test_timer_acks_heartbeat() {
        let mut link = timer_link();
        let (local, mut controller) = memory_pair("timer", "controller");
        link.attach(local, ms(0));

        controller.send(&Message::Heartbeat).unwrap();
        link.poll_incoming(ms(5_000));

        assert_eq!(controller.try_recv().unwrap().as_deref(), Some("HEARTBEAT_ACK"));
        assert!(link.drain_inbox().is_empty());
        assert_eq!(link.last_heartbeat_received(), Some(ms(5_000)));
    }

    #[test]
    fn test_controller_heartbeat_interval() {
        let mut link = controller_link();
        let (local, mut peer) = memory_pair("controller", "timer");
        link.attach(local, ms(0));

        link.maintain_heartbeat(ms(0));
        link.maintain_heartbeat(ms(4_999));
        link.maintain_heartbeat(ms(5_000));

        assert_eq!(peer.queued(), 2);
        assert_eq!(link.stats().heartbeats_sent, 2);
        assert_eq!(link.last_heartbeat_sent(), Some(ms(5_000)));
    }

    #[test]
    fn test_unknown_and_malformed_dropped() {
        let mut link = controller_link();
        let (local, mut peer) = memory_pair("controller", "timer");
        link.attach(local, ms(0));

        peer.send_raw("GARBAGE").unwrap();
        peer.send_raw("STOP_TIMER:abc").unwrap();
        peer.send_raw("CLIENT_READY").unwrap();
        peer.send_raw("STOP_TIMER:733").unwrap();
        assert_eq!(link.poll_incoming(ms(1)), 4);

        assert_eq!(
            link.drain_inbox(),
            vec![Message::ClientReady, Message::StopTimer { elapsed_ms: 733 }]
        );
        assert_eq!(link.stats().unknown_messages, 1);
        assert_eq!(link.stats().protocol_errors, 1);
    }

    #[test]
    fn test_send_without_peer() {
        let mut link = controller_link();
        assert_eq!(
            link.send(&Message::StartTimer, ms(0)),
            Err(GateError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_reconnect_delay() {
        let net = MemoryNetwork::new();
        let _acceptor = net.acceptor();
        let mut connector = net.connector();
        let mut link = timer_link();

        net.set_reachable(false);
        assert_eq!(link.connect_with(&mut connector, ms(0)).await, None);
        assert_eq!(link.state(), SessionState::Disconnected);

        net.set_reachable(true);
        // Still inside the retry interval
        assert_eq!(link.connect_with(&mut connector, ms(1_999)).await, None);
        assert_eq!(
            link.connect_with(&mut connector, ms(2_000)).await,
            Some(LinkEvent::Connected)
        );
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn test_accept_from() {
        let net = MemoryNetwork::new();
        let mut acceptor = net.acceptor();
        let mut connector = net.connector();
        let mut link = controller_link();

        assert_eq!(link.accept_from(&mut acceptor, ms(0)).await, None);
        let _dialed = connector.connect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            link.accept_from(&mut acceptor, ms(20)).await,
            Some(LinkEvent::Connected)
        );
    }
}
