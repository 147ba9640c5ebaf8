//! TCP transport implementation

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::net::{TcpListener, TcpStream};

use gate_core::{GateError, GateResult};
use gate_wire::{encode_into, LineBuffer, Message};

use crate::{Acceptor, Connection, Connector};

/// Read chunk size
const READ_CHUNK: usize = 512;

/// Line-oriented TCP connection using non-blocking reads and writes
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    inbound: LineBuffer,
    outbound: BytesMut,
    open: bool,
}

impl TcpConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed for {}: {}", peer, e);
        }
        TcpConnection {
            stream,
            peer,
            inbound: LineBuffer::new(),
            outbound: BytesMut::new(),
            open: true,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Bytes encoded but not yet taken by the socket
    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    /// Write as much buffered output as the socket takes right now
    ///
    /// Readiness is cached by the reactor, so on a fresh stream this may
    /// write nothing until [`Connection::flush`] has awaited writability.
    fn write_pending(&mut self) -> GateResult<()> {
        while !self.outbound.is_empty() {
            match self.stream.try_write(&self.outbound) {
                Ok(0) => {
                    self.open = false;
                    return Err(GateError::Transport(format!("{} stopped accepting data", self.peer)));
                }
                Ok(n) => self.outbound.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.open = false;
                    return Err(GateError::Transport(e.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Drain whatever the socket has buffered into the line assembler
    fn fill(&mut self) -> GateResult<()> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.open {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    self.open = false;
                }
                Ok(n) => self.inbound.extend(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.open = false;
                    return Err(GateError::Transport(e.to_string()));
                }
            }
        }
        Ok(())
    }
}

impl Connection for TcpConnection {
    fn send(&mut self, message: &Message) -> GateResult<()> {
        if !self.open {
            return Err(GateError::NotConnected);
        }
        encode_into(message, &mut self.outbound);
        self.write_pending()
    }

    async fn flush(&mut self, wait: Duration) -> GateResult<()> {
        let deadline = tokio::time::Instant::now() + wait;
        while self.open && !self.outbound.is_empty() {
            match tokio::time::timeout_at(deadline, self.stream.writable()).await {
                Err(_) => {
                    tracing::debug!(peer = %self.peer, pending = self.outbound.len(), "flush deadline reached");
                    break;
                }
                Ok(Err(e)) => {
                    self.open = false;
                    return Err(GateError::Transport(e.to_string()));
                }
                Ok(Ok(())) => self.write_pending()?,
            }
        }
        Ok(())
    }

    fn try_recv(&mut self) -> GateResult<Option<String>> {
        if let Some(line) = self.inbound.next_line()? {
            return Ok(Some(line));
        }
        self.fill()?;
        if !self.outbound.is_empty() && self.open {
            self.write_pending()?;
        }
        self.inbound.next_line()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        // Last chance for buffered output; dropping the stream closes the socket
        if self.open && !self.outbound.is_empty() {
            if let Err(e) = self.write_pending() {
                tracing::debug!(peer = %self.peer, "write on close failed: {}", e);
            }
            if !self.outbound.is_empty() {
                tracing::debug!(peer = %self.peer, dropped = self.outbound.len(), "unsent output discarded on close");
            }
        }
        self.open = false;
        self.outbound.clear();
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

/// Listening endpoint on the controller node
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpAcceptor {
    /// Bind to a local address
    pub async fn bind(addr: SocketAddr) -> GateResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GateError::Transport(e.to_string()))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| GateError::Transport(e.to_string()))?;

        Ok(TcpAcceptor {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Acceptor for TcpAcceptor {
    type Conn = TcpConnection;

    async fn try_accept(&mut self) -> GateResult<Option<TcpConnection>> {
        // A zero timeout polls accept once and gives up if nothing is queued
        match tokio::time::timeout(Duration::ZERO, self.listener.accept()).await {
            Err(_) => Ok(None),
            Ok(Ok((stream, peer))) => Ok(Some(TcpConnection::new(stream, peer))),
            Ok(Err(e)) => Err(GateError::Transport(e.to_string())),
        }
    }
}

/// Dialer on the timer node
pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        TcpConnector { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    async fn connect(&mut self, timeout: Duration) -> GateResult<TcpConnection> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| GateError::Transport(format!("connect to {} timed out after {:?}", self.addr, timeout)))?
            .map_err(|e| GateError::Transport(e.to_string()))?;

        Ok(TcpConnection::new(stream, self.addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn recv_within(conn: &mut TcpConnection, wait: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + wait;
        while tokio::time::Instant::now() < deadline {
            if let Some(line) = conn.try_recv().unwrap() {
                return Some(line);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    async fn accept_within(acceptor: &mut TcpAcceptor, wait: Duration) -> Option<TcpConnection> {
        let deadline = tokio::time::Instant::now() + wait;
        while tokio::time::Instant::now() < deadline {
            if let Some(conn) = acceptor.try_accept().await.unwrap() {
                return Some(conn);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_tcp_acceptor_bind() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        assert_ne!(acceptor.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_try_accept_returns_none_when_idle() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        assert!(acceptor.try_accept().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tcp_line_exchange() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let mut connector = TcpConnector::new(acceptor.local_addr());

        let mut client = connector.connect(Duration::from_secs(2)).await.unwrap();
        let mut server = accept_within(&mut acceptor, Duration::from_secs(2))
            .await
            .expect("no inbound connection");

        server.send(&Message::Heartbeat).unwrap();
        server.flush(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            recv_within(&mut client, Duration::from_secs(2)).await.as_deref(),
            Some("HEARTBEAT")
        );

        client.send(&Message::StopTimer { elapsed_ms: 733 }).unwrap();
        client.flush(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            recv_within(&mut server, Duration::from_secs(2)).await.as_deref(),
            Some("STOP_TIMER:733")
        );
    }

    #[tokio::test]
    async fn test_flush_delivers_first_message_on_fresh_stream() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let mut connector = TcpConnector::new(acceptor.local_addr());

        let mut client = connector.connect(Duration::from_secs(2)).await.unwrap();
        let mut server = accept_within(&mut acceptor, Duration::from_secs(2))
            .await
            .expect("no inbound connection");

        // The very first write on each end, with no reads in between
        client.send(&Message::ClientReady).unwrap();
        client.flush(Duration::from_secs(1)).await.unwrap();
        assert_eq!(client.pending_output(), 0);

        server.send(&Message::Heartbeat).unwrap();
        server.flush(Duration::from_secs(1)).await.unwrap();
        assert_eq!(server.pending_output(), 0);

        assert_eq!(
            recv_within(&mut server, Duration::from_secs(2)).await.as_deref(),
            Some("CLIENT_READY")
        );
        assert_eq!(
            recv_within(&mut client, Duration::from_secs(2)).await.as_deref(),
            Some("HEARTBEAT")
        );
    }

    #[tokio::test]
    async fn test_session_flush_sends_first_heartbeat() {
        use crate::{LinkRole, SessionLink};
        use gate_core::{LinkConfig, Timestamp};

        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let mut connector = TcpConnector::new(acceptor.local_addr());
        let mut client = connector.connect(Duration::from_secs(2)).await.unwrap();

        let mut link = SessionLink::new(LinkRole::Controller, LinkConfig::default());
        let now = Timestamp::from_millis(0);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !link.is_connected() && tokio::time::Instant::now() < deadline {
            link.accept_from(&mut acceptor, now).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(link.is_connected());

        link.maintain_heartbeat(now);
        link.flush().await;
        assert_eq!(
            recv_within(&mut client, Duration::from_secs(2)).await.as_deref(),
            Some("HEARTBEAT")
        );
    }

    #[tokio::test]
    async fn test_peer_close_detected() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let mut connector = TcpConnector::new(acceptor.local_addr());

        let client = connector.connect(Duration::from_secs(2)).await.unwrap();
        let mut server = accept_within(&mut acceptor, Duration::from_secs(2))
            .await
            .expect("no inbound connection");

        drop(client);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while server.is_open() && tokio::time::Instant::now() < deadline {
            let _ = server.try_recv();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!server.is_open());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with no listener
        let addr = {
            let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap();
            acceptor.local_addr()
        };
        let mut connector = TcpConnector::new(addr);
        assert!(matches!(
            connector.connect(Duration::from_secs(1)).await,
            Err(GateError::Transport(_))
        ));
    }
}
