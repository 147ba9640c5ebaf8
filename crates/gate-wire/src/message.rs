//! Command vocabulary exchanged between controller and timer
//!
//! One ASCII command per line:
//!
//! ```text
//! START_TIMER        controller -> timer   begin a timing cycle
//! CLIENT_READY       timer -> controller   handshake complete
//! STOP_TIMER:<ms>    timer -> controller   cycle result
//! HEARTBEAT          controller -> timer   liveness check
//! HEARTBEAT_ACK      timer -> controller   liveness reply
//! ```

use std::fmt;

use gate_core::{GateError, GateResult};

pub const START_TIMER: &str = "START_TIMER";
pub const CLIENT_READY: &str = "CLIENT_READY";
pub const STOP_TIMER: &str = "STOP_TIMER";
pub const HEARTBEAT: &str = "HEARTBEAT";
pub const HEARTBEAT_ACK: &str = "HEARTBEAT_ACK";

/// Separator between a command and its payload
pub const PAYLOAD_SEPARATOR: char = ':';

/// A decoded protocol line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    StartTimer,
    ClientReady,
    StopTimer { elapsed_ms: u64 },
    Heartbeat,
    HeartbeatAck,
    /// Anything else; logged and ignored by both roles
    Unknown(String),
}

impl Message {
    /// Parse one line, ignoring surrounding whitespace
    ///
    /// Unrecognised lines decode to [`Message::Unknown`]. A `STOP_TIMER`
    /// with a missing or non-numeric payload is an error: a fabricated zero
    /// would be indistinguishable from a real measurement. Only the exact
    /// keyword, alone or followed by the separator, counts as `STOP_TIMER`.
    pub fn decode(line: &str) -> GateResult<Message> {
        let line = line.trim();

        let message = match line {
            START_TIMER => Message::StartTimer,
            CLIENT_READY => Message::ClientReady,
            HEARTBEAT => Message::Heartbeat,
            HEARTBEAT_ACK => Message::HeartbeatAck,
            STOP_TIMER => Self::decode_stop("")?,
            _ => match line
                .strip_prefix(STOP_TIMER)
                .and_then(|rest| rest.strip_prefix(PAYLOAD_SEPARATOR))
            {
                Some(payload) => Self::decode_stop(payload)?,
                None => Message::Unknown(line.to_string()),
            },
        };
        Ok(message)
    }

    fn decode_stop(payload: &str) -> GateResult<Message> {
        let malformed = || GateError::MalformedPayload {
            command: STOP_TIMER,
            payload: payload.to_string(),
        };

        let payload = payload.trim();
        if payload.is_empty() || !payload.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let elapsed_ms = payload.parse::<u64>().map_err(|_| malformed())?;
        Ok(Message::StopTimer { elapsed_ms })
    }

    /// Encode as a newline-terminated line
    pub fn encode(&self) -> String {
        format!("{}\n", self)
    }

    /// Command keyword, for logging
    pub fn command(&self) -> &str {
        match self {
            Message::StartTimer => START_TIMER,
            Message::ClientReady => CLIENT_READY,
            Message::StopTimer { .. } => STOP_TIMER,
            Message::Heartbeat => HEARTBEAT,
            Message::HeartbeatAck => HEARTBEAT_ACK,
            Message::Unknown(_) => "UNKNOWN",
        }
    }

    /// Liveness traffic handled inside the session link
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Message::Heartbeat | Message::HeartbeatAck)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::StopTimer { elapsed_ms } => {
                write!(f, "{}{}{}", STOP_TIMER, PAYLOAD_SEPARATOR, elapsed_ms)
            }
            Message::Unknown(raw) => write!(f, "{}", raw),
            other => write!(f, "{}", other.command()),
        }
    }
}
