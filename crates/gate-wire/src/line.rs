//! Newline framing over a byte stream

use bytes::{Buf, BytesMut};

use gate_core::{GateError, GateResult};

use crate::Message;

/// Longest line accepted before the buffer is discarded
pub const MAX_LINE_LEN: usize = 256;

/// Reassembles newline-terminated lines from arbitrary read chunks
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        LineBuffer {
            buf: BytesMut::with_capacity(MAX_LINE_LEN),
        }
    }

    /// Append bytes read from the transport
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes waiting for a terminator
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete line without its terminator
    ///
    /// An over-long unterminated line is dropped and reported once.
    pub fn next_line(&mut self) -> GateResult<Option<String>> {
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let line = self.buf.split_to(pos);
                self.buf.advance(1);
                Ok(Some(String::from_utf8_lossy(&line).trim().to_string()))
            }
            None if self.buf.len() > MAX_LINE_LEN => {
                let dropped = self.buf.len();
                self.buf.clear();
                Err(GateError::Protocol(format!(
                    "line exceeds {} bytes, dropped {} bytes",
                    MAX_LINE_LEN, dropped
                )))
            }
            None => Ok(None),
        }
    }
}

/// Encode a message into an outgoing byte buffer
pub fn encode_into(message: &Message, out: &mut BytesMut) {
    out.extend_from_slice(message.encode().as_bytes());
}
