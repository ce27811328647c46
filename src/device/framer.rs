//! Splitter byte framing for stream devices
//!
//! Incoming bytes accumulate until the splitter byte is seen; the bytes
//! before it form one message. The splitter is never part of a message and
//! cannot be escaped. If the buffer reaches [`MAX_MESSAGE_LENGTH`] without a
//! splitter it is cleared and the framer discards input up to and including
//! the next splitter, so a truncated message is never emitted.

use std::time::Duration;
use tracing::warn;

/// Size of each read from the underlying stream
pub const READ_BUFFER_SIZE: usize = 128;
/// Reassembly buffer limit
pub const MAX_MESSAGE_LENGTH: usize = 1000;
pub const DEFAULT_SPLITTER: u8 = b'\n';

#[derive(Debug, Clone)]
pub struct Framer {
    splitter: u8,
    max_len: usize,
    buffer: Vec<u8>,
    discarding: bool,
}

impl Framer {
    pub fn new(splitter: u8) -> Self {
        Self::with_max_len(splitter, MAX_MESSAGE_LENGTH)
    }

    pub fn with_max_len(splitter: u8, max_len: usize) -> Self {
        Self {
            splitter,
            max_len: max_len.max(1),
            buffer: Vec::new(),
            discarding: false,
        }
    }

    pub fn splitter(&self) -> u8 {
        self.splitter
    }

    /// Feed one byte; returns a complete message when `byte` is the splitter
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        if byte == self.splitter {
            if self.discarding {
                self.discarding = false;
                return None;
            }
            return Some(std::mem::take(&mut self.buffer));
        }

        if self.discarding {
            return None;
        }

        self.buffer.push(byte);
        if self.buffer.len() >= self.max_len {
            warn!(
                limit = self.max_len,
                "No splitter within message limit, discarding until next splitter"
            );
            self.buffer.clear();
            self.discarding = true;
        }
        None
    }

    /// Feed a chunk read from the stream, returning completed messages in order
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|&b| self.push(b)).collect()
    }

    /// Bytes waiting for a splitter
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_discarding(&self) -> bool {
        self.discarding
    }
}

/// Payload with the splitter appended, as written to the stream
pub fn encode_frame(payload: &[u8], splitter: u8) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.extend_from_slice(payload);
    frame.push(splitter);
    frame
}

/// Sleep for the configured pre-transmit delay, if any
pub async fn pre_transmit_delay(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
