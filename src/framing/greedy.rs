//! Parse-on-arrival framing for raw editor sockets.
//!
//! The editor writes exactly one JSON object per reply and nothing else, so
//! the only delimiter is "the bytes received so far parse". The buffer is
//! bounded: a peer that keeps sending bytes that never form a document is cut
//! off instead of growing memory without limit.

use serde_json::Value;
use tracing::trace;

use super::FrameBuffer;
use crate::error::{LinkError, Result};
use crate::message::Message;

/// Maximum bytes accumulated before giving up on a reply (64MB).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Encode a message as one undelimited JSON object.
pub(super) fn encode(message: &Message) -> Result<Vec<u8>> {
    let value = message.to_command()?;
    serde_json::to_vec(&value)
        .map_err(|e| LinkError::Frame(format!("Failed to serialize command: {}", e)))
}

/// Accumulates bytes until they form one JSON document.
#[derive(Debug)]
pub struct GreedyDecoder {
    buffer: FrameBuffer,
    max_size: usize,
}

impl GreedyDecoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: FrameBuffer::new(),
            max_size,
        }
    }

    /// Append `incoming` and try to parse the whole buffer.
    ///
    /// Returns `Ok(None)` while the document is incomplete (or not valid
    /// JSON yet). On success the buffer is emptied.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Frame` once the buffer exceeds its maximum size
    /// without producing a document.
    pub fn decode(&mut self, incoming: &[u8]) -> Result<Option<Message>> {
        self.buffer.extend(incoming);

        if self.may_be_complete() {
            match serde_json::from_slice::<Value>(self.buffer.unconsumed()) {
                Ok(value) => {
                    self.buffer.clear();
                    return Message::from_command(value).map(Some);
                }
                Err(e) => {
                    trace!(buffered = self.buffer.len(), "Reply not complete yet: {}", e);
                }
            }
        }

        self.check_limit()?;
        Ok(None)
    }

    /// End of stream: leftover non-whitespace bytes are a truncated reply.
    pub fn finish(&mut self) -> Result<()> {
        if self.buffer.is_blank() {
            self.buffer.clear();
            return Ok(());
        }
        let leftover = self.buffer.len();
        self.buffer.clear();
        Err(LinkError::Frame(format!(
            "Stream ended with {} bytes of incomplete JSON",
            leftover
        )))
    }

    /// Replies are objects (or arrays), so a document can only be complete
    /// once the last non-whitespace byte closes one.
    fn may_be_complete(&self) -> bool {
        matches!(
            self.buffer
                .unconsumed()
                .iter()
                .rev()
                .find(|b| !b.is_ascii_whitespace()),
            Some(b'}') | Some(b']')
        )
    }

    fn check_limit(&mut self) -> Result<()> {
        if self.buffer.len() > self.max_size {
            let size = self.buffer.len();
            self.buffer.clear();
            return Err(LinkError::Frame(format!(
                "Reply of {} bytes exceeds maximum {} bytes without forming a JSON document",
                size, self.max_size
            )));
        }
        Ok(())
    }
}
