//! Message framing for editor connections.
//!
//! Two strategies are supported, selected per connection:
//!
//! ```text
//! Greedy (raw socket)          {"type":"ping","params":{}}
//!                              ^ no delimiter: a reply is complete once the
//!                                accumulated bytes parse as one JSON value
//!
//! Content-Length (stdio)       Content-Length: 47\r\n
//!                              \r\n
//!                              {"jsonrpc":"2.0","method":"tools/list","id":1}
//! ```
//!
//! Encoding is stateless and lives on [`Framing`]. Decoding needs a
//! [`FrameBuffer`] per connection and lives on [`Framer`], which is owned by
//! the connection's read loop.

mod content_length;
mod greedy;

pub use content_length::{ContentLengthDecoder, DEFAULT_MAX_BODY_SIZE, MAX_HEADER_SIZE};
pub use greedy::{GreedyDecoder, DEFAULT_MAX_BUFFER_SIZE};

use crate::error::Result;
use crate::message::Message;

/// Bytes received but not yet decoded, with a cursor over the consumed prefix.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    bytes: Vec<u8>,
    cursor: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes, reclaiming the consumed prefix first.
    pub fn extend(&mut self, data: &[u8]) {
        if self.cursor > 0 {
            self.bytes.drain(..self.cursor);
            self.cursor = 0;
        }
        self.bytes.extend_from_slice(data);
    }

    /// Bytes not yet consumed.
    pub fn unconsumed(&self) -> &[u8] {
        &self.bytes[self.cursor..]
    }

    /// Mark `count` bytes as consumed.
    pub fn consume(&mut self, count: usize) {
        self.cursor = (self.cursor + count).min(self.bytes.len());
        if self.cursor == self.bytes.len() {
            self.clear();
        }
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.cursor = 0;
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if only ASCII whitespace remains.
    pub fn is_blank(&self) -> bool {
        self.unconsumed().iter().all(u8::is_ascii_whitespace)
    }
}

/// Framing strategy of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One raw JSON object per message, completed by a successful parse.
    Greedy,
    /// `Content-Length` header followed by a JSON-RPC 2.0 body.
    ContentLength,
}

impl Framing {
    /// Whether several requests may be outstanding at once.
    ///
    /// Greedy framing carries no ids, so a reply can only ever belong to the
    /// single request in flight.
    pub fn multiplexed(self) -> bool {
        matches!(self, Framing::ContentLength)
    }

    pub fn default_max_size(self) -> usize {
        match self {
            Framing::Greedy => DEFAULT_MAX_BUFFER_SIZE,
            Framing::ContentLength => DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Encode one message into wire bytes.
    pub fn encode(self, message: &Message) -> Result<Vec<u8>> {
        match self {
            Framing::Greedy => greedy::encode(message),
            Framing::ContentLength => content_length::encode(message),
        }
    }
}

#[derive(Debug)]
enum Decoder {
    Greedy(GreedyDecoder),
    ContentLength(ContentLengthDecoder),
}

/// Per-connection framer: stateless encoding plus a stateful decoder.
#[derive(Debug)]
pub struct Framer {
    framing: Framing,
    decoder: Decoder,
}

impl Framer {
    /// Create a framer. `max_size` bounds the greedy buffer or the
    /// length-prefixed body, depending on `framing`.
    pub fn new(framing: Framing, max_size: usize) -> Self {
        let decoder = match framing {
            Framing::Greedy => Decoder::Greedy(GreedyDecoder::new(max_size)),
            Framing::ContentLength => {
                Decoder::ContentLength(ContentLengthDecoder::new(max_size))
            }
        };
        Self { framing, decoder }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        self.framing.encode(message)
    }

    /// Feed newly received bytes and return every message they complete.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Frame` when the stream can no longer be framed.
    /// The connection is unusable after that.
    pub fn decode(&mut self, incoming: &[u8]) -> Result<Vec<Message>> {
        match &mut self.decoder {
            Decoder::Greedy(decoder) => Ok(decoder.decode(incoming)?.into_iter().collect()),
            Decoder::ContentLength(decoder) => decoder.decode(incoming),
        }
    }

    /// Signal end of stream. Fails if a partial message is still buffered.
    pub fn finish(&mut self) -> Result<()> {
        match &mut self.decoder {
            Decoder::Greedy(decoder) => decoder.finish(),
            Decoder::ContentLength(decoder) => decoder.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Params, Reply, RequestId};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_frame_buffer_cursor() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(b"abcdef");
        buffer.consume(2);
        assert_eq!(buffer.unconsumed(), b"cdef");
        assert_eq!(buffer.len(), 4);

        buffer.extend(b"gh");
        assert_eq!(buffer.unconsumed(), b"cdefgh");

        buffer.consume(6);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_frame_buffer_blank() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(b" \r\n\t");
        assert!(buffer.is_blank());
        buffer.extend(b"{");
        assert!(!buffer.is_blank());
    }

    #[test]
    fn test_framing_capabilities() {
        assert!(Framing::ContentLength.multiplexed());
        assert!(!Framing::Greedy.multiplexed());
    }

    #[test]
    fn test_framer_roundtrip_both_strategies() {
        let request = Message::request(
            "create_blueprint",
            serde_json::from_value::<Params>(json!({"name": "BP_Test", "parent_class": "Actor"}))
                .unwrap(),
        );

        let mut greedy = Framer::new(Framing::Greedy, DEFAULT_MAX_BUFFER_SIZE);
        let bytes = greedy.encode(&request).unwrap();
        assert_eq!(greedy.decode(&bytes).unwrap(), vec![request.clone()]);

        let framed_request = request.with_id(Some(RequestId(4)));
        let mut framed = Framer::new(Framing::ContentLength, DEFAULT_MAX_BODY_SIZE);
        let bytes = framed.encode(&framed_request).unwrap();
        assert_eq!(framed.decode(&bytes).unwrap(), vec![framed_request]);

        let response = Message::response(Some(RequestId(4)), Reply::Success(json!({"ok": true})));
        let bytes = framed.encode(&response).unwrap();
        assert_eq!(framed.decode(&bytes).unwrap(), vec![response]);
        assert!(framed.finish().is_ok());
    }
}
