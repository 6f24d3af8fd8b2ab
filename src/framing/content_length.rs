//! Content-Length message framing for JSON-RPC over stdio.
//!
//! This is the HTTP-style framing used by the Language Server Protocol:
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! Header names are matched case-insensitively, unknown headers (e.g.
//! `Content-Type`) are ignored, and a bare `\n\n` terminator is tolerated.

use serde_json::Value;

use super::FrameBuffer;
use crate::error::{LinkError, Result};
use crate::message::Message;

/// Maximum body size (100MB) to prevent OOM from malicious/buggy hosts.
pub const DEFAULT_MAX_BODY_SIZE: usize = 100 * 1024 * 1024;

/// Maximum header block size before the terminator must have been seen.
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Encode a message as a Content-Length framed JSON-RPC envelope.
pub(super) fn encode(message: &Message) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(&message.to_jsonrpc())
        .map_err(|e| LinkError::Frame(format!("Failed to serialize message: {}", e)))?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());

    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Accumulating header lines until the blank-line terminator.
    Header,
    /// Header parsed; waiting for exactly `length` body bytes.
    Body { length: usize },
}

/// Two-phase decoder: header, then exactly N body bytes.
#[derive(Debug)]
pub struct ContentLengthDecoder {
    buffer: FrameBuffer,
    state: State,
    max_body: usize,
}

impl ContentLengthDecoder {
    pub fn new(max_body: usize) -> Self {
        Self {
            buffer: FrameBuffer::new(),
            state: State::Header,
            max_body,
        }
    }

    /// Append `incoming` and decode every complete frame.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Frame` if:
    /// - No Content-Length header is present in a completed header block
    /// - Content-Length is not a number or exceeds the maximum body size
    /// - The header block grows past `MAX_HEADER_SIZE`
    /// - The body is not a valid JSON-RPC envelope
    pub fn decode(&mut self, incoming: &[u8]) -> Result<Vec<Message>> {
        self.buffer.extend(incoming);

        let mut messages = Vec::new();
        while let Some(message) = self.next_message()? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// End of stream: anything but a clean frame boundary is an error.
    pub fn finish(&mut self) -> Result<()> {
        match self.state {
            State::Body { length } => Err(LinkError::Frame(format!(
                "Stream ended after {} of {} body bytes",
                self.buffer.len(),
                length
            ))),
            State::Header if self.buffer.is_blank() => {
                self.buffer.clear();
                Ok(())
            }
            State::Header => Err(LinkError::Frame(
                "Stream ended inside a frame header".to_string(),
            )),
        }
    }

    fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            match self.state {
                State::Header => {
                    self.skip_blank_lines();

                    let Some((header_len, terminator_len)) =
                        find_terminator(self.buffer.unconsumed())
                    else {
                        if self.buffer.len() > MAX_HEADER_SIZE {
                            return Err(LinkError::Frame(format!(
                                "Header exceeds {} bytes without a terminator",
                                MAX_HEADER_SIZE
                            )));
                        }
                        return Ok(None);
                    };

                    let length = parse_content_length(
                        &self.buffer.unconsumed()[..header_len],
                        self.max_body,
                    )?;
                    self.buffer.consume(header_len + terminator_len);
                    self.state = State::Body { length };
                }
                State::Body { length } => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }

                    let value: Value = serde_json::from_slice(&self.buffer.unconsumed()[..length])
                        .map_err(|e| LinkError::Frame(format!("Body is not valid JSON: {}", e)))?;
                    self.buffer.consume(length);
                    self.state = State::Header;

                    return Message::from_jsonrpc(value).map(Some);
                }
            }
        }
    }

    fn skip_blank_lines(&mut self) {
        let blank = self
            .buffer
            .unconsumed()
            .iter()
            .take_while(|b| matches!(b, b'\r' | b'\n' | b' ' | b'\t'))
            .count();
        self.buffer.consume(blank);
    }
}

/// Locate the header terminator; returns (header length, terminator length).
fn find_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = find(buf, b"\r\n\r\n").map(|pos| (pos, 4));
    let lf = find(buf, b"\n\n").map(|pos| (pos, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Extract the Content-Length value from a header block.
pub(crate) fn parse_content_length(header: &[u8], max_body: usize) -> Result<usize> {
    let text = std::str::from_utf8(header)
        .map_err(|_| LinkError::Frame("Header block is not valid ASCII".to_string()))?;

    let mut content_length = None;
    for line in text.lines() {
        // Parse Content-Length header (case-insensitive per HTTP spec)
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(value.parse::<usize>().map_err(|_| {
                    LinkError::Frame(format!("Invalid Content-Length value: {}", value))
                })?);
            }
        }
    }

    let size = content_length
        .ok_or_else(|| LinkError::Frame("Missing Content-Length header".to_string()))?;

    if size > max_body {
        return Err(LinkError::Frame(format!(
            "Message size {} exceeds maximum {} bytes",
            size, max_body
        )));
    }

    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageKind, Reply, RequestId};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    #[test]
    fn test_partial_body_never_decodes() {
        let bytes = frame(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#);
        let header_end = bytes.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;

        let mut decoder = ContentLengthDecoder::new(DEFAULT_MAX_BODY_SIZE);
        assert!(decoder.decode(&bytes[..3]).unwrap().is_empty());
        assert!(decoder.decode(&bytes[3..header_end]).unwrap().is_empty());
        assert_eq!(decoder.state, State::Body { length: bytes.len() - header_end });
        assert!(decoder.decode(&bytes[header_end..bytes.len() - 1]).unwrap().is_empty());

        let messages = decoder.decode(&bytes[bytes.len() - 1..]).unwrap();
        assert_eq!(
            messages,
            vec![Message::response(
                Some(RequestId(1)),
                Reply::Success(json!({"tools": []}))
            )]
        );
        assert!(decoder.buffer.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = frame(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#);
        let mut decoder = ContentLengthDecoder::new(DEFAULT_MAX_BODY_SIZE);

        let mut decoded = Vec::new();
        for byte in &bytes {
            decoded.extend(decoder.decode(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].kind(), MessageKind::Notification);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut bytes = frame(r#"{"jsonrpc":"2.0","id":2,"result":2}"#);
        bytes.extend(frame(r#"{"jsonrpc":"2.0","id":1,"result":1}"#));

        let mut decoder = ContentLengthDecoder::new(DEFAULT_MAX_BODY_SIZE);
        let ids: Vec<_> = decoder
            .decode(&bytes)
            .unwrap()
            .iter()
            .map(Message::id)
            .collect();
        assert_eq!(ids, vec![Some(RequestId(2)), Some(RequestId(1))]);
    }

    #[test]
    fn test_header_variants() {
        let body = r#"{"jsonrpc":"2.0","id":9,"result":true}"#;
        let raw = format!(
            "content-length : {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{}",
            body.len(),
            body
        );
        let mut decoder = ContentLengthDecoder::new(DEFAULT_MAX_BODY_SIZE);
        assert_eq!(decoder.decode(raw.as_bytes()).unwrap().len(), 1);

        let raw = format!("Content-Length: {}\n\n{}", body.len(), body);
        let mut decoder = ContentLengthDecoder::new(DEFAULT_MAX_BODY_SIZE);
        assert_eq!(decoder.decode(raw.as_bytes()).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_content_length() {
        let mut decoder = ContentLengthDecoder::new(DEFAULT_MAX_BODY_SIZE);
        let err = decoder
            .decode(b"Content-Type: application/json\r\n\r\n{}")
            .unwrap_err();
        assert!(err.to_string().contains("Missing Content-Length"));
    }

    #[test]
    fn test_invalid_content_length() {
        let mut decoder = ContentLengthDecoder::new(DEFAULT_MAX_BODY_SIZE);
        let err = decoder.decode(b"Content-Length: -5\r\n\r\n").unwrap_err();
        assert!(err.to_string().contains("Invalid Content-Length"));
    }

    #[test]
    fn test_rejects_oversized_message() {
        let mut decoder = ContentLengthDecoder::new(1024);
        let err = decoder.decode(b"Content-Length: 1025\r\n\r\n").unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_unterminated_header_is_bounded() {
        let mut decoder = ContentLengthDecoder::new(DEFAULT_MAX_BODY_SIZE);
        let junk = vec![b'x'; MAX_HEADER_SIZE + 1];
        assert!(matches!(decoder.decode(&junk), Err(LinkError::Frame(_))));
    }

    #[test]
    fn test_non_json_body() {
        let mut decoder = ContentLengthDecoder::new(DEFAULT_MAX_BODY_SIZE);
        let err = decoder.decode(&frame("not json")).unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn test_finish_mid_body() {
        let bytes = frame(r#"{"jsonrpc":"2.0","id":1,"result":1}"#);
        let mut decoder = ContentLengthDecoder::new(DEFAULT_MAX_BODY_SIZE);
        decoder.decode(&bytes[..bytes.len() - 3]).unwrap();
        let err = decoder.finish().unwrap_err();
        assert!(err.to_string().contains("Stream ended after"));
    }

    #[test]
    fn test_finish_at_boundary() {
        let mut decoder = ContentLengthDecoder::new(DEFAULT_MAX_BODY_SIZE);
        decoder
            .decode(&frame(r#"{"jsonrpc":"2.0","id":1,"result":1}"#))
            .unwrap();
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_encode_counts_bytes_not_chars() {
        let message = Message::notification(
            "notifications/message",
            serde_json::from_value(json!({"message": "Würfel 完成"})).unwrap(),
        );
        let bytes = encode(&message).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(header, format!("Content-Length: {}", body.len()));
        assert!(body.len() > body.chars().count());
    }
}
