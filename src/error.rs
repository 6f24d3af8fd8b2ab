//! Error taxonomy for editor connections.
//!
//! Every failure a caller can observe is one of these variants. The split
//! matters for recovery: `Remote` and `Timeout` leave the connection usable,
//! everything reported by [`LinkError::is_fatal`] means the connection has to
//! be dropped and re-opened.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::message::RemoteFailure;

/// Errors produced by the protocol client.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Could not establish the byte stream (refused, unresolvable host).
    #[error("Connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// The host process could not be started.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Mid-session read/write failure or the peer went away.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed header, non-JSON body or a buffer that outgrew its limit.
    #[error("Frame error: {0}")]
    Frame(String),

    /// The deadline elapsed while waiting for a specific reply.
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The host answered with a well-formed error payload.
    #[error("Remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// A second request was submitted on a single-request connection.
    #[error("A request is already outstanding on this connection")]
    Concurrency,

    /// The connection was torn down before the request could be sent.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A well-framed message that does not fit the exchange it arrived in.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl LinkError {
    /// Whether the connection that produced this error must be discarded.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::Connect { .. }
                | LinkError::Spawn { .. }
                | LinkError::Transport(_)
                | LinkError::Frame(_)
                | LinkError::ConnectionClosed
        )
    }

    /// The remote failure payload, if this is a `Remote` error.
    pub fn remote_failure(&self) -> Option<RemoteFailure> {
        match self {
            LinkError::Remote {
                code,
                message,
                data,
            } => Some(RemoteFailure {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            }),
            _ => None,
        }
    }
}

/// I/O failures on an established connection.
///
/// Opening errors carry their endpoint and are built as `Connect`/`Spawn`
/// where the endpoint is known.
impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => LinkError::Transport("Stream ended".to_string()),
            kind => LinkError::Transport(format!("{}: {}", kind, err)),
        }
    }
}

impl From<RemoteFailure> for LinkError {
    fn from(failure: RemoteFailure) -> Self {
        LinkError::Remote {
            code: failure.code,
            message: failure.message,
            data: failure.data,
        }
    }
}

/// Result alias using [`LinkError`].
pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_error_display() {
        let timeout_err = LinkError::Timeout(Duration::from_millis(1500));
        assert_eq!(timeout_err.to_string(), "Request timed out after 1500ms");

        let remote_err = LinkError::Remote {
            code: -32000,
            message: "Blueprint already exists".to_string(),
            data: None,
        };
        assert_eq!(
            remote_err.to_string(),
            "Remote error -32000: Blueprint already exists"
        );

        let frame_err = LinkError::Frame("Missing Content-Length header".to_string());
        assert_eq!(
            frame_err.to_string(),
            "Frame error: Missing Content-Length header"
        );
    }

    #[test]
    fn test_link_error_from_io() {
        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: LinkError = broken.into();
        assert!(matches!(&err, LinkError::Transport(msg) if msg.contains("pipe closed")));
        assert!(err.is_fatal());

        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: LinkError = eof.into();
        assert!(matches!(err, LinkError::Transport(_)));
    }

    #[test]
    fn test_fatality() {
        assert!(LinkError::Transport("eof".into()).is_fatal());
        assert!(LinkError::Frame("bad".into()).is_fatal());
        assert!(LinkError::ConnectionClosed.is_fatal());
        assert!(!LinkError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(!LinkError::Concurrency.is_fatal());
        assert!(!LinkError::Remote {
            code: 1,
            message: "x".into(),
            data: None
        }
        .is_fatal());
    }

    #[test]
    fn test_remote_failure_roundtrip() {
        let failure = RemoteFailure {
            code: -32602,
            message: "Missing params.name".to_string(),
            data: Some(serde_json::json!({"field": "name"})),
        };
        let err = LinkError::from(failure.clone());
        assert_eq!(err.remote_failure(), Some(failure));
        assert_eq!(LinkError::Concurrency.remote_failure(), None);
    }
}
