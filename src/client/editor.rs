//! Direct client for the editor's raw command socket.
//!
//! The editor answers exactly one command per connection with one undelimited
//! JSON object, so `EditorClient` opens a fresh TCP connection for every call
//! and closes it on every exit path, including errors and timeouts.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::batch::{BatchCall, BatchResult, EDITOR_BATCH_COMMAND};
use crate::config::LinkConfig;
use crate::correlator::Correlator;
use crate::error::{LinkError, Result};
use crate::framing::Framing;
use crate::message::{into_params, Message, Params};
use crate::notify::NotificationRouter;
use crate::transport::{Connection, Endpoint};

/// Connect timeout used by [`EditorClient::check_connection`].
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Client for the editor plugin's command socket.
///
/// # Example
///
/// ```ignore
/// use editorlink::EditorClient;
/// use serde_json::json;
///
/// let client = EditorClient::new("127.0.0.1", 55557);
/// assert!(client.ping().await?);
///
/// let actors = client.send_command("get_actors_in_level", json!({})).await?;
/// ```
#[derive(Debug, Clone)]
pub struct EditorClient {
    host: String,
    port: u16,
    timeout: Duration,
    batch_timeout: Duration,
    max_buffer_size: usize,
}

/// Reachability of the editor socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub status: ConnectionState,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EditorClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::from_config(&LinkConfig {
            host: host.into(),
            port,
            ..LinkConfig::default()
        })
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout: config.timeout,
            batch_timeout: config.batch_timeout,
            max_buffer_size: config.max_buffer_size,
        }
    }

    /// Set the deadline for ordinary calls.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::Tcp {
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Send one command and wait for its reply.
    ///
    /// `timeout` bounds the whole exchange, connect included.
    ///
    /// # Errors
    ///
    /// - `LinkError::Connect` if the editor is not listening
    /// - `LinkError::Timeout` if no complete reply arrives in time
    /// - `LinkError::Remote` if the editor reports failure
    /// - `LinkError::Transport` / `LinkError::Frame` if the connection breaks
    pub async fn call(&self, command: &str, params: Params, timeout: Duration) -> Result<Value> {
        let started = Instant::now();
        let deadline = started + timeout;

        let connection = tokio::time::timeout_at(deadline, Connection::open(&self.endpoint()))
            .await
            .map_err(|_| LinkError::Timeout(timeout))??;
        let (reader, writer, _) = connection.into_parts();
        let correlator = Correlator::start(
            reader,
            writer,
            Framing::Greedy,
            self.max_buffer_size,
            NotificationRouter::new(),
        );

        debug!("Sending editor command {}", command);
        let outcome = correlator
            .call(
                Message::request(command, params),
                deadline.saturating_duration_since(Instant::now()),
            )
            .await;
        correlator.close().await;

        match outcome {
            Ok(Message::Response { reply, .. }) => {
                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    success = reply.is_success(),
                    "Editor replied to {}",
                    command
                );
                reply.into_result()
            }
            Ok(other) => Err(LinkError::Protocol(format!(
                "Expected a reply to {}, got a {:?}",
                command,
                other.kind()
            ))),
            Err(LinkError::Timeout(_)) => Err(LinkError::Timeout(timeout)),
            Err(err) => Err(err),
        }
    }

    /// [`call`](Self::call) with caller-supplied JSON parameters and the
    /// default timeout.
    pub async fn send_command(&self, command: &str, params: Value) -> Result<Value> {
        self.call(command, into_params(params)?, self.timeout).await
    }

    /// Whether the editor answers a `ping`.
    ///
    /// Any success reply counts; a `pong` message is expected but not
    /// required. A failure reply yields `Ok(false)`; transport problems are
    /// returned as errors.
    pub async fn ping(&self) -> Result<bool> {
        match self.call("ping", Params::new(), self.timeout).await {
            Ok(result) => {
                if result.get("message").and_then(Value::as_str) != Some("pong") {
                    debug!("Editor ping succeeded without a pong: {}", result);
                }
                Ok(true)
            }
            Err(LinkError::Remote { message, .. }) => {
                info!("Editor rejected ping: {}", message);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Probe the socket without sending a command.
    pub async fn check_connection(&self) -> ConnectionStatus {
        let probe = tokio::time::timeout(PROBE_TIMEOUT, Connection::open(&self.endpoint())).await;
        let error = match probe {
            Ok(Ok(connection)) => {
                drop(connection);
                None
            }
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some(LinkError::Timeout(PROBE_TIMEOUT).to_string()),
        };

        ConnectionStatus {
            status: if error.is_none() {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            },
            host: self.host.clone(),
            port: self.port,
            error,
        }
    }

    /// Run `calls` through the editor's native `batch` command.
    ///
    /// The editor reports a batch with failed items as a failure reply that
    /// still carries the items; those are parsed into a normal
    /// [`BatchResult`].
    pub async fn batch(&self, calls: &[BatchCall], stop_on_error: bool) -> Result<BatchResult> {
        let commands = calls
            .iter()
            .map(BatchCall::to_editor_command)
            .collect::<Result<Vec<_>>>()?;
        let params = into_params(json!({
            "commands": commands,
            "stop_on_error": stop_on_error,
        }))?;

        match self
            .call(EDITOR_BATCH_COMMAND, params, self.batch_timeout)
            .await
        {
            Ok(payload) => BatchResult::from_payload(&payload, calls, stop_on_error),
            Err(err) => {
                let Some(data) = err.remote_failure().and_then(|failure| failure.data) else {
                    return Err(err);
                };
                BatchResult::from_payload(&data, calls, stop_on_error).map_err(|_| err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = EditorClient::new("127.0.0.1", port).with_timeout(Duration::from_secs(2));
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, LinkError::Connect { .. }));

        let status = client.check_connection().await;
        assert_eq!(status.status, ConnectionState::Disconnected);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_check_connection_serializes_lowercase() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let status = EditorClient::new("127.0.0.1", port).check_connection().await;
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({"status": "connected", "host": "127.0.0.1", "port": port})
        );
    }

    #[test]
    fn test_from_config() {
        let config = LinkConfig {
            timeout: Duration::from_millis(750),
            ..LinkConfig::default()
        };
        let client = EditorClient::from_config(&config);
        assert_eq!(client.timeout(), Duration::from_millis(750));
        assert_eq!(client.endpoint(), config.editor_endpoint());
    }
}
