//! Client for the sidecar process.
//!
//! The sidecar speaks Content-Length framed JSON-RPC on its standard streams
//! and proxies tool calls to the editor. Unlike the raw socket, one
//! connection carries many concurrent requests, host notifications and
//! batches.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::batch::{BatchCall, BatchExecutor, BatchOptions, BatchResult};
use crate::config::LinkConfig;
use crate::correlator::Correlator;
use crate::error::{LinkError, Result};
use crate::framing::Framing;
use crate::message::{
    into_params, normalize_reply, Message, Params, RemoteFailure, COMMAND_FAILED,
};
use crate::notify::{Notification, NotificationRouter, Subscription};
use crate::transport::{ChildProcess, Connection, Endpoint, ProcessSpec};

/// Protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name sent in `initialize`.
const CLIENT_NAME: &str = "editorlink";

/// A tool advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        rename = "inputSchema",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<Value>,
}

/// Joined `text` items of a tool result's `content`.
pub(crate) fn tool_text(result: &Value) -> Option<String> {
    let texts: Vec<&str> = result
        .get("content")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect();
    (!texts.is_empty()).then(|| texts.join("\n"))
}

/// The failure carried by a tool result flagged `isError`, if any.
pub(crate) fn tool_failure(result: &Value, tool: &str) -> Option<RemoteFailure> {
    if result.get("isError").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    Some(RemoteFailure {
        code: COMMAND_FAILED,
        message: tool_text(result).unwrap_or_else(|| format!("Tool {} failed", tool)),
        data: result.get("structuredContent").cloned(),
    })
}

/// Client for a running sidecar.
///
/// # Example
///
/// ```ignore
/// use editorlink::{LinkConfig, SidecarClient};
///
/// let config = LinkConfig::from_env()?;
/// let mut sidecar = SidecarClient::spawn(&config.sidecar_spec(), &config).await?;
/// sidecar.initialize().await?;
///
/// let tools = sidecar.list_tools().await?;
/// let stderr = sidecar.close().await;
/// ```
pub struct SidecarClient {
    correlator: Correlator,
    process: Option<ChildProcess>,
    timeout: Duration,
    batch_timeout: Duration,
    server_info: Option<Value>,
}

impl SidecarClient {
    /// Launch the sidecar and start correlating on its stdio.
    ///
    /// The handshake is not performed; call [`initialize`](Self::initialize).
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Spawn` if the executable cannot be started.
    pub async fn spawn(spec: &ProcessSpec, config: &LinkConfig) -> Result<Self> {
        let connection = Connection::open(&Endpoint::Process(spec.clone())).await?;
        Ok(Self::from_connection(connection, config))
    }

    /// Wrap an already open connection (in-memory pipes in tests).
    pub fn from_connection(connection: Connection, config: &LinkConfig) -> Self {
        let (reader, writer, process) = connection.into_parts();
        let correlator = Correlator::start(
            reader,
            writer,
            Framing::ContentLength,
            config.max_body_size,
            NotificationRouter::new(),
        );

        Self {
            correlator,
            process,
            timeout: config.timeout,
            batch_timeout: config.batch_timeout,
            server_info: None,
        }
    }

    /// Perform the `initialize` handshake and send
    /// `notifications/initialized`.
    ///
    /// Returns the server's `initialize` result.
    pub async fn initialize(&mut self) -> Result<Value> {
        let params = into_params(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        }))?;
        let result = self.request("initialize", params, self.timeout).await?;

        if let Some(version) = result.get("protocolVersion").and_then(Value::as_str) {
            if version != PROTOCOL_VERSION {
                warn!(
                    "Sidecar negotiated protocol {} (requested {})",
                    version, PROTOCOL_VERSION
                );
            }
        }
        info!(
            "Sidecar initialized: {}",
            result
                .pointer("/serverInfo/name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown server")
        );

        self.correlator
            .notify(
                Message::notification("notifications/initialized", Params::new()),
                self.timeout,
            )
            .await?;

        self.server_info = Some(result.clone());
        Ok(result)
    }

    /// The `initialize` result, once the handshake has completed.
    pub fn server_info(&self) -> Option<&Value> {
        self.server_info.as_ref()
    }

    /// Send a JSON-RPC request and return its `result`.
    ///
    /// # Errors
    ///
    /// - `LinkError::Remote` for a JSON-RPC error response
    /// - `LinkError::Timeout` if no reply arrives within `timeout`
    /// - `LinkError::Transport` / `LinkError::Frame` if the sidecar goes away
    pub async fn request(&self, method: &str, params: Params, timeout: Duration) -> Result<Value> {
        match self
            .correlator
            .call(Message::request(method, params), timeout)
            .await?
        {
            Message::Response { reply, .. } => reply.into_result(),
            other => Err(LinkError::Protocol(format!(
                "Expected a reply to {}, got a {:?}",
                method,
                other.kind()
            ))),
        }
    }

    /// Invoke a tool through `tools/call`.
    ///
    /// A tool result flagged `isError` becomes `LinkError::Remote` carrying
    /// the result text as message and `structuredContent` as data.
    pub async fn call_tool(&self, name: &str, arguments: Params, timeout: Duration) -> Result<Value> {
        let params = into_params(json!({ "name": name, "arguments": arguments }))?;
        let result = self.request("tools/call", params, timeout).await?;

        match tool_failure(&result, name) {
            Some(failure) => Err(failure.into()),
            None => Ok(result),
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let result = self.request("tools/list", Params::new(), self.timeout).await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| LinkError::Protocol("tools/list reply has no tools".to_string()))?;
        serde_json::from_value(tools)
            .map_err(|e| LinkError::Protocol(format!("Malformed tools/list reply: {}", e)))
    }

    /// Whether the editor behind the sidecar answers a ping.
    pub async fn ping(&self) -> Result<bool> {
        match self.editor_command("unreal.ping", Params::new()).await {
            Ok(_) => Ok(true),
            Err(LinkError::Remote { message, .. }) => {
                info!("Editor ping through sidecar failed: {}", message);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Pass an editor command through the sidecar.
    ///
    /// The editor's raw reply is normalized the same way as on a direct
    /// connection, so both clients return the same payload for a command.
    pub async fn send_command(&self, command: &str, params: Params) -> Result<Value> {
        let arguments = into_params(json!({ "type": command, "params": params }))?;
        self.editor_command("unreal.send_command", arguments).await
    }

    async fn editor_command(&self, tool: &str, arguments: Params) -> Result<Value> {
        let result = self.call_tool(tool, arguments, self.timeout).await?;
        match result.get("structuredContent") {
            Some(Value::Object(reply)) => normalize_reply(reply.clone()).into_result(),
            Some(other) => Ok(other.clone()),
            None => Err(LinkError::Protocol(format!(
                "{} returned no editor reply: {}",
                tool,
                tool_text(&result).unwrap_or_default()
            ))),
        }
    }

    /// Register a handler for host notifications.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.correlator.router().subscribe(handler)
    }

    /// Run a batch through the sidecar's batch tool, reporting routed
    /// notifications to `observer` while it runs.
    pub async fn batch<F>(
        &self,
        calls: &[BatchCall],
        options: BatchOptions,
        observer: F,
    ) -> Result<BatchResult>
    where
        F: FnMut(&Notification),
    {
        BatchExecutor::new(&self.correlator, self.batch_timeout)
            .run(calls, options, observer)
            .await
    }

    /// Requests awaiting a reply.
    pub fn outstanding(&self) -> usize {
        self.correlator.outstanding()
    }

    /// Close the connection and stop the sidecar.
    ///
    /// Pending requests fail with a transport error. Returns whatever the
    /// sidecar wrote to stderr, for diagnostics.
    pub async fn close(mut self) -> String {
        self.correlator.close().await;

        let Some(mut process) = self.process.take() else {
            return String::new();
        };
        match process.terminate().await {
            Some(status) => debug!("Sidecar exited with {}", status),
            None => warn!("Sidecar did not report an exit status"),
        }
        process.stderr_text()
    }
}
