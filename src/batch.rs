//! Ordered multi-call batches with partial-failure semantics.
//!
//! A batch is one remote call: the host runs the sub-calls in order and
//! reports one item per call it attempted. With `stop_on_error` the host stops
//! at the first failure, so the result may be shorter than the submission.
//! Progress notifications emitted while the batch runs are handed to an
//! observer; only the correlated reply ends the wait.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::sidecar::{tool_failure, tool_text};
use crate::correlator::Correlator;
use crate::error::{LinkError, Result};
use crate::message::{into_params, Message, Params, RemoteFailure, COMMAND_FAILED};
use crate::notify::Notification;

/// Tool name of the sidecar's batch operation.
pub const BATCH_TOOL: &str = "unreal.batch";

/// Editor command that runs a batch natively.
pub const EDITOR_BATCH_COMMAND: &str = "batch";

/// One named call in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Params,
}

impl BatchCall {
    pub fn new(name: impl Into<String>, arguments: Params) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// The editor command this call maps to, as `{"type", "params"}`.
    ///
    /// Sidecar tool names are translated: `unreal.ping` becomes `ping`,
    /// `unreal.send_command` unwraps its `type`/`params`, and the legacy
    /// aliases are renamed. Anything else is sent as a command of the same
    /// name.
    pub fn to_editor_command(&self) -> Result<Value> {
        let (command, params) = match self.name.as_str() {
            "unreal.ping" => ("ping", Params::new()),
            "unreal.send_command" => {
                let command = self
                    .arguments
                    .get("type")
                    .and_then(Value::as_str)
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| {
                        LinkError::Protocol(
                            "unreal.send_command call is missing arguments.type".to_string(),
                        )
                    })?;
                let params = match self.arguments.get("params") {
                    Some(Value::Object(params)) => params.clone(),
                    _ => Params::new(),
                };
                (command, params)
            }
            "add_blueprint_get_component_node" => (
                "add_blueprint_get_self_component_reference",
                self.arguments.clone(),
            ),
            "create_actor" => ("spawn_actor", self.arguments.clone()),
            name => (name, self.arguments.clone()),
        };
        Ok(json!({ "type": command, "params": params }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Stop issuing calls after the first failure.
    pub stop_on_error: bool,
    /// Ask the host for one progress notification per call.
    pub notify: bool,
    /// Let the sidecar hand the whole batch to the editor in one command.
    pub use_editor_batch: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            notify: false,
            use_editor_batch: true,
        }
    }
}

/// Outcome of one attempted call.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    /// Position in the submitted list.
    pub index: usize,
    pub name: String,
    pub outcome: std::result::Result<Value, RemoteFailure>,
}

impl BatchEntry {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub ok: usize,
    pub error: usize,
    pub stop_on_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub entries: Vec<BatchEntry>,
    pub summary: BatchSummary,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.entries.iter().all(BatchEntry::is_success)
    }

    /// Whether some submitted calls were never attempted.
    pub fn stopped_early(&self) -> bool {
        self.entries.len() < self.summary.total
    }

    /// Parse a batch reply payload.
    ///
    /// Items are looked up at the top level, under `structuredContent`,
    /// under `structuredContent.result` and under `result`, covering both the
    /// sidecar's own batch and an editor batch it proxied. Items may use
    /// `ok`/`name` or `success`/`type`.
    ///
    /// # Errors
    ///
    /// `LinkError::Protocol` if no item list is found, or if the reply holds
    /// more items than calls were submitted.
    pub fn from_payload(payload: &Value, calls: &[BatchCall], stop_on_error: bool) -> Result<Self> {
        let container = items_container(payload)
            .ok_or_else(|| LinkError::Protocol("Batch reply carries no items".to_string()))?;

        let items = container["items"].as_array().map(Vec::as_slice).unwrap_or_default();
        if items.len() > calls.len() {
            return Err(LinkError::Protocol(format!(
                "Batch reply has {} items for {} calls",
                items.len(),
                calls.len()
            )));
        }

        let mut entries: Vec<BatchEntry> = Vec::with_capacity(items.len());
        for (position, item) in items.iter().enumerate() {
            let index = match item.get("index").and_then(Value::as_u64) {
                Some(raw) => usize::try_from(raw).map_err(|_| {
                    LinkError::Protocol(format!("Batch item index {} does not fit", raw))
                })?,
                None => position,
            };
            if let Some(previous) = entries.last() {
                if index <= previous.index {
                    return Err(LinkError::Protocol(format!(
                        "Batch item index {} follows index {}",
                        index, previous.index
                    )));
                }
            }
            let Some(call) = calls.get(index) else {
                return Err(LinkError::Protocol(format!(
                    "Batch item index {} out of range for {} calls",
                    index,
                    calls.len()
                )));
            };
            let name = item
                .get("name")
                .or_else(|| item.get("type"))
                .and_then(Value::as_str)
                .unwrap_or(&call.name)
                .to_string();

            entries.push(BatchEntry {
                index,
                name,
                outcome: item_outcome(item),
            });
        }

        let ok = entries.iter().filter(|e| e.is_success()).count();
        let summary = container
            .get("summary")
            .and_then(|s| serde_json::from_value::<BatchSummary>(s.clone()).ok())
            .unwrap_or(BatchSummary {
                total: calls.len(),
                ok,
                error: entries.len() - ok,
                stop_on_error,
            });

        Ok(Self { entries, summary })
    }
}

/// The object holding `items`: the payload itself, its `structuredContent`
/// (or that object's `result`), or its `result`.
fn items_container(payload: &Value) -> Option<&Value> {
    [
        Some(payload),
        payload.get("structuredContent"),
        payload
            .get("structuredContent")
            .and_then(|s| s.get("result")),
        payload.get("result"),
    ]
    .into_iter()
    .flatten()
    .find(|candidate| candidate.get("items").is_some_and(Value::is_array))
}

fn item_outcome(item: &Value) -> std::result::Result<Value, RemoteFailure> {
    let succeeded = item
        .get("ok")
        .or_else(|| item.get("success"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if succeeded {
        return Ok(item.get("result").cloned().unwrap_or(Value::Null));
    }

    let message = item
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| item.get("result").and_then(tool_text))
        .unwrap_or_else(|| "Batch call failed".to_string());

    Err(RemoteFailure {
        code: COMMAND_FAILED,
        message,
        data: Some(item.clone()),
    })
}

/// Runs batches through the sidecar's batch tool.
pub struct BatchExecutor<'a> {
    correlator: &'a Correlator,
    timeout: Duration,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(correlator: &'a Correlator, timeout: Duration) -> Self {
        Self {
            correlator,
            timeout,
        }
    }

    /// Submit `calls` as one batch and wait for the combined result.
    ///
    /// Every notification routed while the batch is outstanding is passed to
    /// `observer`, in arrival order, before the result is returned.
    pub async fn run<F>(
        &self,
        calls: &[BatchCall],
        options: BatchOptions,
        mut observer: F,
    ) -> Result<BatchResult>
    where
        F: FnMut(&Notification),
    {
        let arguments = json!({
            "calls": calls,
            "stop_on_error": options.stop_on_error,
            "notify": options.notify,
            "use_ue_batch": options.use_editor_batch,
        });
        let request = Message::request(
            "tools/call",
            into_params(json!({ "name": BATCH_TOOL, "arguments": arguments }))?,
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = self.correlator.router().subscribe(move |notification| {
            let _ = tx.send(notification.clone());
        });

        debug!(calls = calls.len(), ?options, "Submitting batch");
        let wait = self.correlator.submit(request, self.timeout).await?.wait();
        tokio::pin!(wait);

        let reply = loop {
            tokio::select! {
                biased;
                Some(notification) = rx.recv() => observer(&notification),
                reply = &mut wait => break reply?,
            }
        };
        while let Ok(notification) = rx.try_recv() {
            observer(&notification);
        }

        let Message::Response { reply, .. } = reply else {
            return Err(LinkError::Protocol("Batch reply is not a response".to_string()));
        };
        let payload = reply.into_result()?;
        if items_container(&payload).is_none() {
            if let Some(failure) = tool_failure(&payload, BATCH_TOOL) {
                warn!("Batch rejected: {}", failure.message);
                return Err(failure.into());
            }
        }

        let result = BatchResult::from_payload(&payload, calls, options.stop_on_error)?;
        if result.stopped_early() {
            warn!(
                attempted = result.entries.len(),
                submitted = calls.len(),
                "Batch stopped early"
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn calls(names: &[&str]) -> Vec<BatchCall> {
        names
            .iter()
            .map(|name| BatchCall::new(*name, Params::new()))
            .collect()
    }

    #[test]
    fn test_sidecar_items_stop_on_error() {
        let calls = calls(&["a", "b", "c"]);
        let payload = json!({
            "content": [{"type": "text", "text": "Batch finished. total=3, ok=1, error=1"}],
            "structuredContent": {
                "summary": {"total": 3, "ok": 1, "error": 1, "stop_on_error": true},
                "items": [
                    {"index": 0, "name": "a", "ok": true, "result": {"content": []}},
                    {"index": 1, "name": "b", "ok": false, "result": {
                        "content": [{"type": "text", "text": "Blueprint not found"}],
                        "isError": true
                    }}
                ]
            },
            "isError": true
        });

        let result = BatchResult::from_payload(&payload, &calls, true).unwrap();
        assert_eq!(result.entries.len(), 2);
        assert!(result.entries[0].is_success());
        let failure = result.entries[1].outcome.clone().unwrap_err();
        assert_eq!(failure.message, "Blueprint not found");
        assert!(result.stopped_early());
        assert_eq!(
            result.summary,
            BatchSummary {
                total: 3,
                ok: 1,
                error: 1,
                stop_on_error: true
            }
        );
    }

    #[test]
    fn test_editor_items_under_result() {
        let calls = calls(&["unreal.ping", "spawn_actor"]);
        let payload = json!({
            "result": {
                "items": [
                    {"index": 0, "type": "ping", "success": true, "result": {"message": "pong"}},
                    {"index": 1, "type": "spawn_actor", "success": false,
                     "error": "Actor exists", "error_code": "ERR_EXISTS"}
                ]
            }
        });

        let result = BatchResult::from_payload(&payload, &calls, false).unwrap();
        assert_eq!(result.entries[0].name, "ping");
        assert_eq!(result.entries[0].outcome, Ok(json!({"message": "pong"})));

        let failure = result.entries[1].outcome.clone().unwrap_err();
        assert_eq!(failure.code, COMMAND_FAILED);
        assert_eq!(failure.message, "Actor exists");
        assert_eq!(failure.data.unwrap()["error_code"], "ERR_EXISTS");

        // No summary in the reply: computed from the entries.
        assert_eq!(result.summary.ok, 1);
        assert_eq!(result.summary.error, 1);
        assert_eq!(result.summary.total, 2);
    }

    #[test]
    fn test_proxied_editor_batch_under_structured_result() {
        let calls = calls(&["unreal.ping"]);
        let payload = json!({
            "content": [{"type": "text", "text": "{...}"}],
            "structuredContent": {
                "status": "success",
                "result": {"items": [{"index": 0, "type": "ping", "success": true}]}
            }
        });
        let result = BatchResult::from_payload(&payload, &calls, true).unwrap();
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].outcome, Ok(Value::Null));
    }

    #[test]
    fn test_more_items_than_calls_is_protocol_error() {
        let payload = json!({"items": [{"ok": true}, {"ok": true}]});
        let err = BatchResult::from_payload(&payload, &calls(&["a"]), true).unwrap_err();
        assert!(matches!(err, LinkError::Protocol(_)));
    }

    #[test]
    fn test_out_of_order_indexes_are_protocol_errors() {
        let three = calls(&["a", "b", "c"]);

        let repeated = json!({"items": [{"index": 0, "ok": true}, {"index": 0, "ok": true}]});
        let err = BatchResult::from_payload(&repeated, &three, false).unwrap_err();
        assert!(matches!(err, LinkError::Protocol(ref m) if m.contains("follows")));

        let decreasing = json!({"items": [{"index": 2, "ok": true}, {"index": 1, "ok": true}]});
        let err = BatchResult::from_payload(&decreasing, &three, false).unwrap_err();
        assert!(matches!(err, LinkError::Protocol(_)));

        let gapped = json!({"items": [{"index": 0, "ok": true}, {"index": 2, "ok": true}]});
        let result = BatchResult::from_payload(&gapped, &three, false).unwrap();
        let indices: Vec<usize> = result.entries.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn test_rejected_batch_carries_tool_failure() {
        let payload = json!({
            "content": [{"type": "text", "text": "batch: Unknown command: batch"}],
            "structuredContent": {"status": "error", "error": "Unknown command: batch"},
            "isError": true
        });
        assert!(items_container(&payload).is_none());

        let failure = tool_failure(&payload, BATCH_TOOL).expect("tool failure");
        assert_eq!(failure.code, COMMAND_FAILED);
        assert_eq!(failure.message, "batch: Unknown command: batch");
        assert_eq!(failure.data.unwrap()["error"], "Unknown command: batch");
    }

    #[test]
    fn test_missing_items_is_protocol_error() {
        let err = BatchResult::from_payload(&json!({"content": []}), &calls(&["a"]), true)
            .unwrap_err();
        assert!(matches!(err, LinkError::Protocol(ref m) if m.contains("no items")));
    }

    #[test]
    fn test_nameless_item_uses_submitted_name() {
        let payload = json!({"items": [{"index": 0, "ok": false, "error": "Missing call.name"}]});
        let result = BatchResult::from_payload(&payload, &calls(&["x"]), true).unwrap();
        assert_eq!(result.entries[0].name, "x");
        assert_eq!(
            result.entries[0].outcome.clone().unwrap_err().message,
            "Missing call.name"
        );
    }

    #[test]
    fn test_editor_command_mapping() {
        let ping = BatchCall::new("unreal.ping", Params::new());
        assert_eq!(
            ping.to_editor_command().unwrap(),
            json!({"type": "ping", "params": {}})
        );

        let send = BatchCall::new(
            "unreal.send_command",
            into_params(json!({"type": "get_actors_in_level", "params": {"filter": "Cube"}}))
                .unwrap(),
        );
        assert_eq!(
            send.to_editor_command().unwrap(),
            json!({"type": "get_actors_in_level", "params": {"filter": "Cube"}})
        );

        let alias = BatchCall::new("create_actor", into_params(json!({"name": "A"})).unwrap());
        assert_eq!(
            alias.to_editor_command().unwrap(),
            json!({"type": "spawn_actor", "params": {"name": "A"}})
        );

        let missing = BatchCall::new("unreal.send_command", Params::new());
        assert!(matches!(
            missing.to_editor_command(),
            Err(LinkError::Protocol(_))
        ));
    }

    #[test]
    fn test_call_serializes_as_name_and_arguments() {
        let call = BatchCall::new("unreal.ping", Params::new());
        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({"name": "unreal.ping", "arguments": {}})
        );
        let parsed: BatchCall = serde_json::from_value(json!({"name": "x"})).unwrap();
        assert!(parsed.arguments.is_empty());
    }
}
