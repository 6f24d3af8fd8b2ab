//! Protocol messages and the two wire shapes they travel in.
//!
//! A [`Message`] is the unit the rest of the crate works with. It is turned
//! into bytes by one of two envelopes:
//!
//! - **JSON-RPC 2.0** (`to_jsonrpc` / `from_jsonrpc`) for the length-prefixed
//!   stdio variant.
//! - **Editor commands** (`to_command` / `from_command`) for the raw socket
//!   variant, where a request is `{"type": ..., "params": {...}}` and the reply
//!   comes back in one of several loosely-shaped dialects.
//!
//! Both reply dialects are normalized into [`Reply`] here and nowhere else.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{LinkError, Result};

/// Named parameters of a request or notification.
pub type Params = Map<String, Value>;

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Error code used when the editor reports a failure without a numeric code.
pub const COMMAND_FAILED: i64 = -32000;

/// Correlation id of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Sentinel for connections that allow a single outstanding request and
    /// therefore never put an id on the wire.
    pub const UNFRAMED: RequestId = RequestId(0);
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discriminator for [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Notification,
}

/// Structured error carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Outcome carried by a response: exactly one of result or error.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success(Value),
    Failure(RemoteFailure),
}

impl Reply {
    /// Convert into the caller-facing result.
    pub fn into_result(self) -> Result<Value> {
        match self {
            Reply::Success(value) => Ok(value),
            Reply::Failure(failure) => Err(failure.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Success(_))
    }
}

/// A single logical message exchanged with the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: Option<RequestId>,
        method: String,
        params: Params,
    },
    Response {
        id: Option<RequestId>,
        reply: Reply,
    },
    Notification {
        method: String,
        params: Params,
    },
}

impl Message {
    /// Build a request without an id; the correlator assigns one on submit.
    pub fn request(method: impl Into<String>, params: Params) -> Self {
        Message::Request {
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Params) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn response(id: Option<RequestId>, reply: Reply) -> Self {
        Message::Response { id, reply }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request { .. } => MessageKind::Request,
            Message::Response { .. } => MessageKind::Response,
            Message::Notification { .. } => MessageKind::Notification,
        }
    }

    pub fn id(&self) -> Option<RequestId> {
        match self {
            Message::Request { id, .. } | Message::Response { id, .. } => *id,
            Message::Notification { .. } => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => {
                Some(method)
            }
            Message::Response { .. } => None,
        }
    }

    /// Replace the id of a request. Other kinds are returned unchanged.
    pub(crate) fn with_id(self, new_id: Option<RequestId>) -> Self {
        match self {
            Message::Request { method, params, .. } => Message::Request {
                id: new_id,
                method,
                params,
            },
            other => other,
        }
    }

    /// Encode as a JSON-RPC 2.0 envelope.
    ///
    /// A request without an id is indistinguishable from a notification in
    /// JSON-RPC; the correlator always assigns one before encoding.
    pub fn to_jsonrpc(&self) -> Value {
        match self {
            Message::Request { id, method, params } => {
                let mut envelope = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "method": method,
                    "params": params,
                });
                if let Some(id) = id {
                    envelope["id"] = json!(id.0);
                }
                envelope
            }
            Message::Response { id, reply } => {
                let id = id.map_or(Value::Null, |id| json!(id.0));
                match reply {
                    Reply::Success(result) => json!({
                        "jsonrpc": JSONRPC_VERSION,
                        "id": id,
                        "result": result,
                    }),
                    Reply::Failure(failure) => json!({
                        "jsonrpc": JSONRPC_VERSION,
                        "id": id,
                        "error": failure,
                    }),
                }
            }
            Message::Notification { method, params } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "method": method,
                "params": params,
            }),
        }
    }

    /// Decode a JSON-RPC 2.0 envelope.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Frame` if the body is not an object, if `method` or
    /// `params` have the wrong type, or if a response carries both or neither
    /// of `result` and `error`.
    pub fn from_jsonrpc(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            return Err(LinkError::Frame(
                "JSON-RPC body is not an object".to_string(),
            ));
        };

        // Ids this client never issues (strings, null) can never be matched.
        let id = obj.get("id").and_then(Value::as_u64).map(RequestId);
        let has_id = obj.get("id").is_some_and(|id| !id.is_null());

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(LinkError::Frame("JSON-RPC method is not a string".to_string()));
            };
            let params = params_field(obj.remove("params"))?;
            return Ok(if has_id {
                Message::Request { id, method, params }
            } else {
                Message::Notification { method, params }
            });
        }

        let reply = match (obj.remove("result"), obj.remove("error")) {
            (Some(result), None) => Reply::Success(result),
            (None, Some(error)) => Reply::Failure(
                serde_json::from_value(error)
                    .map_err(|e| LinkError::Frame(format!("Malformed JSON-RPC error: {}", e)))?,
            ),
            (Some(_), Some(_)) => {
                return Err(LinkError::Frame(
                    "Response carries both result and error".to_string(),
                ))
            }
            (None, None) => {
                return Err(LinkError::Frame(
                    "Response carries neither result nor error".to_string(),
                ))
            }
        };

        Ok(Message::Response { id, reply })
    }

    /// Encode in the editor's raw command dialect.
    ///
    /// # Errors
    ///
    /// The raw dialect has no notification channel; encoding a notification
    /// returns `LinkError::Protocol`.
    pub fn to_command(&self) -> Result<Value> {
        match self {
            Message::Request { method, params, .. } => Ok(json!({
                "type": method,
                "params": params,
            })),
            Message::Response { reply, .. } => Ok(match reply {
                Reply::Success(result) => json!({
                    "status": "success",
                    "result": result,
                }),
                Reply::Failure(failure) => json!({
                    "status": "error",
                    "error": failure.message,
                    "code": failure.code,
                    "data": failure.data,
                }),
            }),
            Message::Notification { method, .. } => Err(LinkError::Protocol(format!(
                "Raw command connections cannot carry notification '{}'",
                method
            ))),
        }
    }

    /// Decode a value received in the editor's raw command dialect.
    ///
    /// Anything that is not recognizably a command is treated as a reply and
    /// normalized; see [`normalize_reply`].
    pub fn from_command(value: Value) -> Result<Self> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            // Unknown shape: keep it, do not force an error.
            other => return Ok(Message::response(None, Reply::Success(other))),
        };

        let is_command = obj.contains_key("params")
            && !["status", "success", "result", "error"]
                .iter()
                .any(|key| obj.contains_key(*key));

        if is_command {
            if let Some(Value::String(method)) = obj.get("type").cloned() {
                obj.remove("type");
                let params = params_field(obj.remove("params"))?;
                return Ok(Message::Request {
                    id: None,
                    method,
                    params,
                });
            }
        }

        Ok(Message::response(None, normalize_reply(obj)))
    }
}

/// Normalize a raw editor reply into [`Reply`].
///
/// Precedence: a boolean `success`, then a non-empty `status` string
/// (`"success"` case-insensitively means success), then a non-empty `error`
/// string meaning failure. Any other object is a success. The success payload
/// is `result` when present, otherwise the whole reply.
pub fn normalize_reply(mut obj: Params) -> Reply {
    let verdict = if let Some(success) = obj.get("success").and_then(Value::as_bool) {
        Some(success)
    } else if let Some(status) = obj
        .get("status")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
    {
        Some(status.eq_ignore_ascii_case("success"))
    } else if obj
        .get("error")
        .and_then(Value::as_str)
        .is_some_and(|e| !e.trim().is_empty())
    {
        Some(false)
    } else {
        None
    };

    if verdict == Some(false) {
        return Reply::Failure(failure_from_reply(obj));
    }

    match obj.remove("result") {
        Some(result) => Reply::Success(result),
        None => Reply::Success(Value::Object(obj)),
    }
}

fn failure_from_reply(obj: Params) -> RemoteFailure {
    let message = match obj.get("error") {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.clone()),
        Some(Value::Object(error)) => error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
    .or_else(|| {
        obj.get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
    })
    .unwrap_or_else(|| "Remote command failed".to_string());

    let code = obj
        .get("code")
        .and_then(Value::as_i64)
        .unwrap_or(COMMAND_FAILED);

    let data = match obj.get("data") {
        Some(Value::Null) => None,
        Some(data) => Some(data.clone()),
        None => Some(Value::Object(obj)),
    };

    RemoteFailure {
        code,
        message,
        data,
    }
}

fn params_field(params: Option<Value>) -> Result<Params> {
    match params {
        Some(Value::Object(map)) => Ok(map),
        Some(Value::Null) | None => Ok(Params::new()),
        Some(_) => Err(LinkError::Frame("params is not an object".to_string())),
    }
}

/// Convert caller-supplied JSON into named parameters.
///
/// `null` becomes an empty map; anything other than an object is rejected.
pub fn into_params(value: Value) -> Result<Params> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Params::new()),
        other => Err(LinkError::Protocol(format!(
            "Parameters must be a JSON object, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(value: Value) -> Params {
        into_params(value).unwrap()
    }

    #[test]
    fn test_jsonrpc_request_roundtrip() {
        let msg = Message::request("tools/call", params(json!({"name": "unreal.ping"})))
            .with_id(Some(RequestId(7)));
        let encoded = msg.to_jsonrpc();
        assert_eq!(encoded["jsonrpc"], "2.0");
        assert_eq!(encoded["id"], 7);
        assert_eq!(Message::from_jsonrpc(encoded).unwrap(), msg);
    }

    #[test]
    fn test_jsonrpc_failure_roundtrip() {
        let msg = Message::response(
            Some(RequestId(3)),
            Reply::Failure(RemoteFailure {
                code: -32601,
                message: "Method not implemented: foo".to_string(),
                data: None,
            }),
        );
        let encoded = msg.to_jsonrpc();
        assert!(encoded["error"].get("data").is_none());
        assert_eq!(Message::from_jsonrpc(encoded).unwrap(), msg);
    }

    #[test]
    fn test_jsonrpc_null_result_is_success() {
        let msg = Message::from_jsonrpc(json!({"jsonrpc": "2.0", "id": 1, "result": null}))
            .unwrap();
        assert_eq!(msg, Message::response(Some(RequestId(1)), Reply::Success(Value::Null)));
    }

    #[test]
    fn test_jsonrpc_notification_has_no_id() {
        let msg = Message::from_jsonrpc(json!({
            "jsonrpc": "2.0",
            "method": "notifications/message",
            "params": {"level": "info", "message": "Batch: 1/3"}
        }))
        .unwrap();
        assert_eq!(msg.kind(), MessageKind::Notification);
        assert_eq!(msg.id(), None);
        assert_eq!(msg.method(), Some("notifications/message"));
    }

    #[test]
    fn test_jsonrpc_rejects_both_result_and_error() {
        let err = Message::from_jsonrpc(json!({
            "jsonrpc": "2.0", "id": 1, "result": {}, "error": {"code": 1, "message": "x"}
        }))
        .unwrap_err();
        assert!(matches!(err, LinkError::Frame(_)));

        let err = Message::from_jsonrpc(json!({"jsonrpc": "2.0", "id": 1})).unwrap_err();
        assert!(err.to_string().contains("neither"));
    }

    #[test]
    fn test_jsonrpc_string_id_cannot_match() {
        let msg = Message::from_jsonrpc(json!({"jsonrpc": "2.0", "id": "abc", "result": 1}))
            .unwrap();
        assert_eq!(msg.kind(), MessageKind::Response);
        assert_eq!(msg.id(), None);
    }

    #[test]
    fn test_command_request_shape() {
        let msg = Message::request("ping", Params::new());
        assert_eq!(
            msg.to_command().unwrap(),
            json!({"type": "ping", "params": {}})
        );
        assert_eq!(Message::from_command(msg.to_command().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_command_status_shape() {
        let msg = Message::from_command(json!({
            "status": "success",
            "result": {"message": "pong"}
        }))
        .unwrap();
        assert_eq!(
            msg,
            Message::response(None, Reply::Success(json!({"message": "pong"})))
        );
    }

    #[test]
    fn test_command_success_flag_shape() {
        let msg = Message::from_command(json!({
            "success": false,
            "error": "Blueprint not found",
            "error_code": "ERR_ASSET_NOT_FOUND"
        }))
        .unwrap();
        let Message::Response {
            reply: Reply::Failure(failure),
            ..
        } = msg
        else {
            panic!("expected failure");
        };
        assert_eq!(failure.code, COMMAND_FAILED);
        assert_eq!(failure.message, "Blueprint not found");
        assert_eq!(
            failure.data.unwrap()["error_code"],
            json!("ERR_ASSET_NOT_FOUND")
        );
    }

    #[test]
    fn test_command_loose_success_keeps_whole_reply() {
        let reply = normalize_reply(params(json!({"success": true, "message": "Created"})));
        assert_eq!(
            reply,
            Reply::Success(json!({"success": true, "message": "Created"}))
        );
    }

    #[test]
    fn test_command_legacy_error_string() {
        let reply = normalize_reply(params(json!({"error": "Unknown command: foo"})));
        let Reply::Failure(failure) = reply else {
            panic!("expected failure");
        };
        assert_eq!(failure.message, "Unknown command: foo");
    }

    #[test]
    fn test_command_status_takes_message_fallback() {
        let reply = normalize_reply(params(json!({"status": "ERROR", "message": "nope"})));
        let Reply::Failure(failure) = reply else {
            panic!("expected failure");
        };
        assert_eq!(failure.message, "nope");
    }

    #[test]
    fn test_command_failure_roundtrip() {
        let msg = Message::response(
            None,
            Reply::Failure(RemoteFailure {
                code: 12,
                message: "already exists".to_string(),
                data: None,
            }),
        );
        assert_eq!(Message::from_command(msg.to_command().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_command_rejects_notification() {
        let msg = Message::notification("notifications/message", Params::new());
        assert!(matches!(msg.to_command(), Err(LinkError::Protocol(_))));
    }

    #[test]
    fn test_into_params() {
        assert!(into_params(Value::Null).unwrap().is_empty());
        assert!(into_params(json!([1, 2])).is_err());
    }

    #[test]
    fn test_reply_into_result() {
        assert_eq!(Reply::Success(json!(1)).into_result().unwrap(), json!(1));
        let err = Reply::Failure(RemoteFailure {
            code: -1,
            message: "bad".into(),
            data: None,
        })
        .into_result()
        .unwrap_err();
        assert!(matches!(err, LinkError::Remote { code: -1, .. }));
    }
}
