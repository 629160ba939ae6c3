// SPDX-License-Identifier: MIT OR Apache-2.0
//! JSON-RPC 2.0 envelopes for the stdio transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parse failure.
pub const PARSE_ERROR: i64 = -32700;
/// Structurally invalid request.
pub const INVALID_REQUEST: i64 = -32600;
/// Unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Parameters failed schema validation.
pub const INVALID_PARAMS: i64 = -32602;
/// Kernel-side failure that escaped the in-band result path.
pub const SERVER_ERROR: i64 = -32000;

/// An incoming request or notification.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    /// Must be `"2.0"`.
    #[serde(default)]
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Notifications carry no id and get no response.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A protocol-level error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// The original kernel failure, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An outgoing response.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Mirrors the request id (`null` when unknowable).
    pub id: Value,
    /// Success payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Success response for `id`.
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response for `id`.
    pub fn fail(id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    /// Serialize to a newline-terminated JSON line.
    pub fn encode(&self) -> String {
        let mut s = serde_json::to_string(self).unwrap_or_else(|_| {
            // A response that cannot serialize still must answer something.
            format!(
                r#"{{"jsonrpc":"2.0","id":null,"error":{{"code":{SERVER_ERROR},"message":"unserializable response"}}}}"#
            )
        });
        s.push('\n');
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_roundtrip() {
        let line = r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#;
        let req: RpcRequest = serde_json::from_str(line).expect("parse");
        assert_eq!(req.method, "tools/list");
        assert!(!req.is_notification());
    }

    #[test]
    fn notification_has_no_id() {
        let line = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let req: RpcRequest = serde_json::from_str(line).expect("parse");
        assert!(req.is_notification());
    }

    #[test]
    fn responses_are_newline_terminated_json() {
        let ok = RpcResponse::ok(json!(1), json!({"tools": []}));
        let line = ok.encode();
        assert!(line.ends_with('\n'));
        let back: Value = serde_json::from_str(line.trim()).expect("valid json");
        assert_eq!(back["jsonrpc"], "2.0");
        assert_eq!(back["result"]["tools"], json!([]));
        assert!(back.get("error").is_none());
    }

    #[test]
    fn error_response_carries_code_and_data() {
        let fail = RpcResponse::fail(
            json!(2),
            METHOD_NOT_FOUND,
            "no such method",
            Some(json!({"method": "bogus"})),
        );
        let back: Value = serde_json::from_str(fail.encode().trim()).expect("valid json");
        assert_eq!(back["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(back["error"]["data"]["method"], "bogus");
    }
}
