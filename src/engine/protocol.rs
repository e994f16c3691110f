use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Wire protocol version; constant for now.
pub const PROTOCOL_VERSION: &str = "1";

pub mod methods {
    pub const AUTH: &str = "auth";
    pub const TOOL_REQUEST: &str = "tool_request";
    pub const LIST_TOOLS: &str = "list_tools";
    pub const GET_PENDING_RESULTS: &str = "get_pending_results";
    /// Server-initiated notice carrying the outstanding request ids
    pub const SHUTTING_DOWN: &str = "shutting_down";
}

pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const DENIED_BY_USER: i64 = -32001;
    pub const APPROVAL_TIMED_OUT: i64 = -32002;
    pub const DENIED_BY_POLICY: i64 = -32003;
    pub const EXECUTION_FAILED: i64 = -32004;
    pub const NOT_AUTHENTICATED: i64 = -32005;
    pub const RATE_LIMIT_EXCEEDED: i64 = -32006;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

/// Request/response envelope on the agent channel.
///
/// Requests carry `method`/`params`/`id`; responses echo `id` and carry
/// exactly one of `result` or `error`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Envelope {
    pub fn request(method: &str, params: Value, id: Value) -> Self {
        Self {
            protocol_version: Some(PROTOCOL_VERSION.to_string()),
            method: Some(method.to_string()),
            params: Some(params),
            id: Some(id),
            result: None,
            error: None,
        }
    }

    /// Server-initiated message with no id and no expected response.
    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            protocol_version: Some(PROTOCOL_VERSION.to_string()),
            method: Some(method.to_string()),
            params: Some(params),
            id: None,
            result: None,
            error: None,
        }
    }

    pub fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            protocol_version: Some(PROTOCOL_VERSION.to_string()),
            method: None,
            params: None,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            protocol_version: Some(PROTOCOL_VERSION.to_string()),
            method: None,
            params: None,
            id,
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn error_from(id: Option<Value>, err: &GatewayError) -> Self {
        Self::error(id, err.code(), err.wire_message())
    }

    /// Canonical string form of the envelope id. String and numeric ids
    /// are accepted; anything else has no canonical form.
    pub fn id_string(&self) -> Option<String> {
        match &self.id {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Whether the declared protocol version (if any) is one we speak.
    pub fn version_ok(&self) -> bool {
        match &self.protocol_version {
            None => true,
            Some(v) => v == PROTOCOL_VERSION,
        }
    }
}

/// Params of the `auth` method.
#[derive(Debug, Deserialize)]
pub struct AuthParams {
    pub token: String,
}

/// Params of the `tool_request` method.
#[derive(Debug, Deserialize)]
pub struct ToolRequestParams {
    pub tool: String,

    #[serde(default)]
    pub args: serde_json::Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips() {
        let env = Envelope::request(
            methods::TOOL_REQUEST,
            json!({"tool": "get_state", "args": {"entity_id": "sensor.t"}}),
            json!("req-1"),
        );
        let line = serde_json::to_string(&env).expect("serialize");
        let back: Envelope = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(back.method.as_deref(), Some(methods::TOOL_REQUEST));
        assert_eq!(back.id_string().as_deref(), Some("req-1"));
        assert!(back.version_ok());
    }

    #[test]
    fn numeric_ids_canonicalize() {
        let env = Envelope::request(methods::LIST_TOOLS, json!({}), json!(7));
        assert_eq!(env.id_string().as_deref(), Some("7"));
    }

    #[test]
    fn error_envelope_carries_code_and_message() {
        let err = GatewayError::PolicyDenied("denied by policy".into());
        let env = Envelope::error_from(Some(json!("r")), &err);
        let error = env.error.expect("error");
        assert_eq!(error.code, codes::DENIED_BY_POLICY);
        assert!(error.message.contains("denied by policy"));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let env = Envelope {
            protocol_version: Some("99".to_string()),
            ..Default::default()
        };
        assert!(!env.version_ok());
    }

    #[test]
    fn responses_omit_empty_fields() {
        let env = Envelope::result(Some(json!(1)), json!({"ok": true}));
        let line = serde_json::to_string(&env).expect("serialize");
        assert!(!line.contains("method"));
        assert!(!line.contains("error"));
    }
}
