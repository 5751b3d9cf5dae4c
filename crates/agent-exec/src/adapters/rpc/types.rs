use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::common::error_codes;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(rename = "jsonrpc")]
    _jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            _jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Why an inbound frame could not become an [`RpcRequest`].
#[derive(Debug)]
pub enum FrameError {
    /// Not JSON at all.
    Parse(serde_json::Error),
    /// JSON, but not a request object. Carries the id when one was readable.
    Invalid { id: u64, reason: String },
}

impl FrameError {
    pub fn into_response(self) -> RpcResponse {
        match self {
            FrameError::Parse(err) => {
                RpcResponse::error(0, error_codes::PARSE_ERROR, &format!("Parse error: {err}"))
            }
            FrameError::Invalid { id, reason } => RpcResponse::error(
                id,
                error_codes::INVALID_REQUEST,
                &format!("Invalid request: {reason}"),
            ),
        }
    }
}

/// Two-step decode so malformed JSON and well-formed non-requests answer
/// with different codes.
pub fn parse_frame(text: &str) -> Result<RpcRequest, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(FrameError::Parse)?;
    let id = value.get("id").and_then(Value::as_u64).unwrap_or(0);
    serde_json::from_value(value).map_err(|err| FrameError::Invalid {
        id,
        reason: err.to_string(),
    })
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    #[serde(rename = "jsonrpc")]
    _jsonrpc: String,
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcServerError>,
}

#[derive(Debug, Serialize)]
pub struct RpcServerError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ErrorData {
    pub category: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            _jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    #[cfg(test)]
    pub fn error_code(&self) -> Option<i32> {
        self.error.as_ref().map(|err| err.code)
    }

    pub fn error(id: u64, code: i32, message: &str) -> Self {
        Self {
            _jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcServerError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }

    pub fn error_with_data(id: u64, code: i32, message: &str, error_data: ErrorData) -> Self {
        Self {
            _jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcServerError {
                code,
                message: message.to_string(),
                data: Some(serde_json::to_value(error_data).unwrap_or(json!({}))),
            }),
        }
    }

    pub fn domain_error(
        id: u64,
        code: i32,
        message: &str,
        category: &str,
        context: Option<Value>,
        suggestion: Option<String>,
    ) -> Self {
        Self::error_with_data(
            id,
            code,
            message,
            ErrorData {
                category: category.to_string(),
                retryable: error_codes::is_retryable(code),
                context,
                suggestion,
            },
        )
    }

    pub fn action_success(id: u64) -> Self {
        Self::success(id, json!({ "success": true }))
    }
}

/// Server-initiated message; carries no id and expects no reply.
#[derive(Debug, Serialize)]
pub struct RpcNotification {
    #[serde(rename = "jsonrpc")]
    _jsonrpc: &'static str,
    pub method: &'static str,
    pub params: Value,
}

impl RpcNotification {
    pub fn new(method: &'static str, params: Value) -> Self {
        Self {
            _jsonrpc: "2.0",
            method,
            params,
        }
    }
}
