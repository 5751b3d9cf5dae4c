use serde_json::Value;
use serde_json::json;
use thiserror::Error;

use crate::adapters::rpc::RpcResponse;
use crate::common::error_codes::{self, ErrorCategory};
use crate::infra::daemon::SessionError;
use crate::infra::hooks::HookFailure;

/// Request rejected at the boundary, before any session is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Missing params")]
    MissingParams,
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Command '{executable}' is not allowed")]
    CommandNotAllowed { executable: String },
}

impl ProtocolError {
    pub fn code(&self) -> i32 {
        match self {
            ProtocolError::MissingParams | ProtocolError::InvalidParams(_) => {
                error_codes::INVALID_PARAMS
            }
            ProtocolError::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            ProtocolError::CommandNotAllowed { .. } => error_codes::COMMAND_NOT_ALLOWED,
        }
    }

    pub fn context(&self) -> Value {
        match self {
            ProtocolError::MissingParams => json!({}),
            ProtocolError::InvalidParams(reason) => json!({ "reason": reason }),
            ProtocolError::MethodNotFound(method) => json!({ "method": method }),
            ProtocolError::CommandNotAllowed { executable } => {
                json!({ "executable": executable })
            }
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            ProtocolError::MissingParams | ProtocolError::InvalidParams(_) => {
                "Check the request params against the method's documented shape.".to_string()
            }
            ProtocolError::MethodNotFound(_) => {
                "The 'connected' notification lists the supported methods.".to_string()
            }
            ProtocolError::CommandNotAllowed { .. } => {
                "Add the executable to AGENT_EXEC_ALLOWED_COMMANDS or pick an allowed one."
                    .to_string()
            }
        }
    }
}

/// Everything a gateway request can fail with, mapped onto one error shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Hook(#[from] HookFailure),
}

impl GatewayError {
    pub fn code(&self) -> i32 {
        match self {
            GatewayError::Protocol(err) => err.code(),
            GatewayError::Session(err) => err.code(),
            GatewayError::Hook(err) => err.code(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::Protocol(err) => error_codes::category_for_code(err.code()),
            GatewayError::Session(err) => err.category(),
            GatewayError::Hook(err) => err.category(),
        }
    }

    pub fn context(&self) -> Value {
        match self {
            GatewayError::Protocol(err) => err.context(),
            GatewayError::Session(err) => err.context(),
            GatewayError::Hook(err) => err.context(),
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            GatewayError::Protocol(err) => err.suggestion(),
            GatewayError::Session(err) => err.suggestion(),
            GatewayError::Hook(err) => err.suggestion(),
        }
    }
}

pub fn error_response(id: u64, err: &GatewayError) -> RpcResponse {
    RpcResponse::domain_error(
        id,
        err.code(),
        &err.to_string(),
        err.category().as_str(),
        Some(err.context()),
        Some(err.suggestion()),
    )
}

/// Structured form of an error for notification payloads.
pub fn error_payload(err: &GatewayError) -> Value {
    json!({
        "code": err.code(),
        "message": err.to_string(),
        "category": err.category().as_str(),
        "context": err.context(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HookPhase;
    use crate::infra::hooks::HookFailureKind;

    #[test]
    fn test_protocol_error_codes() {
        assert_eq!(ProtocolError::MissingParams.code(), error_codes::INVALID_PARAMS);
        assert_eq!(
            ProtocolError::MethodNotFound("x".into()).code(),
            error_codes::METHOD_NOT_FOUND
        );
        assert_eq!(
            ProtocolError::CommandNotAllowed {
                executable: "rm".into()
            }
            .code(),
            error_codes::COMMAND_NOT_ALLOWED
        );
    }

    #[test]
    fn test_session_limit_response_is_retryable() {
        let err = GatewayError::from(SessionError::LimitReached { max: 2 });
        let parsed: Value = serde_json::to_value(error_response(4, &err)).unwrap();
        assert_eq!(parsed["id"], 4);
        assert_eq!(parsed["error"]["code"], error_codes::SESSION_LIMIT);
        assert_eq!(parsed["error"]["data"]["category"], "busy");
        assert_eq!(parsed["error"]["data"]["retryable"], true);
    }

    #[test]
    fn test_hook_failure_response_is_distinct() {
        let err = GatewayError::from(HookFailure {
            phase: HookPhase::PreExecute,
            hook: "gate.sh".into(),
            blocking: true,
            kind: HookFailureKind::NonZeroExit {
                code: 1,
                stderr: "denied".into(),
            },
        });
        let parsed: Value = serde_json::to_value(error_response(9, &err)).unwrap();
        assert_eq!(parsed["error"]["code"], error_codes::HOOK_FAILURE);
        assert_eq!(parsed["error"]["data"]["category"], "external");
        assert_eq!(parsed["error"]["data"]["context"]["phase"], "pre_execute");
        assert_eq!(parsed["error"]["data"]["context"]["exit_code"], 1);
    }

    #[test]
    fn test_error_payload_carries_code_and_message() {
        let err = GatewayError::from(ProtocolError::InvalidParams("bad".into()));
        let payload = error_payload(&err);
        assert_eq!(payload["code"], error_codes::INVALID_PARAMS);
        assert_eq!(payload["message"], "Invalid params: bad");
    }
}
