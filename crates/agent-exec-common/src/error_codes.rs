//! Semantic error codes for JSON-RPC errors.
//!
//! Error codes follow the JSON-RPC 2.0 specification:
//! - -32700 to -32600: Reserved protocol errors
//! - -32000 to -32099: Server errors (-32001 to -32010 are domain errors)

// Protocol errors
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Session-related errors
pub const SESSION_LIMIT: i32 = -32001;
pub const SESSION_NOT_FOUND: i32 = -32002;
pub const PROCESS_NOT_FOUND: i32 = -32003;
pub const SESSION_BUSY: i32 = -32004;

// Command validation
pub const COMMAND_NOT_ALLOWED: i32 = -32005;

// Hook pipeline
pub const HOOK_FAILURE: i32 = -32010;

/// Transport-level busy signal (connection limit reached).
pub const GENERIC_ERROR: i32 = -32000;

/// Error category for programmatic handling by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Resource not found (session, process)
    NotFound,
    /// Invalid input parameters
    InvalidInput,
    /// Resource busy or at capacity
    Busy,
    /// Internal server error
    Internal,
    /// External dependency failure (hook, process spawn)
    External,
    /// Operation timed out
    Timeout,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::Busy => "busy",
            ErrorCategory::Internal => "internal",
            ErrorCategory::External => "external",
            ErrorCategory::Timeout => "timeout",
        }
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_found" => Ok(ErrorCategory::NotFound),
            "invalid_input" => Ok(ErrorCategory::InvalidInput),
            "busy" => Ok(ErrorCategory::Busy),
            "internal" => Ok(ErrorCategory::Internal),
            "external" => Ok(ErrorCategory::External),
            "timeout" => Ok(ErrorCategory::Timeout),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returns whether an error code represents a transient condition.
///
/// Capacity and busy-session rejections clear once a run finishes, so a
/// client may retry them after a delay.
pub fn is_retryable(code: i32) -> bool {
    matches!(code, SESSION_LIMIT | SESSION_BUSY | GENERIC_ERROR)
}

/// Returns the error category for a given error code.
pub fn category_for_code(code: i32) -> ErrorCategory {
    match code {
        SESSION_NOT_FOUND | PROCESS_NOT_FOUND => ErrorCategory::NotFound,
        PARSE_ERROR | INVALID_REQUEST | METHOD_NOT_FOUND | INVALID_PARAMS
        | COMMAND_NOT_ALLOWED => ErrorCategory::InvalidInput,
        SESSION_LIMIT | SESSION_BUSY => ErrorCategory::Busy,
        HOOK_FAILURE => ErrorCategory::External,
        _ => ErrorCategory::Internal,
    }
}
