use std::io;

use thiserror::Error;

use crate::common::error_codes::{self, ErrorCategory};

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Failed to bind socket ({operation}): {source}")]
    SocketBind {
        operation: String,
        #[source]
        source: io::Error,
    },
    #[error("Another daemon instance is already running")]
    AlreadyRunning,
    #[error("Failed to acquire lock ({operation}): {source}")]
    LockFailed {
        operation: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to setup signal handler: {0}")]
    SignalSetup(String),
    #[error("Failed to create async runtime: {0}")]
    Runtime(String),
    #[error("Invalid hook configuration: {0}")]
    HookConfig(String),
}

impl DaemonError {
    pub fn code(&self) -> i32 {
        error_codes::GENERIC_ERROR
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            DaemonError::HookConfig(_) => ErrorCategory::InvalidInput,
            DaemonError::AlreadyRunning => ErrorCategory::Busy,
            _ => ErrorCategory::External,
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            DaemonError::SocketBind { .. } => {
                "Check that the socket directory is writable, or set AGENT_EXEC_SOCKET.".to_string()
            }
            DaemonError::AlreadyRunning => {
                "Another daemon is running. Use 'agent-exec status' to inspect it.".to_string()
            }
            DaemonError::LockFailed { .. } => {
                "Lock file issue. Remove the stale <socket>.lock file and retry.".to_string()
            }
            DaemonError::SignalSetup(_) => {
                "Signal handler setup failed. Check system signal configuration.".to_string()
            }
            DaemonError::Runtime(_) => {
                "Runtime creation failed. Check system thread limits (ulimit -u).".to_string()
            }
            DaemonError::HookConfig(_) => {
                "Fix the hook file (AGENT_EXEC_HOOKS) or point it at a valid JSON document."
                    .to_string()
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DaemonError::LockFailed { .. })
    }
}
