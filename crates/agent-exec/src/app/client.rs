//! Blocking JSON-RPC client for the daemon socket.

use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use tracing::trace;

use crate::common::ErrorCategory;
use crate::common::error_codes;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    ConnectionFailed(#[from] io::Error),

    #[error("Failed to serialize request: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("RPC error ({code}): {message}")]
    RpcError {
        code: i32,
        message: String,
        category: Option<ErrorCategory>,
        retryable: bool,
        context: Option<Value>,
        suggestion: Option<String>,
    },

    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("Invalid response from daemon")]
    InvalidResponse,

    #[error("Unexpected response: {message}")]
    UnexpectedResponse { message: String },
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::RpcError { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            ClientError::RpcError { category, .. } => *category,
            _ => None,
        }
    }

    pub fn context(&self) -> Option<&Value> {
        match self {
            ClientError::RpcError { context, .. } => context.as_ref(),
            _ => None,
        }
    }

    pub fn suggestion(&self) -> Option<&str> {
        match self {
            ClientError::RpcError { suggestion, .. } => suggestion.as_deref(),
            ClientError::DaemonNotRunning => Some("Start the daemon with: agent-exec daemon"),
            _ => None,
        }
    }

    fn from_error_object(error: &Value) -> Self {
        let code = error
            .get("code")
            .and_then(Value::as_i64)
            .and_then(|code| i32::try_from(code).ok())
            .unwrap_or(error_codes::GENERIC_ERROR);
        let data = error.get("data");
        ClientError::RpcError {
            code,
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            category: data
                .and_then(|d| d.get("category"))
                .and_then(Value::as_str)
                .and_then(|c| c.parse().ok())
                .or_else(|| Some(error_codes::category_for_code(code))),
            retryable: data
                .and_then(|d| d.get("retryable"))
                .and_then(Value::as_bool)
                .unwrap_or_else(|| error_codes::is_retryable(code)),
            context: data.and_then(|d| d.get("context")).cloned(),
            suggestion: data
                .and_then(|d| d.get("suggestion"))
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

/// One frame read from the daemon.
#[derive(Debug)]
pub enum Message {
    Response {
        id: u64,
        result: Result<Value, ClientError>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

impl Message {
    fn parse(line: &str) -> Result<Self, ClientError> {
        let value: Value = serde_json::from_str(line).map_err(|_| ClientError::InvalidResponse)?;
        if let Some(method) = value.get("method").and_then(Value::as_str) {
            return Ok(Message::Notification {
                method: method.to_string(),
                params: value.get("params").cloned().unwrap_or(Value::Null),
            });
        }
        let id = value
            .get("id")
            .and_then(Value::as_u64)
            .ok_or(ClientError::InvalidResponse)?;
        let result = match (value.get("error"), value.get("result")) {
            (Some(error), _) => Err(ClientError::from_error_object(error)),
            (None, Some(result)) => Ok(result.clone()),
            (None, None) => Err(ClientError::InvalidResponse),
        };
        Ok(Message::Response { id, result })
    }
}

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

pub struct SocketClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    next_id: u64,
}

impl SocketClient {
    /// A missing or refusing socket means no daemon is listening.
    pub fn connect(path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                ClientError::DaemonNotRunning
            }
            _ => ClientError::ConnectionFailed(err),
        })?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let writer = stream.try_clone()?;
        debug!(socket = %path.display(), "Connected to daemon");
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            next_id: 1,
        })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        self.reader.get_ref().set_read_timeout(timeout)?;
        Ok(())
    }

    /// Writes a request and returns its id without waiting for the reply.
    pub fn send(&mut self, method: &str, params: Option<Value>) -> Result<u64, ClientError> {
        let id = self.next_id;
        self.next_id += 1;
        let mut line = serde_json::to_string(&Request {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })?;
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        trace!(id, method, "Request sent");
        Ok(id)
    }

    pub fn next_message(&mut self) -> Result<Message, ClientError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Err(ClientError::UnexpectedResponse {
                    message: "daemon closed the connection".to_string(),
                });
            }
            if !line.trim().is_empty() {
                return Message::parse(line.trim_end());
            }
        }
    }

    /// Sends a request and waits for its reply, skipping notifications.
    pub fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let id = self.send(method, params)?;
        loop {
            if let Message::Response { id: reply, result } = self.next_message()? {
                if reply == id {
                    return result;
                }
            }
        }
    }
}
