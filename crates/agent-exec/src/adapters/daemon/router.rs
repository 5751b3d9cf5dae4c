//! Decodes JSON-RPC requests into typed gateway commands.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Map;
use serde_json::Value;

use super::error::ProtocolError;
use crate::adapters::rpc::RpcRequest;
use crate::adapters::rpc::params;
use crate::domain::CommandSpec;
use crate::domain::ControlKind;
use crate::domain::HookPhase;
use crate::domain::SessionId;

/// Methods answered by the gateway, advertised in `connected`.
pub const METHODS: &[&str] = &[
    "ping",
    "health",
    "execute",
    "execute_batch",
    "control",
    "ack",
    "sessions",
    "predict",
    "hooks.status",
    "hooks.reset",
    "hooks.run",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteRequest {
    pub command: CommandSpec,
    pub timeout: Option<Duration>,
    pub session: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchStep {
    pub command: CommandSpec,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub steps: Vec<BatchStep>,
    pub stop_on_failure: bool,
    pub session: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCommand {
    Ping,
    Health,
    Sessions,
    Execute(ExecuteRequest),
    ExecuteBatch(BatchRequest),
    Control {
        kind: ControlKind,
        session: Option<SessionId>,
    },
    Ack {
        session: Option<SessionId>,
    },
    Predict {
        command: CommandSpec,
    },
    HooksStatus,
    HooksReset,
    HooksRun {
        phase: HookPhase,
        command: CommandSpec,
        metadata: Map<String, Value>,
        session: Option<SessionId>,
    },
}

pub fn decode(request: &RpcRequest) -> Result<GatewayCommand, ProtocolError> {
    match request.method.as_str() {
        "ping" => Ok(GatewayCommand::Ping),
        "health" => Ok(GatewayCommand::Health),
        "sessions" => Ok(GatewayCommand::Sessions),
        "execute" => {
            let p: params::ExecuteParams = required(request)?;
            let session = session_id(p.session.clone());
            let (command, timeout) = command_from(p)?;
            Ok(GatewayCommand::Execute(ExecuteRequest {
                command,
                timeout,
                session,
            }))
        }
        "execute_batch" => {
            let p: params::BatchParams = required(request)?;
            if p.commands.is_empty() {
                return Err(ProtocolError::InvalidParams(
                    "commands must not be empty".to_string(),
                ));
            }
            let steps = p
                .commands
                .into_iter()
                .map(|step| command_from(step).map(|(command, timeout)| BatchStep { command, timeout }))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(GatewayCommand::ExecuteBatch(BatchRequest {
                steps,
                stop_on_failure: p.stop_on_failure,
                session: session_id(p.session),
            }))
        }
        "control" => {
            let p: params::ControlParams = required(request)?;
            Ok(GatewayCommand::Control {
                kind: p.kind,
                session: session_id(p.session),
            })
        }
        "ack" => {
            let p: params::SessionParams = optional(request)?;
            Ok(GatewayCommand::Ack {
                session: session_id(p.session),
            })
        }
        "predict" => {
            let p: params::PredictParams = required(request)?;
            let command = CommandSpec::new(p.executable).with_args(p.arguments);
            command
                .validate()
                .map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;
            Ok(GatewayCommand::Predict { command })
        }
        "hooks.status" => Ok(GatewayCommand::HooksStatus),
        "hooks.reset" => Ok(GatewayCommand::HooksReset),
        "hooks.run" => {
            let p: params::HookRunParams = required(request)?;
            let phase: HookPhase = p
                .phase
                .parse()
                .map_err(|_| ProtocolError::InvalidParams(format!("unknown phase '{}'", p.phase)))?;
            // A phase fired without a command carries an empty argv.
            let command = CommandSpec::new(p.executable.unwrap_or_default()).with_args(p.arguments);
            Ok(GatewayCommand::HooksRun {
                phase,
                command,
                metadata: p.metadata,
                session: session_id(p.session),
            })
        }
        other => Err(ProtocolError::MethodNotFound(other.to_string())),
    }
}

/// Allowlist entries match the executable's basename.
pub fn check_allowed(
    command: &CommandSpec,
    allowlist: Option<&BTreeSet<String>>,
) -> Result<(), ProtocolError> {
    let Some(allowed) = allowlist else {
        return Ok(());
    };
    let name = Path::new(&command.executable)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(&command.executable);
    if allowed.contains(name) {
        Ok(())
    } else {
        Err(ProtocolError::CommandNotAllowed {
            executable: command.executable.clone(),
        })
    }
}

fn command_from(p: params::ExecuteParams) -> Result<(CommandSpec, Option<Duration>), ProtocolError> {
    let timeout = p.timeout.map(parse_timeout).transpose()?;
    let mut command = CommandSpec::new(p.executable).with_args(p.arguments);
    if let Some(dir) = p.working_directory {
        command = command.with_working_directory(dir);
    }
    for (key, value) in p.environment {
        command = command.with_env(key, value);
    }
    command
        .validate()
        .map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;
    Ok((command, timeout))
}

fn parse_timeout(secs: f64) -> Result<Duration, ProtocolError> {
    if secs.is_nan() || secs <= 0.0 {
        return Err(ProtocolError::InvalidParams(format!(
            "timeout must be a positive number of seconds, got {secs}"
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ProtocolError::InvalidParams(format!("timeout {secs}: {e}")))
}

fn session_id(raw: Option<String>) -> Option<SessionId> {
    raw.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(SessionId::new(trimmed))
        }
    })
}

fn required<T: DeserializeOwned>(request: &RpcRequest) -> Result<T, ProtocolError> {
    let params = request.params.as_ref().ok_or(ProtocolError::MissingParams)?;
    serde_json::from_value(params.clone()).map_err(|e| ProtocolError::InvalidParams(e.to_string()))
}

fn optional<T: DeserializeOwned + Default>(request: &RpcRequest) -> Result<T, ProtocolError> {
    match &request.params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(params) => serde_json::from_value(params.clone())
            .map_err(|e| ProtocolError::InvalidParams(e.to_string())),
    }
}
