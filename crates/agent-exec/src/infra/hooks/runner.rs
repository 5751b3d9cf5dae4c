//! Runs a single hook as an isolated, time-boxed process.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::common::error_codes::{self, ErrorCategory};
use crate::domain::CommandSpec;
use crate::domain::HookDescriptor;
use crate::domain::HookPhase;
use crate::domain::SessionId;
use crate::infra::process::ProcessSupervisor;
use crate::infra::process::SpawnError;
use crate::infra::process::StdinMode;
use crate::infra::retry::retry_async;
use crate::usecases::RetryPolicy;

const CAPTURE_LIMIT: usize = 64 * 1024;
const KILL_GRACE: Duration = Duration::from_millis(500);
const PIPE_DRAIN: Duration = Duration::from_secs(1);
const STDERR_EXCERPT: usize = 512;

/// Everything a hook learns about the operation it guards.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub session_id: Option<SessionId>,
    pub command: CommandSpec,
    /// Phase-specific values (exit code, duration, output summary, ...).
    pub metadata: Map<String, Value>,
}

impl HookContext {
    pub fn new(session_id: Option<SessionId>, command: CommandSpec) -> Self {
        Self {
            session_id,
            command,
            metadata: Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Serialize)]
struct HookPayload<'a> {
    phase: HookPhase,
    session_id: Option<&'a str>,
    command: &'a CommandSpec,
    metadata: &'a Map<String, Value>,
}

/// What a successful hook may print on stdout.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HookResponse {
    pub command: Option<CommandSpec>,
    pub environment: Option<BTreeMap<String, String>>,
    pub abort: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookFailureKind {
    Spawn(String),
    TimedOut { after_ms: u64 },
    NonZeroExit { code: i32, stderr: String },
    Aborted { reason: String },
}

impl fmt::Display for HookFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookFailureKind::Spawn(reason) => write!(f, "could not start: {reason}"),
            HookFailureKind::TimedOut { after_ms } => write!(f, "timed out after {after_ms}ms"),
            HookFailureKind::NonZeroExit { code, stderr } if stderr.is_empty() => {
                write!(f, "exited with code {code}")
            }
            HookFailureKind::NonZeroExit { code, stderr } => {
                write!(f, "exited with code {code}: {stderr}")
            }
            HookFailureKind::Aborted { reason } => write!(f, "aborted: {reason}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{phase} hook '{hook}' {kind}")]
pub struct HookFailure {
    pub phase: HookPhase,
    pub hook: String,
    pub blocking: bool,
    pub kind: HookFailureKind,
}

impl HookFailure {
    pub fn code(&self) -> i32 {
        error_codes::HOOK_FAILURE
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::External
    }

    pub fn kind_str(&self) -> &'static str {
        match self.kind {
            HookFailureKind::Spawn(_) => "spawn",
            HookFailureKind::TimedOut { .. } => "timeout",
            HookFailureKind::NonZeroExit { .. } => "exit",
            HookFailureKind::Aborted { .. } => "aborted",
        }
    }

    pub fn context(&self) -> Value {
        let mut context = serde_json::json!({
            "phase": self.phase.as_str(),
            "hook": self.hook,
            "blocking": self.blocking,
            "kind": self.kind_str(),
        });
        if let HookFailureKind::NonZeroExit { code, .. } = self.kind {
            context["exit_code"] = Value::from(code);
        }
        context
    }

    pub fn suggestion(&self) -> String {
        match self.kind {
            HookFailureKind::Spawn(_) => {
                "Check the hook command path and permissions in the hook file.".to_string()
            }
            HookFailureKind::TimedOut { .. } => {
                "Raise the hook's timeout or make the hook faster.".to_string()
            }
            HookFailureKind::NonZeroExit { .. } | HookFailureKind::Aborted { .. } => {
                "The hook rejected this operation. Inspect its stderr for details.".to_string()
            }
        }
    }
}

/// Environment variable name for a metadata key.
fn meta_env_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("AGENT_EXEC_META_{sanitized}")
}

/// Strings pass through verbatim; anything else is JSON so nothing is lost.
fn meta_env_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Pipe contents up to the capture limit.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    /// The pipe produced more than the limit; the rest was discarded.
    overflowed: bool,
}

async fn capture<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> Captured {
    let mut captured = Captured::default();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(captured.bytes.len());
                captured.overflowed |= n > room;
                captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    captured
}

async fn collect(handle: Option<JoinHandle<Captured>>) -> Captured {
    let Some(handle) = handle else {
        return Captured::default();
    };
    let abort = handle.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN, handle).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(_)) => Captured::default(),
        Err(_) => {
            abort.abort();
            Captured::default()
        }
    }
}

fn excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    match text.char_indices().nth(STDERR_EXCERPT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct HookRunner {
    supervisor: ProcessSupervisor,
    retry: RetryPolicy,
}

impl HookRunner {
    pub fn new(supervisor: ProcessSupervisor, retry: RetryPolicy) -> Self {
        Self { supervisor, retry }
    }

    pub async fn run(
        &self,
        hook: &HookDescriptor,
        context: &HookContext,
    ) -> Result<HookResponse, HookFailure> {
        let name = hook.command.display();
        let fail = |kind| HookFailure {
            phase: hook.phase,
            hook: name.clone(),
            blocking: hook.blocking,
            kind,
        };

        let payload = serde_json::to_vec(&HookPayload {
            phase: hook.phase,
            session_id: context.session_id.as_ref().map(SessionId::as_str),
            command: &context.command,
            metadata: &context.metadata,
        })
        .map_err(|e| fail(HookFailureKind::Spawn(format!("context encoding: {e}"))))?;
        let command_json = serde_json::to_string(&context.command)
            .map_err(|e| fail(HookFailureKind::Spawn(format!("context encoding: {e}"))))?;

        let mut spec = hook.command.clone();
        spec.environment
            .insert("AGENT_EXEC_HOOK_PHASE".to_string(), hook.phase.as_str().to_string());
        spec.environment.insert("AGENT_EXEC_COMMAND".to_string(), command_json);
        if let Some(session_id) = &context.session_id {
            spec.environment
                .insert("AGENT_EXEC_SESSION_ID".to_string(), session_id.to_string());
        }
        for (key, value) in &context.metadata {
            spec.environment.insert(meta_env_name(key), meta_env_value(value));
        }

        let mut process = retry_async(&self.retry, "hook spawn", SpawnError::is_transient, |_| {
            std::future::ready(self.supervisor.spawn(&spec, StdinMode::Piped))
        })
        .await
        .map_err(|e| fail(HookFailureKind::Spawn(e.to_string())))?;
        let pid = process.pid();
        let pgid = process.pgid();
        debug!(phase = %hook.phase, hook = %name, pid, "Running hook");

        if let Some(mut stdin) = process.take_stdin() {
            tokio::spawn(async move {
                // A hook that ignores stdin closes the pipe early; that is fine.
                let _ = stdin.write_all(&payload).await;
                let _ = stdin.shutdown().await;
            });
        }
        let stdout = process
            .take_stdout()
            .map(|pipe| tokio::spawn(capture(pipe, CAPTURE_LIMIT)));
        let stderr = process
            .take_stderr()
            .map(|pipe| tokio::spawn(capture(pipe, CAPTURE_LIMIT)));

        let exit = match tokio::time::timeout(hook.timeout, self.supervisor.wait(&mut process)).await
        {
            Ok(Ok(code)) => {
                if let Err(err) = self.supervisor.ensure_group_dead(pgid).await {
                    warn!(pgid, error = %err, "Hook left processes behind");
                }
                code
            }
            Ok(Err(err)) => {
                let _ = self.supervisor.terminate(&mut process, KILL_GRACE).await;
                return Err(fail(HookFailureKind::Spawn(err.to_string())));
            }
            Err(_) => {
                if let Err(err) = self.supervisor.terminate(&mut process, KILL_GRACE).await {
                    warn!(pgid, error = %err, "Failed to terminate timed-out hook");
                }
                return Err(fail(HookFailureKind::TimedOut {
                    after_ms: hook.timeout.as_millis() as u64,
                }));
            }
        };

        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;
        if exit != 0 {
            return Err(fail(HookFailureKind::NonZeroExit {
                code: exit,
                stderr: excerpt(&stderr.bytes),
            }));
        }

        let response = parse_response(&name, &stdout);
        if let Some(reason) = response.abort.clone() {
            return Err(fail(HookFailureKind::Aborted { reason }));
        }
        Ok(response)
    }
}

fn parse_response(hook: &str, stdout: &Captured) -> HookResponse {
    let text = String::from_utf8_lossy(&stdout.bytes);
    let text = text.trim();
    if !text.starts_with('{') {
        return HookResponse::default();
    }
    match serde_json::from_str(text) {
        Ok(response) => response,
        Err(err) if stdout.overflowed => {
            warn!(
                hook,
                limit = CAPTURE_LIMIT,
                error = %err,
                "Hook response exceeded the capture limit and was ignored"
            );
            HookResponse::default()
        }
        Err(err) => {
            debug!(hook, error = %err, "Ignoring non-protocol hook stdout");
            HookResponse::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn hook(script: &str, timeout: Duration) -> HookDescriptor {
        HookDescriptor {
            phase: HookPhase::PreExecute,
            command: CommandSpec::new("sh").arg("-c").arg(script),
            timeout,
            blocking: true,
        }
    }

    fn runner() -> HookRunner {
        HookRunner::new(ProcessSupervisor::default(), RetryPolicy::none())
    }

    fn context() -> HookContext {
        HookContext::new(
            Some(SessionId::new("s-1")),
            CommandSpec::new("echo").arg("hello world"),
        )
        .with_meta("exit_code", 0)
        .with_meta("note", "plain text")
        .with_meta("tags", serde_json::json!(["a", "b"]))
    }

    #[tokio::test]
    async fn test_success_with_silent_hook() {
        let response = runner()
            .run(&hook("exit 0", Duration::from_secs(5)), &context())
            .await
            .unwrap();
        assert_eq!(response, HookResponse::default());
    }

    #[tokio::test]
    async fn test_environment_carries_context_losslessly() {
        let script = r#"
            [ "$AGENT_EXEC_HOOK_PHASE" = pre_execute ] || exit 11
            [ "$AGENT_EXEC_SESSION_ID" = s-1 ] || exit 12
            [ "$AGENT_EXEC_META_NOTE" = "plain text" ] || exit 13
            [ "$AGENT_EXEC_META_TAGS" = '["a","b"]' ] || exit 14
            [ "$AGENT_EXEC_META_EXIT_CODE" = 0 ] || exit 15
            case "$AGENT_EXEC_COMMAND" in *'hello world'*) ;; *) exit 16 ;; esac
        "#;
        runner()
            .run(&hook(script, Duration::from_secs(5)), &context())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stdin_receives_json_context() {
        let script = r#"grep -q '"session_id":"s-1"' || exit 9"#;
        runner()
            .run(&hook(script, Duration::from_secs(5)), &context())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr() {
        let err = runner()
            .run(&hook("echo denied >&2; exit 7", Duration::from_secs(5)), &context())
            .await
            .unwrap_err();
        assert_eq!(
            err.kind,
            HookFailureKind::NonZeroExit {
                code: 7,
                stderr: "denied".to_string()
            }
        );
        assert!(err.blocking);
        assert_eq!(err.code(), error_codes::HOOK_FAILURE);
    }

    #[tokio::test]
    async fn test_timeout_kills_hook_quickly() {
        let started = Instant::now();
        let err = runner()
            .run(&hook("sleep 30", Duration::from_millis(200)), &context())
            .await
            .unwrap_err();
        assert!(matches!(err.kind, HookFailureKind::TimedOut { after_ms: 200 }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_hook_binary_is_spawn_failure() {
        let mut descriptor = hook("true", Duration::from_secs(1));
        descriptor.command = CommandSpec::new("/nonexistent/hook-binary");
        let err = runner().run(&descriptor, &context()).await.unwrap_err();
        assert!(matches!(err.kind, HookFailureKind::Spawn(_)));
    }

    #[tokio::test]
    async fn test_stdout_response_is_parsed() {
        let script = r#"echo '{"command": {"executable": "printf", "arguments": ["rewritten"]}, "environment": {"A": "1"}}'"#;
        let response = runner()
            .run(&hook(script, Duration::from_secs(5)), &context())
            .await
            .unwrap();
        let command = response.command.unwrap();
        assert_eq!(command.executable, "printf");
        assert_eq!(command.arguments, vec!["rewritten"]);
        assert_eq!(response.environment.unwrap().get("A").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_abort_field_is_failure() {
        let err = runner()
            .run(
                &hook(r#"echo '{"abort": "not today"}'"#, Duration::from_secs(5)),
                &context(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.kind,
            HookFailureKind::Aborted {
                reason: "not today".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_capture_flags_overflow() {
        let captured = capture(&b"0123456789"[..], 4).await;
        assert_eq!(captured.bytes, b"0123");
        assert!(captured.overflowed);

        let captured = capture(&b"0123"[..], 4).await;
        assert!(!captured.overflowed);
    }

    #[tokio::test]
    async fn test_oversized_response_is_ignored() {
        let script = r#"printf '{"environment": {"A": "'; head -c 70000 /dev/zero | tr '\0' x; printf '"}}'"#;
        let response = runner()
            .run(&hook(script, Duration::from_secs(5)), &context())
            .await
            .unwrap();
        assert_eq!(response, HookResponse::default());
    }

    #[test]
    fn test_meta_env_names_are_sanitized() {
        assert_eq!(meta_env_name("exit-code"), "AGENT_EXEC_META_EXIT_CODE");
        assert_eq!(meta_env_value(&serde_json::json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(meta_env_value(&Value::from("x")), "x");
    }
}
