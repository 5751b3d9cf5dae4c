//! Child-process lifecycle: spawn into a fresh process group, signal, reap.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::process::Child;
use tokio::process::ChildStderr;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use super::group::group_alive;
use super::group::signal_group;
use crate::common::error_codes::{self, ErrorCategory};
use crate::domain::CommandSpec;
use crate::domain::ProcessRecord;
use crate::domain::SignalKind;

const REAP_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Command not found: {command}")]
    NotFound { command: String },

    #[error("Permission denied: {command}")]
    PermissionDenied { command: String },

    #[error("Invalid command: {reason}")]
    InvalidCommand { reason: String },

    #[error("Failed to spawn {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
}

impl SpawnError {
    fn from_io(command: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => SpawnError::NotFound {
                command: command.to_string(),
            },
            io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied {
                command: command.to_string(),
            },
            io::ErrorKind::InvalidInput => SpawnError::InvalidCommand {
                reason: err.to_string(),
            },
            _ => SpawnError::Io {
                command: command.to_string(),
                source: err,
            },
        }
    }

    /// Resource exhaustion or a racing writer; another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SpawnError::Io { source, .. } => {
                source.kind() == io::ErrorKind::Interrupted
                    || matches!(
                        source.raw_os_error(),
                        Some(libc::EAGAIN) | Some(libc::ETXTBSY)
                    )
            }
            _ => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SpawnError::NotFound { .. } => ErrorCategory::NotFound,
            SpawnError::InvalidCommand { .. } => ErrorCategory::InvalidInput,
            SpawnError::PermissionDenied { .. } | SpawnError::Io { .. } => ErrorCategory::External,
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            SpawnError::NotFound { .. } => {
                "Command not found. Check that the executable exists and is in PATH.".to_string()
            }
            SpawnError::PermissionDenied { .. } => {
                "Permission denied. Check the executable's file mode.".to_string()
            }
            SpawnError::InvalidCommand { .. } => {
                "Check the executable, arguments and working directory.".to_string()
            }
            SpawnError::Io { .. } => {
                "Process spawn failed. Check system limits (ulimit -u, ulimit -n).".to_string()
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: i32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to wait for pid {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("Process group {pgid} survived SIGKILL")]
    ReapTimeout { pgid: i32 },
}

impl ProcessError {
    pub fn code(&self) -> i32 {
        error_codes::INTERNAL_ERROR
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Time between SIGTERM and SIGKILL.
    pub grace: Duration,
    /// How long to wait for a SIGKILLed group to disappear.
    pub reap_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            reap_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinMode {
    Null,
    Piped,
}

/// A running child plus its record. Dropping it SIGKILLs the leader.
#[derive(Debug)]
pub struct SpawnedProcess {
    child: Child,
    record: ProcessRecord,
}

impl SpawnedProcess {
    pub fn record(&self) -> &ProcessRecord {
        &self.record
    }

    pub fn pid(&self) -> u32 {
        self.record.pid()
    }

    pub fn pgid(&self) -> i32 {
        self.record.process_group_id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }
}

/// Exit code, or the negated signal number for a signal death.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawns `spec` as the leader of a new process group with piped output.
    ///
    /// No process group exists when this returns an error.
    pub fn spawn(&self, spec: &CommandSpec, stdin: StdinMode) -> Result<SpawnedProcess, SpawnError> {
        spec.validate().map_err(|e| SpawnError::InvalidCommand {
            reason: e.to_string(),
        })?;
        if let Some(dir) = &spec.working_directory {
            if !dir.is_dir() {
                return Err(SpawnError::InvalidCommand {
                    reason: format!("working directory {} does not exist", dir.display()),
                });
            }
        }

        let mut command = Command::new(&spec.executable);
        command
            .args(&spec.arguments)
            .envs(&spec.environment)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(match stdin {
                StdinMode::Null => Stdio::null(),
                StdinMode::Piped => Stdio::piped(),
            })
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_directory {
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .map_err(|e| SpawnError::from_io(&spec.executable, e))?;
        let Some(pid) = child.id() else {
            return Err(SpawnError::Io {
                command: spec.executable.clone(),
                source: io::Error::other("child exited before its pid was read"),
            });
        };
        let pgid = i32::try_from(pid).map_err(|_| SpawnError::Io {
            command: spec.executable.clone(),
            source: io::Error::other(format!("pid {pid} out of range")),
        })?;

        debug!(pid, pgid, command = %spec.display(), "Spawned process group");
        Ok(SpawnedProcess {
            child,
            record: ProcessRecord::new(pid, pgid, Utc::now()),
        })
    }

    /// Returns `false` when the group is already gone.
    pub fn signal(&self, record: &ProcessRecord, kind: SignalKind) -> Result<bool, ProcessError> {
        let pgid = record.process_group_id();
        signal_group(pgid, kind).map_err(|source| ProcessError::Signal { pgid, source })
    }

    pub async fn wait(&self, process: &mut SpawnedProcess) -> Result<i32, ProcessError> {
        let status = process.child.wait().await.map_err(|source| ProcessError::Wait {
            pid: process.pid(),
            source,
        })?;
        Ok(exit_code_of(status))
    }

    /// SIGTERM (plus SIGCONT for a stopped group), then SIGKILL to the whole
    /// group once `escalate_after` passes. Returns the leader's exit code after
    /// every group member is gone.
    pub async fn terminate(
        &self,
        process: &mut SpawnedProcess,
        escalate_after: Duration,
    ) -> Result<i32, ProcessError> {
        let record = process.record.clone();
        let pgid = record.process_group_id();
        self.signal(&record, SignalKind::Terminate)?;
        self.signal(&record, SignalKind::Continue)?;

        let code = match tokio::time::timeout(escalate_after, self.wait(process)).await {
            Ok(code) => code?,
            Err(_) => {
                debug!(pgid, "Grace window elapsed; escalating to SIGKILL");
                self.signal(&record, SignalKind::Kill)?;
                match tokio::time::timeout(self.config.reap_timeout, self.wait(process)).await {
                    Ok(code) => code?,
                    Err(_) => return Err(ProcessError::ReapTimeout { pgid }),
                }
            }
        };
        self.ensure_group_dead(pgid).await?;
        Ok(code)
    }

    /// Kills leftover group members after the leader has been reaped and
    /// waits until the group is empty.
    pub async fn ensure_group_dead(&self, pgid: i32) -> Result<(), ProcessError> {
        if !group_alive(pgid) {
            return Ok(());
        }
        warn!(pgid, "Process group outlived its leader; killing stragglers");
        signal_group(pgid, SignalKind::Kill).map_err(|source| ProcessError::Signal { pgid, source })?;

        let deadline = tokio::time::Instant::now() + self.config.reap_timeout;
        while group_alive(pgid) {
            if tokio::time::Instant::now() >= deadline {
                return Err(ProcessError::ReapTimeout { pgid });
            }
            tokio::time::sleep(REAP_POLL).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_spawn_and_wait_reports_exit_code() {
        let supervisor = ProcessSupervisor::default();
        let mut process = supervisor.spawn(&sh("exit 3"), StdinMode::Null).unwrap();
        assert_eq!(process.pid() as i32, process.pgid());
        assert_eq!(supervisor.wait(&mut process).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stdout_is_piped() {
        let supervisor = ProcessSupervisor::default();
        let spec = CommandSpec::new("echo").arg("hello");
        let mut process = supervisor.spawn(&spec, StdinMode::Null).unwrap();
        let mut stdout = process.take_stdout().unwrap();
        let mut text = String::new();
        stdout.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "hello\n");
        assert_eq!(supervisor.wait(&mut process).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_executable_is_not_found() {
        let supervisor = ProcessSupervisor::default();
        let spec = CommandSpec::new("definitely-not-a-real-binary-4821");
        let err = supervisor.spawn(&spec, StdinMode::Null).unwrap_err();
        assert!(matches!(err, SpawnError::NotFound { .. }));
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_working_directory_is_invalid() {
        let supervisor = ProcessSupervisor::default();
        let spec = CommandSpec::new("true").with_working_directory("/nonexistent/agent-exec");
        let err = supervisor.spawn(&spec, StdinMode::Null).unwrap_err();
        assert!(matches!(err, SpawnError::InvalidCommand { .. }));
    }

    #[tokio::test]
    async fn test_terminate_reaps_whole_group() {
        let supervisor = ProcessSupervisor::default();
        let mut process = supervisor
            .spawn(&sh("sleep 30 & sleep 30"), StdinMode::Null)
            .unwrap();
        let pgid = process.pgid();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let code = supervisor
            .terminate(&mut process, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(code, -libc::SIGTERM);
        assert!(!group_alive(pgid));
    }

    #[tokio::test]
    async fn test_terminate_escalates_when_sigterm_is_ignored() {
        let supervisor = ProcessSupervisor::default();
        let mut process = supervisor
            .spawn(&sh("trap '' TERM; sleep 30"), StdinMode::Null)
            .unwrap();
        let pgid = process.pgid();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let code = supervisor
            .terminate(&mut process, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(code, -libc::SIGKILL);
        assert!(!group_alive(pgid));
    }

    #[tokio::test]
    async fn test_ensure_group_dead_kills_orphans() {
        let supervisor = ProcessSupervisor::default();
        let mut process = supervisor
            .spawn(&sh("sleep 30 >/dev/null 2>&1 & exit 0"), StdinMode::Null)
            .unwrap();
        let pgid = process.pgid();
        assert_eq!(supervisor.wait(&mut process).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;

        supervisor.ensure_group_dead(pgid).await.unwrap();
        assert!(!group_alive(pgid));
    }

    #[tokio::test]
    async fn test_signal_after_exit_reports_missing_group() {
        let supervisor = ProcessSupervisor::default();
        let mut process = supervisor.spawn(&CommandSpec::new("true"), StdinMode::Null).unwrap();
        supervisor.wait(&mut process).await.unwrap();
        let delivered = supervisor
            .signal(process.record(), SignalKind::Terminate)
            .unwrap();
        assert!(!delivered);
    }
}
