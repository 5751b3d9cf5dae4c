//! Daemon configuration.

use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;
use tracing::warn;

use crate::domain::OutputLimits;
use crate::domain::output::DEFAULT_MAX_BYTES;
use crate::domain::output::DEFAULT_MAX_LINE_BYTES;
use crate::domain::output::DEFAULT_MAX_LINES;
use crate::usecases::BreakerConfig;
use crate::usecases::EstimatorConfig;
use crate::usecases::ports::history_store::DEFAULT_RETENTION;

pub const DEFAULT_MAX_SESSIONS: usize = 100;
const DEFAULT_MAX_CONNECTIONS: usize = 64;
const DEFAULT_MAX_REQUEST_BYTES: usize = 1_048_576;
const DEFAULT_STREAM_QUEUE: usize = 1024;
const DEFAULT_STALL_SECS: u64 = 600;
const DEFAULT_GRACE_MS: u64 = 2000;
const DEFAULT_HOOKS_FILE: &str = ".agent-exec-hooks.json";
const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 60;
const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
const DEFAULT_BREAKER_COOLDOWN_SECS: u64 = 30;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;
const DEFAULT_WS_LISTEN: &str = "127.0.0.1:8003";
const DEFAULT_WS_MAX_CONNECTIONS: usize = 32;

pub fn socket_path() -> PathBuf {
    if let Ok(custom_path) = env::var("AGENT_EXEC_SOCKET") {
        if !custom_path.trim().is_empty() {
            let path = PathBuf::from(custom_path);
            debug!(socket = %path.display(), "Using custom socket path");
            return path;
        }
    }

    env::var("XDG_RUNTIME_DIR")
        .map(|dir| PathBuf::from(dir).join("agent-exec.sock"))
        .unwrap_or_else(|_| PathBuf::from("/tmp/agent-exec.sock"))
}

/// Where timing history lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistorySpec {
    Off,
    Memory,
    File(PathBuf),
}

impl HistorySpec {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "off" | "none" | "" => HistorySpec::Off,
            "memory" => HistorySpec::Memory,
            path => HistorySpec::File(PathBuf::from(path)),
        }
    }

    fn default_path() -> Self {
        let state_dir = env::var("XDG_STATE_HOME")
            .ok()
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| env::var("HOME").ok().map(|home| PathBuf::from(home).join(".local/state")));
        match state_dir {
            Some(dir) => HistorySpec::File(dir.join("agent-exec").join("history.jsonl")),
            None => HistorySpec::Memory,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    socket_path: PathBuf,
    max_connections: usize,
    max_request_bytes: usize,
    max_sessions: usize,
    output_limits: OutputLimits,
    stream_queue: usize,
    stall_window: Duration,
    grace: Duration,
    hooks_path: PathBuf,
    hook_timeout: Duration,
    breaker: BreakerConfig,
    history: HistorySpec,
    history_retention: usize,
    store_timeout: Duration,
    estimator: EstimatorConfig,
    allowed_commands: Option<BTreeSet<String>>,
    ws_listen: String,
    ws_enabled: bool,
    ws_allow_remote: bool,
    ws_max_connections: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DaemonConfig {
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    pub fn lock_path(&self) -> PathBuf {
        self.socket_path.with_extension("lock")
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn max_request_bytes(&self) -> usize {
        self.max_request_bytes
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn output_limits(&self) -> OutputLimits {
        self.output_limits
    }

    pub fn stream_queue(&self) -> usize {
        self.stream_queue
    }

    pub fn stall_window(&self) -> Duration {
        self.stall_window
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn hooks_path(&self) -> &PathBuf {
        &self.hooks_path
    }

    pub fn hook_timeout(&self) -> Duration {
        self.hook_timeout
    }

    pub fn breaker(&self) -> BreakerConfig {
        self.breaker
    }

    pub fn history(&self) -> &HistorySpec {
        &self.history
    }

    pub fn history_retention(&self) -> usize {
        self.history_retention
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    pub fn estimator(&self) -> EstimatorConfig {
        self.estimator
    }

    /// `None` allows every executable.
    pub fn allowed_commands(&self) -> Option<&BTreeSet<String>> {
        self.allowed_commands.as_ref()
    }

    pub fn ws_listen(&self) -> &str {
        &self.ws_listen
    }

    pub fn ws_enabled(&self) -> bool {
        self.ws_enabled
    }

    /// Non-loopback listen addresses are refused unless this is set.
    pub fn ws_allow_remote(&self) -> bool {
        self.ws_allow_remote
    }

    pub fn ws_max_connections(&self) -> usize {
        self.ws_max_connections
    }

    pub fn from_env() -> Self {
        let defaults = EstimatorConfig::default();
        Self {
            socket_path: socket_path(),
            max_connections: parse_env_usize("AGENT_EXEC_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS),
            max_request_bytes: parse_env_usize("AGENT_EXEC_MAX_REQUEST", DEFAULT_MAX_REQUEST_BYTES),
            max_sessions: parse_env_usize("AGENT_EXEC_MAX_SESSIONS", DEFAULT_MAX_SESSIONS),
            output_limits: OutputLimits {
                max_lines: parse_env_usize("AGENT_EXEC_OUTPUT_MAX_LINES", DEFAULT_MAX_LINES),
                max_bytes: parse_env_usize("AGENT_EXEC_OUTPUT_MAX_BYTES", DEFAULT_MAX_BYTES),
                max_line_bytes: parse_env_usize("AGENT_EXEC_OUTPUT_MAX_LINE", DEFAULT_MAX_LINE_BYTES),
            },
            stream_queue: parse_env_usize("AGENT_EXEC_STREAM_QUEUE", DEFAULT_STREAM_QUEUE),
            stall_window: Duration::from_secs(parse_env_u64(
                "AGENT_EXEC_STALL_SECS",
                DEFAULT_STALL_SECS,
            )),
            grace: Duration::from_millis(parse_env_u64("AGENT_EXEC_GRACE_MS", DEFAULT_GRACE_MS)),
            hooks_path: env::var("AGENT_EXEC_HOOKS")
                .ok()
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HOOKS_FILE)),
            hook_timeout: Duration::from_secs(parse_env_u64(
                "AGENT_EXEC_HOOK_TIMEOUT_SECS",
                DEFAULT_HOOK_TIMEOUT_SECS,
            )),
            breaker: BreakerConfig {
                failure_threshold: parse_env_u64(
                    "AGENT_EXEC_BREAKER_THRESHOLD",
                    u64::from(DEFAULT_BREAKER_THRESHOLD),
                )
                .try_into()
                .unwrap_or(DEFAULT_BREAKER_THRESHOLD),
                cooldown: Duration::from_secs(parse_env_u64(
                    "AGENT_EXEC_BREAKER_COOLDOWN_SECS",
                    DEFAULT_BREAKER_COOLDOWN_SECS,
                )),
            },
            history: env::var("AGENT_EXEC_HISTORY")
                .map(|value| HistorySpec::parse(&value))
                .unwrap_or_else(|_| HistorySpec::default_path()),
            history_retention: parse_env_usize("AGENT_EXEC_HISTORY_RETENTION", DEFAULT_RETENTION),
            store_timeout: Duration::from_millis(parse_env_u64(
                "AGENT_EXEC_STORE_TIMEOUT_MS",
                DEFAULT_STORE_TIMEOUT_MS,
            )),
            estimator: EstimatorConfig {
                percentile: parse_env_f64("AGENT_EXEC_TIMEOUT_PERCENTILE", defaults.percentile),
                safety_factor: parse_env_f64("AGENT_EXEC_TIMEOUT_SAFETY", defaults.safety_factor),
                min_samples: parse_env_usize("AGENT_EXEC_TIMEOUT_MIN_SAMPLES", defaults.min_samples),
                ..defaults
            },
            allowed_commands: env::var("AGENT_EXEC_ALLOWED_COMMANDS")
                .ok()
                .and_then(|value| parse_allowlist(&value)),
            ws_listen: env::var("AGENT_EXEC_WS_LISTEN")
                .ok()
                .filter(|addr| !addr.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_WS_LISTEN.to_string()),
            ws_enabled: !parse_env_bool("AGENT_EXEC_WS_DISABLED", false),
            ws_allow_remote: parse_env_bool("AGENT_EXEC_WS_ALLOW_REMOTE", false),
            ws_max_connections: parse_env_usize(
                "AGENT_EXEC_WS_MAX_CONNECTIONS",
                DEFAULT_WS_MAX_CONNECTIONS,
            ),
        }
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn with_hooks_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.hooks_path = path.into();
        self
    }

    pub fn with_history(mut self, history: HistorySpec) -> Self {
        self.history = history;
        self
    }

    pub fn with_allowed_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_commands = Some(commands.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_ws_listen(mut self, addr: impl Into<String>) -> Self {
        self.ws_listen = addr.into();
        self
    }

    pub fn with_ws_enabled(mut self, enabled: bool) -> Self {
        self.ws_enabled = enabled;
        self
    }
}

fn parse_allowlist(value: &str) -> Option<BTreeSet<String>> {
    let names: BTreeSet<String> = value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    (!names.is_empty()).then_some(names)
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    let Some(value) = env_value(key) else {
        return default;
    };
    match value.trim().parse::<usize>() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(value = %value, key, "Invalid numeric config; using default");
            default
        }
    }
}

fn parse_env_u64(key: &str, default: u64) -> u64 {
    let Some(value) = env_value(key) else {
        return default;
    };
    match value.trim().parse::<u64>() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(value = %value, key, "Invalid numeric config; using default");
            default
        }
    }
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    let Some(value) = env_value(key) else {
        return default;
    };
    match value.trim().parse::<f64>() {
        Ok(parsed) if parsed.is_finite() => parsed,
        _ => {
            warn!(value = %value, key, "Invalid numeric config; using default");
            default
        }
    }
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    let Some(value) = env_value(key) else {
        return default;
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(value = %value, key, "Invalid boolean config; using default");
            default
        }
    }
}
