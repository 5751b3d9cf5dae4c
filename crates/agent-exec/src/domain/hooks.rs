use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;

use super::command::CommandSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    PreExecute,
    PreTool,
    PreEdit,
    PostTool,
    PostExecute,
    PostOutput,
}

impl HookPhase {
    pub const ALL: [HookPhase; 6] = [
        HookPhase::PreExecute,
        HookPhase::PreTool,
        HookPhase::PreEdit,
        HookPhase::PostTool,
        HookPhase::PostExecute,
        HookPhase::PostOutput,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::PreExecute => "pre_execute",
            HookPhase::PreTool => "pre_tool",
            HookPhase::PreEdit => "pre_edit",
            HookPhase::PostTool => "post_tool",
            HookPhase::PostExecute => "post_execute",
            HookPhase::PostOutput => "post_output",
        }
    }

    /// Pre-phases run before the guarded action and may rewrite the command.
    pub fn is_pre(&self) -> bool {
        matches!(
            self,
            HookPhase::PreExecute | HookPhase::PreTool | HookPhase::PreEdit
        )
    }
}

impl FromStr for HookPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        HookPhase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == normalized)
            .ok_or_else(|| format!("unknown hook phase '{s}'"))
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured hook. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookDescriptor {
    pub phase: HookPhase,
    pub command: CommandSpec,
    pub timeout: Duration,
    /// Failure aborts the guarded operation.
    pub blocking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub consecutive_failures: u32,
    pub state: CircuitState,
    pub opened_at: Option<Instant>,
}

impl CircuitBreakerState {
    pub fn closed() -> Self {
        Self {
            consecutive_failures: 0,
            state: CircuitState::Closed,
            opened_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }
}
