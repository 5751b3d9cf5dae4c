use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use super::process::TerminationReason;

/// Opaque session identifier; generated once and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Cancelling,
    Completed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Cancelling => "cancelling",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        }
    }

    /// A run is in flight and owns the session.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Running | SessionState::Cancelling)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub runs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reason: Option<TerminationReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(SessionState::Running.is_active());
        assert!(SessionState::Cancelling.is_active());
        assert!(!SessionState::Idle.is_active());
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Cancelling.is_terminal());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&SessionState::Cancelling).unwrap();
        assert_eq!(json, "\"cancelling\"");
    }
}
