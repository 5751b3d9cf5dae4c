use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationReason {
    Normal,
    Timeout,
    Stalled,
    Cancelled,
    Error,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Normal => "normal",
            TerminationReason::Timeout => "timeout",
            TerminationReason::Stalled => "stalled",
            TerminationReason::Cancelled => "cancelled",
            TerminationReason::Error => "error",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signals the supervisor delivers to a whole process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Terminate,
    Kill,
    Stop,
    Continue,
}

/// Client-issued control over a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlKind {
    Cancel,
    Pause,
    Resume,
}

impl ControlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKind::Cancel => "CANCEL",
            ControlKind::Pause => "PAUSE",
            ControlKind::Resume => "RESUME",
        }
    }
}

impl FromStr for ControlKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CANCEL" => Ok(ControlKind::Cancel),
            "PAUSE" => Ok(ControlKind::Pause),
            "RESUME" => Ok(ControlKind::Resume),
            other => Err(format!(
                "unknown control type '{other}' (expected CANCEL, PAUSE or RESUME)"
            )),
        }
    }
}

/// Identity and outcome of one spawned process group.
///
/// Only the supervisor that spawned the process holds it mutably; everyone
/// else sees clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pid: u32,
    process_group_id: i32,
    start_time: DateTime<Utc>,
    exit_code: Option<i32>,
    termination_reason: Option<TerminationReason>,
}

impl ProcessRecord {
    pub fn new(pid: u32, process_group_id: i32, start_time: DateTime<Utc>) -> Self {
        Self {
            pid,
            process_group_id,
            start_time,
            exit_code: None,
            termination_reason: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn process_group_id(&self) -> i32 {
        self.process_group_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.termination_reason
    }

    pub fn is_terminal(&self) -> bool {
        self.termination_reason.is_some()
    }

    /// Records the terminal outcome. The first call wins.
    pub fn finish(&mut self, exit_code: Option<i32>, reason: TerminationReason) {
        if self.termination_reason.is_some() {
            return;
        }
        self.exit_code = exit_code;
        self.termination_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_is_first_write_wins() {
        let mut record = ProcessRecord::new(42, 42, Utc::now());
        assert!(!record.is_terminal());
        record.finish(Some(-15), TerminationReason::Cancelled);
        record.finish(Some(0), TerminationReason::Normal);
        assert_eq!(record.exit_code(), Some(-15));
        assert_eq!(
            record.termination_reason(),
            Some(TerminationReason::Cancelled)
        );
    }

    #[test]
    fn test_control_kind_parsing_is_case_insensitive() {
        assert_eq!("cancel".parse::<ControlKind>(), Ok(ControlKind::Cancel));
        assert_eq!(" Pause ".parse::<ControlKind>(), Ok(ControlKind::Pause));
        assert!("STOP".parse::<ControlKind>().is_err());
    }

    #[test]
    fn test_reason_serializes_lowercase() {
        let json = serde_json::to_string(&TerminationReason::Stalled).unwrap();
        assert_eq!(json, "\"stalled\"");
    }
}
