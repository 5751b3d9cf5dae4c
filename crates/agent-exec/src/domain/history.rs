use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Normalized command shape that groups duration samples.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandSignature(String);

impl CommandSignature {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSample {
    pub command_signature: CommandSignature,
    pub observed_duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
    /// Only successful runs feed predictions.
    #[serde(default = "default_success")]
    pub success: bool,
}

fn default_success() -> bool {
    true
}

impl TimeoutSample {
    pub fn new(signature: CommandSignature, observed: Duration, success: bool) -> Self {
        Self {
            command_signature: signature,
            observed_duration_ms: u64::try_from(observed.as_millis()).unwrap_or(u64::MAX),
            recorded_at: Utc::now(),
            success,
        }
    }

    pub fn observed_duration(&self) -> Duration {
        Duration::from_millis(self.observed_duration_ms)
    }
}

/// Coarse task-complexity class that keys the static timeout table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Trivial,
    Simple,
    Medium,
    Complex,
    Extreme,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Trivial => "trivial",
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::Complex => "complex",
            Complexity::Extreme => "extreme",
        }
    }

    /// One class heavier, saturating at `Extreme`.
    pub fn bump(self) -> Self {
        match self {
            Complexity::Trivial => Complexity::Simple,
            Complexity::Simple => Complexity::Medium,
            Complexity::Medium => Complexity::Complex,
            Complexity::Complex | Complexity::Extreme => Complexity::Extreme,
        }
    }
}

impl FromStr for Complexity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trivial" => Ok(Complexity::Trivial),
            "simple" | "low" => Ok(Complexity::Simple),
            "medium" => Ok(Complexity::Medium),
            "complex" | "high" => Ok(Complexity::Complex),
            "extreme" => Ok(Complexity::Extreme),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_defaults_success_when_missing() {
        let json = r#"{"command_signature":"ls","observed_duration_ms":12,"recorded_at":"2026-01-01T00:00:00Z"}"#;
        let sample: TimeoutSample = serde_json::from_str(json).unwrap();
        assert!(sample.success);
        assert_eq!(sample.observed_duration(), Duration::from_millis(12));
    }

    #[test]
    fn test_complexity_aliases_and_bump() {
        assert_eq!("high".parse::<Complexity>(), Ok(Complexity::Complex));
        assert_eq!("LOW".parse::<Complexity>(), Ok(Complexity::Simple));
        assert_eq!(Complexity::Complex.bump(), Complexity::Extreme);
        assert_eq!(Complexity::Extreme.bump(), Complexity::Extreme);
    }
}
