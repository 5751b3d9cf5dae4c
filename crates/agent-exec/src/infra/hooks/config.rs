//! Hook file loading.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use tracing::info;

use crate::domain::CommandSpec;
use crate::domain::HookDescriptor;
use crate::domain::HookPhase;

#[derive(Error, Debug)]
pub enum HookConfigError {
    #[error("failed to read hook file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("hook file is not valid JSON: {source}")]
    Parse {
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    UnknownPhase(String),
    #[error("invalid hook command in {phase}: {reason}")]
    InvalidCommand { phase: HookPhase, reason: String },
    #[error("invalid timeout {value} in {scope}")]
    InvalidTimeout { scope: String, value: f64 },
}

#[derive(Debug, Deserialize)]
struct RawFile {
    timeout: Option<f64>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    hooks: BTreeMap<String, RawEntries>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntries {
    Many(Vec<RawEntry>),
    One(RawEntry),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Line(String),
    Argv(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Command(RawCommand),
    Full {
        command: RawCommand,
        timeout: Option<f64>,
        #[serde(default)]
        blocking: bool,
        working_directory: Option<PathBuf>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
}

/// Hooks per phase in declaration order. Loaded once, never mutated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookSet {
    hooks: BTreeMap<HookPhase, Vec<HookDescriptor>>,
}

impl HookSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A missing file yields an empty set; anything unreadable or malformed is an error.
    pub fn load(path: &Path, default_timeout: Duration) -> Result<Self, HookConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No hook file; running without hooks");
                return Ok(Self::empty());
            }
            Err(source) => {
                return Err(HookConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let set = Self::from_json_str(&text, default_timeout)?;
        info!(path = %path.display(), hooks = set.len(), "Loaded hook configuration");
        Ok(set)
    }

    pub fn from_json_str(text: &str, default_timeout: Duration) -> Result<Self, HookConfigError> {
        let raw: RawFile =
            serde_json::from_str(text).map_err(|source| HookConfigError::Parse { source })?;
        let file_timeout = match raw.timeout {
            Some(secs) => seconds(secs, "file")?,
            None => default_timeout,
        };

        let mut hooks: BTreeMap<HookPhase, Vec<HookDescriptor>> = BTreeMap::new();
        for (name, entries) in raw.hooks {
            let phase: HookPhase = name.parse().map_err(HookConfigError::UnknownPhase)?;
            let entries = match entries {
                RawEntries::Many(entries) => entries,
                RawEntries::One(entry) => vec![entry],
            };
            for entry in entries {
                let descriptor = build_descriptor(phase, entry, file_timeout, &raw.env)?;
                hooks.entry(phase).or_default().push(descriptor);
            }
        }
        Ok(Self { hooks })
    }

    #[cfg(test)]
    pub fn with_hook(mut self, hook: HookDescriptor) -> Self {
        self.hooks.entry(hook.phase).or_default().push(hook);
        self
    }

    pub fn for_phase(&self, phase: HookPhase) -> &[HookDescriptor] {
        self.hooks.get(&phase).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hook count for every phase, zeros included.
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        HookPhase::ALL
            .into_iter()
            .map(|phase| (phase.as_str(), self.for_phase(phase).len()))
            .collect()
    }
}

fn seconds(value: f64, scope: &str) -> Result<Duration, HookConfigError> {
    if value.is_finite() && value > 0.0 {
        if let Ok(duration) = Duration::try_from_secs_f64(value) {
            return Ok(duration);
        }
    }
    Err(HookConfigError::InvalidTimeout {
        scope: scope.to_string(),
        value,
    })
}

fn build_descriptor(
    phase: HookPhase,
    entry: RawEntry,
    file_timeout: Duration,
    file_env: &BTreeMap<String, String>,
) -> Result<HookDescriptor, HookConfigError> {
    let invalid = |reason: String| HookConfigError::InvalidCommand { phase, reason };
    let (command, timeout, blocking, working_directory, env) = match entry {
        RawEntry::Command(command) => (command, None, false, None, BTreeMap::new()),
        RawEntry::Full {
            command,
            timeout,
            blocking,
            working_directory,
            env,
        } => (command, timeout, blocking, working_directory, env),
    };

    let mut spec = match command {
        RawCommand::Line(line) => CommandSpec::parse(&line).map_err(|e| invalid(e.to_string()))?,
        RawCommand::Argv(argv) => CommandSpec::from_argv(argv).map_err(|e| invalid(e.to_string()))?,
    };
    spec.working_directory = working_directory;
    for (key, value) in file_env.iter().chain(env.iter()) {
        spec.environment.insert(key.clone(), value.clone());
    }
    spec.validate().map_err(|e| invalid(e.to_string()))?;

    let timeout = match timeout {
        Some(secs) => seconds(secs, phase.as_str())?,
        None => file_timeout,
    };
    Ok(HookDescriptor {
        phase,
        command: spec,
        timeout,
        blocking,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DEFAULT: Duration = Duration::from_secs(60);

    #[test]
    fn test_missing_file_is_empty_set() {
        let dir = TempDir::new().unwrap();
        let set = HookSet::load(&dir.path().join("absent.json"), DEFAULT).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.counts().get("pre_execute"), Some(&0));
    }

    #[test]
    fn test_full_document() {
        let text = r#"{
            "timeout": 10,
            "env": {"EXTRA": "1"},
            "hooks": {
                "pre-execute": [
                    "scripts/check.sh --strict 'two words'",
                    {"command": ["python3", "gate.py"], "timeout": 5, "blocking": true, "env": {"EXTRA": "2"}}
                ],
                "post_execute": "scripts/metrics.sh"
            }
        }"#;
        let set = HookSet::from_json_str(text, DEFAULT).unwrap();
        assert_eq!(set.len(), 3);

        let pre = set.for_phase(HookPhase::PreExecute);
        assert_eq!(pre[0].command.executable, "scripts/check.sh");
        assert_eq!(pre[0].command.arguments, vec!["--strict", "two words"]);
        assert_eq!(pre[0].timeout, Duration::from_secs(10));
        assert!(!pre[0].blocking);
        assert_eq!(pre[0].command.environment.get("EXTRA").map(String::as_str), Some("1"));

        assert_eq!(pre[1].command.executable, "python3");
        assert_eq!(pre[1].timeout, Duration::from_secs(5));
        assert!(pre[1].blocking);
        assert_eq!(pre[1].command.environment.get("EXTRA").map(String::as_str), Some("2"));

        let post = set.for_phase(HookPhase::PostExecute);
        assert_eq!(post.len(), 1);
        assert_eq!(post[0].timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_default_timeout_applies_without_file_timeout() {
        let set = HookSet::from_json_str(r#"{"hooks": {"post_output": ["true"]}}"#, DEFAULT).unwrap();
        assert_eq!(set.for_phase(HookPhase::PostOutput)[0].timeout, DEFAULT);
    }

    #[test]
    fn test_unknown_phase_is_rejected() {
        let err = HookSet::from_json_str(r#"{"hooks": {"later": "true"}}"#, DEFAULT).unwrap_err();
        assert!(matches!(err, HookConfigError::UnknownPhase(_)));
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        let err = HookSet::from_json_str("{\"hooks\": ", DEFAULT).unwrap_err();
        assert!(matches!(err, HookConfigError::Parse { .. }));
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let err = HookSet::from_json_str(r#"{"hooks": {"pre_tool": ""}}"#, DEFAULT).unwrap_err();
        assert!(matches!(err, HookConfigError::InvalidCommand { .. }));
    }

    #[test]
    fn test_non_positive_timeout_is_rejected() {
        let text = r#"{"hooks": {"pre_tool": {"command": "true", "timeout": 0}}}"#;
        let err = HookSet::from_json_str(text, DEFAULT).unwrap_err();
        assert!(matches!(err, HookConfigError::InvalidTimeout { .. }));
    }
}
