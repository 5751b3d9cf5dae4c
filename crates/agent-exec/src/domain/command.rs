//! Explicit argument-vector command descriptions.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// A command to run: program plus an ordered argument vector.
///
/// Commands are never assembled into a shell line. Strings that arrive as a
/// single command line (hook configuration) are split with [`CommandSpec::parse`],
/// which tokenizes like a POSIX shell but never invokes one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandSpecError {
    #[error("executable must not be empty")]
    EmptyExecutable,
    #[error("{field} contains a NUL byte")]
    NulByte { field: String },
    #[error("invalid environment variable name '{0}'")]
    InvalidEnvName(String),
    #[error("cannot split command line: {0}")]
    Unparseable(String),
}

impl CommandSpec {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            arguments: Vec::new(),
            working_directory: None,
            environment: BTreeMap::new(),
        }
    }

    /// Splits a command line into an argument vector without a shell.
    pub fn parse(line: &str) -> Result<Self, CommandSpecError> {
        let words =
            shell_words::split(line).map_err(|e| CommandSpecError::Unparseable(e.to_string()))?;
        Self::from_argv(words)
    }

    pub fn from_argv(argv: Vec<String>) -> Result<Self, CommandSpecError> {
        let mut words = argv.into_iter();
        let executable = words.next().ok_or(CommandSpecError::EmptyExecutable)?;
        let spec = Self::new(executable).with_args(words);
        spec.validate()?;
        Ok(spec)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Basename of the executable, used for allowlists and signatures.
    pub fn program_name(&self) -> &str {
        Path::new(&self.executable)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.executable)
    }

    /// Quoted rendering for logs only; never executed.
    pub fn display(&self) -> String {
        let mut words = Vec::with_capacity(self.arguments.len() + 1);
        words.push(self.executable.as_str());
        words.extend(self.arguments.iter().map(String::as_str));
        shell_words::join(words)
    }

    pub fn validate(&self) -> Result<(), CommandSpecError> {
        if self.executable.trim().is_empty() {
            return Err(CommandSpecError::EmptyExecutable);
        }
        if self.executable.contains('\0') {
            return Err(CommandSpecError::NulByte {
                field: "executable".to_string(),
            });
        }
        if let Some(index) = self.arguments.iter().position(|a| a.contains('\0')) {
            return Err(CommandSpecError::NulByte {
                field: format!("arguments[{index}]"),
            });
        }
        for (key, value) in &self.environment {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(CommandSpecError::InvalidEnvName(key.clone()));
            }
            if value.contains('\0') {
                return Err(CommandSpecError::NulByte {
                    field: format!("environment[{key}]"),
                });
            }
        }
        Ok(())
    }
}
