//! Duration-history store capability.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::RwLock;

use thiserror::Error;

use crate::common::rwlock_read_or_recover;
use crate::common::rwlock_write_or_recover;
use crate::domain::CommandSignature;
use crate::domain::TimeoutSample;

pub const DEFAULT_RETENTION: usize = 100;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history store unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("history store I/O error ({operation}): {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("history record corrupt: {0}")]
    Corrupt(String),
}

impl HistoryError {
    /// Worth another attempt under the shared retry policy.
    pub fn is_transient(&self) -> bool {
        match self {
            HistoryError::Unavailable { .. } => true,
            HistoryError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            HistoryError::Corrupt(_) => false,
        }
    }
}

/// Keyed, append-only history of observed durations.
///
/// `get` returns samples oldest first. Implementations keep a bounded
/// retention window per signature.
pub trait HistoryStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn get(&self, signature: &CommandSignature) -> Result<Vec<TimeoutSample>, HistoryError>;

    fn append(&self, sample: &TimeoutSample) -> Result<(), HistoryError>;
}

pub type HistoryStoreHandle = Arc<dyn HistoryStore>;

/// Store used when no history backend is configured or reachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHistoryStore;

impl HistoryStore for NullHistoryStore {
    fn name(&self) -> &'static str {
        "null"
    }

    fn get(&self, _signature: &CommandSignature) -> Result<Vec<TimeoutSample>, HistoryError> {
        Ok(Vec::new())
    }

    fn append(&self, _sample: &TimeoutSample) -> Result<(), HistoryError> {
        Ok(())
    }
}

/// Process-local store; history is lost on restart.
#[derive(Debug)]
pub struct MemoryHistoryStore {
    samples: RwLock<HashMap<CommandSignature, VecDeque<TimeoutSample>>>,
    retention: usize,
}

impl MemoryHistoryStore {
    pub fn new(retention: usize) -> Self {
        Self {
            samples: RwLock::new(HashMap::new()),
            retention: retention.max(1),
        }
    }
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, signature: &CommandSignature) -> Result<Vec<TimeoutSample>, HistoryError> {
        Ok(rwlock_read_or_recover(&self.samples)
            .get(signature)
            .map(|samples| samples.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn append(&self, sample: &TimeoutSample) -> Result<(), HistoryError> {
        let mut samples = rwlock_write_or_recover(&self.samples);
        let entry = samples
            .entry(sample.command_signature.clone())
            .or_default();
        entry.push_back(sample.clone());
        while entry.len() > self.retention {
            entry.pop_front();
        }
        Ok(())
    }
}
