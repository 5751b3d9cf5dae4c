//! Append-only JSONL history file shared by every daemon on the host.
//!
//! Writers append one `TimeoutSample` per line under an exclusive `flock` on
//! a sibling `.lock` file; readers take a shared lock. When the file grows to
//! twice its size after the last compaction it is rewritten with only the
//! most recent `retention` samples per signature.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;
use tracing::info;

use crate::common::mutex_lock_or_recover;
use crate::domain::CommandSignature;
use crate::domain::TimeoutSample;
use crate::usecases::ports::HistoryError;
use crate::usecases::ports::HistoryStore;

const MIN_COMPACTION_LINES: usize = 256;

struct HistoryFileLock {
    file: File,
}

impl HistoryFileLock {
    fn acquire(path: &Path, exclusive: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        let op = if exclusive {
            libc::LOCK_EX
        } else {
            libc::LOCK_SH
        };
        // SAFETY: `fd` comes from `file`, which this guard owns for the lock lifetime.
        let result = unsafe { libc::flock(file.as_raw_fd(), op) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { file })
    }
}

impl Drop for HistoryFileLock {
    fn drop(&mut self) {
        // SAFETY: the fd belongs to `self.file`, still open here; unlocking is idempotent.
        let _ = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

#[derive(Debug, Default)]
struct LineCount {
    /// Lines in the file, once known.
    current: Option<usize>,
    /// Line count right after the last compaction (or first observation).
    baseline: usize,
}

pub struct JsonlHistoryStore {
    path: PathBuf,
    lock_path: PathBuf,
    retention: usize,
    lines: Mutex<LineCount>,
}

fn io_error(operation: &'static str) -> impl FnOnce(io::Error) -> HistoryError {
    move |source| HistoryError::Io { operation, source }
}

impl JsonlHistoryStore {
    pub fn new(path: impl Into<PathBuf>, retention: usize) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
            retention: retention.max(1),
            lines: Mutex::new(LineCount::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent(&self) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_error("create history directory"))?;
            }
        }
        Ok(())
    }

    /// Every parseable sample in file order; corrupt lines are skipped.
    fn read_all(&self) -> Result<(Vec<TimeoutSample>, usize), HistoryError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(err) => return Err(io_error("open history file")(err)),
        };
        let mut samples = Vec::new();
        let mut lines = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(io_error("read history file"))?;
            if line.trim().is_empty() {
                continue;
            }
            lines += 1;
            match serde_json::from_str::<TimeoutSample>(&line) {
                Ok(sample) => samples.push(sample),
                Err(err) => debug!(error = %err, "Skipping corrupt history line"),
            }
        }
        Ok((samples, lines))
    }

    fn compact(&self, samples: Vec<TimeoutSample>) -> Result<usize, HistoryError> {
        let mut order: Vec<CommandSignature> = Vec::new();
        let mut kept: HashMap<CommandSignature, VecDeque<TimeoutSample>> = HashMap::new();
        for sample in samples {
            let entry = kept
                .entry(sample.command_signature.clone())
                .or_insert_with(|| {
                    order.push(sample.command_signature.clone());
                    VecDeque::new()
                });
            entry.push_back(sample);
            if entry.len() > self.retention {
                entry.pop_front();
            }
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        let file = File::create(&tmp_path).map_err(io_error("create compaction file"))?;
        let mut writer = BufWriter::new(file);
        let mut written = 0usize;
        for signature in &order {
            for sample in kept.get(signature).into_iter().flatten() {
                let line = serde_json::to_string(sample)
                    .map_err(|e| HistoryError::Corrupt(e.to_string()))?;
                writeln!(writer, "{line}").map_err(io_error("write compaction file"))?;
                written += 1;
            }
        }
        writer.flush().map_err(io_error("flush compaction file"))?;
        fs::rename(&tmp_path, &self.path).map_err(io_error("replace history file"))?;
        Ok(written)
    }
}

impl HistoryStore for JsonlHistoryStore {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn get(&self, signature: &CommandSignature) -> Result<Vec<TimeoutSample>, HistoryError> {
        self.ensure_parent()?;
        let _lock = HistoryFileLock::acquire(&self.lock_path, false)
            .map_err(io_error("lock history file"))?;
        let (samples, _) = self.read_all()?;
        let mut matching: Vec<TimeoutSample> = samples
            .into_iter()
            .filter(|sample| &sample.command_signature == signature)
            .collect();
        let excess = matching.len().saturating_sub(self.retention);
        matching.drain(..excess);
        Ok(matching)
    }

    fn append(&self, sample: &TimeoutSample) -> Result<(), HistoryError> {
        let line = serde_json::to_string(sample).map_err(|e| HistoryError::Corrupt(e.to_string()))?;
        self.ensure_parent()?;
        let _lock = HistoryFileLock::acquire(&self.lock_path, true)
            .map_err(io_error("lock history file"))?;

        let mut counts = mutex_lock_or_recover(&self.lines);
        let current = match counts.current {
            Some(current) => current,
            None => {
                let (_, lines) = self.read_all()?;
                counts.baseline = lines;
                lines
            }
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_error("open history file"))?;
        writeln!(file, "{line}").map_err(io_error("append history sample"))?;
        let current = current + 1;
        counts.current = Some(current);

        let threshold = counts.baseline.saturating_mul(2).max(MIN_COMPACTION_LINES);
        if current >= threshold {
            // Other daemons may have appended since we last counted.
            let (samples, lines) = self.read_all()?;
            let written = self.compact(samples)?;
            info!(
                path = %self.path.display(),
                before = lines,
                after = written,
                "Compacted history file"
            );
            counts.current = Some(written);
            counts.baseline = written;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn sample(sig: &str, ms: u64) -> TimeoutSample {
        TimeoutSample::new(CommandSignature::new(sig), Duration::from_millis(ms), true)
    }

    fn durations(samples: &[TimeoutSample]) -> Vec<u64> {
        samples.iter().map(|s| s.observed_duration_ms).collect()
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonlHistoryStore::new(dir.path().join("state/history.jsonl"), 10);
        assert!(store.get(&CommandSignature::new("ls")).unwrap().is_empty());
    }

    #[test]
    fn test_samples_persist_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        {
            let store = JsonlHistoryStore::new(&path, 10);
            store.append(&sample("ls", 10)).unwrap();
            store.append(&sample("cat", 20)).unwrap();
            store.append(&sample("ls", 30)).unwrap();
        }
        let store = JsonlHistoryStore::new(&path, 10);
        let ls = store.get(&CommandSignature::new("ls")).unwrap();
        assert_eq!(durations(&ls), vec![10, 30]);
    }

    #[test]
    fn test_get_returns_retention_window() {
        let dir = TempDir::new().unwrap();
        let store = JsonlHistoryStore::new(dir.path().join("h.jsonl"), 2);
        for ms in 1..=4 {
            store.append(&sample("ls", ms)).unwrap();
        }
        let kept = store.get(&CommandSignature::new("ls")).unwrap();
        assert_eq!(durations(&kept), vec![3, 4]);
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("h.jsonl");
        let good = serde_json::to_string(&sample("ls", 7)).unwrap();
        fs::write(&path, format!("not json\n{good}\n{{\"half\":\n")).unwrap();

        let store = JsonlHistoryStore::new(&path, 10);
        let kept = store.get(&CommandSignature::new("ls")).unwrap();
        assert_eq!(durations(&kept), vec![7]);
    }

    #[test]
    fn test_file_is_compacted_when_it_doubles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("h.jsonl");
        let store = JsonlHistoryStore::new(&path, 5);
        for ms in 0..(MIN_COMPACTION_LINES as u64) {
            store.append(&sample("ls", ms)).unwrap();
        }
        store.append(&sample("cat", 1)).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.lines().count() <= 6);
        let kept = store.get(&CommandSignature::new("ls")).unwrap();
        let last = MIN_COMPACTION_LINES as u64 - 1;
        assert_eq!(durations(&kept), (last - 4..=last).collect::<Vec<_>>());
        assert_eq!(store.get(&CommandSignature::new("cat")).unwrap().len(), 1);
    }
}
