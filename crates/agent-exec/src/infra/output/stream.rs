//! Concurrent pipe draining into a bounded buffer.
//!
//! Both pipes are drained from the moment the child is spawned until EOF,
//! whatever happens downstream. A capped buffer or a full client queue only
//! changes what is kept or forwarded, never whether the pipe is read.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::common::mutex_lock_or_recover;
use crate::domain::OutputBuffer;
use crate::domain::OutputChunk;
use crate::domain::OutputLimits;
use crate::domain::OutputSummary;
use crate::domain::StreamKind;

const READ_CAPACITY: usize = 64 * 1024;

/// Last time any pipe produced bytes.
#[derive(Debug)]
pub struct ActivityTracker {
    origin: Instant,
    last_ms: AtomicU64,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let now = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.store(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

struct Shared {
    buffer: Mutex<OutputBuffer>,
    activity: Arc<ActivityTracker>,
    undelivered: AtomicU64,
}

impl Shared {
    fn accept(&self, chunk: OutputChunk, tx: &mpsc::Sender<OutputChunk>) {
        self.activity.touch();
        let kept = mutex_lock_or_recover(&self.buffer).push(&chunk.data);
        if !kept {
            return;
        }
        match tx.try_send(chunk) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.undelivered.fetch_add(1, Ordering::Relaxed);
            }
            // Nobody is listening any more; keep draining for the buffer.
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

pub struct OutputStream {
    shared: Arc<Shared>,
    readers: Vec<JoinHandle<()>>,
}

impl OutputStream {
    /// Starts one drain task per pipe and returns the chunk receiver.
    ///
    /// The receiver closes once every pipe reaches EOF.
    pub fn attach<O, E>(
        stdout: Option<O>,
        stderr: Option<E>,
        limits: OutputLimits,
        queue: usize,
    ) -> (Self, mpsc::Receiver<OutputChunk>)
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let shared = Arc::new(Shared {
            buffer: Mutex::new(OutputBuffer::with_limits(&limits)),
            activity: Arc::new(ActivityTracker::new()),
            undelivered: AtomicU64::new(0),
        });
        let max_line = limits.max_line_bytes.max(1);

        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = stdout {
            readers.push(tokio::spawn(drain(
                pipe,
                StreamKind::Stdout,
                max_line,
                Arc::clone(&shared),
                tx.clone(),
            )));
        }
        if let Some(pipe) = stderr {
            readers.push(tokio::spawn(drain(
                pipe,
                StreamKind::Stderr,
                max_line,
                Arc::clone(&shared),
                tx.clone(),
            )));
        }

        (Self { shared, readers }, rx)
    }

    pub fn activity(&self) -> Arc<ActivityTracker> {
        Arc::clone(&self.shared.activity)
    }

    pub fn snapshot(&self) -> OutputBuffer {
        mutex_lock_or_recover(&self.shared.buffer).clone()
    }

    /// Waits for both pipes to reach EOF, abandoning readers still blocked
    /// after `drain_timeout` (a pipe held open by an escaped descendant).
    pub async fn finish(mut self, drain_timeout: Duration) -> OutputSummary {
        let mut readers = std::mem::take(&mut self.readers);
        let joined = tokio::time::timeout(drain_timeout, async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        })
        .await;
        if joined.is_err() {
            warn!(
                timeout_ms = drain_timeout.as_millis() as u64,
                "Output pipes still open after drain timeout; abandoning readers"
            );
            for reader in &readers {
                reader.abort();
            }
        }

        let mut summary = mutex_lock_or_recover(&self.shared.buffer).summary();
        summary.undelivered = self.shared.undelivered.load(Ordering::Relaxed);
        summary
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

async fn drain<R>(
    pipe: R,
    stream: StreamKind,
    max_line: usize,
    shared: Arc<Shared>,
    tx: mpsc::Sender<OutputChunk>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::with_capacity(READ_CAPACITY, pipe);
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let available = match reader.fill_buf().await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(stream = stream.as_str(), error = %err, "Pipe read failed");
                break;
            }
        };
        if available.is_empty() {
            break;
        }

        let consumed = available.len();
        let mut rest = available;
        while !rest.is_empty() {
            let room = max_line - pending.len();
            match rest.iter().position(|b| *b == b'\n') {
                Some(newline) if newline <= room => {
                    pending.extend_from_slice(&rest[..newline]);
                    rest = &rest[newline + 1..];
                    shared.accept(line_chunk(stream, &mut pending, false), &tx);
                }
                // Split only once a byte past the limit is seen; a full line may
                // still be followed by its newline in a later read.
                _ if rest.len() > room => {
                    pending.extend_from_slice(&rest[..room]);
                    rest = &rest[room..];
                    shared.accept(line_chunk(stream, &mut pending, true), &tx);
                }
                _ => {
                    pending.extend_from_slice(rest);
                    rest = &[];
                }
            }
        }
        reader.consume(consumed);
    }

    if !pending.is_empty() {
        shared.accept(line_chunk(stream, &mut pending, false), &tx);
    }
}

fn line_chunk(stream: StreamKind, pending: &mut Vec<u8>, truncated: bool) -> OutputChunk {
    if !truncated && pending.last() == Some(&b'\r') {
        pending.pop();
    }
    let data = String::from_utf8_lossy(pending).into_owned();
    pending.clear();
    OutputChunk {
        stream,
        data,
        truncated,
    }
}
