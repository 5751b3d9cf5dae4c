//! Unix-socket transport: newline-delimited JSON-RPC, one task per client.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::gateway::ExecutionGateway;
use super::gateway::Outbound;
use super::stopped;
use crate::adapters::rpc::RpcResponse;
use crate::common::DaemonError;
use crate::common::error_codes;

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request exceeds {max_bytes} bytes")]
    SizeLimit { max_bytes: usize },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Removes a stale socket left by a previous daemon; the lock file already
/// proved no live daemon owns it.
pub fn bind_socket(socket_path: &Path) -> Result<UnixListener, DaemonError> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path).map_err(|e| DaemonError::SocketBind {
            operation: "remove stale socket".to_string(),
            source: e,
        })?;
    }
    UnixListener::bind(socket_path).map_err(|e| DaemonError::SocketBind {
        operation: format!("bind {}", socket_path.display()),
        source: e,
    })
}

pub struct SocketServer {
    gateway: Arc<ExecutionGateway>,
    limits: Arc<Semaphore>,
    max_request_bytes: usize,
}

impl SocketServer {
    pub fn new(gateway: Arc<ExecutionGateway>, max_connections: usize, max_request_bytes: usize) -> Self {
        Self {
            gateway,
            limits: Arc::new(Semaphore::new(max_connections.max(1))),
            max_request_bytes,
        }
    }

    /// Accepts until shutdown, then gives open connections a bounded window
    /// to release their sessions.
    pub async fn serve(self, listener: UnixListener, mut shutdown: watch::Receiver<bool>) {
        let server = Arc::new(self);
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => match Arc::clone(&server.limits).try_acquire_owned() {
                        Ok(permit) => {
                            let server = Arc::clone(&server);
                            let shutdown = shutdown.clone();
                            connections.spawn(async move {
                                server.handle_client(stream, shutdown, permit).await;
                            });
                        }
                        Err(_) => {
                            warn!("Connection limit reached; rejecting client");
                            tokio::spawn(reject_busy(stream));
                        }
                    },
                    Err(err) => {
                        error!(error = %err, "Error accepting connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(active_connections = connections.len(), "Waiting for active connections to complete");
        let drained = tokio::time::timeout(SHUTDOWN_WAIT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Shutdown timeout, forcing close");
            connections.abort_all();
        }
    }

    async fn handle_client(
        &self,
        stream: UnixStream,
        mut shutdown: watch::Receiver<bool>,
        _permit: OwnedSemaphorePermit,
    ) {
        let (read_half, mut write_half) = stream.into_split();
        let (outbound, mut frames) = Outbound::channel();
        let conn = self.gateway.connect(outbound.clone());
        let span = tracing::info_span!("daemon_connection", conn_id = conn.id());

        async move {
            debug!("Client connected");
            let writer = tokio::spawn(async move {
                while let Some(frame) = frames.recv().await {
                    if let Err(err) = write_frame(&mut write_half, &frame).await {
                        debug!(error = %err, "Client write failed");
                        break;
                    }
                }
                let _ = write_half.shutdown().await;
            });

            let mut reader = BufReader::new(read_half);
            let mut buf = Vec::new();
            loop {
                let frame = tokio::select! {
                    _ = stopped(&mut shutdown) => break,
                    frame = read_frame(&mut reader, self.max_request_bytes, &mut buf) => frame,
                };
                match frame {
                    Ok(()) => {
                        let text = String::from_utf8_lossy(&buf);
                        let text = text.trim();
                        if text.is_empty() {
                            continue;
                        }
                        conn.handle_text(text).await;
                    }
                    Err(TransportError::ConnectionClosed) => break,
                    Err(TransportError::SizeLimit { max_bytes }) => {
                        warn!(max_bytes, "Request size limit exceeded");
                        outbound.respond(&RpcResponse::error(
                            0,
                            error_codes::PARSE_ERROR,
                            &format!("Parse error: request size limit exceeded ({max_bytes} bytes max)"),
                        ));
                        break;
                    }
                    Err(TransportError::Io(err)) => {
                        debug!(error = %err, "Client connection error");
                        break;
                    }
                }
            }

            conn.close().await;
            drop(conn);
            drop(outbound);
            // In-flight notifications hold queue handles; give them a moment.
            if tokio::time::timeout(WRITE_TIMEOUT, writer).await.is_err() {
                debug!("Writer did not drain before timeout");
            }
            debug!("Client disconnected");
        }
        .instrument(span)
        .await;
    }
}

/// Reads one newline-terminated frame into `buf`, without the size check
/// ever buffering more than `max_bytes + 1` bytes.
async fn read_frame<R>(reader: &mut R, max_bytes: usize, buf: &mut Vec<u8>) -> Result<(), TransportError>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(1);
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Err(TransportError::ConnectionClosed);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > max_bytes {
        return Err(TransportError::SizeLimit { max_bytes });
    }
    Ok(())
}

async fn write_frame<W>(writer: &mut W, frame: &str) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = String::with_capacity(frame.len() + 1);
    line.push_str(frame);
    line.push('\n');
    match tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(line.as_bytes())).await {
        Ok(result) => result.map_err(TransportError::from),
        Err(_) => Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write timed out",
        ))),
    }
}

async fn reject_busy(mut stream: UnixStream) {
    let response = RpcResponse::error(0, error_codes::GENERIC_ERROR, "too many connections");
    if let Ok(text) = serde_json::to_string(&response) {
        let _ = write_frame(&mut stream, &text).await;
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::daemon::Executor;
    use crate::infra::daemon::ExecutorConfig;
    use crate::infra::daemon::SessionRegistry;
    use crate::infra::history::SystemClock;
    use crate::infra::hooks::HookPipeline;
    use crate::infra::hooks::HookRunner;
    use crate::infra::hooks::HookSet;
    use crate::infra::process::ProcessSupervisor;
    use crate::usecases::BreakerConfig;
    use crate::usecases::CircuitBreaker;
    use crate::usecases::EstimatorConfig;
    use crate::usecases::RetryPolicy;
    use crate::usecases::TimeoutEstimator;
    use crate::usecases::ports::MemoryHistoryStore;
    use serde_json::Value;

    fn gateway() -> Arc<ExecutionGateway> {
        let supervisor = ProcessSupervisor::default();
        let pipeline = HookPipeline::new(
            HookSet::empty(),
            Arc::new(CircuitBreaker::new(BreakerConfig::default(), Arc::new(SystemClock))),
            HookRunner::new(supervisor.clone(), RetryPolicy::none()),
        );
        let estimator = TimeoutEstimator::new(
            Arc::new(MemoryHistoryStore::default()),
            EstimatorConfig::default(),
        );
        let executor = Executor::new(supervisor, Arc::new(estimator), pipeline, ExecutorConfig::default());
        Arc::new(ExecutionGateway::new(
            Arc::new(SessionRegistry::new(4)),
            Arc::new(executor),
            None,
            64,
        ))
    }

    async fn next_json<R: AsyncBufRead + Unpin>(lines: &mut tokio::io::Lines<R>) -> Option<Value> {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()?;
        Some(serde_json::from_str(&line).unwrap())
    }

    #[tokio::test]
    async fn test_read_frame_enforces_limit() {
        let mut reader = BufReader::new(&b"{\"a\":1}\nxxxxxxxxxxxxxxxxxxxx\n"[..]);
        let mut buf = Vec::new();
        read_frame(&mut reader, 16, &mut buf).await.unwrap();
        assert_eq!(buf, b"{\"a\":1}");
        let err = read_frame(&mut reader, 16, &mut buf).await.unwrap_err();
        assert!(matches!(err, TransportError::SizeLimit { max_bytes: 16 }));
    }

    #[tokio::test]
    async fn test_read_frame_reports_eof() {
        let mut reader = BufReader::new(&b""[..]);
        let mut buf = Vec::new();
        let err = read_frame(&mut reader, 16, &mut buf).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_client_round_trip_and_parse_error_keeps_connection() {
        let server = SocketServer::new(gateway(), 4, 1024);
        let (client, server_side) = UnixStream::pair().unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let permit = Arc::clone(&server.limits).try_acquire_owned().unwrap();
        let handle = tokio::spawn(async move {
            server.handle_client(server_side, stop_rx, permit).await;
        });

        let (read_half, mut write_half) = client.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let hello = next_json(&mut lines).await.unwrap();
        assert_eq!(hello["method"], "connected");

        write_half.write_all(b"not json\n").await.unwrap();
        let reply = next_json(&mut lines).await.unwrap();
        assert_eq!(reply["error"]["code"], error_codes::PARSE_ERROR);

        write_half
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n")
            .await
            .unwrap();
        let reply = next_json(&mut lines).await.unwrap();
        assert_eq!(reply["id"], 2);
        assert_eq!(reply["result"]["pong"], true);

        drop(write_half);
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversize_request_answers_and_closes() {
        let server = SocketServer::new(gateway(), 4, 64);
        let (client, server_side) = UnixStream::pair().unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let permit = Arc::clone(&server.limits).try_acquire_owned().unwrap();
        tokio::spawn(async move {
            server.handle_client(server_side, stop_rx, permit).await;
        });

        let (read_half, mut write_half) = client.into_split();
        let mut lines = BufReader::new(read_half).lines();
        next_json(&mut lines).await.unwrap();

        let mut big = vec![b'x'; 200];
        big.push(b'\n');
        write_half.write_all(&big).await.unwrap();
        let reply = next_json(&mut lines).await.unwrap();
        assert_eq!(reply["error"]["code"], error_codes::PARSE_ERROR);
        assert!(next_json(&mut lines).await.is_none());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent-exec.sock");
        let listener = bind_socket(&path).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = SocketServer::new(gateway(), 4, 1024);
        let serving = tokio::spawn(server.serve(listener, stop_rx));

        let client = UnixStream::connect(&path).await.unwrap();
        let mut lines = BufReader::new(client).lines();
        assert_eq!(next_json(&mut lines).await.unwrap()["method"], "connected");

        stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(10), serving).await.unwrap().unwrap();
    }
}
