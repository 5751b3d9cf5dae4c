//! WebSocket transport: one JSON-RPC message per text frame on `/ws` and
//! `/ws/mcp`.

use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::CloseFrame;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::close_code;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;
use tracing::debug;
use tracing::error;
use tracing::warn;

use super::gateway::ExecutionGateway;
use super::gateway::Inbound;
use super::gateway::Outbound;
use super::stopped;
use crate::adapters::rpc::RpcResponse;
use crate::common::error_codes;
use crate::infra::daemon::DaemonConfig;

const WS_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
const WS_SEND_TIMEOUT: Duration = Duration::from_secs(15);
const WS_MAX_PARSE_ERRORS: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum WsServerError {
    #[error("WS server disabled")]
    Disabled,
    #[error("Invalid listen address: {message}")]
    InvalidListen { message: String },
    #[error("WS server I/O error ({operation}): {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

pub struct WsServerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl WsServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the server to wind down after the shutdown signal fired.
    pub async fn join(self) {
        let mut task = self.task;
        match tokio::time::timeout(WS_SHUTDOWN_TIMEOUT, &mut task).await {
            Ok(Err(err)) => error!(error = %err, "WS server task failed"),
            Ok(Ok(())) => {}
            Err(_) => {
                warn!(
                    timeout_ms = WS_SHUTDOWN_TIMEOUT.as_millis() as u64,
                    "WS server shutdown timed out; aborting"
                );
                task.abort();
            }
        }
    }
}

struct WsState {
    gateway: Arc<ExecutionGateway>,
    limits: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

pub async fn start_ws_server(
    gateway: Arc<ExecutionGateway>,
    config: &DaemonConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<WsServerHandle, WsServerError> {
    if !config.ws_enabled() {
        return Err(WsServerError::Disabled);
    }
    let std_listener = bind_listener(config.ws_listen(), config.ws_allow_remote())?;
    let local_addr = std_listener.local_addr().map_err(|e| WsServerError::Io {
        operation: "read local address",
        source: e,
    })?;
    let listener = TcpListener::from_std(std_listener).map_err(|e| WsServerError::Io {
        operation: "register listener",
        source: e,
    })?;

    let state = Arc::new(WsState {
        gateway,
        limits: Arc::new(Semaphore::new(config.ws_max_connections().max(1))),
        shutdown: shutdown.clone(),
    });
    let app = build_router(state);

    let mut server_shutdown = shutdown;
    let task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            stopped(&mut server_shutdown).await;
        });
        if let Err(err) = server.await {
            error!(error = %err, "WS server failed");
        }
    });

    Ok(WsServerHandle { local_addr, task })
}

fn build_router(state: Arc<WsState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(ws_handler))
        .route("/ws/mcp", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(State(state): State<Arc<WsState>>, ws: WebSocketUpgrade) -> Response {
    let permit = match Arc::clone(&state.limits).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            let response =
                RpcResponse::error(0, error_codes::GENERIC_ERROR, "too many websocket connections");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::to_string(&response)
                    .unwrap_or_else(|_| "{\"error\":\"busy\"}".to_string()),
            )
                .into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_ws(socket, state, permit))
        .into_response()
}

async fn handle_ws(mut socket: WebSocket, state: Arc<WsState>, _permit: OwnedSemaphorePermit) {
    let (outbound, mut frames) = Outbound::channel();
    let conn = state.gateway.connect(outbound);
    let span = tracing::info_span!("ws_connection", conn_id = conn.id());

    async move {
        debug!("WS client connected");
        let mut shutdown = state.shutdown.clone();
        let mut parse_errors = 0u8;
        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    if send_text(&mut socket, frame).await.is_err() {
                        break;
                    }
                }
                msg = socket.recv() => {
                    let Some(Ok(msg)) = msg else { break };
                    match msg {
                        Message::Text(text) => match conn.handle_text(&text).await {
                            Inbound::Handled => parse_errors = 0,
                            Inbound::Malformed => {
                                parse_errors = parse_errors.saturating_add(1);
                                if parse_errors >= WS_MAX_PARSE_ERRORS {
                                    flush(&mut socket, &mut frames).await;
                                    close_with(&mut socket, close_code::POLICY, "too many parse errors").await;
                                    break;
                                }
                            }
                        },
                        Message::Binary(_) => {
                            close_with(&mut socket, close_code::PROTOCOL, "binary frames are not supported").await;
                            break;
                        }
                        Message::Close(_) => break,
                        Message::Ping(payload) => {
                            if socket.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Message::Pong(_) => {}
                    }
                }
            }
        }
        conn.close().await;
        debug!("WS client disconnected");
    }
    .instrument(span)
    .await;
}

async fn send_text(socket: &mut WebSocket, frame: String) -> Result<(), ()> {
    match tokio::time::timeout(WS_SEND_TIMEOUT, socket.send(Message::Text(frame))).await {
        Ok(result) => result.map_err(|_| ()),
        Err(_) => Err(()),
    }
}

/// Sends whatever is already queued, such as the reply to the frame that
/// triggered a close.
async fn flush(socket: &mut WebSocket, frames: &mut mpsc::UnboundedReceiver<String>) {
    while let Ok(frame) = frames.try_recv() {
        if send_text(socket, frame).await.is_err() {
            return;
        }
    }
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

fn bind_listener(listen: &str, allow_remote: bool) -> Result<std::net::TcpListener, WsServerError> {
    let addr = listen
        .to_socket_addrs()
        .map_err(|e| WsServerError::InvalidListen {
            message: e.to_string(),
        })?
        .next()
        .ok_or_else(|| WsServerError::InvalidListen {
            message: "no resolved address".to_string(),
        })?;
    if !allow_remote && !addr.ip().is_loopback() {
        return Err(WsServerError::InvalidListen {
            message: "refusing to bind non-loopback address without AGENT_EXEC_WS_ALLOW_REMOTE=1"
                .to_string(),
        });
    }
    let listener = std::net::TcpListener::bind(addr).map_err(|e| WsServerError::Io {
        operation: "bind",
        source: e,
    })?;
    listener.set_nonblocking(true).map_err(|e| WsServerError::Io {
        operation: "set non-blocking",
        source: e,
    })?;
    Ok(listener)
}
