//! Daemon runtime: wiring, transports and lifecycle.

mod gateway;
mod server;
mod ws_server;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::watch;
use tracing::info;
use tracing::warn;

use crate::common::DaemonError;
use crate::common::telemetry;
use crate::infra::daemon::DaemonConfig;
use crate::infra::daemon::LockFile;
use crate::infra::daemon::SignalHandler;
use crate::infra::daemon::remove_lock_file;
use gateway::ExecutionGateway;
use server::SocketServer;
use server::bind_socket;
use ws_server::WsServerError;
use ws_server::start_ws_server;

/// Resolves once shutdown is requested or the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub fn start_daemon(config: DaemonConfig) -> Result<(), DaemonError> {
    let _telemetry = telemetry::init_tracing("info");

    let gateway = Arc::new(ExecutionGateway::from_config(&config)?);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("agent-exec")
        .build()
        .map_err(|e| DaemonError::Runtime(e.to_string()))?;

    let socket_path = config.socket_path().clone();
    let lock_path = config.lock_path();
    let _lock = LockFile::acquire(&lock_path)?;

    let result = runtime.block_on(serve(Arc::clone(&gateway), &config));

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    remove_lock_file(&lock_path);
    info!("Daemon shutdown complete");
    result
}

async fn serve(gateway: Arc<ExecutionGateway>, config: &DaemonConfig) -> Result<(), DaemonError> {
    let listener = bind_socket(config.socket_path())?;
    info!(
        socket = %config.socket_path().display(),
        pid = std::process::id(),
        "Daemon started"
    );

    let signalled = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _signal_handler = SignalHandler::setup(Arc::clone(&signalled), shutdown_tx)?;

    let ws = match start_ws_server(Arc::clone(&gateway), config, shutdown_rx.clone()).await {
        Ok(handle) => {
            info!(ws = %format!("ws://{}/ws", handle.local_addr()), "WS server listening");
            Some(handle)
        }
        Err(WsServerError::Disabled) => None,
        Err(err) => {
            warn!(error = %err, "Failed to start WS server; continuing with the socket only");
            None
        }
    };

    SocketServer::new(
        Arc::clone(&gateway),
        config.max_connections(),
        config.max_request_bytes(),
    )
    .serve(listener, shutdown_rx)
    .await;

    info!(signalled = signalled.load(Ordering::SeqCst), "Shutting down daemon...");
    if let Some(ws) = ws {
        ws.join().await;
    }
    gateway.registry().shutdown_all().await;
    Ok(())
}
