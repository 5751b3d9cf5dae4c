//! Per-connection request dispatch.
//!
//! Transports hand each inbound text frame to a [`GatewayConnection`]; every
//! reply and notification leaves through that connection's [`Outbound`]
//! queue, which the transport drains in order.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;

use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;
use tracing::debug;
use tracing::debug_span;
use tracing::info;
use tracing::warn;

use crate::adapters::daemon::BatchRequest;
use crate::adapters::daemon::ExecuteRequest;
use crate::adapters::daemon::GatewayCommand;
use crate::adapters::daemon::GatewayError;
use crate::adapters::daemon::METHODS;
use crate::adapters::daemon::check_allowed;
use crate::adapters::daemon::decode;
use crate::adapters::daemon::error_payload;
use crate::adapters::daemon::error_response;
use crate::adapters::rpc::FrameError;
use crate::adapters::rpc::RpcNotification;
use crate::adapters::rpc::RpcRequest;
use crate::adapters::rpc::RpcResponse;
use crate::adapters::rpc::parse_frame;
use crate::common::DaemonError;
use crate::common::mutex_lock_or_recover;
use crate::common::poison_recovery_count;
use crate::domain::CommandSpec;
use crate::domain::ControlKind;
use crate::domain::HookPhase;
use crate::domain::SessionId;
use crate::domain::TerminationReason;
use crate::infra::daemon::DaemonConfig;
use crate::infra::daemon::Executor;
use crate::infra::daemon::ExecutorConfig;
use crate::infra::daemon::HistorySpec;
use crate::infra::daemon::PreparedRun;
use crate::infra::daemon::RunEvent;
use crate::infra::daemon::RunReport;
use crate::infra::daemon::RunTicket;
use crate::infra::daemon::Session;
use crate::infra::daemon::SessionError;
use crate::infra::daemon::SessionRegistry;
use crate::infra::history::JsonlHistoryStore;
use crate::infra::history::SysinfoLoad;
use crate::infra::history::SystemClock;
use crate::infra::hooks::HookContext;
use crate::infra::hooks::HookPipeline;
use crate::infra::hooks::HookRunner;
use crate::infra::hooks::HookSet;
use crate::infra::process::ProcessSupervisor;
use crate::infra::process::SupervisorConfig;
use crate::usecases::CircuitBreaker;
use crate::usecases::PredictionSource;
use crate::usecases::RetryPolicy;
use crate::usecases::TimeoutEstimator;
use crate::usecases::ports::HistoryStoreHandle;
use crate::usecases::ports::MemoryHistoryStore;
use crate::usecases::ports::NullHistoryStore;

/// Ordered queue of serialized frames bound for one client.
///
/// Unbounded: per-run output is already capped by the output limits, and the
/// WebSocket loop handles requests inline, so a bounded queue could stall it
/// on its own replies.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<String>,
}

impl Outbound {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn respond(&self, response: &RpcResponse) -> bool {
        self.send(response)
    }

    pub fn notify(&self, method: &'static str, params: Value) -> bool {
        self.send(&RpcNotification::new(method, params))
    }

    fn send<T: Serialize>(&self, message: &T) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.tx.send(text).is_ok(),
            Err(err) => {
                warn!(error = %err, "Failed to serialize outbound message");
                false
            }
        }
    }
}

/// What a transport should make of a frame it just handed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Handled,
    /// Not JSON at all; transports may count these and hang up.
    Malformed,
}

pub struct ExecutionGateway {
    registry: Arc<SessionRegistry>,
    executor: Arc<Executor>,
    allowlist: Option<BTreeSet<String>>,
    event_queue: usize,
    started: Instant,
    next_connection: AtomicU64,
}

impl ExecutionGateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        executor: Arc<Executor>,
        allowlist: Option<BTreeSet<String>>,
        event_queue: usize,
    ) -> Self {
        Self {
            registry,
            executor,
            allowlist,
            event_queue: event_queue.max(1),
            started: Instant::now(),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Wires the supervisor, hook pipeline, estimator and registry from
    /// configuration. A malformed hook file is fatal.
    pub fn from_config(config: &DaemonConfig) -> Result<Self, DaemonError> {
        let supervisor = ProcessSupervisor::new(SupervisorConfig {
            grace: config.grace(),
            ..SupervisorConfig::default()
        });

        let hooks = HookSet::load(config.hooks_path(), config.hook_timeout())
            .map_err(|e| DaemonError::HookConfig(e.to_string()))?;
        let breaker = Arc::new(CircuitBreaker::new(config.breaker(), Arc::new(SystemClock)));
        let pipeline = HookPipeline::new(
            hooks,
            breaker,
            HookRunner::new(supervisor.clone(), RetryPolicy::none()),
        );

        let store: HistoryStoreHandle = match config.history() {
            HistorySpec::Off => Arc::new(NullHistoryStore),
            HistorySpec::Memory => Arc::new(MemoryHistoryStore::new(config.history_retention())),
            HistorySpec::File(path) => {
                Arc::new(JsonlHistoryStore::new(path.clone(), config.history_retention()))
            }
        };
        let estimator = TimeoutEstimator::new(store, config.estimator()).with_load(Arc::new(SysinfoLoad));
        info!(history_store = estimator.store_name(), "Timeout estimator ready");

        let executor = Executor::new(
            supervisor,
            Arc::new(estimator),
            pipeline,
            ExecutorConfig {
                output_limits: config.output_limits(),
                stream_queue: config.stream_queue(),
                stall_window: config.stall_window(),
                grace: config.grace(),
                store_timeout: config.store_timeout(),
                ..ExecutorConfig::default()
            },
        );

        Ok(Self::new(
            Arc::new(SessionRegistry::new(config.max_sessions())),
            Arc::new(executor),
            config.allowed_commands().cloned(),
            config.stream_queue(),
        ))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Registers a client and greets it with the `connected` notification.
    pub fn connect(self: &Arc<Self>, outbound: Outbound) -> GatewayConnection {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        outbound.notify(
            "connected",
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "capabilities": METHODS,
            }),
        );
        GatewayConnection {
            id,
            gateway: Arc::clone(self),
            outbound,
            default_session: Mutex::new(None),
        }
    }

    fn health(&self) -> Value {
        let hooks = self.executor.hooks();
        json!({
            "status": "ok",
            "pid": std::process::id(),
            "uptime_ms": self.started.elapsed().as_millis() as u64,
            "version": env!("CARGO_PKG_VERSION"),
            "sessions": self.registry.len(),
            "active_sessions": self.registry.active_count(),
            "max_sessions": self.registry.max_sessions(),
            "hooks": hooks.hooks().counts(),
            "breaker": hooks.status().breaker,
            "history_store": self.executor.estimator().store_name(),
            "lock_recoveries": poison_recovery_count(),
        })
    }

    async fn predict(&self, command: &CommandSpec) -> Value {
        let prediction = self.executor.predict(command).await;
        let mut result = json!({
            "signature": prediction.signature.as_str(),
            "timeout_ms": prediction.timeout.as_millis() as u64,
            "source": prediction.source.as_str(),
        });
        match &prediction.source {
            PredictionSource::History {
                samples,
                load_adjusted,
            } => {
                result["samples"] = json!(samples);
                result["load_adjusted"] = json!(load_adjusted);
            }
            PredictionSource::Fallback { complexity, reason } => {
                result["complexity"] = json!(complexity.as_str());
                result["reason"] = serde_json::to_value(reason).unwrap_or(Value::Null);
            }
            PredictionSource::Requested => {}
        }
        result
    }

    /// Streams one prepared run to completion, then settles the session and
    /// sends `process.completed`.
    async fn run_step(
        &self,
        session: &Session,
        ticket: RunTicket,
        prepared: PreparedRun,
        outbound: &Outbound,
        step: Option<usize>,
    ) -> RunReport {
        let (events_tx, events_rx) = mpsc::channel(self.event_queue);
        let relay = tokio::spawn(relay_events(
            events_rx,
            outbound.clone(),
            session.id().clone(),
            step,
        ));
        let report = self.executor.run(session, ticket, prepared, events_tx).await;
        if let Err(err) = relay.await {
            warn!(error = %err, "Event relay task failed");
        }
        session.finish_run(Some(report.reason), report.failed());
        outbound.notify(
            "process.completed",
            with_step(completed_payload(session.id(), &report), step),
        );
        report
    }
}

pub struct GatewayConnection {
    id: u64,
    gateway: Arc<ExecutionGateway>,
    outbound: Outbound,
    default_session: Mutex<Option<SessionId>>,
}

impl GatewayConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn handle_text(&self, text: &str) -> Inbound {
        let request = match parse_frame(text) {
            Ok(request) => request,
            Err(err) => {
                let malformed = matches!(err, FrameError::Parse(_));
                debug!(conn_id = self.id, malformed, "Rejected inbound frame");
                self.outbound.respond(&err.into_response());
                return if malformed {
                    Inbound::Malformed
                } else {
                    Inbound::Handled
                };
            }
        };

        let span = debug_span!(
            "rpc_request",
            conn_id = self.id,
            request_id = request.id,
            method = %request.method
        );
        self.dispatch(request).instrument(span).await;
        Inbound::Handled
    }

    /// Destroys every session this client created, waiting for their process
    /// groups to be gone.
    pub async fn close(&self) {
        let owned = self.gateway.registry.owned_by(self.id);
        if owned.is_empty() {
            return;
        }
        debug!(conn_id = self.id, sessions = owned.len(), "Releasing client sessions");
        let mut teardown = JoinSet::new();
        for session_id in owned {
            let gateway = Arc::clone(&self.gateway);
            teardown.spawn(async move {
                let _ = gateway.registry.destroy(&session_id).await;
            });
        }
        while teardown.join_next().await.is_some() {}
    }

    async fn dispatch(&self, request: RpcRequest) {
        let start = Instant::now();
        let id = request.id;
        let response = match decode(&request) {
            Ok(command) => self.route(id, command).await,
            Err(err) => Some(error_response(id, &GatewayError::from(err))),
        };
        if let Some(response) = response {
            self.outbound.respond(&response);
        }
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "RPC request handled"
        );
    }

    /// `None` when the reply is sent later by a spawned task.
    async fn route(&self, id: u64, command: GatewayCommand) -> Option<RpcResponse> {
        let result = match command {
            GatewayCommand::Ping => Ok(json!({ "pong": true })),
            GatewayCommand::Health => Ok(self.gateway.health()),
            GatewayCommand::Sessions => Ok(json!({ "sessions": self.gateway.registry.list() })),
            GatewayCommand::Execute(request) => {
                return self.execute(id, request).err().map(|e| error_response(id, &e));
            }
            GatewayCommand::ExecuteBatch(request) => {
                return self.execute_batch(id, request).err().map(|e| error_response(id, &e));
            }
            GatewayCommand::Control { kind, session } => self.control(kind, session),
            GatewayCommand::Ack { session } => self.ack(session),
            GatewayCommand::Predict { command } => Ok(self.gateway.predict(&command).await),
            GatewayCommand::HooksStatus => {
                Ok(serde_json::to_value(self.gateway.executor.hooks().status())
                    .unwrap_or(Value::Null))
            }
            GatewayCommand::HooksReset => {
                self.gateway.executor.hooks().reset();
                return Some(RpcResponse::action_success(id));
            }
            GatewayCommand::HooksRun {
                phase,
                command,
                metadata,
                session,
            } => {
                let session = session.or_else(|| self.default_session());
                self.hooks_run(id, phase, command, metadata, session);
                return None;
            }
        };
        Some(match result {
            Ok(value) => RpcResponse::success(id, value),
            Err(err) => error_response(id, &err),
        })
    }

    fn default_session(&self) -> Option<SessionId> {
        mutex_lock_or_recover(&self.default_session).clone()
    }

    /// An explicit id must name a live session; otherwise the client's default
    /// session is used.
    fn resolve(&self, session: Option<SessionId>) -> Result<Arc<Session>, SessionError> {
        match session.or_else(|| self.default_session()) {
            Some(id) => self.gateway.registry.get(&id),
            None => Err(SessionError::NotFound("default".to_string())),
        }
    }

    /// Like [`Self::resolve`], but allocates the default session on first use
    /// or after it was released.
    fn resolve_or_create(&self, session: Option<SessionId>) -> Result<Arc<Session>, SessionError> {
        if let Some(id) = session {
            return self.gateway.registry.get(&id);
        }
        let mut default = mutex_lock_or_recover(&self.default_session);
        let existing = default
            .as_ref()
            .and_then(|id| self.gateway.registry.get(id).ok());
        if let Some(existing) = existing {
            return Ok(existing);
        }
        let created = self.gateway.registry.create(Some(self.id))?;
        *default = Some(created.id().clone());
        Ok(created)
    }

    fn execute(&self, id: u64, request: ExecuteRequest) -> Result<(), GatewayError> {
        check_allowed(&request.command, self.gateway.allowlist.as_ref())?;
        let session = self.resolve_or_create(request.session)?;
        let ticket = session.begin_run()?;

        let gateway = Arc::clone(&self.gateway);
        let outbound = self.outbound.clone();
        let span = debug_span!("execute", conn_id = self.id, session_id = %session.id());
        tokio::spawn(
            async move {
                let prepared = match gateway
                    .executor
                    .prepare(session.id(), request.command, request.timeout)
                    .await
                {
                    Ok(prepared) => prepared,
                    Err(failure) => {
                        warn!(hook = %failure.hook, "Pre-execute hook rejected the run");
                        session.finish_run(None, true);
                        outbound.respond(&error_response(id, &GatewayError::from(failure)));
                        return;
                    }
                };
                outbound.respond(&RpcResponse::success(id, accepted_payload(&session, &prepared)));
                gateway.run_step(&session, ticket, prepared, &outbound, None).await;
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Replies `accepted` before the first step starts; each step's
    /// notifications carry its index.
    fn execute_batch(&self, id: u64, request: BatchRequest) -> Result<(), GatewayError> {
        for step in &request.steps {
            check_allowed(&step.command, self.gateway.allowlist.as_ref())?;
        }
        let session = self.resolve_or_create(request.session.clone())?;
        let first = session.begin_batch()?;
        self.outbound.respond(&RpcResponse::success(
            id,
            json!({
                "session_id": session.id(),
                "status": "accepted",
                "steps": request.steps.len(),
            }),
        ));

        let gateway = Arc::clone(&self.gateway);
        let outbound = self.outbound.clone();
        let span = debug_span!("execute_batch", conn_id = self.id, session_id = %session.id());
        tokio::spawn(run_batch(gateway, session, first, request, outbound).instrument(span));
        Ok(())
    }

    fn control(&self, kind: ControlKind, session: Option<SessionId>) -> Result<Value, GatewayError> {
        let session = self.resolve(session)?;
        let outcome = session.control(kind)?;
        debug!(session_id = %session.id(), kind = kind.as_str(), outcome = outcome.as_str(), "Control applied");
        Ok(json!({
            "session_id": session.id(),
            "status": outcome.as_str(),
            "state": session.state().as_str(),
        }))
    }

    fn ack(&self, session: Option<SessionId>) -> Result<Value, GatewayError> {
        let target = session
            .or_else(|| self.default_session())
            .ok_or_else(|| SessionError::NotFound("default".to_string()))?;
        self.gateway.registry.acknowledge(&target)?;
        let mut default = mutex_lock_or_recover(&self.default_session);
        if default.as_ref() == Some(&target) {
            *default = None;
        }
        Ok(json!({ "destroyed": true, "session_id": target }))
    }

    fn hooks_run(
        &self,
        id: u64,
        phase: HookPhase,
        command: CommandSpec,
        metadata: Map<String, Value>,
        session: Option<SessionId>,
    ) {
        let gateway = Arc::clone(&self.gateway);
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let mut context = HookContext::new(session, command);
            for (key, value) in metadata {
                context = context.with_meta(&key, value);
            }
            let response = match gateway.executor.hooks().run(phase, context).await {
                Ok(result) => RpcResponse::success(
                    id,
                    json!({
                        "phase": phase.as_str(),
                        "outcome": result.outcome(),
                        "executed": result.executed,
                        "skipped": result.skipped,
                        "failed": result
                            .failed
                            .iter()
                            .map(|failure| failure.context())
                            .collect::<Vec<_>>(),
                        "command": result.command,
                    }),
                ),
                Err(failure) => error_response(id, &GatewayError::from(failure)),
            };
            outbound.respond(&response);
        });
    }
}

async fn run_batch(
    gateway: Arc<ExecutionGateway>,
    session: Arc<Session>,
    first: RunTicket,
    request: BatchRequest,
    outbound: Outbound,
) {
    let total = request.steps.len();
    let mut first = Some(first);
    let mut steps_run = 0;
    let mut cancelled = false;

    for (index, step) in request.steps.into_iter().enumerate() {
        let ticket = match first.take() {
            Some(ticket) => ticket,
            None => match session.next_batch_step() {
                Ok(Some(ticket)) => ticket,
                Ok(None) => {
                    debug!(step = index, "Batch cancelled between steps");
                    cancelled = true;
                    break;
                }
                Err(err) => {
                    reject_step(&outbound, session.id(), index, &GatewayError::from(err));
                    break;
                }
            },
        };

        let prepared = match gateway
            .executor
            .prepare(session.id(), step.command, step.timeout)
            .await
        {
            Ok(prepared) => prepared,
            Err(failure) => {
                session.finish_run(None, true);
                reject_step(&outbound, session.id(), index, &GatewayError::from(failure));
                break;
            }
        };

        let report = gateway
            .run_step(&session, ticket, prepared, &outbound, Some(index))
            .await;
        steps_run += 1;

        if report.reason == TerminationReason::Cancelled {
            debug!(step = index, "Batch cancelled");
            cancelled = true;
            break;
        }
        if request.stop_on_failure && (!report.succeeded() || report.hook_failure.is_some()) {
            debug!(step = index, reason = report.reason.as_str(), "Batch stopped on failure");
            break;
        }
    }

    session.end_batch();
    outbound.notify(
        "batch.completed",
        json!({
            "session_id": session.id(),
            "steps_run": steps_run,
            "aborted": steps_run < total,
            "cancelled": cancelled,
        }),
    );
}

fn reject_step(outbound: &Outbound, session_id: &SessionId, step: usize, err: &GatewayError) {
    outbound.notify(
        "process.rejected",
        json!({
            "session_id": session_id,
            "step": step,
            "error": error_payload(err),
        }),
    );
}

async fn relay_events(
    mut events: mpsc::Receiver<RunEvent>,
    outbound: Outbound,
    session_id: SessionId,
    step: Option<usize>,
) {
    let mut connected = true;
    while let Some(event) = events.recv().await {
        if !connected {
            continue;
        }
        let (method, params) = match event {
            RunEvent::Started { pid, pgid } => (
                "process.started",
                json!({ "session_id": session_id, "pid": pid, "pgid": pgid }),
            ),
            RunEvent::Output(chunk) => (
                "process.output",
                json!({
                    "session_id": session_id,
                    "type": chunk.stream.as_str(),
                    "data": chunk.data,
                    "truncated": chunk.truncated,
                }),
            ),
            RunEvent::Paused => ("process.paused", json!({ "session_id": session_id })),
            RunEvent::Resumed => ("process.resumed", json!({ "session_id": session_id })),
        };
        if !outbound.notify(method, with_step(params, step)) {
            debug!(session_id = %session_id, "Client gone; discarding run events");
            connected = false;
        }
    }
}

fn with_step(mut params: Value, step: Option<usize>) -> Value {
    if let Some(step) = step {
        params["step"] = json!(step);
    }
    params
}

fn accepted_payload(session: &Session, prepared: &PreparedRun) -> Value {
    json!({
        "session_id": session.id(),
        "status": "accepted",
        "signature": prepared.prediction.signature.as_str(),
        "timeout_ms": prepared.prediction.timeout.as_millis() as u64,
        "timeout_source": prepared.prediction.source.as_str(),
    })
}

fn completed_payload(session_id: &SessionId, report: &RunReport) -> Value {
    let mut payload = json!({
        "session_id": session_id,
        "exit_code": report.exit_code,
        "termination_reason": report.reason.as_str(),
        "duration": report.duration.as_secs_f64(),
        "duration_ms": report.duration.as_millis() as u64,
        "output": report.output,
    });
    if let Some(error) = &report.error {
        payload["error"] = json!(error);
    }
    if let Some(failure) = &report.hook_failure {
        payload["hook_failure"] = error_payload(&GatewayError::from(failure.clone()));
    }
    payload
}
