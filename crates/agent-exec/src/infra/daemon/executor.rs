//! Drives one run: pre-hooks, prediction, spawn, supervision, post-hooks,
//! history.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::CommandSpec;
use crate::domain::ControlKind;
use crate::domain::HookPhase;
use crate::domain::OutputChunk;
use crate::domain::OutputLimits;
use crate::domain::OutputSummary;
use crate::domain::SessionId;
use crate::domain::SignalKind;
use crate::domain::TerminationReason;
use crate::infra::daemon::session::RunTicket;
use crate::infra::daemon::session::Session;
use crate::infra::hooks::HookContext;
use crate::infra::hooks::HookFailure;
use crate::infra::hooks::HookPipeline;
use crate::infra::output::OutputStream;
use crate::infra::process::ProcessSupervisor;
use crate::infra::process::SpawnedProcess;
use crate::infra::process::StdinMode;
use crate::usecases::FallbackReason;
use crate::usecases::Prediction;
use crate::usecases::TimeoutEstimator;

const MAX_STALL_TICK: Duration = Duration::from_secs(1);
const MIN_STALL_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub output_limits: OutputLimits,
    pub stream_queue: usize,
    pub stall_window: Duration,
    pub grace: Duration,
    pub store_timeout: Duration,
    /// How long to wait for pipes to hit EOF after the group is gone.
    pub drain_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            output_limits: OutputLimits::default(),
            stream_queue: 1024,
            stall_window: Duration::from_secs(600),
            grace: Duration::from_secs(2),
            store_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Progress of a run, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Started { pid: u32, pgid: i32 },
    Output(OutputChunk),
    Paused,
    Resumed,
}

/// A run that passed its pre-phase hooks.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub command: CommandSpec,
    pub prediction: Prediction,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub reason: TerminationReason,
    pub duration: Duration,
    pub output: OutputSummary,
    pub error: Option<String>,
    /// Blocking post-phase failure; the process result itself stands.
    pub hook_failure: Option<HookFailure>,
}

impl RunReport {
    fn without_process(reason: TerminationReason, error: Option<String>, started: Instant) -> Self {
        Self {
            pid: None,
            exit_code: None,
            reason,
            duration: started.elapsed(),
            output: OutputSummary::default(),
            error,
            hook_failure: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.reason == TerminationReason::Normal && self.exit_code == Some(0)
    }

    /// Session ends `failed` rather than `completed`.
    pub fn failed(&self) -> bool {
        self.reason == TerminationReason::Error || self.hook_failure.is_some()
    }
}

pub struct Executor {
    supervisor: ProcessSupervisor,
    estimator: Arc<TimeoutEstimator>,
    hooks: HookPipeline,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        supervisor: ProcessSupervisor,
        estimator: Arc<TimeoutEstimator>,
        hooks: HookPipeline,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            supervisor,
            estimator,
            hooks,
            config,
        }
    }

    pub fn hooks(&self) -> &HookPipeline {
        &self.hooks
    }

    pub fn estimator(&self) -> &TimeoutEstimator {
        &self.estimator
    }

    /// Prediction off the runtime threads, bounded by the store timeout.
    pub async fn predict(&self, spec: &CommandSpec) -> Prediction {
        let estimator = Arc::clone(&self.estimator);
        let owned = spec.clone();
        let task = tokio::task::spawn_blocking(move || estimator.predict(&owned));
        match tokio::time::timeout(self.config.store_timeout, task).await {
            Ok(Ok(prediction)) => {
                if let Some(reason) = prediction.store_degraded() {
                    warn!(?reason, "History store unavailable; using fallback timeout");
                }
                prediction
            }
            Ok(Err(err)) => self.estimator.fallback(
                spec,
                FallbackReason::StoreUnavailable {
                    error: err.to_string(),
                },
            ),
            Err(_) => {
                warn!(
                    timeout_ms = self.config.store_timeout.as_millis() as u64,
                    "History store too slow; using fallback timeout"
                );
                self.estimator.fallback(spec, FallbackReason::StoreTimeout)
            }
        }
    }

    /// Runs pre-execute hooks, then settles the deadline for the (possibly
    /// rewritten) command.
    pub async fn prepare(
        &self,
        session_id: &SessionId,
        spec: CommandSpec,
        requested_timeout: Option<Duration>,
    ) -> Result<PreparedRun, HookFailure> {
        let mut context = HookContext::new(Some(session_id.clone()), spec);
        if let Some(timeout) = requested_timeout {
            context = context.with_meta("requested_timeout_ms", timeout.as_millis() as u64);
        }
        let passed = self.hooks.run(HookPhase::PreExecute, context).await?;
        let command = passed.command;

        let prediction = match requested_timeout {
            Some(timeout) => self.estimator.requested(&command, timeout),
            None => self.predict(&command).await,
        };
        debug!(
            session_id = %session_id,
            signature = %prediction.signature,
            timeout_ms = prediction.timeout.as_millis() as u64,
            source = prediction.source.as_str(),
            "Run prepared"
        );
        Ok(PreparedRun {
            command,
            prediction,
        })
    }

    #[tracing::instrument(skip_all, fields(session_id = %session.id()))]
    pub async fn run(
        &self,
        session: &Session,
        mut ticket: RunTicket,
        prepared: PreparedRun,
        events: mpsc::Sender<RunEvent>,
    ) -> RunReport {
        let started = Instant::now();

        if cancel_pending(&mut ticket) {
            debug!("Cancelled before spawn");
            return RunReport::without_process(TerminationReason::Cancelled, None, started);
        }

        let mut process = match self.supervisor.spawn(&prepared.command, StdinMode::Null) {
            Ok(process) => process,
            Err(err) => {
                warn!(error = %err, command = %prepared.command.display(), "Spawn failed");
                let report =
                    RunReport::without_process(TerminationReason::Error, Some(err.to_string()), started);
                return self.finish(session, &prepared, report).await;
            }
        };
        let pid = process.pid();
        let pgid = process.pgid();
        session.attach_process(pid);
        info!(pid, pgid, command = %prepared.command.display(), "Process started");
        if events.try_send(RunEvent::Started { pid, pgid }).is_err() {
            debug!("Run event queue unavailable; start notification dropped");
        }

        let (stream, chunks) = OutputStream::attach(
            process.take_stdout(),
            process.take_stderr(),
            self.config.output_limits,
            self.config.stream_queue,
        );
        let forwarder = tokio::spawn(forward(chunks, events.clone()));

        let (exit_code, reason, error) = self
            .supervise(&mut process, &mut ticket, &stream, prepared.prediction.timeout, &events)
            .await;

        if let Err(err) = self.supervisor.ensure_group_dead(pgid).await {
            error!(pgid, error = %err, "Process group survived termination");
        }
        let output = stream.finish(self.config.drain_timeout).await;
        if forwarder.await.is_err() {
            debug!("Output forwarder ended abnormally");
        }

        let report = RunReport {
            pid: Some(pid),
            exit_code,
            reason,
            duration: started.elapsed(),
            output,
            error,
            hook_failure: None,
        };
        info!(
            pid,
            exit_code = ?report.exit_code,
            reason = %report.reason,
            elapsed_ms = report.duration.as_millis() as u64,
            "Process finished"
        );
        self.finish(session, &prepared, report).await
    }

    async fn supervise(
        &self,
        process: &mut SpawnedProcess,
        ticket: &mut RunTicket,
        stream: &OutputStream,
        timeout: Duration,
        events: &mpsc::Sender<RunEvent>,
    ) -> (Option<i32>, TerminationReason, Option<String>) {
        let activity = stream.activity();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let tick = (self.config.stall_window / 4).clamp(MIN_STALL_TICK, MAX_STALL_TICK);
        let mut stall_check = tokio::time::interval(tick);
        let mut paused = false;
        let mut control_open = true;

        let stop = loop {
            tokio::select! {
                status = self.supervisor.wait(process) => {
                    return match status {
                        Ok(code) => (Some(code), TerminationReason::Normal, None),
                        Err(err) => (None, TerminationReason::Error, Some(err.to_string())),
                    };
                }
                _ = &mut deadline => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "Deadline exceeded");
                    break TerminationReason::Timeout;
                }
                _ = stall_check.tick(), if !paused => {
                    if activity.idle_for() >= self.config.stall_window {
                        warn!(
                            idle_ms = activity.idle_for().as_millis() as u64,
                            "No output within stall window"
                        );
                        break TerminationReason::Stalled;
                    }
                }
                control = ticket.control.recv(), if control_open => match control {
                    Some(ControlKind::Cancel) => break TerminationReason::Cancelled,
                    Some(ControlKind::Pause) => {
                        if let Err(err) = self.supervisor.signal(process.record(), SignalKind::Stop) {
                            warn!(error = %err, "Failed to pause process group");
                        } else {
                            paused = true;
                            let _ = events.try_send(RunEvent::Paused);
                        }
                    }
                    Some(ControlKind::Resume) => {
                        if let Err(err) = self.supervisor.signal(process.record(), SignalKind::Continue) {
                            warn!(error = %err, "Failed to resume process group");
                        } else {
                            paused = false;
                            activity.touch();
                            let _ = events.try_send(RunEvent::Resumed);
                        }
                    }
                    None => control_open = false,
                },
            }
        };

        match self.supervisor.terminate(process, self.config.grace).await {
            Ok(code) => (Some(code), stop, None),
            Err(err) => {
                error!(error = %err, reason = %stop, "Termination failed");
                (None, stop, Some(err.to_string()))
            }
        }
    }

    /// Post-phase hooks and the history sample. History writes are detached
    /// so a slow store never delays the report.
    async fn finish(&self, session: &Session, prepared: &PreparedRun, mut report: RunReport) -> RunReport {
        let context = HookContext::new(Some(session.id().clone()), prepared.command.clone())
            .with_meta("exit_code", json!(report.exit_code))
            .with_meta("termination_reason", report.reason.as_str())
            .with_meta("duration_ms", report.duration.as_millis() as u64)
            .with_meta("output", json!(report.output));

        for phase in [HookPhase::PostOutput, HookPhase::PostExecute] {
            if let Err(failure) = self.hooks.run(phase, context.clone()).await {
                report.hook_failure.get_or_insert(failure);
            }
        }

        let success = match report.reason {
            TerminationReason::Normal => Some(report.exit_code == Some(0)),
            TerminationReason::Timeout | TerminationReason::Stalled => Some(false),
            TerminationReason::Cancelled | TerminationReason::Error => None,
        };
        if let Some(success) = success {
            let estimator = Arc::clone(&self.estimator);
            let signature = prepared.prediction.signature.clone();
            let observed = report.duration;
            tokio::task::spawn_blocking(move || {
                if let Err(err) = estimator.record(signature, observed, success) {
                    debug!(error = %err, "History sample not recorded");
                }
            });
        }
        report
    }
}

fn cancel_pending(ticket: &mut RunTicket) -> bool {
    loop {
        match ticket.control.try_recv() {
            Ok(ControlKind::Cancel) => return true,
            Ok(_) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return false,
        }
    }
}

async fn forward(mut chunks: mpsc::Receiver<OutputChunk>, events: mpsc::Sender<RunEvent>) {
    while let Some(chunk) = chunks.recv().await {
        if events.send(RunEvent::Output(chunk)).await.is_err() {
            // Listener gone; keep draining so readers never see a closed queue.
            while chunks.recv().await.is_some() {}
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HookDescriptor;
    use crate::domain::SessionState;
    use crate::infra::daemon::session::SessionRegistry;
    use crate::infra::history::SystemClock;
    use crate::infra::hooks::HookRunner;
    use crate::infra::hooks::HookSet;
    use crate::infra::process::group_alive;
    use crate::usecases::BreakerConfig;
    use crate::usecases::CircuitBreaker;
    use crate::usecases::EstimatorConfig;
    use crate::usecases::RetryPolicy;
    use crate::usecases::ports::HistoryStore;
    use crate::usecases::ports::MemoryHistoryStore;

    fn executor_with(hooks: HookSet, config: ExecutorConfig, store: Arc<MemoryHistoryStore>) -> Executor {
        let supervisor = ProcessSupervisor::default();
        let pipeline = HookPipeline::new(
            hooks,
            Arc::new(CircuitBreaker::new(BreakerConfig::default(), Arc::new(SystemClock))),
            HookRunner::new(supervisor.clone(), RetryPolicy::none()),
        );
        let estimator = Arc::new(
            TimeoutEstimator::new(store, EstimatorConfig::default()).with_retry(RetryPolicy::none()),
        );
        Executor::new(supervisor, estimator, pipeline, config)
    }

    fn executor() -> Executor {
        executor_with(
            HookSet::empty(),
            ExecutorConfig::default(),
            Arc::new(MemoryHistoryStore::default()),
        )
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    async fn run_to_end(
        executor: &Executor,
        spec: CommandSpec,
        timeout: Option<Duration>,
    ) -> (RunReport, Vec<RunEvent>, Arc<Session>) {
        let registry = SessionRegistry::new(4);
        let session = registry.create(None).unwrap();
        let ticket = session.begin_run().unwrap();
        let prepared = executor.prepare(session.id(), spec, timeout).await.unwrap();
        let (tx, mut rx) = mpsc::channel(1024);
        let report = executor.run(&session, ticket, prepared, tx).await;
        session.finish_run(Some(report.reason), report.failed());
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (report, events, session)
    }

    fn output_lines(events: &[RunEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                RunEvent::Output(chunk) => Some(chunk.data.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_echo_runs_to_normal_completion() {
        let executor = executor();
        let (report, events, session) =
            run_to_end(&executor, CommandSpec::new("echo").arg("hello"), None).await;
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.reason, TerminationReason::Normal);
        assert!(matches!(events[0], RunEvent::Started { .. }));
        assert_eq!(output_lines(&events), vec!["hello"]);
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_deadline_terminates_with_timeout() {
        let executor = executor();
        let started = Instant::now();
        let (report, events, _) =
            run_to_end(&executor, sh("sleep 5"), Some(Duration::from_secs(1))).await;
        assert_eq!(report.reason, TerminationReason::Timeout);
        assert!(started.elapsed() < Duration::from_secs(4));
        let Some(RunEvent::Started { pgid, .. }) = events.first() else {
            panic!("missing start event");
        };
        assert!(!group_alive(*pgid));
    }

    #[tokio::test]
    async fn test_silence_terminates_with_stalled() {
        let config = ExecutorConfig {
            stall_window: Duration::from_millis(300),
            ..ExecutorConfig::default()
        };
        let executor = executor_with(HookSet::empty(), config, Arc::new(MemoryHistoryStore::default()));
        let (report, _, _) = run_to_end(&executor, sh("echo hi; sleep 10"), Some(Duration::from_secs(30))).await;
        assert_eq!(report.reason, TerminationReason::Stalled);
    }

    #[tokio::test]
    async fn test_cancel_terminates_within_grace() {
        let executor = executor();
        let registry = SessionRegistry::new(4);
        let session = registry.create(None).unwrap();
        let ticket = session.begin_run().unwrap();
        let prepared = executor.prepare(session.id(), sh("sleep 10"), None).await.unwrap();
        let (tx, _rx) = mpsc::channel(64);

        let canceller = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                session.control(ControlKind::Cancel).unwrap()
            })
        };
        let started = Instant::now();
        let report = executor.run(&session, ticket, prepared, tx).await;
        assert_eq!(report.reason, TerminationReason::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(100) + executor.config.grace + Duration::from_secs(1));
        assert_eq!(canceller.await.unwrap().as_str(), "cancelling");
    }

    #[tokio::test]
    async fn test_cancel_before_spawn_never_starts_process() {
        let executor = executor();
        let registry = SessionRegistry::new(4);
        let session = registry.create(None).unwrap();
        let ticket = session.begin_run().unwrap();
        let prepared = executor.prepare(session.id(), sh("sleep 10"), None).await.unwrap();
        session.control(ControlKind::Cancel).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let report = executor.run(&session, ticket, prepared, tx).await;
        assert_eq!(report.reason, TerminationReason::Cancelled);
        assert_eq!(report.pid, None);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_executable_is_error_reason() {
        let executor = executor();
        let (report, events, session) = run_to_end(
            &executor,
            CommandSpec::new("definitely-not-a-real-binary-4821"),
            Some(Duration::from_secs(5)),
        )
        .await;
        assert_eq!(report.reason, TerminationReason::Error);
        assert!(report.error.is_some());
        assert!(events.is_empty());
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_signal_death_reports_negative_code() {
        let executor = executor();
        let (report, _, _) = run_to_end(&executor, sh("kill -9 $$"), None).await;
        assert_eq!(report.exit_code, Some(-9));
        assert_eq!(report.reason, TerminationReason::Normal);
    }

    #[tokio::test]
    async fn test_pause_and_resume_signal_the_group() {
        let executor = executor();
        let registry = SessionRegistry::new(4);
        let session = registry.create(None).unwrap();
        let ticket = session.begin_run().unwrap();
        let prepared = executor
            .prepare(session.id(), sh("sleep 0.3; echo done"), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(64);

        let driver = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                session.control(ControlKind::Pause).unwrap();
                tokio::time::sleep(Duration::from_millis(500)).await;
                session.control(ControlKind::Resume).unwrap();
            })
        };
        let started = Instant::now();
        let report = executor.run(&session, ticket, prepared, tx).await;
        driver.await.unwrap();
        assert_eq!(report.exit_code, Some(0));
        assert!(started.elapsed() >= Duration::from_millis(600));

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(events.contains(&RunEvent::Paused));
        assert!(events.contains(&RunEvent::Resumed));
    }

    #[tokio::test]
    async fn test_blocking_pre_hook_prevents_run() {
        let hooks = HookSet::empty().with_hook(HookDescriptor {
            phase: HookPhase::PreExecute,
            command: sh("exit 1"),
            timeout: Duration::from_secs(5),
            blocking: true,
        });
        let executor = executor_with(hooks, ExecutorConfig::default(), Arc::new(MemoryHistoryStore::default()));
        let err = executor
            .prepare(&SessionId::new("s"), CommandSpec::new("echo").arg("x"), None)
            .await
            .unwrap_err();
        assert!(err.blocking);
        assert_eq!(err.phase, HookPhase::PreExecute);
    }

    #[tokio::test]
    async fn test_blocking_post_hook_marks_report() {
        let hooks = HookSet::empty().with_hook(HookDescriptor {
            phase: HookPhase::PostExecute,
            command: sh("exit 2"),
            timeout: Duration::from_secs(5),
            blocking: true,
        });
        let executor = executor_with(hooks, ExecutorConfig::default(), Arc::new(MemoryHistoryStore::default()));
        let (report, _, session) = run_to_end(&executor, CommandSpec::new("true"), None).await;
        assert_eq!(report.exit_code, Some(0));
        assert!(report.hook_failure.is_some());
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_successful_run_is_recorded() {
        let store = Arc::new(MemoryHistoryStore::default());
        let executor = executor_with(HookSet::empty(), ExecutorConfig::default(), Arc::clone(&store));
        let spec = CommandSpec::new("echo").arg("hello");
        let signature = executor.estimator().signature(&spec);
        run_to_end(&executor, spec, None).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.get(&signature).unwrap().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let samples = store.get(&signature).unwrap();
        assert_eq!(samples.len(), 1);
        assert!(samples[0].success);
    }
}
