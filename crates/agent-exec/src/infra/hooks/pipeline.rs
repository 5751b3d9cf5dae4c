//! Phase-ordered hook execution behind the shared circuit breaker.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::warn;

use super::config::HookSet;
use super::runner::HookContext;
use super::runner::HookFailure;
use super::runner::HookFailureKind;
use super::runner::HookResponse;
use super::runner::HookRunner;
use crate::domain::CommandSpec;
use crate::domain::HookDescriptor;
use crate::domain::HookPhase;
use crate::usecases::CircuitBreaker;

/// Result of a phase that was not aborted by a blocking failure.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    pub phase: HookPhase,
    /// The command after pre-phase rewrites (unchanged for post-phases).
    pub command: CommandSpec,
    pub executed: usize,
    /// Hooks skipped because the breaker was open.
    pub skipped: usize,
    /// Non-blocking failures that were logged and ignored.
    pub failed: Vec<HookFailure>,
}

impl PipelineResult {
    fn new(phase: HookPhase, command: CommandSpec) -> Self {
        Self {
            phase,
            command,
            executed: 0,
            skipped: 0,
            failed: Vec::new(),
        }
    }

    pub fn outcome(&self) -> &'static str {
        if !self.failed.is_empty() {
            "degraded"
        } else if self.skipped > 0 {
            "skipped"
        } else if self.executed == 0 {
            "empty"
        } else {
            "passed"
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_ms_ago: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HookStatus {
    pub phases: BTreeMap<&'static str, usize>,
    pub breaker: BreakerStatus,
}

/// Runs configured hooks for a phase.
///
/// Pre-phases run sequentially in declaration order; each hook sees the
/// command as rewritten by the hooks before it. Post-phases run
/// concurrently. While the breaker rejects calls every hook is skipped and
/// counted as success.
#[derive(Clone)]
pub struct HookPipeline {
    hooks: Arc<HookSet>,
    breaker: Arc<CircuitBreaker>,
    runner: Arc<HookRunner>,
}

impl HookPipeline {
    pub fn new(hooks: HookSet, breaker: Arc<CircuitBreaker>, runner: HookRunner) -> Self {
        Self {
            hooks: Arc::new(hooks),
            breaker,
            runner: Arc::new(runner),
        }
    }

    pub fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn status(&self) -> HookStatus {
        let snapshot = self.breaker.snapshot();
        HookStatus {
            phases: self.hooks.counts(),
            breaker: BreakerStatus {
                state: snapshot.state.as_str(),
                consecutive_failures: snapshot.consecutive_failures,
                open: snapshot.is_open(),
                opened_ms_ago: self.breaker.opened_ms_ago(),
            },
        }
    }

    pub fn reset(&self) {
        self.breaker.reset();
    }

    #[tracing::instrument(
        skip(self, context),
        fields(session_id = ?context.session_id.as_ref().map(|id| id.as_str()))
    )]
    pub async fn run(
        &self,
        phase: HookPhase,
        context: HookContext,
    ) -> Result<PipelineResult, HookFailure> {
        let hooks = self.hooks.for_phase(phase);
        if hooks.is_empty() {
            return Ok(PipelineResult::new(phase, context.command));
        }
        if phase.is_pre() {
            self.run_sequential(phase, hooks, context).await
        } else {
            self.run_concurrent(phase, hooks, context).await
        }
    }

    async fn run_sequential(
        &self,
        phase: HookPhase,
        hooks: &[HookDescriptor],
        mut context: HookContext,
    ) -> Result<PipelineResult, HookFailure> {
        let mut result = PipelineResult::new(phase, context.command.clone());
        for hook in hooks {
            let Some(permit) = self.breaker.admit() else {
                debug!(hook = %hook.command.display(), "Circuit open; skipping hook");
                result.skipped += 1;
                continue;
            };
            result.executed += 1;
            let outcome = match self.runner.run(hook, &context).await {
                Ok(response) => apply_response(hook, &mut context.command, response),
                Err(failure) => Err(failure),
            };
            match outcome {
                Ok(()) => permit.succeeded(),
                Err(failure) => {
                    permit.failed();
                    if failure.blocking {
                        warn!(error = %failure, "Blocking hook failed");
                        return Err(failure);
                    }
                    warn!(error = %failure, "Non-blocking hook failed; continuing");
                    result.failed.push(failure);
                }
            }
        }
        result.command = context.command;
        Ok(result)
    }

    async fn run_concurrent(
        &self,
        phase: HookPhase,
        hooks: &[HookDescriptor],
        context: HookContext,
    ) -> Result<PipelineResult, HookFailure> {
        let mut result = PipelineResult::new(phase, context.command.clone());
        let context = Arc::new(context);
        let mut running = JoinSet::new();
        for hook in hooks {
            let Some(permit) = self.breaker.admit() else {
                debug!(hook = %hook.command.display(), "Circuit open; skipping hook");
                result.skipped += 1;
                continue;
            };
            result.executed += 1;
            let runner = Arc::clone(&self.runner);
            let context = Arc::clone(&context);
            let hook = hook.clone();
            running.spawn(async move {
                let outcome = runner.run(&hook, &context).await.map(|_| ());
                (permit, outcome)
            });
        }

        let mut blocking_failure = None;
        while let Some(joined) = running.join_next().await {
            // A panicked task drops its permit, which frees a half-open probe.
            let (permit, outcome) = match joined {
                Ok(joined) => joined,
                Err(err) => {
                    warn!(error = %err, "Hook task panicked");
                    continue;
                }
            };
            match outcome {
                Ok(()) => permit.succeeded(),
                Err(failure) => {
                    permit.failed();
                    if failure.blocking {
                        warn!(error = %failure, "Blocking hook failed");
                        blocking_failure.get_or_insert(failure);
                    } else {
                        warn!(error = %failure, "Non-blocking hook failed; continuing");
                        result.failed.push(failure);
                    }
                }
            }
        }
        match blocking_failure {
            Some(failure) => Err(failure),
            None => Ok(result),
        }
    }
}

fn apply_response(
    hook: &HookDescriptor,
    command: &mut CommandSpec,
    response: HookResponse,
) -> Result<(), HookFailure> {
    let mut next = response.command.unwrap_or_else(|| command.clone());
    if let Some(environment) = response.environment {
        next.environment.extend(environment);
    }
    if let Err(err) = next.validate() {
        return Err(HookFailure {
            phase: hook.phase,
            hook: hook.command.display(),
            blocking: hook.blocking,
            kind: HookFailureKind::Aborted {
                reason: format!("rewrote the command into an invalid one: {err}"),
            },
        });
    }
    if next != *command {
        debug!(from = %command.display(), to = %next.display(), "Hook rewrote command");
    }
    *command = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CircuitState;
    use crate::domain::SessionId;
    use crate::infra::history::SystemClock;
    use crate::infra::process::ProcessSupervisor;
    use crate::usecases::BreakerConfig;
    use crate::usecases::RetryPolicy;
    use std::time::Duration;
    use std::time::Instant;
    use tempfile::TempDir;

    fn sh_hook(phase: HookPhase, script: &str, blocking: bool) -> HookDescriptor {
        HookDescriptor {
            phase,
            command: CommandSpec::new("sh").arg("-c").arg(script),
            timeout: Duration::from_secs(5),
            blocking,
        }
    }

    fn pipeline(hooks: HookSet, threshold: u32) -> HookPipeline {
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(60),
            },
            Arc::new(SystemClock),
        ));
        HookPipeline::new(
            hooks,
            breaker,
            HookRunner::new(ProcessSupervisor::default(), RetryPolicy::none()),
        )
    }

    fn context() -> HookContext {
        HookContext::new(Some(SessionId::new("s-1")), CommandSpec::new("echo").arg("hi"))
    }

    #[tokio::test]
    async fn test_no_hooks_passes_command_through() {
        let result = pipeline(HookSet::empty(), 5)
            .run(HookPhase::PreExecute, context())
            .await
            .unwrap();
        assert_eq!(result.command, context().command);
        assert_eq!(result.outcome(), "empty");
    }

    #[tokio::test]
    async fn test_pre_hooks_rewrite_in_order() {
        let hooks = HookSet::empty()
            .with_hook(sh_hook(
                HookPhase::PreExecute,
                r#"echo '{"command": {"executable": "printf", "arguments": ["one"]}}'"#,
                true,
            ))
            .with_hook(sh_hook(
                HookPhase::PreExecute,
                r#"case "$AGENT_EXEC_COMMAND" in *printf*) echo '{"environment": {"SEEN": "yes"}}' ;; *) exit 3 ;; esac"#,
                true,
            ));
        let result = pipeline(hooks, 5)
            .run(HookPhase::PreExecute, context())
            .await
            .unwrap();
        assert_eq!(result.command.executable, "printf");
        assert_eq!(
            result.command.environment.get("SEEN").map(String::as_str),
            Some("yes")
        );
        assert_eq!(result.outcome(), "passed");
    }

    #[tokio::test]
    async fn test_blocking_failure_aborts_and_stops_later_hooks() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let hooks = HookSet::empty()
            .with_hook(sh_hook(HookPhase::PreExecute, "exit 1", true))
            .with_hook(sh_hook(
                HookPhase::PreExecute,
                &format!("touch {}", marker.display()),
                true,
            ));
        let err = pipeline(hooks, 5)
            .run(HookPhase::PreExecute, context())
            .await
            .unwrap_err();
        assert!(err.blocking);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_non_blocking_failure_is_recorded_and_ignored() {
        let hooks = HookSet::empty()
            .with_hook(sh_hook(HookPhase::PreExecute, "exit 1", false))
            .with_hook(sh_hook(HookPhase::PreExecute, "exit 0", true));
        let result = pipeline(hooks, 5)
            .run(HookPhase::PreExecute, context())
            .await
            .unwrap();
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.executed, 2);
        assert_eq!(result.outcome(), "degraded");
    }

    #[tokio::test]
    async fn test_breaker_opens_and_skips_as_success() {
        let hooks = HookSet::empty().with_hook(sh_hook(HookPhase::PreExecute, "exit 1", true));
        let pipeline = pipeline(hooks, 2);
        for _ in 0..2 {
            assert!(pipeline.run(HookPhase::PreExecute, context()).await.is_err());
        }
        assert_eq!(pipeline.breaker().state(), CircuitState::Open);

        let result = pipeline
            .run(HookPhase::PreExecute, context())
            .await
            .unwrap();
        assert_eq!(result.skipped, 1);
        assert_eq!(result.executed, 0);
        assert_eq!(result.outcome(), "skipped");

        pipeline.reset();
        assert_eq!(pipeline.status().breaker.state, "closed");
    }

    #[tokio::test]
    async fn test_post_hooks_run_concurrently() {
        let hooks = HookSet::empty()
            .with_hook(sh_hook(HookPhase::PostExecute, "sleep 0.5", false))
            .with_hook(sh_hook(HookPhase::PostExecute, "sleep 0.5", false))
            .with_hook(sh_hook(HookPhase::PostExecute, "sleep 0.5", false));
        let started = Instant::now();
        let result = pipeline(hooks, 5)
            .run(HookPhase::PostExecute, context())
            .await
            .unwrap();
        assert_eq!(result.executed, 3);
        assert!(started.elapsed() < Duration::from_millis(1400));
    }

    #[tokio::test]
    async fn test_post_blocking_failure_is_reported_after_all_finish() {
        let hooks = HookSet::empty()
            .with_hook(sh_hook(HookPhase::PostOutput, "exit 4", true))
            .with_hook(sh_hook(HookPhase::PostOutput, "exit 0", false));
        let err = pipeline(hooks, 5)
            .run(HookPhase::PostOutput, context())
            .await
            .unwrap_err();
        assert_eq!(err.phase, HookPhase::PostOutput);
    }

    #[test]
    fn test_status_lists_every_phase() {
        let status = pipeline(HookSet::empty(), 5).status();
        assert_eq!(status.phases.len(), HookPhase::ALL.len());
        assert!(!status.breaker.open);
    }
}
