//! Sessions and the registry that owns them.
//!
//! A session runs at most one command at a time. While a run is active the
//! session holds the sending half of the run's control channel; the run's
//! executor owns the receiving half (the `RunTicket`) and the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;

use crate::common::error_codes::{self, ErrorCategory};
use crate::common::mutex_lock_or_recover;
use crate::common::rwlock_read_or_recover;
use crate::common::rwlock_write_or_recover;
use crate::domain::ControlKind;
use crate::domain::SessionId;
use crate::domain::SessionInfo;
use crate::domain::SessionState;
use crate::domain::TerminationReason;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session limit reached: maximum {max} sessions allowed")]
    LimitReached { max: usize },
    #[error("Session {0} is running a command")]
    Busy(String),
    #[error("Session {0} has no running process")]
    ProcessNotFound(String),
    #[error("Session {0} is closing")]
    Closing(String),
}

impl SessionError {
    pub fn code(&self) -> i32 {
        match self {
            SessionError::NotFound(_) | SessionError::Closing(_) => error_codes::SESSION_NOT_FOUND,
            SessionError::LimitReached { .. } => error_codes::SESSION_LIMIT,
            SessionError::Busy(_) => error_codes::SESSION_BUSY,
            SessionError::ProcessNotFound(_) => error_codes::PROCESS_NOT_FOUND,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        error_codes::category_for_code(self.code())
    }

    pub fn is_retryable(&self) -> bool {
        error_codes::is_retryable(self.code())
    }

    pub fn context(&self) -> Value {
        match self {
            SessionError::NotFound(id)
            | SessionError::Busy(id)
            | SessionError::ProcessNotFound(id)
            | SessionError::Closing(id) => json!({ "session_id": id }),
            SessionError::LimitReached { max } => json!({ "max_sessions": max }),
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            SessionError::NotFound(_) | SessionError::Closing(_) => {
                "Run 'sessions' to list live sessions, or omit 'session' to use a new one."
                    .to_string()
            }
            SessionError::LimitReached { max } => format!(
                "All {max} session slots are in use. Acknowledge finished sessions or raise AGENT_EXEC_MAX_SESSIONS."
            ),
            SessionError::Busy(_) => {
                "Wait for process.completed, or send control CANCEL first.".to_string()
            }
            SessionError::ProcessNotFound(_) => {
                "The session has no live process; PAUSE/RESUME only apply while a command runs."
                    .to_string()
            }
        }
    }
}

/// What a control request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Cancelling,
    Paused,
    Resumed,
    NoOp,
}

impl ControlOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlOutcome::Cancelling => "cancelling",
            ControlOutcome::Paused => "paused",
            ControlOutcome::Resumed => "resumed",
            ControlOutcome::NoOp => "noop",
        }
    }
}

/// Receiving side of a run's control channel, held by whoever drives the run.
#[derive(Debug)]
pub struct RunTicket {
    pub control: mpsc::UnboundedReceiver<ControlKind>,
}

#[derive(Debug)]
struct SessionSlot {
    state: SessionState,
    runs: u64,
    pid: Option<u32>,
    last_reason: Option<TerminationReason>,
    control: Option<mpsc::UnboundedSender<ControlKind>>,
    closing: bool,
    batch: Option<BatchMark>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchMark {
    Running,
    Cancelled,
}

pub struct Session {
    id: SessionId,
    owner: Option<u64>,
    created_at: DateTime<Utc>,
    slot: Mutex<SessionSlot>,
    state_tx: watch::Sender<SessionState>,
}

impl Session {
    fn new(id: SessionId, owner: Option<u64>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            id,
            owner,
            created_at: Utc::now(),
            slot: Mutex::new(SessionSlot {
                state: SessionState::Idle,
                runs: 0,
                pid: None,
                last_reason: None,
                control: None,
                closing: false,
                batch: None,
            }),
            state_tx,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Connection that created the session, if any.
    pub fn owner(&self) -> Option<u64> {
        self.owner
    }

    pub fn state(&self) -> SessionState {
        mutex_lock_or_recover(&self.slot).state
    }

    pub fn info(&self) -> SessionInfo {
        let slot = mutex_lock_or_recover(&self.slot);
        SessionInfo {
            id: self.id.clone(),
            state: slot.state,
            created_at: self.created_at,
            runs: slot.runs,
            pid: slot.pid,
            last_reason: slot.last_reason,
        }
    }

    fn set_state(&self, slot: &mut SessionSlot, state: SessionState) {
        slot.state = state;
        self.state_tx.send_replace(state);
    }

    /// Claims the session for a new run. Exclusive: fails while another run
    /// or batch is active, or once the session is closing.
    pub fn begin_run(&self) -> Result<RunTicket, SessionError> {
        let mut slot = mutex_lock_or_recover(&self.slot);
        if slot.batch.is_some() {
            return Err(SessionError::Busy(self.id.to_string()));
        }
        self.claim(&mut slot)
    }

    /// Claims the session for the first step of a batch. Until
    /// [`Self::end_batch`], the session stays busy between steps and a cancel
    /// stops the remaining steps.
    pub fn begin_batch(&self) -> Result<RunTicket, SessionError> {
        let mut slot = mutex_lock_or_recover(&self.slot);
        if slot.batch.is_some() {
            return Err(SessionError::Busy(self.id.to_string()));
        }
        let ticket = self.claim(&mut slot)?;
        slot.batch = Some(BatchMark::Running);
        Ok(ticket)
    }

    /// Claims the session for the next batch step, or `None` once the batch
    /// was cancelled.
    pub fn next_batch_step(&self) -> Result<Option<RunTicket>, SessionError> {
        let mut slot = mutex_lock_or_recover(&self.slot);
        if slot.batch == Some(BatchMark::Cancelled) {
            return Ok(None);
        }
        self.claim(&mut slot).map(Some)
    }

    pub fn end_batch(&self) {
        mutex_lock_or_recover(&self.slot).batch = None;
    }

    fn claim(&self, slot: &mut SessionSlot) -> Result<RunTicket, SessionError> {
        if slot.closing {
            return Err(SessionError::Closing(self.id.to_string()));
        }
        if slot.state.is_active() {
            return Err(SessionError::Busy(self.id.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        slot.control = Some(tx);
        slot.runs += 1;
        slot.pid = None;
        slot.last_reason = None;
        self.set_state(slot, SessionState::Running);
        Ok(RunTicket { control: rx })
    }

    pub fn attach_process(&self, pid: u32) {
        mutex_lock_or_recover(&self.slot).pid = Some(pid);
    }

    /// Cancel is idempotent: on a session without an active run or batch, or
    /// one already cancelling, it does nothing. Pause and resume need a live
    /// process.
    pub fn control(&self, kind: ControlKind) -> Result<ControlOutcome, SessionError> {
        let mut slot = mutex_lock_or_recover(&self.slot);
        match kind {
            ControlKind::Cancel => {
                let batch_pending = slot.batch == Some(BatchMark::Running);
                if batch_pending {
                    slot.batch = Some(BatchMark::Cancelled);
                }
                if slot.state != SessionState::Running {
                    return Ok(if batch_pending {
                        ControlOutcome::Cancelling
                    } else {
                        ControlOutcome::NoOp
                    });
                }
                let delivered = slot
                    .control
                    .as_ref()
                    .is_some_and(|tx| tx.send(ControlKind::Cancel).is_ok());
                if !delivered {
                    return Ok(if batch_pending {
                        ControlOutcome::Cancelling
                    } else {
                        ControlOutcome::NoOp
                    });
                }
                self.set_state(&mut slot, SessionState::Cancelling);
                Ok(ControlOutcome::Cancelling)
            }
            ControlKind::Pause | ControlKind::Resume => {
                let live = slot.state == SessionState::Running && slot.pid.is_some();
                let delivered = live
                    && slot
                        .control
                        .as_ref()
                        .is_some_and(|tx| tx.send(kind).is_ok());
                if !delivered {
                    return Err(SessionError::ProcessNotFound(self.id.to_string()));
                }
                Ok(if kind == ControlKind::Pause {
                    ControlOutcome::Paused
                } else {
                    ControlOutcome::Resumed
                })
            }
        }
    }

    /// Ends the active run. The caller guarantees the run's process group is
    /// gone.
    pub fn finish_run(&self, reason: Option<TerminationReason>, failed: bool) {
        let mut slot = mutex_lock_or_recover(&self.slot);
        slot.control = None;
        slot.pid = None;
        slot.last_reason = reason;
        let state = if failed || reason == Some(TerminationReason::Error) {
            SessionState::Failed
        } else {
            SessionState::Completed
        };
        self.set_state(&mut slot, state);
    }

    #[cfg(test)]
    pub fn is_closing(&self) -> bool {
        mutex_lock_or_recover(&self.slot).closing
    }

    /// Marks the session closing so no further run can begin. Fails if a run
    /// or batch holds it.
    fn close_if_idle(&self) -> Result<(), SessionError> {
        let mut slot = mutex_lock_or_recover(&self.slot);
        if slot.state.is_active() || slot.batch.is_some() {
            return Err(SessionError::Busy(self.id.to_string()));
        }
        slot.closing = true;
        Ok(())
    }

    fn close(&self) {
        mutex_lock_or_recover(&self.slot).closing = true;
    }

    /// Resolves once no run is active.
    pub async fn wait_idle(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| !state.is_active()).await;
    }
}

/// Live sessions keyed by id, bounded by `max_sessions`.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Allocates a session under the write lock, so the ceiling holds under
    /// concurrent callers.
    pub fn create(&self, owner: Option<u64>) -> Result<Arc<Session>, SessionError> {
        let mut sessions = rwlock_write_or_recover(&self.sessions);
        if sessions.len() >= self.max_sessions {
            return Err(SessionError::LimitReached {
                max: self.max_sessions,
            });
        }
        let id = loop {
            let candidate = SessionId::new(uuid::Uuid::new_v4().to_string());
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session = Arc::new(Session::new(id.clone(), owner));
        sessions.insert(id.clone(), Arc::clone(&session));
        debug!(session_id = %id, owner, "Session created");
        Ok(session)
    }

    pub fn get(&self, id: &SessionId) -> Result<Arc<Session>, SessionError> {
        rwlock_read_or_recover(&self.sessions)
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Removes an idle or terminal session.
    pub fn acknowledge(&self, id: &SessionId) -> Result<(), SessionError> {
        let mut sessions = rwlock_write_or_recover(&self.sessions);
        let session = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.close_if_idle()?;
        sessions.remove(id);
        debug!(session_id = %id, "Session acknowledged and released");
        Ok(())
    }

    /// Cancels any active run, waits for its process group to be gone, then
    /// releases the id.
    pub async fn destroy(&self, id: &SessionId) -> Result<(), SessionError> {
        let session = self.get(id)?;
        session.close();
        session.control(ControlKind::Cancel)?;
        session.wait_idle().await;
        rwlock_write_or_recover(&self.sessions).remove(id);
        debug!(session_id = %id, "Session destroyed");
        Ok(())
    }

    pub fn owned_by(&self, owner: u64) -> Vec<SessionId> {
        rwlock_read_or_recover(&self.sessions)
            .values()
            .filter(|session| session.owner() == Some(owner))
            .map(|session| session.id().clone())
            .collect()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = rwlock_read_or_recover(&self.sessions)
            .values()
            .map(|session| session.info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn len(&self) -> usize {
        rwlock_read_or_recover(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        rwlock_read_or_recover(&self.sessions)
            .values()
            .filter(|session| session.state().is_active())
            .count()
    }

    pub async fn shutdown_all(&self) {
        let ids: Vec<SessionId> = rwlock_read_or_recover(&self.sessions)
            .keys()
            .cloned()
            .collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "Destroying sessions for shutdown");
        }
        for id in ids {
            let _ = self.destroy(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_create_enforces_ceiling() {
        let registry = SessionRegistry::new(2);
        registry.create(None).unwrap();
        registry.create(None).unwrap();
        let err = registry.create(None).err().unwrap();
        assert_eq!(err, SessionError::LimitReached { max: 2 });
        assert_eq!(err.code(), error_codes::SESSION_LIMIT);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_concurrent_create_never_exceeds_ceiling() {
        let registry = Arc::new(SessionRegistry::new(10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..5).filter(|_| registry.create(None).is_ok()).count()
                })
            })
            .collect();
        let created: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(created, 10);
        assert_eq!(registry.len(), 10);
    }

    #[test]
    fn test_begin_run_is_exclusive() {
        let registry = SessionRegistry::new(4);
        let session = registry.create(None).unwrap();
        let _ticket = session.begin_run().unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert!(matches!(session.begin_run(), Err(SessionError::Busy(_))));

        session.finish_run(Some(TerminationReason::Normal), false);
        assert_eq!(session.state(), SessionState::Completed);
        assert!(session.begin_run().is_ok());
        assert_eq!(session.info().runs, 2);
    }

    #[test]
    fn test_cancel_is_noop_when_not_running() {
        let registry = SessionRegistry::new(4);
        let session = registry.create(None).unwrap();
        assert_eq!(
            session.control(ControlKind::Cancel).unwrap(),
            ControlOutcome::NoOp
        );

        let _ticket = session.begin_run().unwrap();
        session.finish_run(Some(TerminationReason::Normal), false);
        assert_eq!(
            session.control(ControlKind::Cancel).unwrap(),
            ControlOutcome::NoOp
        );
    }

    #[test]
    fn test_cancel_reaches_ticket_and_moves_to_cancelling() {
        let registry = SessionRegistry::new(4);
        let session = registry.create(None).unwrap();
        let mut ticket = session.begin_run().unwrap();
        assert_eq!(
            session.control(ControlKind::Cancel).unwrap(),
            ControlOutcome::Cancelling
        );
        assert_eq!(session.state(), SessionState::Cancelling);
        assert_eq!(ticket.control.try_recv().unwrap(), ControlKind::Cancel);
        assert_eq!(
            session.control(ControlKind::Cancel).unwrap(),
            ControlOutcome::NoOp
        );
    }

    #[test]
    fn test_pause_needs_live_process() {
        let registry = SessionRegistry::new(4);
        let session = registry.create(None).unwrap();
        let mut ticket = session.begin_run().unwrap();
        assert!(matches!(
            session.control(ControlKind::Pause),
            Err(SessionError::ProcessNotFound(_))
        ));
        session.attach_process(4242);
        assert_eq!(
            session.control(ControlKind::Pause).unwrap(),
            ControlOutcome::Paused
        );
        assert_eq!(ticket.control.try_recv().unwrap(), ControlKind::Pause);
    }

    #[test]
    fn test_error_reason_marks_session_failed() {
        let registry = SessionRegistry::new(4);
        let session = registry.create(None).unwrap();
        let _ticket = session.begin_run().unwrap();
        session.finish_run(Some(TerminationReason::Error), false);
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_acknowledge_rejects_running_session() {
        let registry = SessionRegistry::new(4);
        let session = registry.create(None).unwrap();
        let _ticket = session.begin_run().unwrap();
        assert!(matches!(
            registry.acknowledge(session.id()),
            Err(SessionError::Busy(_))
        ));
        session.finish_run(Some(TerminationReason::Normal), false);
        registry.acknowledge(session.id()).unwrap();
        assert!(registry.get(session.id()).is_err());
    }

    #[tokio::test]
    async fn test_destroy_waits_for_run_to_finish() {
        let registry = Arc::new(SessionRegistry::new(4));
        let session = registry.create(Some(7)).unwrap();
        let mut ticket = session.begin_run().unwrap();

        let driver = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let kind = ticket.control.recv().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                session.finish_run(Some(TerminationReason::Cancelled), false);
                kind
            })
        };

        registry.destroy(session.id()).await.unwrap();
        assert_eq!(driver.await.unwrap(), Some(ControlKind::Cancel));
        assert!(registry.is_empty());
        assert!(session.is_closing());
        assert!(matches!(session.begin_run(), Err(SessionError::Closing(_))));
    }

    #[test]
    fn test_acknowledge_never_releases_a_session_that_began_a_run() {
        let registry = Arc::new(SessionRegistry::new(4));
        for _ in 0..2_000 {
            let session = registry.create(None).unwrap();
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let runner = {
                let session = Arc::clone(&session);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    session.begin_run().is_ok()
                })
            };
            barrier.wait();
            let released = registry.acknowledge(session.id()).is_ok();
            let started = runner.join().unwrap();

            assert!(!(released && started), "a run began on a released session");
            if started {
                assert!(registry.get(session.id()).is_ok());
                session.finish_run(Some(TerminationReason::Normal), false);
                registry.acknowledge(session.id()).unwrap();
            }
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_between_batch_steps_stops_the_batch() {
        let registry = SessionRegistry::new(4);
        let session = registry.create(None).unwrap();
        let _first = session.begin_batch().unwrap();
        session.finish_run(Some(TerminationReason::Normal), false);

        assert!(matches!(session.begin_run(), Err(SessionError::Busy(_))));
        assert!(matches!(
            registry.acknowledge(session.id()),
            Err(SessionError::Busy(_))
        ));
        assert_eq!(
            session.control(ControlKind::Cancel).unwrap(),
            ControlOutcome::Cancelling
        );
        assert!(session.next_batch_step().unwrap().is_none());

        session.end_batch();
        assert_eq!(
            session.control(ControlKind::Cancel).unwrap(),
            ControlOutcome::NoOp
        );
        assert!(session.begin_run().is_ok());
    }

    #[test]
    fn test_batch_steps_continue_without_cancel() {
        let registry = SessionRegistry::new(4);
        let session = registry.create(None).unwrap();
        let _first = session.begin_batch().unwrap();
        assert!(matches!(session.next_batch_step(), Err(SessionError::Busy(_))));
        session.finish_run(Some(TerminationReason::Normal), false);
        assert!(session.next_batch_step().unwrap().is_some());
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.info().runs, 2);
    }

    #[test]
    fn test_owned_by_filters_connections() {
        let registry = SessionRegistry::new(4);
        registry.create(Some(1)).unwrap();
        registry.create(Some(2)).unwrap();
        registry.create(Some(1)).unwrap();
        assert_eq!(registry.owned_by(1).len(), 2);
        assert_eq!(registry.list().len(), 3);
    }
}
