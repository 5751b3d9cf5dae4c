#![deny(clippy::all)]

pub mod daemon_error;

pub use agent_exec_common::ErrorCategory;
pub use agent_exec_common::error_codes;
pub use agent_exec_common::mutex_lock_or_recover;
pub use agent_exec_common::poison_recovery_count;
pub use agent_exec_common::rwlock_read_or_recover;
pub use agent_exec_common::rwlock_write_or_recover;
pub use agent_exec_common::telemetry;
pub use daemon_error::DaemonError;
