mod config;
mod executor;
mod file_lock;
mod session;
mod signal_handler;

pub use config::DaemonConfig;
pub use config::HistorySpec;
pub use config::socket_path;
pub use executor::Executor;
pub use executor::ExecutorConfig;
pub use executor::PreparedRun;
pub use executor::RunEvent;
pub use executor::RunReport;
pub use file_lock::LockFile;
pub use file_lock::remove_lock_file;
pub use session::RunTicket;
pub use session::Session;
pub use session::SessionError;
pub use session::SessionRegistry;
pub use signal_handler::SignalHandler;
