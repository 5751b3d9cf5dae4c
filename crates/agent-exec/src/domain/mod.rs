pub mod command;
pub mod history;
pub mod hooks;
pub mod output;
pub mod process;
pub mod session_types;
pub mod signature;

pub use command::CommandSpec;
pub use history::CommandSignature;
pub use history::Complexity;
pub use history::TimeoutSample;
pub use hooks::CircuitBreakerState;
pub use hooks::CircuitState;
pub use hooks::HookDescriptor;
pub use hooks::HookPhase;
pub use output::OutputBuffer;
pub use output::OutputChunk;
pub use output::OutputLimits;
pub use output::OutputSummary;
pub use output::StreamKind;
pub use process::ControlKind;
pub use process::ProcessRecord;
pub use process::SignalKind;
pub use process::TerminationReason;
pub use session_types::SessionId;
pub use session_types::SessionInfo;
pub use session_types::SessionState;
