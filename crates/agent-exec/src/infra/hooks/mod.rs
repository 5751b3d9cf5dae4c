mod config;
mod pipeline;
mod runner;

pub use config::HookSet;
pub use pipeline::HookPipeline;
pub use runner::HookContext;
pub use runner::HookFailure;
pub use runner::HookFailureKind;
pub use runner::HookRunner;
