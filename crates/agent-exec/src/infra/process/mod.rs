mod group;
mod supervisor;

#[cfg(test)]
pub use group::group_alive;
pub use supervisor::ProcessSupervisor;
pub use supervisor::SpawnError;
pub use supervisor::SpawnedProcess;
pub use supervisor::StdinMode;
pub use supervisor::SupervisorConfig;
