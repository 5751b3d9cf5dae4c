mod jsonl;
mod probes;

pub use jsonl::JsonlHistoryStore;
pub use probes::SysinfoLoad;
pub use probes::SystemClock;
