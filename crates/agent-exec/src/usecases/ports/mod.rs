pub mod clock;
pub mod history_store;
pub mod system_load;

#[cfg(test)]
pub mod test_support;

pub use clock::Clock;
pub use clock::ClockHandle;
pub use history_store::HistoryError;
pub use history_store::HistoryStore;
pub use history_store::HistoryStoreHandle;
pub use history_store::MemoryHistoryStore;
pub use history_store::NullHistoryStore;
pub use system_load::SystemLoad;
pub use system_load::SystemLoadHandle;
