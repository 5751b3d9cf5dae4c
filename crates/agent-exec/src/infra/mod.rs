pub mod daemon;
pub mod history;
pub mod hooks;
pub mod output;
pub mod process;
pub mod retry;
