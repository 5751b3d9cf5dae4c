pub mod daemon;
pub mod rpc;
