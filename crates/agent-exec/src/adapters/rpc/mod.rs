pub mod params;
pub mod types;

pub use types::FrameError;
pub use types::RpcNotification;
pub use types::RpcRequest;
pub use types::RpcResponse;
pub use types::parse_frame;
