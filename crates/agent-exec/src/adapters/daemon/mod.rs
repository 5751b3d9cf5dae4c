pub mod error;
pub mod router;

pub use error::GatewayError;
pub use error::error_payload;
pub use error::error_response;
pub use router::BatchRequest;
pub use router::ExecuteRequest;
pub use router::GatewayCommand;
pub use router::METHODS;
pub use router::check_allowed;
pub use router::decode;
