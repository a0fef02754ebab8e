pub mod channel;
pub mod errors;

pub use channel::{AuthResult, ControlChannel, RefreshResult, RegisterResult};
pub use errors::ControlError;
