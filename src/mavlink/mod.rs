pub mod endpoint;
pub mod forwarder;

pub use endpoint::{run_session_heartbeat, MavListener, MavSender};
pub use forwarder::{discover, Forwarder, PixhawkLink};
