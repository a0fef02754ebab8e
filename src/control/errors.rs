//! Error classification for the Control Channel (§4.4 failure semantics).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    /// Socket-level error, or a deadline expiring with no protocol reply.
    /// The connection is closed and `OnNetworkError` fires.
    #[error("network error: {0}")]
    Network(String),

    /// A refresh reply with `error_code` 0x06/0x07: the connection stays
    /// open, but the Session Manager must re-authenticate.
    #[error("session invalid: error_code={error_code:#04x}")]
    SessionInvalid { error_code: u8 },

    /// Any other `result == failure`, surfaced to the caller.
    #[error("command failed: error_code={error_code:#04x} wait_sec={wait_sec:?}")]
    CommandFailure { error_code: u8, wait_sec: Option<u16> },

    /// A well-formed reply of the wrong message type.
    #[error("unexpected reply type")]
    UnexpectedReply,
}

impl ControlError {
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, ControlError::SessionInvalid { .. })
    }

    pub fn is_network(&self) -> bool {
        matches!(self, ControlError::Network(_))
    }
}
