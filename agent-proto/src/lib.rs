//! Wire-format crate for the drone edge agent.
//!
//! Holds everything that is meaningful independent of any runtime: the
//! length-free control-protocol codec (registration/authentication/session/
//! API-key messages), the HMAC/combined-key primitives used by the
//! handshake, and a minimal MAVLink v2 framer used both to forward frames
//! as opaque bytes and to emit the `SESSION_HEARTBEAT` custom message.

pub mod codec;
pub mod hmac_core;
pub mod mavlink;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as seconds since the Unix epoch.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
