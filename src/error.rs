//! Top-level error kinds for fatal startup paths.
//!
//! Recoverable paths (control-channel/codec) carry their own `thiserror`
//! types (`ControlError`, `agent_proto::codec::CodecError`); this module is
//! only for the kinds that make the supervisor exit with a non-zero code.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid drone uuid {0:?}: must match RFC-4122 8-4-4-12 hex form")]
    InvalidUuid(String),
    #[error("{field} out of range: {value} (expected {expected})")]
    OutOfRange { field: &'static str, value: i64, expected: &'static str },
    #[error("failed to read config file {path:?}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse { path: String, source: serde_yaml::Error },
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("drone is not registered: no secret file at {0:?}")]
    NotRegistered(String),
    #[error("secret file at {0:?} is malformed")]
    Malformed(String),
    #[error("io error persisting secret file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize secret record: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("no flight-controller heartbeat within {0:?} and allow_missing_pixhawk=false")]
    Timeout(std::time::Duration),
}
