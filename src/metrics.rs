//! Collaborator interfaces consumed by the core (§6): metrics sink,
//! parameter cache, and web bridge. The actual storage/UI behind these is
//! out of scope; `TracingMetricsSink` is the default implementation so the
//! binary is runnable standalone, per SPEC_FULL.md §2.10.

use tracing::{info, warn};

pub trait MetricsSink: Send + Sync {
    fn inc_sent(&self, msg_type: &str);
    fn inc_failed_unhealthy(&self, msg_type: &str);
    fn inc_failed_send(&self, msg_type: &str);
    fn set_ip(&self, ip: &str);
    fn set_session_info(&self, expires_at: u64, interval: u16);
    fn add_log(&self, level: &str, msg: &str);
}

/// Logs every counter event via `tracing` instead of storing it anywhere.
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn inc_sent(&self, msg_type: &str) {
        tracing::debug!(msg_type, "sent");
    }

    fn inc_failed_unhealthy(&self, msg_type: &str) {
        warn!(msg_type, "dropped (unhealthy)");
    }

    fn inc_failed_send(&self, msg_type: &str) {
        warn!(msg_type, "send failed");
    }

    fn set_ip(&self, ip: &str) {
        info!(ip, "current ip");
    }

    fn set_session_info(&self, expires_at: u64, interval: u16) {
        info!(expires_at, interval, "session info");
    }

    fn add_log(&self, level: &str, msg: &str) {
        match level {
            "error" => tracing::error!("{msg}"),
            "warn" => warn!("{msg}"),
            _ => info!("{msg}"),
        }
    }
}

/// Called once per upstream `PARAM_VALUE` observed.
pub trait ParamCache: Send + Sync {
    fn on_param_value(&self, raw_payload: &[u8]);
}

#[derive(Debug, Default)]
pub struct NullParamCache;

impl ParamCache for NullParamCache {
    fn on_param_value(&self, _raw_payload: &[u8]) {}
}

/// Called on the first FC heartbeat, never again for the process life.
pub trait WebBridge: Send + Sync {
    fn on_heartbeat(&self, system_id: u8);
}

#[derive(Debug, Default)]
pub struct NullWebBridge;

impl WebBridge for NullWebBridge {
    fn on_heartbeat(&self, _system_id: u8) {}
}
