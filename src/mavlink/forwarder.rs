//! Discovery + Forwarder (§4.7): waits for the first flight-controller
//! heartbeat, then runs the bidirectional MAVLink forwarding loop with
//! dedup, source-id filtering, and throttled summary logging.

use super::endpoint::{MavListener, MavSender};
use crate::error::DiscoveryError;
use crate::liveness::LivenessMonitor;
use crate::metrics::{MetricsSink, ParamCache, WebBridge};
use agent_proto::mavlink::{self, RawFrame, AGENT_SYSTEM_ID};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

const HEARTBEAT: u32 = 0;
const SYS_STATUS: u32 = 1;
const PARAM_VALUE: u32 = 22;
const GPS_RAW_INT: u32 = 24;

const LOG_THROTTLE: Duration = Duration::from_secs(30);

fn msg_type_name(id: u32) -> String {
    match id {
        HEARTBEAT => "HEARTBEAT".to_string(),
        SYS_STATUS => "SYS_STATUS".to_string(),
        PARAM_VALUE => "PARAM_VALUE".to_string(),
        GPS_RAW_INT => "GPS_RAW_INT".to_string(),
        mavlink::SESSION_HEARTBEAT_MSG_ID => "SESSION_HEARTBEAT".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct PixhawkLink {
    pub discovered_ip: Option<IpAddr>,
    pub system_id: u8,
    pub connected: bool,
}

/// Wait for the first `HEARTBEAT` on `listener`. Returns `(connected, id)`
/// or `(disconnected, default id=1)` — never an intermediate state (§8.10).
pub async fn discover(
    listener: &MavListener,
    timeout: Duration,
    allow_missing_pixhawk: bool,
    broadcast_fallback_wait: Duration,
) -> Result<PixhawkLink, DiscoveryError> {
    if let Some(link) = wait_for_heartbeat(listener, timeout).await {
        return Ok(link);
    }

    if !allow_missing_pixhawk {
        return Err(DiscoveryError::Timeout(timeout));
    }

    warn!("no flight-controller heartbeat within timeout; waiting on broadcast fallback");
    if let Some(link) = wait_for_heartbeat(listener, broadcast_fallback_wait).await {
        return Ok(link);
    }

    warn!("no flight-controller heartbeat via broadcast fallback either; defaulting system_id=1");
    Ok(PixhawkLink { discovered_ip: None, system_id: 1, connected: false })
}

async fn wait_for_heartbeat(listener: &MavListener, wait: Duration) -> Option<PixhawkLink> {
    let mut buf = vec![0u8; 2048];
    let result = tokio::time::timeout(wait, async {
        loop {
            let (n, from) = listener.recv(&mut buf).await.ok()?;
            let mut offset = 0;
            while offset < n {
                match mavlink::parse_next(&buf[offset..n]) {
                    Ok(Some((frame, consumed))) => {
                        offset += consumed;
                        if frame.message_id == HEARTBEAT && frame.system_id != AGENT_SYSTEM_ID {
                            listener.set_fc_addr(from).await;
                            return Some(PixhawkLink {
                                discovered_ip: Some(from.ip()),
                                system_id: frame.system_id,
                                connected: true,
                            });
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        offset += 1;
                    }
                }
            }
        }
    })
    .await;

    result.ok().flatten()
}

struct Stats {
    last_logged: HashMap<u32, Instant>,
    forwarded_total: u64,
}

pub struct Forwarder {
    listener: Arc<MavListener>,
    sender: Arc<MavSender>,
    liveness: Arc<LivenessMonitor>,
    metrics: Arc<dyn MetricsSink>,
    param_cache: Arc<dyn ParamCache>,
    web_bridge: Arc<dyn WebBridge>,
    last_seq: Mutex<HashMap<u8, u8>>,
    stats: Mutex<Stats>,
    stats_roll_every: u64,
    first_heartbeat_signaled: std::sync::atomic::AtomicBool,
    /// Gates upstream forwarding until the first `SESSION_HEARTBEAT` is
    /// emitted or the supervisor's 5s grace elapses (§5).
    upstream_ready: watch::Receiver<bool>,
}

impl Forwarder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: Arc<MavListener>,
        sender: Arc<MavSender>,
        liveness: Arc<LivenessMonitor>,
        metrics: Arc<dyn MetricsSink>,
        param_cache: Arc<dyn ParamCache>,
        web_bridge: Arc<dyn WebBridge>,
        stats_roll_every: u64,
        upstream_ready: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            sender,
            liveness,
            metrics,
            param_cache,
            web_bridge,
            last_seq: Mutex::new(HashMap::new()),
            stats: Mutex::new(Stats { last_logged: HashMap::new(), forwarded_total: 0 }),
            stats_roll_every: stats_roll_every.max(1),
            first_heartbeat_signaled: std::sync::atomic::AtomicBool::new(false),
            upstream_ready,
        }
    }

    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut upstream_buf = vec![0u8; 2048];
        let mut downstream_buf = vec![0u8; 2048];

        loop {
            tokio::select! {
                result = self.listener.recv(&mut upstream_buf) => {
                    if let Ok((n, from)) = result {
                        self.listener.set_fc_addr(from).await;
                        self.handle_upstream(&upstream_buf[..n]).await;
                    }
                }
                result = self.sender.recv(&mut downstream_buf) => {
                    if let Ok(n) = result {
                        self.handle_downstream(&downstream_buf[..n]).await;
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!("forwarder stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_upstream(&self, datagram: &[u8]) {
        let mut offset = 0;
        while offset < datagram.len() {
            let (frame, consumed) = match mavlink::parse_next(&datagram[offset..]) {
                Ok(Some(v)) => v,
                Ok(None) => break,
                Err(_) => {
                    offset += 1;
                    continue;
                }
            };
            offset += consumed;
            self.forward_one_upstream(frame).await;
        }
    }

    async fn forward_one_upstream(&self, frame: RawFrame) {
        // Hold all upstream forwarding until the first SESSION_HEARTBEAT is
        // emitted (or the supervisor's grace period opens the gate anyway).
        if !*self.upstream_ready.borrow() {
            return;
        }

        // 1. never forward our own GCS echoes.
        if frame.system_id == AGENT_SYSTEM_ID {
            return;
        }

        // 2. dedup by (system_id, sequence).
        {
            let mut last_seq = self.last_seq.lock().await;
            if last_seq.get(&frame.system_id) == Some(&frame.sequence) {
                return;
            }
            last_seq.insert(frame.system_id, frame.sequence);
        }

        let type_name = msg_type_name(frame.message_id);
        self.maybe_log_summary(frame.message_id, &type_name).await;

        // 4. salient-message side signals.
        if frame.message_id == HEARTBEAT
            && !self.first_heartbeat_signaled.swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            self.web_bridge.on_heartbeat(frame.system_id);
        }
        if frame.message_id == PARAM_VALUE {
            self.param_cache.on_param_value(&frame.raw);
        }

        // 5. unhealthy-drop vs send.
        if !self.liveness.is_healthy() {
            self.metrics.inc_failed_unhealthy(&type_name);
            return;
        }

        match self.sender.send(&frame.raw).await {
            Ok(()) => {
                self.metrics.inc_sent(&type_name);
                self.roll_stats().await;
            }
            Err(e) => {
                warn!(error = %e, type_name, "failed to forward frame upstream");
                self.metrics.inc_failed_send(&type_name);
            }
        }
    }

    async fn handle_downstream(&self, datagram: &[u8]) {
        let mut offset = 0;
        while offset < datagram.len() {
            match mavlink::parse_next(&datagram[offset..]) {
                Ok(Some((_frame, consumed))) => offset += consumed,
                Ok(None) => break,
                Err(_) => {
                    offset += 1;
                    continue;
                }
            }
        }
        if let Err(e) = self.listener.send_to_fc(datagram).await {
            warn!(error = %e, "failed to forward frame downstream");
        }
    }

    async fn maybe_log_summary(&self, message_id: u32, type_name: &str) {
        if !matches!(message_id, HEARTBEAT | GPS_RAW_INT | SYS_STATUS) {
            return;
        }
        let mut stats = self.stats.lock().await;
        let now = Instant::now();
        let should_log = match stats.last_logged.get(&message_id) {
            Some(last) => now.duration_since(*last) >= LOG_THROTTLE,
            None => true,
        };
        if should_log {
            stats.last_logged.insert(message_id, now);
            info!(type_name, "forwarding");
        }
    }

    async fn roll_stats(&self) {
        let mut stats = self.stats.lock().await;
        stats.forwarded_total += 1;
        if stats.forwarded_total % self.stats_roll_every == 0 {
            info!(total = stats.forwarded_total, "forwarder stats roll");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat_frame(system_id: u8, sequence: u8) -> RawFrame {
        let hb = mavlink::SessionHeartbeat { token: [0; 32], expires_at: 0, sequence: 0 };
        let raw = hb.encode_frame(system_id, 1, sequence);
        // Reinterpret as a HEARTBEAT-id frame for test purposes by overwriting
        // the message_id bytes and recomputing via parse_next's own CRC check
        // is overkill here; instead, just synthesize a RawFrame struct directly
        // since forward_one_upstream only inspects already-parsed fields.
        let _ = raw;
        RawFrame { system_id, component_id: 1, message_id: HEARTBEAT, sequence, raw: vec![0xFD, 0, 0, 0, sequence, system_id, 1, 0, 0, 0, 0, 0] }
    }

    #[test]
    fn msg_type_name_maps_known_ids() {
        assert_eq!(msg_type_name(HEARTBEAT), "HEARTBEAT");
        assert_eq!(msg_type_name(9999), "9999");
    }

    #[tokio::test]
    async fn gcs_echo_frames_are_never_forwarded() {
        let listener = Arc::new(MavListener::bind(0, -1).await.unwrap());
        let sender = Arc::new(MavSender::new("127.0.0.1:65500".parse().unwrap(), 1).await.unwrap());
        let (net_tx, _net_rx) = tokio::sync::mpsc::channel(1);
        let control = Arc::new(crate::control::ControlChannel::new("127.0.0.1", 1, "u", "s", net_tx));
        let session_mgr = Arc::new(crate::session::SessionManager::new(
            control.clone(),
            Arc::new(crate::metrics::TracingMetricsSink),
            "u".into(),
            "s".into(),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ));
        let liveness = Arc::new(LivenessMonitor::new(
            "127.0.0.1:1".into(),
            control,
            session_mgr,
            sender.clone(),
            Arc::new(crate::metrics::TracingMetricsSink),
        ));
        let forwarder = Forwarder::new(
            listener,
            sender,
            liveness,
            Arc::new(crate::metrics::TracingMetricsSink),
            Arc::new(crate::metrics::NullParamCache),
            Arc::new(crate::metrics::NullWebBridge),
            1000,
            tokio::sync::watch::channel(true).1,
        );

        forwarder.forward_one_upstream(heartbeat_frame(AGENT_SYSTEM_ID, 1)).await;
        assert!(forwarder.last_seq.lock().await.is_empty(), "GCS echo must not update dedup state");
    }

    #[tokio::test]
    async fn duplicate_sequence_is_deduplicated() {
        let listener = Arc::new(MavListener::bind(0, -1).await.unwrap());
        let sender = Arc::new(MavSender::new("127.0.0.1:65501".parse().unwrap(), 1).await.unwrap());
        let (net_tx, _net_rx) = tokio::sync::mpsc::channel(1);
        let control = Arc::new(crate::control::ControlChannel::new("127.0.0.1", 1, "u", "s", net_tx));
        let session_mgr = Arc::new(crate::session::SessionManager::new(
            control.clone(),
            Arc::new(crate::metrics::TracingMetricsSink),
            "u".into(),
            "s".into(),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ));
        let liveness = Arc::new(LivenessMonitor::new(
            "127.0.0.1:1".into(),
            control,
            session_mgr,
            sender.clone(),
            Arc::new(crate::metrics::TracingMetricsSink),
        ));
        let forwarder = Forwarder::new(
            listener,
            sender,
            liveness,
            Arc::new(crate::metrics::TracingMetricsSink),
            Arc::new(crate::metrics::NullParamCache),
            Arc::new(crate::metrics::NullWebBridge),
            1000,
            tokio::sync::watch::channel(true).1,
        );

        forwarder.forward_one_upstream(heartbeat_frame(1, 42)).await;
        assert_eq!(*forwarder.last_seq.lock().await.get(&1).unwrap(), 42);

        // Same (system_id, sequence) again: dedup keeps the table unchanged
        // and the send does not happen a second time (no panic/send error
        // means the early return path was taken).
        forwarder.forward_one_upstream(heartbeat_frame(1, 42)).await;
        assert_eq!(*forwarder.last_seq.lock().await.get(&1).unwrap(), 42);
    }
}
