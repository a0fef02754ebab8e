//! Liveness Monitor (§4.8): samples the local outbound IP, detects changes,
//! and coordinates rebuilding the Sender socket plus a control-channel
//! reconnect and a skipped refresh cycle.

use crate::control::ControlChannel;
use crate::metrics::MetricsSink;
use crate::session::SessionManager;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Rebuilds the MAVLink Sender socket on IP change; implemented by the
/// MAVLink Endpoint so the Liveness Monitor doesn't need to know its internals.
#[async_trait]
pub trait SenderRebuilder: Send + Sync {
    async fn rebuild_sender(&self) -> anyhow::Result<()>;
}

pub struct LivenessMonitor {
    /// Router address used purely as a stable remote endpoint to read our
    /// outbound-interface IP from; no packet is actually sent to it.
    probe_addr: String,
    current_ip: Mutex<Option<String>>,
    control: Arc<ControlChannel>,
    session_mgr: Arc<SessionManager>,
    sender: Arc<dyn SenderRebuilder>,
    metrics: Arc<dyn MetricsSink>,
    healthy: AtomicBool,
}

impl LivenessMonitor {
    pub fn new(
        probe_addr: String,
        control: Arc<ControlChannel>,
        session_mgr: Arc<SessionManager>,
        sender: Arc<dyn SenderRebuilder>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            probe_addr,
            current_ip: Mutex::new(None),
            control,
            session_mgr,
            sender,
            metrics,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn sample_local_ip(&self) -> Option<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect(&self.probe_addr).ok()?;
        socket.local_addr().ok().map(|addr| addr.ip().to_string())
    }

    async fn check(&self) {
        let Some(observed) = self.sample_local_ip() else {
            warn!("failed to sample local outbound ip");
            self.healthy.store(false, Ordering::Relaxed);
            return;
        };

        let mut current = self.current_ip.lock().await;
        match current.as_deref() {
            Some(existing) if existing == observed => {
                self.healthy.store(true, Ordering::Relaxed);
            }
            None => {
                info!(ip = %observed, "initial outbound ip observed");
                *current = Some(observed.clone());
                self.metrics.set_ip(&observed);
            }
            Some(_) => {
                info!(old = ?current.as_deref(), new = %observed, "outbound ip changed");
                *current = Some(observed.clone());
                drop(current);

                self.metrics.set_ip(&observed);
                if let Err(e) = self.sender.rebuild_sender().await {
                    warn!(error = %e, "failed to rebuild sender socket after ip change");
                }
                self.control.force_reconnect().await;
                self.session_mgr.note_ip_change(agent_proto::now_unix());
                self.healthy.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Runs until `stop` fires. `forced` is a depth-1 channel the Control
    /// Channel signals on `OnNetworkError` to bypass the 5s sampling cadence.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>, mut forced: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check().await,
                Some(()) = forced.recv() => self.check().await,
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!("liveness monitor stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopSender;

    #[async_trait]
    impl SenderRebuilder for NoopSender {
        async fn rebuild_sender(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_sample_sets_baseline_without_rebuilding() {
        let (net_tx, _net_rx) = mpsc::channel(1);
        let control = Arc::new(ControlChannel::new("127.0.0.1", 1, "u", "s", net_tx));
        let session_mgr = Arc::new(SessionManager::new(
            control.clone(),
            Arc::new(crate::metrics::TracingMetricsSink),
            "u".into(),
            "s".into(),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ));
        let monitor = LivenessMonitor::new(
            "127.0.0.1:1".into(),
            control,
            session_mgr,
            Arc::new(NoopSender),
            Arc::new(crate::metrics::TracingMetricsSink),
        );

        monitor.check().await;
        assert!(monitor.current_ip.lock().await.is_some());
        assert!(monitor.is_healthy());
    }
}
