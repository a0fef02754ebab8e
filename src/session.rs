//! Session Manager (§4.5): lifecycle of `(token, expires_at, refresh_interval)`,
//! the periodic refresh task, and the recovery escalation policy.
//!
//! States: `None -> Pending -> Active -> (Refreshing -> Active)* -> Invalid -> None`.
//! The state transitions live behind a single lock; refresh and recovery
//! are serialized through `&self` methods so two recoveries can't race.

use crate::control::{ControlChannel, ControlError};
use crate::metrics::MetricsSink;
use agent_proto::hmac_core;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    None,
    Pending,
    Active,
    Invalid,
}

#[derive(Debug, Clone, Default)]
pub struct SessionTriple {
    pub token: Vec<u8>,
    pub expires_at: u64,
    pub refresh_interval: u16,
}

struct Inner {
    status: SessionStatus,
    session: SessionTriple,
}

pub struct SessionManager {
    channel: Arc<ControlChannel>,
    metrics: Arc<dyn MetricsSink>,
    uuid: String,
    shared_secret: String,
    secret_key: Mutex<Option<String>>,
    inner: Mutex<Inner>,
    /// Unix-seconds timestamp of the last observed IP change, or a sentinel
    /// far in the past when none has happened yet.
    last_ip_change: AtomicI64,
    ip_change_threshold: Duration,
    default_refresh_interval: Duration,
}

impl SessionManager {
    pub fn new(
        channel: Arc<ControlChannel>,
        metrics: Arc<dyn MetricsSink>,
        uuid: String,
        shared_secret: String,
        ip_change_threshold: Duration,
        default_refresh_interval: Duration,
    ) -> Self {
        Self {
            channel,
            metrics,
            uuid,
            shared_secret,
            secret_key: Mutex::new(None),
            inner: Mutex::new(Inner { status: SessionStatus::None, session: SessionTriple::default() }),
            last_ip_change: AtomicI64::new(i64::MIN),
            ip_change_threshold,
            default_refresh_interval,
        }
    }

    pub async fn status(&self) -> SessionStatus {
        self.inner.lock().await.status
    }

    pub async fn session(&self) -> SessionTriple {
        self.inner.lock().await.session.clone()
    }

    pub async fn set_secret_key(&self, secret_key: String) {
        *self.secret_key.lock().await = Some(secret_key);
    }

    /// `SHA-256(shared || secret)`, falling back to the raw secret key (and
    /// logging the downgrade) when no shared secret is configured, per §4.3.
    async fn combined_key(&self) -> String {
        let secret_key = self.secret_key.lock().await.clone().unwrap_or_default();
        if self.shared_secret.is_empty() {
            warn!("no shared_secret configured; authenticating with raw secret_key (downgraded)");
            secret_key
        } else {
            hmac_core::combined_key(&self.shared_secret, &secret_key)
        }
    }

    /// Record an IP change so the next refresh tick is skipped per the
    /// `ip_change_threshold` rule (§4.5), avoiding a race with the Liveness
    /// Monitor rebuilding transports.
    pub fn note_ip_change(&self, now_unix: u64) {
        self.last_ip_change.store(now_unix as i64, Ordering::SeqCst);
    }

    fn recently_changed_ip(&self, now_unix: u64) -> bool {
        let last = self.last_ip_change.load(Ordering::SeqCst);
        if last == i64::MIN {
            return false;
        }
        (now_unix as i64 - last) < self.ip_change_threshold.as_secs() as i64
    }

    /// Entry to `Active` via a full `authenticate()`.
    pub async fn authenticate(&self) -> Result<(), ControlError> {
        info!(uuid = %self.uuid, "authenticating");
        let combined = self.combined_key().await;
        let result = self.channel.authenticate(&combined).await?;
        self.adopt(result.token, result.expires_at, result.interval).await;
        Ok(())
    }

    async fn adopt(&self, token: Vec<u8>, expires_at: u64, interval: u16) {
        let mut inner = self.inner.lock().await;
        inner.status = SessionStatus::Active;
        inner.session = SessionTriple { token, expires_at, refresh_interval: interval };
        drop(inner);
        self.metrics.set_session_info(expires_at, interval);
    }

    /// One refresh tick per §4.5's main paragraph: extend `expires_at` on
    /// success, escalate to full re-auth on `session-invalid`, leave state
    /// untouched on `network` (the socket already dropped; retried next tick).
    async fn refresh_tick(&self, now_unix: u64) {
        if self.recently_changed_ip(now_unix) {
            info!("skipping refresh tick: ip changed recently");
            return;
        }

        let token = self.inner.lock().await.session.token.clone();
        if token.is_empty() {
            return;
        }

        match self.channel.refresh_session(&token).await {
            Ok(r) => {
                let mut inner = self.inner.lock().await;
                inner.session.expires_at = r.expires_at;
                inner.session.refresh_interval = r.interval;
                drop(inner);
                self.metrics.set_session_info(r.expires_at, r.interval);
            }
            Err(e) if e.is_session_invalid() => {
                self.inner.lock().await.status = SessionStatus::Invalid;
                warn!("session invalid on refresh, re-authenticating");
                if let Err(e) = self.authenticate().await {
                    warn!(error = %e, "re-authentication after invalid session failed");
                }
            }
            Err(e) if e.is_network() => {
                warn!(error = %e, "refresh failed (network); retrying next tick");
            }
            Err(e) => {
                warn!(error = %e, "refresh command failed");
            }
        }
    }

    /// `trigger_session_recovery` (§4.5): prefer the cheapest option that's
    /// still correct — refresh if the token has local TTL left, else
    /// `SESSION_NEW` on the live socket, else a full `authenticate()`.
    pub async fn trigger_session_recovery(&self) -> Result<(), ControlError> {
        let (token, locally_valid) = {
            let inner = self.inner.lock().await;
            let valid = inner.session.expires_at > agent_proto::now_unix();
            (inner.session.token.clone(), valid)
        };

        if locally_valid && !token.is_empty() {
            match self.channel.refresh_session(&token).await {
                Ok(r) => {
                    let mut inner = self.inner.lock().await;
                    inner.session.expires_at = r.expires_at;
                    inner.session.refresh_interval = r.interval;
                    inner.status = SessionStatus::Active;
                    return Ok(());
                }
                Err(e) if e.is_network() => return Err(e),
                Err(_) => {}
            }
        }

        if !token.is_empty() {
            match self.channel.session_new(&token).await {
                Ok(result) => {
                    self.adopt(result.token, result.expires_at, result.interval).await;
                    return Ok(());
                }
                Err(e) if e.is_network() => return Err(e),
                Err(_) => {}
            }
        }

        self.authenticate().await
    }

    /// Periodic refresh task, run until `stop` fires. Generalizes the
    /// teacher's interval-tick-in-a-select-loop pattern to this domain.
    pub async fn run_refresh_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.default_refresh_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh_tick(agent_proto::now_unix()).await;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!("session refresh loop stopping");
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

    #[test]
    fn recently_changed_ip_respects_threshold() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let channel = Arc::new(ControlChannel::new("127.0.0.1", 1, "u", "s", tx));
        let mgr = SessionManager::new(
            channel,
            Arc::new(crate::metrics::TracingMetricsSink),
            "u".into(),
            "s".into(),
            Duration::from_secs(10),
            Duration::from_secs(30),
        );

        assert!(!mgr.recently_changed_ip(1_000));
        mgr.note_ip_change(1_000);
        assert!(mgr.recently_changed_ip(1_005));
        assert!(!mgr.recently_changed_ip(1_015));
    }
}
