//! Supervisor (§4.9): the fixed eleven-step startup sequence, explicit
//! collaborator construction (§9 "no singletons"), and ordered graceful
//! shutdown on SIGINT/SIGTERM.

use crate::cli::Cli;
use crate::config::Config;
use crate::control::ControlChannel;
use crate::identity::{SecretRecord, SecretStore};
use crate::liveness::LivenessMonitor;
use crate::mavlink::{discover, Forwarder, MavListener, MavSender};
use crate::metrics::{MetricsSink, NullParamCache, NullWebBridge, TracingMetricsSink};
use crate::session::SessionManager;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const HEARTBEAT_GRACE: Duration = Duration::from_secs(5);
const BROADCAST_FALLBACK_WAIT: Duration = Duration::from_secs(10);
/// Skip one refresh tick if the outbound IP changed more recently than this.
const IP_CHANGE_THRESHOLD: Duration = Duration::from_secs(30);

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    // 1. Validate configuration.
    let mut config = Config::load(&cli.config).context("loading config")?;
    config.validate().context("validating config (pre-override)")?;

    // 2. Apply CLI overrides; isolate the Secret Store in test mode.
    cli.apply_overrides(&mut config);
    config.validate().context("validating config (post-override)")?;

    let secret_store = if cli.test_mode {
        SecretStore::for_test_mode(&config.auth.uuid)
    } else {
        SecretStore::fixed()
    };

    // 3. MAVLink Listener.
    let listener = Arc::new(
        MavListener::bind(config.network.local_listen_port, config.network.broadcast_port)
            .await
            .context("binding mavlink listener")?,
    );

    // 4. Discovery.
    let link = discover(
        &listener,
        Duration::from_secs(config.ethernet.pixhawk_connection_timeout),
        config.ethernet.allow_missing_pixhawk,
        BROADCAST_FALLBACK_WAIT,
    )
    .await
    .context("discovering flight controller")?;
    if !link.connected {
        warn!("starting without a discovered flight controller (allow_missing_pixhawk=true)");
    }

    // 5. MAVLink Sender with the discovered (or default) system id.
    let target = format!("{}:{}", config.network.target_host, config.network.target_port)
        .parse()
        .context("parsing network.target_host/target_port")?;
    let sender = Arc::new(
        MavSender::new(target, link.system_id).await.context("binding mavlink sender")?,
    );

    let metrics: Arc<dyn MetricsSink> = Arc::new(TracingMetricsSink);
    let (net_err_tx, net_err_rx) = mpsc::channel(1);
    let control = Arc::new(ControlChannel::new(
        &config.auth.host,
        config.auth.port,
        &config.auth.uuid,
        &config.auth.shared_secret,
        net_err_tx,
    ));
    let session_mgr = Arc::new(SessionManager::new(
        control.clone(),
        metrics.clone(),
        config.auth.uuid.clone(),
        config.auth.shared_secret.clone(),
        IP_CHANGE_THRESHOLD,
        Duration::from_secs(config.auth.keepalive_interval),
    ));
    let liveness = Arc::new(LivenessMonitor::new(
        format!("{}:{}", config.auth.host, config.auth.port),
        control.clone(),
        session_mgr.clone(),
        sender.clone(),
        metrics.clone(),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    // Gates the Forwarder's upstream direction until step 10 opens it (first
    // SESSION_HEARTBEAT emitted, or the 5s grace elapses) — §5.
    let (upstream_ready_tx, upstream_ready_rx) = watch::channel(false);

    // 6. Start the Forwarder.
    let forwarder = Arc::new(Forwarder::new(
        listener.clone(),
        sender.clone(),
        liveness.clone(),
        metrics.clone(),
        Arc::new(NullParamCache),
        Arc::new(NullWebBridge),
        config.log.stats_interval,
        upstream_ready_rx,
    ));
    let forwarder_handle = tokio::spawn(forwarder.clone().run(stop_rx.clone()));

    // 7. Register (if requested), then always authenticate on a fresh socket.
    if config.auth.enabled {
        if cli.register {
            let result = control.register().await.context("registration failed")?;
            let record = SecretRecord {
                drone_uuid: config.auth.uuid.clone(),
                secret_key: hex::encode(&result.secret_key),
                created_at: agent_proto::now_unix(),
            };
            secret_store.save(&record).context("persisting secret after registration")?;
            session_mgr.set_secret_key(record.secret_key).await;
        } else {
            let record = secret_store.load().context("drone is not registered")?;
            session_mgr.set_secret_key(record.secret_key).await;
        }

        control.force_reconnect().await;
        session_mgr.authenticate().await.context("authentication failed")?;
    }

    // 8. Start the Session Manager refresh loop.
    let session_handle = tokio::spawn(session_mgr.clone().run_refresh_loop(stop_rx.clone()));

    // 9. Start the Liveness Monitor.
    let liveness_handle = tokio::spawn(liveness.clone().run(stop_rx.clone(), net_err_rx));

    // 10. Start SESSION_HEARTBEAT emission; wait for first emission (or grace).
    let (first_emitted_tx, mut first_emitted_rx) = watch::channel(false);
    let heartbeat_handle = tokio::spawn(crate::mavlink::run_session_heartbeat(
        sender.clone(),
        session_mgr.clone(),
        config.auth.session_heartbeat_frequency,
        first_emitted_tx,
        stop_rx.clone(),
    ));
    tokio::select! {
        _ = first_emitted_rx.changed() => {
            info!("first session heartbeat emitted");
        }
        _ = tokio::time::sleep(HEARTBEAT_GRACE) => {
            warn!("proceeding after heartbeat grace period without a confirmed emission");
        }
    }
    let _ = upstream_ready_tx.send(true);

    // 11. Install signal handler, then run until shutdown.
    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping in order");
    let _ = stop_tx.send(true);

    let _ = session_handle.await;
    let _ = forwarder_handle.await;
    let _ = liveness_handle.await;
    let _ = heartbeat_handle.await;
    metrics.add_log("info", "shutdown complete");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
