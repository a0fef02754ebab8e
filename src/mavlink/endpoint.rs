//! MAVLink Endpoint (§4.6): the Listener (toward the flight controller,
//! `out_system_id=255`) and Sender (toward the router, `out_system_id` =
//! the discovered FC id) UDP nodes, plus `SESSION_HEARTBEAT` emission.

use crate::liveness::SenderRebuilder;
use crate::session::SessionManager;
use agent_proto::mavlink::SessionHeartbeat;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

/// UDP server bound to the local MAVLink port, optionally plus a broadcast
/// discovery subsocket. Presents `system_id=255` (GCS) toward the FC.
pub struct MavListener {
    socket: UdpSocket,
    broadcast_socket: Option<UdpSocket>,
    /// Address of the flight controller once observed, used as the
    /// destination for router->FC passthrough frames.
    fc_addr: Mutex<Option<SocketAddr>>,
}

impl MavListener {
    pub async fn bind(local_port: u16, broadcast_port: i32) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port)).await?;

        let broadcast_socket = match broadcast_port {
            p if p < 0 => None,
            0 => {
                let s = UdpSocket::bind(("0.0.0.0", 0)).await?;
                s.set_broadcast(true)?;
                info!(port = s.local_addr()?.port(), "bound broadcast discovery socket (random port)");
                Some(s)
            }
            p => {
                let s = UdpSocket::bind(("0.0.0.0", p as u16)).await?;
                s.set_broadcast(true)?;
                Some(s)
            }
        };

        Ok(Self { socket, broadcast_socket, fc_addr: Mutex::new(None) })
    }

    /// Receive the next datagram from either the main or broadcast socket.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        match &self.broadcast_socket {
            None => self.socket.recv_from(buf).await,
            Some(bcast) => {
                let mut bcast_buf = vec![0u8; buf.len()];
                tokio::select! {
                    r = self.socket.recv_from(buf) => r,
                    r = bcast.recv_from(&mut bcast_buf) => {
                        let (n, from) = r?;
                        buf[..n].copy_from_slice(&bcast_buf[..n]);
                        Ok((n, from))
                    }
                }
            }
        }
    }

    pub async fn set_fc_addr(&self, addr: SocketAddr) {
        *self.fc_addr.lock().await = Some(addr);
    }

    pub async fn send_to_fc(&self, bytes: &[u8]) -> std::io::Result<()> {
        let addr = *self.fc_addr.lock().await;
        match addr {
            Some(addr) => {
                self.socket.send_to(bytes, addr).await?;
                Ok(())
            }
            None => {
                warn!("dropping downstream frame: flight-controller address not yet known");
                Ok(())
            }
        }
    }
}

/// UDP client toward the router. Presents `out_system_id` = the discovered
/// FC system id (fallback 1). The underlying socket is swapped atomically
/// on rebuild (§9: "mutex-guarded in-place rewiring becomes an atomic swap
/// of an owned handle").
pub struct MavSender {
    target: SocketAddr,
    socket: RwLock<Arc<UdpSocket>>,
    out_system_id: AtomicU8,
    sequence: AtomicU8,
}

impl MavSender {
    pub async fn new(target: SocketAddr, out_system_id: u8) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        Ok(Self {
            target,
            socket: RwLock::new(Arc::new(socket)),
            out_system_id: AtomicU8::new(out_system_id),
            sequence: AtomicU8::new(0),
        })
    }

    pub fn set_out_system_id(&self, id: u8) {
        self.out_system_id.store(id, Ordering::SeqCst);
    }

    pub fn out_system_id(&self) -> u8 {
        self.out_system_id.load(Ordering::SeqCst)
    }

    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let socket = self.socket.read().await.clone();
        socket.send_to(bytes, self.target).await?;
        Ok(())
    }

    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let socket = self.socket.read().await.clone();
        let (n, _from) = socket.recv_from(buf).await?;
        Ok(n)
    }

    fn next_sequence(&self) -> u8 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl SenderRebuilder for MavSender {
    async fn rebuild_sender(&self) -> anyhow::Result<()> {
        let fresh = UdpSocket::bind(("0.0.0.0", 0)).await?;
        *self.socket.write().await = Arc::new(fresh);
        // §4.8 step 2: out_system_id is re-read from the discovered value,
        // not reset — it lives on the atomic independently of the socket.
        self.set_out_system_id(self.out_system_id());
        info!(out_system_id = self.out_system_id(), "rebuilt mavlink sender socket");
        Ok(())
    }
}

/// Emits `SESSION_HEARTBEAT` on the Sender socket at `frequency_hz` once a
/// session token exists. Signals `first_emitted` after its first successful
/// send so the Forwarder's bounded 5s grace can resolve early.
pub async fn run_session_heartbeat(
    sender: Arc<MavSender>,
    session_mgr: Arc<SessionManager>,
    frequency_hz: f64,
    first_emitted: watch::Sender<bool>,
    mut stop: watch::Receiver<bool>,
) {
    let period = Duration::from_secs_f64(1.0 / frequency_hz.max(0.01));
    let mut ticker = tokio::time::interval(period);
    // The payload `sequence` is its own monotonically-increasing counter,
    // distinct from the MAVLink frame header sequence (`sender.next_sequence()`).
    let mut heartbeat_sequence: u16 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let session = session_mgr.session().await;
                if session.token.is_empty() {
                    continue;
                }

                let token_str = String::from_utf8_lossy(&session.token).into_owned();
                let heartbeat = SessionHeartbeat {
                    token: SessionHeartbeat::token_from_session_token(&token_str),
                    expires_at: session.expires_at as u32,
                    sequence: heartbeat_sequence,
                };
                heartbeat_sequence = heartbeat_sequence.wrapping_add(1);
                // The Sender presents the discovered FC system id toward the
                // router for locally-originated messages (§4.6), not GCS (255).
                let frame = heartbeat.encode_frame(sender.out_system_id(), 1, sender.next_sequence());

                match sender.send(&frame).await {
                    Ok(()) => {
                        if !*first_emitted.borrow() {
                            let _ = first_emitted.send(true);
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to emit session heartbeat"),
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
            }
        }
    }
}
