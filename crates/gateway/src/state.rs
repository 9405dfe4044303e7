use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Instant,
};

use {
    dashmap::DashMap,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::debug,
};

use {
    pulse_auth::{CredentialVerifier, VerifierConfig},
    pulse_common::{SocketId, SocketSummary, UserId, UserIdentity, ms_to_iso, now_ms},
    pulse_config::Config,
    pulse_metrics::{HealthMonitor, HealthStatus, MetricsHandle, Thresholds},
    pulse_protocol::{SocketPacket, server_events},
    pulse_registry::{ChannelRegistry, ConnectionManager, ManagerConfig},
};

use crate::engine::EngineSession;

// ── Connected socket ─────────────────────────────────────────────────────────

/// A socket that has completed the handshake. Owned exclusively by the
/// gateway; everything else refers to it by id.
#[derive(Debug)]
pub struct ConnectedSocket {
    pub socket_id: SocketId,
    pub identity: UserIdentity,
    /// Bounded queue of engine-encoded frames drained by the transport
    /// writer. A full queue means the client is too slow to keep.
    pub sender: mpsc::Sender<String>,
    pub connected_at_ms: u64,
    pub last_activity_ms: std::sync::atomic::AtomicU64,
    pub token_fingerprint: String,
    pub remote_addr: String,
    pub user_agent: Option<String>,
    pub is_alive: AtomicBool,
    /// Cancelling this tears the session down (forced disconnect, shutdown,
    /// backpressure).
    pub closer: CancellationToken,
}

impl ConnectedSocket {
    /// Enqueue an already-encoded engine frame. Returns false when the
    /// socket is gone or its queue is full.
    pub fn send_raw(&self, frame: &str) -> bool {
        self.sender.try_send(frame.to_string()).is_ok()
    }

    /// Enqueue a named event with a JSON payload.
    pub fn send_event(&self, event: &str, data: serde_json::Value) -> bool {
        self.send_raw(&SocketPacket::event(event, data).to_engine())
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn idle_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_activity_ms.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn summary(&self) -> SocketSummary {
        SocketSummary {
            socket_id: self.socket_id.clone(),
            user_id: self.identity.user_id,
            connected_at: ms_to_iso(self.connected_at_ms),
        }
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across tasks.
pub struct GatewayState {
    pub config: Config,
    pub verifier: CredentialVerifier,
    pub registry: ChannelRegistry,
    pub connections: ConnectionManager,
    pub health: HealthMonitor,
    /// None when no Prometheus recorder is installed (tests).
    pub metrics_handle: Option<MetricsHandle>,
    /// Sockets that completed the handshake, keyed by socket id.
    pub sockets: DashMap<SocketId, Arc<ConnectedSocket>>,
    /// Live transport sessions, keyed by engine session id.
    pub engine_sessions: DashMap<String, Arc<EngineSession>>,
    pub started_at: Instant,
    pub version: String,
    shutting_down: AtomicBool,
    /// Latest aggregate health status, refreshed by the evaluator task.
    health_status: AtomicU8,
}

impl GatewayState {
    #[must_use]
    pub fn new(config: Config, metrics_handle: Option<MetricsHandle>) -> Arc<Self> {
        let verifier = CredentialVerifier::new(VerifierConfig::from(&config));
        let registry = ChannelRegistry::new(config.limits.max_channel_subscribers);
        let connections = ConnectionManager::new(ManagerConfig::from(&config));
        let health = HealthMonitor::new(Thresholds::from(&config.thresholds));
        Arc::new(Self {
            config,
            verifier,
            registry,
            connections,
            health,
            metrics_handle,
            sockets: DashMap::new(),
            engine_sessions: DashMap::new(),
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            shutting_down: AtomicBool::new(false),
            health_status: AtomicU8::new(0),
        })
    }

    pub fn register_socket(&self, socket: Arc<ConnectedSocket>) {
        self.sockets.insert(socket.socket_id.clone(), socket);
    }

    pub fn remove_socket(&self, socket_id: &str) -> Option<Arc<ConnectedSocket>> {
        self.sockets.remove(socket_id).map(|(_, socket)| socket)
    }

    #[must_use]
    pub fn socket(&self, socket_id: &str) -> Option<Arc<ConnectedSocket>> {
        self.sockets.get(socket_id).map(|s| Arc::clone(&s))
    }

    /// The user's active socket, resolved through the connection manager.
    #[must_use]
    pub fn socket_for_user(&self, user_id: UserId) -> Option<Arc<ConnectedSocket>> {
        let socket_id = self.connections.active_socket(user_id)?;
        self.socket(&socket_id)
    }

    /// Emit `force_disconnect` to a socket and tear it down. Returns whether
    /// a live socket was found.
    pub fn force_disconnect(&self, user_id: UserId, reason: &str) -> bool {
        let Some(socket) = self.socket_for_user(user_id) else {
            return false;
        };
        debug!(socket_id = %socket.socket_id, user_id, reason, "forcing disconnect");
        socket.send_event(
            server_events::FORCE_DISCONNECT,
            serde_json::json!({ "reason": reason }),
        );
        socket.closer.cancel();
        true
    }

    /// Drop a socket that cannot keep up with its outbound queue.
    pub fn drop_for_backpressure(&self, socket: &ConnectedSocket) {
        if socket.is_alive.load(Ordering::Relaxed) {
            debug!(socket_id = %socket.socket_id, "dropping slow consumer");
            metrics::counter!(
                pulse_metrics::conn::CONNECTIONS_DROPPED_TOTAL,
                pulse_metrics::labels::REASON => pulse_protocol::reject_reasons::BACKPRESSURE,
            )
            .increment(1);
            socket.closer.cancel();
        }
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn set_health_status(&self, status: HealthStatus) {
        let value = match status {
            HealthStatus::Healthy => 0,
            HealthStatus::Warning => 1,
            HealthStatus::Critical => 2,
        };
        self.health_status.store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn health_status(&self) -> HealthStatus {
        match self.health_status.load(Ordering::Relaxed) {
            2 => HealthStatus::Critical,
            1 => HealthStatus::Warning,
            _ => HealthStatus::Healthy,
        }
    }
}
