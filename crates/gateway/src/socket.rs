//! Per-session lifecycle: handshake, inbound event routing, heartbeat, and
//! disconnect cleanup.
//!
//! One driver task runs per transport session, independent of which
//! transport (polling or websocket) is currently attached.

use std::{
    sync::{Arc, atomic::Ordering},
    time::{Duration, Instant},
};

use {
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use {
    pulse_auth::{AuthError, CredentialKind, authorize, fingerprint},
    pulse_common::{UserIdentity, iso_now, now_ms},
    pulse_metrics::Severity,
    pulse_protocol::{
        EnginePacket, SocketPacket, client_events, reject_reasons, server_events,
    },
    pulse_registry::{ClaimOutcome, RegistryError},
};

use crate::{
    engine::EngineSession,
    state::{ConnectedSocket, GatewayState},
};

/// Credential sources captured at the HTTP layer, in precedence order after
/// the in-band auth payload.
#[derive(Debug, Clone, Default)]
pub struct HandshakeContext {
    pub header_token: Option<String>,
    pub query_token: Option<String>,
    pub remote_addr: String,
    pub user_agent: Option<String>,
}

enum CloseReason {
    ClientGone,
    ClientDisconnect,
    IdleTimeout,
    Forced,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ClientGone => "transport_closed",
            Self::ClientDisconnect => "client_disconnect",
            Self::IdleTimeout => reject_reasons::IDLE_TIMEOUT,
            Self::Forced => "forced",
        }
    }
}

/// Drive one session from handshake to cleanup.
pub async fn drive(
    state: Arc<GatewayState>,
    session: Arc<EngineSession>,
    mut inbound: mpsc::Receiver<String>,
    ctx: HandshakeContext,
) {
    debug!(sid = %session.sid, remote = %ctx.remote_addr, "session opened");

    let socket = match handshake(&state, &session, &mut inbound, &ctx).await {
        Some(socket) => socket,
        None => {
            // Rejection frames are already queued; let the transport flush.
            state.engine_sessions.remove(&session.sid);
            session.closer.cancel();
            return;
        },
    };

    let reason = event_loop(&state, &socket, &mut inbound).await;
    cleanup(&state, &session, &socket, &reason);
}

// ── Handshake ────────────────────────────────────────────────────────────────

async fn handshake(
    state: &Arc<GatewayState>,
    session: &Arc<EngineSession>,
    inbound: &mut mpsc::Receiver<String>,
    ctx: &HandshakeContext,
) -> Option<Arc<ConnectedSocket>> {
    let started = Instant::now();
    let deadline = Duration::from_millis(state.config.handshake_timeout_ms);

    let auth_payload =
        match tokio::time::timeout(deadline, wait_for_connect(session, inbound)).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(sid = %session.sid, "transport closed before handshake");
                return None;
            },
            Err(_) => {
                debug!(sid = %session.sid, "handshake timeout");
                state.health.record_connection_failed();
                return None;
            },
        };

    // Credential precedence: auth payload, then header, then query (gated).
    let token = auth_payload
        .as_ref()
        .and_then(|v| v.get("token"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| ctx.header_token.clone())
        .or_else(|| {
            state
                .config
                .allow_query_token
                .then(|| ctx.query_token.clone())
                .flatten()
        });

    let Some(token) = token else {
        reject(
            state,
            session,
            reject_reasons::AUTH_FAILED,
            "no credential presented",
            None,
        );
        state.health.record_auth("none", false);
        return None;
    };

    let method = match CredentialKind::detect(token.trim()) {
        Ok(CredentialKind::Signed) => "signed",
        Ok(CredentialKind::Opaque) => "opaque",
        Err(_) => "invalid",
    };

    let remaining = deadline.saturating_sub(started.elapsed());
    let verified = match tokio::time::timeout(remaining, state.verifier.verify(&token)).await {
        Ok(result) => result,
        Err(_) => Err(AuthError::UpstreamUnavailable("verification timed out".into())),
    };

    let identity = match verified {
        Ok(identity) => identity,
        Err(e) => {
            debug!(sid = %session.sid, error = %e, "credential rejected");
            state.health.record_auth(method, false);
            metrics::counter!(
                pulse_metrics::auth::VERIFICATIONS_TOTAL,
                pulse_metrics::labels::METHOD => method,
                pulse_metrics::labels::OUTCOME => "failure",
            )
            .increment(1);
            reject(
                state,
                session,
                reject_reasons::AUTH_FAILED,
                e.to_string(),
                None,
            );
            return None;
        },
    };

    state.health.record_auth(method, true);
    metrics::counter!(
        pulse_metrics::auth::VERIFICATIONS_TOTAL,
        pulse_metrics::labels::METHOD => method,
        pulse_metrics::labels::OUTCOME => "success",
    )
    .increment(1);

    if state.is_shutting_down() {
        reject(
            state,
            session,
            reject_reasons::SHUTDOWN,
            "server is shutting down",
            None,
        );
        return None;
    }

    if state.sockets.len() >= state.config.limits.max_connections {
        warn!(limit = state.config.limits.max_connections, "connection limit reached");
        reject(
            state,
            session,
            reject_reasons::SERVER_LIMIT,
            "connection limit reached",
            None,
        );
        return None;
    }

    match state.connections.try_claim(identity.user_id, &session.sid) {
        ClaimOutcome::Claimed => {},
        ClaimOutcome::Duplicate(existing) => {
            debug!(
                sid = %session.sid,
                user_id = identity.user_id,
                existing = %existing.socket_id,
                "duplicate connection rejected"
            );
            reject(
                state,
                session,
                reject_reasons::DUPLICATE_CONNECTION,
                "another connection is active for this user",
                Some(serde_json::json!({
                    "socket_id": existing.socket_id,
                    "connected_at": existing.connected_at,
                })),
            );
            return None;
        },
        ClaimOutcome::Throttled => {
            debug!(sid = %session.sid, user_id = identity.user_id, "throttled");
            reject(
                state,
                session,
                reject_reasons::THROTTLED,
                "too many connection attempts",
                None,
            );
            return None;
        },
    }

    if !state.connections.activate(identity.user_id, &session.sid) {
        // The pending claim was superseded between claim and activation.
        state.health.raise(
            "connection_slot",
            Severity::Error,
            format!("claim for user {} lost before activation", identity.user_id),
        );
        reject(
            state,
            session,
            reject_reasons::DUPLICATE_CONNECTION,
            "connection superseded",
            None,
        );
        return None;
    }

    let socket = attach(state, session, ctx, identity, &token);
    Some(socket)
}

/// Build the socket record, register it, and emit the welcome events.
fn attach(
    state: &Arc<GatewayState>,
    session: &Arc<EngineSession>,
    ctx: &HandshakeContext,
    identity: UserIdentity,
    token: &str,
) -> Arc<ConnectedSocket> {
    let now = now_ms();
    let socket = Arc::new(ConnectedSocket {
        socket_id: session.sid.clone(),
        identity,
        sender: session.to_client.clone(),
        connected_at_ms: now,
        last_activity_ms: std::sync::atomic::AtomicU64::new(now),
        token_fingerprint: fingerprint(token),
        remote_addr: ctx.remote_addr.clone(),
        user_agent: ctx.user_agent.clone(),
        is_alive: std::sync::atomic::AtomicBool::new(true),
        closer: session.closer.clone(),
    });
    state.register_socket(Arc::clone(&socket));

    let user_id = socket.identity.user_id;
    let role = socket.identity.role;

    // Every user implicitly owns their private channel.
    let private = format!("private-user.{user_id}");
    match state.registry.subscribe(&socket.socket_id, user_id, &private) {
        Ok(true) => {
            state.health.record_subscribe();
            metrics::gauge!(pulse_metrics::subscription::SUBSCRIPTIONS_ACTIVE).increment(1.0);
            metrics::counter!(pulse_metrics::subscription::SUBSCRIBES_TOTAL).increment(1);
        },
        Ok(false) => {},
        Err(e) => warn!(error = %e, "implicit private subscription failed"),
    }

    // Accept the namespace, then greet.
    socket.send_raw(
        &SocketPacket::Connect(Some(serde_json::json!({ "sid": session.sid })))
            .to_engine(),
    );
    socket.send_event(
        server_events::CONNECTED,
        serde_json::json!({
            "socket_id": socket.socket_id,
            "user_id": user_id,
            "role": role.as_str(),
            "server_time": iso_now(),
        }),
    );

    state.health.record_connect(role.as_str());
    metrics::counter!(
        pulse_metrics::conn::CONNECTIONS_TOTAL,
        pulse_metrics::labels::ROLE => role.as_str(),
    )
    .increment(1);
    metrics::gauge!(pulse_metrics::conn::CONNECTIONS_ACTIVE).increment(1.0);
    metrics::gauge!(pulse_metrics::conn::CONNECTIONS_PEAK)
        .set(state.health.peak_connections() as f64);

    info!(
        socket_id = %socket.socket_id,
        user_id,
        role = %role,
        remote = %socket.remote_addr,
        "socket connected"
    );
    socket
}

/// Wait for the Socket.IO connect packet; everything else is ignored until
/// the namespace is joined.
async fn wait_for_connect(
    session: &Arc<EngineSession>,
    inbound: &mut mpsc::Receiver<String>,
) -> Option<Option<serde_json::Value>> {
    loop {
        let raw = inbound.recv().await?;
        match EnginePacket::parse(&raw) {
            Ok(EnginePacket::Message(data)) => match SocketPacket::parse(&data) {
                Ok(SocketPacket::Connect(payload)) => return Some(payload),
                Ok(other) => {
                    debug!(sid = %session.sid, packet = ?other, "packet before connect");
                },
                Err(e) => {
                    warn!(sid = %session.sid, error = %e, "malformed packet before connect");
                },
            },
            Ok(EnginePacket::Close) => return None,
            Ok(_) => {},
            Err(e) => {
                warn!(sid = %session.sid, error = %e, "malformed engine packet");
            },
        }
    }
}

/// Queue the namespace accept plus a `connection_rejected` event, then let
/// the caller close the session.
fn reject(
    state: &Arc<GatewayState>,
    session: &Arc<EngineSession>,
    reason: &str,
    message: impl Into<String>,
    existing: Option<serde_json::Value>,
) {
    state.health.record_connection_failed();
    metrics::counter!(
        pulse_metrics::conn::CONNECTIONS_FAILED_TOTAL,
        pulse_metrics::labels::REASON => reason.to_string(),
    )
    .increment(1);

    let mut payload = serde_json::json!({
        "reason": reason,
        "message": message.into(),
    });
    if let Some(existing) = existing
        && let Some(map) = payload.as_object_mut()
    {
        map.insert("existingConnection".into(), existing);
    }

    let _ = session.to_client.try_send(
        SocketPacket::Connect(Some(serde_json::json!({ "sid": session.sid }))).to_engine(),
    );
    let _ = session.to_client.try_send(
        SocketPacket::event(server_events::CONNECTION_REJECTED, payload).to_engine(),
    );
}

// ── Event loop ───────────────────────────────────────────────────────────────

async fn event_loop(
    state: &Arc<GatewayState>,
    socket: &Arc<ConnectedSocket>,
    inbound: &mut mpsc::Receiver<String>,
) -> CloseReason {
    let ping_interval = Duration::from_millis(state.config.heartbeat.ping_interval_ms);
    let ping_timeout = state.config.heartbeat.ping_timeout_ms;
    let mut keepalive = tokio::time::interval(ping_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = socket.closer.cancelled() => {
                return CloseReason::Forced;
            },
            _ = keepalive.tick() => {
                if socket.idle_ms() > ping_timeout {
                    debug!(socket_id = %socket.socket_id, "idle timeout");
                    return CloseReason::IdleTimeout;
                }
                if !socket.send_raw(&EnginePacket::Ping(None).encode()) {
                    state.drop_for_backpressure(socket);
                    return CloseReason::Forced;
                }
            },
            raw = inbound.recv() => {
                let Some(raw) = raw else {
                    return CloseReason::ClientGone;
                };
                socket.touch();
                match EnginePacket::parse(&raw) {
                    Ok(EnginePacket::Message(data)) => {
                        match SocketPacket::parse(&data) {
                            Ok(SocketPacket::Event { name, data, .. }) => {
                                handle_event(state, socket, &name, data);
                            },
                            Ok(SocketPacket::Disconnect) => {
                                return CloseReason::ClientDisconnect;
                            },
                            Ok(other) => {
                                debug!(socket_id = %socket.socket_id, packet = ?other, "ignoring packet");
                            },
                            Err(e) => {
                                warn!(socket_id = %socket.socket_id, error = %e, "malformed packet");
                            },
                        }
                    },
                    // Client-initiated ping (legacy polling clients).
                    Ok(EnginePacket::Ping(data)) => {
                        socket.send_raw(&EnginePacket::Pong(data).encode());
                    },
                    Ok(EnginePacket::Pong(_)) => {},
                    Ok(EnginePacket::Close) => {
                        return CloseReason::ClientDisconnect;
                    },
                    Ok(_) => {},
                    Err(e) => {
                        warn!(socket_id = %socket.socket_id, error = %e, "malformed engine packet");
                    },
                }
            },
        }
    }
}

fn handle_event(
    state: &Arc<GatewayState>,
    socket: &Arc<ConnectedSocket>,
    name: &str,
    data: serde_json::Value,
) {
    match name {
        client_events::SUBSCRIBE => handle_subscribe(state, socket, &data),
        client_events::UNSUBSCRIBE => handle_unsubscribe(state, socket, &data),
        client_events::PING => {
            socket.send_event(
                server_events::PONG,
                serde_json::json!({
                    "timestamp": data.get("timestamp").cloned().unwrap_or(serde_json::Value::Null),
                    "server_time": now_ms(),
                }),
            );
        },
        // Pure activity signals; `touch` already happened in the loop.
        client_events::USER_ACTIVITY | client_events::NOTIFICATION_READ => {},
        other => {
            warn!(socket_id = %socket.socket_id, event = other, "unknown client event");
        },
    }
}

fn handle_subscribe(
    state: &Arc<GatewayState>,
    socket: &Arc<ConnectedSocket>,
    data: &serde_json::Value,
) {
    let Some(channel) = data.get("channel").and_then(|v| v.as_str()) else {
        socket.send_event(
            server_events::SUBSCRIPTION_ERROR,
            serde_json::json!({ "channel": serde_json::Value::Null, "reason": "invalid_channel" }),
        );
        return;
    };

    if !authorize(&socket.identity, channel) {
        debug!(
            socket_id = %socket.socket_id,
            user_id = socket.identity.user_id,
            channel,
            "subscription denied"
        );
        socket.send_event(
            server_events::SUBSCRIPTION_ERROR,
            serde_json::json!({ "channel": channel, "reason": reject_reasons::FORBIDDEN }),
        );
        return;
    }

    match state
        .registry
        .subscribe(&socket.socket_id, socket.identity.user_id, channel)
    {
        Ok(newly_added) => {
            if newly_added {
                state.health.record_subscribe();
                metrics::counter!(pulse_metrics::subscription::SUBSCRIBES_TOTAL).increment(1);
                metrics::gauge!(pulse_metrics::subscription::SUBSCRIPTIONS_ACTIVE).increment(1.0);
            }
            socket.send_event(
                server_events::SUBSCRIBED,
                serde_json::json!({ "channel": channel }),
            );
        },
        Err(RegistryError::ChannelFull { .. }) => {
            socket.send_event(
                server_events::SUBSCRIPTION_ERROR,
                serde_json::json!({ "channel": channel, "reason": "channel_full" }),
            );
        },
    }
}

fn handle_unsubscribe(
    state: &Arc<GatewayState>,
    socket: &Arc<ConnectedSocket>,
    data: &serde_json::Value,
) {
    let Some(channel) = data.get("channel").and_then(|v| v.as_str()) else {
        return;
    };
    if state
        .registry
        .unsubscribe(&socket.socket_id, socket.identity.user_id, channel)
    {
        state.health.record_unsubscribe(1);
        metrics::gauge!(pulse_metrics::subscription::SUBSCRIPTIONS_ACTIVE).decrement(1.0);
    }
    socket.send_event(
        server_events::UNSUBSCRIBED,
        serde_json::json!({ "channel": channel }),
    );
}

// ── Cleanup ──────────────────────────────────────────────────────────────────

/// The single place a socket's life ends: mark dead, clear subscriptions,
/// release the user slot, update counters, and drop the session.
fn cleanup(
    state: &Arc<GatewayState>,
    session: &Arc<EngineSession>,
    socket: &Arc<ConnectedSocket>,
    reason: &CloseReason,
) {
    if socket.is_alive.swap(false, Ordering::SeqCst) {
        let user_id = socket.identity.user_id;
        let removed = state.registry.unsubscribe_all(&socket.socket_id, user_id);
        if !removed.is_empty() {
            state.health.record_unsubscribe(removed.len());
            metrics::gauge!(pulse_metrics::subscription::SUBSCRIPTIONS_ACTIVE)
                .decrement(removed.len() as f64);
        }
        state.connections.release(user_id, &socket.socket_id);
        state.remove_socket(&socket.socket_id);
        state.health.record_disconnect();
        metrics::gauge!(pulse_metrics::conn::CONNECTIONS_ACTIVE).decrement(1.0);

        info!(
            socket_id = %socket.socket_id,
            user_id,
            reason = reason.as_str(),
            duration_ms = now_ms().saturating_sub(socket.connected_at_ms),
            "socket disconnected"
        );
    }
    state.engine_sessions.remove(&session.sid);
    session.closer.cancel();
}
