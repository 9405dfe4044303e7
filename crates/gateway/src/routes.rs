//! HTTP/JSON handlers for the RPC surface.

use {
    axum::{
        Json,
        extract::{Path, State},
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response},
    },
    serde::Deserialize,
    tracing::info,
};

use {
    pulse_common::{UserId, capabilities, iso_now},
    pulse_metrics::{HealthStatus, ThresholdUpdate},
    pulse_protocol::{SOCKET_PATH, reject_reasons},
};

use crate::{
    dispatch::{self, BroadcastItem},
    error::{ApiError, FieldError},
    server::AppState,
    state::GatewayState,
};

/// Header carrying the shared upstream secret.
pub const API_KEY_HEADER: &str = "x-websocket-api-key";
/// Header carrying the admin secret.
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

// ── Auth gates ───────────────────────────────────────────────────────────────

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer_token<'a>(headers: &'a HeaderMap) -> Option<&'a str> {
    header_value(headers, header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn has_upstream_secret(state: &GatewayState, headers: &HeaderMap) -> bool {
    header_value(headers, API_KEY_HEADER)
        .is_some_and(|presented| presented == state.config.upstream_api_key)
}

/// Broadcast endpoints accept the upstream shared secret or a bearer
/// credential carrying the broadcast capability.
async fn require_broadcast_auth(
    state: &GatewayState,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    if has_upstream_secret(state, headers) {
        return Ok(());
    }
    if let Some(token) = bearer_token(headers) {
        return match state.verifier.verify(token).await {
            Ok(identity) if identity.has_permission(capabilities::BROADCAST) => Ok(()),
            Ok(_) => Err(ApiError::Forbidden("missing broadcast capability".into())),
            Err(_) => Err(ApiError::Unauthorized),
        };
    }
    Err(ApiError::Unauthorized)
}

/// Admin endpoints accept the upstream secret or the dedicated admin key.
fn require_admin_auth(state: &GatewayState, headers: &HeaderMap) -> Result<(), ApiError> {
    if has_upstream_secret(state, headers) {
        return Ok(());
    }
    if let Some(admin_key) = &state.config.admin_key
        && header_value(headers, ADMIN_KEY_HEADER).is_some_and(|presented| presented == admin_key)
    {
        return Ok(());
    }
    Err(ApiError::Unauthorized)
}

/// Broadcasts are refused while shutting down or critically unhealthy.
fn require_available(state: &GatewayState) -> Result<(), ApiError> {
    if state.is_shutting_down() {
        return Err(ApiError::Unavailable("server is shutting down".into()));
    }
    if state.health_status() == HealthStatus::Critical {
        return Err(ApiError::Unavailable("server is in a critical state".into()));
    }
    Ok(())
}

// ── Service meta ─────────────────────────────────────────────────────────────

/// `GET /` — service descriptor.
pub async fn descriptor(State(app): State<AppState>) -> impl IntoResponse {
    let state = &app.gateway;
    Json(serde_json::json!({
        "name": "pulse",
        "version": state.version,
        "environment": state.config.environment,
        "socket": {
            "path": SOCKET_PATH,
            "transports": ["polling", "websocket"],
        },
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// `GET /api/health` — liveness snapshot; 200 whenever the process serves.
pub async fn health(State(app): State<AppState>) -> impl IntoResponse {
    let state = &app.gateway;
    let report = state.health.evaluate();
    state.set_health_status(report.status);
    Json(serde_json::json!({
        "status": report.status,
        "timestamp": iso_now(),
        "uptime_seconds": report.uptime_seconds,
        "checks": report.checks,
        "alerts": report.alerts,
        "connections": {
            "active": state.health.active_connections(),
            "peak": state.health.peak_connections(),
        },
    }))
}

/// `GET /api/status` — configuration and feature-flag view.
pub async fn status(State(app): State<AppState>) -> impl IntoResponse {
    let state = &app.gateway;
    Json(serde_json::json!({
        "version": state.version,
        "environment": state.config.environment,
        "shutting_down": state.is_shutting_down(),
        "config": state.config,
    }))
}

// ── Metrics & monitoring ─────────────────────────────────────────────────────

/// `GET /api/metrics` and `GET /api/monitoring/metrics`.
pub async fn metrics_snapshot(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.gateway.health.snapshot())
}

/// `GET /api/monitoring/prometheus` — text exposition for scrapers.
pub async fn prometheus(State(app): State<AppState>) -> Response {
    match app.gateway.metrics_handle.as_ref() {
        Some(handle) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "Metrics not enabled".to_string(),
        )
            .into_response(),
    }
}

/// `POST /api/monitoring/reset` — zero counters, clear alerts, flush the
/// credential cache.
pub async fn monitoring_reset(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let state = &app.gateway;
    require_admin_auth(state, &headers)?;
    state.health.reset();
    state.verifier.flush_cache();
    info!("monitoring counters reset");
    Ok(Json(serde_json::json!({ "success": true })))
}

/// `PUT /api/monitoring/thresholds` — partial threshold mutation.
pub async fn update_thresholds(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<ThresholdUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let state = &app.gateway;
    require_admin_auth(state, &headers)?;
    state.health.set_thresholds(update);
    Ok(Json(serde_json::json!({
        "success": true,
        "thresholds": state.health.thresholds(),
    })))
}

// ── Broadcast ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BroadcastBody {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastMultiBody {
    #[serde(default)]
    broadcasts: Vec<BroadcastItem>,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastUserBody {
    #[serde(default)]
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// `POST /api/broadcast` — fan an event out to a channel's subscribers.
pub async fn broadcast(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BroadcastBody>,
) -> Result<impl IntoResponse, ApiError> {
    let state = &app.gateway;
    require_broadcast_auth(state, &headers).await?;
    require_available(state)?;

    let mut details = Vec::new();
    if body.channel.is_empty() {
        details.push(("channel", "channel is required"));
    }
    if body.event.is_empty() {
        details.push(("event", "event is required"));
    }
    if !details.is_empty() {
        return Err(ApiError::Validation(
            details
                .into_iter()
                .map(|(field, message)| FieldError {
                    field,
                    message: message.into(),
                })
                .collect(),
        ));
    }

    let result = dispatch::broadcast(state, &body.channel, &body.event, body.data);
    Ok(Json(serde_json::json!({
        "success": true,
        "recipients": result.recipients,
        "timestamp": iso_now(),
    })))
}

/// `POST /api/broadcast/multi` — batch; items fail independently.
pub async fn broadcast_multi(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BroadcastMultiBody>,
) -> Result<impl IntoResponse, ApiError> {
    let state = &app.gateway;
    require_broadcast_auth(state, &headers).await?;
    require_available(state)?;

    if body.broadcasts.is_empty() {
        return Err(ApiError::validation("broadcasts", "at least one item is required"));
    }
    let results = dispatch::broadcast_multi(state, body.broadcasts);
    Ok(Json(serde_json::json!({
        "success": true,
        "results": results,
        "timestamp": iso_now(),
    })))
}

/// `POST /api/broadcast/user/{id}` — user-targeted delivery.
pub async fn broadcast_user(
    State(app): State<AppState>,
    Path(user_id): Path<UserId>,
    headers: HeaderMap,
    Json(body): Json<BroadcastUserBody>,
) -> Result<impl IntoResponse, ApiError> {
    let state = &app.gateway;
    require_broadcast_auth(state, &headers).await?;
    require_available(state)?;

    if body.event.is_empty() {
        return Err(ApiError::validation("event", "event is required"));
    }
    let result = dispatch::broadcast_to_user(state, user_id, &body.event, body.data);
    Ok(Json(serde_json::json!({
        "success": true,
        "recipients": result.recipients,
        "timestamp": iso_now(),
    })))
}

// ── Channel introspection ────────────────────────────────────────────────────

/// `GET /api/channels/stats`.
pub async fn channel_stats(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.gateway.registry.stats())
}

/// `GET /api/channels/{name}`.
pub async fn channel_info(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    app.gateway
        .registry
        .channel_info(&name)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("channel {name}")))
}

// ── Connection admin ─────────────────────────────────────────────────────────

/// `GET /api/connections/stats`.
pub async fn connection_stats(State(app): State<AppState>) -> impl IntoResponse {
    let state = &app.gateway;
    Json(serde_json::json!({
        "sockets": state.sockets.len(),
        "manager": state.connections.stats(),
    }))
}

/// `POST /api/connections/disconnect/{user_id}` — forced disconnect.
pub async fn force_disconnect(
    State(app): State<AppState>,
    Path(user_id): Path<UserId>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let state = &app.gateway;
    require_admin_auth(state, &headers)?;

    if state.force_disconnect(user_id, reject_reasons::ADMIN) {
        info!(user_id, "connection disconnected by admin");
        Ok(Json(serde_json::json!({
            "success": true,
            "reason": reject_reasons::ADMIN,
        })))
    } else {
        Err(ApiError::NotFound(format!("connection for user {user_id}")))
    }
}

/// `POST /api/connections/clear-all` — admin reset used by the test suite.
pub async fn clear_all_connections(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let state = &app.gateway;
    require_admin_auth(state, &headers)?;

    let mut disconnected = 0usize;
    for entry in state.sockets.iter() {
        entry.send_event(
            pulse_protocol::server_events::FORCE_DISCONNECT,
            serde_json::json!({ "reason": reject_reasons::ADMIN }),
        );
        entry.closer.cancel();
        disconnected += 1;
    }
    state.registry.clear();
    state.connections.clear_all();
    info!(disconnected, "all connections cleared by admin");
    Ok(Json(serde_json::json!({
        "success": true,
        "disconnected": disconnected,
    })))
}

/// `POST /api/connections/throttle/clear/{user_id}`.
pub async fn clear_throttle(
    State(app): State<AppState>,
    Path(user_id): Path<UserId>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let state = &app.gateway;
    require_admin_auth(state, &headers)?;
    state.connections.clear_throttle(user_id);
    Ok(Json(serde_json::json!({ "success": true })))
}

/// `GET /api/connections/{user_id}` — slot introspection.
pub async fn connection_info(
    State(app): State<AppState>,
    Path(user_id): Path<UserId>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let state = &app.gateway;
    require_admin_auth(state, &headers)?;
    state
        .connections
        .info(user_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("connection for user {user_id}")))
}
