//! Server assembly and lifecycle.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    anyhow::Context,
    axum::{
        Router, middleware,
        routing::{get, post, put},
    },
    tokio::net::TcpListener,
    tower_http::{
        catch_panic::CatchPanicLayer,
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

use {
    pulse_config::Config,
    pulse_metrics::{MetricsRecorderConfig, init_metrics},
    pulse_protocol::{SOCKET_PATH, reject_reasons, server_events},
};

use crate::{engine, metrics_middleware, routes, state::GatewayState, throttle};

/// How often the background health evaluator runs.
const HEALTH_EVAL_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GatewayState>,
    pub request_throttle: Arc<throttle::RequestThrottle>,
}

impl AppState {
    #[must_use]
    pub fn new(gateway: Arc<GatewayState>) -> Self {
        let request_throttle = Arc::new(throttle::RequestThrottle::new(
            &gateway.config.rate_limit,
        ));
        Self {
            gateway,
            request_throttle,
        }
    }
}

/// Build the full gateway router: the socket endpoint, the RPC surface, and
/// the cross-cutting layers (rate limit, metrics, CORS, tracing).
pub fn build_router(app_state: AppState) -> Router {
    let cors = cors_layer(&app_state.gateway.config);

    Router::new()
        .route("/", get(routes::descriptor))
        .route("/api/health", get(routes::health))
        .route("/api/status", get(routes::status))
        .route("/api/metrics", get(routes::metrics_snapshot))
        .route("/api/monitoring/metrics", get(routes::metrics_snapshot))
        .route("/api/monitoring/prometheus", get(routes::prometheus))
        .route("/api/monitoring/reset", post(routes::monitoring_reset))
        .route("/api/monitoring/thresholds", put(routes::update_thresholds))
        .route("/api/broadcast", post(routes::broadcast))
        .route("/api/broadcast/multi", post(routes::broadcast_multi))
        .route("/api/broadcast/user/{id}", post(routes::broadcast_user))
        .route("/api/channels/stats", get(routes::channel_stats))
        .route("/api/channels/{name}", get(routes::channel_info))
        .route("/api/connections/stats", get(routes::connection_stats))
        .route(
            "/api/connections/disconnect/{user_id}",
            post(routes::force_disconnect),
        )
        .route(
            "/api/connections/clear-all",
            post(routes::clear_all_connections),
        )
        .route(
            "/api/connections/throttle/clear/{user_id}",
            post(routes::clear_throttle),
        )
        .route("/api/connections/{user_id}", get(routes::connection_info))
        .route(
            SOCKET_PATH,
            get(engine::engine_get).post(engine::engine_post),
        )
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            throttle::throttle_gate,
        ))
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            metrics_middleware::http_metrics_middleware,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.cors_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<axum::http::HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Start the gateway and serve until a shutdown signal arrives, then drain.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let metrics_handle = match init_metrics(MetricsRecorderConfig::default()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics recorder unavailable; exposition disabled");
            None
        },
    };

    let addr = config.bind_addr();
    let state = GatewayState::new(config, metrics_handle);
    let app_state = AppState::new(Arc::clone(&state));
    let router = build_router(app_state);

    spawn_health_evaluator(Arc::clone(&state));

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, version = %state.version, "pulse gateway listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    drain(&state).await;
    Ok(())
}

/// Periodically refresh the aggregate health status and uptime gauge.
fn spawn_health_evaluator(state: Arc<GatewayState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_EVAL_INTERVAL);
        loop {
            interval.tick().await;
            if state.is_shutting_down() {
                break;
            }
            let report = state.health.evaluate();
            state.set_health_status(report.status);
            metrics::gauge!(pulse_metrics::server::UPTIME_SECONDS)
                .set(state.health.uptime_seconds() as f64);
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// Notify every client, give queues a grace period to flush, then force the
/// stragglers closed. Registry and manager are cleared last.
async fn drain(state: &Arc<GatewayState>) {
    state.begin_shutdown();
    let grace = Duration::from_millis(state.config.shutdown_grace_ms);
    info!(sockets = state.sockets.len(), grace_ms = grace.as_millis() as u64, "draining");

    for entry in state.sockets.iter() {
        entry.send_event(
            server_events::FORCE_DISCONNECT,
            serde_json::json!({ "reason": reject_reasons::SHUTDOWN }),
        );
    }

    let deadline = tokio::time::Instant::now() + grace;
    while !state.sockets.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for entry in state.sockets.iter() {
        entry.closer.cancel();
    }
    for entry in state.engine_sessions.iter() {
        entry.closer.cancel();
    }
    // Let the session drivers run their cleanup before the final sweep.
    tokio::time::sleep(Duration::from_millis(250)).await;
    state.registry.clear();
    state.connections.clear_all();
    info!("drained");
}
