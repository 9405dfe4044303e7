//! HTTP request metrics middleware.
//!
//! Feeds both the Prometheus recorder (request counts, durations, in-flight)
//! and the health monitor's aggregates (error rate, response-time summary).

use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};

use pulse_metrics::{counter, gauge, histogram, http as http_metrics, labels};

use crate::server::AppState;

/// Requests slower than this count toward the slow-request counter,
/// matching the health monitor's threshold.
const SLOW_REQUEST_MS: f64 = 1_000.0;

pub async fn http_metrics_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let endpoint = normalize_path(request.uri().path());

    gauge!(http_metrics::REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    let status = response.status();
    let duration = start.elapsed();
    let duration_ms = duration.as_secs_f64() * 1_000.0;

    counter!(
        http_metrics::REQUESTS_TOTAL,
        labels::ENDPOINT => endpoint.clone(),
        labels::METHOD => method.clone(),
        labels::STATUS => status.as_u16().to_string(),
    )
    .increment(1);
    histogram!(
        http_metrics::REQUEST_DURATION_SECONDS,
        labels::ENDPOINT => endpoint.clone(),
        labels::METHOD => method,
    )
    .record(duration.as_secs_f64());
    if duration_ms > SLOW_REQUEST_MS {
        counter!(http_metrics::SLOW_REQUESTS_TOTAL, labels::ENDPOINT => endpoint).increment(1);
    }
    gauge!(http_metrics::REQUESTS_IN_FLIGHT).decrement(1.0);

    state
        .gateway
        .health
        .record_request(duration_ms, status.is_server_error());

    response
}

/// Replace numeric path segments so metric labels stay low-cardinality.
fn normalize_path(path: &str) -> String {
    let normalized = path
        .split('/')
        .map(|segment| {
            let numeric = !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit());
            if numeric { "{id}" } else { segment }
        })
        .collect::<Vec<_>>()
        .join("/");
    if normalized.is_empty() {
        "/".to_string()
    } else {
        normalized
    }
}
