//! Metric name and label definitions.
//!
//! All names used with the `metrics` facade live here so the exposition
//! output stays consistent and documented in one place.

/// Connection metrics
pub mod conn {
    /// Total sockets that completed a handshake
    pub const CONNECTIONS_TOTAL: &str = "pulse_connections_total";
    /// Currently connected sockets
    pub const CONNECTIONS_ACTIVE: &str = "pulse_connections_active";
    /// High-water mark of concurrently connected sockets
    pub const CONNECTIONS_PEAK: &str = "pulse_connections_peak";
    /// Handshakes that failed (auth, duplicate, throttle, timeout)
    pub const CONNECTIONS_FAILED_TOTAL: &str = "pulse_connections_failed_total";
    /// Sockets dropped by the server, by reason
    pub const CONNECTIONS_DROPPED_TOTAL: &str = "pulse_connections_dropped_total";
}

/// Credential verification metrics
pub mod auth {
    /// Verification attempts by method and outcome
    pub const VERIFICATIONS_TOTAL: &str = "pulse_auth_verifications_total";
}

/// Broadcast metrics
pub mod broadcast {
    /// Broadcast RPCs dispatched
    pub const EVENTS_TOTAL: &str = "pulse_broadcast_events_total";
    /// Per-subscriber deliveries enqueued
    pub const DELIVERIES_TOTAL: &str = "pulse_broadcast_deliveries_total";
    /// Deliveries dropped (closed socket or full queue)
    pub const FAILURES_TOTAL: &str = "pulse_broadcast_failures_total";
}

/// Subscription metrics
pub mod subscription {
    /// Subscriptions ever recorded
    pub const SUBSCRIBES_TOTAL: &str = "pulse_subscribes_total";
    /// Currently active subscriptions
    pub const SUBSCRIPTIONS_ACTIVE: &str = "pulse_subscriptions_active";
}

/// HTTP metrics for the RPC surface
pub mod http {
    /// Total requests by endpoint, method, and status
    pub const REQUESTS_TOTAL: &str = "pulse_http_requests_total";
    /// Request durations in seconds
    pub const REQUEST_DURATION_SECONDS: &str = "pulse_http_request_duration_seconds";
    /// Requests slower than the slow threshold
    pub const SLOW_REQUESTS_TOTAL: &str = "pulse_http_slow_requests_total";
    /// Currently in-flight requests
    pub const REQUESTS_IN_FLIGHT: &str = "pulse_http_requests_in_flight";
}

/// Process-level metrics
pub mod server {
    /// Seconds since startup
    pub const UPTIME_SECONDS: &str = "pulse_uptime_seconds";
}

/// Common label keys
pub mod labels {
    pub const ROLE: &str = "role";
    pub const METHOD: &str = "method";
    pub const OUTCOME: &str = "outcome";
    pub const ENDPOINT: &str = "endpoint";
    pub const STATUS: &str = "status";
    pub const REASON: &str = "reason";
}
