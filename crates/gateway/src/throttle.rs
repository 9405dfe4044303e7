//! Per-IP sliding-window rate limiting for the RPC surface.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    axum::{
        extract::{ConnectInfo, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        middleware::Next,
        response::{IntoResponse, Json, Response},
    },
    dashmap::{DashMap, mapref::entry::Entry},
};

use crate::server::AppState;

const CLEANUP_EVERY_REQUESTS: u64 = 512;

#[derive(Clone)]
pub struct RequestThrottle {
    limits: ThrottleLimits,
    buckets: Arc<DashMap<ThrottleKey, WindowState>>,
    requests_seen: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ThrottleScope {
    /// Broadcast endpoints used by the authenticated upstream.
    Broadcast,
    /// Monitoring and metrics reads.
    Monitoring,
    /// Connection admin.
    Admin,
    /// Everything else on the RPC surface.
    Public,
}

impl ThrottleScope {
    fn from_path(path: &str) -> Option<Self> {
        if path.starts_with(pulse_protocol::SOCKET_PATH) {
            // Socket traffic is disciplined by the connection manager.
            return None;
        }
        if path.starts_with("/api/broadcast") {
            return Some(Self::Broadcast);
        }
        if path.starts_with("/api/monitoring") {
            return Some(Self::Monitoring);
        }
        if path.starts_with("/api/connections") {
            return Some(Self::Admin);
        }
        Some(Self::Public)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ThrottleKey {
    ip: IpAddr,
    scope: ThrottleScope,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    started_at: Instant,
    count: usize,
}

#[derive(Debug, Clone, Copy)]
struct RateLimit {
    max_requests: usize,
    window: Duration,
}

#[derive(Debug, Clone, Copy)]
struct ThrottleLimits {
    broadcast: RateLimit,
    monitoring: RateLimit,
    admin: RateLimit,
    public: RateLimit,
}

impl From<&pulse_config::RateLimitConfig> for ThrottleLimits {
    fn from(cfg: &pulse_config::RateLimitConfig) -> Self {
        let window = Duration::from_millis(cfg.window_ms);
        Self {
            broadcast: RateLimit {
                max_requests: cfg.broadcast_max,
                window,
            },
            monitoring: RateLimit {
                max_requests: cfg.monitoring_max,
                window,
            },
            admin: RateLimit {
                max_requests: cfg.admin_max,
                window,
            },
            public: RateLimit {
                max_requests: cfg.max_requests,
                window,
            },
        }
    }
}

/// Outcome of a throttle check, with everything the response headers need.
#[derive(Debug, Clone, Copy)]
struct ThrottleDecision {
    allowed: bool,
    limit: usize,
    remaining: usize,
    /// Seconds until the window resets.
    reset_after: u64,
}

impl RequestThrottle {
    #[must_use]
    pub fn new(cfg: &pulse_config::RateLimitConfig) -> Self {
        Self {
            limits: ThrottleLimits::from(cfg),
            buckets: Arc::new(DashMap::new()),
            requests_seen: Arc::new(AtomicU64::new(0)),
        }
    }

    fn limit_for(&self, scope: ThrottleScope) -> RateLimit {
        match scope {
            ThrottleScope::Broadcast => self.limits.broadcast,
            ThrottleScope::Monitoring => self.limits.monitoring,
            ThrottleScope::Admin => self.limits.admin,
            ThrottleScope::Public => self.limits.public,
        }
    }

    fn check(&self, ip: IpAddr, scope: ThrottleScope) -> ThrottleDecision {
        self.check_at(ip, scope, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, scope: ThrottleScope, now: Instant) -> ThrottleDecision {
        let limit = self.limit_for(scope);
        let key = ThrottleKey { ip, scope };

        let decision = match self.buckets.entry(key) {
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                let elapsed = now.duration_since(state.started_at);
                if elapsed >= limit.window {
                    state.started_at = now;
                    state.count = 1;
                    ThrottleDecision {
                        allowed: true,
                        limit: limit.max_requests,
                        remaining: limit.max_requests.saturating_sub(1),
                        reset_after: limit.window.as_secs(),
                    }
                } else {
                    let reset_after = limit.window.saturating_sub(elapsed).as_secs().max(1);
                    if state.count < limit.max_requests {
                        state.count += 1;
                        ThrottleDecision {
                            allowed: true,
                            limit: limit.max_requests,
                            remaining: limit.max_requests - state.count,
                            reset_after,
                        }
                    } else {
                        ThrottleDecision {
                            allowed: false,
                            limit: limit.max_requests,
                            remaining: 0,
                            reset_after,
                        }
                    }
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(WindowState {
                    started_at: now,
                    count: 1,
                });
                ThrottleDecision {
                    allowed: true,
                    limit: limit.max_requests,
                    remaining: limit.max_requests.saturating_sub(1),
                    reset_after: limit.window.as_secs(),
                }
            },
        };

        self.cleanup_if_needed(now);
        decision
    }

    fn cleanup_if_needed(&self, now: Instant) {
        let seen = self.requests_seen.fetch_add(1, Ordering::Relaxed) + 1;
        if !seen.is_multiple_of(CLEANUP_EVERY_REQUESTS) {
            return;
        }
        let stale_after = self.max_window().saturating_mul(3);
        self.buckets
            .retain(|_, state| now.duration_since(state.started_at) <= stale_after);
    }

    fn max_window(&self) -> Duration {
        [
            self.limits.broadcast.window,
            self.limits.monitoring.window,
            self.limits.admin.window,
            self.limits.public.window,
        ]
        .into_iter()
        .max()
        .unwrap_or(Duration::from_secs(60))
    }
}

fn apply_headers(headers: &mut HeaderMap, decision: &ThrottleDecision) {
    let pairs = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_after.to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

pub async fn throttle_gate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    let Some(scope) = ThrottleScope::from_path(&path) else {
        return next.run(request).await;
    };

    let client_ip = resolve_client_ip(request.headers(), addr);
    let decision = state.request_throttle.check(client_ip, scope);

    if !decision.allowed {
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "success": false,
                "error": "too many requests",
                "retry_after_seconds": decision.reset_after,
            })),
        )
            .into_response();
        if let Ok(value) = decision.reset_after.to_string().parse() {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, value);
        }
        apply_headers(response.headers_mut(), &decision);
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &decision);
    response
}

fn resolve_client_ip(headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
    let xff = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    if let Some(xff) = xff
        && let Some(ip) = xff.split(',').find_map(|candidate| parse_ip(candidate.trim()))
    {
        return ip;
    }
    let xri = headers.get("x-real-ip").and_then(|v| v.to_str().ok());
    if let Some(xri) = xri
        && let Some(ip) = parse_ip(xri.trim())
    {
        return ip;
    }
    addr.ip()
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    if value.is_empty() {
        return None;
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    None
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: usize, window_secs: u64) -> pulse_config::RateLimitConfig {
        pulse_config::RateLimitConfig {
            window_ms: window_secs * 1_000,
            max_requests: max,
            monitoring_max: max,
            admin_max: max,
            broadcast_max: max,
        }
    }

    #[test]
    fn classify_paths() {
        assert_eq!(
            ThrottleScope::from_path("/api/broadcast"),
            Some(ThrottleScope::Broadcast)
        );
        assert_eq!(
            ThrottleScope::from_path("/api/broadcast/user/42"),
            Some(ThrottleScope::Broadcast)
        );
        assert_eq!(
            ThrottleScope::from_path("/api/monitoring/prometheus"),
            Some(ThrottleScope::Monitoring)
        );
        assert_eq!(
            ThrottleScope::from_path("/api/connections/disconnect/1"),
            Some(ThrottleScope::Admin)
        );
        assert_eq!(ThrottleScope::from_path("/api/health"), Some(ThrottleScope::Public));
        assert_eq!(ThrottleScope::from_path("/"), Some(ThrottleScope::Public));
        assert_eq!(ThrottleScope::from_path("/socket.io/"), None);
    }

    #[test]
    fn window_limits_requests() {
        let throttle = RequestThrottle::new(&limits(2, 10));
        let ip = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        let now = Instant::now();

        let first = throttle.check_at(ip, ThrottleScope::Public, now);
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        let second = throttle.check_at(ip, ThrottleScope::Public, now);
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let third = throttle.check_at(ip, ThrottleScope::Public, now);
        assert!(!third.allowed);
        assert!(third.reset_after >= 1);

        // A fresh window readmits.
        let later = throttle.check_at(ip, ThrottleScope::Public, now + Duration::from_secs(11));
        assert!(later.allowed);
    }

    #[test]
    fn scopes_are_independent() {
        let throttle = RequestThrottle::new(&limits(1, 10));
        let ip = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        let now = Instant::now();

        assert!(throttle.check_at(ip, ThrottleScope::Public, now).allowed);
        assert!(!throttle.check_at(ip, ThrottleScope::Public, now).allowed);
        // The broadcast budget is untouched.
        assert!(throttle.check_at(ip, ThrottleScope::Broadcast, now).allowed);
    }

    #[test]
    fn ips_are_independent() {
        let throttle = RequestThrottle::new(&limits(1, 10));
        let now = Instant::now();
        let a = IpAddr::V4(std::net::Ipv4Addr::new(203, 0, 113, 1));
        let b = IpAddr::V4(std::net::Ipv4Addr::new(203, 0, 113, 2));

        assert!(throttle.check_at(a, ThrottleScope::Public, now).allowed);
        assert!(!throttle.check_at(a, ThrottleScope::Public, now).allowed);
        assert!(throttle.check_at(b, ThrottleScope::Public, now).allowed);
    }

    #[test]
    fn forwarded_ip_uses_first_xff_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.1, 198.51.100.9"),
        );
        let fallback: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert_eq!(
            resolve_client_ip(&headers, fallback),
            IpAddr::V4(std::net::Ipv4Addr::new(203, 0, 113, 1))
        );
    }
}
