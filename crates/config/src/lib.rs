//! Environment-driven gateway configuration.
//!
//! Every recognized variable has a default except the two shared secrets
//! (`JWT_SECRET`, `UPSTREAM_API_KEY`), which must be present for the process
//! to start.

use serde::Serialize;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingRequired(&'static str),
    #[error("invalid value '{value}' for {name}")]
    Invalid { name: &'static str, value: String },
}

// ── Sub-configs ──────────────────────────────────────────────────────────────

/// Application-level heartbeat timers.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatConfig {
    /// Server keepalive cadence.
    pub ping_interval_ms: u64,
    /// Inbound-silence window before a socket is closed as idle.
    pub ping_timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 15_000,
            ping_timeout_ms: 30_000,
        }
    }
}

/// Handshake attempt throttling.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleConfig {
    pub window_ms: u64,
    pub max_attempts: u32,
    pub cooldown_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window_ms: 2_000,
            max_attempts: 3,
            cooldown_ms: 30_000,
        }
    }
}

/// Per-IP rate limiting on the RPC surface.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    /// Budget for the public scope; the other scopes derive from their own
    /// defaults unless overridden here.
    pub max_requests: usize,
    pub monitoring_max: usize,
    pub admin_max: usize,
    pub broadcast_max: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 100,
            monitoring_max: 60,
            admin_max: 20,
            broadcast_max: 300,
        }
    }
}

/// Process resource bounds.
#[derive(Debug, Clone, Serialize)]
pub struct LimitsConfig {
    /// Maximum concurrently connected sockets.
    pub max_connections: usize,
    /// Per-socket outbound queue depth; overflow drops the socket.
    pub outbound_queue_frames: usize,
    /// Optional cap on subscribers per channel.
    pub max_channel_subscribers: Option<usize>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            outbound_queue_frames: 1_000,
            max_channel_subscribers: None,
        }
    }
}

/// Health threshold pair.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WarnCritical {
    pub warn: f64,
    pub critical: f64,
}

/// Warn/critical thresholds for the health predicates.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdConfig {
    pub connections: WarnCritical,
    pub response_time_ms: WarnCritical,
    pub error_rate: WarnCritical,
    pub memory: WarnCritical,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            connections: WarnCritical {
                warn: 1_000.0,
                critical: 5_000.0,
            },
            response_time_ms: WarnCritical {
                warn: 500.0,
                critical: 1_000.0,
            },
            error_rate: WarnCritical {
                warn: 0.05,
                critical: 0.10,
            },
            memory: WarnCritical {
                warn: 0.80,
                critical: 0.90,
            },
        }
    }
}

// ── Config ───────────────────────────────────────────────────────────────────

/// Full gateway configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub upstream_api_url: String,
    #[serde(skip_serializing)]
    pub upstream_api_key: String,
    #[serde(skip_serializing)]
    pub jwt_secret: String,
    pub jwt_expires_in_secs: u64,
    pub cors_origins: Vec<String>,
    #[serde(skip_serializing)]
    pub admin_key: Option<String>,
    /// Accept the credential from a query parameter (off by default; the
    /// auth payload and the Authorization header are always accepted).
    pub allow_query_token: bool,
    pub handshake_timeout_ms: u64,
    pub upstream_timeout_ms: u64,
    pub auth_cache_ttl_ms: u64,
    pub shutdown_grace_ms: u64,
    pub environment: String,
    pub heartbeat: HeartbeatConfig,
    pub throttle: ThrottleConfig,
    pub rate_limit: RateLimitConfig,
    pub limits: LimitsConfig,
    pub thresholds: ThresholdConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            upstream_api_url: "http://localhost:8000".into(),
            upstream_api_key: String::new(),
            jwt_secret: String::new(),
            jwt_expires_in_secs: 3_600,
            cors_origins: Vec::new(),
            admin_key: None,
            allow_query_token: false,
            handshake_timeout_ms: 5_000,
            upstream_timeout_ms: 10_000,
            auth_cache_ttl_ms: 30_000,
            shutdown_grace_ms: 10_000,
            environment: "development".into(),
            heartbeat: HeartbeatConfig::default(),
            throttle: ThrottleConfig::default(),
            rate_limit: RateLimitConfig::default(),
            limits: LimitsConfig::default(),
            thresholds: ThresholdConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Missing optional variables fall back to defaults; missing secrets and
    /// unparseable values are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(host) = var("HOST") {
            cfg.host = host;
        }
        cfg.port = parse_var("PORT", cfg.port)?;
        if let Some(url) = var("UPSTREAM_API_URL") {
            cfg.upstream_api_url = url.trim_end_matches('/').to_string();
        }
        cfg.upstream_api_key =
            var("UPSTREAM_API_KEY").ok_or(ConfigError::MissingRequired("UPSTREAM_API_KEY"))?;
        cfg.jwt_secret = var("JWT_SECRET").ok_or(ConfigError::MissingRequired("JWT_SECRET"))?;
        cfg.jwt_expires_in_secs = parse_var("JWT_EXPIRES_IN", cfg.jwt_expires_in_secs)?;

        if let Some(origins) = var("CORS_ORIGIN") {
            cfg.cors_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        cfg.admin_key = var("ADMIN_KEY");
        cfg.allow_query_token = parse_var("ALLOW_QUERY_TOKEN", cfg.allow_query_token)?;
        if let Some(env_name) = var("APP_ENV") {
            cfg.environment = env_name;
        }

        cfg.handshake_timeout_ms = parse_var("HANDSHAKE_TIMEOUT_MS", cfg.handshake_timeout_ms)?;
        cfg.upstream_timeout_ms = parse_var("UPSTREAM_TIMEOUT_MS", cfg.upstream_timeout_ms)?;
        cfg.auth_cache_ttl_ms = parse_var("AUTH_CACHE_TTL_MS", cfg.auth_cache_ttl_ms)?;
        cfg.shutdown_grace_ms = parse_var("SHUTDOWN_GRACE_MS", cfg.shutdown_grace_ms)?;

        cfg.heartbeat.ping_interval_ms =
            parse_var("WS_PING_INTERVAL", cfg.heartbeat.ping_interval_ms)?;
        cfg.heartbeat.ping_timeout_ms =
            parse_var("WS_PING_TIMEOUT", cfg.heartbeat.ping_timeout_ms)?;

        cfg.throttle.window_ms =
            parse_var("HANDSHAKE_THROTTLE_WINDOW_MS", cfg.throttle.window_ms)?;
        cfg.throttle.max_attempts =
            parse_var("HANDSHAKE_THROTTLE_MAX", cfg.throttle.max_attempts)?;
        cfg.throttle.cooldown_ms =
            parse_var("HANDSHAKE_THROTTLE_COOLDOWN_MS", cfg.throttle.cooldown_ms)?;

        cfg.rate_limit.window_ms = parse_var("RATE_LIMIT_WINDOW_MS", cfg.rate_limit.window_ms)?;
        cfg.rate_limit.max_requests =
            parse_var("RATE_LIMIT_MAX_REQUESTS", cfg.rate_limit.max_requests)?;

        cfg.limits.max_connections = parse_var("MAX_CONNECTIONS", cfg.limits.max_connections)?;
        cfg.limits.outbound_queue_frames =
            parse_var("OUTBOUND_QUEUE_FRAMES", cfg.limits.outbound_queue_frames)?;
        if let Some(raw) = var("MAX_CHANNEL_SUBSCRIBERS") {
            let parsed = raw.parse().map_err(|_| ConfigError::Invalid {
                name: "MAX_CHANNEL_SUBSCRIBERS",
                value: raw,
            })?;
            cfg.limits.max_channel_subscribers = Some(parsed);
        }

        cfg.thresholds.connections.warn =
            parse_var("THRESHOLD_CONNECTIONS_WARN", cfg.thresholds.connections.warn)?;
        cfg.thresholds.connections.critical = parse_var(
            "THRESHOLD_CONNECTIONS_CRITICAL",
            cfg.thresholds.connections.critical,
        )?;
        cfg.thresholds.response_time_ms.warn = parse_var(
            "THRESHOLD_RESPONSE_TIME_WARN",
            cfg.thresholds.response_time_ms.warn,
        )?;
        cfg.thresholds.response_time_ms.critical = parse_var(
            "THRESHOLD_RESPONSE_TIME_CRITICAL",
            cfg.thresholds.response_time_ms.critical,
        )?;
        cfg.thresholds.error_rate.warn =
            parse_var("THRESHOLD_ERROR_RATE_WARN", cfg.thresholds.error_rate.warn)?;
        cfg.thresholds.error_rate.critical = parse_var(
            "THRESHOLD_ERROR_RATE_CRITICAL",
            cfg.thresholds.error_rate.critical,
        )?;
        cfg.thresholds.memory.warn =
            parse_var("THRESHOLD_MEMORY_WARN", cfg.thresholds.memory.warn)?;
        cfg.thresholds.memory.critical = parse_var(
            "THRESHOLD_MEMORY_CRITICAL",
            cfg.thresholds.memory.critical,
        )?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_api_key.trim().is_empty() {
            return Err(ConfigError::MissingRequired("UPSTREAM_API_KEY"));
        }
        if self.jwt_secret.trim().is_empty() {
            return Err(ConfigError::MissingRequired("JWT_SECRET"));
        }
        if self.heartbeat.ping_timeout_ms <= self.heartbeat.ping_interval_ms {
            tracing::warn!(
                interval_ms = self.heartbeat.ping_interval_ms,
                timeout_ms = self.heartbeat.ping_timeout_ms,
                "ping timeout is not larger than ping interval; idle sockets may be dropped early"
            );
        }
        Ok(())
    }

    /// Address the listener binds to.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

// set_var/remove_var are unsafe in edition 2024; the lock keeps them sound.
#[allow(clippy::unwrap_used, clippy::expect_used, unsafe_code)]
#[cfg(test)]
mod tests {
    use super::*;

    // Env mutation is process-global; serialize the tests that touch it.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_env(vars: &[(&str, &str)], f: impl FnOnce()) {
        let _guard = ENV_LOCK.lock().unwrap();
        for (k, v) in vars {
            unsafe { std::env::set_var(k, v) };
        }
        f();
        for (k, _) in vars {
            unsafe { std::env::remove_var(k) };
        }
    }

    #[test]
    fn missing_secrets_are_fatal() {
        with_env(&[], || {
            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::MissingRequired("UPSTREAM_API_KEY")));
        });
    }

    #[test]
    fn defaults_apply() {
        with_env(
            &[("UPSTREAM_API_KEY", "secret"), ("JWT_SECRET", "jwt")],
            || {
                let cfg = Config::from_env().unwrap();
                assert_eq!(cfg.port, 3000);
                assert_eq!(cfg.heartbeat.ping_interval_ms, 15_000);
                assert_eq!(cfg.throttle.max_attempts, 3);
                assert_eq!(cfg.rate_limit.broadcast_max, 300);
                assert!(!cfg.allow_query_token);
                assert_eq!(cfg.thresholds.error_rate.warn, 0.05);
            },
        );
    }

    #[test]
    fn overrides_apply() {
        with_env(
            &[
                ("UPSTREAM_API_KEY", "secret"),
                ("JWT_SECRET", "jwt"),
                ("PORT", "9100"),
                ("WS_PING_INTERVAL", "5000"),
                ("CORS_ORIGIN", "https://a.example, https://b.example"),
                ("MAX_CHANNEL_SUBSCRIBERS", "250"),
                ("THRESHOLD_MEMORY_CRITICAL", "0.95"),
                ("ALLOW_QUERY_TOKEN", "true"),
            ],
            || {
                let cfg = Config::from_env().unwrap();
                assert_eq!(cfg.port, 9100);
                assert_eq!(cfg.heartbeat.ping_interval_ms, 5_000);
                assert_eq!(cfg.cors_origins.len(), 2);
                assert_eq!(cfg.cors_origins[1], "https://b.example");
                assert_eq!(cfg.limits.max_channel_subscribers, Some(250));
                assert_eq!(cfg.thresholds.memory.critical, 0.95);
                assert!(cfg.allow_query_token);
            },
        );
    }

    #[test]
    fn bad_numeric_value_is_an_error() {
        with_env(
            &[
                ("UPSTREAM_API_KEY", "secret"),
                ("JWT_SECRET", "jwt"),
                ("PORT", "not-a-port"),
            ],
            || {
                let err = Config::from_env().unwrap_err();
                assert!(matches!(err, ConfigError::Invalid { name: "PORT", .. }));
            },
        );
    }

    #[test]
    fn upstream_url_trailing_slash_is_trimmed() {
        with_env(
            &[
                ("UPSTREAM_API_KEY", "secret"),
                ("JWT_SECRET", "jwt"),
                ("UPSTREAM_API_URL", "https://app.example.com/"),
            ],
            || {
                let cfg = Config::from_env().unwrap();
                assert_eq!(cfg.upstream_api_url, "https://app.example.com");
            },
        );
    }

    #[test]
    fn secrets_never_serialize() {
        let mut cfg = Config::default();
        cfg.jwt_secret = "top-secret".into();
        cfg.upstream_api_key = "upstream-secret".into();
        cfg.admin_key = Some("admin-secret".into());
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("top-secret"));
        assert!(!json.contains("upstream-secret"));
        assert!(!json.contains("admin-secret"));
    }
}
