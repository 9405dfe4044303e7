//! Readable metric aggregates, health predicates, and alerting.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    dashmap::DashMap,
    serde::{Deserialize, Serialize},
    tracing::{error, warn},
};

/// Rolling response-time window size.
const RESPONSE_WINDOW: usize = 500;
/// Minimum gap between two alerts of the same kind.
const ALERT_COOLDOWN: Duration = Duration::from_secs(60);
/// Alert history bound.
const MAX_ALERTS: usize = 100;
/// Requests slower than this count as slow.
const SLOW_REQUEST_MS: f64 = 1_000.0;

// ── Status & thresholds ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

/// One warn/critical pair. Higher observed values are worse.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Threshold {
    pub warn: f64,
    pub critical: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Thresholds {
    pub connections: Threshold,
    pub response_time_ms: Threshold,
    pub error_rate: Threshold,
    pub memory: Threshold,
}

impl From<&pulse_config::ThresholdConfig> for Thresholds {
    fn from(cfg: &pulse_config::ThresholdConfig) -> Self {
        let conv = |wc: &pulse_config::WarnCritical| Threshold {
            warn: wc.warn,
            critical: wc.critical,
        };
        Self {
            connections: conv(&cfg.connections),
            response_time_ms: conv(&cfg.response_time_ms),
            error_rate: conv(&cfg.error_rate),
            memory: conv(&cfg.memory),
        }
    }
}

/// Partial threshold mutation accepted from the admin endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThresholdUpdate {
    pub connections: Option<Threshold>,
    pub response_time_ms: Option<Threshold>,
    pub error_rate: Option<Threshold>,
    pub memory: Option<Threshold>,
}

// ── Reports ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub current: f64,
    pub warn: f64,
    pub critical: f64,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub severity: Severity,
    pub kind: String,
    pub message: String,
    pub raised_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    pub checks: Vec<HealthCheck>,
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResponseSummary {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub ratio: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MethodCounts {
    pub success: u64,
    pub failure: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub connections: ConnectionsReport,
    pub authentications: AuthReport,
    pub broadcast: BroadcastReport,
    pub subscriptions: SubscriptionsReport,
    pub http: HttpReport,
    pub memory: MemoryUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionsReport {
    pub total: u64,
    pub active: u64,
    pub peak: u64,
    pub failed: u64,
    pub by_role: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthReport {
    pub success: u64,
    pub failure: u64,
    pub by_method: HashMap<String, MethodCounts>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastReport {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionsReport {
    pub total: u64,
    pub active: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpReport {
    pub total: u64,
    pub errors: u64,
    pub slow: u64,
    pub response_time: ResponseSummary,
}

// ── Monitor ──────────────────────────────────────────────────────────────────

/// Owns every counter the health predicates and JSON snapshots read.
///
/// Counters are updated with relaxed atomics from the component that emits
/// the event; nothing here blocks a hot path.
pub struct HealthMonitor {
    started_at: Instant,

    conn_total: AtomicU64,
    conn_active: AtomicU64,
    conn_peak: AtomicU64,
    conn_failed: AtomicU64,
    conn_by_role: DashMap<String, u64>,

    auth_success: AtomicU64,
    auth_failure: AtomicU64,
    auth_by_method: DashMap<String, MethodCounts>,

    broadcast_sent: AtomicU64,
    broadcast_delivered: AtomicU64,
    broadcast_failed: AtomicU64,

    subs_total: AtomicU64,
    subs_active: AtomicU64,

    http_total: AtomicU64,
    http_errors: AtomicU64,
    http_slow: AtomicU64,
    response_times: Mutex<VecDeque<f64>>,

    thresholds: RwLock<Thresholds>,
    alerts: Mutex<Vec<Alert>>,
    alert_seq: AtomicU64,
    last_raised: Mutex<HashMap<String, Instant>>,

    system: Mutex<sysinfo::System>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            started_at: Instant::now(),
            conn_total: AtomicU64::new(0),
            conn_active: AtomicU64::new(0),
            conn_peak: AtomicU64::new(0),
            conn_failed: AtomicU64::new(0),
            conn_by_role: DashMap::new(),
            auth_success: AtomicU64::new(0),
            auth_failure: AtomicU64::new(0),
            auth_by_method: DashMap::new(),
            broadcast_sent: AtomicU64::new(0),
            broadcast_delivered: AtomicU64::new(0),
            broadcast_failed: AtomicU64::new(0),
            subs_total: AtomicU64::new(0),
            subs_active: AtomicU64::new(0),
            http_total: AtomicU64::new(0),
            http_errors: AtomicU64::new(0),
            http_slow: AtomicU64::new(0),
            response_times: Mutex::new(VecDeque::with_capacity(RESPONSE_WINDOW)),
            thresholds: RwLock::new(thresholds),
            alerts: Mutex::new(Vec::new()),
            alert_seq: AtomicU64::new(0),
            last_raised: Mutex::new(HashMap::new()),
            system: Mutex::new(sysinfo::System::new()),
        }
    }

    // ── Recording ────────────────────────────────────────────────────────

    pub fn record_connect(&self, role: &str) {
        self.conn_total.fetch_add(1, Ordering::Relaxed);
        let active = self.conn_active.fetch_add(1, Ordering::Relaxed) + 1;
        self.conn_peak.fetch_max(active, Ordering::Relaxed);
        *self.conn_by_role.entry(role.to_string()).or_default() += 1;
    }

    pub fn record_disconnect(&self) {
        let _ = self
            .conn_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn record_connection_failed(&self) {
        self.conn_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth(&self, method: &str, success: bool) {
        if success {
            self.auth_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.auth_failure.fetch_add(1, Ordering::Relaxed);
        }
        let mut counts = self.auth_by_method.entry(method.to_string()).or_default();
        if success {
            counts.success += 1;
        } else {
            counts.failure += 1;
        }
    }

    pub fn record_broadcast(&self, recipients: usize) {
        self.broadcast_sent.fetch_add(1, Ordering::Relaxed);
        self.broadcast_delivered
            .fetch_add(recipients as u64, Ordering::Relaxed);
    }

    pub fn record_broadcast_failure(&self) {
        self.broadcast_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscribe(&self) {
        self.subs_total.fetch_add(1, Ordering::Relaxed);
        self.subs_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsubscribe(&self, count: usize) {
        let _ = self
            .subs_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(count as u64))
            });
    }

    pub fn record_request(&self, duration_ms: f64, is_error: bool) {
        self.http_total.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.http_errors.fetch_add(1, Ordering::Relaxed);
        }
        if duration_ms > SLOW_REQUEST_MS {
            self.http_slow.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut window) = self.response_times.lock() {
            if window.len() == RESPONSE_WINDOW {
                window.pop_front();
            }
            window.push_back(duration_ms);
        }
    }

    // ── Reading ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn active_connections(&self) -> u64 {
        self.conn_active.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_connections(&self) -> u64 {
        self.conn_peak.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    #[must_use]
    pub fn response_summary(&self) -> ResponseSummary {
        let Ok(window) = self.response_times.lock() else {
            return ResponseSummary::default();
        };
        if window.is_empty() {
            return ResponseSummary::default();
        }
        let mut sorted: Vec<f64> = window.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let sum: f64 = sorted.iter().sum();
        let idx = ((sorted.len() as f64 * 0.95).ceil() as usize)
            .saturating_sub(1)
            .min(sorted.len() - 1);
        ResponseSummary {
            avg_ms: sum / sorted.len() as f64,
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            p95_ms: sorted[idx],
            samples: sorted.len(),
        }
    }

    #[must_use]
    pub fn memory_usage(&self) -> MemoryUsage {
        let Ok(mut system) = self.system.lock() else {
            return MemoryUsage::default();
        };
        system.refresh_memory();
        let used = system.used_memory();
        let total = system.total_memory();
        MemoryUsage {
            used_bytes: used,
            total_bytes: total,
            ratio: if total == 0 {
                0.0
            } else {
                used as f64 / total as f64
            },
        }
    }

    #[must_use]
    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
            .read()
            .map(|t| t.clone())
            .unwrap_or_else(|_| Thresholds::from(&pulse_config::ThresholdConfig::default()))
    }

    pub fn set_thresholds(&self, update: ThresholdUpdate) {
        if let Ok(mut thresholds) = self.thresholds.write() {
            if let Some(t) = update.connections {
                thresholds.connections = t;
            }
            if let Some(t) = update.response_time_ms {
                thresholds.response_time_ms = t;
            }
            if let Some(t) = update.error_rate {
                thresholds.error_rate = t;
            }
            if let Some(t) = update.memory {
                thresholds.memory = t;
            }
        }
    }

    /// Evaluate every health predicate, maintaining the alert list as
    /// thresholds are crossed or cleared.
    #[must_use]
    pub fn evaluate(&self) -> HealthReport {
        let thresholds = self.thresholds();
        let http_total = self.http_total.load(Ordering::Relaxed);
        let http_errors = self.http_errors.load(Ordering::Relaxed);
        let error_rate = if http_total == 0 {
            0.0
        } else {
            http_errors as f64 / http_total as f64
        };

        let checks = vec![
            check(
                "connections",
                self.conn_active.load(Ordering::Relaxed) as f64,
                thresholds.connections,
            ),
            check(
                "response_time",
                self.response_summary().avg_ms,
                thresholds.response_time_ms,
            ),
            check("error_rate", error_rate, thresholds.error_rate),
            check("memory", self.memory_usage().ratio, thresholds.memory),
        ];

        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        for c in &checks {
            match c.status {
                HealthStatus::Healthy => self.resolve_alert(c.name),
                HealthStatus::Warning => self.raise_alert(
                    c.name,
                    Severity::Warn,
                    format!("{} at {:.2} (warn {:.2})", c.name, c.current, c.warn),
                ),
                HealthStatus::Critical => self.raise_alert(
                    c.name,
                    Severity::Critical,
                    format!("{} at {:.2} (critical {:.2})", c.name, c.current, c.critical),
                ),
            }
        }

        HealthReport {
            status,
            uptime_seconds: self.uptime_seconds(),
            checks,
            alerts: self.active_alerts(),
        }
    }

    /// Raise an alert outside the predicate set (invariant violations).
    pub fn raise(&self, kind: &str, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Critical | Severity::Error => error!(kind, %message, "alert raised"),
            _ => warn!(kind, %message, "alert raised"),
        }
        self.raise_alert(kind, severity, message);
    }

    fn raise_alert(&self, kind: &str, severity: Severity, message: String) {
        let Ok(mut alerts) = self.alerts.lock() else {
            return;
        };
        // Escalate an existing unresolved alert in place.
        if let Some(existing) = alerts
            .iter_mut()
            .find(|a| a.kind == kind && a.resolved_at.is_none())
        {
            if severity > existing.severity {
                existing.severity = severity;
                existing.message = message;
            }
            return;
        }
        // Dedup by kind within the cooldown.
        if let Ok(mut last) = self.last_raised.lock() {
            let now = Instant::now();
            if last
                .get(kind)
                .is_some_and(|at| now.duration_since(*at) < ALERT_COOLDOWN)
            {
                return;
            }
            last.insert(kind.to_string(), now);
        }
        let id = self.alert_seq.fetch_add(1, Ordering::Relaxed) + 1;
        alerts.push(Alert {
            id: format!("alert-{id}"),
            severity,
            kind: kind.to_string(),
            message,
            raised_at: pulse_common::iso_now(),
            resolved_at: None,
        });
        if alerts.len() > MAX_ALERTS {
            let excess = alerts.len() - MAX_ALERTS;
            alerts.drain(..excess);
        }
    }

    fn resolve_alert(&self, kind: &str) {
        if let Ok(mut alerts) = self.alerts.lock() {
            for alert in alerts
                .iter_mut()
                .filter(|a| a.kind == kind && a.resolved_at.is_none())
            {
                alert.resolved_at = Some(pulse_common::iso_now());
            }
        }
    }

    #[must_use]
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .map(|alerts| {
                alerts
                    .iter()
                    .filter(|a| a.resolved_at.is_none())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn all_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsReport {
        MetricsReport {
            timestamp: pulse_common::iso_now(),
            uptime_seconds: self.uptime_seconds(),
            connections: ConnectionsReport {
                total: self.conn_total.load(Ordering::Relaxed),
                active: self.conn_active.load(Ordering::Relaxed),
                peak: self.conn_peak.load(Ordering::Relaxed),
                failed: self.conn_failed.load(Ordering::Relaxed),
                by_role: self
                    .conn_by_role
                    .iter()
                    .map(|e| (e.key().clone(), *e.value()))
                    .collect(),
            },
            authentications: AuthReport {
                success: self.auth_success.load(Ordering::Relaxed),
                failure: self.auth_failure.load(Ordering::Relaxed),
                by_method: self
                    .auth_by_method
                    .iter()
                    .map(|e| (e.key().clone(), *e.value()))
                    .collect(),
            },
            broadcast: BroadcastReport {
                sent: self.broadcast_sent.load(Ordering::Relaxed),
                delivered: self.broadcast_delivered.load(Ordering::Relaxed),
                failed: self.broadcast_failed.load(Ordering::Relaxed),
            },
            subscriptions: SubscriptionsReport {
                total: self.subs_total.load(Ordering::Relaxed),
                active: self.subs_active.load(Ordering::Relaxed),
            },
            http: HttpReport {
                total: self.http_total.load(Ordering::Relaxed),
                errors: self.http_errors.load(Ordering::Relaxed),
                slow: self.http_slow.load(Ordering::Relaxed),
                response_time: self.response_summary(),
            },
            memory: self.memory_usage(),
        }
    }

    /// Zero every counter and forget alerts. Gauges that reflect live state
    /// (`active`) are preserved; `peak` restarts from the current active
    /// count.
    pub fn reset(&self) {
        self.conn_total.store(0, Ordering::Relaxed);
        self.conn_peak
            .store(self.conn_active.load(Ordering::Relaxed), Ordering::Relaxed);
        self.conn_failed.store(0, Ordering::Relaxed);
        self.conn_by_role.clear();
        self.auth_success.store(0, Ordering::Relaxed);
        self.auth_failure.store(0, Ordering::Relaxed);
        self.auth_by_method.clear();
        self.broadcast_sent.store(0, Ordering::Relaxed);
        self.broadcast_delivered.store(0, Ordering::Relaxed);
        self.broadcast_failed.store(0, Ordering::Relaxed);
        self.subs_total
            .store(self.subs_active.load(Ordering::Relaxed), Ordering::Relaxed);
        self.http_total.store(0, Ordering::Relaxed);
        self.http_errors.store(0, Ordering::Relaxed);
        self.http_slow.store(0, Ordering::Relaxed);
        if let Ok(mut window) = self.response_times.lock() {
            window.clear();
        }
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.clear();
        }
        if let Ok(mut last) = self.last_raised.lock() {
            last.clear();
        }
    }
}

fn check(name: &'static str, current: f64, threshold: Threshold) -> HealthCheck {
    let status = if current >= threshold.critical {
        HealthStatus::Critical
    } else if current >= threshold.warn {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    };
    HealthCheck {
        name,
        current,
        warn: threshold.warn,
        critical: threshold.critical,
        status,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        let mut thresholds = Thresholds::from(&pulse_config::ThresholdConfig::default());
        // Host memory is not under test; keep the predicate out of reach.
        thresholds.memory = Threshold {
            warn: 2.0,
            critical: 3.0,
        };
        HealthMonitor::new(thresholds)
    }

    #[test]
    fn connection_counters_track_peak() {
        let m = monitor();
        m.record_connect("member");
        m.record_connect("member");
        m.record_connect("admin");
        m.record_disconnect();

        let report = m.snapshot();
        assert_eq!(report.connections.total, 3);
        assert_eq!(report.connections.active, 2);
        assert_eq!(report.connections.peak, 3);
        assert_eq!(report.connections.by_role["member"], 2);
        assert_eq!(report.connections.by_role["admin"], 1);
        assert!(report.connections.peak >= report.connections.active);
    }

    #[test]
    fn disconnect_never_underflows() {
        let m = monitor();
        m.record_disconnect();
        assert_eq!(m.active_connections(), 0);
    }

    #[test]
    fn totals_are_monotonic() {
        let m = monitor();
        let mut last_total = 0;
        for i in 0..50 {
            m.record_connect("member");
            if i % 3 == 0 {
                m.record_disconnect();
            }
            let report = m.snapshot();
            assert!(report.connections.total >= last_total);
            assert!(report.connections.peak >= report.connections.active);
            last_total = report.connections.total;
        }
    }

    #[test]
    fn auth_counters_by_method() {
        let m = monitor();
        m.record_auth("signed", true);
        m.record_auth("signed", false);
        m.record_auth("opaque", true);

        let report = m.snapshot();
        assert_eq!(report.authentications.success, 2);
        assert_eq!(report.authentications.failure, 1);
        assert_eq!(report.authentications.by_method["signed"].failure, 1);
        assert_eq!(report.authentications.by_method["opaque"].success, 1);
    }

    #[test]
    fn response_summary_percentiles() {
        let m = monitor();
        for ms in 1..=100 {
            m.record_request(ms as f64, false);
        }
        let summary = m.response_summary();
        assert_eq!(summary.samples, 100);
        assert_eq!(summary.min_ms, 1.0);
        assert_eq!(summary.max_ms, 100.0);
        assert_eq!(summary.p95_ms, 95.0);
        assert!((summary.avg_ms - 50.5).abs() < f64::EPSILON);
    }

    #[test]
    fn slow_requests_counted() {
        let m = monitor();
        m.record_request(50.0, false);
        m.record_request(1_500.0, false);
        assert_eq!(m.snapshot().http.slow, 1);
    }

    #[test]
    fn healthy_when_idle() {
        let m = monitor();
        let report = m.evaluate();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.alerts.is_empty());
    }

    #[test]
    fn error_rate_crossing_raises_and_resolves() {
        let m = monitor();
        // 3 errors out of 10 requests: 30% error rate, past critical (10%).
        for i in 0..10 {
            m.record_request(10.0, i < 3);
        }
        let report = m.evaluate();
        assert_eq!(report.status, HealthStatus::Critical);
        let alert = report
            .alerts
            .iter()
            .find(|a| a.kind == "error_rate")
            .expect("error_rate alert");
        assert_eq!(alert.severity, Severity::Critical);

        // Re-evaluating does not duplicate the alert.
        let report = m.evaluate();
        assert_eq!(
            report.alerts.iter().filter(|a| a.kind == "error_rate").count(),
            1
        );

        // Enough successes bring the rate back under warn; alert resolves.
        for _ in 0..90 {
            m.record_request(10.0, false);
        }
        let report = m.evaluate();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.alerts.is_empty());
        assert!(
            m.all_alerts()
                .iter()
                .any(|a| a.kind == "error_rate" && a.resolved_at.is_some())
        );
    }

    #[test]
    fn warning_escalates_to_critical_in_place() {
        let m = monitor();
        m.set_thresholds(ThresholdUpdate {
            connections: Some(Threshold {
                warn: 1.0,
                critical: 3.0,
            }),
            ..Default::default()
        });
        m.record_connect("member");
        let report = m.evaluate();
        assert_eq!(report.status, HealthStatus::Warning);

        m.record_connect("member");
        m.record_connect("member");
        let report = m.evaluate();
        assert_eq!(report.status, HealthStatus::Critical);
        let alerts: Vec<_> = report
            .alerts
            .iter()
            .filter(|a| a.kind == "connections")
            .collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[test]
    fn threshold_update_is_partial() {
        let m = monitor();
        m.set_thresholds(ThresholdUpdate {
            error_rate: Some(Threshold {
                warn: 0.2,
                critical: 0.4,
            }),
            ..Default::default()
        });
        let t = m.thresholds();
        assert_eq!(t.error_rate.warn, 0.2);
        // Untouched values keep their defaults.
        assert_eq!(t.connections.warn, 1_000.0);
    }

    #[test]
    fn manual_raise_records_alert() {
        let m = monitor();
        m.raise("registry_invariant", Severity::Critical, "orphaned socket");
        let alerts = m.active_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "registry_invariant");
    }

    #[test]
    fn reset_clears_counters_but_keeps_live_gauges() {
        let m = monitor();
        m.record_connect("member");
        m.record_connect("member");
        m.record_disconnect();
        m.record_request(10.0, true);
        m.raise("x", Severity::Warn, "y");

        m.reset();
        let report = m.snapshot();
        assert_eq!(report.connections.total, 0);
        assert_eq!(report.connections.active, 1);
        assert_eq!(report.connections.peak, 1);
        assert_eq!(report.http.total, 0);
        assert!(m.all_alerts().is_empty());
    }

    #[test]
    fn broadcast_and_subscription_counters() {
        let m = monitor();
        m.record_subscribe();
        m.record_subscribe();
        m.record_broadcast(2);
        m.record_broadcast_failure();
        m.record_unsubscribe(2);

        let report = m.snapshot();
        assert_eq!(report.subscriptions.total, 2);
        assert_eq!(report.subscriptions.active, 0);
        assert_eq!(report.broadcast.sent, 1);
        assert_eq!(report.broadcast.delivered, 2);
        assert_eq!(report.broadcast.failed, 1);
    }
}
