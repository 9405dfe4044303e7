//! Metrics collection and health evaluation for the pulse gateway.
//!
//! Two complementary views:
//! - the `metrics` facade feeds the Prometheus exposition endpoint (install
//!   the recorder once at startup via [`init_metrics`]);
//! - [`HealthMonitor`] keeps readable aggregates for the JSON snapshots, the
//!   threshold-driven health predicates, and the alert list.

mod definitions;
mod health;
mod recorder;

pub use {
    definitions::*,
    health::{
        Alert, AuthReport, BroadcastReport, ConnectionsReport, HealthCheck, HealthMonitor,
        HealthReport, HealthStatus, HttpReport, MemoryUsage, MethodCounts, MetricsReport,
        ResponseSummary, Severity, SubscriptionsReport, Threshold, Thresholds, ThresholdUpdate,
    },
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
