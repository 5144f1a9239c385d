//! Observability infrastructure for the pusher
//!
//! Provides:
//! - Prometheus self-metrics (cycle latency, container counts, push errors)
//! - Structured JSON logging of lifecycle events with tracing

use prometheus::{register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for cycle latency (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PusherMetricsInner> = OnceLock::new();

struct PusherMetricsInner {
    cycle_latency_seconds: Histogram,
    cycles_total: IntCounter,
    cycles_failed: IntCounter,
    containers_seen: IntGauge,
    containers_counted: IntGauge,
    unit_failures: IntCounter,
    points_pushed: IntCounter,
    emit_errors: IntCounter,
    counter_resets: IntCounter,
    partial_core_events: IntCounter,
}

impl PusherMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "falcon_pusher_cycle_latency_seconds",
                "Time spent on one full collect-and-push cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            cycles_total: register_int_counter!(
                "falcon_pusher_cycles_total",
                "Collection cycles started"
            )
            .expect("Failed to register cycles_total"),

            cycles_failed: register_int_counter!(
                "falcon_pusher_cycles_failed_total",
                "Cycles abandoned because the container listing failed"
            )
            .expect("Failed to register cycles_failed"),

            containers_seen: register_int_gauge!(
                "falcon_pusher_containers_seen",
                "Containers launched in the last cycle"
            )
            .expect("Failed to register containers_seen"),

            containers_counted: register_int_gauge!(
                "falcon_pusher_containers_counted",
                "Countable containers reported in the last cycle"
            )
            .expect("Failed to register containers_counted"),

            unit_failures: register_int_counter!(
                "falcon_pusher_unit_failures_total",
                "Per-container units that were skipped or failed"
            )
            .expect("Failed to register unit_failures"),

            points_pushed: register_int_counter!(
                "falcon_pusher_points_pushed_total",
                "Metric points accepted by the agent"
            )
            .expect("Failed to register points_pushed"),

            emit_errors: register_int_counter!(
                "falcon_pusher_emit_errors_total",
                "Metric points the agent did not accept"
            )
            .expect("Failed to register emit_errors"),

            counter_resets: register_int_counter!(
                "falcon_pusher_counter_resets_total",
                "Cumulative counters observed going backwards"
            )
            .expect("Failed to register counter_resets"),

            partial_core_events: register_int_counter!(
                "falcon_pusher_partial_core_events_total",
                "Containers whose per-core data was truncated"
            )
            .expect("Failed to register partial_core_events"),
        }
    }
}

/// Pusher metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct PusherMetrics {
    _private: (),
}

impl Default for PusherMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PusherMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PusherMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PusherMetricsInner {
        GLOBAL_METRICS.get_or_init(PusherMetricsInner::new)
    }

    pub fn observe_cycle(&self, elapsed: Duration, launched: usize, counted: usize) {
        let inner = self.inner();
        inner.cycle_latency_seconds.observe(elapsed.as_secs_f64());
        inner.cycles_total.inc();
        inner.containers_seen.set(launched as i64);
        inner.containers_counted.set(counted as i64);
    }

    pub fn inc_cycles_failed(&self) {
        self.inner().cycles_total.inc();
        self.inner().cycles_failed.inc();
    }

    pub fn inc_unit_failures(&self) {
        self.inner().unit_failures.inc();
    }

    pub fn inc_points_pushed(&self) {
        self.inner().points_pushed.inc();
    }

    pub fn inc_emit_errors(&self) {
        self.inner().emit_errors.inc();
    }

    pub fn inc_counter_resets(&self) {
        self.inner().counter_resets.inc();
    }

    pub fn inc_partial_core_events(&self) {
        self.inner().partial_core_events.inc();
    }
}

/// Structured logger for pusher lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    hostname: String,
}

impl StructuredLogger {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    pub fn log_startup(&self, version: &str, interval_secs: u64, host_memory: u64) {
        info!(
            event = "pusher_started",
            host = %self.hostname,
            version = %version,
            interval_secs = interval_secs,
            host_memory_bytes = host_memory,
            "Metrics pusher started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "pusher_shutdown",
            host = %self.hostname,
            reason = %reason,
            "Metrics pusher shutting down"
        );
    }

    /// Summary line written after every completed cycle
    pub fn log_cycle(
        &self,
        launched: usize,
        failed: usize,
        counted: usize,
        emit_failures: usize,
        elapsed: Duration,
    ) {
        if failed > 0 || emit_failures > 0 {
            warn!(
                event = "cycle_complete",
                host = %self.hostname,
                launched = launched,
                failed = failed,
                counted = counted,
                emit_failures = emit_failures,
                elapsed_ms = elapsed.as_millis() as u64,
                "Cycle completed with errors"
            );
        } else {
            info!(
                event = "cycle_complete",
                host = %self.hostname,
                launched = launched,
                counted = counted,
                elapsed_ms = elapsed.as_millis() as u64,
                "Cycle completed"
            );
        }
    }

    pub fn log_cycle_aborted(&self, error: &dyn std::fmt::Display) {
        warn!(
            event = "cycle_aborted",
            host = %self.hostname,
            error = %error,
            "Container listing failed, skipping cycle"
        );
    }
}
