//! Per-container fan-out for one collection cycle
//!
//! Every container with an id gets its own tokio task. The cycle waits on a
//! [`WaitGroup`] until each launched task has reported back, then flushes
//! the container count. A failing task never cancels its siblings.

use super::rate::{compute_rate, RateAnomaly, RateInputs, RateResult};
use super::MetadataSource;
use crate::emitter::{MetricSink, PointBuilder};
use crate::error::{CollectorError, Result};
use crate::models::{ContainerRecord, CounterType, MetricPoint};
use crate::observability::PusherMetrics;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, warn};

/// Tag and endpoint settings shared by every unit of a cycle
#[derive(Debug, Clone)]
pub struct FanOutConfig {
    /// Label that must be present for a container to be reported
    pub orchestrator_label: String,
    /// Tag key under which the orchestrator label value is reported
    pub orchestrator_tag: String,
    /// Containers carrying this label are not counted in `container.num`
    pub not_count_label: String,
    /// Static `k=v,k=v` tags prepended to every container point
    pub extra_tags: String,
    /// Push step in seconds, equal to the cycle interval
    pub step: u64,
    /// Endpoint of the aggregate `container.num` point
    pub hostname: String,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            orchestrator_label: "dcos-marathon-id".to_string(),
            orchestrator_tag: "marathon_id".to_string(),
            not_count_label: "dcos-container".to_string(),
            extra_tags: String::new(),
            step: 10,
            hostname: String::new(),
        }
    }
}

impl FanOutConfig {
    /// Tag string for a container's points
    pub fn container_tags(&self, orchestrator_id: &str) -> String {
        let own = format!("{}={}", self.orchestrator_tag, orchestrator_id);
        if self.extra_tags.is_empty() {
            own
        } else {
            format!("{},{}", self.extra_tags, own)
        }
    }
}

/// Blocks until every launched unit has reported back
pub struct WaitGroup<T> {
    tasks: JoinSet<T>,
    launched: usize,
}

impl<T: Send + 'static> WaitGroup<T> {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            launched: 0,
        }
    }

    /// Spawn one unit onto the runtime
    pub fn launch<F>(&mut self, unit: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.tasks.spawn(unit);
        self.launched += 1;
    }

    pub fn launched(&self) -> usize {
        self.launched
    }

    /// Wait for all units; returns exactly `launched()` outcomes
    pub async fn wait(mut self) -> Vec<std::result::Result<T, JoinError>> {
        let mut done = Vec::with_capacity(self.launched);
        while let Some(outcome) = self.tasks.join_next().await {
            done.push(outcome);
        }
        debug_assert_eq!(done.len(), self.launched);
        done
    }
}

impl<T: Send + 'static> Default for WaitGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleTally {
    /// Units launched (containers with a non-empty id)
    pub launched: usize,
    /// Units that were skipped or failed
    pub failed: usize,
    /// Units that failed on the metadata lookup
    pub metadata_failures: usize,
    /// Countable containers, the value of `container.num`
    pub counted: usize,
    pub points_pushed: usize,
    pub emit_failures: usize,
}

struct UnitContext {
    metadata: Arc<dyn MetadataSource>,
    sink: Arc<dyn MetricSink>,
    config: FanOutConfig,
    host_memory: u64,
    metrics: PusherMetrics,
}

#[derive(Debug)]
struct UnitReport {
    points: usize,
    emit_failures: usize,
}

/// Runs one unit of work per container and aggregates the result
pub struct FanOut {
    ctx: Arc<UnitContext>,
}

impl FanOut {
    pub fn new(
        metadata: Arc<dyn MetadataSource>,
        sink: Arc<dyn MetricSink>,
        host_memory: u64,
        config: FanOutConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(UnitContext {
                metadata,
                sink,
                config,
                host_memory,
                metrics: PusherMetrics::new(),
            }),
        }
    }

    pub fn config(&self) -> &FanOutConfig {
        &self.ctx.config
    }

    /// Process every container concurrently and push the container count
    pub async fn run_cycle(&self, containers: Vec<ContainerRecord>, timestamp: i64) -> CycleTally {
        let counted = Arc::new(AtomicUsize::new(0));
        let mut group = WaitGroup::new();

        for record in containers {
            if record.id.is_empty() {
                warn!("Skipping container without id");
                continue;
            }

            let ctx = Arc::clone(&self.ctx);
            let counted = Arc::clone(&counted);
            group.launch(async move {
                let container_id = record.id.clone();
                let outcome = run_unit(&ctx, record, &counted, timestamp).await;
                (container_id, outcome)
            });
        }

        let mut tally = CycleTally {
            launched: group.launched(),
            ..Default::default()
        };

        for joined in group.wait().await {
            match joined {
                Ok((_, Ok(report))) => {
                    tally.points_pushed += report.points - report.emit_failures;
                    tally.emit_failures += report.emit_failures;
                }
                Ok((container_id, Err(e))) => {
                    tally.failed += 1;
                    self.ctx.metrics.inc_unit_failures();
                    match &e {
                        CollectorError::MissingOrchestratorLabel { .. } => {
                            debug!(container_id = %container_id, error = %e, "Skipping container");
                        }
                        CollectorError::SourceUnavailable { service: "docker", .. } => {
                            tally.metadata_failures += 1;
                            warn!(container_id = %container_id, error = %e, "Skipping container");
                        }
                        _ => {
                            warn!(container_id = %container_id, error = %e, "Skipping container");
                        }
                    }
                }
                Err(join_error) => {
                    tally.failed += 1;
                    self.ctx.metrics.inc_unit_failures();
                    error!(error = %join_error, "Container unit aborted");
                }
            }
        }

        // Every unit has reported, the count is final
        tally.counted = counted.load(Ordering::SeqCst);

        match self.push_container_count(tally.counted, timestamp).await {
            Some(true) => tally.points_pushed += 1,
            Some(false) => tally.emit_failures += 1,
            None => {}
        }

        tally
    }

    /// Returns `None` when no host name is configured and nothing was pushed
    async fn push_container_count(&self, count: usize, timestamp: i64) -> Option<bool> {
        let config = &self.ctx.config;
        if config.hostname.is_empty() {
            warn!("No host name, not pushing container.num");
            return None;
        }

        let point = PointBuilder::new(config.hostname.as_str(), timestamp, config.step, "")
            .point("container.num", count as f64, CounterType::Gauge);

        match self.ctx.sink.push(&point).await {
            Ok(()) => {
                self.ctx.metrics.inc_points_pushed();
                debug!(count = count, "Pushed container count");
                Some(true)
            }
            Err(e) => {
                self.ctx.metrics.inc_emit_errors();
                warn!(count = count, error = %e, "Failed to push container count");
                Some(false)
            }
        }
    }
}

/// Points for every derived value of one container
pub fn rate_points(builder: &PointBuilder, rate: &RateResult) -> Vec<MetricPoint> {
    let mut points = Vec::with_capacity(rate.values.len() + rate.per_core.len());

    for value in &rate.values {
        points.push(builder.point(value.metric, value.value, value.counter_type));
    }
    for (core, busy) in rate.per_core.iter().enumerate() {
        points.push(builder.tagged_point(
            "cpu.core.busy",
            *busy,
            CounterType::Gauge,
            "core",
            &core.to_string(),
        ));
    }

    points
}

async fn run_unit(
    ctx: &UnitContext,
    record: ContainerRecord,
    counted: &AtomicUsize,
    timestamp: i64,
) -> Result<UnitReport> {
    let config = &ctx.config;

    let orchestrator_id = record
        .labels
        .get(&config.orchestrator_label)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| CollectorError::MissingOrchestratorLabel {
            label: config.orchestrator_label.clone(),
        })?;

    let metadata = ctx.metadata.inspect(&record.id).await?;

    let rate = compute_rate(
        &record.samples,
        &RateInputs {
            memory_limit: record.memory_limit,
            host_memory: ctx.host_memory,
            core_count: metadata.core_count,
        },
    )?;

    for anomaly in &rate.anomalies {
        match anomaly {
            RateAnomaly::CounterReset { .. } => ctx.metrics.inc_counter_resets(),
            RateAnomaly::PartialCoreData { .. } => ctx.metrics.inc_partial_core_events(),
        }
        warn!(container_id = %record.id, anomaly = %anomaly, "Counter anomaly");
    }

    let builder = PointBuilder::new(
        PointBuilder::container_endpoint(&record.id),
        timestamp,
        config.step,
        config.container_tags(orchestrator_id),
    );
    let points = rate_points(&builder, &rate);

    let mut emit_failures = 0;
    for point in &points {
        match ctx.sink.push(point).await {
            Ok(()) => ctx.metrics.inc_points_pushed(),
            Err(e) => {
                emit_failures += 1;
                ctx.metrics.inc_emit_errors();
                warn!(
                    container_id = %record.id,
                    metric = %point.metric,
                    error = %e,
                    "Failed to push point"
                );
            }
        }
    }

    if !record.labels.contains_key(&config.not_count_label) {
        counted.fetch_add(1, Ordering::SeqCst);
    }

    debug!(
        container_id = %record.id,
        points = points.len(),
        emit_failures = emit_failures,
        count_num = rate.count_num,
        "Container pushed"
    );

    Ok(UnitReport {
        points: points.len(),
        emit_failures,
    })
}
