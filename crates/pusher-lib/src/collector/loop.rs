//! Periodic push loop
//!
//! Runs one cycle immediately and then once per interval. Cycles are
//! strictly sequential: a cycle that overruns the interval delays the next
//! tick instead of overlapping it, and missed ticks are not caught up.

use super::{CycleTally, FanOut, SnapshotSource};
use crate::error::{CollectorError, Result};
use crate::health::{components, HealthRegistry};
use crate::observability::{PusherMetrics, StructuredLogger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::info;

/// Drives collection cycles forever
pub struct PushLoop {
    source: Arc<dyn SnapshotSource>,
    fanout: FanOut,
    interval: Duration,
    health: HealthRegistry,
    metrics: PusherMetrics,
    logger: StructuredLogger,
}

impl PushLoop {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        fanout: FanOut,
        interval: Duration,
        health: HealthRegistry,
    ) -> Self {
        let logger = StructuredLogger::new(fanout.config().hostname.clone());
        Self {
            source,
            fanout,
            interval,
            health,
            metrics: PusherMetrics::new(),
            logger,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run until a shutdown message arrives; checked between cycles
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting metrics push loop"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down metrics push loop");
                    break;
                }
            }
        }
    }

    /// One full cycle; `None` when the container listing failed
    pub async fn run_once(&self) -> Option<CycleTally> {
        let start = Instant::now();
        let timestamp = chrono::Utc::now().timestamp();

        let containers = match self.source.containers().await {
            Ok(containers) => {
                self.health.set_healthy(components::SNAPSHOT_SOURCE).await;
                containers
            }
            Err(e) => {
                self.health
                    .set_unhealthy(components::SNAPSHOT_SOURCE, e.to_string())
                    .await;
                self.metrics.inc_cycles_failed();
                self.logger.log_cycle_aborted(&e);
                return None;
            }
        };

        let tally = self.fanout.run_cycle(containers, timestamp).await;
        let elapsed = start.elapsed();

        self.health
            .set_from_ratio(components::METADATA, tally.metadata_failures, tally.launched)
            .await;
        self.health
            .set_from_ratio(
                components::SINK,
                tally.emit_failures,
                tally.points_pushed + tally.emit_failures,
            )
            .await;

        self.metrics
            .observe_cycle(elapsed, tally.launched, tally.counted);
        self.logger.log_cycle(
            tally.launched,
            tally.failed,
            tally.counted,
            tally.emit_failures,
            elapsed,
        );

        Some(tally)
    }
}

/// Builder for the push loop
pub struct PushLoopBuilder {
    source: Option<Arc<dyn SnapshotSource>>,
    fanout: Option<FanOut>,
    health: Option<HealthRegistry>,
    interval: Duration,
}

impl PushLoopBuilder {
    pub fn new() -> Self {
        Self {
            source: None,
            fanout: None,
            health: None,
            interval: Duration::from_secs(10),
        }
    }

    pub fn source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn fanout(mut self, fanout: FanOut) -> Self {
        self.fanout = Some(fanout);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn build(self) -> Result<PushLoop> {
        let source = self
            .source
            .ok_or_else(|| CollectorError::Config("snapshot source is required".to_string()))?;
        let fanout = self
            .fanout
            .ok_or_else(|| CollectorError::Config("fan-out is required".to_string()))?;
        if self.interval.is_zero() {
            return Err(CollectorError::Config(
                "interval must be greater than zero".to_string(),
            ));
        }

        Ok(PushLoop::new(
            source,
            fanout,
            self.interval,
            self.health.unwrap_or_default(),
        ))
    }
}

impl Default for PushLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
