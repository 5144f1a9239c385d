//! Integration tests for the collection pipeline
//!
//! These tests run whole cycles against in-memory snapshot, metadata and
//! sink implementations, without cAdvisor, Docker or a falcon agent.

#[cfg(test)]
mod fakes {
    use crate::collector::{ContainerMetadata, MetadataSource, SnapshotSource};
    use crate::emitter::MetricSink;
    use crate::error::{CollectorError, Result};
    use crate::models::{ContainerRecord, MetricPoint, Sample};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    pub const GIB: u64 = 1024 * 1024 * 1024;

    pub struct StaticSource {
        containers: Vec<ContainerRecord>,
        fail: bool,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl StaticSource {
        pub fn new(containers: Vec<ContainerRecord>) -> Self {
            Self {
                containers,
                fail: false,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(vec![])
            }
        }

        pub fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(vec![])
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotSource for StaticSource {
        async fn containers(&self) -> Result<Vec<ContainerRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                return Err(CollectorError::cadvisor("connection refused"));
            }
            Ok(self.containers.clone())
        }

        async fn host_memory(&self) -> Result<u64> {
            Ok(16 * GIB)
        }
    }

    #[derive(Default)]
    pub struct FakeMetadata {
        pub fail_ids: HashSet<String>,
        pub delay: Duration,
        calls: AtomicUsize,
    }

    impl FakeMetadata {
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        pub fn failing_for(ids: &[&str]) -> Self {
            Self {
                fail_ids: ids.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetadataSource for FakeMetadata {
        async fn inspect(&self, container_id: &str) -> Result<ContainerMetadata> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_ids.contains(container_id) {
                return Err(CollectorError::docker(format!("no such container {}", container_id)));
            }
            Ok(ContainerMetadata { core_count: 2 })
        }
    }

    #[derive(Default)]
    pub struct RecordingSink {
        pub fail_metrics: HashSet<String>,
        points: Mutex<Vec<MetricPoint>>,
    }

    impl RecordingSink {
        pub fn failing_for(metrics: &[&str]) -> Self {
            Self {
                fail_metrics: metrics.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        pub fn points(&self) -> Vec<MetricPoint> {
            self.points.lock().unwrap().clone()
        }

        pub fn for_endpoint(&self, endpoint: &str) -> Vec<MetricPoint> {
            self.points()
                .into_iter()
                .filter(|p| p.endpoint == endpoint)
                .collect()
        }

        pub fn find(&self, endpoint: &str, metric: &str) -> Option<MetricPoint> {
            self.points()
                .into_iter()
                .find(|p| p.endpoint == endpoint && p.metric == metric)
        }
    }

    #[async_trait]
    impl MetricSink for RecordingSink {
        async fn push(&self, point: &MetricPoint) -> Result<()> {
            if self.fail_metrics.contains(&point.metric) {
                return Err(CollectorError::EmitFailure("agent refused".to_string()));
            }
            self.points.lock().unwrap().push(point.clone());
            Ok(())
        }
    }

    /// Container with `samples` samples whose CPU total grows by 4000 each
    pub fn container(id: &str, labels: &[(&str, &str)], samples: usize) -> ContainerRecord {
        let samples = (0..samples as u64)
            .map(|i| {
                let mut sample = Sample::default();
                sample.cpu.usage.total = 1000 + i * 4000;
                sample.cpu.usage.per_cpu = vec![100 + i * 50, 200 + i * 60];
                sample.memory.usage = GIB / 2;
                sample.memory.working_set = GIB / 4;
                sample
            })
            .collect();

        ContainerRecord {
            id: id.to_string(),
            memory_limit: GIB,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            samples,
        }
    }

    pub fn marathon(id: &str) -> ContainerRecord {
        container(id, &[("dcos-marathon-id", "/web")], 2)
    }
}

#[cfg(test)]
mod cycle_tests {
    use super::fakes::*;
    use crate::collector::{FanOut, FanOutConfig};
    use crate::models::CounterType;
    use std::sync::Arc;
    use std::time::Duration;

    const TS: i64 = 1_480_000_000;

    fn config() -> FanOutConfig {
        FanOutConfig {
            hostname: "node-1".to_string(),
            ..Default::default()
        }
    }

    fn fanout(metadata: Arc<FakeMetadata>, sink: Arc<RecordingSink>) -> FanOut {
        FanOut::new(metadata, sink, 16 * GIB, config())
    }

    #[tokio::test]
    async fn test_cycle_pushes_container_points() {
        let metadata = Arc::new(FakeMetadata::default());
        let sink = Arc::new(RecordingSink::default());

        let tally = fanout(metadata, sink.clone())
            .run_cycle(vec![marathon("abc")], TS)
            .await;

        assert_eq!(tally.launched, 1);
        assert_eq!(tally.failed, 0);
        assert_eq!(tally.counted, 1);

        let busy = sink.find("docker-abc", "cpu.busy").unwrap();
        // (5000 - 1000) / 1 / (10_000_000 * 2 cores)
        assert!((busy.value - 0.0002).abs() < 1e-12);
        assert_eq!(busy.tags, "marathon_id=/web");
        assert_eq!(busy.step, 10);
        assert_eq!(busy.timestamp, TS);
        assert_eq!(busy.counter_type, CounterType::Gauge);

        let read = sink.find("docker-abc", "disk.io.read_bytes").unwrap();
        assert_eq!(read.value, 0.0);
        assert_eq!(read.counter_type, CounterType::Counter);
        let write = sink.find("docker-abc", "disk.io.write_bytes").unwrap();
        assert_eq!(write.counter_type, CounterType::Counter);

        let percent = sink.find("docker-abc", "mem.memused.percent").unwrap();
        assert!((percent.value - 0.5).abs() < 1e-12);

        let cores: Vec<_> = sink
            .for_endpoint("docker-abc")
            .into_iter()
            .filter(|p| p.metric == "cpu.core.busy")
            .collect();
        assert_eq!(cores.len(), 2);
        assert!(cores.iter().any(|p| p.tags == "marathon_id=/web,core=0"));
        assert!(cores.iter().any(|p| p.tags == "marathon_id=/web,core=1"));

        // 3 cpu + 2 disk + 4 mem + 8 net + 2 cores
        assert_eq!(sink.for_endpoint("docker-abc").len(), 19);
        assert_eq!(tally.points_pushed, 20);
    }

    #[tokio::test]
    async fn test_cycle_counts_only_countable_containers() {
        let metadata = Arc::new(FakeMetadata::default());
        let sink = Arc::new(RecordingSink::default());
        let excluded = container(
            "ccc",
            &[("dcos-marathon-id", "/db"), ("dcos-container", "true")],
            2,
        );

        let tally = fanout(metadata, sink.clone())
            .run_cycle(vec![marathon("aaa"), marathon("bbb"), excluded], TS)
            .await;

        assert_eq!(tally.launched, 3);
        assert_eq!(tally.counted, 2);
        // the excluded container still reports its own metrics
        assert!(sink.find("docker-ccc", "cpu.busy").is_some());

        let num = sink.find("node-1", "container.num").unwrap();
        assert_eq!(num.value, 2.0);
        assert_eq!(num.tags, "");
        assert_eq!(num.counter_type, CounterType::Gauge);
    }

    #[tokio::test]
    async fn test_cycle_with_no_containers_emits_zero() {
        let metadata = Arc::new(FakeMetadata::default());
        let sink = Arc::new(RecordingSink::default());

        let tally = fanout(metadata, sink.clone()).run_cycle(vec![], TS).await;

        assert_eq!(tally.launched, 0);
        assert_eq!(tally.counted, 0);
        let points = sink.points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].metric, "container.num");
        assert_eq!(points[0].value, 0.0);
    }

    #[tokio::test]
    async fn test_missing_orchestrator_label_skips_container() {
        let metadata = Arc::new(FakeMetadata::default());
        let sink = Arc::new(RecordingSink::default());
        let plain = container("plain", &[("team", "infra")], 2);

        let tally = fanout(metadata.clone(), sink.clone())
            .run_cycle(vec![plain, marathon("abc")], TS)
            .await;

        assert_eq!(tally.failed, 1);
        assert_eq!(tally.counted, 1);
        assert!(sink.for_endpoint("docker-plain").is_empty());
        // label check happens before the metadata lookup
        assert_eq!(metadata.calls(), 1);
    }

    #[tokio::test]
    async fn test_metadata_failure_is_isolated() {
        let metadata = Arc::new(FakeMetadata::failing_for(&["bad"]));
        let sink = Arc::new(RecordingSink::default());

        let tally = fanout(metadata, sink.clone())
            .run_cycle(vec![marathon("bad"), marathon("good")], TS)
            .await;

        assert_eq!(tally.failed, 1);
        assert_eq!(tally.metadata_failures, 1);
        assert_eq!(tally.counted, 1);
        assert!(sink.for_endpoint("docker-bad").is_empty());
        assert!(!sink.for_endpoint("docker-good").is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_history_is_isolated() {
        let metadata = Arc::new(FakeMetadata::default());
        let sink = Arc::new(RecordingSink::default());
        let young = container("young", &[("dcos-marathon-id", "/web")], 1);

        let tally = fanout(metadata, sink.clone())
            .run_cycle(vec![young, marathon("old")], TS)
            .await;

        assert_eq!(tally.failed, 1);
        assert_eq!(tally.counted, 1);
        assert!(sink.for_endpoint("docker-young").is_empty());
        assert_eq!(sink.find("node-1", "container.num").unwrap().value, 1.0);
    }

    #[tokio::test]
    async fn test_emit_failures_do_not_block_other_points() {
        let metadata = Arc::new(FakeMetadata::default());
        let sink = Arc::new(RecordingSink::failing_for(&["cpu.busy", "mem.memused"]));

        let tally = fanout(metadata, sink.clone())
            .run_cycle(vec![marathon("abc")], TS)
            .await;

        assert_eq!(tally.failed, 0);
        assert_eq!(tally.emit_failures, 2);
        assert_eq!(tally.counted, 1);
        assert!(sink.find("docker-abc", "cpu.busy").is_none());
        assert!(sink.find("docker-abc", "cpu.user").is_some());
        assert!(sink.find("docker-abc", "net.if.out.dropped").is_some());
    }

    #[tokio::test]
    async fn test_failed_count_push_is_reported() {
        let metadata = Arc::new(FakeMetadata::default());
        let sink = Arc::new(RecordingSink::failing_for(&["container.num"]));

        let tally = fanout(metadata, sink).run_cycle(vec![], TS).await;
        assert_eq!(tally.emit_failures, 1);
        assert_eq!(tally.points_pushed, 0);
    }

    #[tokio::test]
    async fn test_container_without_id_is_not_launched() {
        let metadata = Arc::new(FakeMetadata::default());
        let sink = Arc::new(RecordingSink::default());

        let tally = fanout(metadata.clone(), sink)
            .run_cycle(vec![marathon(""), marathon("abc")], TS)
            .await;

        assert_eq!(tally.launched, 1);
        assert_eq!(tally.counted, 1);
        assert_eq!(metadata.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fanout_tally_is_exact() {
        let metadata = Arc::new(FakeMetadata::with_delay(Duration::from_millis(2)));
        let sink = Arc::new(RecordingSink::default());

        let containers: Vec<_> = (0..200)
            .map(|i| {
                let id = format!("c{}", i);
                if i % 3 == 0 {
                    container(
                        &id,
                        &[("dcos-marathon-id", "/batch"), ("dcos-container", "1")],
                        2,
                    )
                } else {
                    marathon(&id)
                }
            })
            .collect();
        let expected = (0..200).filter(|i| i % 3 != 0).count();

        let tally = fanout(metadata, sink.clone())
            .run_cycle(containers, TS)
            .await;

        assert_eq!(tally.launched, 200);
        assert_eq!(tally.failed, 0);
        assert_eq!(tally.counted, expected);
        assert_eq!(
            sink.find("node-1", "container.num").unwrap().value,
            expected as f64
        );
    }

    #[tokio::test]
    async fn test_long_history_uses_window_of_ten() {
        let metadata = Arc::new(FakeMetadata::default());
        let sink = Arc::new(RecordingSink::default());
        let long = container("long", &[("dcos-marathon-id", "/web")], 15);

        fanout(metadata, sink.clone())
            .run_cycle(vec![long], TS)
            .await;

        // sample 10 minus sample 0 is 40_000 ns over 10 sub-intervals and 2 cores
        let busy = sink.find("docker-long", "cpu.busy").unwrap();
        assert!((busy.value - 40_000.0 / 10.0 / 20_000_000.0).abs() < 1e-15);
    }

    #[tokio::test]
    async fn test_no_hostname_skips_count_point() {
        let metadata = Arc::new(FakeMetadata::default());
        let sink = Arc::new(RecordingSink::default());
        let fanout = FanOut::new(metadata, sink.clone(), 16 * GIB, FanOutConfig::default());

        let tally = fanout.run_cycle(vec![marathon("abc")], TS).await;
        assert_eq!(tally.counted, 1);
        assert!(sink.points().iter().all(|p| p.metric != "container.num"));
    }
}

#[cfg(test)]
mod loop_tests {
    use super::fakes::*;
    use crate::collector::{FanOut, FanOutConfig, PushLoopBuilder};
    use crate::health::{components, ComponentStatus, HealthRegistry};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn fanout(sink: Arc<RecordingSink>) -> FanOut {
        FanOut::new(
            Arc::new(FakeMetadata::default()),
            sink,
            16 * GIB,
            FanOutConfig {
                hostname: "node-1".to_string(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_builder_missing_source() {
        let result = PushLoopBuilder::new()
            .fanout(fanout(Arc::new(RecordingSink::default())))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_zero_interval() {
        let result = PushLoopBuilder::new()
            .source(Arc::new(StaticSource::new(vec![])))
            .fanout(fanout(Arc::new(RecordingSink::default())))
            .interval(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_once_listing_failure_skips_cycle() {
        let health = HealthRegistry::new();
        health.register_all().await;
        let sink = Arc::new(RecordingSink::default());

        let push_loop = PushLoopBuilder::new()
            .source(Arc::new(StaticSource::failing()))
            .fanout(fanout(sink.clone()))
            .health(health.clone())
            .build()
            .unwrap();

        assert!(push_loop.run_once().await.is_none());
        // no container.num when the listing itself failed
        assert!(sink.points().is_empty());

        let report = health.health().await;
        assert_eq!(
            report.components[components::SNAPSHOT_SOURCE].status,
            ComponentStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_run_once_reports_tally_and_health() {
        let health = HealthRegistry::new();
        health.register_all().await;
        let sink = Arc::new(RecordingSink::failing_for(&["cpu.busy"]));

        let push_loop = PushLoopBuilder::new()
            .source(Arc::new(StaticSource::new(vec![marathon("a"), marathon("b")])))
            .fanout(fanout(sink))
            .health(health.clone())
            .build()
            .unwrap();

        let tally = push_loop.run_once().await.unwrap();
        assert_eq!(tally.counted, 2);
        assert_eq!(tally.emit_failures, 2);

        let report = health.health().await;
        assert_eq!(report.components[components::SINK].status, ComponentStatus::Degraded);
        assert_eq!(
            report.components[components::METADATA].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_immediately_then_every_interval() {
        let source = Arc::new(StaticSource::new(vec![]));
        let push_loop = PushLoopBuilder::new()
            .source(source.clone())
            .fanout(fanout(Arc::new(RecordingSink::default())))
            .interval(Duration::from_secs(10))
            .build()
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(push_loop.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(source.calls(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls(), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls(), 3);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlong_cycles_never_overlap() {
        let source = Arc::new(StaticSource::slow(Duration::from_secs(25)));
        let push_loop = PushLoopBuilder::new()
            .source(source.clone())
            .fanout(fanout(Arc::new(RecordingSink::default())))
            .interval(Duration::from_secs(10))
            .build()
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(push_loop.run(shutdown_rx));

        // first cycle occupies 0..25s, the next one starts right after it
        tokio::time::sleep(Duration::from_secs(24)).await;
        assert_eq!(source.calls(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.calls(), 2);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(source.calls(), 3);
        assert_eq!(source.max_in_flight(), 1);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
