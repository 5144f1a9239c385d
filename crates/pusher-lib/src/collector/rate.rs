//! Rate derivation from cumulative cAdvisor counters
//!
//! Takes the sample history of one container, picks a baseline and a
//! comparison sample, and turns counter deltas into per-interval rates.
//! All rates derived from the same pair share the same divisor so they
//! describe the same time window.

use crate::error::{CollectorError, Result};
use crate::models::{CounterType, Sample};
use std::fmt;

/// Nanoseconds of CPU time that make up one fully busy core over one
/// sub-interval of the cAdvisor housekeeping loop
pub const CPU_NORMALIZATION: f64 = 10_000_000.0;

/// Sample index used as comparison when the history is long enough
const LONG_WINDOW: usize = 10;

/// Per-container constants the engine needs besides the samples
#[derive(Debug, Clone, Copy)]
pub struct RateInputs {
    /// Declared container memory limit in bytes
    pub memory_limit: u64,
    /// Total host memory in bytes
    pub host_memory: u64,
    /// Logical cores visible to the collector; 0 is treated as 1
    pub core_count: u64,
}

/// A single derived value
#[derive(Debug, Clone, PartialEq)]
pub struct RateValue {
    pub metric: &'static str,
    pub value: f64,
    pub counter_type: CounterType,
}

/// Something odd in the counters that did not stop the computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateAnomaly {
    /// A cumulative counter went backwards; its rate was clamped to zero
    CounterReset {
        counter: &'static str,
        /// Core index for per-core counters
        core: Option<usize>,
        baseline: u64,
        comparison: u64,
    },
    /// The comparison sample reports fewer cores than the baseline
    PartialCoreData {
        baseline_cores: usize,
        comparison_cores: usize,
    },
}

impl fmt::Display for RateAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateAnomaly::CounterReset {
                counter,
                core: None,
                baseline,
                comparison,
            } => write!(
                f,
                "counter {} reset ({} -> {}), rate clamped to 0",
                counter, baseline, comparison
            ),
            RateAnomaly::CounterReset {
                counter,
                core: Some(core),
                baseline,
                comparison,
            } => write!(
                f,
                "counter {} on core {} reset ({} -> {}), rate clamped to 0",
                counter, core, baseline, comparison
            ),
            RateAnomaly::PartialCoreData {
                baseline_cores,
                comparison_cores,
            } => write!(
                f,
                "per-core data truncated: baseline has {} cores, comparison {}",
                baseline_cores, comparison_cores
            ),
        }
    }
}

/// Everything derived for one container in one cycle
#[derive(Debug, Clone, Default)]
pub struct RateResult {
    /// Number of sub-intervals between baseline and comparison
    pub count_num: u64,
    pub values: Vec<RateValue>,
    /// Busy fraction per core index, possibly truncated
    pub per_core: Vec<f64>,
    pub anomalies: Vec<RateAnomaly>,
}

impl RateResult {
    /// Look up a derived value by metric name
    pub fn get(&self, metric: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|v| v.metric == metric)
            .map(|v| v.value)
    }

    pub fn counter_resets(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.anomalies.iter().filter_map(|a| match a {
            RateAnomaly::CounterReset { counter, .. } => Some(*counter),
            RateAnomaly::PartialCoreData { .. } => None,
        })
    }

    pub fn has_partial_core_data(&self) -> bool {
        self.anomalies
            .iter()
            .any(|a| matches!(a, RateAnomaly::PartialCoreData { .. }))
    }
}

/// Pick (baseline, comparison, divisor) from an ordered sample history
///
/// The baseline is always the oldest sample. With at least eleven samples
/// the comparison is index 10 and the divisor 10, otherwise index 1 and 1.
pub fn select_window(samples: &[Sample]) -> Result<(&Sample, &Sample, u64)> {
    match samples.len() {
        n if n < 2 => Err(CollectorError::InsufficientHistory { samples: n }),
        n if n > LONG_WINDOW => Ok((&samples[0], &samples[LONG_WINDOW], LONG_WINDOW as u64)),
        _ => Ok((&samples[0], &samples[1], 1)),
    }
}

/// Derive every tracked value for one container
pub fn compute_rate(samples: &[Sample], inputs: &RateInputs) -> Result<RateResult> {
    let (baseline, comparison, count_num) = select_window(samples)?;
    let mut builder = RateBuilder::new(count_num);

    // CPU, normalized to a fraction of all cores
    let cores = inputs.core_count.max(1) as f64;
    let cpu_weight = CPU_NORMALIZATION * cores;
    let (base_cpu, cmp_cpu) = (&baseline.cpu.usage, &comparison.cpu.usage);
    builder.rate("cpu.busy", base_cpu.total, cmp_cpu.total, cpu_weight);
    builder.rate("cpu.user", base_cpu.user, cmp_cpu.user, cpu_weight);
    builder.rate("cpu.system", base_cpu.system, cmp_cpu.system, cpu_weight);
    builder.per_core(&base_cpu.per_cpu, &cmp_cpu.per_cpu);

    // Disk I/O is passed through as raw counters; the agent derives the rate
    let (read, write) = baseline
        .diskio
        .io_service_bytes
        .first()
        .map(|disk| (disk.read_bytes(), disk.write_bytes()))
        .unwrap_or((0, 0));
    builder.counter("disk.io.read_bytes", read);
    builder.counter("disk.io.write_bytes", write);

    // Memory gauges come from the baseline sample only
    let limit = clamp_memory_limit(inputs.memory_limit, inputs.host_memory);
    let memory = &baseline.memory;
    builder.gauge("mem.memused.percent", fraction(memory.usage, limit));
    builder.gauge("mem.memused", memory.usage as f64);
    builder.gauge("mem.memtotal", limit as f64);
    builder.gauge("mem.memused.hot", fraction(memory.working_set, limit));

    let (base_net, cmp_net) = (&baseline.network, &comparison.network);
    builder.rate("net.if.in.bytes", base_net.rx_bytes, cmp_net.rx_bytes, 1.0);
    builder.rate("net.if.in.packets", base_net.rx_packets, cmp_net.rx_packets, 1.0);
    builder.rate("net.if.in.errors", base_net.rx_errors, cmp_net.rx_errors, 1.0);
    builder.rate("net.if.in.dropped", base_net.rx_dropped, cmp_net.rx_dropped, 1.0);
    builder.rate("net.if.out.bytes", base_net.tx_bytes, cmp_net.tx_bytes, 1.0);
    builder.rate("net.if.out.packets", base_net.tx_packets, cmp_net.tx_packets, 1.0);
    builder.rate("net.if.out.errors", base_net.tx_errors, cmp_net.tx_errors, 1.0);
    builder.rate("net.if.out.dropped", base_net.tx_dropped, cmp_net.tx_dropped, 1.0);

    Ok(builder.finish())
}

/// Unlimited containers report a limit above physical memory
pub fn clamp_memory_limit(declared: u64, host_memory: u64) -> u64 {
    if host_memory > 0 && declared > host_memory {
        host_memory
    } else {
        declared
    }
}

fn fraction(value: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    value as f64 / limit as f64
}

struct RateBuilder {
    result: RateResult,
}

impl RateBuilder {
    fn new(count_num: u64) -> Self {
        Self {
            result: RateResult {
                count_num,
                ..Default::default()
            },
        }
    }

    /// Delta in u64 space; a decrease is recorded and yields 0
    fn delta(
        &mut self,
        counter: &'static str,
        core: Option<usize>,
        baseline: u64,
        comparison: u64,
    ) -> u64 {
        match comparison.checked_sub(baseline) {
            Some(delta) => delta,
            None => {
                self.result.anomalies.push(RateAnomaly::CounterReset {
                    counter,
                    core,
                    baseline,
                    comparison,
                });
                0
            }
        }
    }

    fn rate(&mut self, metric: &'static str, baseline: u64, comparison: u64, weight: f64) {
        let delta = self.delta(metric, None, baseline, comparison);
        let value = delta as f64 / self.result.count_num as f64 / weight;
        self.push(metric, value, CounterType::Gauge);
    }

    fn per_core(&mut self, baseline: &[u64], comparison: &[u64]) {
        for (i, &base) in baseline.iter().enumerate() {
            let Some(&cmp) = comparison.get(i) else {
                self.result.anomalies.push(RateAnomaly::PartialCoreData {
                    baseline_cores: baseline.len(),
                    comparison_cores: comparison.len(),
                });
                break;
            };
            let delta = self.delta("cpu.core.busy", Some(i), base, cmp);
            self.result.per_core.push(delta as f64 / CPU_NORMALIZATION);
        }
    }

    fn counter(&mut self, metric: &'static str, value: u64) {
        self.push(metric, value as f64, CounterType::Counter);
    }

    fn gauge(&mut self, metric: &'static str, value: f64) {
        self.push(metric, value, CounterType::Gauge);
    }

    fn push(&mut self, metric: &'static str, value: f64, counter_type: CounterType) {
        self.result.values.push(RateValue {
            metric,
            value,
            counter_type,
        });
    }

    fn finish(self) -> RateResult {
        self.result
    }
}
