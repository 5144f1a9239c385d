//! Core data models for the metrics pusher
//!
//! `Sample` and its parts mirror the cAdvisor v1 `ContainerStats` JSON so
//! they deserialize straight off the wire. Missing sections default to zero.

use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;

/// One point-in-time snapshot of a container's cumulative counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Sample {
    pub timestamp: Option<String>,
    pub cpu: CpuStats,
    pub diskio: DiskIoStats,
    pub memory: MemoryStats,
    pub network: NetworkStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuStats {
    pub usage: CpuUsage,
}

/// Cumulative CPU time in nanoseconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuUsage {
    pub total: u64,
    #[serde(rename = "per_cpu_usage")]
    pub per_cpu: Vec<u64>,
    pub user: u64,
    pub system: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskIoStats {
    pub io_service_bytes: Vec<PerDiskStats>,
}

/// Per-device I/O counters keyed by operation (`Read`, `Write`, ...)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerDiskStats {
    pub device: String,
    pub major: u64,
    pub minor: u64,
    pub stats: HashMap<String, u64>,
}

impl PerDiskStats {
    pub fn read_bytes(&self) -> u64 {
        self.stats.get("Read").copied().unwrap_or(0)
    }

    pub fn write_bytes(&self) -> u64 {
        self.stats.get("Write").copied().unwrap_or(0)
    }
}

/// Instantaneous memory gauges in bytes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStats {
    pub usage: u64,
    pub working_set: u64,
}

/// Cumulative interface counters summed by cAdvisor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
}

/// A container as seen in one collection cycle
#[derive(Debug, Clone, Default)]
pub struct ContainerRecord {
    pub id: String,
    /// Declared memory limit in bytes; huge for unlimited containers
    pub memory_limit: u64,
    pub labels: HashMap<String, String>,
    /// Oldest first
    pub samples: Vec<Sample>,
}

/// How the falcon agent should treat a point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CounterType {
    /// Instantaneous value, stored as-is
    Gauge,
    /// Monotonic value, the agent derives the rate
    Counter,
}

/// One time-series point in the open-falcon push format
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricPoint {
    pub metric: String,
    pub endpoint: String,
    pub timestamp: i64,
    pub step: u64,
    #[serde(serialize_with = "value_as_string")]
    pub value: f64,
    pub counter_type: CounterType,
    pub tags: String,
}

fn value_as_string<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}
