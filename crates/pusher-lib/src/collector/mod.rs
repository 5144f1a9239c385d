//! Container metrics collection
//!
//! This module holds the whole collection pipeline: adapters for the
//! snapshot source (cAdvisor) and the metadata source (Docker), the rate
//! engine, the per-container fan-out and the periodic push loop.

mod cadvisor;
mod docker;
mod fanout;
mod r#loop;
pub mod rate;

#[cfg(test)]
mod tests;

pub use cadvisor::{CadvisorClient, ContainerInfo, MachineInfo};
pub use docker::{host_core_count, DockerMetadata};
pub use fanout::{CycleTally, FanOut, FanOutConfig, WaitGroup};
pub use r#loop::{PushLoop, PushLoopBuilder};
pub use rate::{compute_rate, RateAnomaly, RateInputs, RateResult, RateValue};

use crate::error::Result;
use crate::models::ContainerRecord;

pub use async_trait::async_trait;

/// Source of per-container sample histories
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// List every running container with its full retained sample history
    async fn containers(&self) -> Result<Vec<ContainerRecord>>;

    /// Physical memory of the host in bytes
    async fn host_memory(&self) -> Result<u64>;
}

/// Static facts about a container that do not change between samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMetadata {
    /// Logical cores used to normalize CPU rates
    pub core_count: u64,
}

/// Lookup of static container metadata by id
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn inspect(&self, container_id: &str) -> Result<ContainerMetadata>;
}
