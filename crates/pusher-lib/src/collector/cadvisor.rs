//! cAdvisor REST client
//!
//! Talks to the v1.3 API:
//! - `GET  api/v1.3/machine` for host memory capacity
//! - `POST api/v1.3/docker/` to list docker containers
//! - `POST api/v1.3/subcontainers/docker/<id>` for one container's history
//!
//! POST bodies carry `{"num_stats": -1}` so cAdvisor returns every sample
//! it still retains.

use super::SnapshotSource;
use crate::error::{CollectorError, Result};
use crate::models::{ContainerRecord, Sample};
use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const API_PREFIX: &str = "api/v1.3/";

/// Request body asking for the full retained history
#[derive(Debug, Serialize)]
struct ContainerInfoRequest {
    num_stats: i64,
}

impl ContainerInfoRequest {
    fn unbounded() -> Self {
        Self { num_stats: -1 }
    }
}

/// Subset of cAdvisor `MachineInfo`
#[derive(Debug, Clone, Deserialize)]
pub struct MachineInfo {
    pub memory_capacity: u64,
    #[serde(default)]
    pub num_cores: u64,
}

/// Subset of cAdvisor `ContainerInfo`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub spec: ContainerSpec,
    pub stats: Vec<Sample>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    pub labels: HashMap<String, String>,
    pub memory: MemorySpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemorySpec {
    pub limit: u64,
}

impl From<ContainerInfo> for ContainerRecord {
    fn from(info: ContainerInfo) -> Self {
        // Older cAdvisor builds put labels on the container, newer on the container spec
        let mut labels = info.spec.labels;
        labels.extend(info.labels);

        ContainerRecord {
            id: info.id,
            memory_limit: info.spec.memory.limit,
            labels,
            samples: info.stats,
        }
    }
}

/// HTTP client for one cAdvisor instance
pub struct CadvisorClient {
    client: Client,
    base_url: Url,
}

impl CadvisorClient {
    /// Create a client for `http://<host>:<port>/`
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        Self::with_base_url(&format!("http://{}:{}/", host, port), timeout)
    }

    /// Create a client for an explicit base URL (used by tests)
    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollectorError::Config(format!("failed to create HTTP client: {}", e)))?;

        let mut base_url = Url::parse(base_url)
            .map_err(|e| CollectorError::Config(format!("invalid cAdvisor URL: {}", e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(API_PREFIX)
            .and_then(|u| u.join(path))
            .map_err(|e| CollectorError::Config(format!("invalid cAdvisor path {}: {}", path, e)))
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CollectorError::cadvisor(format!("HTTP {}: {}", status, body)));
        }

        response.json().await.map_err(CollectorError::cadvisor)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path)?;
        let response = self
            .client
            .post(url)
            .json(&ContainerInfoRequest::unbounded())
            .send()
            .await
            .map_err(CollectorError::cadvisor)?;

        Self::decode(response).await
    }

    /// Fetch static machine information
    pub async fn machine_info(&self) -> Result<MachineInfo> {
        let url = self.url("machine")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(CollectorError::cadvisor)?;

        Self::decode(response).await
    }

    /// List all docker containers known to cAdvisor
    pub async fn docker_containers(&self) -> Result<Vec<ContainerInfo>> {
        let containers: HashMap<String, ContainerInfo> = self.post("docker/").await?;
        Ok(containers.into_values().collect())
    }

    /// Fetch one docker container with its full sample history
    pub async fn docker_container(&self, container_id: &str) -> Result<ContainerInfo> {
        let path = format!("subcontainers/docker/{}", container_id);
        let containers: Vec<ContainerInfo> = self.post(&path).await?;

        containers
            .into_iter()
            .next()
            .ok_or_else(|| CollectorError::cadvisor(format!("no data for container {}", container_id)))
    }
}

#[async_trait]
impl SnapshotSource for CadvisorClient {
    async fn containers(&self) -> Result<Vec<ContainerRecord>> {
        let listed = self.docker_containers().await?;
        debug!(count = listed.len(), "Listed cAdvisor containers");

        let mut records = Vec::with_capacity(listed.len());
        for info in listed {
            // Ids are checked by the fan-out, pass empty ones through untouched
            if info.id.is_empty() {
                records.push(info.into());
                continue;
            }

            match self.docker_container(&info.id).await {
                Ok(fresh) => records.push(fresh.into()),
                Err(e) => {
                    warn!(container_id = %info.id, error = %e, "Failed to refresh container snapshot");
                }
            }
        }

        Ok(records)
    }

    async fn host_memory(&self) -> Result<u64> {
        Ok(self.machine_info().await?.memory_capacity)
    }
}
