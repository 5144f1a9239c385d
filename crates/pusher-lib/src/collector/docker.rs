//! Container metadata from the Docker engine
//!
//! The Docker handle is created lazily on first lookup and then shared by
//! every concurrent unit; `OnceCell` guarantees exactly one handle even when
//! the first lookups race.

use super::{ContainerMetadata, MetadataSource};
use crate::error::{CollectorError, Result};
use async_trait::async_trait;
use bollard::query_parameters::InspectContainerOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Logical cores visible to this process, never 0
pub fn host_core_count() -> u64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u64)
        .unwrap_or(1)
        .max(1)
}

/// Docker-backed metadata source
pub struct DockerMetadata {
    socket: String,
    timeout: Duration,
    core_count: u64,
    docker: OnceCell<Docker>,
}

impl DockerMetadata {
    /// `socket` is `unix:///path`, a bare socket path, or `tcp://`/`http://` address
    pub fn new(socket: impl Into<String>, timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            timeout,
            core_count: host_core_count(),
            docker: OnceCell::new(),
        }
    }

    /// Override the core count reported for every container
    pub fn with_core_count(mut self, core_count: u64) -> Self {
        self.core_count = core_count.max(1);
        self
    }

    fn connect(&self) -> Result<Docker> {
        let timeout_secs = self.timeout.as_secs().max(1);

        let docker = if let Some(addr) = self.socket.strip_prefix("tcp://") {
            Docker::connect_with_http(&format!("http://{}", addr), timeout_secs, API_DEFAULT_VERSION)
        } else if self.socket.starts_with("http://") {
            Docker::connect_with_http(&self.socket, timeout_secs, API_DEFAULT_VERSION)
        } else {
            let path = self.socket.strip_prefix("unix://").unwrap_or(&self.socket);
            Docker::connect_with_unix(path, timeout_secs, API_DEFAULT_VERSION)
        };

        let docker = docker.map_err(CollectorError::docker)?;
        info!(socket = %self.socket, "Created Docker client");
        Ok(docker)
    }

    async fn client(&self) -> Result<&Docker> {
        self.docker
            .get_or_try_init(|| async { self.connect() })
            .await
    }
}

#[async_trait]
impl MetadataSource for DockerMetadata {
    async fn inspect(&self, container_id: &str) -> Result<ContainerMetadata> {
        let docker = self.client().await?;

        let inspect = docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| CollectorError::docker(format!("inspect {}: {}", container_id, e)))?;

        debug!(
            container_id = %container_id,
            name = ?inspect.name,
            core_count = self.core_count,
            "Inspected container"
        );

        // Rates are normalized against the collector host's cores
        Ok(ContainerMetadata {
            core_count: self.core_count,
        })
    }
}
