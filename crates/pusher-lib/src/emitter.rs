//! Push of single metric points to the local open-falcon agent
//!
//! One point per HTTP call, no batching and no retry. Failures are handed
//! back to the caller, which logs them and moves on.

use crate::error::{CollectorError, Result};
use crate::models::{CounterType, MetricPoint};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Destination for metric points
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn push(&self, point: &MetricPoint) -> Result<()>;
}

/// Serialize a point the way the falcon agent expects it: a one-element array
pub fn encode_point(point: &MetricPoint) -> Result<String> {
    serde_json::to_string(&[point]).map_err(|e| CollectorError::EmitFailure(e.to_string()))
}

/// HTTP sink posting to `/v1/push` on the falcon agent
pub struct FalconSink {
    client: Client,
    push_url: Url,
}

impl FalconSink {
    /// Sink for the agent listening on `127.0.0.1:<agent_port>`
    pub fn new(agent_port: u16, timeout: Duration) -> Result<Self> {
        Self::with_base_url(&format!("http://127.0.0.1:{}/", agent_port), timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollectorError::Config(format!("failed to create HTTP client: {}", e)))?;

        let push_url = Url::parse(base_url)
            .and_then(|u| u.join("/v1/push"))
            .map_err(|e| CollectorError::Config(format!("invalid agent URL: {}", e)))?;

        Ok(Self { client, push_url })
    }

    pub fn push_url(&self) -> &Url {
        &self.push_url
    }
}

#[async_trait]
impl MetricSink for FalconSink {
    async fn push(&self, point: &MetricPoint) -> Result<()> {
        let body = encode_point(point)?;

        let response = self
            .client
            .post(self.push_url.clone())
            .header(CONTENT_TYPE, FORM_URLENCODED)
            .body(body)
            .send()
            .await
            .map_err(|e| CollectorError::EmitFailure(e.to_string()))?;

        let status = response.status();
        let reply = response
            .text()
            .await
            .map_err(|e| CollectorError::EmitFailure(format!("unreadable response: {}", e)))?;

        if !status.is_success() {
            return Err(CollectorError::EmitFailure(format!("HTTP {}: {}", status, reply)));
        }

        debug!(metric = %point.metric, endpoint = %point.endpoint, reply = %reply, "Pushed point");
        Ok(())
    }
}

/// Stamps endpoint, timestamp, step and tags onto points for one target
#[derive(Debug, Clone)]
pub struct PointBuilder {
    endpoint: String,
    timestamp: i64,
    step: u64,
    tags: String,
}

impl PointBuilder {
    pub fn new(endpoint: impl Into<String>, timestamp: i64, step: u64, tags: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timestamp,
            step,
            tags: tags.into(),
        }
    }

    /// Endpoint name used for a container's own points
    pub fn container_endpoint(container_id: &str) -> String {
        format!("docker-{}", container_id)
    }

    pub fn point(&self, metric: &str, value: f64, counter_type: CounterType) -> MetricPoint {
        self.point_with_tags(metric, value, counter_type, self.tags.clone())
    }

    /// Point carrying the base tags plus one extra `key=value`
    pub fn tagged_point(
        &self,
        metric: &str,
        value: f64,
        counter_type: CounterType,
        key: &str,
        tag_value: &str,
    ) -> MetricPoint {
        let extra = format!("{}={}", key, tag_value);
        let tags = if self.tags.is_empty() {
            extra
        } else {
            format!("{},{}", self.tags, extra)
        };
        self.point_with_tags(metric, value, counter_type, tags)
    }

    fn point_with_tags(
        &self,
        metric: &str,
        value: f64,
        counter_type: CounterType,
        tags: String,
    ) -> MetricPoint {
        MetricPoint {
            metric: metric.to_string(),
            endpoint: self.endpoint.clone(),
            timestamp: self.timestamp,
            step: self.step,
            value,
            counter_type,
            tags,
        }
    }
}
