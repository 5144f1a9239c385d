//! Pusher configuration

use anyhow::{bail, Context, Result};
use config::Source;
use pusher_lib::collector::FanOutConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Pusher configuration
///
/// Read from an optional YAML file, then overridden by `PUSHER_*`
/// environment variables. The short key names of older config files are
/// renamed to their current names before the environment is applied.
#[derive(Debug, Clone, Deserialize)]
pub struct PusherConfig {
    /// Port of the falcon agent on localhost
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    #[serde(default = "default_cadvisor_host")]
    pub cadvisor_host: String,

    #[serde(default = "default_cadvisor_port")]
    pub cadvisor_port: u16,

    /// Docker engine endpoint, `unix://` path or `tcp://host:port`
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,

    /// Seconds between cycles, also the push step
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Containers carrying this label are left out of `container.num`
    #[serde(default = "default_not_count_label")]
    pub not_count_label: String,

    /// Label a container needs to be reported at all
    #[serde(default = "default_orchestrator_label")]
    pub orchestrator_label: String,

    #[serde(default = "default_orchestrator_tag")]
    pub orchestrator_tag: String,

    /// Static `k=v,k=v` tags prepended to every container point
    #[serde(default)]
    pub extra_tags: String,

    /// Timeout for each cAdvisor, Docker and agent call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Port of the health/metrics server, 0 disables it
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Endpoint of the `container.num` point; detected when unset
    #[serde(default)]
    pub hostname: Option<String>,
}

fn default_agent_port() -> u16 {
    1988
}

fn default_cadvisor_host() -> String {
    "127.0.0.1".to_string()
}

fn default_cadvisor_port() -> u16 {
    18080
}

fn default_docker_socket() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_interval() -> u64 {
    10
}

fn default_not_count_label() -> String {
    "dcos-container".to_string()
}

fn default_orchestrator_label() -> String {
    "dcos-marathon-id".to_string()
}

fn default_orchestrator_tag() -> String {
    "marathon_id".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_api_port() -> u16 {
    8080
}

/// Older file keys and the field each one maps to
const LEGACY_KEYS: &[(&str, &str)] = &[
    ("agent_point", "agent_port"),
    ("interval", "interval_secs"),
    ("docker_not_count_label", "not_count_label"),
];

impl PusherConfig {
    /// Load configuration from the config file and the environment
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Same as [`load`](Self::load) with an explicit environment map
    fn load_with_env(path: &Path, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut file_values = config::File::from(path)
            .format(config::FileFormat::Yaml)
            .required(false)
            .collect()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        // One key per setting, otherwise an env override next to a legacy
        // file key deserializes as a duplicate field. Current names win.
        for (legacy, current) in LEGACY_KEYS {
            if let Some(value) = file_values.remove(*legacy) {
                file_values.entry(current.to_string()).or_insert(value);
            }
        }

        let mut builder = config::Config::builder();
        for (key, value) in file_values {
            builder = builder.set_default(key, value)?;
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("PUSHER")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .context("Failed to read configuration from the environment")?;

        let config: PusherConfig = config
            .try_deserialize()
            .context("Invalid pusher configuration")?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            bail!("interval must be at least 1 second");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be at least 1 second");
        }
        if self.cadvisor_host.is_empty() {
            bail!("cadvisor_host must not be empty");
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Host name for the aggregate point: configured, then `HOSTNAME`,
    /// then the OS host name. Empty when none is available.
    pub fn resolve_hostname(&self) -> String {
        if let Some(name) = self.hostname.as_ref().filter(|n| !n.is_empty()) {
            return name.clone();
        }
        if let Ok(name) = std::env::var("HOSTNAME") {
            if !name.is_empty() {
                return name;
            }
        }
        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_default()
    }

    /// Settings shared by every container unit of a cycle
    pub fn fanout_config(&self, hostname: String) -> FanOutConfig {
        FanOutConfig {
            orchestrator_label: self.orchestrator_label.clone(),
            orchestrator_tag: self.orchestrator_tag.clone(),
            not_count_label: self.not_count_label.clone(),
            extra_tags: self.extra_tags.clone(),
            step: self.interval_secs,
            hostname,
        }
    }
}
