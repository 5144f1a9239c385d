//! falcon-pusher - cAdvisor to open-falcon metrics pusher
//!
//! Runs next to cAdvisor and the falcon agent on every node. Each interval
//! it derives per-container CPU, memory, disk and network rates and pushes
//! them, one point per request, to the local agent.

use anyhow::{Context, Result};
use clap::Parser;
use pusher_lib::{
    collector::{CadvisorClient, DockerMetadata, FanOut, PushLoopBuilder, SnapshotSource},
    emitter::FalconSink,
    health::HealthRegistry,
    observability::{PusherMetrics, StructuredLogger},
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const PUSHER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pushes cAdvisor container metrics to a local open-falcon agent
#[derive(Parser)]
#[command(name = "falcon-pusher")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML config file; a missing file means all defaults
    #[arg(
        long,
        env = "PUSHER_CONFIG_FILE",
        default_value = "cadvisor_collector_config.yaml"
    )]
    config_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(config_file = %args.config_file.display(), "Starting falcon-pusher");

    let config = config::PusherConfig::load(&args.config_file)?;
    let hostname = config.resolve_hostname();
    if hostname.is_empty() {
        warn!("Could not determine host name, container.num will not be pushed");
    }
    info!(
        hostname = %hostname,
        cadvisor = %format!("{}:{}", config.cadvisor_host, config.cadvisor_port),
        agent_port = config.agent_port,
        docker = %config.docker_socket,
        "Pusher configured"
    );

    let timeout = config.request_timeout();
    let source = Arc::new(CadvisorClient::new(
        &config.cadvisor_host,
        config.cadvisor_port,
        timeout,
    )?);
    let metadata = Arc::new(DockerMetadata::new(config.docker_socket.clone(), timeout));
    let sink = Arc::new(FalconSink::new(config.agent_port, timeout)?);

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;
    let metrics = PusherMetrics::new();
    let logger = StructuredLogger::new(hostname.clone());

    // Without host memory the limit clamp is meaningless, so this is fatal
    let host_memory = match source.host_memory().await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "Failed to read host memory from cAdvisor");
            return Err(e).context("host memory is required at startup");
        }
    };

    logger.log_startup(PUSHER_VERSION, config.interval_secs, host_memory);
    health_registry.set_ready(true).await;

    let api_handle = if config.api_port != 0 {
        let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
        Some(tokio::spawn(api::serve(config.api_port, app_state)))
    } else {
        None
    };

    let fanout = FanOut::new(
        metadata,
        sink,
        host_memory,
        config.fanout_config(hostname),
    );
    let push_loop = PushLoopBuilder::new()
        .source(source)
        .fanout(fanout)
        .health(health_registry)
        .interval(config.interval())
        .build()?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let loop_handle = tokio::spawn(push_loop.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    // The loop finishes its current cycle before it sees the signal
    let _ = shutdown_tx.send(());
    if let Err(e) = loop_handle.await {
        error!(error = %e, "Push loop task failed");
    }
    if let Some(handle) = api_handle {
        handle.abort();
    }

    info!("Shutdown complete");
    Ok(())
}
