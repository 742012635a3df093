// packages/control-plane/src/main.rs
//! Fleet Control daemon
//!
//! Runs the control plane (registry, discovery, allocator and their
//! background workers) on an in-process message bus, optionally hosting one
//! local agent runtime alongside it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleet_control::messaging::InMemoryBus;
use fleet_control::observability::{init_metrics, init_tracing};
use fleet_control::{BuildInfo, ControlPlane, ControlPlaneConfig, TaskHandler, TaskRequest};
use std::sync::Arc;
use tracing::{info, warn};

/// Diagnostic handler: answers with the payload it was given
struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, task: &TaskRequest) -> fleet_control::Result<serde_json::Value> {
        Ok(task.payload.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration first: it carries the log level
    let config = ControlPlaneConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.logging)?;
    init_metrics()?;

    let build = BuildInfo::current();
    info!(
        "Starting Fleet Control v{} ({}, built {} with {})",
        build.version, build.git_hash, build.build_timestamp, build.rustc_version
    );

    let runtime_config = config.runtime.clone();
    let plane = Arc::new(ControlPlane::from_config(config).await?);
    let bus = Arc::new(InMemoryBus::new());
    plane.attach_bus(bus.clone()).await?;
    plane.start().await?;

    let runtime = if runtime_config.enabled {
        let runtime = Arc::new(
            plane
                .local_runtime(runtime_config, bus.clone())?
                .with_handler("echo", Arc::new(EchoHandler)),
        );
        runtime.start().await?;
        info!("Local agent {} is {}", runtime.agent_id(), runtime.state());
        Some(runtime)
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C signal handler")?;
    info!("Received shutdown signal, cleaning up...");

    if let Some(runtime) = runtime {
        if let Err(e) = runtime.shutdown().await {
            warn!("Local agent shutdown failed: {}", e);
        }
    }
    plane.shutdown().await;

    info!("Fleet Control stopped");
    Ok(())
}
