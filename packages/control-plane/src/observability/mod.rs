// packages/control-plane/src/observability/mod.rs
//! Logging and metrics initialisation
//!
//! Structured logs go through `tracing`; counters, gauges and histograms go
//! through the `metrics` facade. Installing an exporter is left to the
//! embedding process.

use crate::utils::config::LoggingConfig;
use crate::utils::errors::{ControlPlaneError, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING: OnceCell<()> = OnceCell::new();
static METRICS: OnceCell<()> = OnceCell::new();

pub const TASKS_TOTAL: &str = "fleet_tasks_total";
pub const TASK_DURATION_MS: &str = "fleet_task_duration_ms";
pub const TASK_RETRIES_TOTAL: &str = "fleet_task_retries_total";
pub const ALLOCATIONS_TOTAL: &str = "fleet_allocations_total";
pub const REGISTRY_AGENTS: &str = "fleet_registry_agents";
pub const REGISTRY_HEALTH_AVG: &str = "fleet_registry_health_avg";
pub const CIRCUIT_TRANSITIONS_TOTAL: &str = "fleet_circuit_transitions_total";
pub const CONNECTION_ATTEMPTS_TOTAL: &str = "fleet_connection_attempts_total";

/// Install the global tracing subscriber (idempotent)
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    TRACING
        .get_or_try_init(|| {
            let filter = EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.level))
                .map_err(|e| ControlPlaneError::ConfigError(format!("Invalid log filter: {}", e)))?;

            let registry = tracing_subscriber::registry().with(filter);
            let installed = if config.json {
                registry.with(fmt::layer().json().with_current_span(false)).try_init()
            } else {
                registry.with(fmt::layer().with_target(true)).try_init()
            };

            installed.map_err(|e| {
                ControlPlaneError::ConfigError(format!("Failed to install tracing subscriber: {}", e))
            })
        })
        .map(|_| ())
}

/// Register metric descriptions (idempotent)
pub fn init_metrics() -> Result<()> {
    METRICS.get_or_init(|| {
        describe_counter!(TASKS_TOTAL, "Tasks finished, labelled by outcome");
        describe_histogram!(TASK_DURATION_MS, Unit::Milliseconds, "Task processing time");
        describe_counter!(TASK_RETRIES_TOTAL, "Task attempts scheduled after a failure");
        describe_counter!(ALLOCATIONS_TOTAL, "Allocation attempts, labelled by result");
        describe_gauge!(REGISTRY_AGENTS, "Registered agents, labelled by status");
        describe_gauge!(REGISTRY_HEALTH_AVG, "Average health score across agents");
        describe_counter!(CIRCUIT_TRANSITIONS_TOTAL, "Circuit breaker transitions, labelled by target state");
        describe_counter!(CONNECTION_ATTEMPTS_TOTAL, "Dependency connection attempts, labelled by result");
    });
    Ok(())
}
