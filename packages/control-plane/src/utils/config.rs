// packages/control-plane/src/utils/config.rs
//! Control plane configuration
//!
//! Values are layered in this order (later wins):
//!
//! 1. Built-in defaults (`ControlPlaneConfig::default()`)
//! 2. Optional file: `$FLEET_CONFIG`, or `fleet.toml` in the working directory
//! 3. Environment variables: `FLEET__REGISTRY__HEARTBEAT_TIMEOUT_SECS=120`

use crate::allocation::AllocatorConfig;
use crate::registry::RegistryConfig;
use crate::runtime::RuntimeConfig;
use crate::storage::StorageConfig;
use crate::utils::errors::{ControlPlaneError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "FLEET_CONFIG";

/// Default config file name
pub const DEFAULT_CONFIG_FILE: &str = "fleet.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub registry: RegistryConfig,
    pub allocator: AllocatorConfig,
    pub runtime: RuntimeConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ControlPlaneConfig {
    /// Load configuration from defaults, optional file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&path)
    }

    /// Load configuration using an explicit file path (missing file is not an error)
    pub fn load_from(path: &str) -> Result<Self> {
        debug!("Loading configuration (file: {})", path);

        let settings = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("FLEET")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("runtime.capabilities")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the control plane cannot run with
    pub fn validate(&self) -> Result<()> {
        let registry = &self.registry;
        if registry.heartbeat_timeout_secs == 0 {
            return Err(ControlPlaneError::ConfigError(
                "registry.heartbeat_timeout_secs must be positive".to_string(),
            ));
        }
        if registry.cleanup_interval_secs == 0 || registry.health_check_interval_secs == 0 {
            return Err(ControlPlaneError::ConfigError(
                "registry intervals must be positive".to_string(),
            ));
        }
        registry.failure_policy.validate()?;

        if self.allocator.expiry_sweep_interval_secs == 0 {
            return Err(ControlPlaneError::ConfigError(
                "allocator.expiry_sweep_interval_secs must be positive".to_string(),
            ));
        }
        self.allocator
            .default_agent_quota
            .validate()
            .and_then(|_| self.allocator.max_agent_quota.validate())
            .map_err(|e| ControlPlaneError::ConfigError(format!("allocator quota: {}", e)))?;

        self.runtime.validate()?;
        Ok(())
    }
}
