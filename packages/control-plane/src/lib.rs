// packages/control-plane/src/lib.rs
//! Fleet Control Library
//!
//! Control plane for a fleet of long-running worker agents: who is alive,
//! which agent should take a task, and whether that agent has the capacity.
//!
//! # Architecture
//!
//! The crate is structured into several key modules:
//!
//! - **registry**: Authoritative agent records, health and load bookkeeping, liveness sweep
//! - **discovery**: Capability lookup and pluggable selection strategies
//! - **allocation**: Quota arithmetic, per-agent capacity ledger, reservations, tenant quotas
//! - **runtime**: Resilient agent runtime (connections, circuit breakers, retries, bounded execution)
//! - **messaging**: Pub/sub seam between agents and the control plane, plus an in-process bus
//! - **storage**: SQLite agent reports and allocation audit trail
//! - **control_plane**: Facade owning the registry, discovery, allocator and background workers
//! - **observability**: Tracing and metrics initialisation
//! - **utils**: Configuration and error types

// Public module exports
pub mod allocation;
pub mod control_plane;
pub mod discovery;
pub mod messaging;
pub mod observability;
pub mod registry;
pub mod runtime;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use allocation::{AllocationRequest, ResourceAllocator, ResourceQuota};
pub use control_plane::ControlPlane;
pub use discovery::{AgentDiscovery, DiscoveryRequest, SelectionStrategy};
pub use registry::{AgentRecord, AgentRegistration, AgentRegistry, AgentStatus};
pub use runtime::{AgentRuntime, AgentState, RuntimeConfig, TaskHandler, TaskRequest, TaskResponse};
pub use utils::config::ControlPlaneConfig;
pub use utils::errors::{ControlPlaneError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
        assert!(!info.git_hash.is_empty());
    }
}
