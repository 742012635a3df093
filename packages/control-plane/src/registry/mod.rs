// packages/control-plane/src/registry/mod.rs
//! Agent registry
//!
//! - **Agent**: Identity, health and load record for one worker
//! - **Agent Registry**: Authoritative map plus type/capability indices,
//!   heartbeat and failure bookkeeping, stale-agent sweep
//!
//! # Health
//!
//! ```text
//! healthy   = status == Active ∧ health ≥ 0.5 ∧ failures < 3 ∧ heartbeat fresh
//! available = healthy ∧ current_load < max_load
//! ```

pub mod agent;
pub mod agent_registry;

pub use agent::{AgentRecord, AgentRegistration, AgentStatus, HeartbeatMetrics};
pub use agent_registry::{
    sort_by_load_then_health, AgentRegistry, FailurePolicy, LoadGuard, RegistryConfig, RegistryStatistics,
};
