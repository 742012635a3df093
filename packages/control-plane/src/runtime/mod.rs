// packages/control-plane/src/runtime/mod.rs
//! Resilient agent runtime
//!
//! Everything an agent process needs to serve tasks while its dependencies
//! come and go:
//!
//! - **Agent Runtime**: lifecycle, registration, heartbeats, shutdown
//! - **Executor**: bounded concurrency, timeouts, retries, processing stats
//! - **Circuit Breaker**: per task type and per dependency
//! - **Connections**: dependency connection state machine with backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── AgentRuntime ────────────────────────────┐
//! │                                                                      │
//! │  bus subscriptions ──▶ TaskExecutor ──▶ TaskHandler (per task type)  │
//! │   tasks / broadcast     │ semaphore (max_concurrent_tasks)           │
//! │   status / health       │ breaker per task type                      │
//! │                         │ retry with backoff                         │
//! │                                                                      │
//! │  heartbeat loop ──▶ bus + registry                                   │
//! │  monitor loop   ──▶ ManagedConnection (bus, store, ...)              │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod agent_runtime;
pub mod circuit_breaker;
pub mod connection;
pub mod executor;
pub mod retry;
pub mod task;

pub use agent_runtime::{derive_state, AgentRuntime, AgentState, DependencyHealth, HealthSnapshot, RuntimeConfig};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use connection::{ConnectionSettings, ConnectionState, Dependency, ManagedConnection};
pub use executor::{ExecutorConfig, ExecutorStats, ProcessingSnapshot, ProcessingStats, TaskExecutor};
pub use retry::RetryPolicy;
pub use task::{TaskHandler, TaskOutcome, TaskPriority, TaskRequest, TaskResponse, ALLOCATION_METADATA_KEY};
