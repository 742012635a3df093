// packages/control-plane/src/discovery/mod.rs
//! Agent discovery
//!
//! Queries the registry for capability-matching available agents, narrows
//! them with request filters, then orders them with a selection strategy.
//!
//! ```text
//! Registry (available, load asc / health desc)
//!     → exclude set → min health → preferred version → tags
//!     → strategy (least loaded | round robin | random | health weighted | fastest)
//! ```

pub mod agent_discovery;
pub mod strategy;

pub use agent_discovery::AgentDiscovery;
pub use strategy::{DiscoveryRequest, SelectionStrategy};
