// packages/control-plane/src/control_plane/mod.rs
//! Control plane service
//!
//! Ties the registry, discovery and allocator together and owns the
//! background workers that keep them honest:
//!
//! ```text
//!                 ┌──────────────── ControlPlane ────────────────┐
//! bus ──register──►  AgentRegistry ◄── AgentDiscovery            │
//!     ──heartbeat─►       │                                      │
//!     ──deregister►       ▼ (swept / deregistered agents)        │
//!                 │  ResourceAllocator ──audit──► AuditWriter ──►│ ReportStore
//!                 └──────────────────────────────────────────────┘
//!
//! workers: cleanup (stale agents) · monitoring (stats, reports) · expiry (allocations)
//! ```

pub mod service;

pub use service::{ControlPlane, ControlPlaneStatus};
