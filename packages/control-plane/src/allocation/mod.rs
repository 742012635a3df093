// packages/control-plane/src/allocation/mod.rs
//! Resource allocation
//!
//! - **Quota**: Vector arithmetic over CPU, memory, GPU, storage, network and named extras
//! - **Allocator**: Per-agent capacity ledger, bin-packing placement, reservations,
//!   tenant quotas and the expiry sweep
//!
//! # Ledger
//!
//! ```text
//! AgentResources
//! ├─ total       (registered capacity)
//! ├─ allocated   (committed grants)
//! ├─ reserved    (soft holds, expire on their own)
//! └─ available = total − allocated − reserved
//! ```

pub mod allocator;
pub mod quota;

pub use allocator::{
    AgentResources, AllocationRequest, AllocatorConfig, AllocatorStatistics, AuditEvent, AuditKind,
    Reservation, ResourceAllocation, ResourceAllocator, SweepReport,
};
pub use quota::ResourceQuota;
