// packages/control-plane/src/storage/mod.rs
//! Persistence for agent reports and the allocation audit trail
//!
//! Storage is optional: with `storage.enabled = false` the control plane
//! runs entirely in memory.

pub mod audit;
pub mod report_store;

pub use audit::{AuditWriter, AuditWriterStats};
pub use report_store::{AgentReport, ReportStore, StorageConfig, StorageStats};
