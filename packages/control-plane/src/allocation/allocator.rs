// packages/control-plane/src/allocation/allocator.rs
//! Quota-based resource allocator
//!
//! Tracks per-agent capacity (`total`, `allocated`, `reserved`), the table of
//! active allocations, time-bounded reservations and per-tenant usage.
//!
//! # Invariant
//!
//! For every agent, `allocated + reserved` fits within `total`. All ledger
//! mutations happen inside one critical section, so two concurrent
//! allocations can never both claim the same capacity.

use crate::allocation::quota::ResourceQuota;
use crate::observability::ALLOCATIONS_TOTAL;
use crate::utils::errors::{ControlPlaneError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// `now + secs`, rejecting durations chrono cannot represent
fn expiry_after(now: DateTime<Utc>, secs: u64) -> Result<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .and_then(|duration| now.checked_add_signed(duration))
        .ok_or_else(|| ControlPlaneError::ValidationFailed(format!("duration of {}s is out of range", secs)))
}

/// Allocator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Interval between expiry sweeps (default: 60)
    pub expiry_sweep_interval_secs: u64,

    /// Capacity assumed for agents that register without an explicit total
    pub default_agent_quota: ResourceQuota,

    /// Upper bound for any single agent's registered total
    pub max_agent_quota: ResourceQuota,

    /// Tenant quotas known at startup
    pub tenant_quotas: HashMap<String, ResourceQuota>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            expiry_sweep_interval_secs: 60,
            default_agent_quota: ResourceQuota::cpu_mem(4.0, 8192.0).with_storage(100.0),
            max_agent_quota: ResourceQuota::cpu_mem(256.0, 2_097_152.0)
                .with_gpus(16.0)
                .with_storage(100_000.0)
                .with_network(100_000.0),
            tenant_quotas: HashMap::new(),
        }
    }
}

impl AllocatorConfig {
    pub fn expiry_sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.expiry_sweep_interval_secs)
    }
}

/// Capacity ledger for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResources {
    pub agent_id: String,
    pub total: ResourceQuota,
    pub allocated: ResourceQuota,
    pub reserved: ResourceQuota,
    pub updated_at: DateTime<Utc>,
}

impl AgentResources {
    fn new(agent_id: &str, total: ResourceQuota) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            total,
            allocated: ResourceQuota::zero(),
            reserved: ResourceQuota::zero(),
            updated_at: Utc::now(),
        }
    }

    /// `allocated + reserved`
    pub fn committed(&self) -> ResourceQuota {
        &self.allocated + &self.reserved
    }

    /// `total - allocated - reserved`
    pub fn available(&self) -> ResourceQuota {
        &self.total - &self.committed()
    }

    /// CPU utilisation ratio of committed allocations
    pub fn utilization(&self) -> f64 {
        self.allocated.cpu_ratio(&self.total)
    }
}

/// A committed resource grant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub allocation_id: String,
    pub agent_id: String,
    pub task_id: String,
    pub tenant_id: Option<String>,
    pub quota: ResourceQuota,
    pub allocated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ResourceAllocation {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires| now >= expires)
    }
}

/// A time-bounded soft hold on capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: String,
    pub agent_id: String,
    pub quota: ResourceQuota,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Parameters for `allocate_resources`
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub task_id: String,
    pub required: ResourceQuota,
    pub tenant_id: Option<String>,
    pub timeout_secs: Option<u64>,
    pub preferred_agent: Option<String>,
}

impl AllocationRequest {
    pub fn new(task_id: impl Into<String>, required: ResourceQuota) -> Self {
        Self {
            task_id: task_id.into(),
            required,
            tenant_id: None,
            timeout_secs: None,
            preferred_agent: None,
        }
    }

    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn prefer_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.preferred_agent = Some(agent_id.into());
        self
    }
}

/// Audit trail entry kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Allocated,
    Released,
    Expired,
    Reserved,
    ReservationReleased,
    ReservationExpired,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::Allocated => "allocated",
            AuditKind::Released => "released",
            AuditKind::Expired => "expired",
            AuditKind::Reserved => "reserved",
            AuditKind::ReservationReleased => "reservation_released",
            AuditKind::ReservationExpired => "reservation_expired",
        }
    }
}

/// Allocation audit event, consumed by the storage writer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: AuditKind,
    /// Allocation or reservation id
    pub record_id: String,
    pub agent_id: String,
    pub task_id: Option<String>,
    pub tenant_id: Option<String>,
    pub quota: ResourceQuota,
    pub at: DateTime<Utc>,
}

/// Aggregate allocator statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocatorStatistics {
    pub total_agents: usize,
    pub active_allocations: usize,
    pub active_reservations: usize,
    pub total_cpu_cores: f64,
    pub allocated_cpu_cores: f64,
    pub reserved_cpu_cores: f64,
    pub total_memory_mb: f64,
    pub allocated_memory_mb: f64,
    pub reserved_memory_mb: f64,
    pub cpu_utilization_pct: f64,
    pub memory_utilization_pct: f64,
    pub gpu_utilization_pct: f64,
}

/// Result of one expiry sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub allocations_released: Vec<String>,
    pub reservations_released: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.allocations_released.is_empty() && self.reservations_released.is_empty()
    }
}

#[derive(Default)]
struct LedgerState {
    agents: HashMap<String, AgentResources>,
    allocations: HashMap<String, ResourceAllocation>,
    reservations: HashMap<String, Reservation>,
    tenant_quotas: HashMap<String, ResourceQuota>,
    tenant_usage: HashMap<String, ResourceQuota>,
}

impl LedgerState {
    /// Undo an allocation; caller has already removed it from the table
    fn unwind_allocation(&mut self, allocation: &ResourceAllocation) {
        if let Some(resources) = self.agents.get_mut(&allocation.agent_id) {
            resources.allocated = &resources.allocated - &allocation.quota;
            resources.updated_at = Utc::now();
        }
        if let Some(tenant) = &allocation.tenant_id {
            if let Some(usage) = self.tenant_usage.get_mut(tenant) {
                *usage = &*usage - &allocation.quota;
            }
        }
    }

    fn unwind_reservation(&mut self, reservation: &Reservation) {
        if let Some(resources) = self.agents.get_mut(&reservation.agent_id) {
            resources.reserved = &resources.reserved - &reservation.quota;
            resources.updated_at = Utc::now();
        }
    }

    fn pick_agent(&self, required: &ResourceQuota, preferred: Option<&str>) -> Option<String> {
        if let Some(preferred) = preferred {
            match self.agents.get(preferred) {
                Some(resources) if required.fits_within(&resources.available()) => {
                    return Some(preferred.to_string());
                }
                Some(_) => debug!("Preferred agent {} lacks capacity, scanning others", preferred),
                None => debug!("Preferred agent {} has no registered resources", preferred),
            }
        }

        self.agents
            .values()
            .filter(|resources| required.fits_within(&resources.available()))
            .map(|resources| (resources.utilization(), &resources.agent_id))
            .min_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)))
            .map(|(_, agent_id)| agent_id.clone())
    }
}

/// Resource allocator
pub struct ResourceAllocator {
    config: AllocatorConfig,
    state: Mutex<LedgerState>,
    audit: Option<UnboundedSender<AuditEvent>>,
}

impl ResourceAllocator {
    /// Create an allocator, seeding tenant quotas from config
    pub fn new(config: AllocatorConfig) -> Self {
        let state = LedgerState {
            tenant_quotas: config.tenant_quotas.clone(),
            ..Default::default()
        };

        Self {
            config,
            state: Mutex::new(state),
            audit: None,
        }
    }

    /// Attach an audit sink; every ledger change is sent to it
    pub fn with_audit_sink(mut self, sink: UnboundedSender<AuditEvent>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    fn emit(
        &self,
        kind: AuditKind,
        record_id: &str,
        agent_id: &str,
        task_id: Option<&str>,
        tenant_id: Option<&str>,
        quota: &ResourceQuota,
    ) {
        if let Some(sink) = &self.audit {
            let event = AuditEvent {
                kind,
                record_id: record_id.to_string(),
                agent_id: agent_id.to_string(),
                task_id: task_id.map(str::to_string),
                tenant_id: tenant_id.map(str::to_string),
                quota: quota.clone(),
                at: Utc::now(),
            };
            if sink.send(event).is_err() {
                debug!("Audit sink closed, dropping {} event", kind.as_str());
            }
        }
    }

    /// Register (or re-register) an agent's total capacity
    pub fn register_agent_resources(&self, agent_id: &str, total: ResourceQuota) -> Result<()> {
        self.check_total(&total)?;

        let mut state = self.state.lock();
        match state.agents.get_mut(agent_id) {
            Some(existing) => {
                if !existing.committed().fits_within(&total) {
                    return Err(ControlPlaneError::ValidationFailed(format!(
                        "New total for {} is below its current commitments",
                        agent_id
                    )));
                }
                existing.total = total;
                existing.updated_at = Utc::now();
                debug!("Re-registered resources for agent {}", agent_id);
            }
            None => {
                info!(
                    "Registered resources for agent {} (cpu={}, memory_mb={})",
                    agent_id, total.cpu_cores, total.memory_mb
                );
                state.agents.insert(agent_id.to_string(), AgentResources::new(agent_id, total));
            }
        }
        Ok(())
    }

    /// Register an agent with the configured default capacity
    pub fn register_agent_default(&self, agent_id: &str) -> Result<()> {
        self.register_agent_resources(agent_id, self.config.default_agent_quota.clone())
    }

    /// Change an agent's total; returns `Ok(false)` for unknown agents
    pub fn update_agent_resources(&self, agent_id: &str, total: ResourceQuota) -> Result<bool> {
        self.check_total(&total)?;

        let mut state = self.state.lock();
        let Some(resources) = state.agents.get_mut(agent_id) else {
            return Ok(false);
        };

        if !resources.committed().fits_within(&total) {
            return Err(ControlPlaneError::ValidationFailed(format!(
                "New total for {} is below its current commitments",
                agent_id
            )));
        }

        resources.total = total;
        resources.updated_at = Utc::now();
        Ok(true)
    }

    fn check_total(&self, total: &ResourceQuota) -> Result<()> {
        total.validate()?;
        if !total.fits_within(&self.config.max_agent_quota) {
            return Err(ControlPlaneError::ValidationFailed(
                "Agent total exceeds the configured maximum quota".to_string(),
            ));
        }
        Ok(())
    }

    /// Remove an agent, releasing all of its allocations and reservations first
    pub fn deregister_agent_resources(&self, agent_id: &str) -> bool {
        let mut state = self.state.lock();
        if !state.agents.contains_key(agent_id) {
            return false;
        }

        let allocation_ids: Vec<String> = state
            .allocations
            .values()
            .filter(|a| a.agent_id == agent_id)
            .map(|a| a.allocation_id.clone())
            .collect();
        for allocation_id in &allocation_ids {
            if let Some(allocation) = state.allocations.remove(allocation_id) {
                state.unwind_allocation(&allocation);
                self.emit(
                    AuditKind::Released,
                    allocation_id,
                    agent_id,
                    Some(&allocation.task_id),
                    allocation.tenant_id.as_deref(),
                    &allocation.quota,
                );
            }
        }

        let reservation_ids: Vec<String> = state
            .reservations
            .values()
            .filter(|r| r.agent_id == agent_id)
            .map(|r| r.reservation_id.clone())
            .collect();
        for reservation_id in &reservation_ids {
            if let Some(reservation) = state.reservations.remove(reservation_id) {
                state.unwind_reservation(&reservation);
                self.emit(AuditKind::ReservationReleased, reservation_id, agent_id, None, None, &reservation.quota);
            }
        }

        state.agents.remove(agent_id);
        info!(
            "Deregistered resources for agent {} ({} allocations, {} reservations released)",
            agent_id,
            allocation_ids.len(),
            reservation_ids.len()
        );
        true
    }

    /// Place `request` on an agent.
    ///
    /// Returns `Ok(None)` when the tenant quota or every agent's capacity is
    /// insufficient, `Err` only for a malformed request.
    pub fn allocate_resources(&self, request: &AllocationRequest) -> Result<Option<ResourceAllocation>> {
        request.required.validate()?;
        let now = Utc::now();
        let expires_at = request
            .timeout_secs
            .map(|secs| expiry_after(now, secs))
            .transpose()?;

        let mut state = self.state.lock();

        if let Some(tenant) = &request.tenant_id {
            if let Some(limit) = state.tenant_quotas.get(tenant) {
                let usage = state.tenant_usage.get(tenant).cloned().unwrap_or_default();
                if !(&usage + &request.required).fits_within(limit) {
                    warn!("Tenant {} quota exceeded for task {}", tenant, request.task_id);
                    metrics::counter!(ALLOCATIONS_TOTAL, "result" => "tenant_quota_exceeded").increment(1);
                    return Ok(None);
                }
            }
        }

        let Some(agent_id) = state.pick_agent(&request.required, request.preferred_agent.as_deref()) else {
            debug!("No agent has capacity for task {}", request.task_id);
            metrics::counter!(ALLOCATIONS_TOTAL, "result" => "no_capacity").increment(1);
            return Ok(None);
        };

        let allocation = ResourceAllocation {
            allocation_id: format!("alloc_{}", ulid::Ulid::new()),
            agent_id: agent_id.clone(),
            task_id: request.task_id.clone(),
            tenant_id: request.tenant_id.clone(),
            quota: request.required.clone(),
            allocated_at: now,
            expires_at,
        };

        if let Some(resources) = state.agents.get_mut(&agent_id) {
            resources.allocated = &resources.allocated + &request.required;
            resources.updated_at = now;
        }
        if let Some(tenant) = &request.tenant_id {
            let usage = state.tenant_usage.entry(tenant.clone()).or_default();
            *usage = &*usage + &request.required;
        }
        state
            .allocations
            .insert(allocation.allocation_id.clone(), allocation.clone());
        drop(state);

        debug!(
            "Allocated {} on agent {} for task {}",
            allocation.allocation_id, agent_id, request.task_id
        );
        metrics::counter!(ALLOCATIONS_TOTAL, "result" => "allocated").increment(1);
        self.emit(
            AuditKind::Allocated,
            &allocation.allocation_id,
            &agent_id,
            Some(&allocation.task_id),
            allocation.tenant_id.as_deref(),
            &allocation.quota,
        );

        Ok(Some(allocation))
    }

    /// Return an allocation's quota to its agent; `false` for unknown ids
    pub fn release_resources(&self, allocation_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(allocation) = state.allocations.remove(allocation_id) else {
            return false;
        };
        state.unwind_allocation(&allocation);
        drop(state);

        debug!("Released allocation {}", allocation_id);
        self.emit(
            AuditKind::Released,
            allocation_id,
            &allocation.agent_id,
            Some(&allocation.task_id),
            allocation.tenant_id.as_deref(),
            &allocation.quota,
        );
        true
    }

    /// Place a soft hold on an agent's capacity for `duration_secs`.
    ///
    /// The hold is released by the expiry sweep once the duration elapses,
    /// or earlier through `release_reservation`.
    pub fn reserve_resources(&self, agent_id: &str, quota: ResourceQuota, duration_secs: u64) -> Result<Option<String>> {
        quota.validate()?;
        let now = Utc::now();
        let expires_at = expiry_after(now, duration_secs)?;

        let mut state = self.state.lock();
        let Some(resources) = state.agents.get_mut(agent_id) else {
            return Ok(None);
        };
        if !quota.fits_within(&resources.available()) {
            debug!("Reservation on {} rejected: insufficient capacity", agent_id);
            return Ok(None);
        }

        resources.reserved = &resources.reserved + &quota;
        resources.updated_at = now;

        let reservation = Reservation {
            reservation_id: format!("resv_{}", ulid::Ulid::new()),
            agent_id: agent_id.to_string(),
            quota,
            reserved_at: now,
            expires_at,
        };
        let reservation_id = reservation.reservation_id.clone();
        state.reservations.insert(reservation_id.clone(), reservation.clone());
        drop(state);

        debug!("Reserved {} on agent {} for {}s", reservation_id, agent_id, duration_secs);
        self.emit(AuditKind::Reserved, &reservation_id, agent_id, None, None, &reservation.quota);
        Ok(Some(reservation_id))
    }

    /// Drop a reservation early; `false` for unknown ids
    pub fn release_reservation(&self, reservation_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(reservation) = state.reservations.remove(reservation_id) else {
            return false;
        };
        state.unwind_reservation(&reservation);
        drop(state);

        self.emit(
            AuditKind::ReservationReleased,
            reservation_id,
            &reservation.agent_id,
            None,
            None,
            &reservation.quota,
        );
        true
    }

    pub fn set_tenant_quota(&self, tenant_id: &str, quota: ResourceQuota) -> Result<()> {
        quota.validate()?;
        self.state.lock().tenant_quotas.insert(tenant_id.to_string(), quota);
        info!("Tenant quota set for {}", tenant_id);
        Ok(())
    }

    /// Current usage of a tenant (zero if it has never allocated)
    pub fn get_tenant_usage(&self, tenant_id: &str) -> ResourceQuota {
        self.state
            .lock()
            .tenant_usage
            .get(tenant_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_agent_resources(&self, agent_id: &str) -> Option<AgentResources> {
        self.state.lock().agents.get(agent_id).cloned()
    }

    pub fn get_allocation(&self, allocation_id: &str) -> Option<ResourceAllocation> {
        self.state.lock().allocations.get(allocation_id).cloned()
    }

    pub fn get_reservation(&self, reservation_id: &str) -> Option<Reservation> {
        self.state.lock().reservations.get(reservation_id).cloned()
    }

    pub fn allocations_for_agent(&self, agent_id: &str) -> Vec<ResourceAllocation> {
        self.state
            .lock()
            .allocations
            .values()
            .filter(|a| a.agent_id == agent_id)
            .cloned()
            .collect()
    }

    /// Aggregate totals and utilisation percentages
    pub fn get_statistics(&self) -> AllocatorStatistics {
        let state = self.state.lock();

        let mut stats = AllocatorStatistics {
            total_agents: state.agents.len(),
            active_allocations: state.allocations.len(),
            active_reservations: state.reservations.len(),
            ..Default::default()
        };

        let mut total_gpus = 0.0;
        let mut allocated_gpus = 0.0;
        for resources in state.agents.values() {
            stats.total_cpu_cores += resources.total.cpu_cores;
            stats.allocated_cpu_cores += resources.allocated.cpu_cores;
            stats.reserved_cpu_cores += resources.reserved.cpu_cores;
            stats.total_memory_mb += resources.total.memory_mb;
            stats.allocated_memory_mb += resources.allocated.memory_mb;
            stats.reserved_memory_mb += resources.reserved.memory_mb;
            total_gpus += resources.total.gpu_count;
            allocated_gpus += resources.allocated.gpu_count;
        }

        let pct = |used: f64, total: f64| if total > 0.0 { used / total * 100.0 } else { 0.0 };
        stats.cpu_utilization_pct = pct(stats.allocated_cpu_cores, stats.total_cpu_cores);
        stats.memory_utilization_pct = pct(stats.allocated_memory_mb, stats.total_memory_mb);
        stats.gpu_utilization_pct = pct(allocated_gpus, total_gpus);
        stats
    }

    /// Release every allocation and reservation that has expired at `now`
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut events = Vec::new();

        {
            let mut state = self.state.lock();

            let expired: Vec<String> = state
                .allocations
                .values()
                .filter(|a| a.is_expired_at(now))
                .map(|a| a.allocation_id.clone())
                .collect();
            for allocation_id in expired {
                if let Some(allocation) = state.allocations.remove(&allocation_id) {
                    state.unwind_allocation(&allocation);
                    events.push((
                        AuditKind::Expired,
                        allocation.allocation_id,
                        allocation.agent_id,
                        Some(allocation.task_id),
                        allocation.tenant_id,
                        allocation.quota,
                    ));
                    report.allocations_released.push(allocation_id);
                }
            }

            let expired: Vec<String> = state
                .reservations
                .values()
                .filter(|r| now >= r.expires_at)
                .map(|r| r.reservation_id.clone())
                .collect();
            for reservation_id in expired {
                if let Some(reservation) = state.reservations.remove(&reservation_id) {
                    state.unwind_reservation(&reservation);
                    events.push((
                        AuditKind::ReservationExpired,
                        reservation.reservation_id,
                        reservation.agent_id,
                        None,
                        None,
                        reservation.quota,
                    ));
                    report.reservations_released.push(reservation_id);
                }
            }
        }

        for (kind, record_id, agent_id, task_id, tenant_id, quota) in &events {
            self.emit(*kind, record_id, agent_id, task_id.as_deref(), tenant_id.as_deref(), quota);
        }

        if !report.is_empty() {
            info!(
                "Expiry sweep released {} allocations and {} reservations",
                report.allocations_released.len(),
                report.reservations_released.len()
            );
        }
        report
    }

    /// Check `allocated + reserved <= total` for every agent
    pub fn capacity_invariant_holds(&self) -> bool {
        self.state
            .lock()
            .agents
            .values()
            .all(|resources| resources.committed().fits_within(&resources.total))
    }
}

impl Default for ResourceAllocator {
    fn default() -> Self {
        Self::new(AllocatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn allocator_with_agents() -> ResourceAllocator {
        let allocator = ResourceAllocator::default();
        allocator
            .register_agent_resources("agent-a", ResourceQuota::cpu_mem(4.0, 8192.0))
            .unwrap();
        allocator
            .register_agent_resources("agent-b", ResourceQuota::cpu_mem(2.0, 4096.0))
            .unwrap();
        allocator
    }

    #[test]
    fn test_preferred_agent_then_fallback() {
        let allocator = allocator_with_agents();

        let first = allocator
            .allocate_resources(&AllocationRequest::new("task1", ResourceQuota::cpu_mem(3.0, 0.0)).prefer_agent("agent-a"))
            .unwrap()
            .unwrap();
        assert_eq!(first.agent_id, "agent-a");
        assert_eq!(allocator.get_agent_resources("agent-a").unwrap().allocated.cpu_cores, 3.0);

        // Only 1 cpu left on A, so the second request lands on B
        let second = allocator
            .allocate_resources(&AllocationRequest::new("task2", ResourceQuota::cpu_mem(2.0, 0.0)).prefer_agent("agent-a"))
            .unwrap()
            .unwrap();
        assert_eq!(second.agent_id, "agent-b");
    }

    #[test]
    fn test_least_utilized_agent_chosen() {
        let allocator = allocator_with_agents();
        allocator
            .allocate_resources(&AllocationRequest::new("warmup", ResourceQuota::cpu_mem(2.0, 0.0)).prefer_agent("agent-a"))
            .unwrap()
            .unwrap();

        // A is at 50%, B at 0%
        let allocation = allocator
            .allocate_resources(&AllocationRequest::new("task", ResourceQuota::cpu_mem(1.0, 0.0)))
            .unwrap()
            .unwrap();
        assert_eq!(allocation.agent_id, "agent-b");
    }

    #[test]
    fn test_no_capacity_returns_none() {
        let allocator = allocator_with_agents();
        let result = allocator
            .allocate_resources(&AllocationRequest::new("huge", ResourceQuota::cpu_mem(16.0, 0.0)))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_negative_quota_is_validation_error() {
        let allocator = allocator_with_agents();
        let result = allocator.allocate_resources(&AllocationRequest::new("bad", ResourceQuota::cpu_mem(-1.0, 0.0)));
        assert!(matches!(result, Err(ControlPlaneError::ValidationFailed(_))));
    }

    #[test]
    fn test_release_is_idempotent() {
        let allocator = allocator_with_agents();
        let allocation = allocator
            .allocate_resources(&AllocationRequest::new("task", ResourceQuota::cpu_mem(1.0, 1024.0)))
            .unwrap()
            .unwrap();

        assert!(allocator.release_resources(&allocation.allocation_id));
        assert!(!allocator.release_resources(&allocation.allocation_id));
        assert!(!allocator.release_resources("alloc_unknown"));

        let resources = allocator.get_agent_resources(&allocation.agent_id).unwrap();
        assert!(resources.allocated.is_zero());
    }

    #[test]
    fn test_tenant_quota_boundary_inclusive() {
        let allocator = allocator_with_agents();
        allocator
            .set_tenant_quota("acme", ResourceQuota::cpu_mem(2.0, 2048.0))
            .unwrap();

        let request = |task: &str, cpu: f64| AllocationRequest::new(task, ResourceQuota::cpu_mem(cpu, 0.0)).for_tenant("acme");

        assert!(allocator.allocate_resources(&request("t1", 1.5)).unwrap().is_some());
        // Exactly reaching the quota is allowed
        assert!(allocator.allocate_resources(&request("t2", 0.5)).unwrap().is_some());
        // One more sliver is not
        assert!(allocator.allocate_resources(&request("t3", 0.1)).unwrap().is_none());
        assert_eq!(allocator.get_tenant_usage("acme").cpu_cores, 2.0);
    }

    #[test]
    fn test_release_returns_tenant_usage() {
        let allocator = allocator_with_agents();
        allocator.set_tenant_quota("acme", ResourceQuota::cpu_mem(1.0, 0.0)).unwrap();

        let allocation = allocator
            .allocate_resources(&AllocationRequest::new("t1", ResourceQuota::cpu_mem(1.0, 0.0)).for_tenant("acme"))
            .unwrap()
            .unwrap();
        assert!(allocator.release_resources(&allocation.allocation_id));
        assert!(allocator.get_tenant_usage("acme").is_zero());
        assert!(allocator
            .allocate_resources(&AllocationRequest::new("t2", ResourceQuota::cpu_mem(1.0, 0.0)).for_tenant("acme"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_reservation_holds_capacity_until_expiry() {
        let allocator = allocator_with_agents();
        let reservation_id = allocator
            .reserve_resources("agent-b", ResourceQuota::cpu_mem(2.0, 0.0), 30)
            .unwrap()
            .unwrap();

        let resources = allocator.get_agent_resources("agent-b").unwrap();
        assert_eq!(resources.reserved.cpu_cores, 2.0);
        assert!(resources.allocated.is_zero());
        assert_eq!(resources.available().cpu_cores, 0.0);

        // Nothing expires before the duration
        let report = allocator.sweep_expired(Utc::now());
        assert!(report.reservations_released.is_empty());

        let report = allocator.sweep_expired(Utc::now() + ChronoDuration::seconds(31));
        assert_eq!(report.reservations_released, vec![reservation_id]);
        assert!(allocator.get_agent_resources("agent-b").unwrap().reserved.is_zero());
    }

    #[test]
    fn test_reservation_rejected_when_over_capacity() {
        let allocator = allocator_with_agents();
        let result = allocator
            .reserve_resources("agent-b", ResourceQuota::cpu_mem(3.0, 0.0), 30)
            .unwrap();
        assert!(result.is_none());
        assert!(allocator.reserve_resources("ghost", ResourceQuota::zero(), 30).unwrap().is_none());
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let allocator = allocator_with_agents();

        let result = allocator.reserve_resources("agent-b", ResourceQuota::cpu_mem(1.0, 0.0), u64::MAX / 2);
        assert!(matches!(result, Err(ControlPlaneError::ValidationFailed(_))));
        assert!(allocator.get_agent_resources("agent-b").unwrap().reserved.is_zero());

        let request = AllocationRequest::new("forever", ResourceQuota::cpu_mem(1.0, 0.0)).with_timeout(u64::MAX);
        assert!(matches!(
            allocator.allocate_resources(&request),
            Err(ControlPlaneError::ValidationFailed(_))
        ));
        assert_eq!(allocator.get_statistics().active_allocations, 0);
        assert!(allocator.capacity_invariant_holds());
    }

    #[test]
    fn test_long_timeout_expires_in_future() {
        let allocator = allocator_with_agents();
        let allocation = allocator
            .allocate_resources(
                &AllocationRequest::new("long", ResourceQuota::cpu_mem(1.0, 0.0)).with_timeout(10 * 365 * 86_400),
            )
            .unwrap()
            .unwrap();
        assert!(allocation.expires_at.unwrap() > Utc::now());
    }

    #[test]
    fn test_expiring_allocation_swept() {
        let allocator = allocator_with_agents();
        let allocation = allocator
            .allocate_resources(&AllocationRequest::new("task", ResourceQuota::cpu_mem(1.0, 0.0)).with_timeout(10))
            .unwrap()
            .unwrap();
        assert!(allocation.expires_at.is_some());

        let report = allocator.sweep_expired(Utc::now() + ChronoDuration::seconds(11));
        assert_eq!(report.allocations_released, vec![allocation.allocation_id.clone()]);
        assert!(allocator.get_allocation(&allocation.allocation_id).is_none());
    }

    #[test]
    fn test_deregister_releases_everything() {
        let allocator = allocator_with_agents();
        allocator.set_tenant_quota("acme", ResourceQuota::cpu_mem(8.0, 0.0)).unwrap();
        allocator
            .allocate_resources(&AllocationRequest::new("t1", ResourceQuota::cpu_mem(1.0, 0.0)).prefer_agent("agent-a").for_tenant("acme"))
            .unwrap()
            .unwrap();
        allocator
            .reserve_resources("agent-a", ResourceQuota::cpu_mem(1.0, 0.0), 60)
            .unwrap()
            .unwrap();

        assert!(allocator.deregister_agent_resources("agent-a"));
        assert!(allocator.allocations_for_agent("agent-a").is_empty());
        assert!(allocator.get_agent_resources("agent-a").is_none());
        assert!(allocator.get_tenant_usage("acme").is_zero());
        assert!(!allocator.deregister_agent_resources("agent-a"));
        assert_eq!(allocator.get_statistics().active_reservations, 0);
    }

    #[test]
    fn test_update_cannot_shrink_below_commitments() {
        let allocator = allocator_with_agents();
        allocator
            .allocate_resources(&AllocationRequest::new("t1", ResourceQuota::cpu_mem(3.0, 0.0)).prefer_agent("agent-a"))
            .unwrap()
            .unwrap();

        assert!(allocator.update_agent_resources("agent-a", ResourceQuota::cpu_mem(2.0, 8192.0)).is_err());
        assert!(allocator.update_agent_resources("agent-a", ResourceQuota::cpu_mem(8.0, 8192.0)).unwrap());
        assert!(!allocator.update_agent_resources("ghost", ResourceQuota::cpu_mem(1.0, 1.0)).unwrap());
    }

    #[test]
    fn test_register_rejects_totals_over_maximum() {
        let allocator = ResourceAllocator::default();
        let result = allocator.register_agent_resources("big", ResourceQuota::cpu_mem(10_000.0, 0.0));
        assert!(result.is_err());
    }

    #[test]
    fn test_statistics() {
        let allocator = allocator_with_agents();
        allocator
            .allocate_resources(&AllocationRequest::new("t1", ResourceQuota::cpu_mem(3.0, 4096.0)).prefer_agent("agent-a"))
            .unwrap()
            .unwrap();

        let stats = allocator.get_statistics();
        assert_eq!(stats.total_agents, 2);
        assert_eq!(stats.active_allocations, 1);
        assert_eq!(stats.total_cpu_cores, 6.0);
        assert_eq!(stats.allocated_cpu_cores, 3.0);
        assert!((stats.cpu_utilization_pct - 50.0).abs() < 1e-9);
        assert!((stats.memory_utilization_pct - 33.333).abs() < 0.01);
    }

    #[test]
    fn test_audit_events_emitted() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let allocator = ResourceAllocator::default().with_audit_sink(tx);
        allocator.register_agent_resources("a", ResourceQuota::cpu_mem(2.0, 0.0)).unwrap();

        let allocation = allocator
            .allocate_resources(&AllocationRequest::new("t", ResourceQuota::cpu_mem(1.0, 0.0)))
            .unwrap()
            .unwrap();
        allocator.release_resources(&allocation.allocation_id);

        assert_eq!(rx.try_recv().unwrap().kind, AuditKind::Allocated);
        assert_eq!(rx.try_recv().unwrap().kind, AuditKind::Released);
    }

    #[test]
    fn test_concurrent_allocations_never_oversubscribe() {
        let allocator = Arc::new(ResourceAllocator::default());
        allocator.register_agent_resources("solo", ResourceQuota::cpu_mem(4.0, 0.0)).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || {
                    allocator
                        .allocate_resources(&AllocationRequest::new(format!("t{}", i), ResourceQuota::cpu_mem(1.0, 0.0)))
                        .unwrap()
                        .is_some()
                })
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 4);
        assert!(allocator.capacity_invariant_holds());
    }
}
