// packages/control-plane/src/registry/agent_registry.rs
//! Authoritative agent registry
//!
//! Owns the map of agent id → record together with the type and capability
//! indices. A single reader-writer lock guards all three, so an agent is
//! never visible in an index without also being in the primary map.

use crate::observability::{REGISTRY_AGENTS, REGISTRY_HEALTH_AVG};
use crate::registry::agent::{AgentRecord, AgentRegistration, AgentStatus, HeartbeatMetrics};
use crate::utils::errors::{ControlPlaneError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Weight of the newest sample in the response-time moving average
const RESPONSE_TIME_ALPHA: f64 = 0.2;

/// How failures degrade an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    /// Health subtracted per recorded failure (default: 0.2)
    pub health_penalty: f64,

    /// Consecutive failures that mark an agent Degraded (default: 2)
    pub degraded_after: u32,

    /// Consecutive failures that mark an agent Failed (default: 3)
    pub failed_after: u32,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            health_penalty: 0.2,
            degraded_after: 2,
            failed_after: 3,
        }
    }
}

impl FailurePolicy {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.health_penalty) {
            return Err(ControlPlaneError::ConfigError(
                "failure_policy.health_penalty must be within [0, 1]".to_string(),
            ));
        }
        if self.degraded_after == 0 || self.failed_after < self.degraded_after {
            return Err(ControlPlaneError::ConfigError(
                "failure_policy requires 0 < degraded_after <= failed_after".to_string(),
            ));
        }
        Ok(())
    }

    /// Status implied by a failure count
    pub fn status_for(&self, consecutive_failures: u32) -> Option<AgentStatus> {
        if consecutive_failures >= self.failed_after {
            Some(AgentStatus::Failed)
        } else if consecutive_failures >= self.degraded_after {
            Some(AgentStatus::Degraded)
        } else {
            None
        }
    }
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Heartbeat age after which an agent is unhealthy and eligible for cleanup (default: 90)
    pub heartbeat_timeout_secs: u64,

    /// Interval of the monitoring loop (default: 30)
    pub health_check_interval_secs: u64,

    /// Interval of the stale-agent cleanup loop (default: 300)
    pub cleanup_interval_secs: u64,

    pub failure_policy: FailurePolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 90,
            health_check_interval_secs: 30,
            cleanup_interval_secs: 300,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl RegistryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Snapshot emitted by the monitoring loop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStatistics {
    pub total_agents: usize,
    pub by_status: BTreeMap<AgentStatus, usize>,
    pub healthy_agents: usize,
    pub available_agents: usize,
    pub average_health: f64,
    pub total_load: u64,
    pub total_capacity: u64,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
}

#[derive(Default)]
struct RegistryIndex {
    agents: HashMap<String, AgentRecord>,
    by_type: HashMap<String, HashSet<String>>,
    by_capability: HashMap<String, HashSet<String>>,
}

impl RegistryIndex {
    fn index(&mut self, record: &AgentRecord) {
        self.by_type
            .entry(record.agent_type.clone())
            .or_default()
            .insert(record.agent_id.clone());
        for capability in &record.capabilities {
            self.by_capability
                .entry(capability.clone())
                .or_default()
                .insert(record.agent_id.clone());
        }
    }

    fn unindex(&mut self, record: &AgentRecord) {
        if let Some(ids) = self.by_type.get_mut(&record.agent_type) {
            ids.remove(&record.agent_id);
            if ids.is_empty() {
                self.by_type.remove(&record.agent_type);
            }
        }
        for capability in &record.capabilities {
            if let Some(ids) = self.by_capability.get_mut(capability) {
                ids.remove(&record.agent_id);
                if ids.is_empty() {
                    self.by_capability.remove(capability);
                }
            }
        }
    }

    fn remove(&mut self, agent_id: &str) -> Option<AgentRecord> {
        let mut record = self.agents.remove(agent_id)?;
        self.unindex(&record);
        record.status = AgentStatus::Deregistered;
        Some(record)
    }

    fn collect<'a>(
        &self,
        ids: impl Iterator<Item = &'a String>,
        only_available: bool,
        now: DateTime<Utc>,
    ) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = ids
            .filter_map(|id| self.agents.get(id))
            .filter(|record| !only_available || record.is_available_at(now))
            .cloned()
            .collect();
        sort_by_load_then_health(&mut agents);
        agents
    }
}

/// Least loaded first, then healthiest; agent id breaks remaining ties
pub fn sort_by_load_then_health(agents: &mut [AgentRecord]) {
    agents.sort_by(|a, b| {
        a.load_ratio()
            .total_cmp(&b.load_ratio())
            .then_with(|| b.health_score.total_cmp(&a.health_score))
            .then_with(|| a.agent_id.cmp(&b.agent_id))
    });
}

/// Agent registry
pub struct AgentRegistry {
    config: RegistryConfig,
    index: RwLock<RegistryIndex>,
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            index: RwLock::new(RegistryIndex::default()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register an agent. Re-registering a known id refreshes it instead of failing.
    pub fn register_agent(&self, registration: AgentRegistration) -> AgentRecord {
        let mut index = self.index.write();

        if let Some(existing) = index.agents.get(&registration.agent_id).cloned() {
            let mut updated = existing.clone();
            updated.name = registration.name;
            updated.agent_type = registration.agent_type;
            updated.capabilities = registration.capabilities.into_iter().collect();
            updated.version = registration.version;
            updated.host = registration.host;
            updated.port = registration.port;
            updated.metadata = registration.metadata;
            updated.tags = registration.tags;
            updated.max_load = registration.max_load;
            updated.last_heartbeat = Utc::now();
            updated.status = AgentStatus::Active;
            updated.consecutive_failures = 0;
            updated.health_score = 1.0;
            updated.failure_limit = self.config.failure_policy.failed_after;

            index.unindex(&existing);
            index.index(&updated);
            index.agents.insert(updated.agent_id.clone(), updated.clone());

            info!("Agent {} re-registered", updated.agent_id);
            return updated;
        }

        let record = AgentRecord::from_registration(registration, self.config.heartbeat_timeout_secs)
            .with_failure_limit(self.config.failure_policy.failed_after);
        index.index(&record);
        index.agents.insert(record.agent_id.clone(), record.clone());

        info!(
            "Agent {} ({}) registered with capabilities {:?}",
            record.agent_id, record.agent_type, record.capabilities
        );
        record
    }

    /// Remove an agent from the map and every index; `false` if unknown
    pub fn deregister_agent(&self, agent_id: &str) -> bool {
        let removed = self.index.write().remove(agent_id);
        match removed {
            Some(_) => {
                info!("Agent {} deregistered", agent_id);
                true
            }
            None => false,
        }
    }

    /// Record a heartbeat. Returns `false` for unknown agents so they re-register.
    pub fn heartbeat(&self, agent_id: &str, metrics: Option<HeartbeatMetrics>) -> bool {
        let mut index = self.index.write();
        let Some(record) = index.agents.get_mut(agent_id) else {
            debug!("Heartbeat from unknown agent {}", agent_id);
            return false;
        };

        record.last_heartbeat = Utc::now();

        if let Some(metrics) = metrics {
            if let Some(load) = metrics.current_load {
                record.current_load = load;
            }
            if let Some(processed) = metrics.tasks_processed {
                record.tasks_processed = processed;
            }
            if let Some(failed) = metrics.tasks_failed {
                record.tasks_failed = failed;
            }
            if let Some(avg) = metrics.average_response_time_ms {
                record.average_response_time_ms = avg;
            }
        }

        if record.status != AgentStatus::Active {
            info!("Agent {} recovered ({} -> active)", agent_id, record.status);
            record.status = AgentStatus::Active;
            record.consecutive_failures = 0;
        }
        true
    }

    /// Set an agent's health (clamped to [0, 1]) and optionally its status
    pub fn update_health(&self, agent_id: &str, score: f64, status: Option<AgentStatus>) -> bool {
        let mut index = self.index.write();
        let Some(record) = index.agents.get_mut(agent_id) else {
            return false;
        };

        record.set_health(score);
        record.last_health_check = Utc::now();

        if let Some(status) = status {
            if status != record.status {
                info!("Agent {} status {} -> {}", agent_id, record.status, status);
                record.status = status;
            }
        }
        true
    }

    /// Apply the failure penalty and escalate status per the failure policy
    pub fn record_failure(&self, agent_id: &str) -> bool {
        let policy = &self.config.failure_policy;
        let mut index = self.index.write();
        let Some(record) = index.agents.get_mut(agent_id) else {
            return false;
        };

        record.consecutive_failures += 1;
        record.set_health(record.health_score - policy.health_penalty);

        if let Some(status) = policy.status_for(record.consecutive_failures) {
            if status != record.status {
                warn!(
                    "Agent {} escalated to {} after {} consecutive failures",
                    agent_id, status, record.consecutive_failures
                );
                record.status = status;
            }
        }
        true
    }

    /// Count a finished task and fold its duration into the response-time average
    pub fn record_task_completion(&self, agent_id: &str, duration_ms: f64, success: bool) -> bool {
        let mut index = self.index.write();
        let Some(record) = index.agents.get_mut(agent_id) else {
            return false;
        };

        record.tasks_processed += 1;
        if !success {
            record.tasks_failed += 1;
        }
        record.average_response_time_ms = if record.tasks_processed == 1 {
            duration_ms
        } else {
            RESPONSE_TIME_ALPHA * duration_ms + (1.0 - RESPONSE_TIME_ALPHA) * record.average_response_time_ms
        };
        true
    }

    pub fn increment_load(&self, agent_id: &str) -> bool {
        let mut index = self.index.write();
        match index.agents.get_mut(agent_id) {
            Some(record) => {
                record.current_load = record.current_load.saturating_add(1);
                true
            }
            None => false,
        }
    }

    /// Decrement load, never below zero
    pub fn decrement_load(&self, agent_id: &str) -> bool {
        let mut index = self.index.write();
        match index.agents.get_mut(agent_id) {
            Some(record) => {
                record.current_load = record.current_load.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    /// Increment load and return a guard that decrements it when dropped
    pub fn acquire_load(self: &Arc<Self>, agent_id: &str) -> Option<LoadGuard> {
        if self.increment_load(agent_id) {
            Some(LoadGuard {
                registry: Arc::clone(self),
                agent_id: agent_id.to_string(),
            })
        } else {
            None
        }
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.index.read().agents.get(agent_id).cloned()
    }

    /// Agents offering `capability`, least loaded then healthiest first
    pub fn get_agents_by_capability(&self, capability: &str, only_available: bool) -> Vec<AgentRecord> {
        let index = self.index.read();
        match index.by_capability.get(capability) {
            Some(ids) => index.collect(ids.iter(), only_available, Utc::now()),
            None => vec![],
        }
    }

    pub fn get_agents_by_type(&self, agent_type: &str, only_available: bool) -> Vec<AgentRecord> {
        let index = self.index.read();
        match index.by_type.get(agent_type) {
            Some(ids) => index.collect(ids.iter(), only_available, Utc::now()),
            None => vec![],
        }
    }

    pub fn get_all_agents(&self, only_available: bool) -> Vec<AgentRecord> {
        let index = self.index.read();
        index.collect(index.agents.keys(), only_available, Utc::now())
    }

    /// Best available agent for `capability`
    pub fn find_best_agent(&self, capability: &str) -> Option<AgentRecord> {
        self.get_agents_by_capability(capability, true).into_iter().next()
    }

    pub fn agent_count(&self) -> usize {
        self.index.read().agents.len()
    }

    /// Remove every agent whose heartbeat is older than the timeout at `now`
    pub fn sweep_stale_agents(&self, now: DateTime<Utc>) -> Vec<String> {
        self.sweep_stale_agents_with(now, |_| {})
    }

    /// Like `sweep_stale_agents`, running `release` on the removed ids while
    /// the write lock is still held. A registration of a swept id waits
    /// until `release` has finished.
    pub fn sweep_stale_agents_with<F>(&self, now: DateTime<Utc>, release: F) -> Vec<String>
    where
        F: FnOnce(&[String]),
    {
        let mut index = self.index.write();
        let stale: Vec<String> = index
            .agents
            .values()
            .filter(|record| record.heartbeat_expired_at(now))
            .map(|record| record.agent_id.clone())
            .collect();

        for agent_id in &stale {
            if let Some(record) = index.remove(agent_id) {
                warn!(
                    "Agent {} removed: no heartbeat for {}s",
                    agent_id,
                    record.time_since_heartbeat(now).num_seconds()
                );
            }
        }
        if !stale.is_empty() {
            release(&stale);
        }
        stale
    }

    /// Counts by status, average health and total load at `now`
    pub fn statistics(&self, now: DateTime<Utc>) -> RegistryStatistics {
        let index = self.index.read();
        let mut stats = RegistryStatistics {
            total_agents: index.agents.len(),
            ..Default::default()
        };

        let mut health_sum = 0.0;
        for record in index.agents.values() {
            *stats.by_status.entry(record.status).or_insert(0) += 1;
            if record.is_healthy_at(now) {
                stats.healthy_agents += 1;
            }
            if record.is_available_at(now) {
                stats.available_agents += 1;
            }
            health_sum += record.health_score;
            stats.total_load += u64::from(record.current_load);
            stats.total_capacity += u64::from(record.max_load);
            stats.tasks_processed += record.tasks_processed;
            stats.tasks_failed += record.tasks_failed;
        }
        if stats.total_agents > 0 {
            stats.average_health = health_sum / stats.total_agents as f64;
        }
        stats
    }

    /// Log and gauge a statistics snapshot
    pub fn report_statistics(&self, now: DateTime<Utc>) -> RegistryStatistics {
        let stats = self.statistics(now);
        for (status, count) in &stats.by_status {
            metrics::gauge!(REGISTRY_AGENTS, "status" => status.as_str()).set(*count as f64);
        }
        metrics::gauge!(REGISTRY_HEALTH_AVG).set(stats.average_health);

        info!(
            "Registry: {} agents ({} healthy, {} available), avg health {:.2}, load {}/{}",
            stats.total_agents,
            stats.healthy_agents,
            stats.available_agents,
            stats.average_health,
            stats.total_load,
            stats.total_capacity
        );
        stats
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

/// Scoped load increment; decrements the agent's load on drop
pub struct LoadGuard {
    registry: Arc<AgentRegistry>,
    agent_id: String,
}

impl LoadGuard {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.registry.decrement_load(&self.agent_id);
    }
}

impl std::fmt::Debug for LoadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadGuard").field("agent_id", &self.agent_id).finish()
    }
}
