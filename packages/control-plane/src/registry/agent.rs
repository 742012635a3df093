// packages/control-plane/src/registry/agent.rs
//! Agent identity and health records

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Minimum health score for an agent to count as healthy
pub const HEALTHY_SCORE_THRESHOLD: f64 = 0.5;

/// Consecutive failures at which an agent stops counting as healthy, unless a
/// failure policy overrides it
pub const DEFAULT_FAILURE_LIMIT: u32 = 3;

fn default_failure_limit() -> u32 {
    DEFAULT_FAILURE_LIMIT
}

/// Agent lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Registering,
    Active,
    Inactive,
    Degraded,
    Failed,
    Deregistered,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Registering => "registering",
            AgentStatus::Active => "active",
            AgentStatus::Inactive => "inactive",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Failed => "failed",
            AgentStatus::Deregistered => "deregistered",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity, health and load of one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub name: String,
    pub agent_type: String,
    pub capabilities: BTreeSet<String>,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub status: AgentStatus,
    pub metadata: HashMap<String, String>,
    pub tags: HashMap<String, String>,

    /// Always within [0, 1]
    pub health_score: f64,
    pub consecutive_failures: u32,

    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_health_check: DateTime<Utc>,

    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub average_response_time_ms: f64,

    pub current_load: u32,
    pub max_load: u32,

    /// Heartbeat age beyond which the agent is no longer healthy
    pub heartbeat_timeout_secs: u64,

    /// Consecutive failures at which the agent is no longer healthy
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u32,
}

impl AgentRecord {
    /// Build a fresh, active record from a registration
    pub fn from_registration(registration: AgentRegistration, heartbeat_timeout_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            agent_id: registration.agent_id,
            name: registration.name,
            agent_type: registration.agent_type,
            capabilities: registration.capabilities.into_iter().collect(),
            version: registration.version,
            host: registration.host,
            port: registration.port,
            status: AgentStatus::Active,
            metadata: registration.metadata,
            tags: registration.tags,
            health_score: 1.0,
            consecutive_failures: 0,
            registered_at: now,
            last_heartbeat: now,
            last_health_check: now,
            tasks_processed: 0,
            tasks_failed: 0,
            average_response_time_ms: 0.0,
            current_load: 0,
            max_load: registration.max_load,
            heartbeat_timeout_secs,
            failure_limit: DEFAULT_FAILURE_LIMIT,
        }
    }

    pub fn with_failure_limit(mut self, failure_limit: u32) -> Self {
        self.failure_limit = failure_limit;
        self
    }

    /// Store a health score, clamped to [0, 1] (NaN becomes 0)
    pub fn set_health(&mut self, score: f64) {
        self.health_score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
    }

    pub fn time_since_heartbeat(&self, now: DateTime<Utc>) -> ChronoDuration {
        now - self.last_heartbeat
    }

    pub fn heartbeat_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.time_since_heartbeat(now) > ChronoDuration::seconds(self.heartbeat_timeout_secs as i64)
    }

    pub fn is_healthy_at(&self, now: DateTime<Utc>) -> bool {
        self.status == AgentStatus::Active
            && self.health_score >= HEALTHY_SCORE_THRESHOLD
            && self.consecutive_failures < self.failure_limit
            && self.time_since_heartbeat(now) < ChronoDuration::seconds(self.heartbeat_timeout_secs as i64)
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Utc::now())
    }

    pub fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        self.is_healthy_at(now) && self.current_load < self.max_load
    }

    pub fn is_available(&self) -> bool {
        self.is_available_at(Utc::now())
    }

    /// `current_load / max_load`; an agent with no capacity counts as full
    pub fn load_ratio(&self) -> f64 {
        if self.max_load == 0 {
            1.0
        } else {
            f64::from(self.current_load) / f64::from(self.max_load)
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// True when every `(key, value)` in `required` is present in `tags`
    pub fn matches_tags(&self, required: &HashMap<String, String>) -> bool {
        required
            .iter()
            .all(|(key, value)| self.tags.get(key) == Some(value))
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub name: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub metadata: HashMap<String, String>,
    pub tags: HashMap<String, String>,
    pub max_load: u32,
}

impl AgentRegistration {
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            agent_type: agent_type.into(),
            capabilities: vec![],
            version: "1.0.0".to_string(),
            host: "localhost".to_string(),
            port: 0,
            metadata: HashMap::new(),
            tags: HashMap::new(),
            max_load: 10,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_max_load(mut self, max_load: u32) -> Self {
        self.max_load = max_load;
        self
    }
}

/// Optional counters carried by a heartbeat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    pub current_load: Option<u32>,
    pub tasks_processed: Option<u64>,
    pub tasks_failed: Option<u64>,
    pub average_response_time_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record() -> AgentRecord {
        AgentRecord::from_registration(
            AgentRegistration::new("a1", "worker", "python")
                .with_capabilities(["execute_python"])
                .with_tag("region", "eu")
                .with_max_load(2),
            90,
        )
    }

    #[test]
    fn test_new_record_is_available() {
        let record = record();
        assert_eq!(record.status, AgentStatus::Active);
        assert!(record.is_healthy());
        assert!(record.is_available());
        assert!(record.has_capability("execute_python"));
    }

    #[test]
    fn test_full_agent_not_available() {
        let mut record = record();
        record.current_load = 2;
        assert!(record.is_healthy());
        assert!(!record.is_available());
    }

    #[test]
    fn test_stale_heartbeat_not_healthy() {
        let record = record();
        let later = record.last_heartbeat + ChronoDuration::seconds(91);
        assert!(!record.is_healthy_at(later));
        assert!(record.heartbeat_expired_at(later));
    }

    #[test]
    fn test_health_thresholds() {
        let mut record = record();
        record.set_health(0.49);
        assert!(!record.is_healthy());
        record.set_health(0.5);
        assert!(record.is_healthy());
        record.consecutive_failures = 3;
        assert!(!record.is_healthy());
    }

    #[test]
    fn test_failure_limit_follows_record() {
        let mut record = record().with_failure_limit(5);
        record.consecutive_failures = 4;
        assert!(record.is_healthy());
        record.consecutive_failures = 5;
        assert!(!record.is_healthy());
    }

    #[test]
    fn test_tag_matching() {
        let record = record();
        let mut required = HashMap::new();
        assert!(record.matches_tags(&required));
        required.insert("region".to_string(), "eu".to_string());
        assert!(record.matches_tags(&required));
        required.insert("gpu".to_string(), "true".to_string());
        assert!(!record.matches_tags(&required));
    }

    #[test]
    fn test_zero_capacity_counts_as_full() {
        let mut record = record();
        record.max_load = 0;
        assert_eq!(record.load_ratio(), 1.0);
        assert!(!record.is_available());
    }

    proptest! {
        #[test]
        fn prop_health_always_clamped(score in proptest::num::f64::ANY) {
            let mut record = record();
            record.set_health(score);
            prop_assert!((0.0..=1.0).contains(&record.health_score));
        }
    }
}
