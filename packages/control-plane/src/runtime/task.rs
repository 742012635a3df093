// packages/control-plane/src/runtime/task.rs
//! Task requests, outcomes and handlers

use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata key carrying the allocation granted for a task
pub const ALLOCATION_METADATA_KEY: &str = "allocation_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    #[serde(alias = "normal")]
    Medium,
    High,
    Critical,
}

/// A unit of work delivered to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Callers supply deterministic ids; handling is at-most-once per delivery
    pub task_id: String,
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,

    /// Execution must start before this instant
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,

    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Subject the final response is published to
    #[serde(default)]
    pub reply_to: Option<String>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl TaskRequest {
    pub fn new(task_id: impl Into<String>, task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            payload,
            priority: TaskPriority::Medium,
            created_at: Utc::now(),
            deadline: None,
            retry_count: 0,
            max_retries: 3,
            correlation_id: None,
            reply_to: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline_in(mut self, seconds: i64) -> Self {
        self.deadline = Some(Utc::now() + ChronoDuration::seconds(seconds));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, subject: impl Into<String>) -> Self {
        self.reply_to = Some(subject.into());
        self
    }

    /// Attach the allocation to release once the task finishes
    pub fn with_allocation(mut self, allocation_id: impl Into<String>) -> Self {
        self.metadata
            .insert(ALLOCATION_METADATA_KEY.to_string(), allocation_id.into());
        self
    }

    pub fn allocation_id(&self) -> Option<&str> {
        self.metadata.get(ALLOCATION_METADATA_KEY).map(String::as_str)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map_or(false, |deadline| now >= deadline)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Retry budget left and deadline not yet passed
    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries && !self.is_expired()
    }
}

/// Final result of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { result: serde_json::Value },

    /// The handler reported an error
    Failed { error: String },

    /// Outcome unknown: the handler may have partially applied its work
    TimedOut { timeout_ms: u64 },

    /// Deadline passed before execution started
    Expired,

    /// Not attempted (no handler, breaker open, shutting down)
    Rejected { reason: String },
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Completed { .. } => "completed",
            TaskOutcome::Failed { .. } => "failed",
            TaskOutcome::TimedOut { .. } => "timed_out",
            TaskOutcome::Expired => "expired",
            TaskOutcome::Rejected { .. } => "rejected",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }
}

/// Response published to the task's reply subject
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub agent_id: String,
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
    pub attempts: u32,
    pub duration_ms: f64,
    pub completed_at: DateTime<Utc>,
}

/// Domain logic plugged into an agent runtime
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskRequest) -> Result<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_names() {
        let medium: TaskPriority = serde_json::from_str("\"medium\"").unwrap();
        assert_eq!(medium, TaskPriority::Medium);
        let legacy: TaskPriority = serde_json::from_str("\"normal\"").unwrap();
        assert_eq!(legacy, TaskPriority::Medium);
        assert_eq!(serde_json::to_string(&TaskPriority::Medium).unwrap(), "\"medium\"");
        assert!(TaskPriority::Critical > TaskPriority::Medium);

        let task: TaskRequest = serde_json::from_value(json!({
            "task_id": "t1",
            "task_type": "echo",
            "priority": "medium",
            "created_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(task.priority, TaskPriority::Medium);
    }

    #[test]
    fn test_expiry_and_retry_budget() {
        let mut task = TaskRequest::new("t1", "echo", json!({})).with_max_retries(2);
        assert!(!task.is_expired());
        assert!(task.should_retry());

        task.retry_count = 2;
        assert!(!task.should_retry());

        let expired = TaskRequest::new("t2", "echo", json!({})).with_deadline_in(-1);
        assert!(expired.is_expired());
        assert!(!expired.should_retry());
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let task: TaskRequest = serde_json::from_value(json!({
            "task_id": "t1",
            "task_type": "echo",
            "created_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(task.priority, TaskPriority::Medium);
        assert_eq!(task.max_retries, 0);
        assert!(task.deadline.is_none());
    }

    #[test]
    fn test_response_carries_status_tag() {
        let response = TaskResponse {
            task_id: "t1".into(),
            agent_id: "a1".into(),
            correlation_id: None,
            outcome: TaskOutcome::TimedOut { timeout_ms: 50 },
            attempts: 1,
            duration_ms: 50.0,
            completed_at: Utc::now(),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "timed_out");
        assert_eq!(value["timeout_ms"], 50);
    }
}
