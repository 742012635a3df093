// packages/control-plane/src/messaging/payloads.rs
//! JSON payloads exchanged between agent runtimes and the control plane

use crate::allocation::ResourceQuota;
use crate::registry::{AgentRegistration, HeartbeatMetrics};
use crate::runtime::AgentState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Published on `fleet.registry.register`
///
/// A bare `AgentRegistration` body decodes too, with no resource totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMessage {
    #[serde(flatten)]
    pub registration: AgentRegistration,

    /// Capacity to register with the allocator; the configured default when absent
    #[serde(default)]
    pub resources: Option<ResourceQuota>,
}

/// Published on `fleet.heartbeat.<agent_id>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub agent_id: String,
    pub state: AgentState,
    #[serde(default)]
    pub metrics: HeartbeatMetrics,
    pub sent_at: DateTime<Utc>,
}

/// Published on `fleet.registry.deregister`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterMessage {
    pub agent_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Commands accepted on `fleet.broadcast` and on `fleet.agent.<agent_id>.control`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum BroadcastCommand {
    /// Publish a status snapshot now
    ReportStatus,

    /// Send a heartbeat now
    Heartbeat,

    /// Register again; sent to an agent whose heartbeat arrived after it was removed
    Reregister,
}

/// Compact answer on `fleet.agent.<agent_id>.health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReply {
    pub agent_id: String,
    pub state: AgentState,
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_broadcast_command_tags() {
        let command: BroadcastCommand = serde_json::from_value(json!({"command": "report_status"})).unwrap();
        assert_eq!(command, BroadcastCommand::ReportStatus);
        let command: BroadcastCommand = serde_json::from_value(json!({"command": "reregister"})).unwrap();
        assert_eq!(command, BroadcastCommand::Reregister);
        assert!(serde_json::from_value::<BroadcastCommand>(json!({"command": "reboot"})).is_err());
    }

    #[test]
    fn test_register_message_resources_optional() {
        let bare: RegisterMessage = serde_json::from_value(json!({
            "agent_id": "a1",
            "name": "worker",
            "agent_type": "python",
            "capabilities": ["parse"],
            "version": "1.0.0",
            "host": "localhost",
            "port": 9000,
            "metadata": {},
            "tags": {},
            "max_load": 10
        }))
        .unwrap();
        assert_eq!(bare.registration.agent_id, "a1");
        assert_eq!(bare.registration.port, 9000);
        assert!(bare.resources.is_none());

        let message = RegisterMessage {
            registration: AgentRegistration::new("a2", "worker", "python"),
            resources: Some(ResourceQuota::cpu_mem(64.0, 65536.0)),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["agent_id"], "a2");
        let decoded: RegisterMessage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.resources.map(|quota| quota.cpu_cores), Some(64.0));
    }

    #[test]
    fn test_heartbeat_without_metrics() {
        let heartbeat: HeartbeatMessage = serde_json::from_value(json!({
            "agent_id": "a1",
            "state": "running",
            "sent_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(heartbeat.state, AgentState::Running);
        assert!(heartbeat.metrics.current_load.is_none());
    }
}
