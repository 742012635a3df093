// packages/control-plane/src/messaging/subjects.rs
//! Subject names
//!
//! Tokens are separated by `.`; patterns may use `*` for one token and a
//! trailing `>` for one or more tokens.

pub const PREFIX: &str = "fleet";

pub const BROADCAST: &str = "fleet.broadcast";
pub const REGISTER: &str = "fleet.registry.register";
pub const DEREGISTER: &str = "fleet.registry.deregister";
pub const HEARTBEATS: &str = "fleet.heartbeat.*";

pub fn agent_tasks(agent_id: &str) -> String {
    format!("{}.agent.{}.tasks", PREFIX, agent_id)
}

pub fn agent_status(agent_id: &str) -> String {
    format!("{}.agent.{}.status", PREFIX, agent_id)
}

pub fn agent_health(agent_id: &str) -> String {
    format!("{}.agent.{}.health", PREFIX, agent_id)
}

/// Commands addressed to one agent
pub fn agent_control(agent_id: &str) -> String {
    format!("{}.agent.{}.control", PREFIX, agent_id)
}

pub fn heartbeat(agent_id: &str) -> String {
    format!("{}.heartbeat.{}", PREFIX, agent_id)
}

/// Fresh reply subject for one request
pub fn inbox() -> String {
    format!("_INBOX.{}", ulid::Ulid::new())
}

/// True when `subject` matches `pattern`
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
