// packages/control-plane/src/messaging/mod.rs
//! Messaging seam
//!
//! The control plane talks to agents over a pub/sub bus with request/reply
//! (NATS-like). Delivery is at-most-once; handlers must tolerate duplicates
//! by keying on caller-supplied ids.
//!
//! - [`MessageBus`]: publish, subscribe (optionally in a queue group), request
//! - [`InMemoryBus`]: in-process implementation used by tests and local mode
//! - [`payloads`]: registration, heartbeat, deregistration and command bodies
//! - [`subjects`]: subject naming and wildcard matching

pub mod bus;
pub mod memory;
pub mod payloads;
pub mod subjects;

pub use bus::{BusDependency, Message, MessageBus, MessageHandler, SubscriptionId};
pub use memory::InMemoryBus;
pub use payloads::{BroadcastCommand, DeregisterMessage, HealthReply, HeartbeatMessage, RegisterMessage};
