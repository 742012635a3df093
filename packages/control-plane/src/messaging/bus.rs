// packages/control-plane/src/messaging/bus.rs
//! Bus trait and message envelope

use crate::runtime::connection::Dependency;
use crate::utils::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Handle returned by `subscribe`
pub type SubscriptionId = u64;

/// Message envelope
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub payload: Bytes,

    /// Subject to answer on, set for requests
    pub reply: Option<String>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            reply: None,
        }
    }

    /// JSON-encode `value` as the payload
    pub fn json<T: Serialize>(subject: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(subject, serde_json::to_vec(value)?))
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Receives messages for a subscription
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: Message);
}

/// Pub/sub bus with request/reply
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn health_check(&self) -> Result<()>;

    /// Drop subscriptions and stop accepting publishes
    async fn close(&self) -> Result<()>;

    async fn publish(&self, message: Message, timeout: Duration) -> Result<()>;

    /// Subscribe `handler` to `subject` (wildcards allowed). Subscribers
    /// sharing a queue group receive each message once between them.
    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
        queue_group: Option<&str>,
    ) -> Result<SubscriptionId>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool>;

    /// Publish with a fresh reply subject and wait for one answer
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Message>;
}

/// Exposes a bus as the runtime's required dependency
pub struct BusDependency {
    bus: Arc<dyn MessageBus>,
    owned: bool,
}

impl BusDependency {
    /// Dependency that closes the bus when the runtime stops
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus, owned: true }
    }

    /// Dependency on a bus other components keep using; closing leaves it open
    pub fn shared(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus, owned: false }
    }
}

#[async_trait]
impl Dependency for BusDependency {
    fn name(&self) -> &str {
        "message_bus"
    }

    fn is_required(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<()> {
        self.bus.connect().await
    }

    async fn health_check(&self) -> Result<()> {
        self.bus.health_check().await
    }

    async fn close(&self) -> Result<()> {
        if !self.owned {
            debug!("Leaving shared message bus open");
            return Ok(());
        }
        self.bus.close().await
    }
}
