// packages/control-plane/src/messaging/memory.rs
//! In-process message bus

use crate::messaging::bus::{Message, MessageBus, MessageHandler, SubscriptionId};
use crate::messaging::subjects;
use crate::utils::errors::{ControlPlaneError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

struct Subscription {
    pattern: String,
    handler: Arc<dyn MessageHandler>,
    queue_group: Option<String>,
}

/// Bus that delivers within the current process
///
/// Each delivery runs on its own tokio task, so a slow handler never blocks
/// the publisher.
pub struct InMemoryBus {
    subscriptions: DashMap<SubscriptionId, Subscription>,
    next_id: AtomicU64,
    group_cursor: AtomicUsize,
    connected: AtomicBool,

    /// Simulated reachability of the broker
    available: AtomicBool,

    delivered: AtomicU64,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            group_cursor: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            available: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
        }
    }

    /// A bus that is already connected
    pub fn connected() -> Self {
        let bus = Self::new();
        bus.connected.store(true, Ordering::SeqCst);
        bus
    }

    /// Simulate the broker going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Messages handed to handlers so far
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ControlPlaneError::Messaging("bus is not connected".to_string()))
        }
    }

    /// Hand `message` to every matching subscriber, one per queue group
    fn deliver(&self, message: Message) -> usize {
        let mut plain: Vec<Arc<dyn MessageHandler>> = Vec::new();
        let mut groups: BTreeMap<String, Vec<(SubscriptionId, Arc<dyn MessageHandler>)>> = BTreeMap::new();

        for entry in self.subscriptions.iter() {
            let subscription = entry.value();
            if !subjects::matches(&subscription.pattern, &message.subject) {
                continue;
            }
            match &subscription.queue_group {
                Some(group) => groups
                    .entry(group.clone())
                    .or_default()
                    .push((*entry.key(), Arc::clone(&subscription.handler))),
                None => plain.push(Arc::clone(&subscription.handler)),
            }
        }

        let cursor = self.group_cursor.fetch_add(1, Ordering::Relaxed);
        for (_, mut members) in groups {
            members.sort_by_key(|(id, _)| *id);
            let (_, handler) = members.swap_remove(cursor % members.len());
            plain.push(handler);
        }

        let targets = plain.len();
        for handler in plain {
            let message = message.clone();
            tokio::spawn(async move {
                handler.on_message(message).await;
            });
        }
        self.delivered.fetch_add(targets as u64, Ordering::Relaxed);
        targets
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards the first reply to a waiting request
struct ReplyHandler {
    sender: Mutex<Option<oneshot::Sender<Message>>>,
}

#[async_trait]
impl MessageHandler for ReplyHandler {
    async fn on_message(&self, message: Message) {
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(message);
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn connect(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::Messaging("broker unreachable".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!("In-memory bus connected");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::Messaging("broker unreachable".to_string()));
        }
        self.ensure_connected()
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let dropped = self.subscriptions.len();
        self.subscriptions.clear();
        info!("In-memory bus closed ({} subscriptions dropped)", dropped);
        Ok(())
    }

    async fn publish(&self, message: Message, _timeout: Duration) -> Result<()> {
        self.ensure_connected()?;
        let targets = self.deliver(message);
        if targets == 0 {
            debug!("Published with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
        queue_group: Option<&str>,
    ) -> Result<SubscriptionId> {
        self.ensure_connected()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(
            id,
            Subscription {
                pattern: subject.to_string(),
                handler,
                queue_group: queue_group.map(str::to_string),
            },
        );
        debug!("Subscription {} on '{}' (group {:?})", id, subject, queue_group);
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        Ok(self.subscriptions.remove(&id).is_some())
    }

    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Message> {
        self.ensure_connected()?;

        let inbox = subjects::inbox();
        let (sender, receiver) = oneshot::channel();
        let handler = Arc::new(ReplyHandler {
            sender: Mutex::new(Some(sender)),
        });
        let reply_id = self.subscribe(&inbox, handler, None).await?;

        let responders = self.deliver(Message::new(subject, payload).with_reply(inbox));
        if responders == 0 {
            self.subscriptions.remove(&reply_id);
            return Err(ControlPlaneError::Messaging(format!("no responders for '{}'", subject)));
        }

        let outcome = tokio::time::timeout(timeout, receiver).await;
        self.subscriptions.remove(&reply_id);

        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ControlPlaneError::Messaging(format!("reply channel for '{}' dropped", subject))),
            Err(_) => Err(ControlPlaneError::Timeout(format!("request to '{}'", subject))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Collector(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl MessageHandler for Collector {
        async fn on_message(&self, message: Message) {
            let _ = self.0.send(message);
        }
    }

    /// Answers every request with the same payload
    struct Echo(Arc<InMemoryBus>);

    #[async_trait]
    impl MessageHandler for Echo {
        async fn on_message(&self, message: Message) {
            if let Some(reply) = message.reply {
                let _ = self
                    .0
                    .publish(Message::new(reply, message.payload), Duration::from_secs(1))
                    .await;
            }
        }
    }

    fn collector() -> (Arc<Collector>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Collector(tx)), rx)
    }

    #[tokio::test]
    async fn test_publish_subscribe_with_wildcard() {
        let bus = InMemoryBus::connected();
        let (handler, mut rx) = collector();
        bus.subscribe("fleet.heartbeat.*", handler, None).await.unwrap();

        bus.publish(Message::new("fleet.heartbeat.a1", "hi"), Duration::from_secs(1))
            .await
            .unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.subject, "fleet.heartbeat.a1");
        assert_eq!(&message.payload[..], b"hi");
    }

    #[tokio::test]
    async fn test_queue_group_delivers_once() {
        let bus = InMemoryBus::connected();
        let (first, mut rx1) = collector();
        let (second, mut rx2) = collector();
        bus.subscribe("jobs", first, Some("workers")).await.unwrap();
        bus.subscribe("jobs", second, Some("workers")).await.unwrap();

        for _ in 0..4 {
            bus.publish(Message::new("jobs", "x"), Duration::from_secs(1)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut total = 0;
        while rx1.try_recv().is_ok() {
            total += 1;
        }
        while rx2.try_recv().is_ok() {
            total += 1;
        }
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = Arc::new(InMemoryBus::connected());
        bus.subscribe("echo", Arc::new(Echo(Arc::clone(&bus))), None)
            .await
            .unwrap();

        let reply = bus
            .request("echo", Bytes::from_static(b"ping"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&reply.payload[..], b"ping");
        assert_eq!(bus.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_request_without_responders() {
        let bus = InMemoryBus::connected();
        let result = bus
            .request("nobody", Bytes::new(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(ControlPlaneError::Messaging(_))));
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_broker() {
        let bus = InMemoryBus::new();
        bus.set_available(false);
        assert!(bus.connect().await.is_err());
        assert!(bus
            .publish(Message::new("x", "y"), Duration::from_secs(1))
            .await
            .is_err());

        bus.set_available(true);
        bus.connect().await.unwrap();
        assert!(bus.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_drops_subscriptions() {
        let bus = InMemoryBus::connected();
        let (handler, _rx) = collector();
        let id = bus.subscribe("x", handler, None).await.unwrap();
        assert!(bus.unsubscribe(id).await.unwrap());
        assert!(!bus.unsubscribe(id).await.unwrap());

        let (handler, _rx) = collector();
        bus.subscribe("x", handler, None).await.unwrap();
        bus.close().await.unwrap();
        assert_eq!(bus.subscription_count(), 0);
        assert!(!bus.is_connected());
    }
}
