// packages/control-plane/src/control_plane/service.rs
//! Control plane facade and its background workers

use crate::allocation::{AllocatorStatistics, AuditEvent, ResourceAllocator, ResourceQuota, SweepReport};
use crate::discovery::AgentDiscovery;
use crate::messaging::{
    subjects, BroadcastCommand, DeregisterMessage, HeartbeatMessage, Message, MessageBus, MessageHandler,
    RegisterMessage, SubscriptionId,
};
use crate::registry::{AgentRecord, AgentRegistration, AgentRegistry, RegistryStatistics};
use crate::runtime::{AgentRuntime, Dependency, RuntimeConfig};
use crate::storage::{AgentReport, AuditWriter, AuditWriterStats, ReportStore};
use crate::utils::config::ControlPlaneConfig;
use crate::utils::errors::{ControlPlaneError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Budget for each bus call made while attaching or detaching
const BUS_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for background workers to notice cancellation
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Combined registry and allocator snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneStatus {
    pub registry: RegistryStatistics,
    pub allocator: AllocatorStatistics,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
enum Channel {
    Register,
    Deregister,
    Heartbeat,
}

/// Routes fleet traffic into the control plane without keeping it alive
struct FleetListener {
    plane: Weak<ControlPlane>,
    channel: Channel,
}

#[async_trait]
impl MessageHandler for FleetListener {
    async fn on_message(&self, message: Message) {
        let Some(plane) = self.plane.upgrade() else {
            return;
        };
        match self.channel {
            Channel::Register => match message.decode::<RegisterMessage>() {
                Ok(request) => {
                    let agent_id = request.registration.agent_id.clone();
                    if let Err(e) = plane.register_agent(request.registration, request.resources) {
                        warn!("Registration of {} rejected: {}", agent_id, e);
                    }
                }
                Err(e) => warn!("Dropping malformed registration: {}", e),
            },
            Channel::Deregister => match message.decode::<DeregisterMessage>() {
                Ok(request) => {
                    debug!(
                        "Agent {} leaving ({})",
                        request.agent_id,
                        request.reason.as_deref().unwrap_or("no reason")
                    );
                    plane.deregister_agent(&request.agent_id);
                }
                Err(e) => warn!("Dropping malformed deregistration: {}", e),
            },
            Channel::Heartbeat => match message.decode::<HeartbeatMessage>() {
                Ok(heartbeat) => {
                    if !plane.registry.heartbeat(&heartbeat.agent_id, Some(heartbeat.metrics)) {
                        info!("Heartbeat from unknown agent {} ({})", heartbeat.agent_id, heartbeat.state);
                        plane.request_reregistration(&heartbeat.agent_id).await;
                    }
                }
                Err(e) => debug!("Ignoring heartbeat on '{}': {}", message.subject, e),
            },
        }
    }
}

/// Registry, discovery and allocator behind one handle
pub struct ControlPlane {
    config: ControlPlaneConfig,
    registry: Arc<AgentRegistry>,
    discovery: AgentDiscovery,
    allocator: Arc<ResourceAllocator>,
    store: Option<Arc<ReportStore>>,

    audit_events: Mutex<Option<UnboundedReceiver<AuditEvent>>>,
    audit_writer: tokio::sync::Mutex<Option<AuditWriter>>,

    bus: Mutex<Option<Arc<dyn MessageBus>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,

    /// Serializes registration, deregistration and the cleanup sweep
    membership: Mutex<()>,

    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlPlane {
    /// In-memory control plane (no report store)
    pub fn new(config: ControlPlaneConfig) -> Self {
        Self::build(config, None)
    }

    /// Control plane persisting reports and the audit trail to `store`
    pub fn with_store(config: ControlPlaneConfig, store: Arc<ReportStore>) -> Self {
        Self::build(config, Some(store))
    }

    /// Open the report store when `storage.enabled` and build the control plane
    pub async fn from_config(config: ControlPlaneConfig) -> Result<Self> {
        config.validate()?;
        if config.storage.enabled {
            let store = Arc::new(ReportStore::open(&config.storage).await?);
            Ok(Self::with_store(config, store))
        } else {
            Ok(Self::new(config))
        }
    }

    fn build(config: ControlPlaneConfig, store: Option<Arc<ReportStore>>) -> Self {
        let registry = Arc::new(AgentRegistry::new(config.registry.clone()));
        let discovery = AgentDiscovery::new(Arc::clone(&registry));

        let mut allocator = ResourceAllocator::new(config.allocator.clone());
        let mut audit_events = None;
        if store.is_some() {
            let (tx, rx) = mpsc::unbounded_channel();
            allocator = allocator.with_audit_sink(tx);
            audit_events = Some(rx);
        }

        Self {
            config,
            registry,
            discovery,
            allocator: Arc::new(allocator),
            store,
            audit_events: Mutex::new(audit_events),
            audit_writer: tokio::sync::Mutex::new(None),
            bus: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            membership: Mutex::new(()),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn discovery(&self) -> &AgentDiscovery {
        &self.discovery
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    pub fn store(&self) -> Option<&Arc<ReportStore>> {
        self.store.as_ref()
    }

    /// Register an agent with the registry and its capacity with the allocator.
    ///
    /// Without an explicit total, an agent the allocator already knows keeps
    /// its current capacity; a new one gets the configured default.
    pub fn register_agent(
        &self,
        registration: AgentRegistration,
        resources: Option<ResourceQuota>,
    ) -> Result<AgentRecord> {
        if registration.agent_id.trim().is_empty() {
            return Err(ControlPlaneError::ValidationFailed("agent_id must not be empty".to_string()));
        }

        let _membership = self.membership.lock();
        let agent_id = registration.agent_id.clone();
        match resources {
            Some(total) => self.allocator.register_agent_resources(&agent_id, total)?,
            None if self.allocator.get_agent_resources(&agent_id).is_none() => {
                self.allocator.register_agent_default(&agent_id)?
            }
            None => {}
        }
        Ok(self.registry.register_agent(registration))
    }

    /// Remove an agent everywhere, releasing its allocations and reservations
    pub fn deregister_agent(&self, agent_id: &str) -> bool {
        let _membership = self.membership.lock();
        let in_registry = self.registry.deregister_agent(agent_id);
        let in_allocator = self.allocator.deregister_agent_resources(agent_id);
        in_registry || in_allocator
    }

    /// Remove agents with stale heartbeats and release everything they held
    pub fn run_cleanup_sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let _membership = self.membership.lock();
        let stale = self.registry.sweep_stale_agents_with(now, |agent_ids| {
            for agent_id in agent_ids {
                self.allocator.deregister_agent_resources(agent_id);
            }
        });
        if !stale.is_empty() {
            info!("Cleanup sweep removed {} stale agent(s)", stale.len());
        }
        stale
    }

    /// Agent runtime hosted next to this plane on a shared bus, depending on
    /// the report store when there is one
    pub fn local_runtime(&self, config: RuntimeConfig, bus: Arc<dyn MessageBus>) -> Result<AgentRuntime> {
        let mut runtime = AgentRuntime::on_shared_bus(config, bus)?;
        if let Some(store) = &self.store {
            let dependency: Arc<dyn Dependency> = store.clone();
            runtime = runtime.with_dependency(dependency);
        }
        Ok(runtime)
    }

    /// Release allocations and reservations past their expiry
    pub fn run_expiry_sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let report = self.allocator.sweep_expired(now);
        if !report.is_empty() {
            info!(
                "Expiry sweep released {} allocation(s), {} reservation(s)",
                report.allocations_released.len(),
                report.reservations_released.len()
            );
        }
        report
    }

    pub fn status(&self, now: DateTime<Utc>) -> ControlPlaneStatus {
        ControlPlaneStatus {
            registry: self.registry.statistics(now),
            allocator: self.allocator.get_statistics(),
            taken_at: now,
        }
    }

    /// Emit statistics and, with a store, append one report per agent and prune old ones
    pub async fn run_monitoring_tick(&self, now: DateTime<Utc>) -> ControlPlaneStatus {
        let registry = self.registry.report_statistics(now);
        let allocator = self.allocator.get_statistics();
        debug!(
            "Allocator: {} agents, {} allocations, {} reservations, cpu {:.1}%, memory {:.1}%",
            allocator.total_agents,
            allocator.active_allocations,
            allocator.active_reservations,
            allocator.cpu_utilization_pct,
            allocator.memory_utilization_pct
        );

        if let Some(store) = &self.store {
            let reports: Vec<AgentReport> = self
                .registry
                .get_all_agents(false)
                .iter()
                .map(|record| AgentReport::from_record(record, now))
                .collect();
            if let Err(e) = store.append_reports(&reports).await {
                warn!("Could not store agent reports: {}", e);
            }

            let retention = ChronoDuration::days(i64::from(self.config.storage.report_retention_days));
            if let Err(e) = store.prune_reports(now - retention).await {
                warn!("Could not prune agent reports: {}", e);
            }
        }

        ControlPlaneStatus {
            registry,
            allocator,
            taken_at: now,
        }
    }

    /// Listen for registrations, heartbeats and deregistrations on `bus`
    pub async fn attach_bus(self: &Arc<Self>, bus: Arc<dyn MessageBus>) -> Result<()> {
        if self.bus.lock().is_some() {
            return Err(ControlPlaneError::InvalidState("a message bus is already attached".to_string()));
        }
        bus.connect().await?;

        let routes = [
            (subjects::REGISTER, Channel::Register),
            (subjects::DEREGISTER, Channel::Deregister),
            (subjects::HEARTBEATS, Channel::Heartbeat),
        ];
        let mut ids = Vec::with_capacity(routes.len());
        for (subject, channel) in routes {
            let listener = Arc::new(FleetListener {
                plane: Arc::downgrade(self),
                channel,
            });
            ids.push(bus.subscribe(subject, listener, None).await?);
            debug!("Control plane listening on '{}'", subject);
        }

        self.subscriptions.lock().extend(ids);
        *self.bus.lock() = Some(bus);
        info!("Control plane attached to message bus");
        Ok(())
    }

    /// Ask an agent this plane does not know to register again
    async fn request_reregistration(&self, agent_id: &str) {
        let bus = self.bus.lock().clone();
        let Some(bus) = bus else {
            return;
        };
        let subject = subjects::agent_control(agent_id);
        let message = match Message::json(&subject, &BroadcastCommand::Reregister) {
            Ok(message) => message,
            Err(e) => {
                warn!("Could not encode re-register command for {}: {}", agent_id, e);
                return;
            }
        };
        match tokio::time::timeout(BUS_CALL_TIMEOUT, bus.publish(message, BUS_CALL_TIMEOUT)).await {
            Ok(Ok(())) => debug!("Asked agent {} to re-register", agent_id),
            Ok(Err(e)) => warn!("Re-register command to {} failed: {}", agent_id, e),
            Err(_) => warn!("Re-register command to {} timed out", agent_id),
        }
    }

    /// Spawn the cleanup, monitoring and expiry workers (and the audit writer with a store)
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ControlPlaneError::InvalidState("control plane was shut down".to_string()));
        }
        if !self.workers.lock().is_empty() {
            return Err(ControlPlaneError::InvalidState("control plane already started".to_string()));
        }

        let events = self.audit_events.lock().take();
        if let (Some(store), Some(events)) = (&self.store, events) {
            let writer = AuditWriter::start(Arc::clone(store), &self.config.storage, events, CancellationToken::new());
            *self.audit_writer.lock().await = Some(writer);
        }

        let registry = &self.config.registry;
        let workers = vec![
            self.spawn_worker("cleanup", registry.cleanup_interval(), |plane| async move {
                plane.run_cleanup_sweep(Utc::now());
            }),
            self.spawn_worker("monitoring", registry.health_check_interval(), |plane| async move {
                plane.run_monitoring_tick(Utc::now()).await;
            }),
            self.spawn_worker("expiry", self.config.allocator.expiry_sweep_interval(), |plane| async move {
                plane.run_expiry_sweep(Utc::now());
            }),
        ];
        self.workers.lock().extend(workers);

        info!(
            "Control plane started (cleanup {}s, monitoring {}s, expiry {}s, storage {})",
            registry.cleanup_interval_secs,
            registry.health_check_interval_secs,
            self.config.allocator.expiry_sweep_interval_secs,
            if self.store.is_some() { "on" } else { "off" }
        );
        Ok(())
    }

    fn spawn_worker<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<ControlPlane>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let plane = Arc::clone(self);
        let cancel = self.cancel.clone();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => tick(Arc::clone(&plane)).await,
                }
            }
            debug!("{} worker stopped", name);
        })
    }

    pub async fn audit_stats(&self) -> Option<AuditWriterStats> {
        self.audit_writer.lock().await.as_ref().map(AuditWriter::stats)
    }

    /// Stop the workers, detach from the bus and flush the audit trail
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("Shutting down control plane");
        self.cancel.cancel();

        let bus = self.bus.lock().take();
        if let Some(bus) = bus {
            let subscriptions: Vec<SubscriptionId> = std::mem::take(&mut *self.subscriptions.lock());
            for id in subscriptions {
                if !matches!(tokio::time::timeout(BUS_CALL_TIMEOUT, bus.unsubscribe(id)).await, Ok(Ok(_))) {
                    debug!("Could not drop subscription {}", id);
                }
            }
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let aborts: Vec<_> = handles.iter().map(|handle| handle.abort_handle()).collect();
        if tokio::time::timeout(WORKER_STOP_TIMEOUT, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("Control plane workers still running after {:?}, aborting", WORKER_STOP_TIMEOUT);
            for abort in aborts {
                abort.abort();
            }
        }

        if let Some(mut writer) = self.audit_writer.lock().await.take() {
            writer.shutdown().await;
        }
        info!("Control plane stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationRequest;
    use crate::discovery::{DiscoveryRequest, SelectionStrategy};
    use crate::messaging::InMemoryBus;
    use crate::runtime::connection::tests::fast_settings;
    use crate::runtime::{AgentRuntime, RuntimeConfig, TaskHandler, TaskRequest};
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn handle(&self, task: &TaskRequest) -> Result<serde_json::Value> {
            Ok(task.payload.clone())
        }
    }

    fn registration(agent_id: &str) -> AgentRegistration {
        AgentRegistration::new(agent_id, agent_id, "worker").with_capabilities(["execute_python"])
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[test]
    fn test_register_and_discover() {
        let plane = ControlPlane::new(ControlPlaneConfig::default());
        plane
            .register_agent(registration("a1"), Some(ResourceQuota::cpu_mem(4.0, 4096.0)))
            .unwrap();

        let found = plane
            .discovery()
            .discover_agent(&DiscoveryRequest::new("execute_python").with_strategy(SelectionStrategy::LeastLoaded));
        assert_eq!(found.unwrap().agent_id, "a1");
        assert_eq!(plane.allocator().get_agent_resources("a1").unwrap().total.cpu_cores, 4.0);
    }

    #[test]
    fn test_register_rejects_invalid_resources() {
        let plane = ControlPlane::new(ControlPlaneConfig::default());
        let result = plane.register_agent(registration("a1"), Some(ResourceQuota::cpu_mem(-1.0, 0.0)));
        assert!(matches!(result, Err(ControlPlaneError::ValidationFailed(_))));
        assert!(plane.registry().get_agent("a1").is_none());
    }

    #[test]
    fn test_reregistration_keeps_capacity() {
        let plane = ControlPlane::new(ControlPlaneConfig::default());
        plane
            .register_agent(registration("a1"), Some(ResourceQuota::cpu_mem(2.0, 1024.0)))
            .unwrap();
        plane.register_agent(registration("a1"), None).unwrap();
        assert_eq!(plane.allocator().get_agent_resources("a1").unwrap().total.cpu_cores, 2.0);
    }

    #[test]
    fn test_deregister_releases_allocations() {
        let plane = ControlPlane::new(ControlPlaneConfig::default());
        plane
            .register_agent(registration("a1"), Some(ResourceQuota::cpu_mem(4.0, 4096.0)))
            .unwrap();
        let allocation = plane
            .allocator()
            .allocate_resources(&AllocationRequest::new("t1", ResourceQuota::cpu_mem(2.0, 1024.0)))
            .unwrap()
            .unwrap();

        assert!(plane.deregister_agent("a1"));
        assert!(plane.registry().get_agent("a1").is_none());
        assert!(plane.allocator().get_allocation(&allocation.allocation_id).is_none());
        assert!(!plane.deregister_agent("a1"));
    }

    #[test]
    fn test_cleanup_sweep_releases_stale_agent() {
        let plane = ControlPlane::new(ControlPlaneConfig::default());
        plane.register_agent(registration("a1"), None).unwrap();
        plane
            .allocator()
            .allocate_resources(&AllocationRequest::new("t1", ResourceQuota::cpu_mem(1.0, 1.0)))
            .unwrap()
            .unwrap();

        assert!(plane.run_cleanup_sweep(Utc::now() + ChronoDuration::seconds(30)).is_empty());

        let removed = plane.run_cleanup_sweep(Utc::now() + ChronoDuration::seconds(91));
        assert_eq!(removed, vec!["a1".to_string()]);
        assert!(plane.allocator().allocations_for_agent("a1").is_empty());
        assert_eq!(plane.allocator().get_statistics().total_agents, 0);
    }

    #[test]
    fn test_expiry_sweep() {
        let plane = ControlPlane::new(ControlPlaneConfig::default());
        plane.register_agent(registration("a1"), None).unwrap();
        let allocation = plane
            .allocator()
            .allocate_resources(&AllocationRequest::new("t1", ResourceQuota::cpu_mem(1.0, 1.0)).with_timeout(10))
            .unwrap()
            .unwrap();

        assert!(plane.run_expiry_sweep(Utc::now()).is_empty());
        let report = plane.run_expiry_sweep(Utc::now() + ChronoDuration::seconds(11));
        assert_eq!(report.allocations_released, vec![allocation.allocation_id]);
        assert!(plane.allocator().capacity_invariant_holds());
    }

    #[tokio::test]
    async fn test_monitoring_tick_stores_reports() {
        let store = Arc::new(ReportStore::open_in_memory().await.unwrap());
        let plane = ControlPlane::with_store(ControlPlaneConfig::default(), Arc::clone(&store));
        plane.register_agent(registration("a1"), None).unwrap();
        plane.register_agent(registration("a2"), None).unwrap();

        let status = plane.run_monitoring_tick(Utc::now()).await;
        assert_eq!(status.registry.total_agents, 2);
        assert_eq!(status.allocator.total_agents, 2);
        assert_eq!(store.list_reports("a1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_audit_trail_flushed_on_shutdown() {
        let store = Arc::new(ReportStore::open_in_memory().await.unwrap());
        let plane = Arc::new(ControlPlane::with_store(ControlPlaneConfig::default(), Arc::clone(&store)));
        plane.start().await.unwrap();

        plane.register_agent(registration("a1"), None).unwrap();
        let allocation = plane
            .allocator()
            .allocate_resources(&AllocationRequest::new("t1", ResourceQuota::cpu_mem(1.0, 1.0)))
            .unwrap()
            .unwrap();
        plane.allocator().release_resources(&allocation.allocation_id);

        plane.shutdown().await;
        assert_eq!(store.list_audit(Some(&allocation.allocation_id), 10).await.unwrap().len(), 2);
        assert!(plane.start().await.is_err());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let plane = Arc::new(ControlPlane::new(ControlPlaneConfig::default()));
        plane.start().await.unwrap();
        assert!(plane.start().await.is_err());
        plane.shutdown().await;
    }

    #[tokio::test]
    async fn test_runtime_joins_and_leaves_over_bus() {
        let bus = Arc::new(InMemoryBus::new());
        let plane = Arc::new(ControlPlane::new(ControlPlaneConfig::default()));
        plane.attach_bus(bus.clone()).await.unwrap();

        let runtime = Arc::new(
            AgentRuntime::new(
                RuntimeConfig {
                    agent_id: "remote-1".to_string(),
                    capabilities: vec!["echo".to_string()],
                    connection: fast_settings(2),
                    ..Default::default()
                },
                bus.clone(),
            )
            .unwrap()
            .with_handler("echo", Arc::new(Echo)),
        );
        runtime.start().await.unwrap();

        assert!(wait_for(|| plane.registry().get_agent("remote-1").is_some()).await);
        assert!(plane.allocator().get_agent_resources("remote-1").is_some());
        assert_eq!(
            plane.discovery().discover_agent(&DiscoveryRequest::new("echo")).unwrap().agent_id,
            "remote-1"
        );

        let response = runtime.submit(TaskRequest::new("t1", "echo", json!({"ok": true}))).await;
        assert!(response.outcome.is_success());
        runtime.send_heartbeat().await;
        assert!(wait_for(|| plane
            .registry()
            .get_agent("remote-1")
            .map_or(false, |record| record.tasks_processed == 1))
        .await);

        runtime.shutdown().await.unwrap();
        assert!(wait_for(|| plane.registry().get_agent("remote-1").is_none()).await);
        assert!(plane.allocator().get_agent_resources("remote-1").is_none());

        plane.shutdown().await;
    }

    fn remote_config(agent_id: &str) -> RuntimeConfig {
        RuntimeConfig {
            agent_id: agent_id.to_string(),
            capabilities: vec!["echo".to_string()],
            connection: fast_settings(2),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_bus_registration_carries_resources() {
        let bus = Arc::new(InMemoryBus::new());
        let plane = Arc::new(ControlPlane::new(ControlPlaneConfig::default()));
        plane.attach_bus(bus.clone()).await.unwrap();

        let mut config = remote_config("big-1");
        config.resources = Some(ResourceQuota::cpu_mem(64.0, 65536.0));
        let runtime = Arc::new(AgentRuntime::new(config, bus.clone()).unwrap());
        runtime.start().await.unwrap();

        assert!(wait_for(|| plane.allocator().get_agent_resources("big-1").is_some()).await);
        let resources = plane.allocator().get_agent_resources("big-1").unwrap();
        assert_eq!(resources.total.cpu_cores, 64.0);
        assert_eq!(resources.total.memory_mb, 65536.0);
        assert!(plane.registry().get_agent("big-1").is_some());

        runtime.shutdown().await.unwrap();
        plane.shutdown().await;
    }

    #[tokio::test]
    async fn test_swept_remote_agent_told_to_reregister() {
        let bus = Arc::new(InMemoryBus::new());
        let plane = Arc::new(ControlPlane::new(ControlPlaneConfig::default()));
        plane.attach_bus(bus.clone()).await.unwrap();

        let mut config = remote_config("remote-2");
        config.resources = Some(ResourceQuota::cpu_mem(16.0, 8192.0));
        let runtime = Arc::new(AgentRuntime::new(config, bus.clone()).unwrap());
        runtime.start().await.unwrap();
        assert!(wait_for(|| plane.registry().get_agent("remote-2").is_some()).await);

        let removed = plane.run_cleanup_sweep(Utc::now() + ChronoDuration::days(1));
        assert_eq!(removed, vec!["remote-2".to_string()]);

        runtime.send_heartbeat().await;
        assert!(wait_for(|| plane.allocator().get_agent_resources("remote-2").is_some()).await);
        assert!(wait_for(|| plane.registry().get_agent("remote-2").is_some()).await);
        assert_eq!(
            plane.allocator().get_agent_resources("remote-2").unwrap().total.cpu_cores,
            16.0
        );

        runtime.shutdown().await.unwrap();
        plane.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_runtime_leaves_plane_listening() {
        let store = Arc::new(ReportStore::open_in_memory().await.unwrap());
        let plane = Arc::new(ControlPlane::with_store(ControlPlaneConfig::default(), store));
        let bus = Arc::new(InMemoryBus::new());
        plane.attach_bus(bus.clone()).await.unwrap();

        let runtime = Arc::new(
            plane
                .local_runtime(remote_config("local-1"), bus.clone())
                .unwrap()
                .with_handler("echo", Arc::new(Echo)),
        );
        runtime.start().await.unwrap();
        let dependencies = runtime.health_snapshot().dependencies;
        assert_eq!(dependencies.len(), 2);
        assert_eq!(dependencies[1].name, "report_store");
        assert!(wait_for(|| plane.registry().get_agent("local-1").is_some()).await);

        runtime.shutdown().await.unwrap();
        assert!(wait_for(|| plane.registry().get_agent("local-1").is_none()).await);
        assert!(bus.is_connected());
        assert_eq!(bus.subscription_count(), 3);

        let late = RegisterMessage {
            registration: registration("late-1"),
            resources: None,
        };
        bus.publish(Message::json(subjects::REGISTER, &late).unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(wait_for(|| plane.registry().get_agent("late-1").is_some()).await);

        plane.shutdown().await;
    }

    #[test]
    fn test_cleanup_sweep_never_strands_reregistered_agent() {
        let plane = Arc::new(ControlPlane::new(ControlPlaneConfig::default()));
        let quota = ResourceQuota::cpu_mem(2.0, 1024.0);
        plane.register_agent(registration("flappy"), Some(quota.clone())).unwrap();

        let sweeper = {
            let plane = Arc::clone(&plane);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    plane.run_cleanup_sweep(Utc::now() + ChronoDuration::days(1));
                }
            })
        };
        let registrar = {
            let plane = Arc::clone(&plane);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    plane.register_agent(registration("flappy"), Some(quota.clone())).unwrap();
                }
            })
        };
        sweeper.join().unwrap();
        registrar.join().unwrap();

        let in_registry = plane.registry().get_agent("flappy").is_some();
        let in_allocator = plane.allocator().get_agent_resources("flappy").is_some();
        assert_eq!(in_registry, in_allocator);
    }
}
