// packages/control-plane/src/runtime/agent_runtime.rs
//! Resilient agent runtime
//!
//! The state machine every agent process runs:
//!
//! ```text
//! Created → Starting → Running ⇄ Degraded → Stopping → Stopped
//!              │          │          │
//!              └──────────┴──────────┴──▶ Error  (message bus lost for good)
//! ```
//!
//! - `Running` requires the message bus to be connected
//! - `Degraded` means an optional dependency (report store, cache) is down
//! - heartbeat and connection-monitor loops run until shutdown cancels them
//! - a heartbeat the fleet no longer recognizes, or a `reregister` command on
//!   `fleet.agent.<id>.control`, repeats the full registration
//! - shutdown drains in-flight tasks within `shutdown_timeout_ms`, then closes
//!   every connection regardless of how the drain went

use crate::allocation::{ResourceAllocator, ResourceQuota};
use crate::messaging::{
    subjects, BroadcastCommand, BusDependency, DeregisterMessage, HealthReply, HeartbeatMessage, Message,
    MessageBus, MessageHandler, RegisterMessage, SubscriptionId,
};
use crate::registry::{AgentRegistration, AgentRegistry, HeartbeatMetrics};
use crate::runtime::circuit_breaker::{CircuitBreakerConfig, CircuitSnapshot};
use crate::runtime::connection::{ConnectionSettings, ConnectionState, Dependency, ManagedConnection};
use crate::runtime::executor::{ExecutorConfig, ExecutorStats, TaskExecutor};
use crate::runtime::retry::RetryPolicy;
use crate::runtime::task::{TaskHandler, TaskRequest, TaskResponse};
use crate::utils::errors::{ControlPlaneError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Agent lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Created,
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Created => "created",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Degraded => "degraded",
            AgentState::Stopping => "stopping",
            AgentState::Stopped => "stopped",
            AgentState::Error => "error",
        }
    }

    /// Accepting tasks
    pub fn is_serving(&self) -> bool {
        matches!(self, AgentState::Running | AgentState::Degraded)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one agent runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Run a local agent inside the `fleet-control` daemon (default: false)
    pub enabled: bool,

    pub agent_id: String,
    pub name: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub tags: HashMap<String, String>,

    /// Capacity registered with the allocator (allocator default when unset)
    pub resources: Option<ResourceQuota>,

    /// Queue group for the task subject, so replicas share work
    pub queue_group: Option<String>,

    /// Concurrency gate size, also the registered max load (default: 10)
    pub max_concurrent_tasks: usize,

    /// Overall budget per task attempt (default: 300000)
    pub task_timeout_ms: u64,

    /// Processing-time samples kept for percentiles (default: 1000)
    pub stats_window: usize,

    /// Heartbeat period (default: 30000)
    pub heartbeat_interval_ms: u64,

    /// Connection monitor period (default: 30000)
    pub monitor_interval_ms: u64,

    /// Budget for draining in-flight work on shutdown (default: 30000)
    pub shutdown_timeout_ms: u64,

    /// Budget for each publish (default: 5000)
    pub publish_timeout_ms: u64,

    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub connection: ConnectionSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            agent_id: "agent-local".to_string(),
            name: "local-agent".to_string(),
            agent_type: "generic".to_string(),
            capabilities: vec![],
            version: "1.0.0".to_string(),
            host: "localhost".to_string(),
            port: 0,
            tags: HashMap::new(),
            resources: None,
            queue_group: None,
            max_concurrent_tasks: 10,
            task_timeout_ms: 300_000,
            stats_window: 1000,
            heartbeat_interval_ms: 30_000,
            monitor_interval_ms: 30_000,
            shutdown_timeout_ms: 30_000,
            publish_timeout_ms: 5_000,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            connection: ConnectionSettings::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent_id.trim().is_empty() {
            return Err(ControlPlaneError::ConfigError("runtime.agent_id must not be empty".to_string()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(ControlPlaneError::ConfigError(
                "runtime.max_concurrent_tasks must be positive".to_string(),
            ));
        }
        if self.task_timeout_ms == 0 || self.heartbeat_interval_ms == 0 || self.monitor_interval_ms == 0 {
            return Err(ControlPlaneError::ConfigError(
                "runtime timeouts and intervals must be positive".to_string(),
            ));
        }
        if let Some(resources) = &self.resources {
            resources
                .validate()
                .map_err(|e| ControlPlaneError::ConfigError(format!("runtime.resources: {}", e)))?;
        }
        self.circuit_breaker.validate()?;
        self.connection.circuit_breaker.validate()
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent_tasks: self.max_concurrent_tasks,
            task_timeout_ms: self.task_timeout_ms,
            stats_window: self.stats_window,
            retry: self.retry.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
        }
    }

    pub fn registration(&self) -> AgentRegistration {
        let mut registration = AgentRegistration::new(&self.agent_id, &self.name, &self.agent_type)
            .with_capabilities(self.capabilities.iter().cloned())
            .with_version(&self.version)
            .with_address(&self.host, self.port)
            .with_max_load(u32::try_from(self.max_concurrent_tasks).unwrap_or(u32::MAX));
        for (key, value) in &self.tags {
            registration = registration.with_tag(key, value);
        }
        registration
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// State implied by `(required, state)` pairs for every dependency
pub fn derive_state(connections: &[(bool, ConnectionState)]) -> AgentState {
    let mut degraded = false;
    for (required, state) in connections {
        match (required, state) {
            (_, ConnectionState::Connected) => {}
            (true, ConnectionState::Failed) => return AgentState::Error,
            _ => degraded = true,
        }
    }
    if degraded {
        AgentState::Degraded
    } else {
        AgentState::Running
    }
}

/// Dependency status inside a health snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub required: bool,
    pub state: ConnectionState,
}

/// Status snapshot published on request and on `report_status` broadcasts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub agent_id: String,
    pub state: AgentState,
    pub uptime_secs: u64,
    pub dependencies: Vec<DependencyHealth>,
    pub breakers: Vec<CircuitSnapshot>,
    pub executor: ExecutorStats,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
enum Channel {
    Tasks,
    Commands,
    Status,
    Health,
}

/// Routes bus messages back into the runtime without keeping it alive
struct RuntimeListener {
    runtime: Weak<AgentRuntime>,
    channel: Channel,
}

#[async_trait]
impl MessageHandler for RuntimeListener {
    async fn on_message(&self, message: Message) {
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };
        match self.channel {
            Channel::Tasks => runtime.handle_task_message(message).await,
            Channel::Commands => runtime.handle_command(message).await,
            Channel::Status => {
                if let Some(reply) = message.reply {
                    runtime.publish_json(&reply, &runtime.health_snapshot()).await;
                }
            }
            Channel::Health => {
                if let Some(reply) = message.reply {
                    let state = runtime.state();
                    let answer = HealthReply {
                        agent_id: runtime.agent_id().to_string(),
                        state,
                        healthy: state.is_serving(),
                    };
                    runtime.publish_json(&reply, &answer).await;
                }
            }
        }
    }
}

/// Runtime hosting one agent's task handlers
pub struct AgentRuntime {
    config: RuntimeConfig,
    bus: Arc<dyn MessageBus>,

    /// Message bus first, then optional dependencies in registration order
    connections: Vec<Arc<ManagedConnection>>,

    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    executor: TaskExecutor,
    registry: Option<Arc<AgentRegistry>>,
    allocator: Option<Arc<ResourceAllocator>>,

    state: RwLock<AgentState>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    started_at: Mutex<Option<Instant>>,
}

impl AgentRuntime {
    /// Runtime owning `bus`: shutdown closes it
    pub fn new(config: RuntimeConfig, bus: Arc<dyn MessageBus>) -> Result<Self> {
        let dependency = BusDependency::new(Arc::clone(&bus));
        Self::build(config, bus, dependency)
    }

    /// Runtime on a bus shared with other components: shutdown drops only
    /// this runtime's subscriptions and leaves the bus open
    pub fn on_shared_bus(config: RuntimeConfig, bus: Arc<dyn MessageBus>) -> Result<Self> {
        let dependency = BusDependency::shared(Arc::clone(&bus));
        Self::build(config, bus, dependency)
    }

    fn build(config: RuntimeConfig, bus: Arc<dyn MessageBus>, dependency: BusDependency) -> Result<Self> {
        config.validate()?;

        let bus_connection = ManagedConnection::new(Arc::new(dependency), config.connection.clone());
        let executor = TaskExecutor::new(config.agent_id.clone(), config.executor_config());

        Ok(Self {
            config,
            bus,
            connections: vec![Arc::new(bus_connection)],
            handlers: HashMap::new(),
            executor,
            registry: None,
            allocator: None,
            state: RwLock::new(AgentState::Created),
            subscriptions: Mutex::new(vec![]),
            background: Mutex::new(vec![]),
            cancel: CancellationToken::new(),
            started_at: Mutex::new(None),
        })
    }

    /// Register with, heartbeat into, and report load to an in-process registry
    pub fn with_registry(mut self, registry: Arc<AgentRegistry>) -> Self {
        self.executor = self.executor.with_registry(Arc::clone(&registry));
        self.registry = Some(registry);
        self
    }

    /// Register capacity with an in-process allocator
    pub fn with_allocator(mut self, allocator: Arc<ResourceAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn with_dependency(mut self, dependency: Arc<dyn Dependency>) -> Self {
        self.connections.push(Arc::new(ManagedConnection::new(
            dependency,
            self.config.connection.clone(),
        )));
        self
    }

    pub fn with_handler(mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(task_type.into(), handler);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn state(&self) -> AgentState {
        *self.state.read()
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    fn set_state(&self, to: AgentState) {
        let mut state = self.state.write();
        if *state != to {
            info!("Agent {} state {} -> {}", self.config.agent_id, *state, to);
            *state = to;
        }
    }

    fn connection_states(&self) -> Vec<(bool, ConnectionState)> {
        self.connections
            .iter()
            .map(|connection| (connection.is_required(), connection.state()))
            .collect()
    }

    /// Connect dependencies, register, subscribe and start background loops
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != AgentState::Created {
                return Err(ControlPlaneError::InvalidState(format!(
                    "agent {} cannot start from {}",
                    self.config.agent_id, *state
                )));
            }
            *state = AgentState::Starting;
        }
        info!(
            "Starting agent {} ({}) with {} task type(s)",
            self.config.agent_id,
            self.config.agent_type,
            self.handlers.len()
        );

        for connection in &self.connections {
            match connection.connect_with_retry(&self.cancel).await {
                Ok(()) => {}
                Err(e) if connection.is_required() => {
                    error!(
                        "Required dependency '{}' unavailable, aborting start: {}",
                        connection.name(),
                        e
                    );
                    self.set_state(AgentState::Error);
                    self.close_connections().await;
                    return Err(ControlPlaneError::StartupFailed(format!(
                        "required dependency '{}' unavailable: {}",
                        connection.name(),
                        e
                    )));
                }
                Err(e) => warn!(
                    "Optional dependency '{}' unavailable, continuing degraded: {}",
                    connection.name(),
                    e
                ),
            }
        }

        if let Err(e) = self.subscribe_all().await {
            self.set_state(AgentState::Error);
            self.close_connections().await;
            return Err(ControlPlaneError::StartupFailed(format!("subscription failed: {}", e)));
        }

        self.register_with_fleet().await;
        *self.started_at.lock() = Some(Instant::now());

        {
            let mut background = self.background.lock();
            background.push(self.spawn_heartbeat_loop());
            background.push(self.spawn_monitor_loop());
        }

        let state = derive_state(&self.connection_states());
        self.set_state(state);
        Ok(())
    }

    async fn subscribe_all(self: &Arc<Self>) -> Result<()> {
        let agent_id = &self.config.agent_id;
        let routes = [
            (subjects::agent_tasks(agent_id), Channel::Tasks, self.config.queue_group.as_deref()),
            (subjects::BROADCAST.to_string(), Channel::Commands, None),
            (subjects::agent_control(agent_id), Channel::Commands, None),
            (subjects::agent_status(agent_id), Channel::Status, None),
            (subjects::agent_health(agent_id), Channel::Health, None),
        ];

        for (subject, channel, queue_group) in routes {
            let listener = Arc::new(RuntimeListener {
                runtime: Arc::downgrade(self),
                channel,
            });
            let id = self.bus.subscribe(&subject, listener, queue_group).await?;
            self.subscriptions.lock().push(id);
            debug!("Agent {} listening on '{}'", agent_id, subject);
        }
        Ok(())
    }

    /// Register with the in-process registry and allocator, then announce on the bus
    async fn register_with_fleet(&self) {
        let registration = self.config.registration();

        if let Some(registry) = &self.registry {
            registry.register_agent(registration.clone());
        }

        if let Some(allocator) = &self.allocator {
            let result = match &self.config.resources {
                Some(total) => allocator.register_agent_resources(&self.config.agent_id, total.clone()),
                None => allocator.register_agent_default(&self.config.agent_id),
            };
            if let Err(e) = result {
                warn!("Could not register resources for {}: {}", self.config.agent_id, e);
            }
        }

        let message = RegisterMessage {
            registration,
            resources: self.config.resources.clone(),
        };
        self.publish_json(subjects::REGISTER, &message).await;
    }

    fn spawn_heartbeat_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        let cancel = self.cancel.clone();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => runtime.send_heartbeat().await,
                }
            }
            debug!("Heartbeat loop for {} stopped", runtime.config.agent_id);
        })
    }

    fn spawn_monitor_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = self.config.monitor_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        runtime.check_connections().await;
                    }
                }
            }
            debug!("Connection monitor for {} stopped", runtime.config.agent_id);
        })
    }

    /// Publish a heartbeat and refresh the in-process registry entry
    pub async fn send_heartbeat(&self) {
        let stats = self.executor.stats();
        let metrics = HeartbeatMetrics {
            current_load: Some(u32::try_from(stats.in_flight).unwrap_or(u32::MAX)),
            tasks_processed: Some(stats.attempts),
            tasks_failed: Some(stats.failed_attempts),
            average_response_time_ms: (stats.processing.total_samples > 0).then_some(stats.processing.ema_ms),
        };

        if let Some(registry) = &self.registry {
            if !registry.heartbeat(&self.config.agent_id, None) {
                warn!("Agent {} unknown to registry, re-registering", self.config.agent_id);
                self.register_with_fleet().await;
            }
        }

        let heartbeat = HeartbeatMessage {
            agent_id: self.config.agent_id.clone(),
            state: self.state(),
            metrics,
            sent_at: Utc::now(),
        };
        self.publish_json(&subjects::heartbeat(&self.config.agent_id), &heartbeat)
            .await;
    }

    /// Probe every dependency, reconnect what is down, and settle the state
    pub async fn check_connections(&self) -> AgentState {
        for connection in &self.connections {
            let state = connection.ensure_connected(&self.cancel).await;
            if state != ConnectionState::Connected {
                debug!("Dependency '{}' is {}", connection.name(), state);
            }
        }

        let derived = derive_state(&self.connection_states());
        let mut state = self.state.write();
        if state.is_serving() && *state != derived {
            match derived {
                AgentState::Error => error!("Agent {} lost its message bus", self.config.agent_id),
                AgentState::Degraded => warn!("Agent {} degraded", self.config.agent_id),
                _ => info!("Agent {} recovered", self.config.agent_id),
            }
            *state = derived;
        }
        *state
    }

    /// Run a task through the executor, or reject it if this agent cannot.
    /// An allocation attached to the task is released either way.
    pub async fn submit(&self, task: TaskRequest) -> TaskResponse {
        let allocation_id = task.allocation_id().map(str::to_string);

        let state = self.state();
        let response = if !state.is_serving() {
            self.executor.reject(task, format!("agent is {}", state))
        } else {
            match self.handlers.get(&task.task_type).cloned() {
                Some(handler) => self.executor.execute(task, handler).await,
                None => {
                    let reason = format!("no handler for task type '{}'", task.task_type);
                    self.executor.reject(task, reason)
                }
            }
        };

        if let (Some(allocation_id), Some(allocator)) = (allocation_id, &self.allocator) {
            if !allocator.release_resources(&allocation_id) {
                debug!("Allocation {} already released", allocation_id);
            }
        }
        response
    }

    async fn handle_task_message(&self, message: Message) {
        let mut task: TaskRequest = match message.decode() {
            Ok(task) => task,
            Err(e) => {
                warn!("Dropping malformed task on '{}': {}", message.subject, e);
                return;
            }
        };
        if task.reply_to.is_none() {
            task.reply_to = message.reply;
        }

        let reply_to = task.reply_to.clone();
        let response = self.submit(task).await;
        if let Some(subject) = reply_to {
            self.publish_json(&subject, &response).await;
        }
    }

    async fn handle_command(&self, message: Message) {
        match message.decode::<BroadcastCommand>() {
            Ok(BroadcastCommand::ReportStatus) => {
                let subject = subjects::agent_status(&self.config.agent_id);
                self.publish_json(&subject, &self.health_snapshot()).await;
            }
            Ok(BroadcastCommand::Heartbeat) => self.send_heartbeat().await,
            Ok(BroadcastCommand::Reregister) => {
                info!("Agent {} asked to register again", self.config.agent_id);
                self.register_with_fleet().await;
            }
            Err(e) => debug!("Ignoring command on '{}': {}", message.subject, e),
        }
    }

    /// Serialize and publish, logging instead of failing
    async fn publish_json<T: Serialize>(&self, subject: &str, value: &T) {
        let message = match Message::json(subject, value) {
            Ok(message) => message,
            Err(e) => {
                warn!("Could not encode message for '{}': {}", subject, e);
                return;
            }
        };

        let timeout = self.config.publish_timeout();
        match tokio::time::timeout(timeout, self.bus.publish(message, timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Publish to '{}' failed: {}", subject, e),
            Err(_) => warn!("Publish to '{}' timed out", subject),
        }
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        let mut breakers: Vec<CircuitSnapshot> = self
            .connections
            .iter()
            .map(|connection| connection.breaker().snapshot())
            .collect();
        breakers.extend(self.executor.breaker_snapshots());

        HealthSnapshot {
            agent_id: self.config.agent_id.clone(),
            state: self.state(),
            uptime_secs: self
                .started_at
                .lock()
                .map(|at| at.elapsed().as_secs())
                .unwrap_or(0),
            dependencies: self
                .connections
                .iter()
                .map(|connection| DependencyHealth {
                    name: connection.name().to_string(),
                    required: connection.is_required(),
                    state: connection.state(),
                })
                .collect(),
            breakers,
            executor: self.executor.stats(),
            taken_at: Utc::now(),
        }
    }

    /// Stop loops, drain in-flight tasks, deregister, then force-close connections
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            match *state {
                AgentState::Stopping | AgentState::Stopped => return Ok(()),
                AgentState::Created => {
                    *state = AgentState::Stopped;
                    return Ok(());
                }
                _ => *state = AgentState::Stopping,
            }
        }
        info!("Stopping agent {}", self.config.agent_id);

        let timeout = self.config.shutdown_timeout();
        let started = Instant::now();
        self.cancel.cancel();

        let subscriptions: Vec<SubscriptionId> = std::mem::take(&mut *self.subscriptions.lock());
        for id in subscriptions {
            let unsubscribe = tokio::time::timeout(self.config.publish_timeout(), self.bus.unsubscribe(id));
            if !matches!(unsubscribe.await, Ok(Ok(_))) {
                debug!("Could not drop subscription {}", id);
            }
        }

        if let Err(e) = self.executor.drain(timeout).await {
            warn!("Agent {}: {}; closing anyway", self.config.agent_id, e);
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        let aborts: Vec<_> = handles.iter().map(|handle| handle.abort_handle()).collect();
        let remaining = timeout.saturating_sub(started.elapsed());
        if tokio::time::timeout(remaining, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(
                "Background tasks of {} still running after {:?}, aborting",
                self.config.agent_id, timeout
            );
            for abort in aborts {
                abort.abort();
            }
        }

        self.deregister_from_fleet().await;
        self.close_connections().await;

        self.set_state(AgentState::Stopped);
        info!("Agent {} stopped", self.config.agent_id);
        Ok(())
    }

    async fn deregister_from_fleet(&self) {
        let message = DeregisterMessage {
            agent_id: self.config.agent_id.clone(),
            reason: Some("shutdown".to_string()),
        };
        self.publish_json(subjects::DEREGISTER, &message).await;

        if let Some(registry) = &self.registry {
            registry.deregister_agent(&self.config.agent_id);
        }
        if let Some(allocator) = &self.allocator {
            allocator.deregister_agent_resources(&self.config.agent_id);
        }
    }

    /// Close every connection, optional ones first, each within its own budget
    async fn close_connections(&self) {
        for connection in self.connections.iter().rev() {
            connection.close().await;
        }
    }
}

impl fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("agent_id", &self.config.agent_id)
            .field("state", &self.state())
            .field("connections", &self.connections)
            .finish()
    }
}
