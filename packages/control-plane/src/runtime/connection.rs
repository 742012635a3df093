// packages/control-plane/src/runtime/connection.rs
//! Managed dependency connections
//!
//! Each external dependency (message bus, report store, ...) implements
//! [`Dependency`] and is wrapped in a [`ManagedConnection`] that drives its
//! connection state machine:
//!
//! ```text
//! Disconnected → Connecting → Connected
//!                                │ probe fails
//!                                ▼
//!                          Reconnecting → Connected
//!                                │ retry budget exhausted
//!                                ▼
//!                              Failed
//! ```

use crate::observability::CONNECTION_ATTEMPTS_TOTAL;
use crate::runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::runtime::retry::RetryPolicy;
use crate::utils::errors::{ControlPlaneError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// An external collaborator the runtime connects to
#[async_trait]
pub trait Dependency: Send + Sync {
    fn name(&self) -> &str;

    /// Required dependencies abort start when unreachable; optional ones degrade
    fn is_required(&self) -> bool;

    async fn connect(&self) -> Result<()>;

    async fn health_check(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timeouts and retry budget for one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Budget for one connect attempt (default: 10000)
    pub connect_timeout_ms: u64,

    /// Budget for one health probe (default: 5000)
    pub probe_timeout_ms: u64,

    /// Drain/close budget during shutdown (default: 5000)
    pub close_timeout_ms: u64,

    pub retry: RetryPolicy,

    /// Breaker guarding health probes
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            probe_timeout_ms: 5_000,
            close_timeout_ms: 5_000,
            retry: RetryPolicy {
                max_attempts: 5,
                ..Default::default()
            },
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// A dependency plus its connection state machine
pub struct ManagedConnection {
    dependency: Arc<dyn Dependency>,
    settings: ConnectionSettings,
    state: RwLock<ConnectionState>,
    breaker: CircuitBreaker,
}

impl ManagedConnection {
    pub fn new(dependency: Arc<dyn Dependency>, settings: ConnectionSettings) -> Self {
        let breaker = CircuitBreaker::new(dependency.name().to_string(), settings.circuit_breaker.clone());
        Self {
            dependency,
            settings,
            state: RwLock::new(ConnectionState::Disconnected),
            breaker,
        }
    }

    pub fn name(&self) -> &str {
        self.dependency.name()
    }

    pub fn is_required(&self) -> bool {
        self.dependency.is_required()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn set_state(&self, to: ConnectionState) {
        let mut state = self.state.write();
        if *state != to {
            debug!("Connection '{}': {} -> {}", self.name(), *state, to);
            *state = to;
        }
    }

    /// Connect with exponential backoff until connected, out of attempts, or cancelled
    pub async fn connect_with_retry(&self, cancel: &CancellationToken) -> Result<()> {
        let reconnecting = matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Reconnecting | ConnectionState::Failed
        );
        self.set_state(if reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        let policy = &self.settings.retry;
        let mut attempts = 0u32;
        let mut last_error = String::new();

        while policy.allows_another(attempts) {
            let outcome = tokio::time::timeout(self.settings.connect_timeout(), self.dependency.connect()).await;
            attempts += 1;

            match outcome {
                Ok(Ok(())) => {
                    metrics::counter!(
                        CONNECTION_ATTEMPTS_TOTAL,
                        "dependency" => self.name().to_string(),
                        "result" => "success"
                    )
                    .increment(1);
                    self.set_state(ConnectionState::Connected);
                    info!("Connected to '{}' after {} attempt(s)", self.name(), attempts);
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("connect timed out after {}ms", self.settings.connect_timeout_ms)
                }
            }

            metrics::counter!(
                CONNECTION_ATTEMPTS_TOTAL,
                "dependency" => self.name().to_string(),
                "result" => "failure"
            )
            .increment(1);
            warn!(
                "Connection attempt {}/{} to '{}' failed: {}",
                attempts,
                policy.max_attempts,
                self.name(),
                last_error
            );

            if policy.allows_another(attempts) {
                let delay = policy.jittered_delay(attempts - 1);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.set_state(ConnectionState::Disconnected);
                        return Err(ControlPlaneError::ConnectionFailed {
                            dependency: self.name().to_string(),
                            reason: "cancelled".to_string(),
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.set_state(ConnectionState::Failed);
        error!("Giving up on '{}' after {} attempts", self.name(), attempts);
        Err(ControlPlaneError::ConnectionFailed {
            dependency: self.name().to_string(),
            reason: last_error,
        })
    }

    /// Health-check through the breaker; `Ok` only if connected and healthy
    pub async fn probe(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(ControlPlaneError::ConnectionFailed {
                dependency: self.name().to_string(),
                reason: format!("state is {}", self.state()),
            });
        }

        let timeout = self.settings.probe_timeout();
        let name = self.name().to_string();
        self.breaker
            .call(|| async move {
                tokio::time::timeout(timeout, self.dependency.health_check())
                    .await
                    .map_err(|_| ControlPlaneError::Timeout(format!("health check of '{}'", name)))?
            })
            .await
    }

    /// Probe and, if unhealthy, reconnect. Returns the resulting state.
    pub async fn ensure_connected(&self, cancel: &CancellationToken) -> ConnectionState {
        match self.probe().await {
            Ok(()) => ConnectionState::Connected,
            Err(ControlPlaneError::CircuitOpen(_)) => self.state(),
            Err(e) => {
                warn!("Connection '{}' unhealthy: {}", self.name(), e);
                if self.is_connected() {
                    self.set_state(ConnectionState::Reconnecting);
                }
                if let Err(e) = self.connect_with_retry(cancel).await {
                    warn!("Reconnect to '{}' failed: {}", self.name(), e);
                }
                self.state()
            }
        }
    }

    /// Close within the close budget; the state ends Disconnected either way
    pub async fn close(&self) {
        match tokio::time::timeout(self.settings.close_timeout(), self.dependency.close()).await {
            Ok(Ok(())) => debug!("Closed '{}'", self.name()),
            Ok(Err(e)) => warn!("Error closing '{}': {}", self.name(), e),
            Err(_) => warn!(
                "Closing '{}' exceeded {}ms, abandoning",
                self.name(),
                self.settings.close_timeout_ms
            ),
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Dependency that fails its first `failures` connects
    pub(crate) struct FlakyDependency {
        pub name: String,
        pub required: bool,
        pub failures: AtomicU32,
        pub connects: AtomicU32,
        pub healthy: AtomicBool,
        pub closed: AtomicBool,
    }

    impl FlakyDependency {
        pub fn new(name: &str, required: bool, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                required,
                failures: AtomicU32::new(failures),
                connects: AtomicU32::new(0),
                healthy: AtomicBool::new(true),
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Dependency for FlakyDependency {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_required(&self) -> bool {
            self.required
        }

        async fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ControlPlaneError::Messaging("refused".into()));
            }
            self.healthy.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn health_check(&self) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ControlPlaneError::Messaging("down".into()))
            }
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn fast_settings(max_attempts: u32) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout_ms: 500,
            probe_timeout_ms: 500,
            close_timeout_ms: 500,
            retry: RetryPolicy {
                base_delay_ms: 1,
                max_delay_ms: 5,
                max_attempts,
                jitter: true,
            },
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_connects_after_transient_failures() {
        let dependency = FlakyDependency::new("bus", true, 2);
        let connection = ManagedConnection::new(dependency.clone(), fast_settings(5));

        connection.connect_with_retry(&CancellationToken::new()).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(dependency.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fails_after_budget() {
        let dependency = FlakyDependency::new("bus", true, 10);
        let connection = ManagedConnection::new(dependency.clone(), fast_settings(3));

        let result = connection.connect_with_retry(&CancellationToken::new()).await;
        assert!(matches!(result, Err(ControlPlaneError::ConnectionFailed { .. })));
        assert_eq!(connection.state(), ConnectionState::Failed);
        assert_eq!(dependency.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unhealthy_probe_triggers_reconnect() {
        let dependency = FlakyDependency::new("db", false, 0);
        let connection = ManagedConnection::new(dependency.clone(), fast_settings(3));
        let cancel = CancellationToken::new();
        connection.connect_with_retry(&cancel).await.unwrap();

        dependency.healthy.store(false, Ordering::SeqCst);
        let state = connection.ensure_connected(&cancel).await;
        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(dependency.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_resets_state() {
        let dependency = FlakyDependency::new("db", false, 0);
        let connection = ManagedConnection::new(dependency.clone(), fast_settings(1));
        connection.connect_with_retry(&CancellationToken::new()).await.unwrap();

        connection.close().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(dependency.closed.load(Ordering::SeqCst));
    }
}
