// packages/control-plane/src/runtime/circuit_breaker.rs
//! Circuit breaker
//!
//! ```text
//!            failures >= threshold
//!   Closed ───────────────────────────▶ Open
//!     ▲                                  │ open_timeout elapsed
//!     │ half_open_max_calls successes    │ (checked on next call)
//!     │                                  ▼
//!     └─────────────────────────────── HalfOpen ──any failure──▶ Open
//! ```
//!
//! State is evaluated once per call under the breaker's own lock; there is
//! no background timer.

use crate::observability::CIRCUIT_TRANSITIONS_TOTAL;
use crate::utils::errors::{ControlPlaneError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures that open a closed breaker (default: 5)
    pub failure_threshold: u32,

    /// Time since the last failure before a probe is allowed (default: 60000)
    pub open_timeout_ms: u64,

    /// Probe calls admitted while half-open; this many successes close it (default: 3)
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 60_000,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 || self.half_open_max_calls == 0 {
            return Err(ControlPlaneError::ConfigError(
                "circuit breaker thresholds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker guarding one dependency or call type
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        }
    }

    /// Admit a call or reject it with `CircuitOpen`
    pub fn try_acquire(&self) -> Result<()> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or(Duration::MAX);
            if elapsed < self.config.open_timeout() {
                return Err(ControlPlaneError::CircuitOpen(self.name.clone()));
            }
            inner.success_count = 0;
            inner.half_open_calls = 0;
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_calls >= self.config.half_open_max_calls {
                return Err(ControlPlaneError::CircuitOpen(self.name.clone()));
            }
            inner.half_open_calls += 1;
        }

        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_max_calls {
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_calls = 0;
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` through the breaker, recording its outcome
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire()?;

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;

        match to {
            CircuitState::Open => warn!(
                "Circuit breaker '{}' opened ({} -> open, {} failures)",
                self.name, from, inner.failure_count
            ),
            CircuitState::HalfOpen => debug!("Circuit breaker '{}' half-open, probing", self.name),
            CircuitState::Closed => info!("Circuit breaker '{}' closed", self.name),
        }
        metrics::counter!(
            CIRCUIT_TRANSITIONS_TOTAL,
            "breaker" => self.name.clone(),
            "state" => to.as_str()
        )
        .increment(1);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
