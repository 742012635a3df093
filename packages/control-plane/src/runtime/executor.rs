// packages/control-plane/src/runtime/executor.rs
//! Bounded task execution
//!
//! Tasks are admitted through a fixed-size semaphore (backpressure when all
//! slots are busy), run under an overall timeout, guarded by one circuit
//! breaker per task type, and retried with exponential backoff.
//!
//! ```text
//! TaskRequest
//!   ├─ expired?            → Expired
//!   ├─ acquire permit      (waits while max_concurrent_tasks are running)
//!   ├─ breaker admits?     → Rejected
//!   ├─ acquire agent load  (LoadGuard, released on drop)
//!   ├─ handler under timeout
//!   │    ├─ Ok             → Completed
//!   │    └─ Err / timeout  → release permit, back off, retry while allowed
//!   └─ retries exhausted   → Failed / TimedOut
//! ```

use crate::observability::{TASKS_TOTAL, TASK_DURATION_MS, TASK_RETRIES_TOTAL};
use crate::registry::AgentRegistry;
use crate::runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use crate::runtime::retry::RetryPolicy;
use crate::runtime::task::{TaskHandler, TaskOutcome, TaskRequest, TaskResponse};
use crate::utils::errors::{ControlPlaneError, Result};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Weight of the newest sample in the processing-time average
const PROCESSING_EMA_ALPHA: f64 = 0.1;

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Concurrency gate size (default: 10)
    pub max_concurrent_tasks: usize,

    /// Overall budget per attempt in milliseconds (default: 300000)
    pub task_timeout_ms: u64,

    /// Processing-time samples kept for percentiles (default: 1000)
    pub stats_window: usize,

    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            task_timeout_ms: 300_000,
            stats_window: 1000,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

/// Rolling window of processing times
#[derive(Debug)]
pub struct ProcessingStats {
    window: VecDeque<f64>,
    capacity: usize,
    ema_ms: Option<f64>,
    total_samples: u64,
}

/// Summary of the processing-time window
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingSnapshot {
    pub total_samples: u64,
    pub window_samples: usize,
    pub ema_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl ProcessingStats {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            ema_ms: None,
            total_samples: 0,
        }
    }

    pub fn record(&mut self, duration_ms: f64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(duration_ms);
        self.total_samples += 1;
        self.ema_ms = Some(match self.ema_ms {
            None => duration_ms,
            Some(ema) => PROCESSING_EMA_ALPHA * duration_ms + (1.0 - PROCESSING_EMA_ALPHA) * ema,
        });
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Nearest-rank percentile over the window (0 when empty)
    pub fn percentile(&self, p: f64) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let rank = ((p.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize).max(1);
        sorted[rank - 1]
    }

    pub fn snapshot(&self) -> ProcessingSnapshot {
        ProcessingSnapshot {
            total_samples: self.total_samples,
            window_samples: self.window.len(),
            ema_ms: self.ema_ms.unwrap_or(0.0),
            p95_ms: self.percentile(0.95),
            p99_ms: self.percentile(0.99),
            max_ms: self.window.iter().copied().fold(0.0, f64::max),
        }
    }
}

/// Executor counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub expired: u64,
    pub rejected: u64,
    pub retries: u64,

    /// Handler invocations, counted the way the registry counts them
    pub attempts: u64,
    pub failed_attempts: u64,

    pub processing: ProcessingSnapshot,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    expired: AtomicU64,
    rejected: AtomicU64,
    retries: AtomicU64,
    attempts: AtomicU64,
    failed_attempts: AtomicU64,
}

/// Task executor for one agent
pub struct TaskExecutor {
    agent_id: String,
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    registry: Option<Arc<AgentRegistry>>,
    stats: Mutex<ProcessingStats>,
    counters: Counters,
    cancel: CancellationToken,
}

impl TaskExecutor {
    pub fn new(agent_id: impl Into<String>, config: ExecutorConfig) -> Self {
        let permits = config.max_concurrent_tasks.max(1);
        let window = config.stats_window;
        Self {
            agent_id: agent_id.into(),
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            breakers: DashMap::new(),
            registry: None,
            stats: Mutex::new(ProcessingStats::new(window)),
            counters: Counters::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Report load and completions for this agent into `registry`
    pub fn with_registry(mut self, registry: Arc<AgentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Tasks currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.config
            .max_concurrent_tasks
            .max(1)
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn breaker_for(&self, task_type: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(task_type.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("task:{}", task_type),
                    self.config.circuit_breaker.clone(),
                ))
            })
            .clone()
    }

    pub fn breaker_snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|entry| entry.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Run a task to its final outcome, retrying transient failures
    pub async fn execute(&self, mut task: TaskRequest, handler: Arc<dyn TaskHandler>) -> TaskResponse {
        let started = Instant::now();
        let timeout = self.config.task_timeout();
        let mut attempts = 0u32;

        let outcome = loop {
            if task.is_expired() {
                break TaskOutcome::Expired;
            }

            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    break TaskOutcome::Rejected {
                        reason: "executor is shutting down".to_string(),
                    }
                }
            };

            // The deadline may have passed while waiting for a slot
            if task.is_expired() {
                break TaskOutcome::Expired;
            }

            let breaker = self.breaker_for(&task.task_type);
            if let Err(e) = breaker.try_acquire() {
                break TaskOutcome::Rejected { reason: e.to_string() };
            }

            let load = self
                .registry
                .as_ref()
                .and_then(|registry| registry.acquire_load(&self.agent_id));

            attempts += 1;
            let attempt_started = Instant::now();
            let result = tokio::time::timeout(timeout, handler.handle(&task)).await;
            let attempt_ms = attempt_started.elapsed().as_secs_f64() * 1000.0;

            drop(load);
            drop(permit);

            let failure = match result {
                Ok(Ok(value)) => {
                    breaker.record_success();
                    self.stats.lock().record(attempt_ms);
                    metrics::histogram!(TASK_DURATION_MS, "task_type" => task.task_type.clone()).record(attempt_ms);
                    self.report_completion(attempt_ms, true);
                    break TaskOutcome::Completed { result: value };
                }
                Ok(Err(e)) => {
                    warn!(
                        "Task {} ({}) failed on attempt {}: {}",
                        task.task_id,
                        task.task_type,
                        task.retry_count + 1,
                        e
                    );
                    TaskOutcome::Failed { error: e.to_string() }
                }
                Err(_) => {
                    warn!(
                        "Task {} ({}) timed out after {}ms on attempt {}",
                        task.task_id,
                        task.task_type,
                        self.config.task_timeout_ms,
                        task.retry_count + 1
                    );
                    TaskOutcome::TimedOut {
                        timeout_ms: self.config.task_timeout_ms,
                    }
                }
            };

            breaker.record_failure();
            self.report_completion(attempt_ms, false);

            if !task.should_retry() {
                break failure;
            }

            let delay = self.config.retry.jittered_delay(task.retry_count);
            task.retry_count += 1;
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(TASK_RETRIES_TOTAL, "task_type" => task.task_type.clone()).increment(1);
            debug!(
                "Retrying task {} in {:?} (retry {}/{})",
                task.task_id, delay, task.retry_count, task.max_retries
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break failure,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.count_outcome(&outcome, &task);

        TaskResponse {
            task_id: task.task_id,
            agent_id: self.agent_id.clone(),
            correlation_id: task.correlation_id,
            outcome,
            attempts,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            completed_at: Utc::now(),
        }
    }

    /// Answer a task without running it
    pub fn reject(&self, task: TaskRequest, reason: impl Into<String>) -> TaskResponse {
        let outcome = TaskOutcome::Rejected { reason: reason.into() };
        self.count_outcome(&outcome, &task);
        TaskResponse {
            task_id: task.task_id,
            agent_id: self.agent_id.clone(),
            correlation_id: task.correlation_id,
            outcome,
            attempts: 0,
            duration_ms: 0.0,
            completed_at: Utc::now(),
        }
    }

    fn report_completion(&self, duration_ms: f64, success: bool) {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(registry) = &self.registry {
            registry.record_task_completion(&self.agent_id, duration_ms, success);
        }
    }

    fn count_outcome(&self, outcome: &TaskOutcome, task: &TaskRequest) {
        let counter = match outcome {
            TaskOutcome::Completed { .. } => &self.counters.completed,
            TaskOutcome::Failed { .. } => &self.counters.failed,
            TaskOutcome::TimedOut { .. } => &self.counters.timed_out,
            TaskOutcome::Expired => &self.counters.expired,
            TaskOutcome::Rejected { .. } => &self.counters.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            TASKS_TOTAL,
            "task_type" => task.task_type.clone(),
            "outcome" => outcome.as_str()
        )
        .increment(1);

        if !outcome.is_success() {
            info!(
                "Task {} ({}) finished as {} (retries: {})",
                task.task_id,
                task.task_type,
                outcome.as_str(),
                task.retry_count
            );
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            in_flight: self.in_flight(),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            failed_attempts: self.counters.failed_attempts.load(Ordering::Relaxed),
            processing: self.stats.lock().snapshot(),
        }
    }

    /// Stop retry back-offs and refuse new tasks
    pub fn begin_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait until every slot is free, then close the gate. Errors on timeout.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        self.begin_shutdown();
        let permits = u32::try_from(self.config.max_concurrent_tasks.max(1)).unwrap_or(u32::MAX);

        match tokio::time::timeout(timeout, self.semaphore.acquire_many(permits)).await {
            Ok(Ok(all)) => {
                all.forget();
                self.semaphore.close();
                Ok(())
            }
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                let in_flight = self.in_flight();
                self.semaphore.close();
                Err(ControlPlaneError::Timeout(format!(
                    "{} task(s) still running after {:?}",
                    in_flight, timeout
                )))
            }
        }
    }
}
