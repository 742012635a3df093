// packages/control-plane/src/storage/audit.rs
//! Background writer for allocation audit events
//!
//! The allocator pushes [`AuditEvent`]s into an unbounded channel without
//! waiting on disk. This writer batches them and commits each batch in one
//! transaction:
//!
//! ```text
//! allocator ──(mpsc)──► batch ──(batch_size | flush tick | stop)──► allocation_audit
//! ```

use crate::allocation::AuditEvent;
use crate::storage::report_store::{ReportStore, StorageConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Writer counters
#[derive(Debug, Clone, Default)]
pub struct AuditWriterStats {
    pub events_written: u64,
    pub events_dropped: u64,
    pub batches_flushed: u64,
    pub total_flush_time_ms: u64,
}

/// Running audit writer; stop it with [`AuditWriter::shutdown`]
pub struct AuditWriter {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    stats: Arc<Mutex<AuditWriterStats>>,
}

impl AuditWriter {
    /// Spawn the writer task. It stops when `cancel` fires or every sender is dropped,
    /// flushing whatever is still queued first.
    pub fn start(
        store: Arc<ReportStore>,
        config: &StorageConfig,
        mut events: UnboundedReceiver<AuditEvent>,
        cancel: CancellationToken,
    ) -> Self {
        info!("Starting audit writer");

        let stats = Arc::new(Mutex::new(AuditWriterStats::default()));
        let batch_size = config.batch_size.max(1);
        let flush_interval = Duration::from_millis(config.flush_interval_ms.max(1));

        let handle = tokio::spawn({
            let stats = Arc::clone(&stats);
            let cancel = cancel.clone();
            async move {
                let mut interval = tokio::time::interval(flush_interval);
                let mut batch = Vec::with_capacity(batch_size);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,

                        event = events.recv() => match event {
                            Some(event) => {
                                batch.push(event);
                                if batch.len() >= batch_size {
                                    Self::flush_batch(&mut batch, &store, &stats).await;
                                }
                            }
                            None => break,
                        },

                        _ = interval.tick() => {
                            Self::flush_batch(&mut batch, &store, &stats).await;
                        }
                    }
                }

                while let Ok(event) = events.try_recv() {
                    batch.push(event);
                }
                Self::flush_batch(&mut batch, &store, &stats).await;
                debug!("Audit writer stopped");
            }
        });

        Self {
            cancel,
            handle: Some(handle),
            stats,
        }
    }

    async fn flush_batch(batch: &mut Vec<AuditEvent>, store: &ReportStore, stats: &Mutex<AuditWriterStats>) {
        if batch.is_empty() {
            return;
        }

        let start = Instant::now();
        let count = batch.len() as u64;
        let result = store.append_audit(batch).await;
        batch.clear();

        let mut s = stats.lock();
        match result {
            Ok(_) => {
                s.events_written += count;
                s.batches_flushed += 1;
                s.total_flush_time_ms += start.elapsed().as_millis() as u64;
                debug!("Flushed {} audit event(s) in {:?}", count, start.elapsed());
            }
            Err(e) => {
                s.events_dropped += count;
                error!("Failed to flush {} audit event(s): {}", count, e);
            }
        }
    }

    pub fn stats(&self) -> AuditWriterStats {
        self.stats.lock().clone()
    }

    /// Stop the writer and wait for the final flush
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("Audit writer task failed: {}", e);
            }
        }
    }
}

impl Drop for AuditWriter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
