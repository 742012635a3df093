// packages/control-plane/src/storage/report_store.rs
//! Durable agent reports and allocation audit trail (SQLite)
//!
//! Nothing on the hot path reads from here; the registry and allocator keep
//! working in memory when the store is absent or down.

use crate::allocation::{AuditEvent, AuditKind, ResourceQuota};
use crate::registry::{AgentRecord, AgentStatus};
use crate::runtime::connection::Dependency;
use crate::utils::errors::{ControlPlaneError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Path that opens a private in-memory database
pub const IN_MEMORY_PATH: &str = ":memory:";

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Persist reports and audit events (default: false)
    pub enabled: bool,

    /// SQLite database file (`:memory:` for a private in-memory database)
    pub path: PathBuf,

    /// Audit events written per transaction (default: 100)
    pub batch_size: usize,

    /// Audit writer flush period in milliseconds (default: 1000)
    pub flush_interval_ms: u64,

    /// Agent reports older than this are pruned by the monitoring loop (default: 7)
    pub report_retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("fleet-control.db"),
            batch_size: 100,
            flush_interval_ms: 1_000,
            report_retention_days: 7,
        }
    }
}

/// Point-in-time copy of an agent's health, appended by the monitoring loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_id: String,
    pub reported_at: DateTime<Utc>,
    pub status: AgentStatus,
    pub health_score: f64,
    pub current_load: u32,
    pub max_load: u32,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
}

impl AgentReport {
    pub fn from_record(record: &AgentRecord, reported_at: DateTime<Utc>) -> Self {
        Self {
            agent_id: record.agent_id.clone(),
            reported_at,
            status: record.status,
            health_score: record.health_score,
            current_load: record.current_load,
            max_load: record.max_load,
            tasks_processed: record.tasks_processed,
            tasks_failed: record.tasks_failed,
        }
    }
}

/// Row counts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_reports: u64,
    pub total_audit_events: u64,
}

/// SQLite-backed report store
pub struct ReportStore {
    path: PathBuf,
    db: Mutex<Connection>,
}

impl ReportStore {
    /// Open (or create) the database at `config.path`
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        let conn = if config.path.as_os_str() == IN_MEMORY_PATH {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    ControlPlaneError::StorageFailed(format!("Failed to create directory: {}", e))
                })?;
            }
            Connection::open(&config.path)?
        };

        let store = Self {
            path: config.path.clone(),
            db: Mutex::new(conn),
        };
        store.init_schema().await?;

        info!("Report store initialized at {:?}", store.path);
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::open(&StorageConfig {
            enabled: true,
            path: PathBuf::from(IN_MEMORY_PATH),
            ..Default::default()
        })
        .await
    }

    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS agent_reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                reported_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                health_score REAL NOT NULL,
                current_load INTEGER NOT NULL,
                max_load INTEGER NOT NULL,
                tasks_processed INTEGER NOT NULL,
                tasks_failed INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reports_agent_time ON agent_reports(agent_id, reported_at);

            CREATE TABLE IF NOT EXISTS allocation_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                record_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                task_id TEXT,
                tenant_id TEXT,
                quota TEXT NOT NULL,
                at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_record ON allocation_audit(record_id);
            "#,
        )
        .map_err(|e| ControlPlaneError::StorageFailed(format!("Schema creation failed: {}", e)))?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Append reports in one transaction
    pub async fn append_reports(&self, reports: &[AgentReport]) -> Result<usize> {
        if reports.is_empty() {
            return Ok(0);
        }

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO agent_reports
                    (agent_id, reported_at, status, health_score, current_load, max_load, tasks_processed, tasks_failed)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )?;
            for report in reports {
                stmt.execute(params![
                    report.agent_id,
                    report.reported_at.timestamp_millis(),
                    report.status.as_str(),
                    report.health_score,
                    report.current_load,
                    report.max_load,
                    report.tasks_processed as i64,
                    report.tasks_failed as i64,
                ])?;
            }
        }
        tx.commit()?;

        debug!("Stored {} agent report(s)", reports.len());
        Ok(reports.len())
    }

    /// Most recent reports for an agent, newest first
    pub async fn list_reports(&self, agent_id: &str, limit: usize) -> Result<Vec<AgentReport>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            r#"
            SELECT agent_id, reported_at, status, health_score, current_load, max_load, tasks_processed, tasks_failed
            FROM agent_reports WHERE agent_id = ? ORDER BY reported_at DESC, id DESC LIMIT ?
            "#,
        )?;

        let rows = stmt
            .query_map(params![agent_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(agent_id, at, status, health_score, current_load, max_load, processed, failed)| -> Result<AgentReport> {
                Ok(AgentReport {
                    agent_id,
                    reported_at: from_millis(at)?,
                    status: serde_json::from_value(serde_json::Value::String(status))?,
                    health_score,
                    current_load,
                    max_load,
                    tasks_processed: processed as u64,
                    tasks_failed: failed as u64,
                })
            })
            .collect()
    }

    /// Delete reports older than `cutoff`
    pub async fn prune_reports(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let db = self.db.lock().await;
        let removed = db.execute(
            "DELETE FROM agent_reports WHERE reported_at < ?",
            params![cutoff.timestamp_millis()],
        )?;
        if removed > 0 {
            debug!("Pruned {} agent report(s)", removed);
        }
        Ok(removed)
    }

    /// Append audit events in one transaction
    pub async fn append_audit(&self, events: &[AuditEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO allocation_audit (kind, record_id, agent_id, task_id, tenant_id, quota, at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )?;
            for event in events {
                stmt.execute(params![
                    event.kind.as_str(),
                    event.record_id,
                    event.agent_id,
                    event.task_id,
                    event.tenant_id,
                    serde_json::to_string(&event.quota)?,
                    event.at.timestamp_millis(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(events.len())
    }

    /// Audit trail in insertion order, optionally for one allocation/reservation
    pub async fn list_audit(&self, record_id: Option<&str>, limit: usize) -> Result<Vec<AuditEvent>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            r#"
            SELECT kind, record_id, agent_id, task_id, tenant_id, quota, at
            FROM allocation_audit
            WHERE (?1 IS NULL OR record_id = ?1)
            ORDER BY id LIMIT ?2
            "#,
        )?;

        let rows = stmt
            .query_map(params![record_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(kind, record_id, agent_id, task_id, tenant_id, quota, at)| -> Result<AuditEvent> {
                let kind: AuditKind = serde_json::from_value(serde_json::Value::String(kind))?;
                let quota: ResourceQuota = serde_json::from_str(&quota)?;
                Ok(AuditEvent {
                    kind,
                    record_id,
                    agent_id,
                    task_id,
                    tenant_id,
                    quota,
                    at: from_millis(at)?,
                })
            })
            .collect()
    }

    pub async fn stats(&self) -> Result<StorageStats> {
        let db = self.db.lock().await;
        let total_reports: i64 = db.query_row("SELECT COUNT(*) FROM agent_reports", [], |row| row.get(0))?;
        let total_audit_events: i64 =
            db.query_row("SELECT COUNT(*) FROM allocation_audit", [], |row| row.get(0))?;

        Ok(StorageStats {
            total_reports: total_reports as u64,
            total_audit_events: total_audit_events as u64,
        })
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ControlPlaneError::StorageFailed(format!("Invalid timestamp {}", millis)))
}

#[async_trait]
impl Dependency for ReportStore {
    fn name(&self) -> &str {
        "report_store"
    }

    fn is_required(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<()> {
        self.ping().await
    }

    async fn health_check(&self) -> Result<()> {
        self.ping().await
    }

    async fn close(&self) -> Result<()> {
        debug!("Report store {:?} released", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentRegistration;
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    fn report(agent_id: &str, at: DateTime<Utc>) -> AgentReport {
        let record = AgentRecord::from_registration(AgentRegistration::new(agent_id, agent_id, "worker"), 90);
        AgentReport::from_record(&record, at)
    }

    fn audit(kind: AuditKind, record_id: &str) -> AuditEvent {
        AuditEvent {
            kind,
            record_id: record_id.to_string(),
            agent_id: "a1".to_string(),
            task_id: Some("t1".to_string()),
            tenant_id: None,
            quota: ResourceQuota::cpu_mem(1.0, 512.0).with_custom("licenses", 1.0),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_store_on_disk() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            enabled: true,
            path: dir.path().join("nested").join("fleet.db"),
            ..Default::default()
        };

        let store = ReportStore::open(&config).await.unwrap();
        store.ping().await.unwrap();
        assert!(config.path.exists());
    }

    #[tokio::test]
    async fn test_reports_newest_first() {
        let store = ReportStore::open_in_memory().await.unwrap();
        let now = Utc::now();
        store
            .append_reports(&[
                report("a1", now - ChronoDuration::seconds(30)),
                report("a1", now),
                report("a2", now),
            ])
            .await
            .unwrap();

        let reports = store.list_reports("a1", 10).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].reported_at.timestamp_millis(), now.timestamp_millis());
        assert_eq!(reports[0].status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn test_prune_reports() {
        let store = ReportStore::open_in_memory().await.unwrap();
        let now = Utc::now();
        store
            .append_reports(&[report("a1", now - ChronoDuration::days(10)), report("a1", now)])
            .await
            .unwrap();

        let removed = store.prune_reports(now - ChronoDuration::days(7)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.stats().await.unwrap().total_reports, 1);
    }

    #[tokio::test]
    async fn test_audit_trail() {
        let store = ReportStore::open_in_memory().await.unwrap();
        store
            .append_audit(&[
                audit(AuditKind::Allocated, "alloc_1"),
                audit(AuditKind::Reserved, "resv_1"),
                audit(AuditKind::Released, "alloc_1"),
            ])
            .await
            .unwrap();

        let all = store.list_audit(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);

        let one = store.list_audit(Some("alloc_1"), 10).await.unwrap();
        assert_eq!(one.len(), 2);
        assert_eq!(one[0].kind, AuditKind::Allocated);
        assert_eq!(one[1].kind, AuditKind::Released);
        assert_eq!(one[0].quota.custom.get("licenses"), Some(&1.0));

        assert_eq!(store.stats().await.unwrap().total_audit_events, 3);
    }

    #[tokio::test]
    async fn test_store_is_optional_dependency() {
        let store = ReportStore::open_in_memory().await.unwrap();
        assert_eq!(Dependency::name(&store), "report_store");
        assert!(!store.is_required());
        assert!(store.health_check().await.is_ok());
    }
}
