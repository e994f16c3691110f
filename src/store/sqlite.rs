use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;
use tracing::{debug, warn};

/// How long a connection waits on a locked database before failing.
/// Keeps concurrent writers (an approval racing its timeout) serialized
/// instead of surfacing SQLITE_BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn open(db_path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

use super::{
    AuditEntry, InsertOutcome, OfflineResult, PendingRecord, ResolveOutcome, Resolution, Store,
};
use crate::config::Decision;

/// SQLite-backed audit, pending and offline-result store.
pub struct SqliteStore {
    /// Path to the SQLite database file
    db_path: PathBuf,
}

impl SqliteStore {
    /// Create a store at the given path, initializing the schema.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create directory: {}", parent.display()))?;
            }
        }

        let store = Self { db_path };
        store.init_schema()?;

        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = open(&self.db_path)
            .with_context(|| format!("failed to open database: {}", self.db_path.display()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                request_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                signature TEXT NOT NULL,
                args_json TEXT NOT NULL,
                decision TEXT NOT NULL,
                resolution TEXT NOT NULL,
                result_json TEXT,
                error_kind TEXT
            )",
            [],
        )
        .context("failed to create audit_log table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_request ON audit_log(request_id)",
            [],
        )
        .context("failed to create audit_log index")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pending_requests (
                request_id TEXT PRIMARY KEY,
                tool_name TEXT NOT NULL,
                signature TEXT NOT NULL,
                args_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                status TEXT NOT NULL
            )",
            [],
        )
        .context("failed to create pending_requests table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_requests(status)",
            [],
        )
        .context("failed to create pending_requests index")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS offline_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                request_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                result_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .context("failed to create offline_results table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_offline_agent ON offline_results(agent_id)",
            [],
        )
        .context("failed to create offline_results index")?;

        debug!(path = %self.db_path.display(), "initialized SQLite store");

        Ok(())
    }
}

/// Fixed-width UTC text so stored timestamps compare lexicographically.
fn ts_to_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_text(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("invalid stored timestamp '{}'", text))?
        .with_timezone(&Utc))
}

const PENDING_COLUMNS: &str =
    "request_id, tool_name, signature, args_json, created_at, expires_at";

fn pending_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingRecord> {
    let args_json: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let expires_at: String = row.get(5)?;
    // Rows are only ever written by this module; fall back rather than
    // surface a rusqlite-domain error for a malformed stored value.
    Ok(PendingRecord {
        request_id: row.get(0)?,
        tool_name: row.get(1)?,
        signature: row.get(2)?,
        args: serde_json::from_str(&args_json).unwrap_or(serde_json::Value::Null),
        created_at: ts_from_text(&created_at).unwrap_or_else(|_| Utc::now()),
        expires_at: ts_from_text(&expires_at).unwrap_or_else(|_| Utc::now()),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = open(&db_path)?;

            conn.execute(
                "INSERT INTO audit_log
                    (timestamp, request_id, tool_name, signature, args_json,
                     decision, resolution, result_json, error_kind)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    ts_to_text(entry.timestamp),
                    entry.request_id,
                    entry.tool_name,
                    entry.signature,
                    serde_json::to_string(&entry.args)?,
                    entry.decision.to_string(),
                    entry.resolution.to_string(),
                    entry
                        .result
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    entry.error_kind,
                ],
            )?;

            debug!(request_id = %entry.request_id, resolution = %entry.resolution, "appended audit entry");

            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("spawn_blocking failed")??;

        Ok(())
    }

    async fn audit_for(&self, request_id: &str) -> Result<Vec<AuditEntry>> {
        let request_id = request_id.to_string();
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = open(&db_path)?;

            let mut stmt = conn.prepare(
                "SELECT timestamp, request_id, tool_name, signature, args_json,
                        decision, resolution, result_json, error_kind
                 FROM audit_log WHERE request_id = ?1 ORDER BY id",
            )?;

            let rows = stmt
                .query_map([&request_id], |row| {
                    let timestamp: String = row.get(0)?;
                    let args_json: String = row.get(4)?;
                    let decision: String = row.get(5)?;
                    let resolution: String = row.get(6)?;
                    let result_json: Option<String> = row.get(7)?;
                    Ok((
                        timestamp,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        args_json,
                        decision,
                        resolution,
                        result_json,
                        row.get::<_, Option<String>>(8)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut entries = Vec::with_capacity(rows.len());
            for (
                timestamp,
                request_id,
                tool_name,
                signature,
                args_json,
                decision,
                resolution,
                result_json,
                error_kind,
            ) in rows
            {
                entries.push(AuditEntry {
                    timestamp: ts_from_text(&timestamp)?,
                    request_id,
                    tool_name,
                    signature,
                    args: serde_json::from_str(&args_json)?,
                    decision: parse_decision(&decision)?,
                    resolution: resolution.parse()?,
                    result: result_json.map(|s| serde_json::from_str(&s)).transpose()?,
                    error_kind,
                });
            }

            Ok(entries)
        })
        .await
        .context("spawn_blocking failed")?
    }

    async fn insert_pending(
        &self,
        record: PendingRecord,
        max_pending: usize,
    ) -> Result<InsertOutcome> {
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || {
            let mut conn = open(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM pending_requests WHERE request_id = ?1)",
                [&record.request_id],
                |row| row.get(0),
            )?;
            if exists {
                return Ok(InsertOutcome::Duplicate);
            }

            let waiting: usize = tx.query_row(
                "SELECT COUNT(*) FROM pending_requests WHERE status = 'waiting'",
                [],
                |row| row.get(0),
            )?;
            if waiting >= max_pending {
                return Ok(InsertOutcome::QuotaExceeded);
            }

            tx.execute(
                "INSERT INTO pending_requests
                    (request_id, tool_name, signature, args_json, created_at, expires_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'waiting')",
                params![
                    record.request_id,
                    record.tool_name,
                    record.signature,
                    serde_json::to_string(&record.args)?,
                    ts_to_text(record.created_at),
                    ts_to_text(record.expires_at),
                ],
            )?;
            tx.commit()?;

            debug!(request_id = %record.request_id, "inserted pending approval");

            Ok::<_, anyhow::Error>(InsertOutcome::Inserted)
        })
        .await
        .context("spawn_blocking failed")?
    }

    async fn resolve_pending(
        &self,
        request_id: &str,
        resolution: Resolution,
    ) -> Result<ResolveOutcome> {
        let request_id = request_id.to_string();
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || {
            let mut conn = open(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let row = tx
                .query_row(
                    &format!(
                        "SELECT {}, status FROM pending_requests WHERE request_id = ?1",
                        PENDING_COLUMNS
                    ),
                    [&request_id],
                    |row| {
                        let record = pending_from_row(row)?;
                        let status: String = row.get(6)?;
                        Ok((record, status))
                    },
                )
                .optional()?;

            let Some((record, status)) = row else {
                return Ok(ResolveOutcome::NotFound);
            };

            if status != "waiting" {
                // First writer already won; this call is a no-op.
                return Ok(ResolveOutcome::AlreadyResolved(status.parse()?));
            }

            tx.execute(
                "UPDATE pending_requests SET status = ?2 WHERE request_id = ?1",
                params![request_id, resolution.to_string()],
            )?;
            tx.commit()?;

            debug!(request_id = %request_id, resolution = %resolution, "resolved pending approval");

            Ok::<_, anyhow::Error>(ResolveOutcome::Resolved(record))
        })
        .await
        .context("spawn_blocking failed")?
    }

    async fn sweep_stale(&self, now: DateTime<Utc>) -> Result<Vec<PendingRecord>> {
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || {
            let mut conn = open(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let cutoff = ts_to_text(now);

            let expired = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM pending_requests
                     WHERE status = 'waiting' AND expires_at <= ?1",
                    PENDING_COLUMNS
                ))?;
                stmt.query_map([&cutoff], |row| pending_from_row(row))?
                    .collect::<Result<Vec<_>, _>>()?
            };

            if !expired.is_empty() {
                tx.execute(
                    "UPDATE pending_requests SET status = 'timed_out'
                     WHERE status = 'waiting' AND expires_at <= ?1",
                    [&cutoff],
                )?;
                warn!(count = expired.len(), "swept stale pending approvals");
            }
            tx.commit()?;

            Ok::<_, anyhow::Error>(expired)
        })
        .await
        .context("spawn_blocking failed")?
    }

    async fn load_waiting(&self) -> Result<Vec<PendingRecord>> {
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM pending_requests WHERE status = 'waiting' ORDER BY created_at",
                PENDING_COLUMNS
            ))?;

            let records = stmt
                .query_map([], |row| pending_from_row(row))?
                .collect::<Result<Vec<_>, _>>()?;

            Ok::<_, anyhow::Error>(records)
        })
        .await
        .context("spawn_blocking failed")?
    }

    async fn count_waiting(&self) -> Result<usize> {
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            let count: usize = conn.query_row(
                "SELECT COUNT(*) FROM pending_requests WHERE status = 'waiting'",
                [],
                |row| row.get(0),
            )?;
            Ok::<_, anyhow::Error>(count)
        })
        .await
        .context("spawn_blocking failed")?
    }

    async fn has_request(&self, request_id: &str) -> Result<bool> {
        let request_id = request_id.to_string();
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM pending_requests WHERE request_id = ?1)",
                [&request_id],
                |row| row.get(0),
            )?;
            Ok::<_, anyhow::Error>(exists)
        })
        .await
        .context("spawn_blocking failed")?
    }

    async fn enqueue_offline(&self, agent_id: &str, result: OfflineResult) -> Result<()> {
        let agent_id = agent_id.to_string();
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = open(&db_path)?;

            conn.execute(
                "INSERT INTO offline_results
                    (agent_id, request_id, tool_name, result_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    agent_id,
                    result.request_id,
                    result.tool_name,
                    serde_json::to_string(&result.payload)?,
                    ts_to_text(result.created_at),
                ],
            )?;

            debug!(request_id = %result.request_id, "queued offline result");

            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("spawn_blocking failed")??;

        Ok(())
    }

    async fn drain_offline(&self, agent_id: &str) -> Result<Vec<OfflineResult>> {
        let agent_id = agent_id.to_string();
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || {
            let mut conn = open(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let rows = {
                let mut stmt = tx.prepare(
                    "SELECT request_id, tool_name, result_json, created_at
                     FROM offline_results WHERE agent_id = ?1 ORDER BY id",
                )?;
                stmt.query_map([&agent_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?
            };

            tx.execute("DELETE FROM offline_results WHERE agent_id = ?1", [&agent_id])?;
            tx.commit()?;

            let mut results = Vec::with_capacity(rows.len());
            for (request_id, tool_name, result_json, created_at) in rows {
                results.push(OfflineResult {
                    request_id,
                    tool_name,
                    payload: serde_json::from_str(&result_json)?,
                    created_at: ts_from_text(&created_at)?,
                });
            }

            Ok::<_, anyhow::Error>(results)
        })
        .await
        .context("spawn_blocking failed")?
    }

    async fn health_check(&self) -> bool {
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = open(&db_path).ok()?;
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).ok()
        })
        .await
        .ok()
        .flatten()
        .is_some()
    }
}

fn parse_decision(s: &str) -> Result<Decision> {
    s.parse()
}
