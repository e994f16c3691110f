mod sqlite;

pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Decision;

/// Terminal state of a request lifecycle.
///
/// `Approved`, `DeniedByUser` and `TimedOut` are the outcomes of the
/// approval rendezvous; `Executed`, `ExecutionFailed` and
/// `DeniedByPolicy` are what the audit log records once the request is
/// fully settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Approved,
    DeniedByUser,
    TimedOut,
    Executed,
    ExecutionFailed,
    DeniedByPolicy,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::DeniedByUser => write!(f, "denied_by_user"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Executed => write!(f, "executed"),
            Self::ExecutionFailed => write!(f, "execution_failed"),
            Self::DeniedByPolicy => write!(f, "denied_by_policy"),
        }
    }
}

impl std::str::FromStr for Resolution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "denied_by_user" => Ok(Self::DeniedByUser),
            "timed_out" => Ok(Self::TimedOut),
            "executed" => Ok(Self::Executed),
            "execution_failed" => Ok(Self::ExecutionFailed),
            "denied_by_policy" => Ok(Self::DeniedByPolicy),
            _ => anyhow::bail!("invalid resolution '{}'", s),
        }
    }
}

/// One append-only audit row. Never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub tool_name: String,
    pub signature: String,
    pub args: Value,
    pub decision: Decision,
    pub resolution: Resolution,
    pub result: Option<Value>,
    pub error_kind: Option<String>,
}

impl AuditEntry {
    pub fn new(
        request_id: impl Into<String>,
        tool_name: impl Into<String>,
        signature: impl Into<String>,
        args: Value,
        decision: Decision,
        resolution: Resolution,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: request_id.into(),
            tool_name: tool_name.into(),
            signature: signature.into(),
            args,
            decision,
            resolution,
            result: None,
            error_kind: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error_kind(mut self, kind: impl Into<String>) -> Self {
        self.error_kind = Some(kind.into());
        self
    }
}

/// A request awaiting human decision, as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecord {
    pub request_id: String,
    pub tool_name: String,
    pub signature: String,
    pub args: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingRecord {
    pub fn new(
        request_id: impl Into<String>,
        tool_name: impl Into<String>,
        signature: impl Into<String>,
        args: Value,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id: request_id.into(),
            tool_name: tool_name.into(),
            signature: signature.into(),
            args,
            created_at: now,
            expires_at: now + ttl,
        }
    }
}

/// A resolution whose reply could not be delivered to its session,
/// buffered until the agent drains it.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineResult {
    pub request_id: String,
    pub tool_name: String,
    /// Reply payload: `{"result": ...}` or `{"error": {code, message}}`
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl OfflineResult {
    pub fn new(request_id: impl Into<String>, tool_name: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: request_id.into(),
            tool_name: tool_name.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of inserting a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The gateway-wide concurrent pending ceiling was hit
    QuotaExceeded,
    /// The request id was already used (waiting or settled)
    Duplicate,
}

/// Outcome of attempting a terminal transition on a pending record.
#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    /// This caller won; the record is returned for terminal processing
    Resolved(PendingRecord),
    /// Someone resolved it first; the prior resolution is returned and
    /// this call had no effect
    AlreadyResolved(Resolution),
    NotFound,
}

/// Durable audit, pending-approval and offline-result storage.
///
/// The writer is serialized: every mutation runs as one transaction, and
/// `resolve_pending` is the single synchronization point between the
/// approval path and the timeout path.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append one audit row. Must complete before the agent learns the
    /// outcome of any terminal state.
    async fn append_audit(&self, entry: AuditEntry) -> Result<()>;

    /// All audit rows for a request id, oldest first.
    async fn audit_for(&self, request_id: &str) -> Result<Vec<AuditEntry>>;

    /// Insert a pending approval, enforcing the concurrent-pending quota
    /// and request-id uniqueness atomically.
    async fn insert_pending(
        &self,
        record: PendingRecord,
        max_pending: usize,
    ) -> Result<InsertOutcome>;

    /// First terminal transition wins; later calls are no-ops that
    /// report the prior resolution.
    async fn resolve_pending(
        &self,
        request_id: &str,
        resolution: Resolution,
    ) -> Result<ResolveOutcome>;

    /// Mark every waiting record with `expires_at <= now` as timed out,
    /// returning them for notification.
    async fn sweep_stale(&self, now: DateTime<Utc>) -> Result<Vec<PendingRecord>>;

    /// All records still waiting for a decision (startup recovery).
    async fn load_waiting(&self) -> Result<Vec<PendingRecord>>;

    async fn count_waiting(&self) -> Result<usize>;

    /// Whether a request id has ever been used for a pending approval.
    async fn has_request(&self, request_id: &str) -> Result<bool>;

    async fn enqueue_offline(&self, agent_id: &str, result: OfflineResult) -> Result<()>;

    /// Atomically remove and return every buffered result for an agent
    /// identity. Each result is returned exactly once across all callers.
    async fn drain_offline(&self, agent_id: &str) -> Result<Vec<OfflineResult>>;

    async fn health_check(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_round_trips_through_text() {
        for res in [
            Resolution::Approved,
            Resolution::DeniedByUser,
            Resolution::TimedOut,
            Resolution::Executed,
            Resolution::ExecutionFailed,
            Resolution::DeniedByPolicy,
        ] {
            let text = res.to_string();
            assert_eq!(text.parse::<Resolution>().expect("parse"), res);
        }
    }

    #[test]
    fn pending_record_expiry_window() {
        let record = PendingRecord::new(
            "r1",
            "tool",
            "tool(x)",
            serde_json::json!({}),
            Duration::seconds(900),
        );
        assert_eq!(record.expires_at - record.created_at, Duration::seconds(900));
    }
}
