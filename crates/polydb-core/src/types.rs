// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire and store types shared by the executors, the execution store, and
//! the HTTP surface.
//!
//! Responses keyed by cloud name keep the dynamic-object wire shape (the
//! cloud name is the JSON key); internally they are typed maps flattened at
//! serialisation time.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Keys materialised per cloud during SCAN preview are capped at this.
pub const PREVIEW_CAP: usize = 10_000;
/// Keys deleted per UNLINK batch.
pub const DELETE_BATCH: usize = 1_000;
/// Accepted range for the SCAN COUNT hint; out-of-range values are clamped.
pub const SCAN_COUNT_RANGE: std::ops::RangeInclusive<u64> = 1..=200_000;
/// Pause between non-terminal SCAN iterations.
pub const SCAN_SLEEP_MS: u64 = 100;

/// Current epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Lifecycle of an execution record.
///
/// Transitions are monotone: `running` moves to exactly one terminal state,
/// and `cancelled` is sticky: a later complete/fail never overwrites it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Execution is in flight.
    Running,
    /// All targets finished and every statement succeeded.
    Completed,
    /// At least one target or statement failed.
    Failed,
    /// An operator cancelled the execution.
    Cancelled,
}

impl ExecutionStatus {
    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// What kind of work an execution record tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    /// SQL fan-out batch.
    Sql,
    /// Cluster-wide SCAN (+ optional UNLINK).
    Scan,
}

/// Statement-level progress for a SQL execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryProgress {
    /// 1-based index of the statement currently executing.
    pub current_statement: u32,
    /// Total statements in the batch.
    pub total_statements: u32,
    /// Text of the statement currently executing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_statement_text: Option<String>,
}

/// Per-cloud state of a SCAN run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    /// Enumerating master nodes and iterating cursors.
    Scanning,
    /// Batch-unlinking collected keys.
    Deleting,
    /// Finished without error.
    Completed,
    /// A node or batch failed; see `error`.
    Error,
    /// Halted by operator cancellation.
    Cancelled,
}

/// Progress of one cloud inside a SCAN execution.
///
/// Invariants: `nodes_scanned <= nodes_total`, `keys_deleted <= keys_found`,
/// and `keys.len() <= PREVIEW_CAP` while `keys_found` keeps counting beyond
/// the cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    /// Cloud this progress belongs to.
    pub cloud_name: String,
    /// Master nodes discovered for the cloud.
    pub nodes_total: u32,
    /// Master nodes whose cursor reached zero.
    pub nodes_scanned: u32,
    /// Keys matched so far (uncapped).
    pub keys_found: u64,
    /// Keys removed so far (delete phase only).
    pub keys_deleted: u64,
    /// Preview of matched keys, capped at [`PREVIEW_CAP`].
    pub keys: Vec<String>,
    /// Per-cloud status.
    pub status: ScanStatus,
    /// Error detail when `status == Error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanProgress {
    /// Fresh progress for a cloud before topology is known.
    pub fn new(cloud_name: impl Into<String>) -> Self {
        Self {
            cloud_name: cloud_name.into(),
            nodes_total: 0,
            nodes_scanned: 0,
            keys_found: 0,
            keys_deleted: 0,
            keys: Vec::new(),
            status: ScanStatus::Scanning,
            error: None,
        }
    }
}

/// Progress payload of an execution record, SQL or SCAN shaped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Progress {
    /// SQL statement counter.
    Sql(QueryProgress),
    /// Per-cloud SCAN progress map.
    Scan(HashMap<String, ScanProgress>),
}

impl Progress {
    /// Zeroed progress for the given kind.
    pub fn zero(kind: ExecutionKind) -> Self {
        match kind {
            ExecutionKind::Sql => Progress::Sql(QueryProgress::default()),
            ExecutionKind::Scan => Progress::Scan(HashMap::new()),
        }
    }
}

/// The durable snapshot of an async submission, polled by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    /// Opaque UUID, unique per submission.
    pub id: String,
    /// Submitter; `None` only for internal use.
    pub user_id: Option<String>,
    /// SQL or SCAN.
    pub kind: ExecutionKind,
    /// Lifecycle state.
    pub status: ExecutionStatus,
    /// Progress payload.
    pub progress: Progress,
    /// Result payload, set on terminal states or partial flushes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error message when `status == Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Epoch millis at submission.
    pub start_time: i64,
    /// Epoch millis at the terminal transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

impl ExecutionRecord {
    /// A fresh running record.
    pub fn new(id: impl Into<String>, user_id: Option<String>, kind: ExecutionKind) -> Self {
        Self {
            id: id.into(),
            user_id,
            kind,
            status: ExecutionStatus::Running,
            progress: Progress::zero(kind),
            result: None,
            error: None,
            start_time: now_millis(),
            end_time: None,
        }
    }
}

// ============================================================================
// SQL wire types
// ============================================================================

/// An SQL submission, already session-authenticated by the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    /// The batch text, possibly multiple `;`-separated statements.
    pub query: String,
    /// Logical database name.
    pub database: String,
    /// `both` (primary + all secondaries) or a single cloud name.
    pub mode: String,
    /// Schema applied via `search_path` before execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pg_schema: Option<String>,
    /// Request-level timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Password for dangerous-verb re-authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Keep executing after a statement failure.
    #[serde(default)]
    pub continue_on_error: bool,
}

/// Column metadata of a result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    /// Column name.
    pub name: String,
    /// Engine type name (e.g. `INT8`, `TEXT`, `TIMESTAMPTZ`).
    pub data_type: String,
}

/// Outcome of one statement on one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementResult {
    /// The statement text as dispatched.
    pub statement: String,
    /// Whether the statement succeeded.
    pub success: bool,
    /// Leading verb, e.g. `SELECT`, `ROLLBACK`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Rows returned or affected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    /// Result rows as JSON objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<serde_json::Value>>,
    /// Column metadata for returned rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldInfo>>,
    /// Error text on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of this statement.
    pub duration_ms: u64,
}

impl StatementResult {
    /// A failed result carrying only the error.
    pub fn failure(statement: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            statement: statement.into(),
            success: false,
            command: None,
            row_count: None,
            rows: None,
            fields: None,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// Outcome of one (cloud, database) target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResult {
    /// True iff every statement on this target succeeded.
    pub success: bool,
    /// Target-scope error (pool acquisition, invalid schema, connect).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-statement outcomes in dispatch order.
    pub results: Vec<StatementResult>,
    /// Wall-clock duration of the whole target.
    pub duration_ms: u64,
}

/// Aggregated response of a SQL fan-out, keyed by cloud name on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Execution id.
    pub id: String,
    /// True iff every target succeeded.
    pub success: bool,
    /// Per-cloud results (flattened to dynamic keys on the wire).
    #[serde(flatten)]
    pub clouds: HashMap<String, TargetResult>,
}

// ============================================================================
// KV wire types
// ============================================================================

/// A structured or RAW KV command submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisCommandRequest {
    /// Command name, or `RAW` for free-form passthrough.
    pub command: String,
    /// Command arguments (for RAW: one element, the full command line).
    #[serde(default)]
    pub args: Vec<String>,
    /// `all` or a single KV cloud name.
    #[serde(default = "default_cloud_all")]
    pub cloud: String,
}

fn default_cloud_all() -> String {
    "all".to_string()
}

/// Per-cloud outcome of a KV command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisCloudResult {
    /// Whether the command succeeded on this cloud.
    pub success: bool,
    /// Decoded reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error text on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration on this cloud.
    pub duration_ms: u64,
}

/// Aggregated response of a KV command fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisCommandResponse {
    /// Request id.
    pub id: String,
    /// True iff the command succeeded on every cloud.
    pub success: bool,
    /// The admitted command name.
    pub command: String,
    /// Per-cloud results (flattened to dynamic keys on the wire).
    #[serde(flatten)]
    pub clouds: HashMap<String, RedisCloudResult>,
}

/// What a SCAN run does with matched keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanAction {
    /// Collect matches for display only.
    Preview,
    /// Collect, then batch-UNLINK.
    Delete,
}

/// A cluster-wide SCAN submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    /// Key pattern; wildcard-only patterns are refused at admission.
    pub pattern: String,
    /// `all` or a single KV cloud name.
    #[serde(default = "default_cloud_all")]
    pub cloud: String,
    /// Preview or delete.
    pub action: ScanAction,
    /// SCAN COUNT hint, clamped to [`SCAN_COUNT_RANGE`].
    #[serde(default = "default_scan_count")]
    pub scan_count: u64,
}

fn default_scan_count() -> u64 {
    1000
}

impl ScanRequest {
    /// The COUNT hint clamped to its accepted range.
    pub fn clamped_count(&self) -> u64 {
        self.scan_count
            .clamp(*SCAN_COUNT_RANGE.start(), *SCAN_COUNT_RANGE.end())
    }
}

/// An in-flight execution on this replica, reported by `/api/query/active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveExecution {
    /// Execution id.
    pub execution_id: String,
    /// Cloud keys with a live client handle.
    pub cloud_keys: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_record_roundtrip() {
        let record = ExecutionRecord::new("abc", Some("u1".into()), ExecutionKind::Sql);
        let json = serde_json::to_string(&record).unwrap();
        let back: ExecutionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "abc");
        assert_eq!(back.status, ExecutionStatus::Running);
        assert!(matches!(back.progress, Progress::Sql(_)));
    }

    #[test]
    fn test_scan_record_progress_shape() {
        let mut record = ExecutionRecord::new("s1", None, ExecutionKind::Scan);
        if let Progress::Scan(map) = &mut record.progress {
            map.insert("cache-east".into(), ScanProgress::new("cache-east"));
        }
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["progress"]["cache-east"]["status"], "scanning");
        let back: ExecutionRecord = serde_json::from_value(json).unwrap();
        assert!(matches!(back.progress, Progress::Scan(m) if m.contains_key("cache-east")));
    }

    #[test]
    fn test_response_uses_dynamic_cloud_keys() {
        let mut clouds = HashMap::new();
        clouds.insert(
            "atlas".to_string(),
            TargetResult {
                success: true,
                error: None,
                results: vec![],
                duration_ms: 5,
            },
        );
        let response = QueryResponse {
            id: "x".into(),
            success: true,
            clouds,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("atlas").is_some());
        assert_eq!(json["atlas"]["success"], true);
    }

    #[test]
    fn test_scan_count_clamped() {
        let mut req = ScanRequest {
            pattern: "session:*".into(),
            cloud: "all".into(),
            action: ScanAction::Preview,
            scan_count: 0,
        };
        assert_eq!(req.clamped_count(), 1);
        req.scan_count = 500_000;
        assert_eq!(req.clamped_count(), 200_000);
        req.scan_count = 1000;
        assert_eq!(req.clamped_count(), 1000);
    }

    #[test]
    fn test_query_request_wire_names() {
        let json = r#"{
            "query": "SELECT 1",
            "database": "mydb",
            "mode": "both",
            "pgSchema": "public",
            "continueOnError": true
        }"#;
        let req: QueryRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.pg_schema.as_deref(), Some("public"));
        assert!(req.continue_on_error);
        assert!(req.timeout.is_none());
    }
}
