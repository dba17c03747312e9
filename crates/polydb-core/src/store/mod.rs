// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution store: the cross-replica record of every async submission.
//!
//! The primary tier is the shared Redis keyed by `execution:<id>` with a
//! bounded TTL, so any stateless replica can answer status polls. The
//! in-memory tier exists for local development only; in production a store
//! failure surfaces instead of being masked.
//!
//! State transitions applied here are monotone: `running` moves to exactly
//! one terminal state, and `cancelled` sticks: a `complete` or `fail`
//! arriving after cancellation keeps the cancelled status while still
//! recording the result payload.

pub mod active;
pub mod memory;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::EnvSettings;
use crate::error::Result;
use crate::types::{
    ExecutionKind, ExecutionRecord, ExecutionStatus, Progress, ScanProgress, now_millis,
};

pub use self::active::{ActiveClientRegistry, BackendSession};
pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Store of execution records, pollable across replicas.
///
/// All operations may suspend on network I/O. Updates to progress fields
/// are last-writer-wins; terminal status is sticky by rule.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create a record with `status=running`, zero progress, `start_time=now`.
    /// Fails if the id already exists.
    async fn init(&self, id: &str, user_id: Option<&str>, kind: ExecutionKind) -> Result<()>;

    /// Read a snapshot. `None` if the record expired or never existed.
    async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>>;

    /// Update SQL statement progress. No-op if absent or terminal.
    async fn update_progress(
        &self,
        id: &str,
        current: u32,
        total: u32,
        text: Option<&str>,
    ) -> Result<()>;

    /// Merge one cloud's SCAN progress into the record. No-op if absent.
    async fn update_scan_progress(&self, id: &str, cloud: &str, progress: ScanProgress)
    -> Result<()>;

    /// Write `result` without changing status. No-op if absent.
    async fn save_partial(&self, id: &str, result: &serde_json::Value) -> Result<()>;

    /// Transition to completed/failed (cancelled sticks), set `end_time`,
    /// write `result`. Idempotent for the same terminal state.
    async fn complete(&self, id: &str, result: &serde_json::Value, success: bool) -> Result<()>;

    /// Transition to failed with an error (unless already cancelled).
    async fn fail(&self, id: &str, error: &str) -> Result<()>;

    /// Force `status=cancelled` and set `end_time` if still running.
    async fn mark_cancelled(&self, id: &str) -> Result<()>;
}

// ============================================================================
// Record transition logic, shared by every tier
// ============================================================================

pub(crate) fn apply_progress(
    record: &mut ExecutionRecord,
    current: u32,
    total: u32,
    text: Option<&str>,
) -> bool {
    if record.status.is_terminal() {
        return false;
    }
    record.progress = Progress::Sql(crate::types::QueryProgress {
        current_statement: current,
        total_statements: total,
        current_statement_text: text.map(str::to_string),
    });
    true
}

pub(crate) fn apply_scan_progress(
    record: &mut ExecutionRecord,
    cloud: &str,
    progress: ScanProgress,
) -> bool {
    // Scan progress may still land after a cancel: the final per-cloud
    // status and partial delete counts must remain visible.
    match &mut record.progress {
        Progress::Scan(map) => {
            map.insert(cloud.to_string(), progress);
            true
        }
        Progress::Sql(_) => false,
    }
}

pub(crate) fn apply_partial(record: &mut ExecutionRecord, result: &serde_json::Value) -> bool {
    record.result = Some(result.clone());
    true
}

pub(crate) fn apply_complete(
    record: &mut ExecutionRecord,
    result: &serde_json::Value,
    success: bool,
) -> bool {
    if record.status.is_terminal() && record.status != ExecutionStatus::Cancelled {
        return false;
    }
    if record.status != ExecutionStatus::Cancelled {
        record.status = if success {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
    }
    record.result = Some(result.clone());
    if record.end_time.is_none() {
        record.end_time = Some(now_millis());
    }
    true
}

pub(crate) fn apply_fail(record: &mut ExecutionRecord, error: &str) -> bool {
    if record.status.is_terminal() {
        return false;
    }
    record.status = ExecutionStatus::Failed;
    record.error = Some(error.to_string());
    record.end_time = Some(now_millis());
    true
}

pub(crate) fn apply_cancel(record: &mut ExecutionRecord) -> bool {
    if record.status.is_terminal() {
        return false;
    }
    record.status = ExecutionStatus::Cancelled;
    record.end_time = Some(now_millis());
    true
}

// ============================================================================
// Tier selection
// ============================================================================

/// A local-development wrapper: every operation tries the shared tier and
/// falls through to the in-memory tier on a store error. Never used when
/// `REDIS_HOST` points at a non-local shared service.
pub struct FallbackStore {
    primary: RedisStore,
    memory: Arc<MemoryStore>,
}

impl FallbackStore {
    /// Wrap a shared-tier store with a memory fallback.
    pub fn new(primary: RedisStore, memory: Arc<MemoryStore>) -> Self {
        Self { primary, memory }
    }
}

macro_rules! fall_through {
    ($self:ident, $op:ident ( $($arg:expr),* )) => {
        match $self.primary.$op($($arg),*).await {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(error = %e, op = stringify!($op), "Shared store unavailable, using memory tier");
                $self.memory.$op($($arg),*).await
            }
        }
    };
}

#[async_trait]
impl ExecutionStore for FallbackStore {
    async fn init(&self, id: &str, user_id: Option<&str>, kind: ExecutionKind) -> Result<()> {
        fall_through!(self, init(id, user_id, kind))
    }

    async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        fall_through!(self, get(id))
    }

    async fn update_progress(
        &self,
        id: &str,
        current: u32,
        total: u32,
        text: Option<&str>,
    ) -> Result<()> {
        fall_through!(self, update_progress(id, current, total, text))
    }

    async fn update_scan_progress(
        &self,
        id: &str,
        cloud: &str,
        progress: ScanProgress,
    ) -> Result<()> {
        fall_through!(self, update_scan_progress(id, cloud, progress.clone()))
    }

    async fn save_partial(&self, id: &str, result: &serde_json::Value) -> Result<()> {
        fall_through!(self, save_partial(id, result))
    }

    async fn complete(&self, id: &str, result: &serde_json::Value, success: bool) -> Result<()> {
        fall_through!(self, complete(id, result, success))
    }

    async fn fail(&self, id: &str, error: &str) -> Result<()> {
        fall_through!(self, fail(id, error))
    }

    async fn mark_cancelled(&self, id: &str) -> Result<()> {
        fall_through!(self, mark_cancelled(id))
    }
}

/// Build the execution store for this process.
///
/// - `REDIS_HOST` unset: memory tier only (development).
/// - `REDIS_HOST` local: shared tier with memory fall-through.
/// - `REDIS_HOST` remote: shared tier only; failures surface.
pub async fn connect(settings: &EnvSettings) -> Result<Arc<dyn ExecutionStore>> {
    let Some(host) = settings.redis_host.clone() else {
        warn!("REDIS_HOST not set, execution records are replica-local");
        return Ok(memory_tier());
    };

    let redis = RedisStore::connect(
        &host,
        settings.redis_port,
        settings.redis_cluster_mode,
        settings.execution_ttl,
    )
    .await;

    if settings.redis_is_local() {
        match redis {
            Ok(store) => {
                let memory = Arc::new(MemoryStore::new());
                tokio::spawn(memory.clone().run_sweeper());
                Ok(Arc::new(FallbackStore::new(store, memory)))
            }
            Err(e) => {
                warn!(error = %e, "Local shared store unreachable, using memory tier");
                Ok(memory_tier())
            }
        }
    } else {
        Ok(Arc::new(redis?))
    }
}

fn memory_tier() -> Arc<dyn ExecutionStore> {
    let memory = Arc::new(MemoryStore::new());
    tokio::spawn(memory.clone().run_sweeper());
    memory
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_sticks_over_complete() {
        let mut record = ExecutionRecord::new("x", None, ExecutionKind::Sql);
        assert!(apply_cancel(&mut record));
        let end = record.end_time;
        assert!(apply_complete(&mut record, &serde_json::json!({"ok": true}), true));
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert_eq!(record.end_time, end);
        assert!(record.result.is_some());
    }

    #[test]
    fn test_fail_after_cancel_is_noop() {
        let mut record = ExecutionRecord::new("x", None, ExecutionKind::Sql);
        apply_cancel(&mut record);
        assert!(!apply_fail(&mut record, "boom"));
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert!(record.error.is_none());
    }

    #[test]
    fn test_complete_is_idempotent() {
        let mut record = ExecutionRecord::new("x", None, ExecutionKind::Sql);
        assert!(apply_complete(&mut record, &serde_json::json!(1), true));
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert!(!apply_complete(&mut record, &serde_json::json!(2), false));
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.result, Some(serde_json::json!(1)));
    }

    #[test]
    fn test_progress_dropped_after_terminal() {
        let mut record = ExecutionRecord::new("x", None, ExecutionKind::Sql);
        assert!(apply_progress(&mut record, 1, 3, Some("SELECT 1")));
        apply_fail(&mut record, "boom");
        assert!(!apply_progress(&mut record, 2, 3, None));
    }

    #[test]
    fn test_scan_progress_survives_cancel() {
        let mut record = ExecutionRecord::new("x", None, ExecutionKind::Scan);
        apply_cancel(&mut record);
        let mut progress = ScanProgress::new("cache");
        progress.keys_deleted = 400;
        assert!(apply_scan_progress(&mut record, "cache", progress));
        match &record.progress {
            Progress::Scan(map) => assert_eq!(map["cache"].keys_deleted, 400),
            _ => panic!("wrong progress shape"),
        }
    }
}
