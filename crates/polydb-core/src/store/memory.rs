// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory execution store tier.
//!
//! Replica-local, development only. A background sweep evicts terminal
//! records 25 minutes past `end_time` so a long-lived dev process does not
//! accumulate them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::types::{ExecutionKind, ExecutionRecord, ScanProgress, now_millis};

use super::ExecutionStore;

/// How often the sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Terminal records older than this past `end_time` are evicted.
const RETENTION: Duration = Duration::from_secs(25 * 60);

/// Replica-local execution store.
pub struct MemoryStore {
    records: DashMap<String, ExecutionRecord>,
    shutdown: Arc<Notify>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to stop the sweeper.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the eviction sweep loop until shutdown is signalled.
    pub async fn run_sweeper(self: Arc<Self>) {
        info!(
            interval_secs = SWEEP_INTERVAL.as_secs(),
            retention_secs = RETENTION.as_secs(),
            "Execution store sweeper started"
        );
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Execution store sweeper stopped");
                    break;
                }

                _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                    let evicted = self.sweep_once();
                    if evicted > 0 {
                        debug!(evicted, "Evicted expired execution records");
                    }
                }
            }
        }
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Evict terminal records past retention. Returns the eviction count.
    pub fn sweep_once(&self) -> usize {
        let cutoff = now_millis() - RETENTION.as_millis() as i64;
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|entry| {
                entry.value().status.is_terminal()
                    && entry.value().end_time.is_some_and(|t| t < cutoff)
            })
            .map(|entry| entry.key().clone())
            .collect();
        let count = expired.len();
        for id in expired {
            self.records.remove(&id);
        }
        count
    }

    fn mutate<F>(&self, id: &str, f: F)
    where
        F: FnOnce(&mut ExecutionRecord) -> bool,
    {
        if let Some(mut entry) = self.records.get_mut(id) {
            f(entry.value_mut());
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn init(&self, id: &str, user_id: Option<&str>, kind: ExecutionKind) -> Result<()> {
        if self.records.contains_key(id) {
            return Err(CoreError::ExecutionAlreadyExists(id.to_string()));
        }
        self.records.insert(
            id.to_string(),
            ExecutionRecord::new(id, user_id.map(str::to_string), kind),
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.records.get(id).map(|entry| entry.value().clone()))
    }

    async fn update_progress(
        &self,
        id: &str,
        current: u32,
        total: u32,
        text: Option<&str>,
    ) -> Result<()> {
        self.mutate(id, |r| super::apply_progress(r, current, total, text));
        Ok(())
    }

    async fn update_scan_progress(
        &self,
        id: &str,
        cloud: &str,
        progress: ScanProgress,
    ) -> Result<()> {
        self.mutate(id, |r| super::apply_scan_progress(r, cloud, progress));
        Ok(())
    }

    async fn save_partial(&self, id: &str, result: &serde_json::Value) -> Result<()> {
        self.mutate(id, |r| super::apply_partial(r, result));
        Ok(())
    }

    async fn complete(&self, id: &str, result: &serde_json::Value, success: bool) -> Result<()> {
        self.mutate(id, |r| super::apply_complete(r, result, success));
        Ok(())
    }

    async fn fail(&self, id: &str, error: &str) -> Result<()> {
        self.mutate(id, |r| super::apply_fail(r, error));
        Ok(())
    }

    async fn mark_cancelled(&self, id: &str) -> Result<()> {
        self.mutate(id, |r| super::apply_cancel(r));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionStatus;

    #[tokio::test]
    async fn test_init_rejects_duplicate() {
        let store = MemoryStore::new();
        store.init("a", Some("u1"), ExecutionKind::Sql).await.unwrap();
        let err = store.init("a", Some("u1"), ExecutionKind::Sql).await.unwrap_err();
        assert!(matches!(err, CoreError::ExecutionAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = MemoryStore::new();
        store.init("a", Some("u1"), ExecutionKind::Sql).await.unwrap();

        store.update_progress("a", 1, 3, Some("SELECT 1")).await.unwrap();
        let record = store.get("a").await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);

        store
            .complete("a", &serde_json::json!({"ok": true}), true)
            .await
            .unwrap();
        let record = store.get("a").await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert!(record.end_time.is_some());
    }

    #[tokio::test]
    async fn test_cancel_sticks() {
        let store = MemoryStore::new();
        store.init("a", None, ExecutionKind::Sql).await.unwrap();
        store.mark_cancelled("a").await.unwrap();
        store.complete("a", &serde_json::json!(null), true).await.unwrap();
        let record = store.get("a").await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_get_unknown_is_none() {
        let store = MemoryStore::new();
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_old_terminal_records() {
        let store = MemoryStore::new();
        store.init("old", None, ExecutionKind::Sql).await.unwrap();
        store.init("fresh", None, ExecutionKind::Sql).await.unwrap();
        store.init("running", None, ExecutionKind::Sql).await.unwrap();
        store.complete("old", &serde_json::json!(null), true).await.unwrap();
        store.complete("fresh", &serde_json::json!(null), true).await.unwrap();

        // Age the old record past retention
        store
            .records
            .get_mut("old")
            .unwrap()
            .end_time
            .replace(now_millis() - RETENTION.as_millis() as i64 - 1000);

        assert_eq!(store.sweep_once(), 1);
        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.get("fresh").await.unwrap().is_some());
        assert!(store.get("running").await.unwrap().is_some());
    }
}
