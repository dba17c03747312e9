// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster-wide SCAN + UNLINK executor.
//!
//! For each selected KV cloud, every master node is scanned with a cursor
//! loop; matched keys are collected up to the preview cap while the found
//! counter keeps running. The optional delete phase unlinks the collected
//! keys in batches through the cluster client, which routes each key by
//! slot. Cancellation is checked at the top of every iteration and between
//! nodes, so a cancel lands within one batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use redis::AsyncCommands;
use tracing::{error, info, warn};

use crate::error::CoreError;
use crate::registry::PoolRegistry;
use crate::store::{ActiveClientRegistry, ExecutionStore};
use crate::types::{
    DELETE_BATCH, ExecutionStatus, PREVIEW_CAP, SCAN_SLEEP_MS, ScanAction, ScanProgress,
    ScanRequest, ScanStatus,
};

/// Why a per-cloud scan stopped early.
enum Halt {
    Cancelled,
    Error(CoreError),
}

/// The cluster-wide SCAN executor.
pub struct ScanExecutor {
    registry: Arc<PoolRegistry>,
    store: Arc<dyn ExecutionStore>,
    active: Arc<ActiveClientRegistry>,
}

impl ScanExecutor {
    /// Build an executor over the shared registry and store.
    pub fn new(
        registry: Arc<PoolRegistry>,
        store: Arc<dyn ExecutionStore>,
        active: Arc<ActiveClientRegistry>,
    ) -> Self {
        Self {
            registry,
            store,
            active,
        }
    }

    /// Target KV cloud names for a request.
    pub fn resolve_clouds(&self, cloud: &str) -> Vec<String> {
        let config = self.registry.config();
        if cloud == "all" {
            config
                .kv_clouds
                .iter()
                .map(|c| c.cloud_name.clone())
                .collect()
        } else {
            vec![cloud.to_string()]
        }
    }

    /// Run a validated scan to completion, recording per-cloud progress
    /// into the execution store. Never returns an error: failures are
    /// captured into the record.
    pub async fn execute(&self, id: String, request: ScanRequest) {
        self.active.track(&id);
        let clouds = self.resolve_clouds(&request.cloud);
        info!(
            execution_id = %id,
            pattern = %request.pattern,
            clouds = clouds.len(),
            action = ?request.action,
            "Cluster scan started"
        );

        let progresses = join_all(
            clouds
                .iter()
                .map(|cloud| self.run_cloud(&id, cloud, &request)),
        )
        .await;

        let cancelled = progresses.iter().any(|p| p.status == ScanStatus::Cancelled);
        let failed = progresses.iter().any(|p| p.status == ScanStatus::Error);
        let success = !cancelled && !failed;

        let map: HashMap<String, ScanProgress> = progresses
            .into_iter()
            .map(|p| (p.cloud_name.clone(), p))
            .collect();
        match serde_json::to_value(&map) {
            Ok(value) => {
                if let Err(e) = self.store.complete(&id, &value, success).await {
                    error!(execution_id = %id, error = %e, "Failed to persist scan result");
                }
            }
            Err(e) => error!(execution_id = %id, error = %e, "Scan result serialisation failed"),
        }
        self.active.complete(&id);
        info!(execution_id = %id, success, cancelled, "Cluster scan finished");
    }

    /// Cancel a scan. Idempotent; the executor halts at its next check.
    pub async fn cancel(&self, id: &str) -> crate::error::Result<()> {
        self.store.mark_cancelled(id).await?;
        self.active.set_cancelled(id);
        Ok(())
    }

    async fn run_cloud(&self, id: &str, cloud: &str, request: &ScanRequest) -> ScanProgress {
        let mut progress = ScanProgress::new(cloud);
        match self.scan_cloud(id, cloud, request, &mut progress).await {
            Ok(()) => {
                progress.status = ScanStatus::Completed;
            }
            Err(Halt::Cancelled) => {
                progress.status = ScanStatus::Cancelled;
                info!(execution_id = %id, cloud, nodes_scanned = progress.nodes_scanned, "Cloud scan cancelled");
            }
            Err(Halt::Error(e)) => {
                progress.status = ScanStatus::Error;
                progress.error = Some(e.to_string());
                warn!(execution_id = %id, cloud, error = %e, "Cloud scan failed");
            }
        }
        self.save(id, cloud, &progress).await;
        progress
    }

    async fn scan_cloud(
        &self,
        id: &str,
        cloud: &str,
        request: &ScanRequest,
        progress: &mut ScanProgress,
    ) -> Result<(), Halt> {
        let masters = self
            .registry
            .kv_masters(cloud)
            .await
            .map_err(Halt::Error)?;
        progress.nodes_total = masters.len() as u32;
        self.save(id, cloud, progress).await;

        let count = request.clamped_count();
        for node in &masters {
            self.check_cancel(id).await?;
            let mut conn = self
                .registry
                .node_connection(node)
                .await
                .map_err(Halt::Error)?;

            let mut cursor = 0u64;
            loop {
                self.check_cancel(id).await?;
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&request.pattern)
                    .arg("COUNT")
                    .arg(count)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| Halt::Error(e.into()))?;

                progress.keys_found += keys.len() as u64;
                for key in keys {
                    if progress.keys.len() < PREVIEW_CAP {
                        progress.keys.push(key);
                    }
                }
                self.save(id, cloud, progress).await;

                cursor = next;
                if cursor == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(SCAN_SLEEP_MS)).await;
            }
            progress.nodes_scanned += 1;
            self.save(id, cloud, progress).await;
        }

        if request.action == ScanAction::Delete {
            self.delete_collected(id, cloud, progress).await?;
        }
        Ok(())
    }

    /// Unlink the collected keys in batches via the cluster client. The
    /// partial delete count survives cancellation.
    async fn delete_collected(
        &self,
        id: &str,
        cloud: &str,
        progress: &mut ScanProgress,
    ) -> Result<(), Halt> {
        progress.status = ScanStatus::Deleting;
        self.save(id, cloud, progress).await;

        let mut conn = self
            .registry
            .kv_connection(cloud)
            .await
            .map_err(Halt::Error)?;

        let keys = progress.keys.clone();
        for batch in keys.chunks(DELETE_BATCH) {
            self.check_cancel(id).await?;
            let mut removed = 0u64;
            for key in batch {
                // One key per command: the cluster client routes by slot,
                // and a multi-key UNLINK would trip over slot boundaries.
                let n: u64 = conn
                    .unlink(key)
                    .await
                    .map_err(|e| Halt::Error(e.into()))?;
                removed += n;
            }
            progress.keys_deleted += removed;
            self.save(id, cloud, progress).await;
        }
        Ok(())
    }

    /// Cancellation check at a suspension point.
    async fn check_cancel(&self, id: &str) -> Result<(), Halt> {
        if self.active.is_cancelled(id) {
            return Err(Halt::Cancelled);
        }
        match self.store.get(id).await {
            Ok(Some(record)) if record.status == ExecutionStatus::Cancelled => Err(Halt::Cancelled),
            _ => Ok(()),
        }
    }

    async fn save(&self, id: &str, cloud: &str, progress: &ScanProgress) {
        if let Err(e) = self
            .store
            .update_scan_progress(id, cloud, progress.clone())
            .await
        {
            warn!(execution_id = %id, cloud, error = %e, "Scan progress flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CloudConfig, DatabaseConfig, KvCloudConfig, SqlCloudConfig};
    use crate::store::MemoryStore;
    use crate::types::ExecutionKind;

    fn test_registry() -> Arc<PoolRegistry> {
        Arc::new(PoolRegistry::new(CloudConfig {
            primary: SqlCloudConfig {
                cloud_name: "atlas".into(),
                db_configs: vec![DatabaseConfig {
                    name: "mydb".into(),
                    host: "127.0.0.1".into(),
                    port: 5432,
                    user: "ops".into(),
                    password: "pw".into(),
                    database: "mydb".into(),
                    schemas: vec!["public".into()],
                    default_schema: "public".into(),
                }],
            },
            secondaries: vec![],
            kv_clouds: vec![
                KvCloudConfig {
                    cloud_name: "cache-east".into(),
                    host: "127.0.0.1".into(),
                    port: 7001,
                },
                KvCloudConfig {
                    cloud_name: "cache-west".into(),
                    host: "127.0.0.1".into(),
                    port: 7002,
                },
            ],
        }))
    }

    fn test_executor() -> ScanExecutor {
        ScanExecutor::new(
            test_registry(),
            Arc::new(MemoryStore::new()),
            Arc::new(ActiveClientRegistry::new()),
        )
    }

    #[test]
    fn test_resolve_clouds() {
        let executor = test_executor();
        assert_eq!(
            executor.resolve_clouds("all"),
            vec!["cache-east".to_string(), "cache-west".to_string()]
        );
        assert_eq!(
            executor.resolve_clouds("cache-west"),
            vec!["cache-west".to_string()]
        );
    }

    #[tokio::test]
    async fn test_check_cancel_via_local_flag() {
        let executor = test_executor();
        executor.active.track("s1");
        assert!(executor.check_cancel("s1").await.is_ok());
        executor.active.set_cancelled("s1");
        assert!(matches!(
            executor.check_cancel("s1").await,
            Err(Halt::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_check_cancel_via_store_record() {
        let executor = test_executor();
        executor
            .store
            .init("s2", None, ExecutionKind::Scan)
            .await
            .unwrap();
        assert!(executor.check_cancel("s2").await.is_ok());
        executor.store.mark_cancelled("s2").await.unwrap();
        assert!(matches!(
            executor.check_cancel("s2").await,
            Err(Halt::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let executor = test_executor();
        executor
            .store
            .init("s3", None, ExecutionKind::Scan)
            .await
            .unwrap();
        executor.cancel("s3").await.unwrap();
        executor.cancel("s3").await.unwrap();
        let record = executor.store.get("s3").await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
    }
}
