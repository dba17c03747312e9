// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared (Redis-backed) execution store tier.
//!
//! Records are serialised as JSON under `execution:<id>` with a bounded
//! TTL. Mutations are read-modify-write; concurrent writers to the same
//! record are tolerated (last writer wins for progress fields, terminal
//! status is sticky via the shared transition logic).

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::types::{ExecutionKind, ExecutionRecord, ScanProgress};

use super::ExecutionStore;

/// Connection to the shared store, plain or cluster-mode.
#[derive(Clone)]
enum StoreConn {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

/// Shared-tier execution store.
pub struct RedisStore {
    conn: StoreConn,
    ttl: Duration,
}

impl RedisStore {
    /// Connect to the shared store. `cluster_mode` selects a cluster client
    /// (the seed node is asked for the rest of the topology).
    pub async fn connect(host: &str, port: u16, cluster_mode: bool, ttl: Duration) -> Result<Self> {
        let url = format!("redis://{}:{}/", host, port);
        let conn = if cluster_mode {
            let client = ClusterClient::new(vec![url])?;
            StoreConn::Cluster(client.get_async_connection().await?)
        } else {
            let client = redis::Client::open(url.as_str())?;
            StoreConn::Single(client.get_connection_manager().await?)
        };
        debug!(host, port, cluster_mode, "Connected to shared execution store");
        Ok(Self { conn, ttl })
    }

    fn key(id: &str) -> String {
        format!("execution:{}", id)
    }

    async fn read(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        let key = Self::key(id);
        let raw: Option<String> = match &self.conn {
            StoreConn::Single(cm) => {
                let mut conn = cm.clone();
                conn.get(&key).await?
            }
            StoreConn::Cluster(cc) => {
                let mut conn = cc.clone();
                conn.get(&key).await?
            }
        };
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, record: &ExecutionRecord) -> Result<()> {
        let key = Self::key(&record.id);
        let json = serde_json::to_string(record)?;
        let ttl = self.ttl.as_secs();
        match &self.conn {
            StoreConn::Single(cm) => {
                let mut conn = cm.clone();
                let _: () = conn.set_ex(&key, json, ttl).await?;
            }
            StoreConn::Cluster(cc) => {
                let mut conn = cc.clone();
                let _: () = conn.set_ex(&key, json, ttl).await?;
            }
        }
        Ok(())
    }

    /// Read, apply a transition, write back if it changed anything.
    async fn mutate<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut ExecutionRecord) -> bool,
    {
        let Some(mut record) = self.read(id).await? else {
            return Ok(());
        };
        if f(&mut record) {
            self.write(&record).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for RedisStore {
    async fn init(&self, id: &str, user_id: Option<&str>, kind: ExecutionKind) -> Result<()> {
        if self.read(id).await?.is_some() {
            return Err(CoreError::ExecutionAlreadyExists(id.to_string()));
        }
        self.write(&ExecutionRecord::new(id, user_id.map(str::to_string), kind))
            .await
    }

    async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        self.read(id).await
    }

    async fn update_progress(
        &self,
        id: &str,
        current: u32,
        total: u32,
        text: Option<&str>,
    ) -> Result<()> {
        self.mutate(id, |r| super::apply_progress(r, current, total, text))
            .await
    }

    async fn update_scan_progress(
        &self,
        id: &str,
        cloud: &str,
        progress: ScanProgress,
    ) -> Result<()> {
        self.mutate(id, |r| super::apply_scan_progress(r, cloud, progress))
            .await
    }

    async fn save_partial(&self, id: &str, result: &serde_json::Value) -> Result<()> {
        self.mutate(id, |r| super::apply_partial(r, result)).await
    }

    async fn complete(&self, id: &str, result: &serde_json::Value, success: bool) -> Result<()> {
        self.mutate(id, |r| super::apply_complete(r, result, success))
            .await
    }

    async fn fail(&self, id: &str, error: &str) -> Result<()> {
        self.mutate(id, |r| super::apply_fail(r, error)).await
    }

    async fn mark_cancelled(&self, id: &str) -> Result<()> {
        self.mutate(id, |r| super::apply_cancel(r)).await
    }
}
