// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared state handed to every route handler.

use std::sync::Arc;

use polydb_core::config::{CloudConfig, EnvSettings};
use polydb_core::executor::{KvCommandExecutor, ScanExecutor, SqlExecutor};
use polydb_core::registry::PoolRegistry;
use polydb_core::store::{ActiveClientRegistry, ExecutionStore};

use crate::auth::PasswordVerifier;

/// Shared handles for the API surface.
#[derive(Clone)]
pub struct AppState {
    /// Connection-handle registry.
    pub registry: Arc<PoolRegistry>,
    /// Cross-replica execution store.
    pub store: Arc<dyn ExecutionStore>,
    /// Replica-local client registry.
    pub active: Arc<ActiveClientRegistry>,
    /// SQL fan-out executor.
    pub sql: Arc<SqlExecutor>,
    /// Cluster SCAN executor.
    pub scan: Arc<ScanExecutor>,
    /// Synchronous KV command executor.
    pub kv: Arc<KvCommandExecutor>,
    /// Password re-authentication seam.
    pub verifier: Arc<dyn PasswordVerifier>,
}

impl AppState {
    /// Wire the executors over a topology, store, and verifier.
    pub fn new(
        config: CloudConfig,
        store: Arc<dyn ExecutionStore>,
        settings: &EnvSettings,
        verifier: Arc<dyn PasswordVerifier>,
    ) -> Self {
        let registry = Arc::new(PoolRegistry::new(config));
        let active = Arc::new(ActiveClientRegistry::new());
        let sql = Arc::new(SqlExecutor::new(
            registry.clone(),
            store.clone(),
            active.clone(),
            settings.statement_timeout,
            settings.max_query_timeout,
        ));
        let scan = Arc::new(ScanExecutor::new(
            registry.clone(),
            store.clone(),
            active.clone(),
        ));
        let kv = Arc::new(KvCommandExecutor::new(registry.clone()));
        Self {
            registry,
            store,
            active,
            sql,
            scan,
            kv,
            verifier,
        }
    }
}
