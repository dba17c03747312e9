// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-replica registry of live client handles.
//!
//! Strictly replica-local, never written to the shared store. Holds the
//! backend session id of every client a local executor currently owns, so
//! a cancel on the originating replica can terminate engine-side sessions.
//! Also carries the fast-path cancellation flag an executor checks at each
//! suspension point before touching the shared store.
//!
//! Entries must be released on every exit path; a stale entry would route
//! a cancel at a recycled backend session.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::types::ActiveExecution;

/// A client handle entry: which cloud, and the engine-side session id.
#[derive(Debug, Clone)]
pub struct BackendSession {
    /// Target key, e.g. `atlas:mydb` or a KV cloud name.
    pub cloud_key: String,
    /// Engine session id (PostgreSQL backend pid). `None` when the engine
    /// has no cancellable session concept for this client.
    pub backend_pid: Option<i32>,
}

#[derive(Debug, Default)]
struct ExecutionEntry {
    clients: HashMap<String, BackendSession>,
    cancelled: bool,
}

/// Per-replica map of execution id → live client handles.
#[derive(Debug, Default)]
pub struct ActiveClientRegistry {
    executions: DashMap<String, ExecutionEntry>,
}

impl ActiveClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an execution on this replica. Idempotent.
    pub fn track(&self, id: &str) {
        self.executions.entry(id.to_string()).or_default();
    }

    /// Record a live client for (execution, cloud key).
    pub fn register(&self, id: &str, cloud_key: &str, backend_pid: Option<i32>) {
        self.executions
            .entry(id.to_string())
            .or_default()
            .clients
            .insert(
                cloud_key.to_string(),
                BackendSession {
                    cloud_key: cloud_key.to_string(),
                    backend_pid,
                },
            );
    }

    /// Drop the client entry for (execution, cloud key). The execution
    /// itself stays tracked until [`Self::complete`].
    pub fn release(&self, id: &str, cloud_key: &str) {
        if let Some(mut entry) = self.executions.get_mut(id) {
            entry.clients.remove(cloud_key);
        }
    }

    /// Stop tracking an execution entirely.
    pub fn complete(&self, id: &str) {
        self.executions.remove(id);
    }

    /// Engine session ids currently live for an execution, for engine-level
    /// cancellation.
    pub fn backend_sessions(&self, id: &str) -> Vec<BackendSession> {
        self.executions
            .get(id)
            .map(|entry| entry.clients.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Set the local cancellation flag. Returns whether the execution is
    /// tracked on this replica.
    pub fn set_cancelled(&self, id: &str) -> bool {
        match self.executions.get_mut(id) {
            Some(mut entry) => {
                entry.cancelled = true;
                true
            }
            None => false,
        }
    }

    /// Fast-path cancellation check, no I/O.
    pub fn is_cancelled(&self, id: &str) -> bool {
        self.executions.get(id).is_some_and(|entry| entry.cancelled)
    }

    /// Executions currently tracked on this replica.
    pub fn list(&self) -> Vec<ActiveExecution> {
        self.executions
            .iter()
            .map(|entry| ActiveExecution {
                execution_id: entry.key().clone(),
                cloud_keys: entry.value().clients.keys().cloned().collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_release_lifecycle() {
        let registry = ActiveClientRegistry::new();
        registry.track("e1");
        registry.register("e1", "atlas:mydb", Some(4242));
        registry.register("e1", "vega:mydb", Some(4243));

        let sessions = registry.backend_sessions("e1");
        assert_eq!(sessions.len(), 2);

        registry.release("e1", "atlas:mydb");
        let sessions = registry.backend_sessions("e1");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].backend_pid, Some(4243));

        // release does not remove the execution id
        assert_eq!(registry.list().len(), 1);

        registry.complete("e1");
        assert!(registry.list().is_empty());
        assert!(registry.backend_sessions("e1").is_empty());
    }

    #[test]
    fn test_cancel_flag() {
        let registry = ActiveClientRegistry::new();
        registry.track("e1");
        assert!(!registry.is_cancelled("e1"));
        assert!(registry.set_cancelled("e1"));
        assert!(registry.is_cancelled("e1"));

        // untracked executions are not flagged
        assert!(!registry.set_cancelled("e2"));
        assert!(!registry.is_cancelled("e2"));
    }

    #[test]
    fn test_list_reports_cloud_keys() {
        let registry = ActiveClientRegistry::new();
        registry.register("e1", "atlas:mydb", None);
        let active = registry.list();
        assert_eq!(active[0].execution_id, "e1");
        assert_eq!(active[0].cloud_keys, vec!["atlas:mydb".to_string()]);
    }
}
