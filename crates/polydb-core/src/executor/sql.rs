// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQL fan-out executor.
//!
//! A validated batch runs concurrently across its targets and strictly
//! sequentially within each target, on a dedicated pooled connection whose
//! backend pid is registered for engine-level cancellation. Failures are
//! captured into per-statement results; a failure inside an open
//! transaction triggers an automatic rollback with a synthetic
//! `ROLLBACK (auto)` entry. The cancellation flag is re-checked before
//! every statement; an in-flight statement is only interrupted by
//! `pg_cancel_backend` on its session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::TryStreamExt;
use futures::future::join_all;
use sqlx::postgres::PgConnection;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};
use crate::policy::{StatementCategory, classify_statement, is_valid_identifier, split_statements};
use crate::registry::PoolRegistry;
use crate::store::{ActiveClientRegistry, ExecutionStore};
use crate::types::{
    ExecutionStatus, QueryRequest, QueryResponse, StatementResult, TargetResult,
};

use super::value::{row_fields, row_to_json};

/// Tracks whether the session is inside an explicit transaction.
///
/// Two states, flipped by successful transaction-control statements and
/// read at failure time to decide whether to synthesise a rollback.
#[derive(Debug, Default, Clone, Copy)]
pub struct TxTracker {
    inside: bool,
}

impl TxTracker {
    /// Start outside any transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe a successfully executed statement.
    pub fn observe(&mut self, statement: &str) {
        let verb = leading_verb(statement);
        match verb.as_str() {
            "BEGIN" | "START" => self.inside = true,
            "COMMIT" | "ROLLBACK" | "END" => self.inside = false,
            _ => {}
        }
    }

    /// Whether the session currently has an open transaction.
    pub fn inside(&self) -> bool {
        self.inside
    }

    /// Force the outside state (after an automatic rollback).
    pub fn reset(&mut self) {
        self.inside = false;
    }
}

/// Uppercased first word of a statement.
fn leading_verb(statement: &str) -> String {
    statement
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

/// The SQL fan-out executor.
pub struct SqlExecutor {
    registry: Arc<PoolRegistry>,
    store: Arc<dyn ExecutionStore>,
    active: Arc<ActiveClientRegistry>,
    statement_timeout: Duration,
    max_query_timeout: Duration,
}

impl SqlExecutor {
    /// Build an executor over the shared registry, store, and replica-local
    /// client registry.
    pub fn new(
        registry: Arc<PoolRegistry>,
        store: Arc<dyn ExecutionStore>,
        active: Arc<ActiveClientRegistry>,
        statement_timeout: Duration,
        max_query_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            active,
            statement_timeout,
            max_query_timeout,
        }
    }

    /// Target cloud names for a request mode.
    pub fn resolve_targets(&self, mode: &str) -> Vec<String> {
        let config = self.registry.config();
        if mode == "both" {
            config.sql_clouds().map(|c| c.cloud_name.clone()).collect()
        } else {
            vec![mode.to_string()]
        }
    }

    /// Run a validated request to completion, recording everything into the
    /// execution store. Never returns an error: executor failures are
    /// captured into the record.
    pub async fn execute(&self, id: String, request: QueryRequest) {
        self.active.track(&id);
        let statements = split_statements(&request.query);
        let timeout = self.effective_timeout(&request);
        let targets = self.resolve_targets(&request.mode);

        info!(
            execution_id = %id,
            statements = statements.len(),
            targets = targets.len(),
            timeout_ms = timeout.as_millis() as u64,
            "SQL fan-out started"
        );

        let results: Arc<Mutex<HashMap<String, TargetResult>>> =
            Arc::new(Mutex::new(HashMap::new()));

        join_all(targets.iter().map(|cloud| {
            self.run_target(&id, cloud, &request, &statements, timeout, results.clone())
        }))
        .await;

        let clouds = Arc::try_unwrap(results)
            .map(Mutex::into_inner)
            .unwrap_or_default();
        let success = !clouds.is_empty() && clouds.values().all(|t| t.success);
        let response = QueryResponse {
            id: id.clone(),
            success,
            clouds,
        };

        match serde_json::to_value(&response) {
            Ok(value) => {
                if let Err(e) = self.store.complete(&id, &value, success).await {
                    error!(execution_id = %id, error = %e, "Failed to persist final result");
                }
            }
            Err(e) => error!(execution_id = %id, error = %e, "Result serialisation failed"),
        }
        self.active.complete(&id);
        info!(execution_id = %id, success, "SQL fan-out finished");
    }

    /// Per-statement timeout: the larger of the configured statement
    /// timeout and the request timeout (itself capped).
    fn effective_timeout(&self, request: &QueryRequest) -> Duration {
        let requested = request
            .timeout
            .map(Duration::from_millis)
            .unwrap_or(self.statement_timeout)
            .min(self.max_query_timeout);
        self.statement_timeout.max(requested)
    }

    async fn run_target(
        &self,
        id: &str,
        cloud: &str,
        request: &QueryRequest,
        statements: &[String],
        timeout: Duration,
        results: Arc<Mutex<HashMap<String, TargetResult>>>,
    ) {
        let cloud_key = format!("{}:{}", cloud, request.database);
        let started = Instant::now();

        let outcome = self
            .run_target_inner(id, cloud, request, statements, timeout)
            .await;

        // Client and registry entry are released on every exit path.
        self.active.release(id, &cloud_key);

        let target = match outcome {
            Ok(mut target) => {
                target.duration_ms = started.elapsed().as_millis() as u64;
                target
            }
            Err(e) => target_failure(&e.to_string(), statements, started),
        };

        let mut clouds = results.lock().await;
        clouds.insert(cloud.to_string(), target);

        // Flush a partial snapshot so pollers see this target's outcome
        // while the slower ones are still running.
        let partial = QueryResponse {
            id: id.to_string(),
            success: clouds.values().all(|t| t.success),
            clouds: clouds.clone(),
        };
        drop(clouds);
        match serde_json::to_value(&partial) {
            Ok(value) => {
                if let Err(e) = self.store.save_partial(id, &value).await {
                    warn!(execution_id = %id, cloud, error = %e, "Partial flush failed");
                }
            }
            Err(e) => warn!(execution_id = %id, cloud, error = %e, "Partial serialisation failed"),
        }
    }

    async fn run_target_inner(
        &self,
        id: &str,
        cloud: &str,
        request: &QueryRequest,
        statements: &[String],
        timeout: Duration,
    ) -> Result<TargetResult> {
        let cloud_key = format!("{}:{}", cloud, request.database);
        let pool = self.registry.sql_pool(cloud, &request.database)?;

        let mut conn = match pool.acquire().await {
            Ok(conn) => {
                self.registry.note_sql_success(cloud, &request.database);
                conn
            }
            Err(e) => {
                self.registry.note_sql_failure(cloud, &request.database);
                return Err(e.into());
            }
        };

        let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await?;
        self.active.register(id, &cloud_key, Some(backend_pid));
        debug!(execution_id = %id, cloud, backend_pid, "Target client acquired");

        if let Some(schema) = &request.pg_schema {
            if !is_valid_identifier(schema) {
                return Err(CoreError::InvalidIdentifier(schema.clone()));
            }
            sqlx::raw_sql(&format!("SET search_path TO \"{}\"", schema))
                .execute(&mut *conn)
                .await?;
        }

        let total = statements.len() as u32;
        let mut results = Vec::with_capacity(statements.len());
        let mut tx = TxTracker::new();

        if let [statement] = statements {
            // Single-statement fast path: one clean result.
            self.store
                .update_progress(id, 1, 1, Some(statement.as_str()))
                .await?;
            let result = self
                .execute_statement(&mut *conn, statement, timeout, cloud, request, backend_pid)
                .await;
            let success = result.success;
            let error = result.error.clone();
            results.push(result);
            return Ok(TargetResult {
                success,
                error,
                results,
                duration_ms: 0,
            });
        }

        for (index, statement) in statements.iter().enumerate() {
            if self.is_cancelled(id).await {
                info!(execution_id = %id, cloud, "Cancellation observed, halting target");
                break;
            }
            self.store
                .update_progress(id, index as u32 + 1, total, Some(statement.as_str()))
                .await?;

            let category = classify_statement(statement);
            let result = self
                .execute_statement(&mut *conn, statement, timeout, cloud, request, backend_pid)
                .await;
            let failed = !result.success;
            results.push(result);

            if failed {
                if tx.inside() && category != StatementCategory::TransactionControl {
                    let rollback = self
                        .execute_statement(&mut *conn, "ROLLBACK", timeout, cloud, request, backend_pid)
                        .await;
                    results.push(StatementResult {
                        statement: "ROLLBACK (auto)".to_string(),
                        command: Some("ROLLBACK".to_string()),
                        ..rollback
                    });
                    tx.reset();
                }
                if !request.continue_on_error {
                    break;
                }
            } else {
                tx.observe(statement);
            }
        }

        let success = results.iter().all(|r| r.success);
        Ok(TargetResult {
            success,
            error: None,
            results,
            duration_ms: 0,
        })
    }

    fn execute_statement<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        statement: &'a str,
        timeout: Duration,
        cloud: &'a str,
        request: &'a QueryRequest,
        backend_pid: i32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = StatementResult> + Send + 'a>> {
        Box::pin(async move {
            let started = Instant::now();
            match tokio::time::timeout(timeout, run_statement(conn, statement)).await {
                Ok(Ok((rows, fields, rows_affected))) => {
                    let row_count = if rows.is_empty() {
                        rows_affected
                    } else {
                        rows.len() as u64
                    };
                    StatementResult {
                        statement: statement.to_string(),
                        success: true,
                        command: Some(leading_verb(statement)),
                        row_count: Some(row_count),
                        rows: Some(rows),
                        fields: Some(fields),
                        error: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                    }
                }
                Ok(Err(e)) => StatementResult::failure(
                    statement,
                    e.to_string(),
                    started.elapsed().as_millis() as u64,
                ),
                Err(_) => {
                    // Cancel the engine-side operation of the losing branch.
                    if let Err(e) = self
                        .cancel_backend(cloud, &request.database, backend_pid)
                        .await
                    {
                        warn!(cloud, backend_pid, error = %e, "Engine-side cancel after timeout failed");
                    }
                    StatementResult::failure(
                        statement,
                        format!("Statement timeout after {}ms", timeout.as_millis()),
                        started.elapsed().as_millis() as u64,
                    )
                }
            }
        })
    }

    /// Issue an engine-level cancel of a backend session, on a separate
    /// administrative client from the same pool.
    async fn cancel_backend(&self, cloud: &str, database: &str, backend_pid: i32) -> Result<()> {
        let pool = self.registry.sql_pool(cloud, database)?;
        let mut admin = pool.acquire().await?;
        sqlx::query("SELECT pg_cancel_backend($1)")
            .bind(backend_pid)
            .execute(&mut *admin)
            .await?;
        Ok(())
    }

    /// Cancellation check at a suspension point: replica-local fast path
    /// first, then the shared record.
    async fn is_cancelled(&self, id: &str) -> bool {
        if self.active.is_cancelled(id) {
            return true;
        }
        matches!(
            self.store.get(id).await,
            Ok(Some(record)) if record.status == ExecutionStatus::Cancelled
        )
    }

    /// Cancel an execution: set the shared flag, and terminate every
    /// engine session this replica holds for it. Idempotent; best-effort
    /// across replicas (elsewhere only the flag is observed).
    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.store.mark_cancelled(id).await?;
        self.active.set_cancelled(id);
        for session in self.active.backend_sessions(id) {
            let Some(pid) = session.backend_pid else {
                continue;
            };
            let Some((cloud, database)) = session.cloud_key.split_once(':') else {
                continue;
            };
            if let Err(e) = self.cancel_backend(cloud, database, pid).await {
                warn!(execution_id = %id, cloud, backend_pid = pid, error = %e, "Engine-side cancel failed");
            } else {
                info!(execution_id = %id, cloud, backend_pid = pid, "Engine-side cancel issued");
            }
        }
        Ok(())
    }
}

/// Run one statement over the simple query protocol, collecting rows,
/// field metadata, and the affected-row count.
async fn run_statement(
    conn: &mut PgConnection,
    statement: &str,
) -> sqlx::Result<(Vec<serde_json::Value>, Vec<crate::types::FieldInfo>, u64)> {
    let mut rows_affected = 0u64;
    let mut rows = Vec::new();
    let mut fields = Vec::new();
    let mut stream = sqlx::raw_sql(statement).fetch_many(&mut *conn);
    while let Some(item) = stream.try_next().await? {
        match item {
            sqlx::Either::Left(done) => rows_affected += done.rows_affected(),
            sqlx::Either::Right(row) => {
                if fields.is_empty() {
                    fields = row_fields(&row);
                }
                rows.push(row_to_json(&row));
            }
        }
    }
    Ok((rows, fields, rows_affected))
}

/// Shape a target-scope failure: multi-statement requests report every
/// statement with the same error so the result shape stays uniform; a
/// single-statement request carries the error at target scope only.
fn target_failure(error: &str, statements: &[String], started: Instant) -> TargetResult {
    let results = if statements.len() > 1 {
        statements
            .iter()
            .map(|s| StatementResult::failure(s, error, 0))
            .collect()
    } else {
        Vec::new()
    };
    TargetResult {
        success: false,
        error: Some(error.to_string()),
        results,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

#[allow(dead_code)]
fn _assert_execute_send(e: std::sync::Arc<SqlExecutor>, id: String, req: QueryRequest) {
    fn assert_send<T: Send>(_: &T) {}
    let fut = e.execute(id, req);
    assert_send(&fut);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_tracker_state_machine() {
        let mut tx = TxTracker::new();
        assert!(!tx.inside());
        tx.observe("BEGIN");
        assert!(tx.inside());
        tx.observe("UPDATE t SET x = 1 WHERE id = 1");
        assert!(tx.inside());
        tx.observe("COMMIT");
        assert!(!tx.inside());
        tx.observe("START TRANSACTION");
        assert!(tx.inside());
        tx.observe("ROLLBACK");
        assert!(!tx.inside());
    }

    #[test]
    fn test_tx_tracker_savepoint_is_neutral() {
        let mut tx = TxTracker::new();
        tx.observe("BEGIN");
        tx.observe("SAVEPOINT sp1");
        assert!(tx.inside());
    }

    #[test]
    fn test_leading_verb() {
        assert_eq!(leading_verb("select * from t"), "SELECT");
        assert_eq!(leading_verb("  ROLLBACK"), "ROLLBACK");
        assert_eq!(leading_verb(""), "");
    }

    #[test]
    fn test_target_failure_shapes() {
        let started = Instant::now();
        let multi = vec!["SELECT 1".to_string(), "SELECT 2".to_string()];
        let target = target_failure("connect refused", &multi, started);
        assert!(!target.success);
        assert_eq!(target.results.len(), 2);
        assert!(target.results.iter().all(|r| {
            r.error.as_deref() == Some("connect refused") && !r.success
        }));

        let single = vec!["SELECT 1".to_string()];
        let target = target_failure("connect refused", &single, started);
        assert!(target.results.is_empty());
        assert_eq!(target.error.as_deref(), Some("connect refused"));
    }
}
