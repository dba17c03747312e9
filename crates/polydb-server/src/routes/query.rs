// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQL execution routes: admit, execute asynchronously, poll, cancel.
//!
//! Policy and shape errors short-circuit here, before an execution record
//! exists. Only an admitted request allocates an id and spawns the fan-out.

use axum::Json;
use axum::extract::{Path, State};
use polydb_core::policy::{self, Role, classify_sql, split_statements};
use polydb_core::types::{ActiveExecution, ExecutionKind, ExecutionRecord, QueryRequest};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::state::AppState;

/// Check targets, shape, and policy; returns the decision for an
/// admissible request.
fn admit(
    state: &AppState,
    auth: &AuthContext,
    request: &QueryRequest,
) -> Result<policy::PolicyDecision, ApiError> {
    let config = state.registry.config();
    if request.mode == "both" {
        if config.primary.database(&request.database).is_none() {
            return Err(ApiError::BadRequest(format!(
                "database '{}' is not declared on the primary cloud",
                request.database
            )));
        }
    } else {
        let cloud = config
            .sql_cloud(&request.mode)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown cloud '{}'", request.mode)))?;
        if cloud.database(&request.database).is_none() {
            return Err(ApiError::BadRequest(format!(
                "database '{}' is not declared on cloud '{}'",
                request.database, request.mode
            )));
        }
    }

    if let Some(schema) = &request.pg_schema {
        if !policy::is_valid_identifier(schema) {
            return Err(ApiError::BadRequest(format!(
                "invalid schema identifier '{}'",
                schema
            )));
        }
    }

    if split_statements(&request.query).is_empty() {
        return Err(ApiError::BadRequest("query contains no statements".into()));
    }

    let categories = classify_sql(&request.query);
    let decision = policy::authorize(auth.role, &categories);
    if !decision.allowed {
        return Err(ApiError::Forbidden(
            decision
                .reason
                .unwrap_or_else(|| "denied by policy".into()),
        ));
    }
    Ok(decision)
}

/// `POST /api/query/execute`: admit and start an asynchronous fan-out.
pub async fn execute(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<QueryRequest>,
) -> Result<Json<Value>, ApiError> {
    let decision = admit(&state, &auth, &request)?;

    if decision.requires_password_reauth {
        let password = request
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ApiError::BadRequest("Password verification required".into()))?;
        if !state.verifier.verify(&auth.user_id, password).await {
            return Err(ApiError::Unauthorized("Password verification failed".into()));
        }
    }

    let id = Uuid::new_v4().to_string();
    state
        .store
        .init(&id, Some(&auth.user_id), ExecutionKind::Sql)
        .await?;
    info!(execution_id = %id, user_id = %auth.user_id, mode = %request.mode, "Query admitted");

    let executor = state.sql.clone();
    let execution_id = id.clone();
    tokio::spawn(async move {
        executor.execute(execution_id, request).await;
    });

    Ok(Json(json!({ "executionId": id })))
}

/// `GET /api/query/status/{id}`: current execution record.
pub async fn status(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    let record = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("execution '{}' not found", id)))?;
    Ok(Json(record))
}

/// `POST /api/query/cancel/{id}`: initiate cancellation. MASTER may cancel
/// any execution, other roles only their own.
pub async fn cancel(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("execution '{}' not found", id)))?;
    if auth.role != Role::Master && record.user_id.as_deref() != Some(auth.user_id.as_str()) {
        return Err(ApiError::Forbidden(
            "only MASTER may cancel another user's execution".into(),
        ));
    }
    state.sql.cancel(&id).await?;
    info!(execution_id = %id, user_id = %auth.user_id, "Cancellation initiated");
    Ok(Json(json!({ "success": true })))
}

/// `GET /api/query/active`: in-flight executions on this replica.
pub async fn active(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Json<Vec<ActiveExecution>> {
    Json(state.active.list())
}

/// `POST /api/query/validate`: run the policy engine and splitter only.
pub async fn validate(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<QueryRequest>,
) -> Json<Value> {
    match admit(&state, &auth, &request) {
        Ok(_) => Json(json!({ "valid": true })),
        Err(e) => Json(json!({ "valid": false, "error": e.to_string() })),
    }
}
