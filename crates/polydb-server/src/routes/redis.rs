// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! KV routes: synchronous command fan-out and the asynchronous cluster
//! SCAN with preview/delete.

use axum::Json;
use axum::extract::{Path, State};
use polydb_core::policy::{Role, redis as kv_policy};
use polydb_core::types::{
    ExecutionKind, ExecutionRecord, RedisCommandRequest, RedisCommandResponse, ScanAction,
    ScanRequest,
};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::state::AppState;

fn validate_kv_cloud(state: &AppState, cloud: &str) -> Result<(), ApiError> {
    if cloud == "all" {
        if state.registry.config().kv_clouds.is_empty() {
            return Err(ApiError::BadRequest("no KV clouds are configured".into()));
        }
        return Ok(());
    }
    if state.registry.config().kv_cloud(cloud).is_none() {
        return Err(ApiError::BadRequest(format!("unknown KV cloud '{}'", cloud)));
    }
    Ok(())
}

/// `POST /api/redis/execute`: fan one command out and block for results.
pub async fn execute(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<RedisCommandRequest>,
) -> Result<Json<RedisCommandResponse>, ApiError> {
    validate_kv_cloud(&state, &request.cloud)?;

    let decision = kv_policy::classify_redis(auth.role, &request.command, &request.args);
    if !decision.allowed {
        return Err(ApiError::Forbidden(
            decision.reason.unwrap_or_else(|| "denied by policy".into()),
        ));
    }

    let response = state.kv.execute(&request).await;
    Ok(Json(response))
}

/// `POST /api/redis/scan`: admit and start an asynchronous cluster scan.
pub async fn scan(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<ScanRequest>,
) -> Result<Json<Value>, ApiError> {
    validate_kv_cloud(&state, &request.cloud)?;
    kv_policy::validate_pattern(&request.pattern).map_err(ApiError::Forbidden)?;

    // Deleting is a write; READER stays read-only here as everywhere.
    if request.action == ScanAction::Delete && auth.role == Role::Reader {
        return Err(ApiError::Forbidden(
            "role READER may not delete keys".into(),
        ));
    }

    let id = Uuid::new_v4().to_string();
    state
        .store
        .init(&id, Some(&auth.user_id), ExecutionKind::Scan)
        .await?;
    info!(
        execution_id = %id,
        user_id = %auth.user_id,
        pattern = %request.pattern,
        action = ?request.action,
        "Scan admitted"
    );

    let executor = state.scan.clone();
    let execution_id = id.clone();
    tokio::spawn(async move {
        executor.execute(execution_id, request).await;
    });

    Ok(Json(json!({ "executionId": id })))
}

/// `GET /api/redis/scan/{id}`: current scan record.
pub async fn scan_status(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    let record = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("scan '{}' not found", id)))?;
    Ok(Json(record))
}

/// `POST /api/redis/scan/{id}/cancel`: initiate scan cancellation.
pub async fn scan_cancel(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("scan '{}' not found", id)))?;
    if auth.role != Role::Master && record.user_id.as_deref() != Some(auth.user_id.as_str()) {
        return Err(ApiError::Forbidden(
            "only MASTER may cancel another user's scan".into(),
        ));
    }
    state.scan.cancel(&id).await?;
    info!(execution_id = %id, user_id = %auth.user_id, "Scan cancellation initiated");
    Ok(Json(json!({ "success": true })))
}
