// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! polydb Server - HTTP API over the fan-out execution engine
//!
//! Routes (all JSON, behind the fronting auth layer's identity headers):
//!
//! | Route | Effect |
//! |-------|--------|
//! | `POST /api/query/execute` | Admit a SQL batch, start async fan-out, return `{executionId}` |
//! | `GET /api/query/status/{id}` | Poll the execution record |
//! | `POST /api/query/cancel/{id}` | Initiate cancellation |
//! | `GET /api/query/active` | In-flight executions on this replica |
//! | `POST /api/query/validate` | Policy + splitter only, `{valid, error?}` |
//! | `POST /api/redis/execute` | Synchronous KV command fan-out |
//! | `POST /api/redis/scan` | Admit a cluster scan, return `{executionId}` |
//! | `GET /api/redis/scan/{id}` | Poll the scan record |
//! | `POST /api/redis/scan/{id}/cancel` | Initiate scan cancellation |
//! | `GET /health` | Liveness |

#![deny(missing_docs)]

/// Caller identity extraction and password re-authentication.
pub mod auth;

/// HTTP error mapping.
pub mod error;

/// Route handlers.
pub mod routes;

/// Shared application state.
pub mod state;

use axum::Json;
use axum::Router;
use axum::routing::{get, post};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the API router over the shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/query/execute", post(routes::query::execute))
        .route("/api/query/status/{id}", get(routes::query::status))
        .route("/api/query/cancel/{id}", post(routes::query::cancel))
        .route("/api/query/active", get(routes::query::active))
        .route("/api/query/validate", post(routes::query::validate))
        .route("/api/redis/execute", post(routes::redis::execute))
        .route("/api/redis/scan", post(routes::redis::scan))
        .route("/api/redis/scan/{id}", get(routes::redis::scan_status))
        .route("/api/redis/scan/{id}/cancel", post(routes::redis::scan_cancel))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
