// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! API surface tests: admission, policy rejection, polling, cancellation.
//!
//! Everything here runs against the in-memory execution store and lazy
//! pools, so no live database or cache cluster is needed; the point is the
//! admission path, which must reject before any execution record exists.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use polydb_core::config::{CloudConfig, DatabaseConfig, EnvSettings, KvCloudConfig, SqlCloudConfig};
use polydb_core::store::{ExecutionStore, MemoryStore};
use polydb_core::types::ExecutionKind;
use polydb_server::auth::EnvPasswordVerifier;
use polydb_server::{AppState, router};
use serde_json::{Value, json};
use tower::ServiceExt;

const REAUTH_PASSWORD: &str = "s3cret";

fn test_config() -> CloudConfig {
    CloudConfig {
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
        secondaries: vec![SqlCloudConfig {
            cloud_name: "vega".into(),
            db_configs: vec![DatabaseConfig {
                name: "mydb".into(),
                host: "127.0.0.1".into(),
                port: 5433,
                user: "ops".into(),
                password: "pw".into(),
                database: "mydb".into(),
                schemas: vec!["public".into()],
                default_schema: "public".into(),
            }],
        }],
        kv_clouds: vec![KvCloudConfig {
            cloud_name: "cache-east".into(),
            host: "127.0.0.1".into(),
            port: 7001,
        }],
    }
}

fn test_settings() -> EnvSettings {
    EnvSettings {
        redis_host: None,
        redis_port: 6379,
        redis_cluster_mode: false,
        execution_ttl: std::time::Duration::from_secs(300),
        max_query_timeout: std::time::Duration::from_millis(300_000),
        statement_timeout: std::time::Duration::from_millis(300_000),
        session_ttl: None,
    }
}

fn test_app() -> (Router, Arc<MemoryStore>) {
    let memory = Arc::new(MemoryStore::new());
    let store: Arc<dyn ExecutionStore> = memory.clone();
    let verifier = Arc::new(EnvPasswordVerifier::new(Some(REAUTH_PASSWORD.into())));
    let state = AppState::new(test_config(), store, &test_settings(), verifier);
    (router(state), memory)
}

fn post(uri: &str, role: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-user-id", "u1")
        .header("x-user-role", role)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str, role: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-user-id", "u1")
        .header("x-user-role", role)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn query_body(query: &str) -> Value {
    json!({ "query": query, "database": "mydb", "mode": "both" })
}

#[tokio::test]
async fn test_missing_identity_is_unauthorized() {
    let (app, _) = test_app();
    let request = Request::builder()
        .method("POST")
        .uri("/api/query/execute")
        .header("content-type", "application/json")
        .body(Body::from(query_body("SELECT 1").to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_dangerous_verb_denied_for_user_creates_no_record() {
    let (app, store) = test_app();
    let response = app
        .oneshot(post("/api/query/execute", "USER", query_body("DROP TABLE t;")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert!(store.is_empty(), "no record may exist after a policy denial");
}

#[tokio::test]
async fn test_dangerous_verb_master_without_password() {
    let (app, store) = test_app();
    let response = app
        .oneshot(post(
            "/api/query/execute",
            "MASTER",
            query_body("DELETE FROM t WHERE id=1;"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Password verification required");
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_dangerous_verb_master_wrong_password() {
    let (app, store) = test_app();
    let mut body = query_body("DELETE FROM t WHERE id=1;");
    body["password"] = json!("wrong");
    let response = app
        .oneshot(post("/api/query/execute", "MASTER", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_dangerous_verb_master_with_password_is_admitted() {
    let (app, store) = test_app();
    let mut body = query_body("DELETE FROM t WHERE id=1;");
    body["password"] = json!(REAUTH_PASSWORD);
    let response = app
        .oneshot(post("/api/query/execute", "MASTER", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let id = body["executionId"].as_str().unwrap();
    assert!(store.get(id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_select_admitted_for_reader() {
    let (app, store) = test_app();
    let response = app
        .oneshot(post("/api/query/execute", "READER", query_body("SELECT 1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_unknown_cloud_is_bad_request() {
    let (app, store) = test_app();
    let body = json!({ "query": "SELECT 1", "database": "mydb", "mode": "nowhere" });
    let response = app
        .oneshot(post("/api/query/execute", "MASTER", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_schema_injection_rejected_before_execution() {
    let (app, store) = test_app();
    let mut body = query_body("SELECT 1");
    body["pgSchema"] = json!("public; DROP TABLE x");
    let response = app
        .oneshot(post("/api/query/execute", "MASTER", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_validate_reports_policy_without_executing() {
    let (app, store) = test_app();
    let response = app
        .clone()
        .oneshot(post("/api/query/validate", "USER", query_body("DROP TABLE t;")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["valid"], false);
    assert!(body["error"].as_str().unwrap().contains("ddl-destructive"));

    let response = app
        .oneshot(post("/api/query/validate", "USER", query_body("SELECT 1")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["valid"], true);
    assert!(store.is_empty(), "validate never creates a record");
}

#[tokio::test]
async fn test_status_unknown_is_not_found() {
    let (app, _) = test_app();
    let response = app
        .oneshot(get("/api/query/status/no-such-id", "USER"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_active_starts_empty() {
    let (app, _) = test_app();
    let response = app.oneshot(get("/api/query/active", "USER")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));
}

#[tokio::test]
async fn test_cancel_requires_ownership_or_master() {
    let (app, store) = test_app();
    store
        .init("someone-elses", Some("other-user"), ExecutionKind::Sql)
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(post("/api/query/cancel/someone-elses", "USER", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .oneshot(post("/api/query/cancel/someone-elses", "MASTER", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let record = store.get("someone-elses").await.unwrap().unwrap();
    assert_eq!(record.status, polydb_core::types::ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn test_blocked_kv_command_in_raw_mode() {
    let (app, store) = test_app();
    let body = json!({ "command": "RAW", "args": ["FLUSHALL"], "cloud": "all" });
    let response = app
        .oneshot(post("/api/redis/execute", "MASTER", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("FLUSHALL"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_raw_mode_is_master_only() {
    let (app, _) = test_app();
    let body = json!({ "command": "RAW", "args": ["GET k"], "cloud": "all" });
    let response = app
        .oneshot(post("/api/redis/execute", "USER", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_wildcard_only_scan_pattern_refused_for_master() {
    let (app, store) = test_app();
    let body = json!({ "pattern": "*", "cloud": "all", "action": "preview" });
    let response = app
        .oneshot(post("/api/redis/scan", "MASTER", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_reader_may_not_scan_delete() {
    let (app, store) = test_app();
    let body = json!({ "pattern": "session:*", "cloud": "all", "action": "delete" });
    let response = app
        .oneshot(post("/api/redis/scan", "READER", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_scan_admission_creates_record() {
    let (app, store) = test_app();
    let body = json!({ "pattern": "session:*", "cloud": "cache-east", "action": "preview" });
    let response = app
        .oneshot(post("/api/redis/scan", "USER", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let id = body["executionId"].as_str().unwrap();
    assert!(store.get(id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_health() {
    let (app, _) = test_app();
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
