// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! polydb Core - Multi-Cloud Fan-Out Execution Engine
//!
//! This crate executes operator-supplied workloads - free-form SQL batches
//! and structured key-value commands - in parallel against independently
//! managed database and cache clusters, with role-based admission,
//! pollable execution records, and cooperative cancellation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Operator UI / HTTP API                       │
//! │                           (polydb-server)                           │
//! └─────────────────────────────────────────────────────────────────────┘
//!            │ admit                    │ poll / cancel
//!            ▼                          ▼
//! ┌───────────────────┐      ┌─────────────────────────────────────────┐
//! │   Policy Engine   │      │           Execution Store               │
//! │ classify/authorize│      │  (shared Redis, memory tier in dev)     │
//! └───────────────────┘      └─────────────────────────────────────────┘
//!            │ dispatch                 ▲ progress / results
//!            ▼                          │
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      Fan-Out Executors                              │
//! │     SQL (per-target clients)    SCAN/UNLINK (per-master cursors)    │
//! └─────────────────────────────────────────────────────────────────────┘
//!            │
//!            ▼
//! ┌───────────────────┐
//! │   Pool Registry   │  lazy PgPool per (cloud, database),
//! │                   │  lazy cluster client per KV cloud
//! └───────────────────┘
//! ```
//!
//! # Execution lifecycle
//!
//! | Step | Where |
//! |------|-------|
//! | Classify + authorize (+ password re-auth for dangerous verbs) | [`policy`] |
//! | Allocate execution id, init record | [`store`] |
//! | Fan out asynchronously, flush progress and partial results | [`executor`] |
//! | Poll `status`, cancel via flag + engine-side session cancel | [`store`], [`executor`] |
//!
//! Status transitions are monotone: `running` moves to exactly one of
//! `completed`, `failed`, `cancelled`, and `cancelled` sticks.
//!
//! # Modules
//!
//! - [`config`]: cloud topology JSON + environment settings
//! - [`error`]: unified error type with wire error codes
//! - [`executor`]: SQL, SCAN, and KV command fan-out
//! - [`policy`]: statement/command classification and the role matrix
//! - [`registry`]: lazy, reconnecting connection handles per target
//! - [`store`]: cross-replica execution records + replica-local registry
//! - [`types`]: wire and store types

#![deny(missing_docs)]

/// Cloud topology and environment configuration.
pub mod config;

/// Error types for core operations.
pub mod error;

/// Fan-out executors for SQL batches, cluster scans, and KV commands.
pub mod executor;

/// Role-based admission: classification, authorization, sanitisation.
pub mod policy;

/// Lazy connection handles per (cloud, database) and per KV cloud.
pub mod registry;

/// Execution records, shared across replicas, plus the replica-local
/// active-client registry.
pub mod store;

/// Wire and store types.
pub mod types;
