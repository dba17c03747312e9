// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller identity and the password re-authentication seam.
//!
//! Session authentication itself lives outside this service; the fronting
//! auth layer injects the caller's identity as `x-user-id` / `x-user-role`
//! headers. Dangerous-verb batches additionally require a verified password
//! through [`PasswordVerifier`], which in production points at the external
//! auth store.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use polydb_core::policy::Role;

use crate::error::ApiError;

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the authenticated role.
pub const ROLE_HEADER: &str = "x-user-role";

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Authenticated user id.
    pub user_id: String,
    /// Authenticated role.
    pub role: Role,
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("missing user identity".into()))?
            .to_string();
        let role = parts
            .headers
            .get(ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(Role::parse)
            .ok_or_else(|| ApiError::Unauthorized("missing or unknown role".into()))?;
        Ok(Self { user_id, role })
    }
}

/// Verifies the caller's password for dangerous-verb re-authentication.
#[async_trait]
pub trait PasswordVerifier: Send + Sync {
    /// Whether the password is valid for the user.
    async fn verify(&self, user_id: &str, password: &str) -> bool;
}

/// Development stand-in for the external auth store: one shared password
/// from `POLYDB_REAUTH_PASSWORD`. With no password configured every
/// verification fails, so dangerous verbs cannot run.
pub struct EnvPasswordVerifier {
    password: Option<String>,
}

impl EnvPasswordVerifier {
    /// Read the shared password from the environment.
    pub fn from_env() -> Self {
        Self {
            password: std::env::var("POLYDB_REAUTH_PASSWORD")
                .ok()
                .filter(|p| !p.is_empty()),
        }
    }

    /// Build with an explicit password (tests, embedded use).
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }
}

#[async_trait]
impl PasswordVerifier for EnvPasswordVerifier {
    async fn verify(&self, _user_id: &str, password: &str) -> bool {
        self.password.as_deref() == Some(password)
    }
}
