// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP error mapping for the API surface.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use polydb_core::error::CoreError;
use serde_json::json;
use thiserror::Error;

/// API-level error with an HTTP status mapping.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or unsatisfiable request (includes missing password).
    #[error("{0}")]
    BadRequest(String),

    /// Missing auth context or failed password re-authentication.
    #[error("{0}")]
    Unauthorized(String),

    /// Denied by the policy engine.
    #[error("{0}")]
    Forbidden(String),

    /// Unknown or expired execution.
    #[error("{0}")]
    NotFound(String),

    /// Store or engine failure that is not the caller's fault.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match &err {
            CoreError::PolicyViolation(_) | CoreError::BlockedCommand(_) | CoreError::InvalidPattern(_) => {
                Self::Forbidden(err.to_string())
            }
            CoreError::PasswordRequired => Self::BadRequest(err.to_string()),
            CoreError::UnknownCloud(_)
            | CoreError::UnknownDatabase { .. }
            | CoreError::InvalidIdentifier(_)
            | CoreError::Config(_) => Self::BadRequest(err.to_string()),
            CoreError::ExecutionNotFound(_) => Self::NotFound(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(CoreError::PolicyViolation("x".into())).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from(CoreError::PasswordRequired).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(CoreError::UnknownCloud("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(CoreError::ExecutionNotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(CoreError::Other("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
