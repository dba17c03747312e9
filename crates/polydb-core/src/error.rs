// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for polydb-core.

use thiserror::Error;

/// Core errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Configuration loading or validation failed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The request was denied by the policy engine.
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// A dangerous statement requires password re-authentication.
    #[error("Password verification required")]
    PasswordRequired,

    /// The referenced cloud is not declared in configuration.
    #[error("Unknown cloud: {0}")]
    UnknownCloud(String),

    /// The referenced database is not declared for the cloud.
    #[error("Unknown database '{database}' on cloud '{cloud}'")]
    UnknownDatabase {
        /// The cloud that was addressed.
        cloud: String,
        /// The database name that was not found.
        database: String,
    },

    /// An identifier (schema, publication name) failed validation.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The command is on the permanently blocked list.
    #[error("Command '{0}' is blocked")]
    BlockedCommand(String),

    /// A key pattern failed sanitisation (wildcard-only, NUL bytes, length).
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// No execution record exists for the id.
    #[error("Execution '{0}' not found")]
    ExecutionNotFound(String),

    /// An execution record already exists for the id.
    #[error("Execution '{0}' already exists")]
    ExecutionAlreadyExists(String),

    /// SQL engine operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Cache engine operation failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Machine-readable error code for wire responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::PolicyViolation(_) => "POLICY_VIOLATION",
            Self::PasswordRequired => "PASSWORD_REQUIRED",
            Self::UnknownCloud(_) => "UNKNOWN_CLOUD",
            Self::UnknownDatabase { .. } => "UNKNOWN_DATABASE",
            Self::InvalidIdentifier(_) => "INVALID_IDENTIFIER",
            Self::BlockedCommand(_) => "BLOCKED_COMMAND",
            Self::InvalidPattern(_) => "INVALID_PATTERN",
            Self::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            Self::ExecutionAlreadyExists(_) => "EXECUTION_ALREADY_EXISTS",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            CoreError::PolicyViolation("x".into()).error_code(),
            "POLICY_VIOLATION"
        );
        assert_eq!(CoreError::PasswordRequired.error_code(), "PASSWORD_REQUIRED");
        assert_eq!(
            CoreError::BlockedCommand("FLUSHALL".into()).error_code(),
            "BLOCKED_COMMAND"
        );
    }

    #[test]
    fn test_unknown_database_display() {
        let err = CoreError::UnknownDatabase {
            cloud: "east".to_string(),
            database: "orders".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown database 'orders' on cloud 'east'");
    }
}
