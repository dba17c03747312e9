// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Policy engine: role-based admission for SQL batches and KV commands.
//!
//! Everything in this module is synchronous and side-effect-free. A request
//! is classified, checked against the role matrix, and either admitted
//! (possibly with a password re-authentication requirement) or denied with
//! a reason naming the offending category. Denials happen before any
//! execution record exists.

pub mod redis;
pub mod sql;

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub use self::sql::{StatementCategory, classify_sql, classify_statement, split_statements, strip_comments};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

/// Operator role, assigned by the external auth subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    /// Full control, subject to password re-auth for dangerous statements.
    Master,
    /// Read and bounded writes.
    User,
    /// Read only.
    Reader,
}

impl Role {
    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "MASTER",
            Self::User => "USER",
            Self::Reader => "READER",
        }
    }

    /// Parse a role from its wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MASTER" => Some(Self::Master),
            "USER" => Some(Self::User),
            "READER" => Some(Self::Reader),
            _ => None,
        }
    }
}

/// Outcome of a policy check. Derived purely from (role, categories).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// MASTER must re-authenticate with a password before this batch runs.
    #[serde(rename = "requiresPasswordReauth")]
    pub requires_password_reauth: bool,
    /// Denial reason, naming the offending category or command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PolicyDecision {
    /// An unconditional allow.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            requires_password_reauth: false,
            reason: None,
        }
    }

    /// An allow that requires password re-authentication first.
    pub fn allow_with_reauth() -> Self {
        Self {
            allowed: true,
            requires_password_reauth: true,
            reason: None,
        }
    }

    /// A denial with a reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            requires_password_reauth: false,
            reason: Some(reason.into()),
        }
    }
}

/// Apply the role × category matrix to a classified batch.
///
/// If any statement falls in a denied category the whole batch is denied.
/// If any admitted statement is dangerous under MASTER, the decision carries
/// `requires_password_reauth`.
pub fn authorize(role: Role, categories: &[StatementCategory]) -> PolicyDecision {
    let mut needs_reauth = false;
    for category in categories {
        let allowed = match (role, category) {
            (_, StatementCategory::BlockedSystem) => false,
            (Role::Reader, StatementCategory::Select) => true,
            (Role::Reader, _) => false,
            (Role::User, c) if c.is_dangerous() => false,
            (Role::User, _) => true,
            (Role::Master, _) => true,
        };
        if !allowed {
            return PolicyDecision::deny(format!(
                "role {} may not execute {} statements",
                role.as_str(),
                category.as_str()
            ));
        }
        if role == Role::Master && category.is_dangerous() {
            needs_reauth = true;
        }
    }
    if needs_reauth {
        PolicyDecision::allow_with_reauth()
    } else {
        PolicyDecision::allow()
    }
}

/// Validate a schema, publication, or subscription identifier.
///
/// Identifiers are interpolated into `SET search_path` and administrative
/// statements, so anything outside `^[A-Za-z_][A-Za-z0-9_]*$` is refused.
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}
