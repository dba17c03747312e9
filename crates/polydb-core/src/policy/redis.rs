// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! KV command classification and sanitisation.
//!
//! Commands are classed as read, write, or raw passthrough. A fixed blocked
//! set is enforced for every role, RAW mode included: cluster topology and
//! replication admin, scripting, blocking reads, pub/sub, transactions, and
//! connection-state commands never reach a cluster through the control
//! plane.

use std::collections::HashSet;
use std::sync::LazyLock;

use super::{PolicyDecision, Role};

/// Maximum accepted key-pattern length.
pub const MAX_PATTERN_LEN: usize = 500;
/// Maximum accepted RAW command length.
pub const MAX_RAW_LEN: usize = 10_000;

/// Commands rejected for all roles, including RAW mode.
pub static BLOCKED_COMMANDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "FLUSHDB",
        "FLUSHALL",
        "SHUTDOWN",
        "DEBUG",
        "SLAVEOF",
        "REPLICAOF",
        "FAILOVER",
        "CLUSTER",
        "EVAL",
        "EVALSHA",
        "EVAL_RO",
        "EVALSHA_RO",
        "SCRIPT",
        "FUNCTION",
        "FCALL",
        "FCALL_RO",
        "MODULE",
        "MIGRATE",
        "ACL",
        "CONFIG",
        "SUBSCRIBE",
        "PSUBSCRIBE",
        "SSUBSCRIBE",
        "MONITOR",
        "WAIT",
        "WAITAOF",
        "BLPOP",
        "BRPOP",
        "BLMOVE",
        "BRPOPLPUSH",
        "BLMPOP",
        "BZPOPMIN",
        "BZPOPMAX",
        "BZMPOP",
        "SELECT",
        "SWAPDB",
        "MULTI",
        "EXEC",
        "DISCARD",
        "WATCH",
        "UNWATCH",
        "CLIENT",
        "RESET",
        "HELLO",
        "AUTH",
        "QUIT",
        "BGSAVE",
        "BGREWRITEAOF",
        "SAVE",
        "KEYS",
    ]
    .into_iter()
    .collect()
});

static READ_COMMANDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "GET", "MGET", "EXISTS", "TTL", "PTTL", "TYPE", "STRLEN", "HGET", "HGETALL", "HMGET",
        "HLEN", "HKEYS", "HVALS", "LRANGE", "LLEN", "LINDEX", "SMEMBERS", "SISMEMBER", "SCARD",
        "ZRANGE", "ZRANGEBYSCORE", "ZSCORE", "ZCARD", "ZRANK", "GETRANGE", "SCAN", "HSCAN",
        "SSCAN", "ZSCAN", "DUMP", "OBJECT", "MEMORY", "DBSIZE", "RANDOMKEY", "BITCOUNT",
    ]
    .into_iter()
    .collect()
});

/// How a KV command is classed for the role matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Non-mutating command.
    Read,
    /// Mutating command.
    Write,
    /// Permanently disallowed.
    Blocked,
    /// Free-form passthrough, MASTER only.
    Raw,
}

/// Class a single command name (`RAW` is the passthrough marker).
pub fn class_of(command: &str) -> CommandClass {
    let upper = command.to_ascii_uppercase();
    if upper == "RAW" {
        return CommandClass::Raw;
    }
    if BLOCKED_COMMANDS.contains(upper.as_str()) {
        return CommandClass::Blocked;
    }
    if READ_COMMANDS.contains(upper.as_str()) {
        CommandClass::Read
    } else {
        CommandClass::Write
    }
}

/// Admit or refuse a KV command for the caller's role.
///
/// For `RAW`, the first argument is the free-form command line; its verb is
/// checked against the blocked set as well.
pub fn classify_redis(role: Role, command: &str, args: &[String]) -> PolicyDecision {
    if let Some(arg) = args.iter().find(|a| a.contains('\0')) {
        let shown: String = arg.chars().take(32).collect();
        return PolicyDecision::deny(format!("argument contains NUL byte: '{}'", shown));
    }

    match class_of(command) {
        CommandClass::Blocked => {
            PolicyDecision::deny(format!("command '{}' is blocked", command.to_ascii_uppercase()))
        }
        CommandClass::Raw => {
            if role != Role::Master {
                return PolicyDecision::deny(format!(
                    "role {} may not submit RAW commands",
                    role.as_str()
                ));
            }
            let line = args.first().map(String::as_str).unwrap_or("");
            if line.trim().is_empty() {
                return PolicyDecision::deny("empty RAW command");
            }
            if line.len() > MAX_RAW_LEN {
                return PolicyDecision::deny(format!(
                    "RAW command exceeds {} characters",
                    MAX_RAW_LEN
                ));
            }
            let verb = line.split_whitespace().next().unwrap_or("");
            if BLOCKED_COMMANDS.contains(verb.to_ascii_uppercase().as_str()) {
                return PolicyDecision::deny(format!(
                    "command '{}' is blocked",
                    verb.to_ascii_uppercase()
                ));
            }
            PolicyDecision::allow()
        }
        CommandClass::Write => {
            if role == Role::Reader {
                PolicyDecision::deny(format!(
                    "role READER may not execute write command '{}'",
                    command.to_ascii_uppercase()
                ))
            } else {
                PolicyDecision::allow()
            }
        }
        CommandClass::Read => PolicyDecision::allow(),
    }
}

/// Validate a SCAN pattern: wildcard-only patterns are refused for every
/// role (they would enumerate or delete an entire keyspace), as are NUL
/// bytes and oversized patterns.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        return Err("pattern must not be empty".into());
    }
    if matches!(trimmed, "*" | "**" | "?") {
        return Err(format!("wildcard-only pattern '{}' is not allowed", trimmed));
    }
    if trimmed.contains('\0') {
        return Err("pattern contains NUL byte".into());
    }
    if trimmed.len() > MAX_PATTERN_LEN {
        return Err(format!("pattern exceeds {} characters", MAX_PATTERN_LEN));
    }
    Ok(())
}
