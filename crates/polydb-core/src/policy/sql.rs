// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQL statement splitting and leading-verb classification.
//!
//! Statements pass through to the engines verbatim after admission, so the
//! lexer here only needs to be precise about three things: where comments
//! end, where quoted regions end, and where top-level `;` boundaries are.
//! Categorisation is leading-verb pattern matching on the comment-stripped
//! text; it never inspects expression internals.

use serde::{Deserialize, Serialize};

/// Category of a single SQL statement, inferred from its leading verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatementCategory {
    /// Read-only: SELECT, EXPLAIN, SHOW, WITH … SELECT.
    Select,
    /// Bounded writes: INSERT, UPDATE … WHERE.
    Write,
    /// Additive DDL: CREATE TABLE/INDEX, ALTER TABLE … ADD ….
    DdlSafe,
    /// Destructive DDL: DROP TABLE/INDEX/VIEW, non-additive ALTER.
    DdlDestructive,
    /// Destructive DML: DELETE, TRUNCATE.
    DmlDestructive,
    /// UPDATE with no WHERE clause.
    DmlUnboundedUpdate,
    /// System-level statements nobody may run through the control plane.
    BlockedSystem,
    /// BEGIN, START TRANSACTION, COMMIT, ROLLBACK, SAVEPOINT.
    TransactionControl,
}

impl StatementCategory {
    /// Wire name of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Write => "write",
            Self::DdlSafe => "ddl-safe",
            Self::DdlDestructive => "ddl-destructive",
            Self::DmlDestructive => "dml-destructive",
            Self::DmlUnboundedUpdate => "dml-unbounded-update",
            Self::BlockedSystem => "blocked-system",
            Self::TransactionControl => "transaction-control",
        }
    }

    /// Whether statements of this category imply irreversible data change
    /// and therefore require password re-authentication for MASTER.
    pub fn is_dangerous(&self) -> bool {
        matches!(
            self,
            Self::DdlDestructive | Self::DmlDestructive | Self::DmlUnboundedUpdate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LexState {
    Normal,
    LineComment,
    /// Block comments nest in PostgreSQL.
    BlockComment(u32),
    SingleQuote,
    DoubleQuote,
}

/// Strip `--` line comments and (nested) `/* */` block comments, honouring
/// single/double-quoted strings and dollar-quoted bodies. Comments are
/// replaced by a single space so adjacent tokens stay separated.
pub fn strip_comments(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut state = LexState::Normal;
    let mut dollar_tag: Option<String> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if let Some(tag) = dollar_tag.clone() {
            out.push(c);
            if c == '$' && matches_tag(&chars, i, &tag) {
                for _ in 0..tag.len() + 1 {
                    i += 1;
                    if i < chars.len() {
                        out.push(chars[i]);
                    }
                }
                dollar_tag = None;
            }
            i += 1;
            continue;
        }
        match state {
            LexState::Normal => match c {
                '-' if chars.get(i + 1) == Some(&'-') => {
                    state = LexState::LineComment;
                    i += 2;
                    continue;
                }
                '/' if chars.get(i + 1) == Some(&'*') => {
                    state = LexState::BlockComment(1);
                    i += 2;
                    continue;
                }
                '\'' => {
                    state = LexState::SingleQuote;
                    out.push(c);
                }
                '"' => {
                    state = LexState::DoubleQuote;
                    out.push(c);
                }
                '$' => {
                    if let Some(tag) = dollar_tag_at(&chars, i) {
                        out.push(c);
                        for k in 0..tag.len() + 1 {
                            out.push(chars[i + 1 + k]);
                        }
                        i += tag.len() + 2;
                        dollar_tag = Some(tag);
                        continue;
                    }
                    out.push(c);
                }
                _ => out.push(c),
            },
            LexState::LineComment => {
                if c == '\n' {
                    out.push(' ');
                    out.push('\n');
                    state = LexState::Normal;
                }
            }
            LexState::BlockComment(depth) => {
                if c == '*' && chars.get(i + 1) == Some(&'/') {
                    i += 2;
                    if depth == 1 {
                        out.push(' ');
                        state = LexState::Normal;
                    } else {
                        state = LexState::BlockComment(depth - 1);
                    }
                    continue;
                }
                if c == '/' && chars.get(i + 1) == Some(&'*') {
                    state = LexState::BlockComment(depth + 1);
                    i += 2;
                    continue;
                }
            }
            LexState::SingleQuote => {
                out.push(c);
                if c == '\'' {
                    // '' is an escaped quote, not a terminator
                    if chars.get(i + 1) == Some(&'\'') {
                        out.push('\'');
                        i += 1;
                    } else {
                        state = LexState::Normal;
                    }
                }
            }
            LexState::DoubleQuote => {
                out.push(c);
                if c == '"' {
                    state = LexState::Normal;
                }
            }
        }
        i += 1;
    }
    out
}

/// Split a batch into individual statements on top-level `;`, honouring
/// quoted strings and dollar-quoted bodies. Comments are stripped first,
/// so classification is unaffected by them. Empty fragments are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let stripped = strip_comments(sql);
    let chars: Vec<char> = stripped.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = LexState::Normal;
    let mut dollar_tag: Option<String> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if let Some(tag) = dollar_tag.clone() {
            current.push(c);
            if c == '$' && matches_tag(&chars, i, &tag) {
                for _ in 0..tag.len() + 1 {
                    i += 1;
                    if i < chars.len() {
                        current.push(chars[i]);
                    }
                }
                dollar_tag = None;
            }
            i += 1;
            continue;
        }
        match state {
            LexState::Normal => match c {
                ';' => {
                    let stmt = current.trim();
                    if !stmt.is_empty() {
                        statements.push(stmt.to_string());
                    }
                    current.clear();
                }
                '\'' => {
                    state = LexState::SingleQuote;
                    current.push(c);
                }
                '"' => {
                    state = LexState::DoubleQuote;
                    current.push(c);
                }
                '$' => {
                    if let Some(tag) = dollar_tag_at(&chars, i) {
                        current.push(c);
                        for k in 0..tag.len() + 1 {
                            current.push(chars[i + 1 + k]);
                        }
                        i += tag.len() + 2;
                        dollar_tag = Some(tag);
                        continue;
                    }
                    current.push(c);
                }
                _ => current.push(c),
            },
            LexState::SingleQuote => {
                current.push(c);
                if c == '\'' {
                    if chars.get(i + 1) == Some(&'\'') {
                        current.push('\'');
                        i += 1;
                    } else {
                        state = LexState::Normal;
                    }
                }
            }
            LexState::DoubleQuote => {
                current.push(c);
                if c == '"' {
                    state = LexState::Normal;
                }
            }
            // comments were already removed
            LexState::LineComment | LexState::BlockComment(_) => unreachable!(),
        }
        i += 1;
    }
    let stmt = current.trim();
    if !stmt.is_empty() {
        statements.push(stmt.to_string());
    }
    statements
}

/// If position `i` (a `$`) opens a dollar quote, return its tag.
///
/// A valid opener is `$tag$` where the tag is empty or an identifier-like
/// run not starting with a digit (`$1` is a positional parameter).
fn dollar_tag_at(chars: &[char], i: usize) -> Option<String> {
    let mut tag = String::new();
    let mut j = i + 1;
    while j < chars.len() {
        let c = chars[j];
        if c == '$' {
            if tag.chars().next().is_some_and(|f| f.is_ascii_digit()) {
                return None;
            }
            return Some(tag);
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            tag.push(c);
            j += 1;
        } else {
            return None;
        }
    }
    None
}

/// Whether `chars[i..]` is `$tag$` for the given tag.
fn matches_tag(chars: &[char], i: usize, tag: &str) -> bool {
    let closer: Vec<char> = format!("${}$", tag).chars().collect();
    chars.len() >= i + closer.len() && chars[i..i + closer.len()] == closer[..]
}

/// Classify every statement of a batch. Comments never affect the result.
pub fn classify_sql(sql: &str) -> Vec<StatementCategory> {
    split_statements(sql)
        .iter()
        .map(|s| classify_statement(s))
        .collect()
}

/// Classify one comment-free statement by its leading verb.
pub fn classify_statement(stmt: &str) -> StatementCategory {
    let words: Vec<String> = stmt
        .split_whitespace()
        .take(8)
        .map(|w| w.trim_matches('(').to_ascii_uppercase())
        .collect();
    let first = words.first().map(String::as_str).unwrap_or("");

    match first {
        "SELECT" | "EXPLAIN" | "SHOW" | "TABLE" => StatementCategory::Select,
        "WITH" => classify_with(stmt),
        "INSERT" => StatementCategory::Write,
        "UPDATE" => {
            if has_top_level_keyword(stmt, "WHERE") {
                StatementCategory::Write
            } else {
                StatementCategory::DmlUnboundedUpdate
            }
        }
        "DELETE" | "TRUNCATE" => StatementCategory::DmlDestructive,
        "CREATE" => match object_word(&words) {
            "DATABASE" | "SCHEMA" | "ROLE" | "USER" => StatementCategory::BlockedSystem,
            _ => StatementCategory::DdlSafe,
        },
        "DROP" => match object_word(&words) {
            "DATABASE" | "SCHEMA" | "ROLE" | "USER" => StatementCategory::BlockedSystem,
            _ => StatementCategory::DdlDestructive,
        },
        "ALTER" => match object_word(&words) {
            "ROLE" | "USER" => StatementCategory::BlockedSystem,
            "TABLE" if is_additive_alter(stmt) => StatementCategory::DdlSafe,
            _ => StatementCategory::DdlDestructive,
        },
        "GRANT" | "REVOKE" => StatementCategory::BlockedSystem,
        "BEGIN" | "START" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "END" => {
            StatementCategory::TransactionControl
        }
        _ => StatementCategory::Write,
    }
}

/// `WITH` classifies by the first top-level data verb after the CTEs, so a
/// writable CTE cannot masquerade as a read.
fn classify_with(stmt: &str) -> StatementCategory {
    let stripped = stmt.to_ascii_uppercase();
    for (idx, word) in top_level_words(&stripped) {
        match word {
            "INSERT" => return StatementCategory::Write,
            "DELETE" => return StatementCategory::DmlDestructive,
            "UPDATE" => {
                let rest = &stmt[idx..];
                return if has_top_level_keyword(rest, "WHERE") {
                    StatementCategory::Write
                } else {
                    StatementCategory::DmlUnboundedUpdate
                };
            }
            "SELECT" => return StatementCategory::Select,
            _ => {}
        }
    }
    StatementCategory::Select
}

/// Words at paren-depth zero, outside quoted regions, with byte offsets.
fn top_level_words(upper: &str) -> Vec<(usize, &str)> {
    let bytes = upper.as_bytes();
    let mut items = Vec::new();
    let mut depth = 0i32;
    let mut i = 0;
    let mut in_single = false;
    let mut in_double = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_single {
            if c == '\'' {
                in_single = false;
            }
            i += 1;
            continue;
        }
        if in_double {
            if c == '"' {
                in_double = false;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' => in_single = true,
            '"' => in_double = true,
            '(' => depth += 1,
            ')' => depth -= 1,
            _ if depth == 0 && (c.is_ascii_alphabetic() || c == '_') => {
                let start = i;
                while i < bytes.len() {
                    let w = bytes[i] as char;
                    if w.is_ascii_alphanumeric() || w == '_' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                items.push((start, &upper[start..i]));
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    items
}

/// Whether the keyword appears at paren-depth zero outside quotes.
fn has_top_level_keyword(stmt: &str, keyword: &str) -> bool {
    let upper = stmt.to_ascii_uppercase();
    top_level_words(&upper).iter().any(|(_, w)| *w == keyword)
}

/// First object word after the verb, skipping modifiers like `OR REPLACE`,
/// `UNIQUE`, `IF NOT EXISTS`, `TEMP`.
fn object_word(words: &[String]) -> &str {
    const MODIFIERS: &[&str] = &[
        "OR",
        "REPLACE",
        "UNIQUE",
        "TEMP",
        "TEMPORARY",
        "UNLOGGED",
        "CONCURRENTLY",
        "IF",
        "NOT",
        "EXISTS",
        "MATERIALIZED",
        "FOREIGN",
    ];
    words
        .iter()
        .skip(1)
        .map(String::as_str)
        .find(|w| !MODIFIERS.contains(w))
        .unwrap_or("")
}

/// `ALTER TABLE … ADD (COLUMN | CONSTRAINT | INDEX)` is the additive form;
/// everything else under ALTER is destructive.
fn is_additive_alter(stmt: &str) -> bool {
    let upper = stmt.to_ascii_uppercase();
    let words = top_level_words(&upper);
    words
        .windows(2)
        .any(|pair| pair[0].1 == "ADD" && matches!(pair[1].1, "COLUMN" | "CONSTRAINT" | "INDEX"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_line_comments() {
        let sql = "SELECT 1 -- trailing note\nFROM t";
        assert_eq!(strip_comments(sql).split_whitespace().count(), 4);
    }

    #[test]
    fn test_strip_block_comments_nested() {
        let sql = "SELECT /* outer /* inner */ still outer */ 1";
        let stripped = strip_comments(sql);
        assert!(!stripped.contains("inner"));
        assert!(stripped.contains("SELECT"));
        assert!(stripped.contains('1'));
    }

    #[test]
    fn test_comment_markers_inside_strings_kept() {
        let sql = "SELECT '-- not a comment', '/* neither */'";
        let stripped = strip_comments(sql);
        assert!(stripped.contains("-- not a comment"));
        assert!(stripped.contains("/* neither */"));
    }

    #[test]
    fn test_split_on_top_level_semicolons() {
        let stmts = split_statements("SELECT 1; INSERT INTO t VALUES (';'); SELECT 2");
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[1], "INSERT INTO t VALUES (';')");
    }

    #[test]
    fn test_split_honours_dollar_quotes() {
        let sql = "CREATE FUNCTION f() RETURNS void AS $body$ BEGIN; SELECT 1; END $body$ LANGUAGE plpgsql; SELECT 2";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("$body$"));
        assert_eq!(stmts[1], "SELECT 2");
    }

    #[test]
    fn test_positional_param_is_not_a_dollar_quote() {
        let stmts = split_statements("SELECT $1; SELECT $2");
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn test_escaped_single_quote() {
        let stmts = split_statements("SELECT 'it''s; fine'; SELECT 2");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0], "SELECT 'it''s; fine'");
    }

    #[test]
    fn test_classify_select_family() {
        assert_eq!(classify_statement("SELECT * FROM t"), StatementCategory::Select);
        assert_eq!(classify_statement("explain select 1"), StatementCategory::Select);
        assert_eq!(classify_statement("SHOW search_path"), StatementCategory::Select);
        assert_eq!(
            classify_statement("WITH x AS (SELECT 1) SELECT * FROM x"),
            StatementCategory::Select
        );
    }

    #[test]
    fn test_classify_writable_cte() {
        assert_eq!(
            classify_statement("WITH moved AS (SELECT id FROM t) DELETE FROM t WHERE id IN (SELECT id FROM moved)"),
            StatementCategory::DmlDestructive
        );
        assert_eq!(
            classify_statement("WITH src AS (SELECT 1 AS v) INSERT INTO t SELECT v FROM src"),
            StatementCategory::Write
        );
    }

    #[test]
    fn test_classify_update_where_boundary() {
        assert_eq!(
            classify_statement("UPDATE t SET x = 1 WHERE id = 2"),
            StatementCategory::Write
        );
        assert_eq!(
            classify_statement("UPDATE t SET x = 1"),
            StatementCategory::DmlUnboundedUpdate
        );
        // WHERE buried in a subquery does not bound the update
        assert_eq!(
            classify_statement("UPDATE t SET x = (SELECT max(v) FROM u WHERE u.id = 1)"),
            StatementCategory::DmlUnboundedUpdate
        );
    }

    #[test]
    fn test_classify_destructive() {
        assert_eq!(
            classify_statement("DELETE FROM t WHERE id = 1"),
            StatementCategory::DmlDestructive
        );
        assert_eq!(classify_statement("TRUNCATE t"), StatementCategory::DmlDestructive);
        assert_eq!(classify_statement("DROP TABLE t"), StatementCategory::DdlDestructive);
        assert_eq!(
            classify_statement("DROP INDEX CONCURRENTLY idx"),
            StatementCategory::DdlDestructive
        );
        assert_eq!(
            classify_statement("ALTER TABLE t DROP COLUMN c"),
            StatementCategory::DdlDestructive
        );
    }

    #[test]
    fn test_classify_ddl_safe() {
        assert_eq!(
            classify_statement("CREATE TABLE t (id int)"),
            StatementCategory::DdlSafe
        );
        assert_eq!(
            classify_statement("CREATE UNIQUE INDEX idx ON t (id)"),
            StatementCategory::DdlSafe
        );
        assert_eq!(
            classify_statement("ALTER TABLE t ADD COLUMN c text"),
            StatementCategory::DdlSafe
        );
        assert_eq!(
            classify_statement("ALTER TABLE t ADD CONSTRAINT ck CHECK (c > 0)"),
            StatementCategory::DdlSafe
        );
    }

    #[test]
    fn test_classify_blocked_system() {
        for sql in [
            "DROP DATABASE prod",
            "DROP SCHEMA public",
            "CREATE DATABASE scratch",
            "CREATE SCHEMA scratch",
            "GRANT ALL ON t TO joe",
            "REVOKE ALL ON t FROM joe",
            "CREATE ROLE admin",
            "ALTER USER joe PASSWORD 'x'",
            "DROP ROLE admin",
        ] {
            assert_eq!(
                classify_statement(sql),
                StatementCategory::BlockedSystem,
                "{sql}"
            );
        }
    }

    #[test]
    fn test_classify_transaction_control() {
        for sql in ["BEGIN", "START TRANSACTION", "COMMIT", "ROLLBACK", "SAVEPOINT sp"] {
            assert_eq!(
                classify_statement(sql),
                StatementCategory::TransactionControl,
                "{sql}"
            );
        }
    }

    #[test]
    fn test_comments_never_affect_classification() {
        let with_comments =
            "/* audit */ DELETE FROM t -- all rows\n WHERE id = 1; -- done\nSELECT 1";
        let without = strip_comments(with_comments);
        assert_eq!(classify_sql(with_comments), classify_sql(&without));
        assert_eq!(
            classify_sql(with_comments),
            vec![StatementCategory::DmlDestructive, StatementCategory::Select]
        );
    }

    #[test]
    fn test_classification_is_deterministic() {
        let batch = "BEGIN; UPDATE t SET x=1 WHERE id=1; COMMIT;";
        assert_eq!(classify_sql(batch), classify_sql(batch));
    }

    #[test]
    fn test_dangerous_flags() {
        assert!(StatementCategory::DmlDestructive.is_dangerous());
        assert!(StatementCategory::DdlDestructive.is_dangerous());
        assert!(StatementCategory::DmlUnboundedUpdate.is_dangerous());
        assert!(!StatementCategory::Write.is_dangerous());
        assert!(!StatementCategory::Select.is_dangerous());
    }
}
