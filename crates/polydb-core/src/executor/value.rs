// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Decoding of engine values into JSON for the wire.
//!
//! SQL statements are passed through over the simple query protocol, so
//! result values arrive in text format; well-known types are decoded into
//! native JSON values and anything else falls back to its text form.

use serde_json::{Value, json};
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo};

use crate::types::FieldInfo;

/// Column metadata of a result row.
pub fn row_fields(row: &PgRow) -> Vec<FieldInfo> {
    row.columns()
        .iter()
        .map(|col| FieldInfo {
            name: col.name().to_string(),
            data_type: col.type_info().name().to_string(),
        })
        .collect()
}

/// A result row as a JSON object keyed by column name.
pub fn row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::new();
    for (idx, col) in row.columns().iter().enumerate() {
        object.insert(
            col.name().to_string(),
            column_value(row, idx, col.type_info().name()),
        );
    }
    Value::Object(object)
}

fn column_value(row: &PgRow, idx: usize, type_name: &str) -> Value {
    match type_name {
        "BOOL" => decode(row, idx, |v: bool| json!(v)),
        "INT2" => decode(row, idx, |v: i16| json!(v)),
        "INT4" => decode(row, idx, |v: i32| json!(v)),
        "INT8" => decode(row, idx, |v: i64| json!(v)),
        "FLOAT4" => decode(row, idx, |v: f32| json!(v)),
        "FLOAT8" => decode(row, idx, |v: f64| json!(v)),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => decode(row, idx, |v: String| json!(v)),
        "UUID" => decode(row, idx, |v: uuid::Uuid| json!(v.to_string())),
        "JSON" | "JSONB" => decode(row, idx, |v: Value| v),
        "TIMESTAMPTZ" => decode(row, idx, |v: chrono::DateTime<chrono::Utc>| {
            json!(v.to_rfc3339())
        }),
        "TIMESTAMP" => decode(row, idx, |v: chrono::NaiveDateTime| json!(v.to_string())),
        "DATE" => decode(row, idx, |v: chrono::NaiveDate| json!(v.to_string())),
        "TIME" => decode(row, idx, |v: chrono::NaiveTime| json!(v.to_string())),
        _ => text_fallback(row, idx),
    }
}

fn decode<'r, T>(row: &'r PgRow, idx: usize, to_json: impl FnOnce(T) -> Value) -> Value
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    match row.try_get::<Option<T>, _>(idx) {
        Ok(Some(v)) => to_json(v),
        Ok(None) => Value::Null,
        Err(_) => text_fallback(row, idx),
    }
}

/// Simple-protocol values are text on the wire, so an unchecked string
/// decode works for any type the typed arms do not cover.
fn text_fallback(row: &PgRow, idx: usize) -> Value {
    match row.try_get_unchecked::<Option<String>, _>(idx) {
        Ok(Some(v)) => json!(v),
        _ => Value::Null,
    }
}

/// Decode a KV engine reply into JSON.
pub fn redis_value_to_json(value: &redis::Value) -> Value {
    use redis::Value as R;
    match value {
        R::Nil => Value::Null,
        R::Okay => json!("OK"),
        R::Int(i) => json!(i),
        R::Double(d) => json!(d),
        R::Boolean(b) => json!(b),
        R::SimpleString(s) => json!(s),
        R::BulkString(bytes) => json!(String::from_utf8_lossy(bytes).into_owned()),
        R::VerbatimString { text, .. } => json!(text),
        R::Array(items) | R::Set(items) => {
            Value::Array(items.iter().map(redis_value_to_json).collect())
        }
        R::Map(pairs) => {
            let mut object = serde_json::Map::new();
            for (k, v) in pairs {
                let key = match redis_value_to_json(k) {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                object.insert(key, redis_value_to_json(v));
            }
            Value::Object(object)
        }
        other => json!(format!("{:?}", other)),
    }
}
