//! Generated schemas and row materialisation
//!
//! Turns a relation's announced schema into the record schema texts that get
//! registered, and turns text-format tuples into the typed JSON row
//! representation that the encoder writes out.

use crate::errors::{BridgeError, BridgeResult};
use crate::mapper::GENERATED_SCHEMA_NAMESPACE;
use crate::source::parser::{RelationInfo, TupleData, TupleValue};
use crate::types::Oid;
use chrono::DateTime;
use serde_json::{Map, Value, json};

/// Human-readable type name for the oids commonly seen on a stream. Types
/// outside this set are carried as their text representation.
pub fn type_name(type_oid: Oid) -> &'static str {
    match type_oid {
        16 => "boolean",
        17 => "bytea",
        20 => "bigint",
        21 => "smallint",
        23 => "integer",
        25 => "text",
        114 => "json",
        700 => "real",
        701 => "double precision",
        1042 => "character",
        1043 => "character varying",
        1082 => "date",
        1083 => "time",
        1114 => "timestamp",
        1184 => "timestamp with time zone",
        1700 => "numeric",
        2950 => "uuid",
        3802 => "jsonb",
        _ => "text",
    }
}

/// Generates the key and value record schema texts for a relation.
///
/// The value schema covers every column; the key schema covers the replica
/// identity columns and is absent for unkeyed tables. The namespace embeds
/// the PostgreSQL schema name behind the generated prefix, which is what the
/// topic naming rule recovers later.
pub fn generate_schemas(rel: &RelationInfo) -> (Option<String>, String) {
    let value_schema = record_schema(rel, false).to_string();
    let key_schema = if rel.has_key() {
        Some(record_schema(rel, true).to_string())
    } else {
        None
    };
    (key_schema, value_schema)
}

fn record_schema(rel: &RelationInfo, key_only: bool) -> Value {
    let fields: Vec<Value> = rel
        .columns
        .iter()
        .filter(|c| !key_only || c.is_key)
        .map(|c| json!({ "name": c.name, "type": type_name(c.type_oid) }))
        .collect();

    json!({
        "type": "record",
        "name": rel.name,
        "namespace": format!("{GENERATED_SCHEMA_NAMESPACE}.{}", rel.namespace),
        "fields": fields,
    })
}

/// Materialises a full row as self-describing JSON bytes.
///
/// Unchanged TOASTed values are omitted; the consumer falls back to its
/// previous image for those columns.
pub fn row_to_json(rel: &RelationInfo, tuple: &TupleData) -> BridgeResult<Vec<u8>> {
    if tuple.len() != rel.columns.len() {
        return Err(BridgeError::protocol(format!(
            "tuple for relation {} has {} columns, schema has {}",
            rel.relid,
            tuple.len(),
            rel.columns.len()
        )));
    }

    let mut row = Map::new();
    for (column, value) in rel.columns.iter().zip(tuple) {
        match value {
            TupleValue::Null => {
                row.insert(column.name.clone(), Value::Null);
            }
            TupleValue::Unchanged => {}
            TupleValue::Text(text) => {
                row.insert(column.name.clone(), typed_value(column.type_oid, text));
            }
        }
    }
    Ok(Value::Object(row).to_string().into_bytes())
}

/// Materialises the replica identity key of a row as JSON bytes. Returns
/// `None` for unkeyed tables.
pub fn key_to_json(rel: &RelationInfo, tuple: &TupleData) -> BridgeResult<Option<Vec<u8>>> {
    if !rel.has_key() {
        return Ok(None);
    }
    if tuple.len() != rel.columns.len() {
        return Err(BridgeError::protocol(format!(
            "tuple for relation {} has {} columns, schema has {}",
            rel.relid,
            tuple.len(),
            rel.columns.len()
        )));
    }

    let mut key = Map::new();
    for (column, value) in rel.columns.iter().zip(tuple) {
        if !column.is_key {
            continue;
        }
        match value {
            TupleValue::Text(text) => {
                key.insert(column.name.clone(), typed_value(column.type_oid, text));
            }
            TupleValue::Null => {
                key.insert(column.name.clone(), Value::Null);
            }
            TupleValue::Unchanged => {}
        }
    }
    Ok(Some(Value::Object(key).to_string().into_bytes()))
}

/// Converts one text-format column value into its JSON representation based
/// on the column's type oid. Values that fail to parse keep their text form.
fn typed_value(type_oid: Oid, text: &str) -> Value {
    match type_oid {
        16 => match text {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
        20 | 21 | 23 => match text.parse::<i64>() {
            Ok(n) => Value::Number(n.into()),
            Err(_) => Value::String(text.to_string()),
        },
        700 | 701 | 1700 => match text.parse::<f64>().ok().and_then(serde_json::Number::from_f64)
        {
            Some(n) => Value::Number(n),
            None => Value::String(text.to_string()),
        },
        114 | 3802 => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        1184 => match DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
            Ok(ts) => Value::String(ts.to_utc().to_rfc3339()),
            Err(_) => Value::String(text.to_string()),
        },
        _ => Value::String(text.to_string()),
    }
}
