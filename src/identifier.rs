//! Deterministic flat string identifiers for keys.
//!
//! Backends that address records by a single string (remote cache keys,
//! key-value keys) derive that string from the key here. The format is a
//! stable contract; identifiers must be reproducible across restarts.
//!
//! ```text
//! entity / row      table ":" name "_" name "_" ... ":" value "_" value "_" ...
//! value             tag text
//! association       <owner entity id> ":" role ":" table
//! ```
//!
//! The one-letter tag names the value type (`b`ool, `i`nt, `f`loat,
//! `s`tring, `t`imestamp, bytes as he`x`, `n`ull), so `1`, `1.0` and `"1"`
//! never share an identifier. Floats are written as their bit pattern.
//!
//! Every component is escaped so `\`, `_` and `:` inside table names,
//! column names or values cannot be mistaken for separators.

use crate::key::{AssociationKey, EntityKey, RowKey};
use crate::value::Value;

const SECTION_SEPARATOR: char = ':';
const COLUMN_SEPARATOR: char = '_';
const ESCAPE: char = '\\';

fn push_escaped(out: &mut String, component: &str) {
    for c in component.chars() {
        if matches!(c, ESCAPE | SECTION_SEPARATOR | COLUMN_SEPARATOR) {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

fn push_value(out: &mut String, value: &Value) {
    let tag = match value {
        Value::Bool(_) => 'b',
        Value::Int(_) => 'i',
        Value::Float(_) => 'f',
        Value::String(_) => 's',
        Value::Timestamp(_) => 't',
        Value::Bytes(_) => 'x',
        Value::Null => 'n',
    };
    out.push(tag);
    match value {
        Value::Float(v) => out.push_str(&format!("{:016x}", v.to_bits())),
        Value::Null => {}
        other => push_escaped(out, &other.to_key_string()),
    }
}

fn create_id<'a>(
    table: &str,
    names: impl IntoIterator<Item = &'a String>,
    values: impl IntoIterator<Item = &'a Value>,
) -> String {
    let mut id = table_prefix(table);
    for name in names {
        push_escaped(&mut id, name);
        id.push(COLUMN_SEPARATOR);
    }
    id.push(SECTION_SEPARATOR);
    for value in values {
        push_value(&mut id, value);
        id.push(COLUMN_SEPARATOR);
    }
    id
}

/// Prefix shared by every entity or row identifier of `table`.
#[must_use]
pub fn table_prefix(table: &str) -> String {
    let mut prefix = String::with_capacity(table.len() + 1);
    push_escaped(&mut prefix, table);
    prefix.push(SECTION_SEPARATOR);
    prefix
}

#[must_use]
pub fn entity_id(key: &EntityKey) -> String {
    create_id(key.table(), key.column_names(), key.column_values())
}

#[must_use]
pub fn row_id(key: &RowKey) -> String {
    create_id(key.table(), key.column_names(), key.column_values())
}

/// Prefix shared by the identifiers of every association owned by `owner`.
#[must_use]
pub fn owned_association_prefix(owner: &EntityKey) -> String {
    let mut prefix = entity_id(owner);
    prefix.push(SECTION_SEPARATOR);
    prefix
}

#[must_use]
pub fn association_id(key: &AssociationKey) -> String {
    let mut id = owned_association_prefix(key.entity_key());
    push_escaped(&mut id, key.collection_role());
    id.push(SECTION_SEPARATOR);
    push_escaped(&mut id, key.table());
    id
}
