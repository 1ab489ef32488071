//! Encoding of column values as key-value strings.
//!
//! Each column value is stored as its tagged JSON form so the type survives
//! the trip through a string-only server.

use std::collections::HashMap;

use crate::storage::StorageError;
use crate::value::Value;

pub fn encode_value(value: &Value) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

pub fn decode_value(raw: &str) -> Result<Value, StorageError> {
    serde_json::from_str(raw).map_err(|e| {
        StorageError::SerializationError(format!("cannot decode stored value {raw:?}: {e}"))
    })
}

/// Hash fields for a column map, sorted by column name.
pub fn encode_columns(
    columns: &HashMap<String, Value>,
) -> Result<Vec<(String, String)>, StorageError> {
    let mut fields = columns
        .iter()
        .map(|(name, value)| Ok((name.clone(), encode_value(value)?)))
        .collect::<Result<Vec<_>, StorageError>>()?;
    fields.sort_unstable();
    Ok(fields)
}

pub fn decode_columns(
    fields: &HashMap<String, String>,
) -> Result<HashMap<String, Value>, StorageError> {
    fields
        .iter()
        .map(|(name, raw)| Ok((name.clone(), decode_value(raw)?)))
        .collect()
}
