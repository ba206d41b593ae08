use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Field-to-value mapping of a pending write or a stored document body.
pub type Fields = Map<String, Value>;

/// Key that must never be persisted inside a document body.
pub const ID_FIELD: &str = "id";

/// Strip the identity key and every undefined (`null`) value from a pending write.
///
/// All other keys pass through unchanged. The store assigns identities, so a
/// client-supplied `id` is dropped whether or not it was set.
pub fn sanitize(fields: Fields) -> Fields {
    fields
        .into_iter()
        .filter(|(key, value)| key != ID_FIELD && !value.is_null())
        .collect()
}

/// Serialize a draft or patch into a field mapping, then sanitize it.
pub fn to_fields<T: Serialize>(value: &T) -> Result<Fields> {
    match serde_json::to_value(value) {
        Ok(Value::Object(fields)) => Ok(sanitize(fields)),
        Ok(other) => Err(Error::Validation(format!(
            "expected a record, got {}",
            kind_of(&other)
        ))),
        Err(err) => Err(Error::Validation(err.to_string())),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
