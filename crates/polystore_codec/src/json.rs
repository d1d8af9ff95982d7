//! Conversions between [`Value`] and `serde_json::Value`.
//!
//! JSON objects become text-keyed maps. JSON numbers must be integers in
//! the `i64` range; fractional numbers are rejected. Byte strings have no
//! JSON form and are rendered as arrays of integers.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;
use serde_json::Value as Json;

impl TryFrom<Json> for Value {
    type Error = CodecError;

    fn try_from(json: Json) -> CodecResult<Self> {
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => n
                .as_i64()
                .map(Value::Integer)
                .ok_or_else(|| CodecError::unsupported_json(format!("non-integer number {n}")))?,
            Json::String(s) => Value::Text(s),
            Json::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<CodecResult<_>>()?,
            ),
            Json::Object(fields) => Value::map(
                fields
                    .into_iter()
                    .map(|(k, v)| Ok((Value::Text(k), Value::try_from(v)?)))
                    .collect::<CodecResult<_>>()?,
            ),
        })
    }
}

impl From<&Value> for Json {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Integer(n) => Json::from(*n),
            Value::Bytes(b) => Json::Array(b.iter().map(|byte| Json::from(*byte)).collect()),
            Value::Text(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(items.iter().map(Json::from).collect()),
            Value::Map(pairs) => Json::Object(
                pairs
                    .iter()
                    .map(|(k, v)| {
                        let key = match k {
                            Value::Text(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (key, Json::from(v))
                    })
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_becomes_sorted_map() {
        let value = Value::try_from(json!({"name": "Ann", "age": 41, "tags": ["x"]})).unwrap();
        assert_eq!(value.get("name"), Some(&Value::from("Ann")));
        assert_eq!(value.get("age"), Some(&Value::Integer(41)));
        assert_eq!(Json::from(&value), json!({"name": "Ann", "age": 41, "tags": ["x"]}));
    }

    #[test]
    fn fractional_numbers_rejected() {
        assert!(matches!(
            Value::try_from(json!(1.5)),
            Err(CodecError::UnsupportedJson { .. })
        ));
    }
}
