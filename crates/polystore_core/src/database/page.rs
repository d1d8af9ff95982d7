//! Keyset pages and continuation tokens.
//!
//! A token carries the sort-key values of the last row returned and a
//! signature of the ordering they belong to. It never carries an offset,
//! so rows inserted between page requests cannot shift later pages.
//!
//! Wire form: base64url (no padding) of canonical CBOR
//! `{"v": 1, "sig": <hex>, "after": [values...]}`.

use crate::error::{CoreError, CoreResult};
use crate::query::{hex_digest, OrderBy};
use crate::record::{field, Record};
use crate::translate::QueryWarning;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use polystore_codec::{decode_canonical, encode_canonical, Value};

const TOKEN_VERSION: i64 = 1;

/// One page of a keyset-paginated read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Records on this page.
    pub records: Vec<Record>,
    /// Token for the next page; `None` on the last page.
    pub next_token: Option<String>,
    /// Advisories from the backend.
    pub warnings: Vec<QueryWarning>,
}

impl Page {
    /// Returns true if another page follows.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.next_token.is_some()
    }
}

/// Makes `order` total by appending `id` ascending when absent.
pub(crate) fn unique_order(order: &[OrderBy]) -> Vec<OrderBy> {
    let mut order = order.to_vec();
    if !order.iter().any(|o| o.field == field::ID) {
        order.push(OrderBy::asc(field::ID));
    }
    order
}

/// Binds a token to one model and ordering.
pub(crate) fn order_signature(model: &str, order: &[OrderBy]) -> String {
    let value = Value::Array(vec![
        Value::from(model),
        Value::Array(order.iter().map(OrderBy::to_value).collect()),
    ]);
    hex_digest(&encode_canonical(&value))
}

/// Sort-key values of `record` under `order`.
pub(crate) fn sort_key(record: &Record, order: &[OrderBy]) -> Vec<Value> {
    order
        .iter()
        .map(|o| record.get_or_null(&o.field).clone())
        .collect()
}

pub(crate) fn encode_token(signature: &str, after: Vec<Value>) -> String {
    let value = Value::text_map([
        ("v", Value::Integer(TOKEN_VERSION)),
        ("sig", Value::from(signature)),
        ("after", Value::Array(after)),
    ]);
    URL_SAFE_NO_PAD.encode(encode_canonical(&value))
}

/// Decodes a token and checks it was issued for `signature`.
///
/// # Errors
///
/// `InvalidQuery` if the token is malformed, from another version, or
/// from a different model or ordering.
pub(crate) fn decode_token(
    model: &str,
    token: &str,
    signature: &str,
    keys: usize,
) -> CoreResult<Vec<Value>> {
    let invalid = |message: &str| CoreError::invalid_query(model, format!("continuation token {message}"));
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| invalid("is not valid base64url"))?;
    let value = decode_canonical(&bytes).map_err(|_| invalid("does not decode"))?;

    if value.get("v").and_then(Value::as_integer) != Some(TOKEN_VERSION) {
        return Err(invalid("has an unsupported version"));
    }
    if value.get("sig").and_then(Value::as_text) != Some(signature) {
        return Err(invalid("was issued for a different ordering"));
    }
    let after = value
        .get("after")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("lacks sort-key values"))?;
    if after.len() != keys {
        return Err(invalid("has the wrong number of sort-key values"));
    }
    Ok(after.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_appended_once() {
        let order = unique_order(&[OrderBy::desc("age")]);
        assert_eq!(order, vec![OrderBy::desc("age"), OrderBy::asc("id")]);
        let order = unique_order(&[OrderBy::desc("id")]);
        assert_eq!(order, vec![OrderBy::desc("id")]);
    }

    #[test]
    fn token_carries_sort_key() {
        let order = unique_order(&[OrderBy::asc("name")]);
        let sig = order_signature("User", &order);
        let token = encode_token(&sig, vec![Value::from("Ann"), Value::from("u-1")]);
        assert!(!token.contains('='));
        let after = decode_token("User", &token, &sig, 2).unwrap();
        assert_eq!(after, vec![Value::from("Ann"), Value::from("u-1")]);
    }

    #[test]
    fn token_from_other_ordering_is_rejected() {
        let asc = unique_order(&[OrderBy::asc("name")]);
        let desc = unique_order(&[OrderBy::desc("name")]);
        let token = encode_token(&order_signature("User", &asc), vec![Value::Null, Value::from("u")]);
        let err = decode_token("User", &token, &order_signature("User", &desc), 2).unwrap_err();
        assert!(matches!(err, CoreError::InvalidQuery { .. }));
        let err = decode_token("Order", &token, &order_signature("Order", &asc), 2).unwrap_err();
        assert!(matches!(err, CoreError::InvalidQuery { .. }));
    }

    #[test]
    fn garbage_token_is_invalid_query() {
        let sig = order_signature("User", &[OrderBy::asc("id")]);
        assert!(matches!(
            decode_token("User", "not a token!", &sig, 1),
            Err(CoreError::InvalidQuery { .. })
        ));
        let not_cbor = URL_SAFE_NO_PAD.encode([0xff, 0x00]);
        assert!(matches!(
            decode_token("User", &not_cbor, &sig, 1),
            Err(CoreError::InvalidQuery { .. })
        ));
    }
}
