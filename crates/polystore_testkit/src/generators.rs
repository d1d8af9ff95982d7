//! Property-based test generators using proptest.
//!
//! Record and query strategies target the `customer`/`total`/`status`
//! shape shared by [`crate::fixtures::order_schema`] and
//! [`crate::fixtures::order_row_schema`], so one generated workload can be
//! replayed against both storage families.

use polystore_codec::Value;
use polystore_core::{Operator, OrderBy, Predicate, QuerySpec, Record};
use proptest::prelude::*;

static CUSTOMERS: [&str; 4] = ["ann", "bob", "carla", "dmitri"];
static STATUSES: [&str; 3] = ["open", "paid", "void"];

/// Strategy for scalar values (no arrays or maps).
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        "[a-z%_\\\\]{0,8}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
    ]
}

/// Strategy for arbitrary values, nested up to three levels.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    scalar_strategy().prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(Value::text_map),
        ]
    })
}

/// Strategy for a payload of `min..max` bytes, for overflow tests.
pub fn payload_strategy(min: usize, max: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), min..max)
}

fn customer() -> impl Strategy<Value = &'static str> {
    prop::sample::select(&CUSTOMERS[..])
}

fn status() -> impl Strategy<Value = &'static str> {
    prop::sample::select(&STATUSES[..])
}

/// Strategy for order-shaped user fields. `total` and `status` may be
/// missing.
pub fn order_fields_strategy() -> impl Strategy<Value = Record> {
    (
        customer(),
        prop::option::of(0i64..100),
        prop::option::of(status()),
    )
        .prop_map(|(customer, total, status)| {
            let mut record = Record::new().with("customer", customer);
            if let Some(total) = total {
                record.set("total", total);
            }
            if let Some(status) = status {
                record.set("status", status);
            }
            record
        })
}

/// Strategy for a predicate over order-shaped fields with a well-typed
/// operand.
pub fn order_predicate_strategy() -> impl Strategy<Value = Predicate> {
    let on_customer = (
        prop::sample::select(vec![
            Operator::Eq,
            Operator::Ne,
            Operator::Gt,
            Operator::Lte,
            Operator::Contains,
            Operator::StartsWith,
            Operator::EndsWith,
        ]),
        "[a-d]{1,2}",
    )
        .prop_map(|(op, text)| Predicate::new("customer", op, text));
    let customer_in = prop::collection::vec(customer(), 0..3)
        .prop_map(|names| Predicate::new("customer", Operator::In, names));
    let on_total = (
        prop::sample::select(vec![
            Operator::Eq,
            Operator::Ne,
            Operator::Gt,
            Operator::Gte,
            Operator::Lt,
            Operator::Lte,
        ]),
        0i64..100,
    )
        .prop_map(|(op, n)| Predicate::new("total", op, n));
    let total_null = prop::sample::select(vec![Operator::Eq, Operator::Ne])
        .prop_map(|op| Predicate::new("total", op, Value::Null));
    let on_status = (
        prop::sample::select(vec![Operator::Eq, Operator::Ne, Operator::NotIn]),
        status(),
    )
        .prop_map(|(op, s)| match op {
            Operator::NotIn => Predicate::new("status", op, vec![s]),
            _ => Predicate::new("status", op, s),
        });

    prop_oneof![on_customer, customer_in, on_total, total_null, on_status]
}

/// Strategy for a filtered, optionally ordered query over order-shaped
/// fields. Ordering always ends with `id` so results are comparable.
pub fn order_spec_strategy() -> impl Strategy<Value = QuerySpec> {
    (
        prop::collection::vec(order_predicate_strategy(), 0..3),
        prop::option::of((prop::sample::select(vec!["total", "status", "customer"]), any::<bool>())),
    )
        .prop_map(|(predicates, order)| {
            let mut spec = predicates
                .into_iter()
                .fold(QuerySpec::new(), QuerySpec::predicate);
            if let Some((field, ascending)) = order {
                spec = spec.order_by(if ascending {
                    OrderBy::asc(field)
                } else {
                    OrderBy::desc(field)
                });
            }
            spec.order_by(OrderBy::asc("id"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use polystore_codec::{decode_canonical, encode_canonical};

    proptest! {
        #[test]
        fn generated_values_survive_the_codec(value in value_strategy()) {
            let bytes = encode_canonical(&value);
            prop_assert_eq!(decode_canonical(&bytes).unwrap(), value);
        }

        #[test]
        fn order_fields_always_name_a_customer(record in order_fields_strategy()) {
            prop_assert!(record.get("customer").and_then(Value::as_text).is_some());
        }

        #[test]
        fn specs_end_with_id(spec in order_spec_strategy()) {
            prop_assert_eq!(spec.order().last(), Some(&OrderBy::asc("id")));
        }
    }
}
