//! In-process evaluation of predicates, ordering and result shaping.
//!
//! Shared by the document adapter's client-side emulation and the
//! in-memory SQL client, so both families agree on semantics: a null or
//! missing field satisfies only `Eq null`, `Ne` and range comparisons
//! against null never match, and nulls sort first ascending.

use super::spec::{Direction, Distinct, KeysetBound, Operator, OrderBy, Predicate, QuerySpec, COUNT_COLUMN};
use crate::record::Record;
use polystore_codec::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Applies `op` with `operand` to a field value (null if missing).
#[must_use]
pub fn compare(field: &Value, op: Operator, operand: &Value) -> bool {
    match op {
        Operator::Eq if operand.is_null() => field.is_null(),
        Operator::Ne if operand.is_null() => !field.is_null(),
        _ if field.is_null() => false,
        Operator::Eq => field == operand,
        Operator::Ne => field != operand,
        Operator::Gt => !operand.is_null() && field.cmp_query(operand) == Ordering::Greater,
        Operator::Gte => !operand.is_null() && field.cmp_query(operand) != Ordering::Less,
        Operator::Lt => !operand.is_null() && field.cmp_query(operand) == Ordering::Less,
        Operator::Lte => !operand.is_null() && field.cmp_query(operand) != Ordering::Greater,
        Operator::In => operand.as_array().is_some_and(|items| items.contains(field)),
        Operator::NotIn => operand.as_array().is_some_and(|items| !items.contains(field)),
        Operator::Contains | Operator::StartsWith | Operator::EndsWith => {
            match (field.to_match_text(), operand.as_text()) {
                (Some(text), Some(needle)) => match op {
                    Operator::Contains => text.contains(needle),
                    Operator::StartsWith => text.starts_with(needle),
                    _ => text.ends_with(needle),
                },
                _ => false,
            }
        }
    }
}

/// Evaluates one predicate against a record.
#[must_use]
pub fn evaluate_predicate(record: &Record, predicate: &Predicate) -> bool {
    compare(record.get_or_null(&predicate.field), predicate.op, &predicate.value)
}

fn compare_by(a: &Record, b: &Record, order: &[OrderBy]) -> Ordering {
    for key in order {
        let ord = a.get_or_null(&key.field).cmp_query(b.get_or_null(&key.field));
        let ord = match key.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Returns true if `record` sorts strictly after the bound.
#[must_use]
pub fn keyset_after(record: &Record, bound: &KeysetBound) -> bool {
    for (key, last) in bound.order.iter().zip(&bound.values) {
        let ord = record.get_or_null(&key.field).cmp_query(last);
        let ord = match key.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        };
        match ord {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }
    }
    false
}

/// Stable sort by `order`.
pub fn sort_rows(rows: &mut [Record], order: &[OrderBy]) {
    if !order.is_empty() {
        rows.sort_by(|a, b| compare_by(a, b, order));
    }
}

/// Post-filter shaping steps, applied in SQL order.
#[derive(Debug, Clone, Copy)]
pub struct ShapeOptions<'a> {
    /// Ordering.
    pub order: &'a [OrderBy],
    /// Duplicate elimination.
    pub distinct: &'a Distinct,
    /// Grouping fields.
    pub group_by: &'a [String],
    /// Projection.
    pub projection: Option<&'a [String]>,
    /// Offset.
    pub skip: Option<u64>,
    /// Limit.
    pub take: Option<u64>,
}

impl<'a> ShapeOptions<'a> {
    /// Shaping steps described by a spec.
    #[must_use]
    pub fn from_spec(spec: &'a QuerySpec) -> Self {
        Self {
            order: spec.order(),
            distinct: spec.distinct_mode(),
            group_by: spec.grouping(),
            projection: spec.projection(),
            skip: spec.skip_count(),
            take: spec.take_count(),
        }
    }
}

fn group_rows(rows: Vec<Record>, group_by: &[String]) -> Vec<Record> {
    let mut index: HashMap<Vec<Value>, usize> = HashMap::new();
    let mut groups: Vec<(Vec<Value>, i64)> = Vec::new();
    for row in &rows {
        let key: Vec<Value> = group_by.iter().map(|f| row.get_or_null(f).clone()).collect();
        match index.get(&key) {
            Some(&slot) => groups[slot].1 += 1,
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, 1));
            }
        }
    }
    groups
        .into_iter()
        .map(|(key, count)| {
            let mut record: Record = group_by.iter().cloned().zip(key).collect();
            record.set(COUNT_COLUMN, count);
            record
        })
        .collect()
}

/// Groups, sorts, deduplicates, pages and projects filtered rows.
#[must_use]
pub fn shape_rows(rows: Vec<Record>, options: &ShapeOptions<'_>) -> Vec<Record> {
    let mut rows = if options.group_by.is_empty() {
        rows
    } else {
        group_rows(rows, options.group_by)
    };
    sort_rows(&mut rows, options.order);

    match options.distinct {
        Distinct::None => {}
        Distinct::All => {
            let mut seen = HashSet::new();
            rows.retain(|row| {
                let visible = options.projection.map_or_else(|| row.clone(), |p| row.project(p));
                seen.insert(visible.to_value())
            });
        }
        Distinct::On(fields) => {
            let mut seen = HashSet::new();
            rows.retain(|row| {
                let key: Vec<Value> = fields.iter().map(|f| row.get_or_null(f).clone()).collect();
                seen.insert(key)
            });
        }
    }

    let skip = options.skip.map_or(0, |n| usize::try_from(n).unwrap_or(usize::MAX));
    let take = options.take.map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX));
    rows.into_iter()
        .skip(skip)
        .take(take)
        .map(|row| match options.projection {
            Some(fields) => row.project(fields),
            None => row,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(name: &str, age: Option<i64>, city: &str) -> Record {
        Record::new()
            .with("name", name)
            .with("age", age)
            .with("city", city)
    }

    #[test]
    fn null_semantics() {
        let row = Record::new().with("a", Value::Null);
        assert!(compare(row.get_or_null("a"), Operator::Eq, &Value::Null));
        assert!(compare(row.get_or_null("missing"), Operator::Eq, &Value::Null));
        assert!(!compare(row.get_or_null("a"), Operator::Ne, &Value::from(1i64)));
        assert!(!compare(row.get_or_null("a"), Operator::Lt, &Value::from(1i64)));
        assert!(!compare(row.get_or_null("a"), Operator::NotIn, &Value::from(vec![1i64])));
    }

    #[test]
    fn operators() {
        let v = Value::from("hello world");
        assert!(compare(&v, Operator::Contains, &Value::from("lo w")));
        assert!(compare(&v, Operator::StartsWith, &Value::from("hell")));
        assert!(compare(&v, Operator::EndsWith, &Value::from("world")));
        assert!(!compare(&v, Operator::Contains, &Value::from("%")));

        let n = Value::Integer(5);
        assert!(compare(&n, Operator::Gte, &Value::Integer(5)));
        assert!(compare(&n, Operator::Gt, &Value::Integer(-5)));
        assert!(compare(&n, Operator::In, &Value::from(vec![1i64, 5])));
        assert!(compare(&n, Operator::NotIn, &Value::from(Vec::<i64>::new())));
        assert!(!compare(&n, Operator::In, &Value::from(Vec::<i64>::new())));
    }

    #[test]
    fn sorting_puts_nulls_first_ascending() {
        let mut rows = vec![
            person("b", Some(30), "x"),
            person("a", None, "x"),
            person("c", Some(20), "x"),
        ];
        sort_rows(&mut rows, &[OrderBy::asc("age")]);
        let names: Vec<_> = rows.iter().map(|r| r.get("name").unwrap().clone()).collect();
        assert_eq!(names, vec![Value::from("a"), Value::from("c"), Value::from("b")]);

        sort_rows(&mut rows, &[OrderBy::desc("age")]);
        assert_eq!(rows[2].get("name"), Some(&Value::from("a")));
    }

    #[test]
    fn keyset_matches_sort_order() {
        let order = vec![OrderBy::desc("age"), OrderBy::asc("name")];
        let bound = KeysetBound {
            order: order.clone(),
            values: vec![Value::Integer(30), Value::from("b")],
        };
        assert!(keyset_after(&person("c", Some(30), "x"), &bound));
        assert!(keyset_after(&person("a", Some(20), "x"), &bound));
        assert!(keyset_after(&person("z", None, "x"), &bound));
        assert!(!keyset_after(&person("b", Some(30), "x"), &bound));
        assert!(!keyset_after(&person("a", Some(30), "x"), &bound));
        assert!(!keyset_after(&person("a", Some(40), "x"), &bound));
    }

    #[test]
    fn grouping_counts_per_key() {
        let rows = vec![
            person("a", Some(1), "Oslo"),
            person("b", Some(2), "Lima"),
            person("c", Some(3), "Oslo"),
        ];
        let group = vec!["city".to_string()];
        let order = vec![OrderBy::desc(COUNT_COLUMN)];
        let shaped = shape_rows(
            rows,
            &ShapeOptions {
                order: &order,
                distinct: &Distinct::None,
                group_by: &group,
                projection: None,
                skip: None,
                take: None,
            },
        );
        assert_eq!(
            shaped,
            vec![
                Record::new().with("city", "Oslo").with("count", 2i64),
                Record::new().with("city", "Lima").with("count", 1i64),
            ]
        );
    }

    #[test]
    fn distinct_variants_and_paging() {
        let rows = vec![
            person("a", Some(1), "Oslo"),
            person("b", Some(2), "Oslo"),
            person("c", Some(3), "Lima"),
        ];
        let order = vec![OrderBy::asc("name")];
        let city = vec!["city".to_string()];

        let all = shape_rows(
            rows.clone(),
            &ShapeOptions {
                order: &order,
                distinct: &Distinct::All,
                group_by: &[],
                projection: Some(&city),
                skip: None,
                take: None,
            },
        );
        assert_eq!(all.len(), 2);

        let on = shape_rows(
            rows,
            &ShapeOptions {
                order: &order,
                distinct: &Distinct::On(city.clone()),
                group_by: &[],
                projection: None,
                skip: Some(1),
                take: Some(5),
            },
        );
        assert_eq!(on, vec![person("c", Some(3), "Lima")]);
    }
}
