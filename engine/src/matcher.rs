//! In-process filter evaluation: the native query engine of the document
//! backend.
//!
//! Semantics follow the document-database conventions: `$eq` against an
//! array field matches containment, `null` equality matches missing fields,
//! and ordering comparisons never match across types.

use serde_json::Value;
use std::cmp::Ordering;

use crate::document::{get_path, Document};
use crate::query::{Filter, Predicate, SortDirection};

/// Evaluate a filter against a document.
pub fn matches(filter: &Filter, doc: &Document) -> bool {
    match filter {
        Filter::And(children) => children.iter().all(|child| matches(child, doc)),
        Filter::Or(children) => children.iter().any(|child| matches(child, doc)),
        Filter::Field { path, predicate } => matches_predicate(predicate, get_path(doc, path)),
    }
}

fn matches_predicate(predicate: &Predicate, value: Option<&Value>) -> bool {
    match predicate {
        Predicate::Eq(expected) => eq_matches(expected, value),
        Predicate::Ne(expected) => !eq_matches(expected, value),
        Predicate::Gt(bound) => ordered(value, bound, &[Ordering::Greater]),
        Predicate::Gte(bound) => ordered(value, bound, &[Ordering::Greater, Ordering::Equal]),
        Predicate::Lt(bound) => ordered(value, bound, &[Ordering::Less]),
        Predicate::Lte(bound) => ordered(value, bound, &[Ordering::Less, Ordering::Equal]),
        Predicate::In(list) => list.iter().any(|candidate| eq_matches(candidate, value)),
        Predicate::Nin(list) => !list.iter().any(|candidate| eq_matches(candidate, value)),
        Predicate::Exists(expected) => value.is_some() == *expected,
        Predicate::Regex(pattern) => regex_matches(pattern, value),
    }
}

/// `$eq` semantics: direct equality, `null` matching missing, and
/// containment when the stored value is an array.
fn eq_matches(expected: &Value, value: Option<&Value>) -> bool {
    let value = value.unwrap_or(&Value::Null);
    if values_equal(expected, value) {
        return true;
    }
    if let Value::Array(items) = value {
        if !expected.is_array() {
            return items.iter().any(|item| values_equal(expected, item));
        }
    }
    false
}

fn ordered(value: Option<&Value>, bound: &Value, accept: &[Ordering]) -> bool {
    let Some(value) = value else {
        return false;
    };
    compare_values(value, bound).is_some_and(|ordering| accept.contains(&ordering))
}

fn regex_matches(pattern: &str, value: Option<&Value>) -> bool {
    let Some(Value::String(s)) = value else {
        return false;
    };
    // Patterns are validated at parse time; a failure here means the filter
    // was built by hand, and the predicate simply does not match.
    regex::Regex::new(pattern)
        .map(|re| re.is_match(s))
        .unwrap_or(false)
}

/// Equality with numeric cross-type tolerance (`1` equals `1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x == y || x.as_f64().zip(y.as_f64()).is_some_and(|(x, y)| x == y)
        }
        _ => a == b,
    }
}

/// Total-enough ordering for scalar values.
///
/// Numbers compare numerically, strings (including ISO-8601 dates)
/// lexicographically, booleans false-before-true. Cross-type comparisons
/// and composites return `None`.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Sort documents in place by an ordered sort spec.
///
/// Missing fields sort as `null`, before every present value; ties keep the
/// incoming order (stable sort).
pub fn sort_documents(docs: &mut [Document], sort: &[(String, SortDirection)]) {
    if sort.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for (field, direction) in sort {
            let left = get_path(a, field).unwrap_or(&Value::Null);
            let right = get_path(b, field).unwrap_or(&Value::Null);
            let ordering = match (left, right) {
                (Value::Null, Value::Null) => Ordering::Equal,
                (Value::Null, _) => Ordering::Less,
                (_, Value::Null) => Ordering::Greater,
                _ => compare_values(left, right).unwrap_or(Ordering::Equal),
            };
            let ordering = match direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}
