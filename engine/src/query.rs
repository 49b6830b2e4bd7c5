//! The query language: a MongoDB-style filter tree plus find options.
//!
//! Wire queries are JSON objects; [`Filter::parse`] turns them into a tree
//! of conjunctions/disjunctions over field predicates. The same tree drives
//! both the in-process matcher and the SQL compiler.

use serde_json::{Map, Value};

use crate::document::Projection;
use crate::error::{Error, Result};

/// A leaf comparison applied to a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(String),
}

/// A recursive filter tree. Sibling field predicates conjoin implicitly.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Field { path: String, predicate: Predicate },
}

impl Filter {
    /// The empty filter, matching every document.
    pub fn empty() -> Filter {
        Filter::And(Vec::new())
    }

    /// Shorthand for an `id` equality filter.
    pub fn by_id(id: &str) -> Filter {
        Filter::Field {
            path: crate::ID_FIELD.to_string(),
            predicate: Predicate::Eq(Value::String(id.to_string())),
        }
    }

    /// Whether this filter matches everything.
    pub fn is_empty(&self) -> bool {
        matches!(self, Filter::And(children) if children.is_empty())
    }

    /// Parse a wire query object into a filter tree.
    ///
    /// A bare value is `$eq`; an object whose keys all start with `$` is a
    /// predicate set; `$and`/`$or` take arrays of sub-queries. Unknown `$`
    /// operators are rejected.
    pub fn parse(value: &Value) -> Result<Filter> {
        match value {
            Value::Null => Ok(Filter::empty()),
            Value::Object(map) => parse_object(map),
            _ => Err(Error::InvalidQuery("query must be an object".into())),
        }
    }
}

fn parse_object(map: &Map<String, Value>) -> Result<Filter> {
    let mut children = Vec::new();

    for (key, value) in map {
        match key.as_str() {
            "$and" => children.push(Filter::And(parse_branch_list(key, value)?)),
            "$or" => children.push(Filter::Or(parse_branch_list(key, value)?)),
            _ if key.starts_with('$') => return Err(Error::UnknownOperator(key.clone())),
            _ => parse_field(key, value, &mut children)?,
        }
    }

    if children.len() == 1 {
        if let Some(only) = children.pop() {
            return Ok(only);
        }
    }
    Ok(Filter::And(children))
}

fn parse_branch_list(op: &str, value: &Value) -> Result<Vec<Filter>> {
    let list = value
        .as_array()
        .ok_or_else(|| Error::InvalidQuery(format!("{op} expects an array")))?;
    list.iter().map(Filter::parse).collect()
}

fn parse_field(path: &str, value: &Value, out: &mut Vec<Filter>) -> Result<()> {
    if let Value::Object(spec) = value {
        let has_ops = spec.keys().any(|k| k.starts_with('$'));
        if has_ops {
            if spec.keys().any(|k| !k.starts_with('$')) {
                return Err(Error::InvalidQuery(format!(
                    "field '{path}' mixes operators and literal keys"
                )));
            }
            for (op, operand) in spec {
                if op == "$options" {
                    // Checked alongside $regex below.
                    continue;
                }
                let predicate = parse_predicate(op, operand, spec)?;
                out.push(Filter::Field {
                    path: path.to_string(),
                    predicate,
                });
            }
            return Ok(());
        }
    }

    out.push(Filter::Field {
        path: path.to_string(),
        predicate: Predicate::Eq(value.clone()),
    });
    Ok(())
}

fn parse_predicate(op: &str, operand: &Value, spec: &Map<String, Value>) -> Result<Predicate> {
    match op {
        "$eq" => Ok(Predicate::Eq(operand.clone())),
        "$ne" => Ok(Predicate::Ne(operand.clone())),
        "$gt" => Ok(Predicate::Gt(operand.clone())),
        "$gte" => Ok(Predicate::Gte(operand.clone())),
        "$lt" => Ok(Predicate::Lt(operand.clone())),
        "$lte" => Ok(Predicate::Lte(operand.clone())),
        "$in" => Ok(Predicate::In(operand_list("$in", operand)?)),
        "$nin" => Ok(Predicate::Nin(operand_list("$nin", operand)?)),
        "$exists" => operand
            .as_bool()
            .map(Predicate::Exists)
            .ok_or_else(|| Error::InvalidQuery("$exists expects a boolean".into())),
        "$regex" => parse_regex(operand, spec),
        other => Err(Error::UnknownOperator(other.to_string())),
    }
}

fn operand_list(op: &str, operand: &Value) -> Result<Vec<Value>> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| Error::InvalidQuery(format!("{op} expects an array")))
}

fn parse_regex(operand: &Value, spec: &Map<String, Value>) -> Result<Predicate> {
    let pattern = operand
        .as_str()
        .ok_or_else(|| Error::InvalidQuery("$regex expects a string".into()))?;

    // Flags beyond the ^/$ anchoring are not portable to the SQL backend.
    if let Some(options) = spec.get("$options") {
        let flags = options.as_str().unwrap_or_default();
        if !flags.is_empty() {
            return Err(Error::UnsupportedRegexFlags(flags.to_string()));
        }
    }
    if pattern.contains("(?") {
        return Err(Error::UnsupportedRegexFlags(pattern.to_string()));
    }

    regex::Regex::new(pattern).map_err(|e| Error::InvalidRegex(e.to_string()))?;
    Ok(Predicate::Regex(pattern.to_string()))
}

/// Sort direction for a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Options accompanying a find: sort, paging and projection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Ordered sort spec, field name to direction
    pub sort: Vec<(String, SortDirection)>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    pub fields: Option<Projection>,
}

impl FindOptions {
    /// Parse an options object. Keys are accepted with or without the `$`
    /// prefix (the wire uses `$sort`, the query endpoint body uses `sort`).
    pub fn parse(value: &Value) -> Result<FindOptions> {
        let mut options = FindOptions::default();
        let Value::Object(map) = value else {
            if value.is_null() {
                return Ok(options);
            }
            return Err(Error::InvalidOptions("options must be an object".into()));
        };

        for (key, value) in map {
            match key.trim_start_matches('$') {
                "sort" => options.sort = parse_sort(value)?,
                "limit" => options.limit = Some(parse_count("limit", value)?),
                "skip" => options.skip = Some(parse_count("skip", value)?),
                "fields" => {
                    let spec = value.as_object().ok_or_else(|| {
                        Error::InvalidOptions("fields must be an object".into())
                    })?;
                    options.fields = Some(Projection::parse(spec)?);
                }
                _ => {}
            }
        }

        Ok(options)
    }

}

fn parse_sort(value: &Value) -> Result<Vec<(String, SortDirection)>> {
    let map = value
        .as_object()
        .ok_or_else(|| Error::InvalidOptions("sort must be an object".into()))?;

    let mut sort = Vec::with_capacity(map.len());
    for (field, direction) in map {
        let direction = direction
            .as_i64()
            .or_else(|| direction.as_f64().map(|f| f as i64))
            .ok_or_else(|| Error::InvalidOptions(format!("sort direction for '{field}'")))?;
        let direction = match direction {
            1 => SortDirection::Ascending,
            -1 => SortDirection::Descending,
            _ => {
                return Err(Error::InvalidOptions(format!(
                    "sort direction for '{field}' must be 1 or -1"
                )))
            }
        };
        sort.push((field.clone(), direction));
    }
    Ok(sort)
}

fn parse_count(name: &str, value: &Value) -> Result<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| Error::InvalidOptions(format!("{name} must be a non-negative integer")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_value_is_eq() {
        let filter = Filter::parse(&json!({"title": "a"})).unwrap();
        assert_eq!(
            filter,
            Filter::Field {
                path: "title".into(),
                predicate: Predicate::Eq(json!("a")),
            }
        );
    }

    #[test]
    fn siblings_conjoin() {
        let filter = Filter::parse(&json!({"a": 1, "b": 2})).unwrap();
        let Filter::And(children) = filter else {
            panic!("expected implicit $and");
        };
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn operator_objects_parse() {
        let filter = Filter::parse(&json!({"priority": {"$gte": 3, "$lt": 5}})).unwrap();
        let Filter::And(children) = filter else {
            panic!("expected $and of two predicates");
        };
        assert!(children.contains(&Filter::Field {
            path: "priority".into(),
            predicate: Predicate::Gte(json!(3)),
        }));
        assert!(children.contains(&Filter::Field {
            path: "priority".into(),
            predicate: Predicate::Lt(json!(5)),
        }));
    }

    #[test]
    fn or_branches() {
        let filter = Filter::parse(&json!({"$or": [{"a": 1}, {"b": 2}]})).unwrap();
        assert!(matches!(filter, Filter::Or(children) if children.len() == 2));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = Filter::parse(&json!({"loc": {"$near": [0, 0]}})).unwrap_err();
        assert_eq!(err, Error::UnknownOperator("$near".into()));

        let err = Filter::parse(&json!({"$where": "1"})).unwrap_err();
        assert_eq!(err, Error::UnknownOperator("$where".into()));
    }

    #[test]
    fn embedded_object_without_operators_is_eq() {
        let filter = Filter::parse(&json!({"address": {"city": "Oslo"}})).unwrap();
        assert_eq!(
            filter,
            Filter::Field {
                path: "address".into(),
                predicate: Predicate::Eq(json!({"city": "Oslo"})),
            }
        );
    }

    #[test]
    fn regex_flags_are_rejected() {
        let err =
            Filter::parse(&json!({"name": {"$regex": "^a", "$options": "i"}})).unwrap_err();
        assert_eq!(err, Error::UnsupportedRegexFlags("i".into()));

        let err = Filter::parse(&json!({"name": {"$regex": "(?i)abc"}})).unwrap_err();
        assert!(matches!(err, Error::UnsupportedRegexFlags(_)));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = Filter::parse(&json!({"name": {"$regex": "["}})).unwrap_err();
        assert!(matches!(err, Error::InvalidRegex(_)));
    }

    #[test]
    fn options_parse_with_and_without_prefix() {
        let options =
            FindOptions::parse(&json!({"$sort": {"priority": -1}, "$limit": 2, "$skip": 1}))
                .unwrap();
        assert_eq!(options.sort, vec![("priority".into(), SortDirection::Descending)]);
        assert_eq!(options.limit, Some(2));
        assert_eq!(options.skip, Some(1));

        let options = FindOptions::parse(&json!({"sort": {"a": 1}, "limit": 10})).unwrap();
        assert_eq!(options.sort, vec![("a".into(), SortDirection::Ascending)]);
        assert_eq!(options.limit, Some(10));
    }

    #[test]
    fn bad_sort_direction_is_rejected() {
        let err = FindOptions::parse(&json!({"$sort": {"a": 2}})).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }
}
