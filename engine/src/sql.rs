//! Filter compilation to parameterized SQL for the hybrid column+JSON
//! layout.
//!
//! Fields promoted to native columns are referenced directly; everything
//! else goes through `json_extract(data, '$.field')`. Values are always
//! bound as parameters, coerced by the field's declared type.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::query::{Filter, FindOptions, Predicate, SortDirection};
use crate::schema::{CollectionConfig, FieldType};
use crate::ID_FIELD;

/// A bound SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Real(f64),
    Null,
}

/// A compiled WHERE clause with its parameters, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub clause: String,
    pub params: Vec<SqlParam>,
}

/// Compile a filter into a WHERE clause for the given collection layout.
pub fn compile_filter(filter: &Filter, config: &CollectionConfig) -> Result<SqlQuery> {
    let mut params = Vec::new();
    let clause = compile_node(filter, config, &mut params)?;
    Ok(SqlQuery { clause, params })
}

/// Compile sort and paging options into an ORDER BY / LIMIT / OFFSET tail.
pub fn compile_options(options: &FindOptions, config: &CollectionConfig) -> Result<String> {
    let mut sql = String::new();

    if !options.sort.is_empty() {
        let mut terms = Vec::with_capacity(options.sort.len());
        for (field, direction) in &options.sort {
            let direction = match direction {
                SortDirection::Ascending => "ASC",
                SortDirection::Descending => "DESC",
            };
            terms.push(format!("{} {}", field_expr(field, config)?, direction));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&terms.join(", "));
    }

    match (options.limit, options.skip) {
        (Some(limit), Some(skip)) => {
            sql.push_str(&format!(" LIMIT {limit} OFFSET {skip}"));
        }
        (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
        // SQLite requires a LIMIT before OFFSET
        (None, Some(skip)) => sql.push_str(&format!(" LIMIT -1 OFFSET {skip}")),
        (None, None) => {}
    }

    Ok(sql)
}

fn compile_node(
    filter: &Filter,
    config: &CollectionConfig,
    params: &mut Vec<SqlParam>,
) -> Result<String> {
    match filter {
        Filter::And(children) => compile_branch(children, " AND ", "1 = 1", config, params),
        Filter::Or(children) => compile_branch(children, " OR ", "0 = 1", config, params),
        Filter::Field { path, predicate } => compile_predicate(path, predicate, config, params),
    }
}

fn compile_branch(
    children: &[Filter],
    joiner: &str,
    empty: &str,
    config: &CollectionConfig,
    params: &mut Vec<SqlParam>,
) -> Result<String> {
    if children.is_empty() {
        return Ok(empty.to_string());
    }
    let parts = children
        .iter()
        .map(|child| compile_node(child, config, params))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("({})", parts.join(joiner)))
}

fn compile_predicate(
    path: &str,
    predicate: &Predicate,
    config: &CollectionConfig,
    params: &mut Vec<SqlParam>,
) -> Result<String> {
    let expr = field_expr(path, config)?;
    let field_type = config.field_type(path);

    let sql = match predicate {
        Predicate::Eq(value) if value.is_null() => format!("{expr} IS NULL"),
        Predicate::Eq(value) => {
            params.push(bind_value(field_type, value));
            format!("{expr} = ?")
        }
        Predicate::Ne(value) if value.is_null() => format!("{expr} IS NOT NULL"),
        Predicate::Ne(value) => {
            // A missing field satisfies $ne, and json_extract yields NULL there.
            params.push(bind_value(field_type, value));
            format!("({expr} != ? OR {expr} IS NULL)")
        }
        Predicate::Gt(value) => compile_comparison(&expr, ">", field_type, value, params),
        Predicate::Gte(value) => compile_comparison(&expr, ">=", field_type, value, params),
        Predicate::Lt(value) => compile_comparison(&expr, "<", field_type, value, params),
        Predicate::Lte(value) => compile_comparison(&expr, "<=", field_type, value, params),
        Predicate::In(list) => compile_in(&expr, list, field_type, params, false),
        Predicate::Nin(list) => compile_in(&expr, list, field_type, params, true),
        Predicate::Exists(true) => format!("{expr} IS NOT NULL"),
        Predicate::Exists(false) => format!("{expr} IS NULL"),
        Predicate::Regex(pattern) => {
            params.push(SqlParam::Text(like_pattern(pattern)));
            format!("{expr} LIKE ? ESCAPE '\\'")
        }
    };
    Ok(sql)
}

fn compile_comparison(
    expr: &str,
    op: &str,
    field_type: Option<FieldType>,
    value: &Value,
    params: &mut Vec<SqlParam>,
) -> String {
    params.push(bind_value(field_type, value));
    format!("{expr} {op} ?")
}

fn compile_in(
    expr: &str,
    list: &[Value],
    field_type: Option<FieldType>,
    params: &mut Vec<SqlParam>,
    negate: bool,
) -> String {
    let has_null = list.iter().any(Value::is_null);
    let values: Vec<&Value> = list.iter().filter(|v| !v.is_null()).collect();

    if values.is_empty() {
        // $in [] matches nothing (or only null); $nin [] matches everything.
        return match (negate, has_null) {
            (false, false) => "0 = 1".to_string(),
            (false, true) => format!("{expr} IS NULL"),
            (true, false) => "1 = 1".to_string(),
            (true, true) => format!("{expr} IS NOT NULL"),
        };
    }

    let placeholders = vec!["?"; values.len()].join(", ");
    for value in &values {
        params.push(bind_value(field_type, value));
    }

    if negate {
        if has_null {
            format!("({expr} NOT IN ({placeholders}) AND {expr} IS NOT NULL)")
        } else {
            // Missing fields satisfy $nin; NOT IN alone drops the NULL rows.
            format!("({expr} NOT IN ({placeholders}) OR {expr} IS NULL)")
        }
    } else if has_null {
        format!("({expr} IN ({placeholders}) OR {expr} IS NULL)")
    } else {
        format!("{expr} IN ({placeholders})")
    }
}

/// The SQL expression addressing a field: a promoted column or a JSON
/// extraction from the `data` column.
fn field_expr(path: &str, config: &CollectionConfig) -> Result<String> {
    if path.contains('\'') || path.contains('"') || path.contains('\\') {
        return Err(Error::InvalidQuery(format!("invalid field name '{path}'")));
    }
    if path == ID_FIELD {
        return Ok("id".to_string());
    }
    if !path.contains('.') && config.has_column(path) {
        return Ok(format!("\"{path}\""));
    }
    Ok(format!("json_extract(data, '$.{path}')"))
}

/// Bind a JSON value as a SQL parameter, honoring the declared field type.
fn bind_value(field_type: Option<FieldType>, value: &Value) -> SqlParam {
    match value {
        Value::Null => SqlParam::Null,
        // json_extract surfaces JSON booleans as 0/1
        Value::Bool(b) => SqlParam::Int(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlParam::Int(i)
            } else {
                SqlParam::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => match field_type {
            Some(FieldType::Number) => {
                if let Ok(i) = s.parse::<i64>() {
                    SqlParam::Int(i)
                } else if let Ok(f) = s.parse::<f64>() {
                    SqlParam::Real(f)
                } else {
                    SqlParam::Text(s.clone())
                }
            }
            _ => SqlParam::Text(s.clone()),
        },
        // Composite operands compare via their JSON encoding
        other => SqlParam::Text(other.to_string()),
    }
}

/// Translate the supported `$regex` shapes to a LIKE pattern:
/// `^p` anchored prefix, `p$` anchored suffix, otherwise containment.
fn like_pattern(pattern: &str) -> String {
    let (body, prefix_anchored) = match pattern.strip_prefix('^') {
        Some(rest) => (rest, true),
        None => (pattern, false),
    };
    let (body, suffix_anchored) = match body.strip_suffix('$') {
        Some(rest) => (rest, true),
        None => (body, false),
    };

    let escaped: String = body
        .chars()
        .flat_map(|c| match c {
            '%' | '_' | '\\' => vec!['\\', c],
            _ => vec![c],
        })
        .collect();

    match (prefix_anchored, suffix_anchored) {
        (true, true) => escaped,
        (true, false) => format!("{escaped}%"),
        (false, true) => format!("%{escaped}"),
        (false, false) => format!("%{escaped}%"),
    }
}
