//! Collection configuration, document coercion and validation.
//!
//! A collection's schema is a mapping from field name to [`FieldSpec`].
//! Incoming documents are normalized against it: loose type coercion,
//! defaults on insert, and accumulated per-field errors instead of
//! fail-fast rejection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

use crate::document::Document;

/// Field types supported in collection schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Object,
    Array,
}

impl FieldType {
    /// Whether values of this type can be promoted to a native SQL column.
    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            FieldType::String | FieldType::Number | FieldType::Boolean | FieldType::Date
        )
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Object => "object",
            FieldType::Array => "array",
        };
        write!(f, "{name}")
    }
}

/// Declaration of a single field in a collection schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    /// Field type
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Whether the field must be present on insert
    #[serde(default)]
    pub required: bool,
    /// Default applied on insert when absent; the string `"now"` resolves
    /// to the current timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Enforce uniqueness across the collection
    #[serde(default)]
    pub unique: bool,
    /// Ask the storage backend for an index
    #[serde(default)]
    pub index: bool,
    /// Writable only by the root principal
    #[serde(default)]
    pub system: bool,
    /// Display ordering hint for dashboards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
}

impl FieldSpec {
    /// A plain optional field of the given type.
    pub fn of(field_type: FieldType) -> Self {
        FieldSpec {
            field_type,
            required: false,
            default: None,
            unique: false,
            index: false,
            system: false,
            order: None,
        }
    }

    /// Builder-style `required` marker.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Builder-style default value.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Builder-style `unique` marker (implies an index).
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Builder-style `index` marker.
    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    /// Builder-style `system` marker.
    pub fn system(mut self) -> Self {
        self.system = true;
        self
    }
}

/// Per-collection configuration: schema plus storage options.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionConfig {
    /// Field declarations, keyed by field name
    #[serde(default)]
    pub properties: BTreeMap<String, FieldSpec>,
    /// Promote indexed primitive fields to native SQL columns
    #[serde(default)]
    pub use_columns: bool,
    /// Event-only collection: requests never touch storage
    #[serde(default)]
    pub no_store: bool,
}

/// The write operation being normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
}

/// Accumulated per-field validation errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors(pub BTreeMap<String, String>);

impl ValidationErrors {
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_insert_with(|| message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        for (field, message) in other.0 {
            self.add(field, message);
        }
    }
}

impl CollectionConfig {
    /// Fields eligible for native column promotion under `useColumns`:
    /// indexed or unique primitives.
    pub fn column_fields(&self) -> impl Iterator<Item = (&String, &FieldSpec)> {
        self.properties.iter().filter(move |(_, spec)| {
            self.use_columns && (spec.index || spec.unique) && spec.field_type.is_primitive()
        })
    }

    /// Declared type of a field, if any.
    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.properties.get(name).map(|s| s.field_type)
    }

    /// Whether a field is backed by a native column.
    pub fn has_column(&self, name: &str) -> bool {
        self.column_fields().any(|(n, _)| n == name)
    }

    /// Normalize a document for a write.
    ///
    /// Applies loose coercion to declared fields, fills defaults on insert,
    /// checks requiredness, and rejects non-root writes to `system` fields.
    /// Unknown fields pass through verbatim. `now` is the caller's ISO-8601
    /// timestamp, used for the `"now"` default token.
    pub fn normalize(
        &self,
        op: WriteOp,
        mut doc: Document,
        is_root: bool,
        now: &str,
    ) -> (Document, ValidationErrors) {
        let mut errors = ValidationErrors::default();

        for (name, spec) in &self.properties {
            if spec.system && !is_root && doc.contains_key(name) {
                errors.add(name, "cannot be set");
                doc.remove(name);
                continue;
            }

            match doc.get(name) {
                Some(Value::Null) | None => {
                    if op == WriteOp::Create {
                        if let Some(default) = &spec.default {
                            if !doc.contains_key(name) {
                                doc.insert(name.clone(), resolve_default(spec, default, now));
                                continue;
                            }
                        }
                    }
                    let explicit_null = matches!(doc.get(name), Some(Value::Null));
                    if spec.required && (op == WriteOp::Create || explicit_null) {
                        errors.add(name, "required");
                    }
                }
                Some(value) => match coerce(spec.field_type, value, now) {
                    Ok(coerced) => {
                        doc.insert(name.clone(), coerced);
                    }
                    Err(message) => errors.add(name, message),
                },
            }
        }

        (doc, errors)
    }
}

fn resolve_default(spec: &FieldSpec, default: &Value, now: &str) -> Value {
    if default == &Value::String("now".into()) && spec.field_type == FieldType::Date {
        return Value::String(now.to_string());
    }
    default.clone()
}

/// Coerce a value to the declared type using loose JSON rules.
fn coerce(field_type: FieldType, value: &Value, _now: &str) -> Result<Value, String> {
    match field_type {
        FieldType::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err("must be a string".into()),
        },
        FieldType::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => parse_number(s).ok_or_else(|| "must be a number".to_string()),
            _ => Err("must be a number".into()),
        },
        FieldType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) if s == "true" => Ok(Value::Bool(true)),
            Value::String(s) if s == "false" => Ok(Value::Bool(false)),
            _ => Err("must be a boolean".into()),
        },
        FieldType::Date => coerce_date(value),
        FieldType::Object => match value {
            Value::Object(_) => Ok(value.clone()),
            _ => Err("must be an object".into()),
        },
        FieldType::Array => match value {
            Value::Array(_) => Ok(value.clone()),
            _ => Err("must be an array".into()),
        },
    }
}

fn parse_number(s: &str) -> Option<Value> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    s.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

/// Accept ISO-8601 strings and epoch milliseconds; normalize to RFC 3339 UTC.
fn coerce_date(value: &Value) -> Result<Value, String> {
    match value {
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| {
                Value::String(
                    dt.with_timezone(&chrono::Utc)
                        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                )
            })
            .map_err(|_| "must be an ISO-8601 date".into()),
        Value::Number(n) => {
            let millis = n.as_i64().ok_or_else(|| "must be an ISO-8601 date".to_string())?;
            chrono::DateTime::<chrono::Utc>::from_timestamp_millis(millis)
                .map(|dt| Value::String(dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)))
                .ok_or_else(|| "must be an ISO-8601 date".into())
        }
        _ => Err("must be an ISO-8601 date".into()),
    }
}

/// Convenience: a serde_json object literal as a [`Document`].
#[doc(hidden)]
pub fn doc_from(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
