//! The document envelope and helpers operating on it.
//!
//! A document is an ordered JSON object. The storage backends own the
//! serialization; everything above them works on this one shape.

use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::ID_FIELD;

/// A document: field name to JSON value, insertion-ordered.
pub type Document = Map<String, Value>;

/// Resolve a possibly dotted path (`address.city`) inside a document.
///
/// Returns `None` when any segment is missing or a non-object is traversed.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Shallow-merge a patch into a document.
///
/// Top-level fields are replaced; a `null` in the patch removes the field.
/// The `id` field is never touched by a patch.
pub fn merge_patch(doc: &mut Document, patch: Document) {
    for (key, value) in patch {
        if key == ID_FIELD {
            continue;
        }
        if value.is_null() {
            doc.remove(&key);
        } else {
            doc.insert(key, value);
        }
    }
}

/// Which way a field projection selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProjectionMode {
    Include,
    Exclude,
}

/// A parsed `fields` projection: either an inclusion or an exclusion set.
///
/// Mixing the two is rejected, with one exception mirroring the document
/// database convention: `id` may be excluded from an otherwise inclusive
/// projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    mode: ProjectionMode,
    fields: BTreeSet<String>,
    include_id: bool,
}

impl Projection {
    /// Parse a projection object (`{"title": 1, "body": 1}` or `{"secret": 0}`).
    pub fn parse(spec: &Map<String, Value>) -> Result<Projection> {
        let mut mode = None;
        let mut fields = BTreeSet::new();
        let mut include_id = true;

        for (name, value) in spec {
            let include = match value {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                _ => {
                    return Err(Error::InvalidOptions(format!(
                        "projection value for '{name}' must be 0 or 1"
                    )))
                }
            };

            if name == ID_FIELD {
                include_id = include;
                continue;
            }

            let this_mode = if include {
                ProjectionMode::Include
            } else {
                ProjectionMode::Exclude
            };
            match mode {
                None => mode = Some(this_mode),
                Some(m) if m != this_mode => return Err(Error::MixedProjection),
                Some(_) => {}
            }
            fields.insert(name.clone());
        }

        Ok(Projection {
            // An empty or id-only spec behaves as "exclude nothing".
            mode: mode.unwrap_or(ProjectionMode::Exclude),
            fields,
            include_id,
        })
    }

    /// Apply the projection, producing a new document.
    pub fn apply(&self, doc: &Document) -> Document {
        let mut out = Document::new();
        for (key, value) in doc {
            if key == ID_FIELD {
                if self.include_id {
                    out.insert(key.clone(), value.clone());
                }
                continue;
            }
            let keep = match self.mode {
                ProjectionMode::Include => self.fields.contains(key),
                ProjectionMode::Exclude => !self.fields.contains(key),
            };
            if keep {
                out.insert(key.clone(), value.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn get_path_resolves_nested_fields() {
        let d = doc(json!({"a": {"b": {"c": 3}}, "x": 1}));
        assert_eq!(get_path(&d, "x"), Some(&json!(1)));
        assert_eq!(get_path(&d, "a.b.c"), Some(&json!(3)));
        assert_eq!(get_path(&d, "a.missing"), None);
        assert_eq!(get_path(&d, "x.y"), None);
    }

    #[test]
    fn merge_patch_replaces_and_removes() {
        let mut d = doc(json!({"id": "1", "title": "a", "done": false}));
        merge_patch(
            &mut d,
            doc(json!({"id": "other", "done": true, "title": null, "extra": 5})),
        );
        assert_eq!(d.get("id"), Some(&json!("1")));
        assert_eq!(d.get("done"), Some(&json!(true)));
        assert_eq!(d.get("extra"), Some(&json!(5)));
        assert!(!d.contains_key("title"));
    }

    #[test]
    fn projection_inclusion() {
        let p = Projection::parse(&doc(json!({"title": 1}))).unwrap();
        let d = doc(json!({"id": "1", "title": "a", "secret": "x"}));
        let out = p.apply(&d);
        assert_eq!(out.get("title"), Some(&json!("a")));
        assert_eq!(out.get("id"), Some(&json!("1")));
        assert!(!out.contains_key("secret"));
    }

    #[test]
    fn projection_exclusion() {
        let p = Projection::parse(&doc(json!({"secret": 0}))).unwrap();
        let d = doc(json!({"id": "1", "title": "a", "secret": "x"}));
        let out = p.apply(&d);
        assert!(out.contains_key("title"));
        assert!(!out.contains_key("secret"));
    }

    #[test]
    fn projection_rejects_mixed() {
        let err = Projection::parse(&doc(json!({"a": 1, "b": 0}))).unwrap_err();
        assert_eq!(err, Error::MixedProjection);
    }

    #[test]
    fn projection_id_exclusion_is_allowed_with_inclusion() {
        let p = Projection::parse(&doc(json!({"title": 1, "id": 0}))).unwrap();
        let d = doc(json!({"id": "1", "title": "a"}));
        let out = p.apply(&d);
        assert!(!out.contains_key("id"));
        assert!(out.contains_key("title"));
    }
}
