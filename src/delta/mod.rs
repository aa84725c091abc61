//! Delta engine.
//!
//! Turns the state of a [`Document`] into the storage patch that brings the
//! persisted copy in line with it: a full encode for new records, or only the
//! dirty leaves for loaded ones.

use crate::core::value::CLASS_KEY;
use crate::core::{CompiledUpdate, RawDocument, Result, Value};
use crate::document::{ChangeSet, Document};
use crate::schema::{FieldDescriptor, FieldKind};
use serde_json::Value as JsonValue;
use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaMode {
    /// Every declared field (new documents, explicit resync).
    Full,
    /// Only the effective changed paths.
    Incremental,
}

/// A storage patch: keys to `$set` and keys to `$unset`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub sets: RawDocument,
    pub unsets: RawDocument,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.unsets.is_empty()
    }

    /// `{"$set": ..., "$unset": ...}`, omitting empty sides.
    pub fn to_update(&self) -> CompiledUpdate {
        let mut update = CompiledUpdate::new();
        if !self.sets.is_empty() {
            update.insert("$set".to_string(), JsonValue::Object(self.sets.clone()));
        }
        if !self.unsets.is_empty() {
            update.insert("$unset".to_string(), JsonValue::Object(self.unsets.clone()));
        }
        update
    }

    fn classify(&mut self, key: String, encoded: JsonValue) {
        if encoded.is_null() {
            self.unsets.insert(key, JsonValue::from(1));
        } else {
            self.sets.insert(key, encoded);
        }
    }
}

pub fn compute_delta(doc: &Document, mode: DeltaMode) -> Result<Delta> {
    match mode {
        DeltaMode::Full => full_delta(doc),
        DeltaMode::Incremental => incremental_delta(doc),
    }
}

fn full_delta(doc: &Document) -> Result<Delta> {
    let doc_type = doc.doc_type();
    let mut delta = Delta::default();
    if doc_type.is_polymorphic() {
        delta.sets.insert(
            CLASS_KEY.to_string(),
            JsonValue::String(doc_type.class_name().to_string()),
        );
    }
    let pk = doc_type.primary_key();
    for field in doc_type.fields() {
        let value = match doc.values().get(field.name()) {
            Some(value) => Cow::Borrowed(value),
            None => Cow::Owned(field.default_value().unwrap_or_default()),
        };
        let encoded = field.to_storage(&value)?;
        if encoded.is_null() && pk == Some(field.name()) {
            continue;
        }
        delta.classify(field.db_name().to_string(), encoded);
    }
    for (name, value) in doc.values() {
        if doc_type.field(name).is_none() {
            let encoded = FieldDescriptor::any(name.as_str()).to_storage(value)?;
            delta.classify(name.clone(), encoded);
        }
    }
    Ok(delta)
}

fn incremental_delta(doc: &Document) -> Result<Delta> {
    let mut delta = Delta::default();
    for path in effective_changed_paths(doc).iter() {
        let (key, encoded) = resolve_live(doc, path)?;
        delta.classify(key, encoded);
    }
    Ok(delta)
}

/// The document's own dirty paths plus those harvested from every embedded
/// document reachable through its fields. Subtrees already marked as a whole
/// are not descended into, and references are never followed.
pub fn effective_changed_paths(doc: &Document) -> ChangeSet {
    let mut out = ChangeSet::new();
    harvest_document(doc, "", &mut out);
    out
}

fn harvest_document(doc: &Document, prefix: &str, out: &mut ChangeSet) {
    for path in doc.changed_fields().iter() {
        out.mark(&format!("{prefix}{path}"));
    }
    for (name, value) in doc.values() {
        let skip = doc
            .doc_type()
            .field(name)
            .is_some_and(|f| f.kind().is_reference());
        if !skip {
            harvest_value(doc.changed_fields(), value, name, prefix, out);
        }
    }
}

/// `rel` is the path relative to the document owning `changes`.
fn harvest_value(changes: &ChangeSet, value: &Value, rel: &str, prefix: &str, out: &mut ChangeSet) {
    if changes.covers(rel) {
        return;
    }
    match value {
        Value::Document(doc) => harvest_document(doc, &format!("{prefix}{rel}."), out),
        Value::List(items) => {
            for (i, item) in items.iter().enumerate() {
                harvest_value(changes, item, &format!("{rel}.{i}"), prefix, out);
            }
        }
        Value::Dict(map) => {
            for (key, item) in map {
                harvest_value(changes, item, &format!("{rel}.{key}"), prefix, out);
            }
        }
        _ => {}
    }
}

/// Walks `path` through the live values, tracking the descriptor in force at
/// each step, and returns the storage key with the encoded final value
/// (`null` when nothing lives there any more).
fn resolve_live(doc: &Document, path: &str) -> Result<(String, JsonValue)> {
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or_default();
    let mut field = doc.descriptor(first);
    let mut current = doc.values().get(first);
    let mut key = vec![field
        .as_ref()
        .map_or_else(|| first.to_string(), |f| f.db_name().to_string())];

    for segment in segments {
        let (next_field, next_value, storage) = match current {
            Some(Value::List(items)) => (
                field.as_ref().and_then(|f| f.kind().element().cloned()),
                segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                segment.to_string(),
            ),
            Some(Value::Dict(map)) => (
                field
                    .as_ref()
                    .and_then(|f| f.kind().element())
                    .map(|el| el.renamed(segment)),
                map.get(segment),
                segment.to_string(),
            ),
            Some(Value::Document(inner)) => {
                let inner_field = inner.descriptor(segment);
                let storage = inner_field
                    .as_ref()
                    .map_or_else(|| segment.to_string(), |f| f.db_name().to_string());
                (inner_field, inner.values().get(segment), storage)
            }
            _ => (
                field.as_ref().and_then(|f| descend_declared(f, segment)),
                None,
                segment.to_string(),
            ),
        };
        field = next_field;
        current = next_value;
        key.push(storage);
    }

    let encoded = match (current, field) {
        (None, _) => JsonValue::Null,
        (Some(value), Some(field)) => field.to_storage(value)?,
        (Some(value), None) => value.to_json()?,
    };
    Ok((key.join("."), encoded))
}

/// Descriptor one level below `field` when no live value is there to guide
/// the walk.
fn descend_declared(field: &FieldDescriptor, segment: &str) -> Option<FieldDescriptor> {
    match field.kind() {
        FieldKind::Embedded(doc_type) => doc_type.field(segment).cloned(),
        FieldKind::List(el) => Some((**el).clone()),
        FieldKind::Dict(el) => Some(el.renamed(segment)),
        _ => None,
    }
}

/// Clears the dirty set of `doc` and of every embedded document reachable
/// through its fields.
pub fn clear_changed_fields(doc: &mut Document) {
    let (values, changes) = doc.parts_mut();
    changes.clear();
    for value in values.values_mut() {
        clear_value(value);
    }
}

fn clear_value(value: &mut Value) {
    match value {
        Value::Document(doc) => clear_changed_fields(doc),
        Value::List(items) => items.iter_mut().for_each(clear_value),
        Value::Dict(map) => map.values_mut().for_each(clear_value),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OdmError;
    use crate::schema::{DocumentType, Registry, ScalarType};
    use serde_json::json;
    use std::sync::Arc;

    fn blog() -> (Registry, Arc<DocumentType>) {
        let comment = DocumentType::embedded("Comment")
            .field(FieldDescriptor::string("body").db_field("b"))
            .field(FieldDescriptor::int("votes"))
            .build()
            .unwrap();
        let post = DocumentType::builder("Post")
            .collection("posts")
            .field(FieldDescriptor::string("title").db_field("t"))
            .field(FieldDescriptor::list("comments", FieldKind::Embedded(comment)))
            .field(FieldDescriptor::dict("meta", FieldKind::Scalar(ScalarType::Any)))
            .field(FieldDescriptor::reference("author", "User"))
            .build()
            .unwrap();
        let registry = Registry::new().with_type(Arc::clone(&post)).unwrap();
        (registry, post)
    }

    fn loaded(registry: &Registry, t: &Arc<DocumentType>) -> Document {
        let raw = json!({
            "_id": "p1",
            "t": "Hello",
            "comments": [{"b": "first", "votes": 1}, {"b": "second", "votes": 2}],
            "meta": {"color": "red", "size": 3},
            "author": "u1",
        });
        Document::from_storage(registry, t, raw.as_object().unwrap().clone()).unwrap()
    }

    #[test]
    fn test_full_delta_sets_and_unsets() {
        let t = DocumentType::builder("Pair")
            .field(FieldDescriptor::int("a"))
            .field(FieldDescriptor::int("b"))
            .build()
            .unwrap();
        let doc = Document::with_values(&t, [("a", Value::Int(1)), ("b", Value::Null)]).unwrap();
        let delta = compute_delta(&doc, DeltaMode::Full).unwrap();
        assert_eq!(delta.sets, *json!({"a": 1}).as_object().unwrap());
        assert_eq!(delta.unsets, *json!({"b": 1}).as_object().unwrap());
    }

    #[test]
    fn test_full_delta_resolves_generator_defaults() {
        let t = DocumentType::builder("Counter")
            .field(FieldDescriptor::int("n").default_with(|| Value::Int(7)))
            .build()
            .unwrap();
        let delta = compute_delta(&Document::new(&t), DeltaMode::Full).unwrap();
        assert_eq!(delta.sets.get("n"), Some(&json!(7)));
        assert!(delta.unsets.is_empty());
    }

    #[test]
    fn test_polymorphic_full_delta_carries_class() {
        let animal = DocumentType::builder("Animal")
            .allow_inheritance()
            .build()
            .unwrap();
        let dog = DocumentType::subclass("Dog", &animal).build().unwrap();
        let delta = compute_delta(&Document::new(&dog), DeltaMode::Full).unwrap();
        assert_eq!(delta.sets.get("_cls"), Some(&json!("Animal.Dog")));
    }

    #[test]
    fn test_incremental_nested_embedded_change() {
        let (registry, post) = blog();
        let mut doc = loaded(&registry, &post);
        {
            let mut comments = doc.list_mut("comments").unwrap();
            let comment = comments.get_mut(1).and_then(|o| o.into_document()).unwrap();
            comment.set("votes", 5).unwrap();
        }
        assert!(doc.changed_fields().is_empty());
        let delta = compute_delta(&doc, DeltaMode::Incremental).unwrap();
        assert_eq!(delta.sets, *json!({"comments.1.votes": 5}).as_object().unwrap());
        assert!(delta.unsets.is_empty());
    }

    #[test]
    fn test_incremental_dict_key_removal_unsets() {
        let (registry, post) = blog();
        let mut doc = loaded(&registry, &post);
        doc.dict_mut("meta").unwrap().remove("color");
        doc.set("title", "Renamed").unwrap();
        let delta = compute_delta(&doc, DeltaMode::Incremental).unwrap();
        assert_eq!(delta.sets, *json!({"t": "Renamed"}).as_object().unwrap());
        assert_eq!(delta.unsets, *json!({"meta.color": 1}).as_object().unwrap());
    }

    #[test]
    fn test_whole_list_mark_covers_nested_documents() {
        let (registry, post) = blog();
        let mut doc = loaded(&registry, &post);
        {
            let mut comments = doc.list_mut("comments").unwrap();
            let comment = comments.get_mut(0).and_then(|o| o.into_document()).unwrap();
            comment.set("body", "edited").unwrap();
            comments.reverse();
        }
        let paths: Vec<String> = effective_changed_paths(&doc).iter().map(str::to_string).collect();
        assert_eq!(paths, vec!["comments"]);
        let delta = compute_delta(&doc, DeltaMode::Incremental).unwrap();
        assert_eq!(delta.sets.len(), 1);
        assert!(delta.sets.get("comments").unwrap().is_array());
    }

    #[test]
    fn test_clear_reaches_embedded_documents() {
        let (registry, post) = blog();
        let mut doc = loaded(&registry, &post);
        {
            let mut comments = doc.list_mut("comments").unwrap();
            let comment = comments.get_mut(0).and_then(|o| o.into_document()).unwrap();
            comment.set("votes", 9).unwrap();
        }
        doc.set("title", "x").unwrap();
        clear_changed_fields(&mut doc);
        assert!(effective_changed_paths(&doc).is_empty());
        assert!(compute_delta(&doc, DeltaMode::Incremental).unwrap().is_empty());
    }

    #[test]
    fn test_validation_error_propagates_unchanged() {
        let account = DocumentType::builder("Account")
            .collection("accounts")
            .field(FieldDescriptor::int("balance").validate_with(|v| match v.as_i64() {
                Some(n) if n >= 0 => Ok(()),
                _ => Err("balance cannot be negative".to_string()),
            }))
            .build()
            .unwrap();
        let expected = |err: OdmError| {
            matches!(
                err,
                OdmError::Validation { ref field, ref message }
                    if field == "balance" && message == "balance cannot be negative"
            )
        };

        let fresh = Document::with_values(&account, [("balance", -5)]).unwrap();
        assert!(expected(compute_delta(&fresh, DeltaMode::Full).unwrap_err()));

        let registry = Registry::new().with_type(Arc::clone(&account)).unwrap();
        let raw = json!({"_id": "a1", "balance": 10});
        let mut loaded = Document::from_storage(&registry, &account, raw.as_object().unwrap().clone()).unwrap();
        loaded.set("balance", -1).unwrap();
        assert!(expected(compute_delta(&loaded, DeltaMode::Incremental).unwrap_err()));
    }

    #[test]
    fn test_to_update_omits_empty_sides() {
        let mut delta = Delta::default();
        delta.classify("a".to_string(), json!(1));
        assert_eq!(delta.to_update(), *json!({"$set": {"a": 1}}).as_object().unwrap());
    }
}
