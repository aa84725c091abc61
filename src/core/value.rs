use crate::core::{OdmError, Result};
use crate::document::Document;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Wire-level document: an ordered mapping of storage keys to JSON values.
pub type RawDocument = Map<String, JsonValue>;

/// Native filter document (`{"age": {"$lt": 3}}`).
pub type CompiledQuery = Map<String, JsonValue>;

/// Native update document (`{"$set": {...}, "$inc": {...}}`).
pub type CompiledUpdate = Map<String, JsonValue>;

/// Storage key of the type discriminator written for polymorphic documents.
pub const CLASS_KEY: &str = "_cls";

/// Storage key of the primary key.
pub const ID_KEY: &str = "_id";

/// Where a stored reference points to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RefTarget {
    /// A reference whose target document type is fixed by the field.
    Type(String),
    /// An untyped reference carrying its own collection (and optionally class).
    Collection {
        collection: String,
        class_name: Option<String>,
    },
}

/// An unresolved reference to another document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocRef {
    pub target: RefTarget,
    pub id: JsonValue,
}

impl DocRef {
    pub fn typed(type_name: impl Into<String>, id: impl Into<JsonValue>) -> Self {
        Self {
            target: RefTarget::Type(type_name.into()),
            id: id.into(),
        }
    }

    pub fn generic(
        collection: impl Into<String>,
        class_name: Option<String>,
        id: impl Into<JsonValue>,
    ) -> Self {
        Self {
            target: RefTarget::Collection {
                collection: collection.into(),
                class_name,
            },
            id: id.into(),
        }
    }

    /// Canonical, hashable form of the id.
    pub fn id_key(&self) -> String {
        id_key(&self.id)
    }

    /// `{"$ref": collection, "$id": id}` when the collection is known.
    pub fn to_dbref(&self, collection: &str) -> JsonValue {
        let mut map = Map::new();
        map.insert("$ref".to_string(), JsonValue::String(collection.to_string()));
        map.insert("$id".to_string(), self.id.clone());
        JsonValue::Object(map)
    }
}

/// Canonical string key of a raw id value.
pub fn id_key(id: &JsonValue) -> String {
    id.to_string()
}

/// In-memory value of a document field.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    /// Embedded document with its own change tracking.
    Document(Box<Document>),
    /// Stored reference that has not been dereferenced.
    Reference(DocRef),
    /// Dereferenced document, shared by every occurrence of the same reference.
    Linked(Arc<Document>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::DateTime(_) => "datetime",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Document(_) => "document",
            Self::Reference(_) => "reference",
            Self::Linked(_) => "linked document",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Self::List(_) | Self::Dict(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Dict(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Self::Document(doc) => Some(doc),
            Self::Linked(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&DocRef> {
        match self {
            Self::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// Negates a numeric value (`dec` → `inc` rewrite).
    pub fn negated(&self) -> Option<Value> {
        match self {
            Self::Int(i) => i.checked_neg().map(Self::Int),
            Self::Float(f) => Some(Self::Float(-f)),
            _ => None,
        }
    }

    /// Encodes the value without a field descriptor.
    ///
    /// Embedded documents go through their own type, references become
    /// `{"$ref", "$id"}` pairs when the collection is known and the bare id
    /// otherwise.
    pub fn to_json(&self) -> Result<JsonValue> {
        Ok(match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Int(i) => JsonValue::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .ok_or_else(|| OdmError::Serialization(format!("cannot encode float {f}")))?,
            Self::String(s) => JsonValue::String(s.clone()),
            Self::DateTime(dt) => JsonValue::String(format_datetime(dt)),
            Self::List(items) => JsonValue::Array(
                items
                    .iter()
                    .map(Value::to_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Self::Dict(map) => {
                let mut out = Map::new();
                for (key, value) in map {
                    out.insert(key.clone(), value.to_json()?);
                }
                JsonValue::Object(out)
            }
            Self::Document(doc) => JsonValue::Object(doc.to_storage()?),
            Self::Reference(r) => match &r.target {
                RefTarget::Collection { collection, .. } => r.to_dbref(collection),
                RefTarget::Type(_) => r.id.clone(),
            },
            Self::Linked(doc) => match (doc.doc_type().collection(), doc.pk_json()?) {
                (Some(collection), id) => DocRef::typed(doc.doc_type().name(), id).to_dbref(collection),
                (None, id) => id,
            },
        })
    }

    /// Decodes a JSON value without a field descriptor.
    ///
    /// `{"$ref", "$id"}` pairs become untyped references; everything else maps
    /// structurally.
    pub fn from_json(json: &JsonValue) -> Value {
        match json {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Self::String(s.clone()),
            JsonValue::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            JsonValue::Object(map) => {
                if let Some(r) = dbref_from_json(map) {
                    return Self::Reference(r);
                }
                Self::Dict(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Self::from_json(v)))
                        .collect(),
                )
            }
        }
    }
}

/// Recognises `{"$ref": collection, "$id": id}` and the generic-reference
/// envelope `{"_cls": class, "_ref": {"$ref", "$id"}}`.
pub fn dbref_from_json(map: &Map<String, JsonValue>) -> Option<DocRef> {
    if let (Some(JsonValue::String(collection)), Some(id)) = (map.get("$ref"), map.get("$id")) {
        return Some(DocRef::generic(collection.clone(), None, id.clone()));
    }
    if let Some(JsonValue::Object(inner)) = map.get("_ref") {
        let mut r = dbref_from_json(inner)?;
        if let RefTarget::Collection { class_name, .. } = &mut r.target {
            *class_name = map.get(CLASS_KEY).and_then(|c| c.as_str()).map(str::to_string);
        }
        return Some(r);
    }
    None
}

pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s}"),
            Self::DateTime(dt) => write!(f, "{}", format_datetime(dt)),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Dict(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Self::Document(doc) => write!(f, "<{}>", doc.doc_type().name()),
            Self::Reference(r) => write!(f, "<ref {:?} {}>", r.target, r.id),
            Self::Linked(doc) => write!(f, "<{} (linked)>", doc.doc_type().name()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::DateTime(dt)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self::Dict(map)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Self::Document(Box::new(doc))
    }
}

impl From<DocRef> for Value {
    fn from(r: DocRef) -> Self {
        Self::Reference(r)
    }
}

impl From<JsonValue> for Value {
    fn from(json: JsonValue) -> Self {
        Self::from_json(&json)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_structural_round_trip() {
        let json = json!({"a": 1, "b": [true, "x", 1.5], "c": null});
        let value = Value::from_json(&json);
        assert_eq!(value.to_json().unwrap(), json);
    }

    #[test]
    fn test_dbref_decodes_as_reference() {
        let value = Value::from(json!({"$ref": "users", "$id": 7}));
        let r = value.as_reference().unwrap();
        assert_eq!(
            r.target,
            RefTarget::Collection {
                collection: "users".into(),
                class_name: None
            }
        );
        assert_eq!(r.id, json!(7));
    }

    #[test]
    fn test_generic_envelope_keeps_class_name() {
        let value = Value::from(json!({"_cls": "User", "_ref": {"$ref": "users", "$id": "u1"}}));
        let r = value.as_reference().unwrap();
        assert_eq!(
            r.target,
            RefTarget::Collection {
                collection: "users".into(),
                class_name: Some("User".into())
            }
        );
    }

    #[test]
    fn test_negated() {
        assert_eq!(Value::Int(5).negated(), Some(Value::Int(-5)));
        assert_eq!(Value::Float(1.5).negated(), Some(Value::Float(-1.5)));
        assert_eq!(Value::from("x").negated(), None);
    }
}
