pub mod changes;
pub mod observed;

pub use changes::ChangeSet;
pub use observed::{Observed, ObservedDict, ObservedList, observe};

use crate::core::value::CLASS_KEY;
use crate::core::{OdmError, RawDocument, Result, Value};
use crate::delta::{DeltaMode, clear_changed_fields, compute_delta};
use crate::schema::{DocumentType, FieldDescriptor, FieldKind, Registry, ScalarType};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Level, event};

static NULL: Value = Value::Null;

/// A document instance: field values keyed by attribute name, the dirty
/// paths recorded since the last clear and the raw snapshot it was loaded
/// from (`None` for a record that was never persisted).
#[derive(Debug, Clone)]
pub struct Document {
    doc_type: Arc<DocumentType>,
    values: BTreeMap<String, Value>,
    changed: ChangeSet,
    raw: Option<RawDocument>,
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.doc_type.class_name() == other.doc_type.class_name() && self.values == other.values
    }
}

impl Document {
    pub fn new(doc_type: &Arc<DocumentType>) -> Self {
        Self {
            doc_type: Arc::clone(doc_type),
            values: BTreeMap::new(),
            changed: ChangeSet::new(),
            raw: None,
        }
    }

    /// New document populated from `(attribute, value)` pairs. Initial values
    /// are not recorded as changes.
    pub fn with_values<I, K, V>(doc_type: &Arc<DocumentType>, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut doc = Self::new(doc_type);
        for (name, value) in values {
            let name = doc.attribute_name(name.as_ref())?;
            doc.values.insert(name, value.into());
        }
        Ok(doc)
    }

    /// Decodes a raw storage document. Storage names are translated back to
    /// attribute names, `_cls` is dropped and unknown keys survive only on
    /// dynamic types.
    pub fn from_storage(
        registry: &Registry,
        doc_type: &Arc<DocumentType>,
        raw: RawDocument,
    ) -> Result<Self> {
        let mut values = BTreeMap::new();
        for (key, json) in &raw {
            if key == CLASS_KEY {
                continue;
            }
            match doc_type.field_by_db_name(key) {
                Some(field) => {
                    values.insert(field.name().to_string(), field.from_storage(registry, json)?);
                }
                None if doc_type.is_dynamic() => {
                    values.insert(key.clone(), Value::from_json(json));
                }
                None => {
                    event!(
                        Level::DEBUG,
                        doc_type = doc_type.name(),
                        key = key.as_str(),
                        "dropping unknown stored key"
                    );
                }
            }
        }
        Ok(Self {
            doc_type: Arc::clone(doc_type),
            values,
            changed: ChangeSet::new(),
            raw: Some(raw),
        })
    }

    pub fn doc_type(&self) -> &Arc<DocumentType> {
        &self.doc_type
    }

    /// True until the document has been saved or was loaded from storage.
    pub fn is_new(&self) -> bool {
        self.raw.is_none()
    }

    pub fn raw(&self) -> Option<&RawDocument> {
        self.raw.as_ref()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        let name = self.alias(name);
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn pk(&self) -> Option<&Value> {
        self.doc_type
            .primary_key()
            .and_then(|pk| self.values.get(pk))
            .filter(|v| !v.is_null())
    }

    /// Storage form of the primary key, `null` when unset.
    pub fn pk_json(&self) -> Result<JsonValue> {
        match (self.doc_type.primary_key_field(), self.pk()) {
            (Some(field), Some(value)) => field.to_storage(value),
            _ => Ok(JsonValue::Null),
        }
    }

    /// Assigns the primary key without recording a change.
    pub fn set_pk(&mut self, value: impl Into<Value>) -> Result<()> {
        let pk = self
            .doc_type
            .primary_key()
            .ok_or_else(|| {
                OdmError::Operation(format!(
                    "'{}' has no primary key",
                    self.doc_type.name()
                ))
            })?
            .to_string();
        self.values.insert(pk, value.into());
        Ok(())
    }

    /// Assigns a field; the attribute is marked dirty when the value differs.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let name = self.attribute_name(name)?;
        let value = value.into();
        if self.values.get(&name) == Some(&value) {
            return Ok(());
        }
        self.changed.mark(&name);
        self.values.insert(name, value);
        Ok(())
    }

    pub fn unset(&mut self, name: &str) -> Result<()> {
        self.set(name, Value::Null)
    }

    /// Records `path` as dirty without touching any value.
    pub fn mark_changed(&mut self, path: &str) {
        self.changed.mark(path);
    }

    /// Dirty paths recorded on this document (embedded documents keep their own).
    pub fn changed_fields(&self) -> &ChangeSet {
        &self.changed
    }

    pub fn list_mut(&mut self, name: &str) -> Result<ObservedList<'_>> {
        let name = self.attribute_name(name)?;
        self.check_container(&name, "list", |kind| matches!(kind, FieldKind::List(_)))?;
        let Self { values, changed, .. } = self;
        let slot = values.entry(name.clone()).or_insert(Value::Null);
        if slot.is_null() {
            *slot = Value::List(Vec::new());
        }
        match slot {
            Value::List(items) => Ok(ObservedList::new(items, Some(changed), name)),
            other => Err(OdmError::Operation(format!(
                "Field '{name}' holds a {}, not a list",
                other.type_name()
            ))),
        }
    }

    pub fn dict_mut(&mut self, name: &str) -> Result<ObservedDict<'_>> {
        let name = self.attribute_name(name)?;
        self.check_container(&name, "dict", |kind| matches!(kind, FieldKind::Dict(_)))?;
        let Self { values, changed, .. } = self;
        let slot = values.entry(name.clone()).or_insert(Value::Null);
        if slot.is_null() {
            *slot = Value::Dict(BTreeMap::new());
        }
        match slot {
            Value::Dict(map) => Ok(ObservedDict::new(map, Some(changed), name)),
            other => Err(OdmError::Operation(format!(
                "Field '{name}' holds a {}, not a dict",
                other.type_name()
            ))),
        }
    }

    pub fn embedded_mut(&mut self, name: &str) -> Result<&mut Document> {
        let name = self.attribute_name(name)?;
        match self.values.get_mut(&name) {
            Some(Value::Document(doc)) => Ok(doc),
            Some(other) => Err(OdmError::Operation(format!(
                "Field '{name}' holds a {}, not an embedded document",
                other.type_name()
            ))),
            None => Err(OdmError::Operation(format!("Field '{name}' is not set"))),
        }
    }

    /// Observed view of any field. Unset list and dict fields start out as
    /// empty containers; other unset fields observe as `null`.
    pub fn observe_field(&mut self, name: &str) -> Result<Observed<'_>> {
        let name = self.attribute_name(name)?;
        let container = match self.doc_type.field(&name).map(FieldDescriptor::kind) {
            Some(FieldKind::List(_)) => Some(Value::List(Vec::new())),
            Some(FieldKind::Dict(_)) => Some(Value::Dict(BTreeMap::new())),
            _ => None,
        };
        let Self { values, changed, .. } = self;
        if !values.get(&name).is_some_and(|v| !v.is_null()) {
            match container {
                Some(empty) => {
                    values.insert(name.clone(), empty);
                }
                None => return Ok(Observed::Value(&NULL)),
            }
        }
        match values.get_mut(&name) {
            Some(value) => Ok(observe(value, Some(changed), name)),
            None => Ok(Observed::Value(&NULL)),
        }
    }

    /// Runs field validation over every declared field.
    pub fn validate(&self) -> Result<()> {
        for field in self.doc_type.fields() {
            if Some(field.name()) == self.doc_type.primary_key() {
                continue;
            }
            field.validate(self.values.get(field.name()).unwrap_or(&NULL))?;
        }
        Ok(())
    }

    /// Materializes defaults of unset fields, recursing into embedded documents.
    pub fn apply_defaults(&mut self) {
        for field in self.doc_type.fields() {
            if !self.values.contains_key(field.name()) {
                if let Some(default) = field.default_value() {
                    self.values.insert(field.name().to_string(), default);
                }
            }
        }
        for value in self.values.values_mut() {
            apply_nested_defaults(value);
        }
    }

    /// Records the stored form after a successful write and clears every
    /// dirty set reachable from this document.
    pub fn mark_persisted(&mut self, raw: RawDocument) {
        self.raw = Some(raw);
        clear_changed_fields(self);
    }

    /// Full storage encoding (the set side of a full delta).
    pub fn to_storage(&self) -> Result<RawDocument> {
        Ok(compute_delta(self, DeltaMode::Full)?.sets)
    }

    pub(crate) fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut BTreeMap<String, Value>, &mut ChangeSet) {
        (&mut self.values, &mut self.changed)
    }

    /// Field descriptor for an attribute, synthesized for dynamic fields.
    pub(crate) fn descriptor(&self, name: &str) -> Option<FieldDescriptor> {
        match self.doc_type.field(name) {
            Some(field) => Some(field.clone()),
            None if self.doc_type.is_dynamic() => Some(FieldDescriptor::any(name)),
            None => None,
        }
    }

    /// Untyped and dynamic fields accept any container; declared fields only
    /// their own kind.
    fn check_container<F>(&self, name: &str, container: &str, accepts: F) -> Result<()>
    where
        F: Fn(&FieldKind) -> bool,
    {
        let Some(field) = self.descriptor(name) else {
            return Err(OdmError::Lookup(name.to_string()));
        };
        match field.kind() {
            FieldKind::Scalar(ScalarType::Any) => Ok(()),
            kind if accepts(kind) => Ok(()),
            _ => Err(OdmError::Operation(format!(
                "Field '{name}' is not declared as a {container}"
            ))),
        }
    }

    fn alias<'a>(&'a self, name: &'a str) -> &'a str {
        if name == "pk" {
            self.doc_type.primary_key().unwrap_or(name)
        } else {
            name
        }
    }

    fn attribute_name(&self, name: &str) -> Result<String> {
        let name = self.alias(name);
        if self.doc_type.field(name).is_some() || self.doc_type.is_dynamic() {
            return Ok(name.to_string());
        }
        Err(OdmError::Lookup(format!(
            "The field \"{}\" does not exist on the document \"{}\"",
            name,
            self.doc_type.name()
        )))
    }
}

fn apply_nested_defaults(value: &mut Value) {
    match value {
        Value::Document(doc) => doc.apply_defaults(),
        Value::List(items) => items.iter_mut().for_each(apply_nested_defaults),
        Value::Dict(map) => map.values_mut().for_each(apply_nested_defaults),
        _ => {}
    }
}
