use crate::core::value::CLASS_KEY;
use crate::core::{OdmError, RawDocument, Result};
use crate::schema::{DocumentType, FieldDescriptor, FieldKind};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

lazy_static! {
    static ref GLOBAL_REGISTRY: RwLock<Registry> = RwLock::new(Registry::new());
}

/// Table of document types, keyed by type name.
///
/// Immutable once built: registering returns a new `Registry`, so clones can
/// be handed out without locks (copy-on-write like the storage catalog).
#[derive(Clone, Default)]
pub struct Registry {
    types: Arc<HashMap<String, Arc<DocumentType>>>,
    /// class name → type name
    classes: Arc<HashMap<String, String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the process-wide registry.
    pub fn global() -> Result<Self> {
        Ok(GLOBAL_REGISTRY.read()?.clone())
    }

    /// Registers a type in the process-wide registry.
    pub fn register_global(doc_type: Arc<DocumentType>) -> Result<()> {
        let mut global = GLOBAL_REGISTRY.write()?;
        let updated = global.clone().with_type(doc_type)?;
        *global = updated;
        Ok(())
    }

    /// Adds a type (and any embedded types it carries that are not yet
    /// known) - returns a NEW registry.
    pub fn with_type(self, doc_type: Arc<DocumentType>) -> Result<Self> {
        if self.types.contains_key(doc_type.name()) {
            return Err(OdmError::AlreadyRegistered(doc_type.name().to_string()));
        }
        let mut types = (*self.types).clone();
        let mut classes = (*self.classes).clone();
        insert_type(&mut types, &mut classes, doc_type);
        Ok(Self {
            types: Arc::new(types),
            classes: Arc::new(classes),
        })
    }

    /// In-place variant of [`Registry::with_type`].
    pub fn register(&mut self, doc_type: Arc<DocumentType>) -> Result<()> {
        let updated = self.clone().with_type(doc_type)?;
        *self = updated;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<DocumentType>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| OdmError::NotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Type by its discriminator (`Animal.Dog`) or its bare name.
    pub fn by_class_name(&self, class_name: &str) -> Option<Arc<DocumentType>> {
        self.classes
            .get(class_name)
            .and_then(|name| self.types.get(name))
            .or_else(|| self.types.get(class_name))
            .cloned()
    }

    /// Root type stored in `collection` (the one without a superclass).
    pub fn for_collection(&self, collection: &str) -> Option<Arc<DocumentType>> {
        let mut candidates: Vec<_> = self
            .types
            .values()
            .filter(|t| t.collection() == Some(collection))
            .collect();
        candidates.sort_by_key(|t| t.class_name().matches('.').count());
        candidates.first().map(|t| Arc::clone(t))
    }

    /// All registered strict subclasses of `doc_type`.
    pub fn subclasses_of(&self, doc_type: &DocumentType) -> Vec<Arc<DocumentType>> {
        let mut subclasses: Vec<_> = self
            .types
            .values()
            .filter(|t| t.class_name() != doc_type.class_name() && t.is_subclass_of(doc_type))
            .cloned()
            .collect();
        subclasses.sort_by(|a, b| a.class_name().cmp(b.class_name()));
        subclasses
    }

    /// Picks the concrete type for a raw document using its `_cls`
    /// discriminator; falls back to `declared` when the discriminator is
    /// absent, unknown or not a subclass of it.
    pub fn polymorphic_type(
        &self,
        declared: &Arc<DocumentType>,
        raw: &RawDocument,
    ) -> Arc<DocumentType> {
        raw.get(CLASS_KEY)
            .and_then(|c| c.as_str())
            .and_then(|class_name| self.by_class_name(class_name))
            .filter(|t| t.is_subclass_of(declared))
            .unwrap_or_else(|| Arc::clone(declared))
    }

    pub fn type_names(&self) -> Vec<&str> {
        self.types.keys().map(|s| s.as_str()).collect()
    }
}

fn insert_type(
    types: &mut HashMap<String, Arc<DocumentType>>,
    classes: &mut HashMap<String, String>,
    doc_type: Arc<DocumentType>,
) {
    for field in doc_type.fields() {
        register_embedded(types, classes, field);
    }
    classes.insert(doc_type.class_name().to_string(), doc_type.name().to_string());
    types.insert(doc_type.name().to_string(), doc_type);
}

fn register_embedded(
    types: &mut HashMap<String, Arc<DocumentType>>,
    classes: &mut HashMap<String, String>,
    field: &FieldDescriptor,
) {
    match field.kind() {
        FieldKind::Embedded(embedded) if !types.contains_key(embedded.name()) => {
            insert_type(types, classes, Arc::clone(embedded));
        }
        FieldKind::List(el) | FieldKind::Dict(el) => register_embedded(types, classes, el),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn animals() -> (Arc<DocumentType>, Arc<DocumentType>) {
        let animal = DocumentType::builder("Animal")
            .collection("animals")
            .allow_inheritance()
            .field(FieldDescriptor::string("name"))
            .build()
            .unwrap();
        let dog = DocumentType::subclass("Dog", &animal).build().unwrap();
        (animal, dog)
    }

    #[test]
    fn test_with_type_is_copy_on_write() {
        let (animal, _) = animals();
        let empty = Registry::new();
        let registry = empty.clone().with_type(animal).unwrap();
        assert!(registry.contains("Animal"));
        assert!(!empty.contains("Animal"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let (animal, _) = animals();
        let mut registry = Registry::new();
        registry.register(Arc::clone(&animal)).unwrap();
        assert!(matches!(
            registry.register(animal),
            Err(OdmError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_embedded_types_registered_transitively() {
        let address = DocumentType::embedded("Address")
            .field(FieldDescriptor::string("city"))
            .build()
            .unwrap();
        let person = DocumentType::builder("Person")
            .field(FieldDescriptor::embedded("address", &address))
            .build()
            .unwrap();
        let registry = Registry::new().with_type(person).unwrap();
        assert!(registry.get("Address").is_ok());
    }

    #[test]
    fn test_polymorphic_lookup() {
        let (animal, dog) = animals();
        let mut registry = Registry::new();
        registry.register(Arc::clone(&animal)).unwrap();
        registry.register(Arc::clone(&dog)).unwrap();

        let raw = json!({"_cls": "Animal.Dog", "name": "Rex"});
        let chosen = registry.polymorphic_type(&animal, raw.as_object().unwrap());
        assert_eq!(chosen.name(), "Dog");
        assert_eq!(registry.for_collection("animals").unwrap().name(), "Animal");
        assert_eq!(registry.subclasses_of(&animal).len(), 1);
    }
}
