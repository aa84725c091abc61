use crate::core::value::ID_KEY;
use crate::core::{OdmError, Result};
use crate::schema::{FieldDescriptor, ScalarType};
use std::collections::HashSet;
use std::sync::Arc;

/// Immutable descriptor table of a document type.
///
/// Built once through [`DocumentTypeBuilder`] and shared behind an `Arc`;
/// instances hold a handle to it instead of rebuilding it.
#[derive(Debug, Clone)]
pub struct DocumentType {
    name: String,
    class_name: String,
    collection: Option<String>,
    fields: Vec<FieldDescriptor>,
    primary_key: Option<String>,
    dynamic: bool,
    allow_inheritance: bool,
    superclass: Option<String>,
}

impl DocumentType {
    /// Top-level document type stored in `collection`.
    pub fn builder(name: impl Into<String>) -> DocumentTypeBuilder {
        DocumentTypeBuilder::new(name.into())
    }

    /// Document type that only lives embedded inside another document.
    pub fn embedded(name: impl Into<String>) -> DocumentTypeBuilder {
        let mut builder = DocumentTypeBuilder::new(name.into());
        builder.embedded = true;
        builder
    }

    /// Subclass of a polymorphic type; inherits its fields, collection and
    /// primary key.
    pub fn subclass(name: impl Into<String>, parent: &Arc<DocumentType>) -> DocumentTypeBuilder {
        let name = name.into();
        let mut builder = DocumentTypeBuilder::new(name.clone());
        builder.class_name = format!("{}.{}", parent.class_name, name);
        builder.collection = parent.collection.clone();
        builder.embedded = parent.collection.is_none();
        builder.fields = parent.fields.clone();
        builder.primary_key = parent.primary_key.clone();
        builder.dynamic = parent.dynamic;
        builder.allow_inheritance = true;
        builder.superclass = Some(parent.name.clone());
        builder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted inheritance chain (`Animal.Dog`), stored as the discriminator.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    pub fn primary_key_field(&self) -> Option<&FieldDescriptor> {
        self.primary_key.as_deref().and_then(|pk| self.field(pk))
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn is_embedded(&self) -> bool {
        self.collection.is_none()
    }

    pub fn superclass(&self) -> Option<&str> {
        self.superclass.as_deref()
    }

    pub fn allows_inheritance(&self) -> bool {
        self.allow_inheritance
    }

    /// Whether the type takes part in an inheritance hierarchy and therefore
    /// needs the `_cls` discriminator on the wire.
    pub fn is_polymorphic(&self) -> bool {
        self.allow_inheritance || self.superclass.is_some()
    }

    pub fn is_subclass_of(&self, other: &DocumentType) -> bool {
        self.class_name == other.class_name
            || self
                .class_name
                .strip_prefix(other.class_name.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    }

    /// Field by attribute name.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name() == name)
    }

    /// Field by storage name.
    pub fn field_by_db_name(&self, db_name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.db_name() == db_name)
    }
}

pub struct DocumentTypeBuilder {
    name: String,
    class_name: String,
    collection: Option<String>,
    embedded: bool,
    fields: Vec<FieldDescriptor>,
    primary_key: Option<String>,
    dynamic: bool,
    allow_inheritance: bool,
    superclass: Option<String>,
}

impl DocumentTypeBuilder {
    fn new(name: String) -> Self {
        Self {
            class_name: name.clone(),
            name,
            collection: None,
            embedded: false,
            fields: Vec::new(),
            primary_key: None,
            dynamic: false,
            allow_inheritance: false,
            superclass: None,
        }
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Adds a field; a field of the same name (inherited) is replaced.
    pub fn field(mut self, field: FieldDescriptor) -> Self {
        match self.fields.iter_mut().find(|f| f.name() == field.name()) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
        self
    }

    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        self.primary_key = Some(name.into());
        self
    }

    /// Unknown fields are accepted and stored as they come.
    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    pub fn allow_inheritance(mut self) -> Self {
        self.allow_inheritance = true;
        self
    }

    pub fn build(mut self) -> Result<Arc<DocumentType>> {
        if self.embedded {
            self.collection = None;
            if let Some(pk) = &self.primary_key {
                return Err(OdmError::Operation(format!(
                    "Embedded document '{}' cannot declare primary key '{}'",
                    self.name, pk
                )));
            }
        } else {
            let collection = self
                .collection
                .get_or_insert_with(|| default_collection_name(&self.name))
                .clone();
            if collection.is_empty() {
                return Err(OdmError::Operation(format!(
                    "Document '{}' has an empty collection name",
                    self.name
                )));
            }
            self.assign_primary_key()?;
        }

        let mut names = HashSet::new();
        let mut db_names = HashSet::new();
        for field in &self.fields {
            if !names.insert(field.name().to_string()) {
                return Err(OdmError::Operation(format!(
                    "Field '{}' is declared twice on '{}'",
                    field.name(),
                    self.name
                )));
            }
            if !db_names.insert(field.db_name().to_string()) {
                return Err(OdmError::Operation(format!(
                    "Storage name '{}' is used twice on '{}'",
                    field.db_name(),
                    self.name
                )));
            }
        }

        Ok(Arc::new(DocumentType {
            name: self.name,
            class_name: self.class_name,
            collection: self.collection,
            fields: self.fields,
            primary_key: self.primary_key,
            dynamic: self.dynamic,
            allow_inheritance: self.allow_inheritance,
            superclass: self.superclass,
        }))
    }

    /// The primary key is always stored as `_id`; without a declared one an
    /// implicit `id` field is prepended.
    fn assign_primary_key(&mut self) -> Result<()> {
        let pk = match &self.primary_key {
            Some(pk) => pk.clone(),
            None => {
                if self.fields.iter().any(|f| f.name() == "id") {
                    return Err(OdmError::Operation(format!(
                        "Document '{}' declares an 'id' field without marking it as primary key",
                        self.name
                    )));
                }
                self.fields
                    .insert(0, FieldDescriptor::scalar("id", ScalarType::ObjectId));
                self.primary_key = Some("id".to_string());
                "id".to_string()
            }
        };
        let field = self
            .fields
            .iter_mut()
            .find(|f| f.name() == pk)
            .ok_or_else(|| {
                OdmError::Operation(format!(
                    "Primary key '{}' is not a field of '{}'",
                    pk, self.name
                ))
            })?;
        field.set_db_name(ID_KEY);
        Ok(())
    }
}

fn default_collection_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_implicit_primary_key() {
        let t = DocumentType::builder("BlogPost")
            .field(FieldDescriptor::string("title"))
            .build()
            .unwrap();
        assert_eq!(t.collection(), Some("blog_post"));
        assert_eq!(t.primary_key(), Some("id"));
        assert_eq!(t.fields()[0].db_name(), "_id");
    }

    #[test]
    fn test_declared_primary_key_is_stored_as_id() {
        let t = DocumentType::builder("User")
            .collection("users")
            .field(FieldDescriptor::string("email"))
            .primary_key("email")
            .build()
            .unwrap();
        assert_eq!(t.field("email").unwrap().db_name(), "_id");
        assert!(t.field("id").is_none());
    }

    #[test]
    fn test_duplicate_storage_name_rejected() {
        let err = DocumentType::embedded("Pair")
            .field(FieldDescriptor::int("a").db_field("x"))
            .field(FieldDescriptor::int("b").db_field("x"))
            .build()
            .unwrap_err();
        assert!(matches!(err, OdmError::Operation(_)));
    }

    #[test]
    fn test_subclass_inherits_fields() {
        let animal = DocumentType::builder("Animal")
            .collection("animals")
            .allow_inheritance()
            .field(FieldDescriptor::string("name"))
            .build()
            .unwrap();
        let dog = DocumentType::subclass("Dog", &animal)
            .field(FieldDescriptor::bool("good_boy"))
            .build()
            .unwrap();
        assert_eq!(dog.class_name(), "Animal.Dog");
        assert_eq!(dog.collection(), Some("animals"));
        assert!(dog.field("name").is_some());
        assert!(dog.is_subclass_of(&animal));
        assert!(!animal.is_subclass_of(&dog));
        assert!(dog.is_polymorphic());
    }
}
