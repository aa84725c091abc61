//! Path-addressed field resolution.
//!
//! Turns a user-facing path (`author__address__city`, `comments.0.body`)
//! into the chain of descriptors it walks through, so callers can map it to
//! storage names and pick the terminal descriptor for value coercion.

use crate::core::{OdmError, Result};
use crate::schema::{DocumentType, FieldDescriptor, FieldKind, Registry, ScalarType};
use std::sync::Arc;

/// One resolved segment of a path.
#[derive(Debug, Clone)]
pub enum PathElement {
    Field(FieldDescriptor),
    /// Array index or positional operator, passed through unresolved.
    Raw(String),
}

impl PathElement {
    pub fn storage_name(&self) -> &str {
        match self {
            Self::Field(field) => field.db_name(),
            Self::Raw(raw) => raw,
        }
    }

    pub fn as_field(&self) -> Option<&FieldDescriptor> {
        match self {
            Self::Field(field) => Some(field),
            Self::Raw(_) => None,
        }
    }
}

/// Splits a keyword path on `__`.
pub fn split_keyword(path: &str) -> Vec<String> {
    path.split("__").map(str::to_string).collect()
}

/// Splits a dotted path on `.`.
pub fn split_dotted(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

/// Dotted storage key of a resolved path.
pub fn storage_path(elements: &[PathElement]) -> String {
    elements
        .iter()
        .map(PathElement::storage_name)
        .collect::<Vec<_>>()
        .join(".")
}

/// Last resolved descriptor of a path.
pub fn terminal_field(elements: &[PathElement]) -> Option<&FieldDescriptor> {
    elements.iter().rev().find_map(PathElement::as_field)
}

pub fn is_index(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

fn is_positional(segment: &str) -> bool {
    is_index(segment) || segment == "$" || segment == "S"
}

enum Scope {
    Document(Arc<DocumentType>),
    Field(FieldDescriptor),
    Dynamic,
}

fn scope_for(field: &FieldDescriptor) -> Scope {
    match field.kind() {
        FieldKind::Embedded(doc_type) => Scope::Document(Arc::clone(doc_type)),
        FieldKind::Scalar(ScalarType::Any) => Scope::Dynamic,
        _ => Scope::Field(field.clone()),
    }
}

/// Resolves `segments` against `doc_type`.
///
/// Numeric segments (and the positional operators `$` / `S`) inside list
/// context pass through as [`PathElement::Raw`]; `pk` aliases the primary key;
/// walking through a reference fails, since that would be a join.
pub fn resolve<S: AsRef<str>>(
    registry: &Registry,
    doc_type: &Arc<DocumentType>,
    segments: &[S],
) -> Result<Vec<PathElement>> {
    let full_path = segments
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("__");
    let mut elements = Vec::with_capacity(segments.len());
    let mut scope = Scope::Document(Arc::clone(doc_type));
    for segment in segments {
        scope = step(registry, scope, segment.as_ref(), &full_path, &mut elements)?;
    }
    Ok(elements)
}

fn step(
    registry: &Registry,
    scope: Scope,
    segment: &str,
    full_path: &str,
    elements: &mut Vec<PathElement>,
) -> Result<Scope> {
    match scope {
        Scope::Document(doc_type) => {
            let field = lookup_on_type(registry, &doc_type, segment)?;
            let next = scope_for(&field);
            elements.push(PathElement::Field(field));
            Ok(next)
        }
        Scope::Dynamic => {
            if is_index(segment) {
                elements.push(PathElement::Raw(segment.to_string()));
            } else {
                elements.push(PathElement::Field(FieldDescriptor::any(segment)));
            }
            Ok(Scope::Dynamic)
        }
        Scope::Field(field) => match field.kind() {
            FieldKind::List(element) => {
                if is_positional(segment) {
                    let raw = if segment == "S" { "$" } else { segment };
                    elements.push(PathElement::Raw(raw.to_string()));
                    Ok(scope_for(element))
                } else {
                    step(registry, scope_for(element), segment, full_path, elements)
                }
            }
            FieldKind::Dict(element) => {
                let keyed = element.renamed(segment);
                let next = scope_for(&keyed);
                elements.push(PathElement::Field(keyed));
                Ok(next)
            }
            FieldKind::Reference(_) | FieldKind::GenericReference => Err(OdmError::Lookup(
                format!("Cannot perform join in mongoDB: {full_path}"),
            )),
            FieldKind::Embedded(doc_type) => step(
                registry,
                Scope::Document(Arc::clone(doc_type)),
                segment,
                full_path,
                elements,
            ),
            FieldKind::Scalar(_) => Err(OdmError::Lookup(format!(
                "Cannot resolve subfield or operator {} on the field {}",
                segment,
                field.name()
            ))),
        },
    }
}

fn lookup_on_type(
    registry: &Registry,
    doc_type: &Arc<DocumentType>,
    segment: &str,
) -> Result<FieldDescriptor> {
    let name = if segment == "pk" {
        doc_type.primary_key().unwrap_or(segment)
    } else {
        segment
    };
    if let Some(field) = doc_type
        .field(name)
        .or_else(|| doc_type.field_by_db_name(name))
    {
        return Ok(field.clone());
    }
    if doc_type.allows_inheritance() {
        for subclass in registry.subclasses_of(doc_type) {
            if let Some(field) = subclass.field(name) {
                return Ok(field.clone());
            }
        }
    }
    if doc_type.is_dynamic() {
        return Ok(FieldDescriptor::any(name));
    }
    Err(OdmError::Lookup(format!("Cannot resolve field \"{name}\"")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Registry, Arc<DocumentType>) {
        let comment = DocumentType::embedded("Comment")
            .field(FieldDescriptor::string("body").db_field("b"))
            .field(FieldDescriptor::string("author"))
            .build()
            .unwrap();
        let post = DocumentType::builder("Post")
            .collection("posts")
            .field(FieldDescriptor::string("title").db_field("t"))
            .field(FieldDescriptor::list("comments", FieldKind::Embedded(comment)))
            .field(FieldDescriptor::list("tags", FieldKind::Scalar(ScalarType::String)))
            .field(FieldDescriptor::dict("meta", FieldKind::Scalar(ScalarType::Int)))
            .field(FieldDescriptor::reference("owner", "User"))
            .field(FieldDescriptor::any("extra"))
            .build()
            .unwrap();
        let registry = Registry::new().with_type(Arc::clone(&post)).unwrap();
        (registry, post)
    }

    fn storage(registry: &Registry, t: &Arc<DocumentType>, path: &str) -> Result<String> {
        resolve(registry, t, &split_keyword(path)).map(|elements| storage_path(&elements))
    }

    #[test]
    fn test_storage_names() {
        let (registry, post) = setup();
        assert_eq!(storage(&registry, &post, "title").unwrap(), "t");
        assert_eq!(storage(&registry, &post, "pk").unwrap(), "_id");
        assert_eq!(storage(&registry, &post, "comments__body").unwrap(), "comments.b");
        assert_eq!(storage(&registry, &post, "comments__2__body").unwrap(), "comments.2.b");
        assert_eq!(storage(&registry, &post, "comments__S__body").unwrap(), "comments.$.b");
        assert_eq!(storage(&registry, &post, "tags__0").unwrap(), "tags.0");
        assert_eq!(storage(&registry, &post, "meta__color").unwrap(), "meta.color");
        assert_eq!(storage(&registry, &post, "extra__a__1__b").unwrap(), "extra.a.1.b");
    }

    #[test]
    fn test_terminal_field() {
        let (registry, post) = setup();
        let elements = resolve(&registry, &post, &split_keyword("comments__0__author")).unwrap();
        assert_eq!(terminal_field(&elements).unwrap().name(), "author");
        assert!(matches!(elements[1], PathElement::Raw(ref raw) if raw == "0"));
    }

    #[test]
    fn test_unknown_field() {
        let (registry, post) = setup();
        let err = storage(&registry, &post, "nope").unwrap_err();
        assert!(matches!(err, OdmError::Lookup(ref msg) if msg.contains("nope")));
    }

    #[test]
    fn test_join_refused() {
        let (registry, post) = setup();
        let err = storage(&registry, &post, "owner__name").unwrap_err();
        assert!(matches!(err, OdmError::Lookup(ref msg) if msg.contains("join")));
    }

    #[test]
    fn test_subfield_of_scalar_refused() {
        let (registry, post) = setup();
        assert!(storage(&registry, &post, "title__x").is_err());
        assert!(storage(&registry, &post, "tags__x").is_err());
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let (registry, post) = setup();
        let a = storage(&registry, &post, "comments__1__author").unwrap();
        let b = storage(&registry, &post, "comments__1__author").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_subclass_field_lookup() {
        let animal = DocumentType::builder("Animal")
            .collection("animals")
            .allow_inheritance()
            .build()
            .unwrap();
        let dog = DocumentType::subclass("Dog", &animal)
            .field(FieldDescriptor::string("bark").db_field("bk"))
            .build()
            .unwrap();
        let registry = Registry::new()
            .with_type(Arc::clone(&animal))
            .unwrap()
            .with_type(dog)
            .unwrap();
        assert_eq!(storage(&registry, &animal, "bark").unwrap(), "bk");
    }

    #[test]
    fn test_dynamic_type_accepts_unknown_fields() {
        let t = DocumentType::builder("Loose").dynamic().build().unwrap();
        let registry = Registry::new().with_type(Arc::clone(&t)).unwrap();
        assert_eq!(storage(&registry, &t, "whatever__deep").unwrap(), "whatever.deep");
    }
}
