use crate::core::value::{CLASS_KEY, dbref_from_json, format_datetime, parse_datetime};
use crate::core::{DocRef, OdmError, RefTarget, Result, Value};
use crate::document::Document;
use crate::schema::{DocumentType, Registry};
use serde_json::{Map, Value as JsonValue, json};
use std::fmt;
use std::sync::Arc;

/// Validation hook run on every non-null value before it is encoded.
pub type Validator = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// Default of a field: a fixed value or a zero-argument generator.
#[derive(Clone)]
pub enum FieldDefault {
    Value(Value),
    Generator(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl FieldDefault {
    pub fn resolve(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Generator(generate) => generate(),
        }
    }
}

impl fmt::Debug for FieldDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Generator(_) => write!(f, "Generator(..)"),
        }
    }
}

/// Primitive value types understood by the field system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    /// Untyped; values are stored structurally.
    Any,
    String,
    Int,
    Float,
    Bool,
    DateTime,
    ObjectId,
    /// Legacy `[x, y]` pair indexed as a flat 2d point.
    GeoPoint,
    /// GeoJSON geometries indexed as 2dsphere.
    Point,
    LineString,
    Polygon,
}

impl ScalarType {
    pub fn is_geo(self) -> bool {
        matches!(
            self,
            Self::GeoPoint | Self::Point | Self::LineString | Self::Polygon
        )
    }

    fn geojson_type(self) -> Option<&'static str> {
        match self {
            Self::Point => Some("Point"),
            Self::LineString => Some("LineString"),
            Self::Polygon => Some("Polygon"),
            _ => None,
        }
    }
}

/// Behavioural kind of a field.
#[derive(Debug, Clone)]
pub enum FieldKind {
    Scalar(ScalarType),
    Embedded(Arc<DocumentType>),
    /// Reference to a document of a fixed type, stored as the bare id.
    Reference(String),
    /// Reference to a document of any type, stored with its collection and class.
    GenericReference,
    List(Box<FieldDescriptor>),
    Dict(Box<FieldDescriptor>),
}

impl FieldKind {
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference(_) | Self::GenericReference)
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    pub fn element(&self) -> Option<&FieldDescriptor> {
        match self {
            Self::List(el) | Self::Dict(el) => Some(el),
            _ => None,
        }
    }
}

/// Describes one named attribute of a document type.
#[derive(Clone)]
pub struct FieldDescriptor {
    name: String,
    db_name: String,
    required: bool,
    kind: FieldKind,
    default: Option<FieldDefault>,
    validator: Option<Validator>,
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("db_name", &self.db_name)
            .field("required", &self.required)
            .field("kind", &self.kind)
            .field("default", &self.default)
            .finish()
    }
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        Self {
            db_name: name.clone(),
            name,
            required: false,
            kind,
            default: None,
            validator: None,
        }
    }

    pub fn scalar(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self::new(name, FieldKind::Scalar(scalar))
    }

    pub fn any(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Any)
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::String)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Float)
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Bool)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::DateTime)
    }

    pub fn object_id(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::ObjectId)
    }

    pub fn geo_point(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::GeoPoint)
    }

    pub fn point(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Point)
    }

    pub fn polygon(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Polygon)
    }

    pub fn embedded(name: impl Into<String>, doc_type: &Arc<DocumentType>) -> Self {
        Self::new(name, FieldKind::Embedded(Arc::clone(doc_type)))
    }

    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Reference(target.into()))
    }

    pub fn generic_reference(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::GenericReference)
    }

    /// List whose elements are described by `element` (its name is replaced
    /// by the list's own).
    pub fn list(name: impl Into<String>, element: FieldKind) -> Self {
        let name = name.into();
        let element = Self::new(name.clone(), element);
        Self::new(name, FieldKind::List(Box::new(element)))
    }

    pub fn list_of(name: impl Into<String>, element: FieldDescriptor) -> Self {
        let name = name.into();
        let element = element.renamed(&name);
        Self::new(name, FieldKind::List(Box::new(element)))
    }

    pub fn dict(name: impl Into<String>, element: FieldKind) -> Self {
        let name = name.into();
        let element = Self::new(name.clone(), element);
        Self::new(name, FieldKind::Dict(Box::new(element)))
    }

    /// Sets the storage-facing name.
    pub fn db_field(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = db_name.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(FieldDefault::Value(value.into()));
        self
    }

    pub fn default_with<F>(mut self, generate: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.default = Some(FieldDefault::Generator(Arc::new(generate)));
        self
    }

    pub fn validate_with<F>(mut self, validate: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validate));
        self
    }

    /// Copy of this descriptor living under another name (used for dict keys
    /// and list elements).
    pub fn renamed(&self, name: &str) -> Self {
        let mut field = self.clone();
        field.name = name.to_string();
        field.db_name = name.to_string();
        field
    }

    pub(crate) fn set_db_name(&mut self, db_name: &str) {
        self.db_name = db_name.to_string();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn default_value(&self) -> Option<Value> {
        self.default.as_ref().map(FieldDefault::resolve)
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, FieldKind::Scalar(ScalarType::Any))
    }

    fn invalid(&self, message: impl Into<String>) -> OdmError {
        OdmError::validation(&self.name, message)
    }

    /// Runs the validator hook (if any) on a non-null value.
    pub fn validate(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if self.required {
                return Err(self.invalid("Field is required"));
            }
            return Ok(());
        }
        if let Some(validator) = &self.validator {
            validator(value).map_err(|message| self.invalid(message))?;
        }
        match (&self.kind, value) {
            (FieldKind::List(el), Value::List(items)) => {
                for item in items {
                    el.validate_element(item)?;
                }
            }
            (FieldKind::Dict(el), Value::Dict(map)) => {
                for item in map.values() {
                    el.validate_element(item)?;
                }
            }
            (FieldKind::Embedded(_), Value::Document(doc)) => doc.validate()?,
            _ => {}
        }
        Ok(())
    }

    fn validate_element(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        self.validate(value)
    }

    /// Encodes a value into its storage representation.
    pub fn to_storage(&self, value: &Value) -> Result<JsonValue> {
        if value.is_null() {
            return Ok(JsonValue::Null);
        }
        if let Some(validator) = &self.validator {
            validator(value).map_err(|message| self.invalid(message))?;
        }
        match &self.kind {
            FieldKind::Scalar(scalar) => self.encode_scalar(*scalar, value),
            FieldKind::Embedded(doc_type) => match value {
                Value::Document(doc) => {
                    if !doc.doc_type().is_subclass_of(doc_type) {
                        return Err(self.invalid(format!(
                            "Invalid embedded document instance provided: expected {}, got {}",
                            doc_type.name(),
                            doc.doc_type().name()
                        )));
                    }
                    Ok(JsonValue::Object(doc.to_storage()?))
                }
                Value::Dict(_) => value.to_json(),
                other => Err(self.invalid(format!(
                    "Expected an embedded document, got {}",
                    other.type_name()
                ))),
            },
            FieldKind::Reference(_) => self.encode_reference_id(value),
            FieldKind::GenericReference => self.encode_generic_reference(value),
            FieldKind::List(el) => match value {
                Value::List(items) => Ok(JsonValue::Array(
                    items
                        .iter()
                        .map(|item| el.to_storage(item))
                        .collect::<Result<Vec<_>>>()?,
                )),
                other => Err(self.invalid(format!("Expected a list, got {}", other.type_name()))),
            },
            FieldKind::Dict(el) => match value {
                Value::Dict(map) => {
                    let mut out = Map::new();
                    for (key, item) in map {
                        if key.contains('.') || key.starts_with('$') {
                            return Err(self.invalid(format!(
                                "Invalid dictionary key '{key}': must not contain '.' or start with '$'"
                            )));
                        }
                        out.insert(key.clone(), el.to_storage(item)?);
                    }
                    Ok(JsonValue::Object(out))
                }
                other => Err(self.invalid(format!("Expected a dict, got {}", other.type_name()))),
            },
        }
    }

    fn encode_scalar(&self, scalar: ScalarType, value: &Value) -> Result<JsonValue> {
        let mismatch = |value: &Value| {
            self.invalid(format!(
                "Cannot store {} in a {:?} field",
                value.type_name(),
                scalar
            ))
        };
        match (scalar, value) {
            (ScalarType::Any, _) => value.to_json(),
            (ScalarType::String, Value::String(s)) => Ok(JsonValue::String(s.clone())),
            (ScalarType::Int, Value::Int(i)) => Ok(JsonValue::from(*i)),
            (ScalarType::Int, Value::Float(f)) if f.fract() == 0.0 => Ok(JsonValue::from(*f as i64)),
            (ScalarType::Float, Value::Int(_) | Value::Float(_)) => {
                Value::Float(value.as_f64().unwrap_or_default()).to_json()
            }
            (ScalarType::Bool, Value::Bool(b)) => Ok(JsonValue::Bool(*b)),
            (ScalarType::DateTime, Value::DateTime(dt)) => Ok(JsonValue::String(format_datetime(dt))),
            (ScalarType::DateTime, Value::String(s)) => parse_datetime(s)
                .map(|dt| JsonValue::String(format_datetime(&dt)))
                .ok_or_else(|| self.invalid(format!("Invalid datetime '{s}'"))),
            (ScalarType::ObjectId, Value::String(_) | Value::Int(_)) => value.to_json(),
            (ScalarType::GeoPoint, Value::List(coords)) => {
                if coords.len() != 2 || coords.iter().any(|c| c.as_f64().is_none()) {
                    return Err(self.invalid("GeoPoint must be a two-dimensional [x, y] pair"));
                }
                value.to_json()
            }
            (geo, Value::List(_)) if geo.geojson_type().is_some() => Ok(json!({
                "type": geo.geojson_type(),
                "coordinates": value.to_json()?,
            })),
            (geo, Value::Dict(map)) if geo.geojson_type().is_some() => {
                if !map.contains_key("type") || !map.contains_key("coordinates") {
                    return Err(self.invalid("GeoJSON value needs 'type' and 'coordinates'"));
                }
                value.to_json()
            }
            (_, other) => Err(mismatch(other)),
        }
    }

    fn encode_reference_id(&self, value: &Value) -> Result<JsonValue> {
        match value {
            Value::Reference(r) => Ok(r.id.clone()),
            Value::Linked(doc) => linked_id(self, doc),
            Value::Document(doc) => linked_id(self, doc),
            Value::String(_) | Value::Int(_) => value.to_json(),
            other => Err(self.invalid(format!(
                "Cannot store {} as a reference",
                other.type_name()
            ))),
        }
    }

    fn encode_generic_reference(&self, value: &Value) -> Result<JsonValue> {
        let (collection, class_name, id) = match value {
            Value::Reference(DocRef {
                target:
                    RefTarget::Collection {
                        collection,
                        class_name,
                    },
                id,
            }) => (collection.clone(), class_name.clone(), id.clone()),
            Value::Linked(doc) => generic_parts(self, doc)?,
            Value::Document(doc) => generic_parts(self, doc)?,
            other => {
                return Err(self.invalid(format!(
                    "Generic references need a document or a collection-qualified reference, got {}",
                    other.type_name()
                )));
            }
        };
        let mut out = Map::new();
        if let Some(class_name) = class_name {
            out.insert(CLASS_KEY.to_string(), JsonValue::String(class_name));
        }
        out.insert(
            "_ref".to_string(),
            DocRef::generic(collection.clone(), None, id).to_dbref(&collection),
        );
        Ok(JsonValue::Object(out))
    }

    /// Decodes a storage value back into an in-memory value.
    ///
    /// Shapes the field does not expect are decoded structurally; a schemaless
    /// store may legitimately hold them.
    pub fn from_storage(&self, registry: &Registry, json: &JsonValue) -> Result<Value> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        Ok(match (&self.kind, json) {
            (FieldKind::Scalar(ScalarType::DateTime), JsonValue::String(s)) => {
                parse_datetime(s).map_or_else(|| Value::String(s.clone()), Value::DateTime)
            }
            (FieldKind::Scalar(ScalarType::Float), JsonValue::Number(n)) => {
                Value::Float(n.as_f64().unwrap_or_default())
            }
            (FieldKind::Scalar(geo), JsonValue::Object(map)) if geo.geojson_type().is_some() => map
                .get("coordinates")
                .map_or_else(|| Value::from_json(json), Value::from_json),
            (FieldKind::Scalar(_), _) => Value::from_json(json),
            (FieldKind::Embedded(doc_type), JsonValue::Object(map)) => {
                let doc_type = registry.polymorphic_type(doc_type, map);
                Value::Document(Box::new(Document::from_storage(registry, &doc_type, map.clone())?))
            }
            (FieldKind::Reference(target), JsonValue::Object(map)) => match dbref_from_json(map) {
                Some(r) => Value::Reference(DocRef::typed(target.clone(), r.id)),
                None => Value::from_json(json),
            },
            (FieldKind::Reference(target), id) => Value::Reference(DocRef::typed(target.clone(), id.clone())),
            (FieldKind::GenericReference, JsonValue::Object(map)) => {
                dbref_from_json(map).map_or_else(|| Value::from_json(json), Value::Reference)
            }
            (FieldKind::List(el), JsonValue::Array(items)) => Value::List(
                items
                    .iter()
                    .map(|item| el.from_storage(registry, item))
                    .collect::<Result<Vec<_>>>()?,
            ),
            (FieldKind::Dict(el), JsonValue::Object(map)) => Value::Dict(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), el.from_storage(registry, v)?)))
                    .collect::<Result<_>>()?,
            ),
            _ => Value::from_json(json),
        })
    }

    /// Prepares a value used as a query or update operand.
    ///
    /// `op` is the operator name (`None` for equality). List fields coerce a
    /// list operand element-wise for `set`/`unset`/equality and otherwise
    /// hand the operand to the element descriptor.
    pub fn to_query_value(&self, op: Option<&str>, value: &Value) -> Result<JsonValue> {
        if value.is_null() {
            return Ok(JsonValue::Null);
        }
        match &self.kind {
            FieldKind::List(el) => match value {
                Value::List(items) if matches!(op, None | Some("set") | Some("unset")) => {
                    Ok(JsonValue::Array(
                        items
                            .iter()
                            .map(|item| el.to_query_value(op, item))
                            .collect::<Result<Vec<_>>>()?,
                    ))
                }
                _ => el.to_query_value(op, value),
            },
            FieldKind::Dict(el) => match value {
                Value::Dict(_) => self.to_storage(value),
                _ => el.to_query_value(op, value),
            },
            FieldKind::Scalar(ScalarType::String | ScalarType::Any) => match (op, value) {
                (Some(op), Value::String(s)) if is_string_operator(op) => Ok(string_operator_regex(op, s)),
                _ => self.lenient_scalar(value),
            },
            FieldKind::Scalar(_) => self.lenient_scalar(value),
            FieldKind::Embedded(_) => match value {
                Value::Document(doc) => Ok(JsonValue::Object(doc.to_storage()?)),
                other => other.to_json(),
            },
            FieldKind::Reference(_) => self.encode_reference_id(value),
            FieldKind::GenericReference => match value {
                Value::Reference(r) => match &r.target {
                    RefTarget::Collection { collection, .. } => Ok(r.to_dbref(collection)),
                    RefTarget::Type(_) => Ok(r.id.clone()),
                },
                Value::Linked(doc) => {
                    let (collection, _, id) = generic_parts(self, doc)?;
                    Ok(DocRef::generic(collection.clone(), None, id).to_dbref(&collection))
                }
                Value::Document(doc) => {
                    let (collection, _, id) = generic_parts(self, doc)?;
                    Ok(DocRef::generic(collection.clone(), None, id).to_dbref(&collection))
                }
                other => other.to_json(),
            },
        }
    }

    fn lenient_scalar(&self, value: &Value) -> Result<JsonValue> {
        match (&self.kind, value) {
            (FieldKind::Scalar(ScalarType::Int), Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(JsonValue::from)
                .map_err(|_| self.invalid(format!("'{s}' is not an integer"))),
            (FieldKind::Scalar(ScalarType::Float), Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| self.invalid(format!("'{s}' is not a number")))
                .and_then(|f| Value::Float(f).to_json()),
            (FieldKind::Scalar(_), Value::Dict(_) | Value::List(_)) => value.to_json(),
            _ => self.to_storage(value),
        }
    }
}

fn linked_id(field: &FieldDescriptor, doc: &Document) -> Result<JsonValue> {
    let id = doc.pk_json()?;
    if id.is_null() {
        return Err(field.invalid(
            "You can only reference documents once they have been saved to the database",
        ));
    }
    Ok(id)
}

fn generic_parts(
    field: &FieldDescriptor,
    doc: &Document,
) -> Result<(String, Option<String>, JsonValue)> {
    let collection = doc
        .doc_type()
        .collection()
        .ok_or_else(|| field.invalid("Embedded documents cannot be referenced"))?
        .to_string();
    let id = linked_id(field, doc)?;
    Ok((collection, Some(doc.doc_type().class_name().to_string()), id))
}

pub const STRING_OPERATORS: &[&str] = &[
    "contains",
    "icontains",
    "startswith",
    "istartswith",
    "endswith",
    "iendswith",
    "exact",
    "iexact",
    "regex",
    "iregex",
    "wholeword",
    "iwholeword",
];

pub fn is_string_operator(op: &str) -> bool {
    STRING_OPERATORS.contains(&op)
}

/// Builds the `$regex` document a string operator compiles to.
pub fn string_operator_regex(op: &str, operand: &str) -> JsonValue {
    let case_insensitive = op.starts_with('i');
    let base = if case_insensitive { &op[1..] } else { op };
    let pattern = if base == "regex" {
        operand.to_string()
    } else {
        let escaped = regex::escape(operand);
        match base {
            "startswith" => format!("^{escaped}"),
            "endswith" => format!("{escaped}$"),
            "exact" => format!("^{escaped}$"),
            "wholeword" => format!(r"\b{escaped}\b"),
            _ => escaped,
        }
    };
    let mut out = Map::new();
    out.insert("$regex".to_string(), JsonValue::String(pattern));
    if case_insensitive {
        out.insert("$options".to_string(), JsonValue::String("i".to_string()));
    }
    JsonValue::Object(out)
}
