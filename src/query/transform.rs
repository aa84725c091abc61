//! Keyword → native operator compilation.
//!
//! `compile` renders `path__op = value` conditions into a filter document,
//! `compile_update` renders `op__path = value` operations into an update
//! document. Paths resolve through the document type so attribute names map
//! to storage names and operands are coerced by the field they target.

use crate::core::{CompiledQuery, CompiledUpdate, OdmError, Result, Value};
use crate::query::expr::Conditions;
use crate::schema::resolve::is_index;
use crate::schema::field::is_string_operator;
use crate::schema::{
    DocumentType, FieldDescriptor, FieldKind, PathElement, Registry, ScalarType, resolve,
    split_keyword, terminal_field,
};
use serde_json::{Map, Value as JsonValue, json};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{Level, event};

pub const COMPARISON_OPERATORS: &[&str] = &[
    "ne", "gt", "gte", "lt", "lte", "in", "nin", "mod", "all", "size", "exists", "not",
    "elem_match", "elemMatch", "type",
];

pub const GEO_OPERATORS: &[&str] = &[
    "within_distance",
    "within_spherical_distance",
    "within_box",
    "within_polygon",
    "near",
    "near_sphere",
    "max_distance",
    "min_distance",
    "geo_within",
    "geo_within_box",
    "geo_within_polygon",
    "geo_within_center",
    "geo_within_sphere",
    "geo_intersects",
];

pub const CUSTOM_OPERATORS: &[&str] = &["match"];

pub const UPDATE_OPERATORS: &[&str] = &[
    "set",
    "unset",
    "inc",
    "dec",
    "mul",
    "pop",
    "push",
    "push_all",
    "pull",
    "pull_all",
    "add_to_set",
    "set_on_insert",
    "min",
    "max",
    "rename",
];

const RAW_KEY: &str = "__raw__";

fn is_match_operator(op: &str) -> bool {
    COMPARISON_OPERATORS.contains(&op)
        || GEO_OPERATORS.contains(&op)
        || is_string_operator(op)
        || CUSTOM_OPERATORS.contains(&op)
}

/// Operators whose operand is a single value coerced by the field.
fn is_singular_operator(op: Option<&str>) -> bool {
    match op {
        None => true,
        Some(op) => matches!(op, "ne" | "gt" | "gte" | "lt" | "lte" | "not") || is_string_operator(op),
    }
}

fn lookup_failure(err: OdmError) -> OdmError {
    match err {
        OdmError::Lookup(msg) => OdmError::InvalidQuery(msg),
        other => other,
    }
}

fn resolve_path(
    registry: &Registry,
    doc_type: &Arc<DocumentType>,
    parts: &[String],
) -> Result<Vec<PathElement>> {
    resolve(registry, doc_type, parts).map_err(lookup_failure)
}

fn raw_object(key: &str, value: &Value) -> Result<Map<String, JsonValue>> {
    match value.to_json()? {
        JsonValue::Object(map) => Ok(map),
        _ => Err(OdmError::InvalidQuery(format!(
            "{key} expects a document, got {}",
            value.type_name()
        ))),
    }
}

/// Compiles keyword conditions into a native filter document.
pub fn compile(
    registry: &Registry,
    doc_type: &Arc<DocumentType>,
    conditions: &Conditions,
) -> Result<CompiledQuery> {
    let mut query = CompiledQuery::new();
    let mut deferred: Vec<(String, Vec<JsonValue>)> = Vec::new();

    for (key, value) in conditions.iter() {
        if key == RAW_KEY {
            query.extend(raw_object(key, value)?);
            continue;
        }
        let (compiled_key, compiled) = compile_condition(registry, doc_type, key, value)?;
        merge_condition(&mut query, &mut deferred, compiled_key, compiled);
    }

    for (key, mut values) in deferred {
        if let Some(first) = query.remove(&key) {
            values.insert(0, first);
        }
        let clauses = values.into_iter().map(|v| json!({ key.clone(): v }));
        match query.get_mut("$and") {
            Some(JsonValue::Array(existing)) => existing.extend(clauses),
            _ => {
                query.insert("$and".to_string(), JsonValue::Array(clauses.collect()));
            }
        }
    }

    event!(Level::DEBUG, doc_type = doc_type.name(), query = %JsonValue::Object(query.clone()), "compiled query");
    Ok(query)
}

fn compile_condition(
    registry: &Registry,
    doc_type: &Arc<DocumentType>,
    key: &str,
    value: &Value,
) -> Result<(String, JsonValue)> {
    let all_parts = split_keyword(key);
    let indices: Vec<(usize, String)> = all_parts
        .iter()
        .enumerate()
        .filter(|(_, p)| is_index(p))
        .map(|(i, p)| (i, p.clone()))
        .collect();
    let mut parts: Vec<String> = all_parts.into_iter().filter(|p| !is_index(p)).collect();

    let mut op = None;
    if parts.len() > 1 && parts.last().is_some_and(|p| is_match_operator(p)) {
        op = parts.pop();
    }
    if parts.len() > 1 && parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }
    let mut negate = false;
    if parts.len() > 1 && parts.last().is_some_and(|p| p == "not") {
        parts.pop();
        negate = true;
    }

    let elements = resolve_path(registry, doc_type, &parts)?;
    let field = terminal_field(&elements)
        .cloned()
        .ok_or_else(|| OdmError::InvalidQuery(format!("Cannot resolve field \"{key}\"")))?;
    let mut storage: Vec<String> = elements
        .iter()
        .map(|e| e.storage_name().to_string())
        .collect();
    let op = op.as_deref();

    let mut compiled = match op {
        Some(geo) if GEO_OPERATORS.contains(&geo) => geo_operator(&field, geo, value.to_json()?)?,
        _ if is_singular_operator(op) => field.to_query_value(op, value)?,
        Some(list_op @ ("in" | "nin" | "all")) if !matches!(value, Value::Dict(_)) => {
            iterable_operand(&field, list_op, value)?
        }
        Some("match" | "elem_match" | "elemMatch") => elem_match(registry, &field, value)?,
        _ => value.to_json()?,
    };

    if matches!(field.kind(), FieldKind::GenericReference) {
        if let Some(last) = storage.last_mut() {
            match &compiled {
                JsonValue::Object(map) if map.contains_key("$ref") => last.push_str("._ref"),
                JsonValue::String(_) | JsonValue::Number(_) => last.push_str("._ref.$id"),
                _ => {}
            }
        }
    }

    if let Some(op) = op {
        let passthrough = GEO_OPERATORS.contains(&op)
            || is_string_operator(op)
            || matches!(op, "match" | "elem_match" | "elemMatch");
        if !passthrough {
            compiled = json!({ format!("${op}"): compiled });
        }
    }
    if negate {
        compiled = json!({ "$not": compiled });
    }

    for (i, index) in indices {
        let at = i.min(storage.len());
        storage.insert(at, index);
    }
    Ok((storage.join("."), compiled))
}

fn iterable_operand(field: &FieldDescriptor, op: &str, value: &Value) -> Result<JsonValue> {
    let items = value.as_list().ok_or_else(|| {
        OdmError::InvalidQuery(format!(
            "The __{op} operator must be called with a list"
        ))
    })?;
    Ok(JsonValue::Array(
        items
            .iter()
            .map(|item| field.to_query_value(Some(op), item))
            .collect::<Result<Vec<_>>>()?,
    ))
}

fn elem_match(registry: &Registry, field: &FieldDescriptor, value: &Value) -> Result<JsonValue> {
    let inner = match (field.kind(), value) {
        (FieldKind::List(el), Value::Dict(map)) => match el.kind() {
            FieldKind::Embedded(element_type) => {
                let conditions: Conditions = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                JsonValue::Object(compile(registry, element_type, &conditions)?)
            }
            _ => value.to_json()?,
        },
        (_, Value::Dict(_)) => value.to_json()?,
        _ => field.to_query_value(Some("elem_match"), value)?,
    };
    Ok(json!({ "$elemMatch": inner }))
}

fn geo_operator(field: &FieldDescriptor, op: &str, value: JsonValue) -> Result<JsonValue> {
    match op {
        "max_distance" => return Ok(json!({ "$maxDistance": value })),
        "min_distance" => return Ok(json!({ "$minDistance": value })),
        _ => {}
    }
    let legacy = matches!(field.kind(), FieldKind::Scalar(ScalarType::GeoPoint));
    let unsupported = || {
        OdmError::InvalidQuery(format!(
            "Geo method \"{op}\" is not supported on field \"{}\"",
            field.name()
        ))
    };
    if legacy {
        return Ok(match op {
            "within_distance" => json!({ "$within": { "$center": value } }),
            "within_spherical_distance" => json!({ "$within": { "$centerSphere": value } }),
            "within_polygon" => json!({ "$within": { "$polygon": value } }),
            "within_box" => json!({ "$within": { "$box": value } }),
            "near" => json!({ "$near": value }),
            "near_sphere" => json!({ "$nearSphere": value }),
            _ => return Err(unsupported()),
        });
    }
    Ok(match op {
        "geo_within" => json!({ "$geoWithin": infer_geometry(value)? }),
        "geo_within_box" => json!({ "$geoWithin": { "$box": value } }),
        "geo_within_polygon" => json!({ "$geoWithin": { "$polygon": value } }),
        "geo_within_center" => json!({ "$geoWithin": { "$center": value } }),
        "geo_within_sphere" => json!({ "$geoWithin": { "$centerSphere": value } }),
        "geo_intersects" => json!({ "$geoIntersects": infer_geometry(value)? }),
        "near" => json!({ "$near": infer_geometry(value)? }),
        "near_sphere" => json!({ "$nearSphere": infer_geometry(value)? }),
        _ => return Err(unsupported()),
    })
}

/// Wraps raw coordinates into a `$geometry` document, inferring the GeoJSON
/// type from the nesting depth.
fn infer_geometry(value: JsonValue) -> Result<JsonValue> {
    match value {
        JsonValue::Object(map) => {
            if map.contains_key("$geometry") {
                Ok(JsonValue::Object(map))
            } else if map.contains_key("type") && map.contains_key("coordinates") {
                Ok(json!({ "$geometry": map }))
            } else {
                Err(OdmError::InvalidQuery(
                    "Invalid $geometry dictionary should have type and coordinates keys".to_string(),
                ))
            }
        }
        JsonValue::Array(ref outer) if !outer.is_empty() => {
            let depth = match &outer[0] {
                JsonValue::Array(inner) => match inner.first() {
                    Some(JsonValue::Array(_)) => "Polygon",
                    _ => "LineString",
                },
                _ => "Point",
            };
            Ok(json!({ "$geometry": { "type": depth, "coordinates": value } }))
        }
        _ => Err(OdmError::InvalidQuery(
            "Invalid $geometry data. Can be either a dictionary or (nested) lists of coordinate(s)"
                .to_string(),
        )),
    }
}

/// Folds one compiled condition into the query. Operator maps on the same
/// key merge while their operators stay disjoint; anything else is deferred
/// to a top-level `$and`.
fn merge_condition(
    query: &mut CompiledQuery,
    deferred: &mut Vec<(String, Vec<JsonValue>)>,
    key: String,
    value: JsonValue,
) {
    let Some(existing) = query.get_mut(&key) else {
        query.insert(key, value);
        return;
    };
    if let (JsonValue::Object(current), JsonValue::Object(incoming)) = (&mut *existing, &value) {
        let operator_maps = current.keys().chain(incoming.keys()).all(|k| k.starts_with('$'));
        let disjoint = incoming.keys().all(|k| !current.contains_key(k));
        if operator_maps && disjoint {
            current.extend(incoming.clone());
            order_distance_operators(current);
            return;
        }
    }
    match deferred.iter_mut().find(|(k, _)| *k == key) {
        Some((_, values)) => values.push(value),
        None => deferred.push((key, vec![value])),
    }
}

/// `$maxDistance`/`$minDistance` must follow `$near`; when the `$near`
/// operand is a document they move inside it.
fn order_distance_operators(map: &mut Map<String, JsonValue>) {
    let has_near = map.contains_key("$near") || map.contains_key("$nearSphere");
    if !has_near {
        return;
    }
    let distances: Vec<(String, JsonValue)> = ["$maxDistance", "$minDistance"]
        .iter()
        .filter_map(|k| map.remove(*k).map(|v| (k.to_string(), v)))
        .collect();
    if distances.is_empty() {
        return;
    }
    let mut embedded = false;
    for near in ["$near", "$nearSphere"] {
        if let Some(JsonValue::Object(near_doc)) = map.get_mut(near) {
            near_doc.extend(distances.iter().cloned());
            embedded = true;
        }
    }
    if !embedded {
        map.extend(distances);
    }
}

/// Compiles `op__path` operations into a native update document.
///
/// Every key must start with an update operator. Repeated operators merge
/// into one operator document; on the same path the later value wins.
pub fn compile_update(
    registry: &Registry,
    doc_type: &Arc<DocumentType>,
    operations: &Conditions,
) -> Result<CompiledUpdate> {
    let mut update = CompiledUpdate::new();
    for (key, value) in operations.iter() {
        if key == RAW_KEY {
            update.extend(raw_object(key, value)?);
            continue;
        }
        let (operator, body) = compile_operation(registry, doc_type, key, value)?;
        match update.get_mut(&operator) {
            Some(JsonValue::Object(existing)) => existing.extend(body),
            _ => {
                update.insert(operator, JsonValue::Object(body));
            }
        }
    }
    event!(Level::DEBUG, doc_type = doc_type.name(), update = %JsonValue::Object(update.clone()), "compiled update");
    Ok(update)
}

fn compile_operation(
    registry: &Registry,
    doc_type: &Arc<DocumentType>,
    key: &str,
    value: &Value,
) -> Result<(String, Map<String, JsonValue>)> {
    let mut parts = split_keyword(key);
    if parts.len() < 2 || !UPDATE_OPERATORS.contains(&parts[0].as_str()) {
        return Err(OdmError::InvalidQuery(format!(
            "Update \"{key}\" does not start with an update operator ({})",
            UPDATE_OPERATORS.join(", ")
        )));
    }
    let op = parts.remove(0);
    let mut value = Cow::Borrowed(value);
    if op == "dec" {
        let negated = value.negated().ok_or_else(|| {
            OdmError::InvalidQuery(format!("\"{key}\" needs a numeric value, got {}", value.type_name()))
        })?;
        value = Cow::Owned(negated);
    }
    let native = match op.as_str() {
        "dec" => "inc",
        "push_all" => "pushAll",
        "pull_all" => "pullAll",
        "add_to_set" => "addToSet",
        "set_on_insert" => "setOnInsert",
        other => other,
    };

    let mut matcher = None;
    if parts.len() > 1 && parts.last().is_some_and(|p| COMPARISON_OPERATORS.contains(&p.as_str())) {
        matcher = parts.pop();
    }
    if parts.len() > 1 && parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }

    let elements = resolve_path(registry, doc_type, &parts)?;
    let field = terminal_field(&elements)
        .cloned()
        .ok_or_else(|| OdmError::InvalidQuery(format!("Cannot resolve field \"{key}\"")))?;
    let mut storage: Vec<String> = elements
        .iter()
        .map(|e| e.storage_name().to_string())
        .collect();

    let mut operand = coerce_update_operand(&field, native, matcher.as_deref(), &value)?;
    if let Some(matcher) = &matcher {
        let matcher = if matcher == "elem_match" { "elemMatch" } else { matcher };
        operand = json!({ format!("${matcher}"): operand });
    }

    let path = storage.join(".");
    let mut body = Map::new();
    if native.starts_with("pull") && path.contains('.') {
        // Pulls cannot use dot notation below the last list: nest the rest.
        let last_list = elements
            .iter()
            .rposition(|e| e.as_field().is_some_and(|f| f.kind().is_list()));
        let mut nesting = match last_list {
            Some(at) => {
                let tail = storage.split_off(at + 1);
                let mut head = vec![storage.join(".")];
                head.extend(tail);
                head
            }
            None => storage,
        };
        let outer = nesting.remove(0);
        if nesting.is_empty() {
            body.insert(outer, operand);
            return Ok((format!("${native}"), body));
        }
        if native == "pullAll" {
            operand = json!({ "$in": operand });
        }
        for segment in nesting.into_iter().rev() {
            operand = json!({ segment: operand });
        }
        body.insert(outer, operand);
        return Ok(("$pull".to_string(), body));
    }

    let native = match native {
        "addToSet" => {
            if operand.is_array() {
                operand = json!({ "$each": operand });
            }
            "addToSet"
        }
        "push" | "pushAll" => {
            if storage.last().is_some_and(|p| is_index(p)) {
                let position = storage.pop().and_then(|p| p.parse::<u64>().ok()).unwrap_or(0);
                let items = if operand.is_array() { operand } else { json!([operand]) };
                body.insert(storage.join("."), json!({ "$each": items, "$position": position }));
                return Ok(("$push".to_string(), body));
            }
            if native == "pushAll" {
                let items = if operand.is_array() { operand } else { json!([operand]) };
                operand = json!({ "$each": items });
            }
            "push"
        }
        other => other,
    };
    body.insert(path, operand);
    Ok((format!("${native}"), body))
}

fn coerce_update_operand(
    field: &FieldDescriptor,
    op: &str,
    matcher: Option<&str>,
    value: &Value,
) -> Result<JsonValue> {
    let geo = matches!(field.kind(), FieldKind::Scalar(s) if s.is_geo());
    let each = |items: &[Value]| -> Result<JsonValue> {
        Ok(JsonValue::Array(
            items
                .iter()
                .map(|item| field.to_query_value(Some(op), item))
                .collect::<Result<Vec<_>>>()?,
        ))
    };
    match (op, value) {
        ("unset", _) => Ok(JsonValue::from(1)),
        (_, _) if geo && matches!(op, "set" | "setOnInsert") => field.to_storage(value),
        ("pull", Value::List(items)) if matches!(matcher, Some("in" | "nin" | "all")) => each(items),
        ("pull", Value::Dict(_)) if matcher.is_some() => value.to_json(),
        ("pull" | "set" | "inc", _) => field.to_query_value(Some(op), value),
        ("push" | "pushAll" | "pullAll" | "addToSet" | "setOnInsert", Value::List(items)) => {
            each(items)
        }
        ("push" | "addToSet" | "setOnInsert", _) => field.to_query_value(Some(op), value),
        ("pushAll" | "pullAll", _) => Err(OdmError::InvalidQuery(format!(
            "{op} expects a list, got {}",
            value.type_name()
        ))),
        _ => value.to_json(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDescriptor;

    fn setup() -> (Registry, Arc<DocumentType>) {
        let comment = DocumentType::embedded("Comment")
            .field(FieldDescriptor::string("body").db_field("b"))
            .field(FieldDescriptor::string("author"))
            .field(FieldDescriptor::int("votes"))
            .build()
            .unwrap();
        let post = DocumentType::builder("Post")
            .collection("posts")
            .field(FieldDescriptor::string("title").db_field("t"))
            .field(FieldDescriptor::int("age"))
            .field(FieldDescriptor::list("tags", FieldKind::Scalar(ScalarType::String)))
            .field(FieldDescriptor::list("comments", FieldKind::Embedded(comment)))
            .field(FieldDescriptor::geo_point("loc"))
            .field(FieldDescriptor::point("spot"))
            .field(FieldDescriptor::generic_reference("target"))
            .build()
            .unwrap();
        (Registry::new().with_type(Arc::clone(&post)).unwrap(), post)
    }

    fn q(pairs: &[(&str, Value)]) -> JsonValue {
        let (registry, post) = setup();
        let conditions: Conditions = pairs.iter().cloned().collect();
        JsonValue::Object(compile(&registry, &post, &conditions).unwrap())
    }

    fn u(pairs: &[(&str, Value)]) -> Result<JsonValue> {
        let (registry, post) = setup();
        let ops: Conditions = pairs.iter().cloned().collect();
        compile_update(&registry, &post, &ops).map(JsonValue::Object)
    }

    #[test]
    fn test_equality_and_storage_names() {
        assert_eq!(q(&[("title", "x".into())]), json!({"t": "x"}));
        assert_eq!(q(&[("pk", "p1".into())]), json!({"_id": "p1"}));
    }

    #[test]
    fn test_comparison_operators_merge() {
        assert_eq!(
            q(&[("age__gte", 18.into()), ("age__lt", 65.into())]),
            json!({"age": {"$gte": 18, "$lt": 65}})
        );
    }

    #[test]
    fn test_conflicting_conditions_defer_to_and() {
        assert_eq!(
            q(&[("age", 3.into()), ("age__ne", 4.into())]),
            json!({"$and": [{"age": 3}, {"age": {"$ne": 4}}]})
        );
    }

    #[test]
    fn test_in_coerces_each_element() {
        assert_eq!(
            q(&[("age__in", Value::List(vec!["1".into(), 2.into()]))]),
            json!({"age": {"$in": [1, 2]}})
        );
    }

    #[test]
    fn test_in_requires_list() {
        let (registry, post) = setup();
        let conditions = Conditions::new().with("age__in", 3);
        assert!(matches!(
            compile(&registry, &post, &conditions),
            Err(OdmError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_string_operators() {
        assert_eq!(
            q(&[("title__icontains", "Rust".into())]),
            json!({"t": {"$regex": "Rust", "$options": "i"}})
        );
        assert_eq!(
            q(&[("title__not__startswith", "a".into())]),
            json!({"t": {"$not": {"$regex": "^a"}}})
        );
    }

    #[test]
    fn test_positional_index_reinserted() {
        assert_eq!(
            q(&[("comments__0__author", "ann".into())]),
            json!({"comments.0.author": "ann"})
        );
        assert_eq!(q(&[("tags__1", "x".into())]), json!({"tags.1": "x"}));
    }

    #[test]
    fn test_escaped_operator_name() {
        let t = DocumentType::builder("Odd")
            .field(FieldDescriptor::int("size"))
            .build()
            .unwrap();
        let registry = Registry::new().with_type(Arc::clone(&t)).unwrap();
        let conditions = Conditions::new().with("size__", 3);
        assert_eq!(
            JsonValue::Object(compile(&registry, &t, &conditions).unwrap()),
            json!({"size": 3})
        );
    }

    #[test]
    fn test_unknown_field_is_invalid_query() {
        let (registry, post) = setup();
        let conditions = Conditions::new().with("nope__gt", 1);
        assert!(matches!(
            compile(&registry, &post, &conditions),
            Err(OdmError::InvalidQuery(msg)) if msg.contains("nope")
        ));
    }

    #[test]
    fn test_elem_match_compiles_subquery() {
        let sub = Value::Dict(
            [("body".to_string(), Value::from("hi")), ("votes__gt".to_string(), Value::Int(2))]
                .into_iter()
                .collect(),
        );
        assert_eq!(
            q(&[("comments__match", sub)]),
            json!({"comments": {"$elemMatch": {"b": "hi", "votes": {"$gt": 2}}}})
        );
    }

    #[test]
    fn test_legacy_geo_operators() {
        let center = Value::List(vec![
            Value::List(vec![Value::Float(1.0), Value::Float(2.0)]),
            Value::Float(5.0),
        ]);
        assert_eq!(
            q(&[("loc__within_distance", center)]),
            json!({"loc": {"$within": {"$center": [[1.0, 2.0], 5.0]}}})
        );
    }

    #[test]
    fn test_geojson_near_with_max_distance() {
        let point = Value::List(vec![Value::Float(1.0), Value::Float(2.0)]);
        assert_eq!(
            q(&[("spot__near", point), ("spot__max_distance", 10.into())]),
            json!({"spot": {"$near": {
                "$geometry": {"type": "Point", "coordinates": [1.0, 2.0]},
                "$maxDistance": 10
            }}})
        );
    }

    #[test]
    fn test_generic_reference_keys() {
        let r = Value::Reference(crate::core::DocRef::generic("users", None, "u1"));
        assert_eq!(
            q(&[("target", r)]),
            json!({"target._ref": {"$ref": "users", "$id": "u1"}})
        );
        assert_eq!(q(&[("target", "u1".into())]), json!({"target._ref.$id": "u1"}));
    }

    #[test]
    fn test_raw_query_merged_verbatim() {
        let raw = Value::from(json!({"$where": "1"}));
        assert_eq!(
            q(&[("__raw__", raw), ("age", 1.into())]),
            json!({"$where": "1", "age": 1})
        );
    }

    #[test]
    fn test_dec_matches_negative_inc() {
        assert_eq!(u(&[("dec__age", 5.into())]).unwrap(), u(&[("inc__age", (-5).into())]).unwrap());
        assert_eq!(u(&[("dec__age", 5.into())]).unwrap(), json!({"$inc": {"age": -5}}));
    }

    #[test]
    fn test_missing_update_operator_is_rejected() {
        assert!(matches!(u(&[("age", 5.into())]), Err(OdmError::InvalidQuery(_))));
        assert!(matches!(u(&[("frobnicate__age", 5.into())]), Err(OdmError::InvalidQuery(_))));
    }

    #[test]
    fn test_set_and_unset() {
        assert_eq!(
            u(&[("set__title", "x".into()), ("unset__age", true.into())]).unwrap(),
            json!({"$set": {"t": "x"}, "$unset": {"age": 1}})
        );
    }

    #[test]
    fn test_duplicate_operator_merges_later_wins() {
        assert_eq!(
            u(&[("set__title", "a".into()), ("set__age", 1.into()), ("set__t", "b".into())]).unwrap(),
            json!({"$set": {"t": "b", "age": 1}})
        );
    }

    #[test]
    fn test_add_to_set_list_uses_each() {
        assert_eq!(
            u(&[("add_to_set__tags", Value::List(vec!["a".into(), "b".into()]))]).unwrap(),
            json!({"$addToSet": {"tags": {"$each": ["a", "b"]}}})
        );
        assert_eq!(
            u(&[("add_to_set__tags", "a".into())]).unwrap(),
            json!({"$addToSet": {"tags": "a"}})
        );
    }

    #[test]
    fn test_push_variants() {
        assert_eq!(u(&[("push__tags", "a".into())]).unwrap(), json!({"$push": {"tags": "a"}}));
        assert_eq!(
            u(&[("push_all__tags", Value::List(vec!["a".into()]))]).unwrap(),
            json!({"$push": {"tags": {"$each": ["a"]}}})
        );
        assert_eq!(
            u(&[("push__tags__0", "first".into())]).unwrap(),
            json!({"$push": {"tags": {"$each": ["first"], "$position": 0}}})
        );
    }

    #[test]
    fn test_pull_with_matcher() {
        assert_eq!(
            u(&[("pull__tags__in", Value::List(vec!["a".into(), "b".into()]))]).unwrap(),
            json!({"$pull": {"tags": {"$in": ["a", "b"]}}})
        );
    }

    #[test]
    fn test_pull_on_nested_path_inverts() {
        assert_eq!(
            u(&[("pull__comments__author", "ann".into())]).unwrap(),
            json!({"$pull": {"comments": {"author": "ann"}}})
        );
    }

    #[test]
    fn test_pull_all_on_nested_path_inverts_to_in() {
        assert_eq!(
            u(&[("pull_all__comments__author", Value::List(vec!["ann".into(), "bob".into()]))]).unwrap(),
            json!({"$pull": {"comments": {"author": {"$in": ["ann", "bob"]}}}})
        );
        assert_eq!(
            u(&[("pull_all__tags", Value::List(vec!["a".into()]))]).unwrap(),
            json!({"$pullAll": {"tags": ["a"]}})
        );
    }

    #[test]
    fn test_positional_update() {
        assert_eq!(
            u(&[("set__comments__S__votes", 3.into())]).unwrap(),
            json!({"$set": {"comments.$.votes": 3}})
        );
    }
}
