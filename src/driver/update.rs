//! Applies native update documents to stored JSON documents.

use crate::core::value::ID_KEY;
use crate::core::{CompiledQuery, CompiledUpdate, OdmError, Result};
use crate::driver::matcher::{self, compare_values};
use serde_json::{Map, Value as JsonValue};
use std::cmp::Ordering;

type Object = Map<String, JsonValue>;

/// Applies `update` to `doc`; returns whether the document changed.
///
/// `query` is the filter the document matched, consulted for the positional
/// `$` segment. `inserting` enables `$setOnInsert`.
pub fn apply_update(
    doc: &mut Object,
    query: &CompiledQuery,
    update: &CompiledUpdate,
    inserting: bool,
) -> Result<bool> {
    let before = doc.clone();
    if !update.keys().any(|k| k.starts_with('$')) {
        let id = doc.get(ID_KEY).cloned();
        *doc = update.clone();
        if let Some(id) = id {
            doc.insert(ID_KEY.to_string(), id);
        }
        return Ok(*doc != before);
    }
    for (op, body) in update {
        let body = body
            .as_object()
            .ok_or_else(|| OdmError::Driver(format!("{op} needs a document")))?;
        for (raw_path, operand) in body {
            let path = positional_path(&before, query, raw_path)?;
            apply_operator(doc, op, &path, operand, inserting)?;
        }
    }
    Ok(*doc != before)
}

fn apply_operator(doc: &mut Object, op: &str, path: &str, operand: &JsonValue, inserting: bool) -> Result<()> {
    match op {
        "$set" => set_path(doc, path, operand.clone()),
        "$setOnInsert" => {
            if inserting {
                set_path(doc, path, operand.clone())?;
            }
            Ok(())
        }
        "$unset" => {
            remove_path(doc, path);
            Ok(())
        }
        "$inc" => {
            let current = get_path(doc, path).cloned().unwrap_or(JsonValue::from(0));
            set_path(doc, path, arithmetic(&current, operand, op, |a, b| a.checked_add(b), |a, b| a + b)?)
        }
        "$mul" => {
            let current = get_path(doc, path).cloned().unwrap_or(JsonValue::from(0));
            set_path(doc, path, arithmetic(&current, operand, op, |a, b| a.checked_mul(b), |a, b| a * b)?)
        }
        "$min" | "$max" => {
            let keep_current = match get_path(doc, path) {
                Some(current) => {
                    let wanted = if op == "$min" { Ordering::Less } else { Ordering::Greater };
                    compare_values(operand, current) != Some(wanted)
                }
                None => false,
            };
            if !keep_current {
                set_path(doc, path, operand.clone())?;
            }
            Ok(())
        }
        "$push" => push(doc, path, operand, false),
        "$addToSet" => push(doc, path, operand, true),
        "$pull" => {
            let items = array_at(doc, path, op)?;
            let mut kept = Vec::with_capacity(items.len());
            for item in items.drain(..) {
                if !pull_matches(&item, operand)? {
                    kept.push(item);
                }
            }
            *items = kept;
            Ok(())
        }
        "$pullAll" => {
            let removed = operand
                .as_array()
                .ok_or_else(|| OdmError::Driver("$pullAll needs an array".to_string()))?
                .clone();
            array_at(doc, path, op)?.retain(|item| !removed.contains(item));
            Ok(())
        }
        "$pop" => {
            let items = array_at(doc, path, op)?;
            if operand.as_i64() == Some(-1) {
                if !items.is_empty() {
                    items.remove(0);
                }
            } else {
                items.pop();
            }
            Ok(())
        }
        "$rename" => {
            let target = operand
                .as_str()
                .ok_or_else(|| OdmError::Driver("$rename needs a target name".to_string()))?;
            if let Some(value) = remove_path(doc, path) {
                set_path(doc, target, value)?;
            }
            Ok(())
        }
        other => Err(OdmError::Driver(format!("unsupported update operator {other}"))),
    }
}

fn arithmetic(
    current: &JsonValue,
    operand: &JsonValue,
    op: &str,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<JsonValue> {
    let not_numeric = || OdmError::Driver(format!("{op} needs numeric values"));
    if let (Some(a), Some(b)) = (current.as_i64(), operand.as_i64()) {
        if let Some(result) = int_op(a, b) {
            return Ok(JsonValue::from(result));
        }
    }
    let a = current.as_f64().ok_or_else(not_numeric)?;
    let b = operand.as_f64().ok_or_else(not_numeric)?;
    serde_json::Number::from_f64(float_op(a, b))
        .map(JsonValue::Number)
        .ok_or_else(not_numeric)
}

fn push(doc: &mut Object, path: &str, operand: &JsonValue, unique: bool) -> Result<()> {
    let (values, position) = match operand.as_object() {
        Some(modifiers) if modifiers.contains_key("$each") => {
            let values = modifiers
                .get("$each")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| OdmError::Driver("$each needs an array".to_string()))?
                .clone();
            let position = modifiers
                .get("$position")
                .and_then(JsonValue::as_u64)
                .map(|p| p as usize);
            (values, position)
        }
        _ => (vec![operand.clone()], None),
    };
    let items = array_at(doc, path, if unique { "$addToSet" } else { "$push" })?;
    let mut at = position.map_or(items.len(), |p| p.min(items.len()));
    for value in values {
        if unique && items.contains(&value) {
            continue;
        }
        items.insert(at, value);
        at += 1;
    }
    Ok(())
}

fn pull_matches(item: &JsonValue, condition: &JsonValue) -> Result<bool> {
    let is_operator_map = condition
        .as_object()
        .is_some_and(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')));
    if is_operator_map {
        return matcher::matches_condition(&[item], condition, 0);
    }
    match (item.as_object(), condition.as_object()) {
        (Some(element), Some(query)) => matcher::matches(element, query),
        _ => Ok(item == condition),
    }
}

/// Replaces a `$` segment with the index of the first array element that
/// satisfies the query's conditions on that array.
fn positional_path(doc: &Object, query: &CompiledQuery, path: &str) -> Result<String> {
    let Some(at) = path.split('.').position(|s| s == "$") else {
        return Ok(path.to_string());
    };
    let segments: Vec<&str> = path.split('.').collect();
    let array_path = segments[..at].join(".");
    let prefix = format!("{array_path}.");
    let items = get_path(doc, &array_path)
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();
    let conditions: Vec<(&str, &JsonValue)> = query
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(prefix.as_str()).map(|rest| (rest, v)))
        .collect();
    let whole: Option<&JsonValue> = query.get(&array_path);

    for (index, item) in items.iter().enumerate() {
        let mut hit = !conditions.is_empty() || whole.is_some();
        for (rest, condition) in &conditions {
            let values = match item.as_object() {
                Some(element) => matcher::lookup(element, rest),
                None => Vec::new(),
            };
            if !matcher::matches_condition(&values, condition, 0)? {
                hit = false;
                break;
            }
        }
        if let Some(condition) = whole {
            hit = hit && element_matches(item, condition)?;
        }
        if hit {
            let mut resolved: Vec<String> = segments.iter().map(|s| s.to_string()).collect();
            resolved[at] = index.to_string();
            return Ok(resolved.join("."));
        }
    }
    Err(OdmError::Driver(
        "The positional operator did not find the match needed from the query".to_string(),
    ))
}

fn element_matches(item: &JsonValue, condition: &JsonValue) -> Result<bool> {
    match condition.as_object().and_then(|m| m.get("$elemMatch")) {
        Some(inner) => pull_matches(item, inner),
        None => matcher::matches_condition(&[item], condition, 0),
    }
}

pub fn get_path<'a>(doc: &'a Object, path: &str) -> Option<&'a JsonValue> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Sets a dotted path, creating intermediate documents and padding arrays
/// with `null` as needed.
pub fn set_path(doc: &mut Object, path: &str, value: JsonValue) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return Ok(());
    };
    let mut container = ContainerMut::Object(doc);
    for segment in parents {
        container = container.child(segment, path)?;
    }
    container.put(last, value, path)
}

enum ContainerMut<'a> {
    Object(&'a mut Object),
    Array(&'a mut Vec<JsonValue>),
}

impl<'a> ContainerMut<'a> {
    fn slot(self, segment: &str, path: &str) -> Result<&'a mut JsonValue> {
        match self {
            Self::Object(map) => Ok(map.entry(segment.to_string()).or_insert(JsonValue::Null)),
            Self::Array(items) => {
                let index = segment.parse::<usize>().map_err(|_| {
                    OdmError::Driver(format!("cannot use the part '{segment}' to traverse the array in '{path}'"))
                })?;
                if items.len() <= index {
                    items.resize(index + 1, JsonValue::Null);
                }
                Ok(&mut items[index])
            }
        }
    }

    fn child(self, segment: &str, path: &str) -> Result<ContainerMut<'a>> {
        let slot = self.slot(segment, path)?;
        if slot.is_null() {
            *slot = JsonValue::Object(Map::new());
        }
        match slot {
            JsonValue::Object(map) => Ok(ContainerMut::Object(map)),
            JsonValue::Array(items) => Ok(ContainerMut::Array(items)),
            _ => Err(OdmError::Driver(format!(
                "cannot create field '{segment}' in element of '{path}'"
            ))),
        }
    }

    fn put(self, segment: &str, value: JsonValue, path: &str) -> Result<()> {
        *self.slot(segment, path)? = value;
        Ok(())
    }
}

/// Removes a dotted path; array elements are nulled rather than removed.
pub fn remove_path(doc: &mut Object, path: &str) -> Option<JsonValue> {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (Some(parent), last),
        None => (None, path),
    };
    let Some(parent) = parent else {
        return doc.shift_remove(last);
    };
    let mut segments = parent.split('.');
    let mut current = doc.get_mut(segments.next()?)?;
    for segment in segments {
        current = match current {
            JsonValue::Object(map) => map.get_mut(segment)?,
            JsonValue::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        JsonValue::Object(map) => map.shift_remove(last),
        JsonValue::Array(items) => items
            .get_mut(last.parse::<usize>().ok()?)
            .map(|slot| std::mem::replace(slot, JsonValue::Null)),
        _ => None,
    }
}

fn array_at<'a>(doc: &'a mut Object, path: &str, op: &str) -> Result<&'a mut Vec<JsonValue>> {
    if get_path(doc, path).is_none() {
        set_path(doc, path, JsonValue::Array(Vec::new()))?;
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut container = ContainerMut::Object(doc);
    let Some((last, parents)) = segments.split_last() else {
        return Err(OdmError::Driver(format!("{op} needs a field path")));
    };
    for segment in parents {
        container = container.child(segment, path)?;
    }
    match container.slot(last, path)? {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Null => Err(OdmError::Driver(format!("{op} target '{path}' is null"))),
        _ => Err(OdmError::Driver(format!(
            "The field '{path}' must be an array to apply {op}"
        ))),
    }
}
