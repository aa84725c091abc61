//! Evaluates native filter documents against stored JSON documents.

use crate::core::{OdmError, Result};
use lazy_static::lazy_static;
use lru::LruCache;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value as JsonValue};
use std::cmp::Ordering;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

lazy_static! {
    static ref REGEX_LRU_CACHE: Mutex<LruCache<String, Arc<Regex>>> =
        Mutex::new(LruCache::new(NonZeroUsize::MIN.saturating_add(199)));
}

/// Maximum nesting of logical operators.
const MAX_DEPTH: usize = 32;

/// Whether `doc` satisfies `query`.
pub fn matches(doc: &Map<String, JsonValue>, query: &Map<String, JsonValue>) -> Result<bool> {
    matches_at(doc, query, 0)
}

fn matches_at(doc: &Map<String, JsonValue>, query: &Map<String, JsonValue>, depth: usize) -> Result<bool> {
    if depth > MAX_DEPTH {
        return Err(OdmError::Driver(format!(
            "query nesting exceeds {MAX_DEPTH} levels"
        )));
    }
    for (key, condition) in query {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, condition)? {
                    if !matches_at(doc, clause, depth + 1)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(key, condition)? {
                    if matches_at(doc, clause, depth + 1)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for clause in clauses(key, condition)? {
                    if matches_at(doc, clause, depth + 1)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            op if op.starts_with('$') => {
                return Err(OdmError::Driver(format!("unsupported top-level operator {op}")));
            }
            path => {
                let values = lookup(doc, path);
                matches_condition(&values, condition, depth)?
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(op: &str, condition: &'a JsonValue) -> Result<Vec<&'a Map<String, JsonValue>>> {
    condition
        .as_array()
        .ok_or_else(|| OdmError::Driver(format!("{op} needs an array")))?
        .iter()
        .map(|clause| {
            clause
                .as_object()
                .ok_or_else(|| OdmError::Driver(format!("{op} clauses must be documents")))
        })
        .collect()
}

/// Values reached by a dotted path. Arrays met along the way fan out over
/// their elements unless the segment is an index.
pub fn lookup<'a>(doc: &'a Map<String, JsonValue>, path: &str) -> Vec<&'a JsonValue> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((head, rest)) = segments.split_first() {
        if let Some(value) = doc.get(*head) {
            collect(value, rest, &mut out);
        }
    }
    out
}

fn collect<'a>(value: &'a JsonValue, segments: &[&str], out: &mut Vec<&'a JsonValue>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        JsonValue::Object(map) => {
            if let Some(next) = map.get(*head) {
                collect(next, rest, out);
            }
        }
        JsonValue::Array(items) => match head.parse::<usize>() {
            Ok(index) => {
                if let Some(next) = items.get(index) {
                    collect(next, rest, out);
                }
            }
            Err(_) => {
                for item in items.iter().filter(|i| i.is_object()) {
                    collect(item, segments, out);
                }
            }
        },
        _ => {}
    }
}

fn is_operator_map(value: &JsonValue) -> bool {
    value
        .as_object()
        .is_some_and(|map| !map.is_empty() && map.keys().all(|k| k.starts_with('$')))
}

/// Evaluates a field condition (literal or operator map) against the
/// values found at its path.
pub fn matches_condition(values: &[&JsonValue], condition: &JsonValue, depth: usize) -> Result<bool> {
    let Some(ops) = condition.as_object().filter(|_| is_operator_map(condition)) else {
        return Ok(equals_any(values, condition));
    };
    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => equals_any(values, operand),
            "$ne" => !equals_any(values, operand),
            "$gt" => compares_any(values, operand, |o| o == Ordering::Greater),
            "$gte" => compares_any(values, operand, |o| o != Ordering::Less),
            "$lt" => compares_any(values, operand, |o| o == Ordering::Less),
            "$lte" => compares_any(values, operand, |o| o != Ordering::Greater),
            "$in" => in_list(values, op, operand)?,
            "$nin" => !in_list(values, op, operand)?,
            "$exists" => values.is_empty() != truthy(operand),
            "$not" => !matches_condition(values, operand, depth + 1)?,
            "$regex" => {
                let options = ops.get("$options").and_then(JsonValue::as_str).unwrap_or("");
                regex_any(values, operand, options)?
            }
            "$options" => true,
            "$size" => {
                let size = operand.as_u64().ok_or_else(|| {
                    OdmError::Driver("$size needs a non-negative integer".to_string())
                })?;
                values
                    .iter()
                    .any(|v| v.as_array().is_some_and(|a| a.len() as u64 == size))
            }
            "$all" => {
                let wanted = operand
                    .as_array()
                    .ok_or_else(|| OdmError::Driver("$all needs an array".to_string()))?;
                values.iter().any(|v| match v.as_array() {
                    Some(items) => wanted.iter().all(|w| items.contains(w)),
                    None => wanted.len() == 1 && *v == &wanted[0],
                })
            }
            "$elemMatch" => elem_match_any(values, operand, depth)?,
            "$mod" => modulo_any(values, operand)?,
            "$type" => values.iter().any(|v| type_name(v) == operand.as_str().unwrap_or("")),
            other => {
                return Err(OdmError::Driver(format!("unsupported operator {other}")));
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::Null => false,
        _ => true,
    }
}

/// A value matches when it is equal or, being an array, contains an equal
/// element. Absent values match `null`.
fn equals_any(values: &[&JsonValue], expected: &JsonValue) -> bool {
    if values.is_empty() {
        return expected.is_null();
    }
    values.iter().any(|v| {
        json_eq(v, expected)
            || v.as_array()
                .is_some_and(|items| items.iter().any(|item| json_eq(item, expected)))
    })
}

fn json_eq(left: &JsonValue, right: &JsonValue) -> bool {
    match (left, right) {
        (JsonValue::Number(_), JsonValue::Number(_)) => compare_values(left, right) == Some(Ordering::Equal),
        _ => left == right,
    }
}

fn compares_any<F>(values: &[&JsonValue], operand: &JsonValue, accept: F) -> bool
where
    F: Fn(Ordering) -> bool,
{
    let check = |v: &JsonValue| compare_values(v, operand).is_some_and(&accept);
    values.iter().any(|v| match v.as_array() {
        Some(items) => items.iter().any(&check),
        None => check(*v),
    })
}

fn in_list(values: &[&JsonValue], op: &str, operand: &JsonValue) -> Result<bool> {
    let candidates = operand
        .as_array()
        .ok_or_else(|| OdmError::Driver(format!("{op} needs an array")))?;
    for candidate in candidates {
        let hit = match candidate.as_object() {
            Some(map) if map.contains_key("$regex") => matches_condition(values, candidate, 0)?,
            _ => equals_any(values, candidate),
        };
        if hit {
            return Ok(true);
        }
    }
    Ok(false)
}

fn regex_any(values: &[&JsonValue], pattern: &JsonValue, options: &str) -> Result<bool> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| OdmError::Driver("$regex needs a string pattern".to_string()))?;
    let regex = get_or_compile_regex(pattern, options.contains('i'))?;
    let check = |v: &JsonValue| v.as_str().is_some_and(|s| regex.is_match(s));
    Ok(values.iter().any(|v| match v.as_array() {
        Some(items) => items.iter().any(&check),
        None => check(*v),
    }))
}

fn elem_match_any(values: &[&JsonValue], operand: &JsonValue, depth: usize) -> Result<bool> {
    for value in values {
        let Some(items) = value.as_array() else {
            continue;
        };
        for item in items {
            let hit = if is_operator_map(operand) {
                matches_condition(&[item], operand, depth + 1)?
            } else {
                match (item.as_object(), operand.as_object()) {
                    (Some(element), Some(query)) => matches_at(element, query, depth + 1)?,
                    _ => false,
                }
            };
            if hit {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn modulo_any(values: &[&JsonValue], operand: &JsonValue) -> Result<bool> {
    let pair = operand.as_array().filter(|a| a.len() == 2);
    let (divisor, remainder) = match pair.map(|a| (a[0].as_i64(), a[1].as_i64())) {
        Some((Some(d), Some(r))) if d != 0 => (d, r),
        _ => {
            return Err(OdmError::Driver(
                "$mod needs [divisor, remainder] with a non-zero divisor".to_string(),
            ));
        }
    };
    Ok(values
        .iter()
        .filter_map(|v| v.as_i64())
        .any(|n| n.wrapping_rem(divisor) == remainder))
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(n) if n.is_f64() => "double",
        JsonValue::Number(_) => "long",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Orders two JSON values when their types are comparable.
pub fn compare_values(left: &JsonValue, right: &JsonValue) -> Option<Ordering> {
    match (left, right) {
        (JsonValue::Null, JsonValue::Null) => Some(Ordering::Equal),
        (JsonValue::Number(a), JsonValue::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
        (JsonValue::Bool(a), JsonValue::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn get_or_compile_regex(pattern: &str, case_insensitive: bool) -> Result<Arc<Regex>> {
    let cache_key = if case_insensitive {
        format!("i:{pattern}")
    } else {
        format!("s:{pattern}")
    };
    {
        let mut cache = REGEX_LRU_CACHE.lock()?;
        if let Some(regex) = cache.get(&cache_key) {
            return Ok(Arc::clone(regex));
        }
    }
    let compiled = RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| OdmError::Driver(format!("Invalid $regex pattern: {e}")))?;
    let compiled = Arc::new(compiled);
    REGEX_LRU_CACHE.lock()?.put(cache_key, Arc::clone(&compiled));
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Map<String, JsonValue> {
        json!({
            "_id": 1,
            "name": "Alice",
            "age": 30,
            "tags": ["admin", "user"],
            "comments": [{"author": "bob", "votes": 2}, {"author": "eve", "votes": 7}],
            "address": {"city": "Portland"}
        })
        .as_object()
        .unwrap()
        .clone()
    }

    fn check(query: JsonValue) -> bool {
        matches(&doc(), query.as_object().unwrap()).unwrap()
    }

    #[test]
    fn test_equality_and_nested_paths() {
        assert!(check(json!({"name": "Alice", "address.city": "Portland"})));
        assert!(!check(json!({"name": "Bob"})));
        assert!(check(json!({"missing": null})));
    }

    #[test]
    fn test_array_membership() {
        assert!(check(json!({"tags": "admin"})));
        assert!(check(json!({"comments.author": "eve"})));
        assert!(check(json!({"comments.1.votes": 7})));
        assert!(check(json!({"tags": {"$size": 2}})));
        assert!(check(json!({"tags": {"$all": ["user", "admin"]}})));
    }

    #[test]
    fn test_comparisons() {
        assert!(check(json!({"age": {"$gte": 30, "$lt": 31}})));
        assert!(!check(json!({"age": {"$gt": 30}})));
        assert!(check(json!({"age": {"$in": [1, 30]}})));
        assert!(check(json!({"age": {"$nin": [1, 2]}})));
        assert!(check(json!({"age": {"$not": {"$lt": 18}}})));
        assert!(check(json!({"age": {"$mod": [7, 2]}})));
    }

    #[test]
    fn test_logical_operators() {
        assert!(check(json!({"$or": [{"name": "Bob"}, {"age": 30}]})));
        assert!(!check(json!({"$and": [{"name": "Alice"}, {"age": 31}]})));
        assert!(check(json!({"$nor": [{"name": "Bob"}]})));
    }

    #[test]
    fn test_regex_and_elem_match() {
        assert!(check(json!({"name": {"$regex": "^ali", "$options": "i"}})));
        assert!(!check(json!({"name": {"$regex": "^ali"}})));
        assert!(check(json!({"comments": {"$elemMatch": {"author": "eve", "votes": {"$gt": 5}}}})));
        assert!(!check(json!({"comments": {"$elemMatch": {"author": "bob", "votes": {"$gt": 5}}}})));
    }

    #[test]
    fn test_exists() {
        assert!(check(json!({"age": {"$exists": true}})));
        assert!(check(json!({"nope": {"$exists": false}})));
    }

    #[test]
    fn test_unsupported_operator_is_an_error() {
        assert!(matches(&doc(), json!({"loc": {"$near": [0, 0]}}).as_object().unwrap()).is_err());
    }

    #[test]
    fn test_mod_at_integer_bounds() {
        let doc = json!({"n": i64::MIN}).as_object().unwrap().clone();
        assert!(matches(&doc, json!({"n": {"$mod": [-1, 0]}}).as_object().unwrap()).unwrap());
        assert!(!matches(&doc, json!({"n": {"$mod": [-1, 1]}}).as_object().unwrap()).unwrap());
    }
}
