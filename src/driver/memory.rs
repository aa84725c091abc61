use super::matcher::{self, compare_values};
use super::update::{apply_update, get_path, remove_path, set_path};
use super::{Driver, FindOptions, SortDirection, UpdateOptions, UpdateResult};
use crate::core::value::{ID_KEY, id_key};
use crate::core::{CompiledQuery, CompiledUpdate, OdmError, RawDocument, Result};
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::{Level, event};
use uuid::Uuid;

/// One batched id lookup observed by [`MemoryDriver`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetchCall {
    pub collection: String,
    pub ids: Vec<JsonValue>,
}

/// In-process document store.
///
/// Collections are created on first insert. Every `execute_fetch_by_ids`
/// call is recorded so callers can assert how many round trips a
/// dereference took.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    collections: RwLock<HashMap<String, Vec<RawDocument>>>,
    fetches: Mutex<Vec<FetchCall>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batched id lookups issued so far.
    pub fn fetch_calls(&self) -> Result<Vec<FetchCall>> {
        Ok(self.fetches.lock()?.clone())
    }

    pub fn reset_fetch_calls(&self) -> Result<()> {
        self.fetches.lock()?.clear();
        Ok(())
    }

    /// Snapshot of a collection in insertion order.
    pub async fn documents(&self, collection: &str) -> Vec<RawDocument> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn execute_find(
        &self,
        collection: &str,
        query: &CompiledQuery,
        options: &FindOptions,
    ) -> Result<Vec<RawDocument>> {
        let collections = self.collections.read().await;
        let Some(documents) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut found = Vec::new();
        for doc in documents {
            if matcher::matches(doc, query)? {
                found.push(doc.clone());
            }
        }
        drop(collections);

        if !options.sort.is_empty() {
            found.sort_by(|a, b| sort_order(a, b, &options.sort));
        }
        let found = found
            .into_iter()
            .skip(options.skip)
            .take(options.limit.unwrap_or(usize::MAX));
        let result: Vec<RawDocument> = match &options.projection {
            Some(projection) => found.map(|doc| project(doc, projection)).collect(),
            None => found.collect(),
        };
        event!(
            Level::DEBUG,
            collection,
            returned = result.len(),
            "memory find"
        );
        Ok(result)
    }

    async fn execute_update(
        &self,
        collection: &str,
        query: &CompiledQuery,
        update: &CompiledUpdate,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        let mut collections = self.collections.write().await;
        let documents = collections.entry(collection.to_string()).or_default();
        let mut result = UpdateResult::default();

        for doc in documents.iter_mut() {
            if !matcher::matches(doc, query)? {
                continue;
            }
            result.matched_count += 1;
            let mut updated = doc.clone();
            if apply_update(&mut updated, query, update, false)? {
                *doc = updated;
                result.modified_count += 1;
            }
            if !options.multi {
                break;
            }
        }

        if result.matched_count == 0 && options.upsert {
            let mut seeded = upsert_seed(query);
            apply_update(&mut seeded, query, update, true)?;
            let id = seeded
                .get(ID_KEY)
                .filter(|id| !id.is_null())
                .cloned()
                .unwrap_or_else(new_id);
            ensure_unique(documents, &id)?;
            let mut doc = RawDocument::new();
            doc.insert(ID_KEY.to_string(), id.clone());
            for (key, value) in seeded {
                if key != ID_KEY {
                    doc.insert(key, value);
                }
            }
            documents.push(doc);
            result.upserted_id = Some(id);
        }
        Ok(result)
    }

    async fn execute_insert(&self, collection: &str, documents: Vec<RawDocument>) -> Result<Vec<JsonValue>> {
        let mut collections = self.collections.write().await;
        let stored = collections.entry(collection.to_string()).or_default();
        let mut ids = Vec::with_capacity(documents.len());
        for mut doc in documents {
            let existing = doc.get(ID_KEY).filter(|id| !id.is_null()).cloned();
            let id = match existing {
                Some(id) => id,
                None => {
                    let id = new_id();
                    let mut with_id = RawDocument::new();
                    with_id.insert(ID_KEY.to_string(), id.clone());
                    with_id.extend(doc.into_iter().filter(|(k, _)| k != ID_KEY));
                    doc = with_id;
                    id
                }
            };
            ensure_unique(stored, &id)?;
            stored.push(doc);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn execute_fetch_by_ids(&self, collection: &str, ids: &[JsonValue]) -> Result<Vec<RawDocument>> {
        self.fetches.lock()?.push(FetchCall {
            collection: collection.to_string(),
            ids: ids.to_vec(),
        });
        let wanted: HashSet<String> = ids.iter().map(id_key).collect();
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| doc.get(ID_KEY).is_some_and(|id| wanted.contains(&id_key(id))))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn new_id() -> JsonValue {
    JsonValue::String(Uuid::new_v4().to_string())
}

fn ensure_unique(documents: &[RawDocument], id: &JsonValue) -> Result<()> {
    if documents.iter().any(|doc| doc.get(ID_KEY) == Some(id)) {
        return Err(OdmError::Driver(format!("duplicate key error: _id {id}")));
    }
    Ok(())
}

/// Missing values sort first in ascending order.
fn sort_order(a: &RawDocument, b: &RawDocument, keys: &[(String, SortDirection)]) -> Ordering {
    for (key, direction) in keys {
        let ordering = match (get_path(a, key), get_path(b, key)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
        };
        let ordering = match direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn project(doc: RawDocument, projection: &RawDocument) -> RawDocument {
    let included = |flag: &JsonValue| flag.as_i64().map_or(flag.as_bool() == Some(true), |n| n != 0);
    let inclusive = projection
        .iter()
        .any(|(key, flag)| key != ID_KEY && included(flag));
    let keep_id = projection.get(ID_KEY).is_none_or(included);

    if inclusive {
        let mut out = RawDocument::new();
        if keep_id {
            if let Some(id) = doc.get(ID_KEY) {
                out.insert(ID_KEY.to_string(), id.clone());
            }
        }
        for (key, flag) in projection {
            if key == ID_KEY || !included(flag) {
                continue;
            }
            if let Some(value) = get_path(&doc, key) {
                place(&mut out, key, value.clone(), "projection");
            }
        }
        out
    } else {
        let mut out = doc;
        for (key, _) in projection.iter().filter(|(k, _)| k.as_str() != ID_KEY) {
            remove_path(&mut out, key);
        }
        if !keep_id {
            out.shift_remove(ID_KEY);
        }
        out
    }
}

/// Equality conditions of a filter become the initial upserted document.
fn upsert_seed(query: &CompiledQuery) -> RawDocument {
    let mut seed = Map::new();
    for (key, value) in query {
        if key.starts_with('$') {
            continue;
        }
        let is_operator = value
            .as_object()
            .is_some_and(|m| m.keys().any(|k| k.starts_with('$')));
        if is_operator {
            match value.get("$eq") {
                Some(eq) => place(&mut seed, key, eq.clone(), "upsert seed"),
                None => continue,
            }
        } else {
            place(&mut seed, key, value.clone(), "upsert seed");
        }
    }
    seed
}

/// Writes a dotted path into a derived document. A path that collides with
/// one already written is dropped.
fn place(doc: &mut RawDocument, path: &str, value: JsonValue, context: &str) {
    if let Err(e) = set_path(doc, path, value) {
        event!(Level::DEBUG, path, context, error = %e, "path dropped");
    }
}
