//! Observed containers.
//!
//! A view borrows a list or dict living somewhere inside a document together
//! with the owner's [`ChangeSet`] and the dotted path of the container. Every
//! mutation goes through the view and records its path, so the document never
//! has to be reachable from the container.

use crate::core::{OdmError, Result, Value};
use crate::document::{ChangeSet, Document};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A value reached through an observed path.
pub enum Observed<'a> {
    List(ObservedList<'a>),
    Dict(ObservedDict<'a>),
    /// Embedded documents track their own changes.
    Document(&'a mut Document),
    /// Scalars cannot be mutated in place; assign through the parent instead.
    Value(&'a Value),
}

impl<'a> Observed<'a> {
    pub fn into_list(self) -> Option<ObservedList<'a>> {
        match self {
            Self::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn into_dict(self) -> Option<ObservedDict<'a>> {
        match self {
            Self::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    pub fn into_document(self) -> Option<&'a mut Document> {
        match self {
            Self::Document(doc) => Some(doc),
            _ => None,
        }
    }
}

/// Wraps `value` found at `path`. Containers become observed views, embedded
/// documents are handed out as-is. Pass `None` as tracker for an unattached
/// value: mutations are then not recorded anywhere.
pub fn observe<'a>(
    value: &'a mut Value,
    tracker: Option<&'a mut ChangeSet>,
    path: impl Into<String>,
) -> Observed<'a> {
    match value {
        Value::List(items) => Observed::List(ObservedList::new(items, tracker, path)),
        Value::Dict(map) => Observed::Dict(ObservedDict::new(map, tracker, path)),
        Value::Document(doc) => Observed::Document(doc),
        other => Observed::Value(other),
    }
}

fn mark(tracker: &mut Option<&mut ChangeSet>, path: &str, key: Option<&str>) {
    if let Some(changes) = tracker.as_deref_mut() {
        match key {
            Some(key) => changes.mark(&format!("{path}.{key}")),
            None => changes.mark(path),
        }
    }
}

pub struct ObservedList<'a> {
    items: &'a mut Vec<Value>,
    tracker: Option<&'a mut ChangeSet>,
    path: String,
}

impl<'a> ObservedList<'a> {
    pub fn new(
        items: &'a mut Vec<Value>,
        tracker: Option<&'a mut ChangeSet>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            items,
            tracker,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[Value] {
        self.items
    }

    /// Nested view of the element at `index`, observed at `<path>.<index>`.
    pub fn get_mut(&mut self, index: usize) -> Option<Observed<'_>> {
        let path = format!("{}.{}", self.path, index);
        let item = self.items.get_mut(index)?;
        Some(observe(item, self.tracker.as_deref_mut(), path))
    }

    pub fn set(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        let len = self.items.len();
        let slot = self.items.get_mut(index).ok_or_else(|| {
            OdmError::Operation(format!(
                "list assignment index {index} out of range for list of length {len}"
            ))
        })?;
        *slot = value.into();
        mark(&mut self.tracker, &self.path, Some(&index.to_string()));
        Ok(())
    }

    pub fn remove_at(&mut self, index: usize) -> Result<Value> {
        if index >= self.items.len() {
            return Err(OdmError::Operation(format!(
                "list index {index} out of range"
            )));
        }
        let removed = self.items.remove(index);
        mark(&mut self.tracker, &self.path, None);
        Ok(removed)
    }

    pub fn push(&mut self, value: impl Into<Value>) {
        self.items.push(value.into());
        mark(&mut self.tracker, &self.path, None);
    }

    pub fn extend<I, V>(&mut self, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.items.extend(values.into_iter().map(Into::into));
        mark(&mut self.tracker, &self.path, None);
    }

    /// Inserts before `index`; an index past the end appends.
    pub fn insert(&mut self, index: usize, value: impl Into<Value>) {
        let index = index.min(self.items.len());
        self.items.insert(index, value.into());
        mark(&mut self.tracker, &self.path, None);
    }

    pub fn pop(&mut self) -> Option<Value> {
        let popped = self.items.pop()?;
        mark(&mut self.tracker, &self.path, None);
        Some(popped)
    }

    /// Removes the first element equal to `value`.
    pub fn remove(&mut self, value: &Value) -> Result<Value> {
        let index = self
            .items
            .iter()
            .position(|item| item == value)
            .ok_or_else(|| OdmError::Operation(format!("{value} is not in list")))?;
        self.remove_at(index)
    }

    pub fn sort_by<F>(&mut self, compare: F)
    where
        F: FnMut(&Value, &Value) -> Ordering,
    {
        self.items.sort_by(compare);
        mark(&mut self.tracker, &self.path, None);
    }

    pub fn reverse(&mut self) {
        self.items.reverse();
        mark(&mut self.tracker, &self.path, None);
    }

    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&Value) -> bool,
    {
        self.items.retain(keep);
        mark(&mut self.tracker, &self.path, None);
    }

    pub fn clear(&mut self) {
        self.items.clear();
        mark(&mut self.tracker, &self.path, None);
    }
}

pub struct ObservedDict<'a> {
    map: &'a mut BTreeMap<String, Value>,
    tracker: Option<&'a mut ChangeSet>,
    path: String,
}

impl<'a> ObservedDict<'a> {
    pub fn new(
        map: &'a mut BTreeMap<String, Value>,
        tracker: Option<&'a mut ChangeSet>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            map,
            tracker,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, String, Value> {
        self.map.iter()
    }

    /// Nested view of the value under `key`, observed at `<path>.<key>`.
    pub fn get_mut(&mut self, key: &str) -> Option<Observed<'_>> {
        let path = format!("{}.{}", self.path, key);
        let item = self.map.get_mut(key)?;
        Some(observe(item, self.tracker.as_deref_mut(), path))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        mark(&mut self.tracker, &self.path, Some(&key));
        self.map.insert(key, value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.map.remove(key)?;
        mark(&mut self.tracker, &self.path, Some(key));
        Some(removed)
    }

    /// Alias of [`ObservedDict::remove`], kept for mapping-style call sites.
    pub fn pop(&mut self, key: &str) -> Option<Value> {
        self.remove(key)
    }

    /// Removes and returns the last entry in key order.
    pub fn pop_item(&mut self) -> Option<(String, Value)> {
        let entry = self.map.pop_last()?;
        mark(&mut self.tracker, &self.path, None);
        Some(entry)
    }

    pub fn update<I, K, V>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.map
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        mark(&mut self.tracker, &self.path, None);
    }

    /// Returns the value under `key`, inserting `default` first if missing.
    pub fn set_default(&mut self, key: impl Into<String>, default: impl Into<Value>) -> &Value {
        let key = key.into();
        if !self.map.contains_key(&key) {
            mark(&mut self.tracker, &self.path, None);
        }
        self.map.entry(key).or_insert_with(|| default.into())
    }

    pub fn clear(&mut self) {
        self.map.clear();
        mark(&mut self.tracker, &self.path, None);
    }
}
