//! Batched reference resolution.
//!
//! References found in the input are grouped by the collection they point
//! to and fetched with one `execute_fetch_by_ids` call per collection and
//! round. Round `n` scans the documents fetched in round `n - 1`, so
//! `max_depth` bounds how many hops away from the input a reference may be
//! and still get resolved. Every distinct `(collection, id)` is fetched at
//! most once per call and attached as a single shared [`Arc<Document>`].

use crate::core::value::{ID_KEY, id_key};
use crate::core::{DocRef, RefTarget, Result, Value};
use crate::document::Document;
use crate::driver::Driver;
use crate::schema::{DocumentType, Registry};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Key of one fetched document: its collection and canonical id.
type ObjectKey = (String, String);

/// Distinct ids to fetch, grouped by collection.
#[derive(Debug, Default)]
struct ReferenceMap {
    targets: BTreeMap<String, Target>,
}

#[derive(Debug)]
struct Target {
    declared: Arc<DocumentType>,
    ids: Vec<JsonValue>,
    seen: HashSet<String>,
}

impl ReferenceMap {
    fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn add(&mut self, collection: String, declared: Arc<DocumentType>, id: &JsonValue) {
        let target = self.targets.entry(collection).or_insert_with(|| Target {
            declared,
            ids: Vec::new(),
            seen: HashSet::new(),
        });
        if target.seen.insert(id_key(id)) {
            target.ids.push(id.clone());
        }
    }
}

/// A fetched document and the round it was fetched in.
struct Fetched {
    document: Document,
    level: usize,
}

struct Resolver<'r> {
    registry: &'r Registry,
    max_depth: usize,
    fetched: HashMap<ObjectKey, Fetched>,
    /// Every key asked from the driver so far, found or not.
    requested: HashSet<ObjectKey>,
    linked: HashMap<ObjectKey, Arc<Document>>,
}

/// Resolves references inside `values` in place, up to `max_depth` hops.
///
/// Resolved references become [`Value::Linked`]; references whose target
/// does not exist stay [`Value::Reference`]. `max_depth == 0` does nothing.
pub async fn resolve_references<D>(
    driver: &D,
    registry: &Registry,
    values: &mut [Value],
    max_depth: usize,
) -> Result<()>
where
    D: Driver + ?Sized,
{
    if max_depth == 0 {
        return Ok(());
    }
    let mut resolver = Resolver::new(registry, max_depth);
    let mut first = ReferenceMap::default();
    for value in values.iter() {
        resolver.scan_value(value, &mut first)?;
    }
    resolver
        .run(driver, first)
        .instrument(info_span!("dereference.values", count = values.len(), max_depth))
        .await?;
    for value in values.iter_mut() {
        resolver.attach_value(value, &mut Vec::new());
    }
    Ok(())
}

/// Same as [`resolve_references`] over the fields of whole documents.
///
/// Attaching does not mark the documents dirty.
pub async fn resolve_documents<D>(
    driver: &D,
    registry: &Registry,
    documents: &mut [Document],
    max_depth: usize,
) -> Result<()>
where
    D: Driver + ?Sized,
{
    if max_depth == 0 {
        return Ok(());
    }
    let mut resolver = Resolver::new(registry, max_depth);
    let mut first = ReferenceMap::default();
    for doc in documents.iter() {
        resolver.scan_document(doc, &mut first)?;
    }
    resolver
        .run(driver, first)
        .instrument(info_span!("dereference.documents", count = documents.len(), max_depth))
        .await?;
    for doc in documents.iter_mut() {
        let (values, _) = doc.parts_mut();
        for value in values.values_mut() {
            resolver.attach_value(value, &mut Vec::new());
        }
    }
    Ok(())
}

impl<'r> Resolver<'r> {
    fn new(registry: &'r Registry, max_depth: usize) -> Self {
        Self {
            registry,
            max_depth,
            fetched: HashMap::new(),
            requested: HashSet::new(),
            linked: HashMap::new(),
        }
    }

    async fn run<D: Driver + ?Sized>(&mut self, driver: &D, first: ReferenceMap) -> Result<()> {
        let mut pending = first;
        let mut level = 1;
        while !pending.is_empty() && level <= self.max_depth {
            let mut fetched_now = Vec::new();
            for (collection, target) in pending.targets {
                for id in &target.ids {
                    self.requested.insert((collection.clone(), id_key(id)));
                }
                let raws = driver.execute_fetch_by_ids(&collection, &target.ids).await?;
                event!(
                    Level::DEBUG,
                    collection = collection.as_str(),
                    requested = target.ids.len(),
                    found = raws.len(),
                    level,
                    "fetched references"
                );
                for raw in raws {
                    let Some(id) = raw.get(ID_KEY).cloned() else {
                        continue;
                    };
                    let doc_type = self.registry.polymorphic_type(&target.declared, &raw);
                    match Document::from_storage(self.registry, &doc_type, raw) {
                        Ok(document) => {
                            let key = (collection.clone(), id_key(&id));
                            fetched_now.push(key.clone());
                            self.fetched.insert(key, Fetched { document, level });
                        }
                        Err(err) => {
                            event!(
                                Level::WARN,
                                collection = collection.as_str(),
                                id = %id,
                                error = %err,
                                "fetched document could not be decoded"
                            );
                        }
                    }
                }
            }

            let mut next = ReferenceMap::default();
            if level < self.max_depth {
                for key in &fetched_now {
                    if let Some(entry) = self.fetched.get(key) {
                        self.scan_document(&entry.document, &mut next)?;
                    }
                }
            }
            pending = next;
            level += 1;
        }
        Ok(())
    }

    /// Collection and declared type a reference points to, or `None` when
    /// it cannot be fetched.
    fn locate(&self, reference: &DocRef) -> Result<Option<(String, Arc<DocumentType>)>> {
        match &reference.target {
            RefTarget::Type(name) => {
                let doc_type = self.registry.get(name)?;
                Ok(doc_type
                    .collection()
                    .map(|collection| (collection.to_string(), Arc::clone(&doc_type))))
            }
            RefTarget::Collection {
                collection,
                class_name,
            } => {
                let declared = class_name
                    .as_deref()
                    .and_then(|c| self.registry.by_class_name(c))
                    .or_else(|| self.registry.for_collection(collection));
                Ok(declared.map(|t| (collection.clone(), t)))
            }
        }
    }

    fn scan_document(&self, doc: &Document, out: &mut ReferenceMap) -> Result<()> {
        for (_, value) in doc.iter() {
            self.scan_value(value, out)?;
        }
        Ok(())
    }

    fn scan_value(&self, value: &Value, out: &mut ReferenceMap) -> Result<()> {
        match value {
            Value::Reference(reference) => {
                if let Some((collection, declared)) = self.locate(reference)? {
                    let key = (collection.clone(), reference.id_key());
                    if !self.requested.contains(&key) {
                        out.add(collection, declared, &reference.id);
                    }
                }
            }
            Value::List(items) => {
                for item in items {
                    self.scan_value(item, out)?;
                }
            }
            Value::Dict(map) => {
                for item in map.values() {
                    self.scan_value(item, out)?;
                }
            }
            Value::Document(doc) => self.scan_document(doc, out)?,
            _ => {}
        }
        Ok(())
    }

    fn object_key(&self, reference: &DocRef) -> Option<ObjectKey> {
        let collection = match &reference.target {
            RefTarget::Type(name) => self.registry.get(name).ok()?.collection()?.to_string(),
            RefTarget::Collection { collection, .. } => collection.clone(),
        };
        Some((collection, reference.id_key()))
    }

    /// Replaces resolvable references under `value`. `stack` holds the
    /// documents being linked on the current path; a reference back to one
    /// of them closes a cycle and stays raw.
    fn attach_value(&mut self, value: &mut Value, stack: &mut Vec<ObjectKey>) {
        match value {
            Value::Reference(reference) => {
                let Some(key) = self.object_key(reference) else {
                    return;
                };
                if let Some(doc) = self.link(&key, stack) {
                    *value = Value::Linked(doc);
                }
            }
            Value::List(items) => {
                for item in items.iter_mut() {
                    self.attach_value(item, stack);
                }
            }
            Value::Dict(map) => {
                for item in map.values_mut() {
                    self.attach_value(item, stack);
                }
            }
            Value::Document(doc) => {
                let (values, _) = doc.parts_mut();
                for item in values.values_mut() {
                    self.attach_value(item, stack);
                }
            }
            _ => {}
        }
    }

    fn link(&mut self, key: &ObjectKey, stack: &mut Vec<ObjectKey>) -> Option<Arc<Document>> {
        if let Some(doc) = self.linked.get(key) {
            return Some(Arc::clone(doc));
        }
        if stack.contains(key) {
            return None;
        }
        let Fetched { mut document, level } = self.fetched.remove(key)?;
        if level < self.max_depth {
            stack.push(key.clone());
            let (values, _) = document.parts_mut();
            for value in values.values_mut() {
                self.attach_value(value, stack);
            }
            stack.pop();
        }
        let doc = Arc::new(document);
        self.linked.insert(key.clone(), Arc::clone(&doc));
        Some(doc)
    }
}
