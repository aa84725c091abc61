//! Mapper facade: persisting documents and querying them back.
//!
//! ```ignore
//! let mapper = Mapper::new(registry, Arc::new(MemoryDriver::new()));
//! let mut post = mapper.document("Post")?;
//! post.set("title", "hello")?;
//! mapper.save(&mut post).await?;
//!
//! let recent = mapper
//!     .objects("Post")?
//!     .filter(Q::cond("title__startswith", "he"))
//!     .order_by(&["-created"])
//!     .select_related(2)
//!     .all()
//!     .await?;
//! ```

use crate::config::MapperConfig;
use crate::core::value::{CLASS_KEY, ID_KEY};
use crate::core::{CompiledQuery, OdmError, RawDocument, Result, Value};
use crate::delta::{DeltaMode, compute_delta};
use crate::dereference::resolve_documents;
use crate::document::Document;
use crate::driver::{Driver, FindOptions, SortDirection, UpdateOptions, UpdateResult};
use crate::query::{Conditions, Q, compile_update};
use crate::schema::{DocumentType, Registry, resolve, split_keyword, storage_path};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

pub struct Mapper<D: Driver> {
    registry: Registry,
    driver: Arc<D>,
    config: MapperConfig,
}

impl<D: Driver> Mapper<D> {
    pub fn new(registry: Registry, driver: Arc<D>) -> Self {
        Self {
            registry,
            driver,
            config: MapperConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MapperConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    /// A new, unsaved document of a registered type.
    pub fn document(&self, type_name: &str) -> Result<Document> {
        Ok(Document::new(&self.registry.get(type_name)?))
    }

    /// Persists a document.
    ///
    /// New documents are inserted whole and receive their primary key from
    /// the store when none was set. Loaded documents send only their
    /// incremental delta; nothing is written when it is empty. The dirty
    /// state is cleared after a successful write.
    pub async fn save(&self, doc: &mut Document) -> Result<()> {
        let doc_type = Arc::clone(doc.doc_type());
        let collection = doc_type
            .collection()
            .ok_or_else(|| {
                OdmError::Operation(format!(
                    "Embedded document '{}' cannot be saved on its own",
                    doc_type.name()
                ))
            })?
            .to_string();
        let span = info_span!(
            "mapper.save",
            database = %self.config.database,
            doc_type = doc_type.name(),
            new = doc.is_new()
        );
        self.write(doc, &collection).instrument(span).await
    }

    async fn write(&self, doc: &mut Document, collection: &str) -> Result<()> {
        if doc.is_new() {
            doc.apply_defaults();
        }
        doc.validate()?;
        if doc.is_new() {
            let mut raw = doc.to_storage()?;
            let ids = self.driver.execute_insert(collection, vec![raw.clone()]).await?;
            let id = ids
                .into_iter()
                .next()
                .ok_or_else(|| OdmError::Driver("insert returned no id".to_string()))?;
            if doc.pk().is_none() {
                let pk = doc
                    .doc_type()
                    .primary_key_field()
                    .map(|field| field.from_storage(&self.registry, &id))
                    .transpose()?
                    .unwrap_or_else(|| Value::from_json(&id));
                doc.set_pk(pk)?;
            }
            raw.insert(ID_KEY.to_string(), id);
            event!(Level::DEBUG, collection, "document inserted");
            doc.mark_persisted(raw);
            return Ok(());
        }

        let delta = compute_delta(doc, DeltaMode::Incremental)?;
        if delta.is_empty() {
            event!(Level::DEBUG, "nothing to save");
            return Ok(());
        }
        let mut query = CompiledQuery::new();
        query.insert(ID_KEY.to_string(), doc.pk_json()?);
        let update = delta.to_update();
        if self.config.log_queries {
            event!(
                Level::DEBUG,
                collection,
                update = %JsonValue::Object(update.clone()),
                "saving delta"
            );
        }
        self.driver
            .execute_update(collection, &query, &update, &UpdateOptions::single())
            .await?;
        let raw = doc.to_storage()?;
        doc.mark_persisted(raw);
        Ok(())
    }

    /// Entry point of a query on a registered type.
    pub fn objects(&self, type_name: &str) -> Result<QuerySet<'_, D>> {
        let doc_type = self.registry.get(type_name)?;
        if doc_type.collection().is_none() {
            return Err(OdmError::Operation(format!(
                "Embedded document '{type_name}' has no collection to query"
            )));
        }
        Ok(QuerySet::new(self, doc_type))
    }

    /// Resolves references of already loaded documents.
    pub async fn dereference(&self, documents: &mut [Document], max_depth: usize) -> Result<()> {
        resolve_documents(self.driver.as_ref(), &self.registry, documents, max_depth).await
    }
}

/// Lazily built query over one collection.
pub struct QuerySet<'m, D: Driver> {
    mapper: &'m Mapper<D>,
    doc_type: Arc<DocumentType>,
    filter: Q,
    order: Vec<String>,
    only: Vec<String>,
    skip: usize,
    limit: Option<usize>,
    depth: Option<usize>,
}

impl<D: Driver> Clone for QuerySet<'_, D> {
    fn clone(&self) -> Self {
        Self {
            mapper: self.mapper,
            doc_type: Arc::clone(&self.doc_type),
            filter: self.filter.clone(),
            order: self.order.clone(),
            only: self.only.clone(),
            skip: self.skip,
            limit: self.limit,
            depth: self.depth,
        }
    }
}

impl<'m, D: Driver> QuerySet<'m, D> {
    fn new(mapper: &'m Mapper<D>, doc_type: Arc<DocumentType>) -> Self {
        Self {
            mapper,
            doc_type,
            filter: Q::new(),
            order: Vec::new(),
            only: Vec::new(),
            skip: 0,
            limit: None,
            depth: None,
        }
    }

    /// AND-s `q` into the current filter.
    pub fn filter(mut self, q: Q) -> Self {
        self.filter = std::mem::take(&mut self.filter) & q;
        self
    }

    /// Keys may use `__` paths; a leading `-` sorts descending.
    pub fn order_by(mut self, keys: &[&str]) -> Self {
        self.order = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Loads only the named fields (plus the primary key).
    pub fn only(mut self, fields: &[&str]) -> Self {
        self.only = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Dereferences loaded documents `depth` hops deep.
    pub fn select_related(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Restricts the query to one primary key.
    pub fn with_id(mut self, id: impl Into<Value>) -> Result<Self> {
        if !self.filter.is_empty() {
            return Err(OdmError::InvalidQuery(
                "Cannot use a filter whilst using `with_id`".to_string(),
            ));
        }
        self.filter = Q::cond("pk", id);
        Ok(self)
    }

    /// Native filter this query set sends to the store.
    pub fn to_query(&self) -> Result<CompiledQuery> {
        let mut query = self.filter.to_query(&self.mapper.registry, &self.doc_type)?;
        if self.doc_type.superclass().is_some() && !query.contains_key(CLASS_KEY) {
            let mut classes = vec![JsonValue::from(self.doc_type.class_name())];
            classes.extend(
                self.mapper
                    .registry
                    .subclasses_of(&self.doc_type)
                    .iter()
                    .map(|t| JsonValue::from(t.class_name())),
            );
            query.insert(CLASS_KEY.to_string(), serde_json::json!({ "$in": classes }));
        }
        Ok(query)
    }

    fn find_options(&self) -> Result<FindOptions> {
        let mut options = FindOptions::new().skip(self.skip);
        if let Some(limit) = self.limit {
            options = options.limit(limit);
        }
        for key in &self.order {
            let (direction, path) = match key.strip_prefix('-') {
                Some(path) => (SortDirection::Descending, path),
                None => (SortDirection::Ascending, key.strip_prefix('+').unwrap_or(key)),
            };
            options = options.sort_by(self.storage_key(path)?, direction);
        }
        if !self.only.is_empty() {
            let mut projection = RawDocument::new();
            for field in &self.only {
                projection.insert(self.storage_key(field)?, JsonValue::from(1));
            }
            options = options.projection(projection);
        }
        Ok(options)
    }

    fn storage_key(&self, path: &str) -> Result<String> {
        let segments = split_keyword(&path.replace('.', "__"));
        let elements = resolve(&self.mapper.registry, &self.doc_type, &segments)
            .map_err(|err| OdmError::InvalidQuery(err.to_string()))?;
        Ok(storage_path(&elements))
    }

    fn collection(&self) -> &str {
        self.doc_type.collection().unwrap_or_default()
    }

    fn log_query(&self, query: &CompiledQuery) {
        if self.mapper.config.log_queries {
            event!(
                Level::DEBUG,
                collection = self.collection(),
                query = %JsonValue::Object(query.clone()),
                "query"
            );
        }
    }

    /// Runs the query and decodes every matching document.
    pub async fn all(&self) -> Result<Vec<Document>> {
        let query = self.to_query()?;
        let options = self.find_options()?;
        self.log_query(&query);
        let raws = self
            .mapper
            .driver
            .execute_find(self.collection(), &query, &options)
            .await?;
        let mut documents = Vec::with_capacity(raws.len());
        for raw in raws {
            let doc_type = self.mapper.registry.polymorphic_type(&self.doc_type, &raw);
            documents.push(Document::from_storage(&self.mapper.registry, &doc_type, raw)?);
        }

        let depth = match self.depth {
            Some(depth) => depth,
            None if self.mapper.config.auto_dereference => self.mapper.config.max_depth,
            None => 0,
        };
        self.mapper.dereference(&mut documents, depth).await?;
        Ok(documents)
    }

    pub async fn first(&self) -> Result<Option<Document>> {
        Ok(self.clone().limit(1).all().await?.into_iter().next())
    }

    /// The single matching document.
    pub async fn get(&self) -> Result<Document> {
        let mut documents = self.all().await?;
        match documents.len() {
            0 => Err(OdmError::DoesNotExist(self.doc_type.name().to_string())),
            1 => Ok(documents.remove(0)),
            n => Err(OdmError::MultipleObjectsReturned(n)),
        }
    }

    pub async fn count(&self) -> Result<usize> {
        let query = self.to_query()?;
        self.log_query(&query);
        self.mapper
            .driver
            .execute_count(self.collection(), &query)
            .await
    }

    /// Applies update operations (`set__name`, `inc__views`, ...) to every
    /// matching document.
    pub async fn update(&self, operations: &Conditions) -> Result<UpdateResult> {
        let query = self.to_query()?;
        let update = compile_update(&self.mapper.registry, &self.doc_type, operations)?;
        if update.is_empty() {
            return Err(OdmError::InvalidQuery("No update parameters, would remove data".to_string()));
        }
        self.log_query(&query);
        self.mapper
            .driver
            .execute_update(self.collection(), &query, &update, &UpdateOptions::multi())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::schema::FieldDescriptor;

    fn mapper() -> Mapper<MemoryDriver> {
        let post = DocumentType::builder("Post")
            .field(FieldDescriptor::string("title"))
            .field(FieldDescriptor::int("views").default(0))
            .build()
            .unwrap();
        Mapper::new(Registry::new().with_type(post).unwrap(), Arc::new(MemoryDriver::new()))
    }

    #[tokio::test]
    async fn test_save_assigns_pk_and_clears_changes() {
        let mapper = mapper();
        let mut post = mapper.document("Post").unwrap();
        post.set("title", "hello").unwrap();
        mapper.save(&mut post).await.unwrap();
        assert!(!post.is_new());
        assert!(post.pk().is_some());
        assert!(post.changed_fields().is_empty());
        assert_eq!(post.get("views"), Some(&Value::Int(0)));
    }

    #[tokio::test]
    async fn test_required_field_with_default_saves() {
        let counter = DocumentType::builder("Counter")
            .field(FieldDescriptor::int("hits").required().default(0))
            .field(FieldDescriptor::string("label").required())
            .build()
            .unwrap();
        let mapper = Mapper::new(Registry::new().with_type(counter).unwrap(), Arc::new(MemoryDriver::new()));

        let mut doc = mapper.document("Counter").unwrap();
        assert!(matches!(
            mapper.save(&mut doc).await,
            Err(OdmError::Validation { ref field, .. }) if field == "label"
        ));

        doc.set("label", "page").unwrap();
        mapper.save(&mut doc).await.unwrap();
        assert_eq!(doc.get("hits"), Some(&Value::Int(0)));
        let stored = mapper.driver().documents("counter").await;
        assert_eq!(stored[0]["hits"], serde_json::json!(0));
    }

    #[tokio::test]
    async fn test_with_id_after_filter_is_rejected() {
        let mapper = mapper();
        let result = mapper
            .objects("Post")
            .unwrap()
            .filter(Q::cond("title", "x"))
            .with_id("abc");
        assert!(matches!(result, Err(OdmError::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn test_unknown_type_is_not_registered() {
        assert!(matches!(mapper().objects("Nope"), Err(OdmError::NotRegistered(_))));
    }

    #[tokio::test]
    async fn test_get_errors() {
        let mapper = mapper();
        for title in ["a", "a"] {
            let mut post = mapper.document("Post").unwrap();
            post.set("title", title).unwrap();
            mapper.save(&mut post).await.unwrap();
        }
        let posts = mapper.objects("Post").unwrap();
        assert!(matches!(
            posts.clone().filter(Q::cond("title", "b")).get().await,
            Err(OdmError::DoesNotExist(_))
        ));
        assert!(matches!(
            posts.filter(Q::cond("title", "a")).get().await,
            Err(OdmError::MultipleObjectsReturned(2))
        ));
    }
}
