//! Store boundary.
//!
//! Everything the mapper needs from a document store goes through the
//! [`Driver`] trait: filter/update/insert with native query documents, and
//! the batched id lookup used when dereferencing.

pub mod matcher;
pub mod memory;
pub mod update;

pub use memory::{FetchCall, MemoryDriver};

use crate::core::{CompiledQuery, CompiledUpdate, RawDocument, Result};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Options of a find call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// `{"field": 1}` inclusion or `{"field": 0}` exclusion document.
    pub projection: Option<RawDocument>,
    pub sort: Vec<(String, SortDirection)>,
    pub limit: Option<usize>,
    pub skip: usize,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn projection(mut self, projection: RawDocument) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn sort_by(mut self, key: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push((key.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub upsert: bool,
    pub multi: bool,
}

impl UpdateOptions {
    pub fn multi() -> Self {
        Self {
            upsert: false,
            multi: true,
        }
    }

    pub fn single() -> Self {
        Self::default()
    }

    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub matched_count: usize,
    pub modified_count: usize,
    pub upserted_id: Option<JsonValue>,
}

#[async_trait]
pub trait Driver: Send + Sync {
    async fn execute_find(
        &self,
        collection: &str,
        query: &CompiledQuery,
        options: &FindOptions,
    ) -> Result<Vec<RawDocument>>;

    async fn execute_update(
        &self,
        collection: &str,
        query: &CompiledQuery,
        update: &CompiledUpdate,
        options: &UpdateOptions,
    ) -> Result<UpdateResult>;

    /// Inserts documents and returns their ids, assigning one where `_id`
    /// is missing.
    async fn execute_insert(
        &self,
        collection: &str,
        documents: Vec<RawDocument>,
    ) -> Result<Vec<JsonValue>>;

    /// Fetches every document of `collection` whose `_id` is in `ids`, in
    /// one round trip. Missing ids are simply absent from the result.
    async fn execute_fetch_by_ids(
        &self,
        collection: &str,
        ids: &[JsonValue],
    ) -> Result<Vec<RawDocument>>;

    async fn execute_count(&self, collection: &str, query: &CompiledQuery) -> Result<usize> {
        Ok(self
            .execute_find(collection, query, &FindOptions::default())
            .await?
            .len())
    }
}
