//! In-memory document store.
//!
//! The default single-instance backend and the test backend. Queries are
//! evaluated natively with the engine matcher, so this is the "document
//! database" side of the store abstraction: filters pass through unchanged.

use async_trait::async_trait;
use dashmap::DashMap;
use haven_engine::{
    matcher, merge_patch, CollectionConfig, Document, Filter, FindOptions, ID_FIELD,
};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{validate_collection_name, Store, StoreError};

/// Documents per collection, keyed by id. The inner map is ordered so that
/// unsorted scans are deterministic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: DashMap<String, BTreeMap<String, Document>>,
    configs: DashMap<String, CollectionConfig>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn unique_fields(&self, collection: &str) -> Vec<String> {
        self.configs
            .get(collection)
            .map(|config| {
                config
                    .properties
                    .iter()
                    .filter(|(_, spec)| spec.unique)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Scan for another document holding the same value on a unique field.
    fn check_unique(
        docs: &BTreeMap<String, Document>,
        unique_fields: &[String],
        candidate: &Document,
        skip_id: Option<&str>,
    ) -> Result<(), StoreError> {
        for field in unique_fields {
            let Some(value) = candidate.get(field) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            for (id, existing) in docs {
                if Some(id.as_str()) == skip_id {
                    continue;
                }
                if existing
                    .get(field)
                    .is_some_and(|other| matcher::values_equal(value, other))
                {
                    return Err(StoreError::UniqueViolation(field.clone()));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn native_queries(&self) -> bool {
        true
    }

    async fn sync_collection(
        &self,
        name: &str,
        config: &CollectionConfig,
    ) -> Result<(), StoreError> {
        validate_collection_name(name)?;
        self.collections.entry(name.to_string()).or_default();
        self.configs.insert(name.to_string(), config.clone());
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        self.collections.remove(name);
        self.configs.remove(name);
        Ok(())
    }

    async fn insert(&self, collection: &str, doc: Document) -> Result<Document, StoreError> {
        let id = doc
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Backend("insert without id".into()))?
            .to_string();

        let unique_fields = self.unique_fields(collection);
        let mut docs = self.collections.entry(collection.to_string()).or_default();

        if docs.contains_key(&id) {
            return Err(StoreError::DuplicateId);
        }
        Self::check_unique(&docs, &unique_fields, &doc, None)?;

        docs.insert(id, doc.clone());
        Ok(doc)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        let mut matches: Vec<Document> = self
            .collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| matcher::matches(filter, doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        matcher::sort_documents(&mut matches, &options.sort);

        let skip = options.skip.unwrap_or(0) as usize;
        let mut page: Vec<Document> = match options.limit {
            Some(limit) => matches.into_iter().skip(skip).take(limit as usize).collect(),
            None => matches.into_iter().skip(skip).collect(),
        };

        if let Some(projection) = &options.fields {
            page = page.iter().map(|doc| projection.apply(doc)).collect();
        }

        Ok(page)
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        Ok(self.collections.get(collection).and_then(|docs| {
            docs.values()
                .find(|doc| matcher::matches(filter, doc))
                .cloned()
        }))
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: Document,
    ) -> Result<u64, StoreError> {
        let unique_fields = self.unique_fields(collection);
        let Some(mut docs) = self.collections.get_mut(collection) else {
            return Ok(0);
        };

        let targets: Vec<String> = docs
            .iter()
            .filter(|(_, doc)| matcher::matches(filter, doc))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &targets {
            let mut updated = docs[id].clone();
            merge_patch(&mut updated, patch.clone());
            Self::check_unique(&docs, &unique_fields, &updated, Some(id.as_str()))?;
            docs.insert(id.clone(), updated);
        }

        Ok(targets.len() as u64)
    }

    async fn remove(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let Some(mut docs) = self.collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, doc| !matcher::matches(filter, doc));
        Ok((before - docs.len()) as u64)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        Ok(self
            .collections
            .get(collection)
            .map(|docs| docs.values().filter(|doc| matcher::matches(filter, doc)).count())
            .unwrap_or(0) as u64)
    }
}
