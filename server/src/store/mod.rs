//! The uniform document store interface and its backends.
//!
//! Everything above this module speaks documents and query trees; the
//! backends own persistence. Two implementations ship: an in-memory
//! document store that evaluates queries natively, and a hybrid
//! column+JSON SQLite store that compiles them to SQL.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use haven_engine::{CollectionConfig, Document, Filter, FindOptions};

/// Errors surfaced by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate id")]
    DuplicateId,

    #[error("duplicate value for unique field '{0}'")]
    UniqueViolation(String),

    #[error("unknown collection '{0}'")]
    UnknownCollection(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Query(#[from] haven_engine::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Uniform document store interface.
///
/// Single-document reads and writes are linearizable; the backend provides
/// this. `update` and `remove` apply to every document matching the filter.
#[async_trait]
pub trait Store: Send + Sync {
    /// Human-readable backend name for diagnostics.
    fn backend(&self) -> &'static str;

    /// Whether the backend executes query trees natively. Backends that
    /// translate to SQL return false and reject `$forceMongo`.
    fn native_queries(&self) -> bool;

    /// Generate a fresh document identifier.
    fn create_unique_identifier(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Make a collection exist with the given layout. Additive only:
    /// existing columns are never dropped or retyped.
    async fn sync_collection(
        &self,
        name: &str,
        config: &CollectionConfig,
    ) -> Result<(), StoreError>;

    /// Drop a collection and every document in it.
    async fn drop_collection(&self, name: &str) -> Result<(), StoreError>;

    /// Insert a document. The `id` field must already be set.
    async fn insert(&self, collection: &str, doc: Document) -> Result<Document, StoreError>;

    /// Find documents matching a filter, honoring sort/skip/limit/projection.
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError>;

    /// First document matching a filter, or none.
    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError>;

    /// Shallow-merge a patch into every matching document. Returns the
    /// number of documents updated.
    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: Document,
    ) -> Result<u64, StoreError>;

    /// Remove every matching document. Returns the number removed.
    async fn remove(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;

    /// Count matching documents.
    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;
}

/// Valid collection (and thus table) names: letters, digits, `_` and `-`,
/// starting with a letter.
pub fn validate_collection_name(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => chars.all(|c| {
            c.is_ascii_alphanumeric() || c == '_' || c == '-'
        }),
        _ => false,
    };
    if valid && name.len() <= 64 {
        Ok(())
    } else {
        Err(StoreError::Backend(format!("invalid collection name '{name}'")))
    }
}
