//! # Haven Engine
//!
//! Core logic for the haven backend-as-a-service: the document envelope,
//! collection schemas with coercion and validation, the query language, and
//! its two execution targets (an in-process matcher and a SQL compiler).
//!
//! ## Design Principles
//!
//! - **No IO**: the engine has no knowledge of files, network, or storage
//! - **Deterministic**: timestamps are passed in, never read from a clock
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Documents
//!
//! A document is a JSON object with an opaque `id` plus `createdAt` /
//! `updatedAt` timestamps stamped by the caller. Fields outside the schema
//! are permitted and stored verbatim.
//!
//! ### Schemas
//!
//! A [`CollectionConfig`] declares field types, requiredness, defaults,
//! uniqueness and index hints. [`CollectionConfig::normalize`] coerces an
//! incoming document and accumulates field errors instead of failing fast.
//!
//! ### Queries
//!
//! Queries arrive as MongoDB-style JSON objects and parse into a [`Filter`]
//! tree. The same tree is either evaluated directly against documents
//! ([`matcher::matches`]) or compiled to a parameterized SQL WHERE clause
//! ([`sql::compile_filter`]) for the hybrid column+JSON layout.

pub mod document;
pub mod error;
pub mod matcher;
pub mod query;
pub mod schema;
pub mod sql;

// Re-export main types at crate root
pub use document::{get_path, merge_patch, Document, Projection};
pub use error::Error;
pub use matcher::{compare_values, matches, sort_documents};
pub use query::{Filter, FindOptions, Predicate, SortDirection};
pub use schema::{CollectionConfig, FieldSpec, FieldType, ValidationErrors, WriteOp};
pub use sql::{SqlParam, SqlQuery};

/// Type aliases for clarity
pub type CollectionName = String;
pub type DocumentId = String;

/// Reserved document field holding the identifier.
pub const ID_FIELD: &str = "id";
/// Reserved timestamp fields maintained by the pipeline.
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const UPDATED_AT_FIELD: &str = "updatedAt";
