//! Hybrid column+JSON SQLite store.
//!
//! Each collection maps to one table with an `id` primary key and a `data`
//! JSON column. Collections declaring `useColumns` additionally get a typed
//! native column per indexed primitive field; writes populate both, reads
//! overlay the columns onto the JSON. Schema evolution is additive only.

use async_trait::async_trait;
use dashmap::DashMap;
use haven_engine::{
    merge_patch, sql, CollectionConfig, Document, FieldType, Filter, FindOptions, SqlParam,
    ID_FIELD,
};
use serde_json::{Number, Value};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, SqlitePool};
use std::time::Duration;

use super::{validate_collection_name, Store, StoreError};

/// SQLite pragmas applied to every pool.
const PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA foreign_keys = ON",
    "PRAGMA busy_timeout = 5000",
];

/// Transient-failure retry budget for busy/locked databases.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct SqliteStore {
    pool: SqlitePool,
    configs: DashMap<String, CollectionConfig>,
}

impl SqliteStore {
    /// Connect to a SQLite DSN (`sqlite:path?mode=rwc` or `sqlite::memory:`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        // Pooled connections to :memory: would each see a private database.
        let max_connections = if url.contains(":memory:") || url.contains("mode=memory") {
            1
        } else {
            10
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        for pragma in PRAGMAS {
            sqlx::query(pragma)
                .execute(&pool)
                .await
                .map_err(map_sqlx_error)?;
        }

        Ok(Self {
            pool,
            configs: DashMap::new(),
        })
    }

    fn config(&self, collection: &str) -> CollectionConfig {
        self.configs
            .get(collection)
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Promoted column names with their declared types, in schema order.
    fn columns(&self, config: &CollectionConfig) -> Vec<(String, FieldType)> {
        config
            .column_fields()
            .map(|(name, spec)| (name.clone(), spec.field_type))
            .collect()
    }

    async fn existing_columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(&format!("PRAGMA table_info(\"{table}\")"))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(map_sqlx_error))
            .collect()
    }

    /// Execute a statement with a bounded retry on busy/locked errors.
    async fn execute_retrying(
        &self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<u64, StoreError> {
        let mut attempt = 0;
        loop {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_param(query, param);
            }
            match query.execute(&self.pool).await {
                Ok(result) => return Ok(result.rows_affected()),
                Err(e) if is_busy(&e) && attempt < RETRY_ATTEMPTS => {
                    attempt += 1;
                    tracing::debug!(attempt, "sqlite busy, retrying");
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                }
                Err(e) => return Err(classify_constraint(e)),
            }
        }
    }

    async fn fetch_rows(
        &self,
        collection: &str,
        filter: &Filter,
        tail: &str,
    ) -> Result<Vec<Document>, StoreError> {
        let config = self.config(collection);
        let compiled = sql::compile_filter(filter, &config)?;
        let columns = self.columns(&config);

        let select = format!(
            "SELECT * FROM \"{collection}\" WHERE {}{}",
            compiled.clause, tail
        );

        let mut query = sqlx::query(&select);
        for param in &compiled.params {
            query = bind_param(query, param);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_table_error(e, collection))?;

        rows.iter()
            .map(|row| row_to_document(row, &columns))
            .collect()
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn native_queries(&self) -> bool {
        false
    }

    async fn sync_collection(
        &self,
        name: &str,
        config: &CollectionConfig,
    ) -> Result<(), StoreError> {
        validate_collection_name(name)?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS \"{name}\" (id TEXT PRIMARY KEY, data TEXT NOT NULL)"
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        // Additive column promotion: unknown columns are created, existing
        // ones are left alone (never retyped or dropped).
        let existing = self.existing_columns(name).await?;
        for (field, spec) in config.column_fields() {
            if !existing.iter().any(|c| c == field) {
                let sql_type = column_type(spec.field_type);
                let ddl =
                    format!("ALTER TABLE \"{name}\" ADD COLUMN \"{field}\" {sql_type}");
                if let Err(e) = sqlx::query(&ddl).execute(&self.pool).await {
                    // Best effort: a concurrent sync may have added it first.
                    tracing::warn!(collection = name, field = %field, "column promotion failed: {e}");
                }
            }
        }

        // Promote unique/index declarations to native indexes. Fields
        // without a column get an expression index over the JSON.
        for (field, spec) in &config.properties {
            if !spec.index && !spec.unique {
                continue;
            }
            let unique = if spec.unique { "UNIQUE " } else { "" };
            let target = if config.has_column(field) {
                format!("\"{field}\"")
            } else {
                format!("json_extract(data, '$.{field}')")
            };
            let ddl = format!(
                "CREATE {unique}INDEX IF NOT EXISTS \"idx_{name}_{field}\" ON \"{name}\"({target})"
            );
            sqlx::query(&ddl)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }

        self.configs.insert(name.to_string(), config.clone());
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        validate_collection_name(name)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS \"{name}\""))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        self.configs.remove(name);
        Ok(())
    }

    async fn insert(&self, collection: &str, doc: Document) -> Result<Document, StoreError> {
        let config = self.config(collection);
        let id = doc
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Backend("insert without id".into()))?
            .to_string();

        let columns = self.columns(&config);
        let mut names = vec!["id".to_string(), "data".to_string()];
        let mut params = vec![
            SqlParam::Text(id),
            SqlParam::Text(Value::Object(doc.clone()).to_string()),
        ];
        for (field, field_type) in &columns {
            names.push(format!("\"{field}\""));
            params.push(column_param(*field_type, doc.get(field)));
        }

        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT INTO \"{collection}\" ({}) VALUES ({placeholders})",
            names.join(", ")
        );
        self.execute_retrying(&sql, &params).await?;

        Ok(doc)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        let config = self.config(collection);
        let tail = sql::compile_options(options, &config)?;
        let mut docs = self.fetch_rows(collection, filter, &tail).await?;

        if let Some(projection) = &options.fields {
            docs = docs.iter().map(|doc| projection.apply(doc)).collect();
        }
        Ok(docs)
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        let mut docs = self.fetch_rows(collection, filter, " LIMIT 1").await?;
        Ok(docs.pop())
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: Document,
    ) -> Result<u64, StoreError> {
        let config = self.config(collection);
        let columns = self.columns(&config);
        let targets = self.fetch_rows(collection, filter, "").await?;

        let mut updated = 0u64;
        for doc in targets {
            let Some(id) = doc.get(ID_FIELD).and_then(Value::as_str).map(String::from)
            else {
                continue;
            };

            let mut merged = doc;
            merge_patch(&mut merged, patch.clone());

            let mut sets = vec!["data = ?".to_string()];
            let mut params =
                vec![SqlParam::Text(Value::Object(merged.clone()).to_string())];
            for (field, field_type) in &columns {
                sets.push(format!("\"{field}\" = ?"));
                params.push(column_param(*field_type, merged.get(field)));
            }
            params.push(SqlParam::Text(id));

            let sql = format!(
                "UPDATE \"{collection}\" SET {} WHERE id = ?",
                sets.join(", ")
            );
            updated += self.execute_retrying(&sql, &params).await?;
        }

        Ok(updated)
    }

    async fn remove(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let config = self.config(collection);
        let compiled = sql::compile_filter(filter, &config)?;
        let sql = format!("DELETE FROM \"{collection}\" WHERE {}", compiled.clause);
        self.execute_retrying(&sql, &compiled.params).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let config = self.config(collection);
        let compiled = sql::compile_filter(filter, &config)?;
        let sql = format!(
            "SELECT COUNT(*) AS n FROM \"{collection}\" WHERE {}",
            compiled.clause
        );

        let mut query = sqlx::query(&sql);
        for param in &compiled.params {
            query = bind_param(query, param);
        }
        let row = query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_table_error(e, collection))?;
        let n: i64 = row.try_get("n").map_err(map_sqlx_error)?;
        Ok(n as u64)
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_param<'q>(query: SqliteQuery<'q>, param: &SqlParam) -> SqliteQuery<'q> {
    match param {
        SqlParam::Text(s) => query.bind(s.clone()),
        SqlParam::Int(i) => query.bind(*i),
        SqlParam::Real(f) => query.bind(*f),
        SqlParam::Null => query.bind(Option::<String>::None),
    }
}

/// Native column type for a promoted field.
fn column_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::String | FieldType::Date => "TEXT",
        FieldType::Number => "REAL",
        FieldType::Boolean => "INTEGER",
        FieldType::Object | FieldType::Array => "TEXT",
    }
}

/// The parameter written into a promoted column alongside the JSON.
fn column_param(field_type: FieldType, value: Option<&Value>) -> SqlParam {
    match value {
        None | Some(Value::Null) => SqlParam::Null,
        Some(Value::Bool(b)) => SqlParam::Int(*b as i64),
        Some(Value::Number(n)) => {
            if field_type == FieldType::Number {
                SqlParam::Real(n.as_f64().unwrap_or(0.0))
            } else {
                SqlParam::Text(n.to_string())
            }
        }
        Some(Value::String(s)) => SqlParam::Text(s.clone()),
        Some(other) => SqlParam::Text(other.to_string()),
    }
}

/// Reconstruct a document: parse the JSON column, then overlay promoted
/// column values so the native columns stay authoritative.
fn row_to_document(
    row: &SqliteRow,
    columns: &[(String, FieldType)],
) -> Result<Document, StoreError> {
    let raw: String = row
        .try_get("data")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let mut doc: Document = serde_json::from_str(&raw)
        .map_err(|e| StoreError::Backend(format!("corrupt document JSON: {e}")))?;

    let id: String = row
        .try_get("id")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    doc.insert(ID_FIELD.to_string(), Value::String(id));

    for (field, field_type) in columns {
        if !row.columns().iter().any(|c| c.name() == field) {
            continue;
        }
        let overlay = match field_type {
            FieldType::Boolean => row
                .try_get::<Option<i64>, _>(field.as_str())
                .ok()
                .flatten()
                .map(|i| Value::Bool(i != 0)),
            FieldType::Number => row
                .try_get::<Option<f64>, _>(field.as_str())
                .ok()
                .flatten()
                .map(json_number),
            _ => row
                .try_get::<Option<String>, _>(field.as_str())
                .ok()
                .flatten()
                .map(Value::String),
        };
        if let Some(value) = overlay {
            doc.insert(field.clone(), value);
        }
    }

    Ok(doc)
}

/// REAL columns lose integer-ness; restore it for whole numbers.
fn json_number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < (i64::MAX as f64) {
        Value::Number(Number::from(f as i64))
    } else {
        Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn is_busy(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            let code = db.code().unwrap_or_default();
            code == "5" || code == "517" || db.message().contains("database is locked")
        }
        _ => false,
    }
}

fn map_sqlx_error(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            StoreError::Unavailable(e.to_string())
        }
        _ => StoreError::Backend(e.to_string()),
    }
}

fn map_table_error(e: sqlx::Error, collection: &str) -> StoreError {
    if e.to_string().contains("no such table") {
        return StoreError::UnknownCollection(collection.to_string());
    }
    map_sqlx_error(e)
}

/// Map a raw execute error into duplicate-id / unique-field conflicts.
///
/// SQLite reports column-backed violations as "UNIQUE constraint failed:
/// table.field" and expression-index violations as "... failed: index
/// 'idx_table_field'".
fn classify_constraint(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        let message = db.message().to_string();
        if message.contains("UNIQUE constraint failed") {
            let field = if let Some(start) = message.find("index 'idx_") {
                let tail = &message[start + "index '".len()..];
                let tail = tail.trim_end_matches('\'');
                tail.splitn(3, '_').nth(2).unwrap_or(tail).to_string()
            } else {
                message
                    .rsplit('.')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string()
            };
            return if field == "id" {
                StoreError::DuplicateId
            } else {
                StoreError::UniqueViolation(field)
            };
        }
    }
    map_sqlx_error(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_engine::FieldSpec;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn todos_config() -> CollectionConfig {
        let mut config = CollectionConfig {
            use_columns: true,
            ..Default::default()
        };
        config
            .properties
            .insert("priority".into(), FieldSpec::of(FieldType::Number).indexed());
        config
            .properties
            .insert("title".into(), FieldSpec::of(FieldType::String));
        config
            .properties
            .insert("slug".into(), FieldSpec::of(FieldType::String).unique());
        config
    }

    async fn store() -> SqliteStore {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        store.sync_collection("todos", &todos_config()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn insert_and_read_back() {
        let store = store().await;
        store
            .insert(
                "todos",
                doc(json!({"id": "1", "title": "a", "priority": 3, "extra": {"k": 1}})),
            )
            .await
            .unwrap();

        let found = store
            .find_one("todos", &Filter::by_id("1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get("title"), Some(&json!("a")));
        assert_eq!(found.get("priority"), Some(&json!(3)));
        assert_eq!(found.get("extra"), Some(&json!({"k": 1})));
    }

    #[tokio::test]
    async fn duplicate_id_is_a_conflict() {
        let store = store().await;
        store
            .insert("todos", doc(json!({"id": "1", "title": "a"})))
            .await
            .unwrap();
        let err = store
            .insert("todos", doc(json!({"id": "1", "title": "b"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId));
    }

    #[tokio::test]
    async fn unique_index_is_enforced() {
        let store = store().await;
        store
            .insert("todos", doc(json!({"id": "1", "slug": "x"})))
            .await
            .unwrap();
        let err = store
            .insert("todos", doc(json!({"id": "2", "slug": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(f) if f == "slug"));
    }

    #[tokio::test]
    async fn filters_hit_both_columns_and_json() {
        let store = store().await;
        for n in 1..=5 {
            store
                .insert(
                    "todos",
                    doc(json!({"id": n.to_string(), "title": format!("t{n}"), "priority": n})),
                )
                .await
                .unwrap();
        }

        // Column-backed comparison with sort and limit
        let filter = Filter::parse(&json!({"priority": {"$gte": 3}})).unwrap();
        let options = FindOptions::parse(&json!({"$sort": {"priority": -1}, "$limit": 2}))
            .unwrap();
        let found = store.find("todos", &filter, &options).await.unwrap();
        let priorities: Vec<_> =
            found.iter().map(|d| d["priority"].as_i64().unwrap()).collect();
        assert_eq!(priorities, vec![5, 4]);

        // JSON-backed predicate
        let filter = Filter::parse(&json!({"title": {"$regex": "^t1"}})).unwrap();
        let found = store
            .find("todos", &filter, &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["id"], json!("1"));
    }

    #[tokio::test]
    async fn update_rewrites_json_and_columns() {
        let store = store().await;
        store
            .insert("todos", doc(json!({"id": "1", "title": "a", "priority": 1})))
            .await
            .unwrap();

        let count = store
            .update("todos", &Filter::by_id("1"), doc(json!({"priority": 9})))
            .await
            .unwrap();
        assert_eq!(count, 1);

        let filter = Filter::parse(&json!({"priority": 9})).unwrap();
        let found = store
            .find("todos", &filter, &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["title"], json!("a"));
    }

    #[tokio::test]
    async fn remove_and_count() {
        let store = store().await;
        for n in 1..=4 {
            store
                .insert("todos", doc(json!({"id": n.to_string(), "priority": n})))
                .await
                .unwrap();
        }
        let filter = Filter::parse(&json!({"priority": {"$lte": 2}})).unwrap();
        assert_eq!(store.count("todos", &filter).await.unwrap(), 2);
        assert_eq!(store.remove("todos", &filter).await.unwrap(), 2);
        assert_eq!(store.count("todos", &Filter::empty()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn additive_schema_evolution() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let mut config = CollectionConfig {
            use_columns: true,
            ..Default::default()
        };
        store.sync_collection("todos", &config).await.unwrap();
        store
            .insert("todos", doc(json!({"id": "1", "priority": 7})))
            .await
            .unwrap();

        // Promote priority after data exists; the column appears, old rows
        // still read correctly through the JSON.
        config
            .properties
            .insert("priority".into(), FieldSpec::of(FieldType::Number).indexed());
        store.sync_collection("todos", &config).await.unwrap();

        let found = store
            .find_one("todos", &Filter::by_id("1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get("priority"), Some(&json!(7)));

        store
            .insert("todos", doc(json!({"id": "2", "priority": 8})))
            .await
            .unwrap();
        let filter = Filter::parse(&json!({"priority": 8})).unwrap();
        assert_eq!(store.count("todos", &filter).await.unwrap(), 1);
    }
}
