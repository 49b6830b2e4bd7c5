//! Backend equivalence: the same query tree must select the same documents
//! whether it is evaluated natively (memory document store) or compiled to
//! SQL against the hybrid column+JSON layout.

use haven_engine::{CollectionConfig, FieldSpec, FieldType, Filter, FindOptions};
use haven_server::store::{MemoryStore, SqliteStore, Store};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

fn doc(value: Value) -> Map<String, Value> {
    value.as_object().unwrap().clone()
}

/// A config promoting `priority` (number) and `due` (date) to columns,
/// leaving `title` and everything else in the JSON.
fn config() -> CollectionConfig {
    let mut config = CollectionConfig {
        use_columns: true,
        ..Default::default()
    };
    config
        .properties
        .insert("priority".into(), FieldSpec::of(FieldType::Number).indexed());
    config
        .properties
        .insert("due".into(), FieldSpec::of(FieldType::Date).indexed());
    config
        .properties
        .insert("title".into(), FieldSpec::of(FieldType::String));
    config
        .properties
        .insert("done".into(), FieldSpec::of(FieldType::Boolean));
    config
}

fn corpus() -> Vec<Map<String, Value>> {
    vec![
        doc(json!({"id": "1", "title": "alpha", "priority": 1, "done": false,
                   "due": "2026-01-01T00:00:00.000Z"})),
        doc(json!({"id": "2", "title": "beta", "priority": 2, "done": true,
                   "due": "2026-03-01T00:00:00.000Z"})),
        doc(json!({"id": "3", "title": "gamma", "priority": 3})),
        doc(json!({"id": "4", "title": "delta", "priority": 4, "done": false,
                   "extra": {"nested": true}})),
        doc(json!({"id": "5", "title": "epsilon", "done": true})),
        doc(json!({"id": "6", "priority": 2.5, "title": "zeta"})),
    ]
}

fn queries() -> Vec<Value> {
    vec![
        json!({}),
        json!({"priority": 2}),
        json!({"priority": {"$gte": 2, "$lt": 4}}),
        json!({"priority": {"$ne": 2}}),
        json!({"priority": {"$exists": true}}),
        json!({"priority": {"$exists": false}}),
        json!({"priority": {"$in": [1, 3]}}),
        json!({"priority": {"$nin": [1, 3]}}),
        json!({"title": "alpha"}),
        json!({"title": {"$regex": "^a"}}),
        json!({"title": {"$regex": "ta$"}}),
        json!({"title": {"$regex": "et"}}),
        json!({"done": true}),
        json!({"done": {"$ne": true}}),
        json!({"due": {"$gt": "2026-02-01T00:00:00.000Z"}}),
        json!({"$or": [{"priority": 1}, {"done": true}]}),
        json!({"$and": [{"priority": {"$gte": 2}}, {"done": false}]}),
        json!({"$or": [{"title": {"$regex": "^a"}}, {"$and": [{"priority": {"$lte": 2}}, {"done": true}]}]}),
        json!({"missing": {"$exists": false}}),
        json!({"missing": null}),
    ]
}

async fn ids(store: &dyn Store, filter: &Filter, options: &FindOptions) -> BTreeSet<String> {
    store
        .find("todos", filter, options)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d["id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn both_backends_select_the_same_documents() {
    let memory = MemoryStore::new();
    let sqlite = SqliteStore::connect("sqlite::memory:").await.unwrap();
    memory.sync_collection("todos", &config()).await.unwrap();
    sqlite.sync_collection("todos", &config()).await.unwrap();

    for d in corpus() {
        memory.insert("todos", d.clone()).await.unwrap();
        sqlite.insert("todos", d).await.unwrap();
    }

    for query in queries() {
        let filter = Filter::parse(&query).unwrap();
        let options = FindOptions::default();
        let from_memory = ids(&memory, &filter, &options).await;
        let from_sqlite = ids(&sqlite, &filter, &options).await;
        assert_eq!(
            from_memory, from_sqlite,
            "backends disagree on query {query}"
        );
    }
}

#[tokio::test]
async fn both_backends_agree_on_counts_and_ordering() {
    let memory = MemoryStore::new();
    let sqlite = SqliteStore::connect("sqlite::memory:").await.unwrap();
    memory.sync_collection("todos", &config()).await.unwrap();
    sqlite.sync_collection("todos", &config()).await.unwrap();

    for d in corpus() {
        memory.insert("todos", d.clone()).await.unwrap();
        sqlite.insert("todos", d).await.unwrap();
    }

    for query in queries() {
        let filter = Filter::parse(&query).unwrap();
        assert_eq!(
            memory.count("todos", &filter).await.unwrap(),
            sqlite.count("todos", &filter).await.unwrap(),
            "counts disagree on query {query}"
        );
    }

    // Column-backed sort with paging behaves identically
    let options =
        FindOptions::parse(&json!({"$sort": {"priority": -1}, "$limit": 3, "$skip": 1}))
            .unwrap();
    let filter = Filter::parse(&json!({"priority": {"$exists": true}})).unwrap();

    let from_memory: Vec<Value> = memory
        .find("todos", &filter, &options)
        .await
        .unwrap()
        .iter()
        .map(|d| d["priority"].clone())
        .collect();
    let from_sqlite: Vec<Value> = sqlite
        .find("todos", &filter, &options)
        .await
        .unwrap()
        .iter()
        .map(|d| d["priority"].clone())
        .collect();
    assert_eq!(from_memory, from_sqlite);
    assert_eq!(from_memory, vec![json!(3), json!(2.5), json!(2)]);
}

#[tokio::test]
async fn updates_and_removes_agree() {
    let memory = MemoryStore::new();
    let sqlite = SqliteStore::connect("sqlite::memory:").await.unwrap();
    memory.sync_collection("todos", &config()).await.unwrap();
    sqlite.sync_collection("todos", &config()).await.unwrap();

    for d in corpus() {
        memory.insert("todos", d.clone()).await.unwrap();
        sqlite.insert("todos", d).await.unwrap();
    }

    let filter = Filter::parse(&json!({"done": true})).unwrap();
    let patch = doc(json!({"archived": true}));
    assert_eq!(
        memory.update("todos", &filter, patch.clone()).await.unwrap(),
        sqlite.update("todos", &filter, patch).await.unwrap(),
    );

    let archived = Filter::parse(&json!({"archived": true})).unwrap();
    assert_eq!(
        ids(&memory, &archived, &FindOptions::default()).await,
        ids(&sqlite, &archived, &FindOptions::default()).await,
    );

    let remove = Filter::parse(&json!({"priority": {"$lte": 2}})).unwrap();
    assert_eq!(
        memory.remove("todos", &remove).await.unwrap(),
        sqlite.remove("todos", &remove).await.unwrap(),
    );
    assert_eq!(
        memory.count("todos", &Filter::empty()).await.unwrap(),
        sqlite.count("todos", &Filter::empty()).await.unwrap(),
    );
}
