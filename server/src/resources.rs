//! The collection registry.
//!
//! Collections live on disk under `<state>/resources/<name>/`: a
//! `config.json` with the schema plus event scripts named by lifecycle
//! phase. This module loads them at boot, serves lookups to the pipeline,
//! and serializes config writes per collection.

use dashmap::DashMap;
use haven_engine::{CollectionConfig, FieldSpec, FieldType};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::store::validate_collection_name;

/// The reserved collection carrying auth principals.
pub const USERS_COLLECTION: &str = "users";

#[derive(Debug)]
pub struct Resources {
    dir: PathBuf,
    configs: DashMap<String, Arc<CollectionConfig>>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Resources {
    /// Load every collection config under the resources directory, seeding
    /// the reserved `users` collection if it is missing.
    pub async fn load(dir: impl Into<PathBuf>) -> Result<Resources> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::Internal(format!("resources dir: {e}")))?;

        let resources = Resources {
            dir: dir.clone(),
            configs: DashMap::new(),
            write_locks: DashMap::new(),
        };

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| AppError::Internal(format!("resources dir: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
        {
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            let config_path = entry.path().join("config.json");
            match tokio::fs::read_to_string(&config_path).await {
                Ok(raw) => match serde_json::from_str::<CollectionConfig>(&raw) {
                    Ok(config) => {
                        resources.configs.insert(name, Arc::new(config));
                    }
                    Err(e) => {
                        tracing::warn!(collection = %name, "skipping invalid config.json: {e}");
                    }
                },
                Err(_) => {
                    tracing::debug!(collection = %name, "resource directory without config.json");
                }
            }
        }

        if resources.get(USERS_COLLECTION).is_none() {
            resources
                .save(USERS_COLLECTION, users_config())
                .await?;
        }

        tracing::info!(
            collections = resources.configs.len(),
            dir = %dir.display(),
            "collection configs loaded"
        );
        Ok(resources)
    }

    /// Look up a collection config.
    pub fn get(&self, name: &str) -> Option<Arc<CollectionConfig>> {
        self.configs.get(name).map(|entry| entry.clone())
    }

    /// All collection names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Directory holding a collection's config and scripts.
    pub fn collection_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Create or replace a collection config, serialized per collection so
    /// concurrent admin writes cannot tear the file.
    pub async fn save(&self, name: &str, config: CollectionConfig) -> Result<()> {
        validate_collection_name(name).map_err(|_| {
            AppError::BadRequest(format!("invalid collection name '{name}'"))
        })?;

        let lock = self
            .write_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let dir = self.collection_dir(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::Internal(format!("create {}: {e}", dir.display())))?;

        let raw = serde_json::to_string_pretty(&config)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let path = dir.join("config.json");
        tokio::fs::write(&path, raw)
            .await
            .map_err(|e| AppError::Internal(format!("write {}: {e}", path.display())))?;

        self.configs.insert(name.to_string(), Arc::new(config));
        Ok(())
    }

    /// Remove a collection config and its directory.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let lock = self
            .write_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        self.configs.remove(name);
        let dir = self.collection_dir(name);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| AppError::Internal(format!("remove {}: {e}", dir.display())))?;
        }
        Ok(())
    }
}

/// Schema of the reserved `users` collection. The password is hashed by the
/// pipeline and never serialized back out; the role is root-assigned.
pub fn users_config() -> CollectionConfig {
    let mut config = CollectionConfig::default();
    config.properties.insert(
        "username".into(),
        FieldSpec::of(FieldType::String).required().unique().indexed(),
    );
    config
        .properties
        .insert("email".into(), FieldSpec::of(FieldType::String));
    config
        .properties
        .insert("password".into(), FieldSpec::of(FieldType::String).required());
    config
        .properties
        .insert("role".into(), FieldSpec::of(FieldType::String).system());
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_seeds_users_and_round_trips_configs() {
        let tmp = tempfile::tempdir().unwrap();
        let resources = Resources::load(tmp.path()).await.unwrap();
        assert!(resources.get(USERS_COLLECTION).is_some());

        let mut config = CollectionConfig::default();
        config
            .properties
            .insert("title".into(), FieldSpec::of(FieldType::String).required());
        resources.save("todos", config.clone()).await.unwrap();

        // A fresh load sees the persisted config
        let reloaded = Resources::load(tmp.path()).await.unwrap();
        assert_eq!(*reloaded.get("todos").unwrap(), config);
        assert_eq!(reloaded.names(), vec!["todos".to_string(), "users".to_string()]);
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let resources = Resources::load(tmp.path()).await.unwrap();
        let err = resources
            .save("../escape", CollectionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn remove_deletes_the_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let resources = Resources::load(tmp.path()).await.unwrap();
        resources
            .save("todos", CollectionConfig::default())
            .await
            .unwrap();
        assert!(tmp.path().join("todos/config.json").exists());

        resources.remove("todos").await.unwrap();
        assert!(resources.get("todos").is_none());
        assert!(!tmp.path().join("todos").exists());
    }
}
