//! Haven Server - a self-hosted backend-as-a-service.
//!
//! Every configured collection is exposed as an auto-generated REST
//! resource (CRUD + query) backed by a pluggable document store. User
//! event scripts run around every operation, and each mutation fans out as
//! a realtime event to subscribed WebSocket clients, across instances via
//! the broker adapter.

pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod realtime;
pub mod resources;
pub mod routes;
pub mod store;

use axum::Router;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use broker::{Broker, MemoryBroker, RedisBroker};
use events::ScriptHost;
use realtime::Hub;
use resources::Resources;
use store::{MemoryStore, SqliteStore, Store};

pub use config::{Config, ConfigError, SecuritySettings};
pub use error::AppError;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub security: Arc<parking_lot::RwLock<SecuritySettings>>,
    pub store: Arc<dyn Store>,
    pub resources: Arc<Resources>,
    pub scripts: Arc<ScriptHost>,
    pub hub: Arc<Hub>,
    pub started_at: Instant,
}

/// Failures during bootstrap, classified for the process exit code.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

impl BootstrapError {
    /// CLI exit code: 2 config error, 3 storage unavailable, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::Config(_) => 2,
            BootstrapError::Storage(_) => 3,
            BootstrapError::Other(_) => 1,
        }
    }
}

/// Wire every component together.
pub async fn build_state(config: Config) -> Result<AppState, BootstrapError> {
    let security = config.load_security()?;

    let store = open_store(&config).await?;

    let resources = Resources::load(config.resources_dir())
        .await
        .map_err(|e| BootstrapError::Other(e.to_string()))?;
    let resources = Arc::new(resources);

    for name in resources.names() {
        if let Some(collection_config) = resources.get(&name) {
            store
                .sync_collection(&name, &collection_config)
                .await
                .map_err(|e| BootstrapError::Storage(e.to_string()))?;
        }
    }

    let broker: Arc<dyn Broker> = match &config.redis_url {
        Some(url) => {
            let broker = RedisBroker::connect(url)
                .map_err(|e| BootstrapError::Other(e.to_string()))?;
            tracing::info!("redis broker enabled for multi-instance fan-out");
            broker
        }
        None => Arc::new(MemoryBroker::new()),
    };

    let hub = Hub::new(broker);
    tokio::spawn(Arc::clone(&hub).run_broker_loop());

    let scripts = Arc::new(ScriptHost::new(
        config.resources_dir(),
        config.plugin_dir(),
        Duration::from_millis(config.script_timeout_ms),
        config.production,
    ));

    Ok(AppState {
        config: Arc::new(config),
        security: Arc::new(parking_lot::RwLock::new(security)),
        store,
        resources,
        scripts,
        hub,
        started_at: Instant::now(),
    })
}

async fn open_store(config: &Config) -> Result<Arc<dyn Store>, BootstrapError> {
    match config.database_url.as_deref() {
        None | Some("memory:") => {
            tracing::info!("using the in-memory document store");
            Ok(Arc::new(MemoryStore::new()))
        }
        Some(url) if url.starts_with("sqlite") => {
            if !url.contains(":memory:") {
                std::fs::create_dir_all(config.data_dir())
                    .map_err(|e| BootstrapError::Storage(e.to_string()))?;
            }
            let store = SqliteStore::connect(url)
                .await
                .map_err(|e| BootstrapError::Storage(e.to_string()))?;
            tracing::info!(url, "using the hybrid sqlite store");
            Ok(Arc::new(store))
        }
        Some(other) => Err(BootstrapError::Config(ConfigError::InvalidDatabaseUrl(
            other.to_string(),
        ))),
    }
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    routes::create_routes()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
