//! Admin endpoints: server info, collection management, security settings.
//!
//! Everything here requires the root principal.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use haven_engine::CollectionConfig;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::Principal;
use crate::error::{AppError, Result};
use crate::AppState;

/// Create admin routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/_admin/info", get(info))
        .route("/_admin/collections", get(list_collections))
        .route(
            "/_admin/collections/{name}",
            get(inspect_collection)
                .post(create_collection)
                .delete(delete_collection),
        )
        .route(
            "/_admin/settings/security",
            get(get_security).put(put_security),
        )
}

/// GET /_admin/info - version, uptime, backend status.
async fn info(State(state): State<AppState>, principal: Principal) -> Result<Json<Value>> {
    principal.require_root()?;
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.started_at.elapsed().as_secs(),
        "backend": state.store.backend(),
        "connections": state.hub.connection_count(),
        "serverId": state.hub.server_id,
    })))
}

/// GET /_admin/collections - every collection with its config.
async fn list_collections(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Value>> {
    principal.require_root()?;
    let collections: Vec<Value> = state
        .resources
        .names()
        .into_iter()
        .filter_map(|name| {
            state
                .resources
                .get(&name)
                .map(|config| json!({ "name": name, "config": *config }))
        })
        .collect();
    Ok(Json(Value::Array(collections)))
}

/// POST /_admin/collections/{name} - create or replace a collection.
async fn create_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
    principal: Principal,
    Json(config): Json<CollectionConfig>,
) -> Result<(StatusCode, Json<CollectionConfig>)> {
    principal.require_root()?;

    state.resources.save(&name, config.clone()).await?;
    state
        .store
        .sync_collection(&name, &config)
        .await
        .map_err(AppError::from)?;

    tracing::info!(collection = %name, "collection config saved");
    Ok((StatusCode::CREATED, Json(config)))
}

/// GET /_admin/collections/{name} - inspect one collection.
async fn inspect_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
    principal: Principal,
) -> Result<Json<CollectionConfig>> {
    principal.require_root()?;
    let config = state
        .resources
        .get(&name)
        .ok_or_else(|| AppError::NotFound(format!("collection '{name}'")))?;
    Ok(Json((*config).clone()))
}

/// DELETE /_admin/collections/{name} - drop a collection and its documents.
async fn delete_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
    principal: Principal,
) -> Result<StatusCode> {
    principal.require_root()?;
    if state.resources.get(&name).is_none() {
        return Err(AppError::NotFound(format!("collection '{name}'")));
    }

    state.resources.remove(&name).await?;
    state
        .store
        .drop_collection(&name)
        .await
        .map_err(AppError::from)?;

    tracing::info!(collection = %name, "collection dropped");
    Ok(StatusCode::NO_CONTENT)
}

/// Partial update of the security settings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecurityUpdate {
    master_key: Option<String>,
    jwt_secret: Option<String>,
    jwt_expiration: Option<i64>,
    allow_registration: Option<bool>,
}

/// GET /_admin/settings/security.
async fn get_security(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Value>> {
    principal.require_root()?;
    let security = state.security.read().clone();
    Ok(Json(serde_json::to_value(security).map_err(|e| {
        AppError::Internal(e.to_string())
    })?))
}

/// PUT /_admin/settings/security.
async fn put_security(
    State(state): State<AppState>,
    principal: Principal,
    Json(update): Json<SecurityUpdate>,
) -> Result<Json<Value>> {
    principal.require_root()?;

    let updated = {
        let mut security = state.security.write();
        if let Some(master_key) = update.master_key {
            if master_key.len() < 32 {
                return Err(AppError::BadRequest(
                    "masterKey must be at least 32 characters".into(),
                ));
            }
            security.master_key = master_key;
        }
        if let Some(jwt_secret) = update.jwt_secret {
            security.jwt_secret = jwt_secret;
        }
        if let Some(jwt_expiration) = update.jwt_expiration {
            if jwt_expiration <= 0 {
                return Err(AppError::BadRequest(
                    "jwtExpiration must be positive".into(),
                ));
            }
            security.jwt_expiration = jwt_expiration;
        }
        if let Some(allow_registration) = update.allow_registration {
            security.allow_registration = allow_registration;
        }
        security.clone()
    };

    state
        .config
        .save_security(&updated)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    tracing::info!("security settings updated");
    Ok(Json(serde_json::to_value(updated).map_err(|e| {
        AppError::Internal(e.to_string())
    })?))
}
