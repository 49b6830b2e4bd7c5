//! Authentication endpoints: login, identity, token validation.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use haven_engine::Filter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::{constant_time_eq, token, Principal};
use crate::error::{AppError, Result};
use crate::resources::USERS_COLLECTION;
use crate::AppState;

/// Create auth routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/me", get(me))
        .route("/auth/validate", get(validate))
}

/// Login request: either a master key or user credentials.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    master_key: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    expires_at: i64,
    is_root: bool,
}

/// POST /auth/login.
async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let (jwt_secret, jwt_expiration, master_key) = {
        let security = state.security.read();
        (
            security.jwt_secret.clone(),
            security.jwt_expiration,
            security.master_key.clone(),
        )
    };

    if let Some(key) = &request.master_key {
        if !constant_time_eq(key, &master_key) {
            return Err(AppError::Unauthenticated);
        }
        let (token, expires_at) = token::issue(&jwt_secret, "root", "root", true, jwt_expiration)?;
        return Ok(Json(LoginResponse {
            token,
            expires_at,
            is_root: true,
        }));
    }

    let (Some(username), Some(password)) =
        (request.username.as_deref(), request.password.as_deref())
    else {
        return Err(AppError::BadRequest(
            "masterKey or username/password required".into(),
        ));
    };

    let filter = Filter::parse(&json!({ "username": username }))
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    let user = state
        .store
        .find_one(USERS_COLLECTION, &filter)
        .await?
        .ok_or(AppError::Unauthenticated)?;

    let hash = user
        .get("password")
        .and_then(Value::as_str)
        .ok_or(AppError::Unauthenticated)?
        .to_string();
    let password = password.to_string();
    let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .unwrap_or(false);
    if !verified {
        return Err(AppError::Unauthenticated);
    }

    let user_id = user
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Internal("user without id".into()))?;
    let username = user
        .get("username")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let (token, expires_at) = token::issue(&jwt_secret, user_id, username, false, jwt_expiration)?;

    Ok(Json(LoginResponse {
        token,
        expires_at,
        is_root: false,
    }))
}

/// GET /auth/me - the current principal.
async fn me(principal: Principal) -> Result<Json<Value>> {
    match &principal {
        Principal::Root => Ok(Json(json!({ "isRoot": true }))),
        Principal::User(_) => Ok(Json(principal.me().unwrap_or(Value::Null))),
        Principal::Anonymous => Err(AppError::Unauthenticated),
    }
}

/// GET /auth/validate - 200 if the presented credential is valid.
async fn validate(principal: Principal) -> Result<Json<Value>> {
    if principal.is_anonymous() {
        return Err(AppError::Unauthenticated);
    }
    Ok(Json(json!({ "valid": true })))
}
