//! Authentication: principals and their extraction from requests.
//!
//! Resolution order is `Authorization: Bearer <token>`, then the
//! `X-Master-Key` header, then anonymous. A bad credential fails the
//! request instead of falling through to a weaker principal.

pub mod token;

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use haven_engine::{Document, Filter};
use serde_json::Value;

use crate::error::AppError;
use crate::resources::USERS_COLLECTION;
use crate::AppState;

pub use token::Claims;

/// Header carrying the master key.
pub const MASTER_KEY_HEADER: &str = "x-master-key";

/// The authenticated caller of a request.
#[derive(Debug, Clone, Default)]
pub enum Principal {
    /// Master-key holder; no user record
    Root,
    /// A document from the `users` collection
    User(Document),
    #[default]
    Anonymous,
}

impl Principal {
    pub fn is_root(&self) -> bool {
        matches!(self, Principal::Root)
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Principal::Anonymous)
    }

    /// The `me` value exposed to scripts and `/auth/me`: the user document
    /// without its password hash, or null.
    pub fn me(&self) -> Option<Value> {
        match self {
            Principal::User(doc) => {
                let mut doc = doc.clone();
                doc.remove("password");
                Some(Value::Object(doc))
            }
            Principal::Root | Principal::Anonymous => None,
        }
    }

    /// Require root, otherwise 401/403 depending on whether the caller is
    /// authenticated at all.
    pub fn require_root(&self) -> Result<(), AppError> {
        match self {
            Principal::Root => Ok(()),
            Principal::User(_) => Err(AppError::Forbidden),
            Principal::Anonymous => Err(AppError::Unauthenticated),
        }
    }
}

/// Constant-time string comparison for master-key checks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i % b.len().max(1)).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}

/// Resolve the principal from request headers.
pub async fn resolve(state: &AppState, parts: &axum::http::HeaderMap) -> Result<Principal, AppError> {
    if let Some(header) = parts.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let Some(raw) = header.strip_prefix("Bearer ") else {
            return Err(AppError::Unauthenticated);
        };
        let claims = {
            let security = state.security.read();
            token::verify(&security.jwt_secret, raw)?
        };
        if claims.is_root {
            return Ok(Principal::Root);
        }
        let user = state
            .store
            .find_one(USERS_COLLECTION, &Filter::by_id(&claims.sub))
            .await
            .map_err(AppError::from)?
            .ok_or(AppError::Unauthenticated)?;
        return Ok(Principal::User(user));
    }

    if let Some(key) = parts.get(MASTER_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        let ok = {
            let security = state.security.read();
            constant_time_eq(key, &security.master_key)
        };
        return if ok {
            Ok(Principal::Root)
        } else {
            Err(AppError::Unauthenticated)
        };
    }

    Ok(Principal::Anonymous)
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        resolve(state, &parts.headers).await
    }
}
