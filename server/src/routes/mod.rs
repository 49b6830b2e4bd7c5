//! HTTP route definitions.

mod admin;
mod auth;
mod collections;
mod health;
mod ws;

use crate::AppState;
use axum::Router;

/// Create all application routes. Static segments (auth, _admin, ws,
/// health) take precedence over the `/{collection}` tree.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(auth::routes())
        .merge(admin::routes())
        .merge(ws::routes())
        .merge(collections::routes())
}
