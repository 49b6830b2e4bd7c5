//! Collection resource routes: the auto-generated REST surface.
//!
//! URL query parameters double as field predicates; keys prefixed with `$`
//! are reserved for options (`$sort`, `$limit`, `$skip`, `$fields`) and
//! request flags (`$skipEvents`, `$forceMongo`).

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use haven_engine::FindOptions;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::auth::Principal;
use crate::error::Result;
use crate::pipeline::{self, PipelineRequest, PipelineResponse};
use crate::AppState;

/// Create collection routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/{collection}", get(list).post(create))
        .route("/{collection}/count", get(count))
        .route("/{collection}/query", post(query))
        .route(
            "/{collection}/{id}",
            get(get_one).put(update_one).delete(delete_one),
        )
}

/// GET /{collection} - list matching documents.
async fn list(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    principal: Principal,
    headers: HeaderMap,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Response> {
    let mut request = base_request(Method::GET, &collection, principal, &headers);
    apply_url_params(&mut request, &params)?;
    let response = pipeline::execute(&state, request).await?;
    Ok(render(response))
}

/// GET /{collection}/count - `{count: N}`.
async fn count(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    principal: Principal,
    headers: HeaderMap,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Response> {
    let mut request = base_request(Method::GET, &collection, principal, &headers);
    apply_url_params(&mut request, &params)?;
    request.count_only = true;
    request.url = format!("/{collection}/count");
    request.parts.push("count".to_string());
    let response = pipeline::execute(&state, request).await?;
    Ok(render(response))
}

/// POST /{collection} - create a document.
async fn create(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    principal: Principal,
    headers: HeaderMap,
    Query(params): Query<BTreeMap<String, String>>,
    Json(mut body): Json<Value>,
) -> Result<Response> {
    let mut request = base_request(Method::POST, &collection, principal, &headers);
    apply_url_params(&mut request, &params)?;
    request.skip_events |= extract_body_skip_events(&mut body, &request.principal);
    request.body = Some(body);
    let response = pipeline::execute(&state, request).await?;
    Ok(render(response))
}

/// GET /{collection}/{id} - single document.
async fn get_one(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    principal: Principal,
    headers: HeaderMap,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Response> {
    let mut request = base_request(Method::GET, &collection, principal, &headers);
    apply_url_params(&mut request, &params)?;
    with_id(&mut request, &collection, &id);
    let response = pipeline::execute(&state, request).await?;
    Ok(render(response))
}

/// PUT /{collection}/{id} - partial update.
async fn update_one(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    principal: Principal,
    headers: HeaderMap,
    Query(params): Query<BTreeMap<String, String>>,
    Json(mut body): Json<Value>,
) -> Result<Response> {
    let mut request = base_request(Method::PUT, &collection, principal, &headers);
    apply_url_params(&mut request, &params)?;
    with_id(&mut request, &collection, &id);
    request.skip_events |= extract_body_skip_events(&mut body, &request.principal);
    request.body = Some(body);
    let response = pipeline::execute(&state, request).await?;
    Ok(render(response))
}

/// DELETE /{collection}/{id}.
async fn delete_one(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    principal: Principal,
    headers: HeaderMap,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Response> {
    let mut request = base_request(Method::DELETE, &collection, principal, &headers);
    apply_url_params(&mut request, &params)?;
    with_id(&mut request, &collection, &id);
    let response = pipeline::execute(&state, request).await?;
    Ok(render(response))
}

/// POST /{collection}/query - complex queries in the body.
#[derive(Debug, Deserialize)]
struct QueryBody {
    #[serde(default)]
    query: Value,
    #[serde(default)]
    options: Value,
}

async fn query(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    principal: Principal,
    headers: HeaderMap,
    Json(body): Json<QueryBody>,
) -> Result<Response> {
    let mut request = base_request(Method::GET, &collection, principal, &headers);
    request.url = format!("/{collection}/query");
    request.parts.push("query".to_string());

    let mut query = body.query;
    strip_query_flags(&mut query, &mut request);
    request.query = if query.is_null() { json!({}) } else { query };
    request.options = FindOptions::parse(&body.options)?;

    let response = pipeline::execute(&state, request).await?;
    Ok(render(response))
}

fn base_request(
    method: Method,
    collection: &str,
    principal: Principal,
    headers: &HeaderMap,
) -> PipelineRequest {
    let mut request = PipelineRequest::new(method, collection, principal);
    request.headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect();
    request
}

fn with_id(request: &mut PipelineRequest, collection: &str, id: &str) {
    request.id = Some(id.to_string());
    request.url = format!("/{collection}/{id}");
    request.parts.push(id.to_string());
}

/// Split URL parameters into field predicates, options and flags.
/// Values are JSON when they parse as JSON, strings otherwise.
fn apply_url_params(
    request: &mut PipelineRequest,
    params: &BTreeMap<String, String>,
) -> Result<()> {
    let mut filter = Map::new();
    let mut options = Map::new();

    for (key, raw) in params {
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
        match key.as_str() {
            "$sort" | "$limit" | "$skip" | "$fields" => {
                options.insert(key.clone(), value);
            }
            "$skipEvents" => {
                // Root-only; silently ignored otherwise.
                request.skip_events |= truthy(&value) && request.principal.is_root();
            }
            "$forceMongo" => request.force_mongo |= truthy(&value),
            _ => {
                filter.insert(key.clone(), value);
            }
        }
    }

    request.query = Value::Object(filter);
    request.options = FindOptions::parse(&Value::Object(options))?;
    Ok(())
}

/// Remove reserved flags from a query object in a request body.
fn strip_query_flags(query: &mut Value, request: &mut PipelineRequest) {
    let Value::Object(map) = query else {
        return;
    };
    if let Some(flag) = map.remove("$skipEvents") {
        request.skip_events |= truthy(&flag) && request.principal.is_root();
    }
    if let Some(flag) = map.remove("$forceMongo") {
        request.force_mongo |= truthy(&flag);
    }
}

/// Remove `$skipEvents` from a write body; effective only for root.
fn extract_body_skip_events(body: &mut Value, principal: &Principal) -> bool {
    let Value::Object(map) = body else {
        return false;
    };
    match map.remove("$skipEvents") {
        Some(flag) => truthy(&flag) && principal.is_root(),
        None => false,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s == "true" || s == "1",
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

/// Render a pipeline response as HTTP.
fn render(response: PipelineResponse) -> Response {
    let PipelineResponse {
        status,
        body,
        headers,
    } = response;

    let mut http = if status == StatusCode::NO_CONTENT || body.is_null() {
        status.into_response()
    } else {
        (status, Json(body)).into_response()
    };

    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::try_from(name.as_str()),
            axum::http::HeaderValue::try_from(value.as_str()),
        ) {
            http.headers_mut().insert(name, value);
        }
    }
    http
}
