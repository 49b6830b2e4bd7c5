//! The collection pipeline: the request state machine.
//!
//! ```text
//! PARSE → AUTHZ → BEFORE_REQUEST → LOAD (PUT/DELETE/GET-by-id)
//!       → VALIDATE (POST/PUT) → PHASE_SCRIPT
//!       → STORE (unless noStore) → AFTER_COMMIT → EMIT → RESPOND
//! ```
//!
//! Script cancellation and errors jump straight to RESPOND; validation
//! failures skip STORE and respond 400 with the accumulated field errors.
//! Realtime events are queued during the request and dispatched only once
//! the response is known to be 2xx.

use axum::http::{Method, StatusCode};
use haven_engine::{
    merge_patch, CollectionConfig, Document, Filter, FindOptions, ValidationErrors, WriteOp,
    CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::auth::Principal;
use crate::error::{AppError, Result};
use crate::events::context::{EmittedEvent, ScriptEffects, ScriptInput, ScriptOutput};
use crate::events::{EventPhase, InternalDispatch};
use crate::resources::USERS_COLLECTION;
use crate::AppState;

/// Cross-collection `internal` calls may re-enter the pipeline this deep.
const MAX_INTERNAL_DEPTH: u8 = 8;

/// A parsed request entering the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub method: Method,
    pub collection: String,
    pub id: Option<String>,
    /// Wire filter object, reserved keys already stripped
    pub query: Value,
    pub options: FindOptions,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
    /// Collection-relative path
    pub url: String,
    pub parts: Vec<String>,
    pub principal: Principal,
    pub skip_events: bool,
    pub force_mongo: bool,
    pub count_only: bool,
    pub depth: u8,
}

impl PipelineRequest {
    pub fn new(method: Method, collection: &str, principal: Principal) -> Self {
        PipelineRequest {
            method,
            collection: collection.to_string(),
            id: None,
            query: json!({}),
            options: FindOptions::default(),
            body: None,
            headers: BTreeMap::new(),
            url: format!("/{collection}"),
            parts: vec![collection.to_string()],
            principal,
            skip_events: false,
            force_mongo: false,
            count_only: false,
            depth: 0,
        }
    }
}

/// The pipeline's answer, rendered by the routes.
#[derive(Debug)]
pub struct PipelineResponse {
    pub status: StatusCode,
    pub body: Value,
    pub headers: Vec<(String, String)>,
}

/// Side effects accumulated across script phases of one request.
#[derive(Default)]
struct EffectState {
    hidden: BTreeSet<String>,
    protected: BTreeSet<String>,
    pending_events: Vec<EmittedEvent>,
    status_code: Option<u16>,
    headers: Vec<(String, String)>,
    result: Option<Value>,
    response_data: Option<Value>,
}

impl EffectState {
    /// Fold one invocation's effects in.
    fn absorb(&mut self, out: &ScriptEffects) {
        self.hidden.extend(out.hidden.iter().cloned());
        self.protected.extend(out.protected.iter().cloned());
        self.pending_events.extend(out.emitted.iter().cloned());
        if out.status_code.is_some() {
            self.status_code = out.status_code;
        }
        for (k, v) in &out.headers {
            self.headers.push((k.clone(), v.clone()));
        }
        if out.result.is_some() {
            self.result = out.result.clone();
        }
        if out.response_data.is_some() {
            self.response_data = out.response_data.clone();
        }
    }
}

/// What an operation committed, for AFTER_COMMIT and EMIT.
struct Outcome {
    status: StatusCode,
    body: Value,
    /// The persisted document, for collection-change events
    persisted: Option<Value>,
    /// created / updated / deleted
    event: Option<&'static str>,
}

/// Run a request through the pipeline.
pub async fn execute(state: &AppState, mut req: PipelineRequest) -> Result<PipelineResponse> {
    if req.depth > MAX_INTERNAL_DEPTH {
        return Err(AppError::Internal("internal call depth exceeded".into()));
    }

    let config = state
        .resources
        .get(&req.collection)
        .ok_or_else(|| AppError::NotFound(format!("collection '{}'", req.collection)))?;

    if req.force_mongo && !state.store.native_queries() {
        return Err(AppError::Unsupported(
            "$forceMongo requires the document backend".into(),
        ));
    }

    let mut effects = EffectState::default();
    if req.collection == USERS_COLLECTION {
        // Password hashes never leave the server.
        effects.hidden.insert("password".to_string());
    }

    // BEFORE_REQUEST
    if let Some(output) = run_script(
        state,
        &req,
        EventPhase::BeforeRequest,
        req.body.clone().unwrap_or(Value::Null),
    )
    .await?
    {
        let data = standard_policy(output, &mut effects)?;
        if req.body.is_some() {
            req.body = Some(data);
        }
    }

    if config.no_store {
        return execute_no_store(state, &req, &mut effects).await;
    }

    let mut outcome = if req.method == Method::GET && req.count_only {
        count(state, &req).await?
    } else if req.method == Method::GET && req.id.is_some() {
        get_by_id(state, &req, &mut effects).await?
    } else if req.method == Method::GET {
        list(state, &req, &mut effects).await?
    } else if req.method == Method::POST {
        create(state, &req, &config, &mut effects).await?
    } else if req.method == Method::PUT {
        update(state, &req, &config, &mut effects).await?
    } else if req.method == Method::DELETE {
        delete(state, &req, &mut effects).await?
    } else {
        return Err(AppError::BadRequest("unsupported method".into()));
    };

    // AFTER_COMMIT: failures cannot roll back the commit; they are logged
    // and suppress the realtime events for this request.
    let mut suppress_events = false;
    if outcome.event.is_some() {
        if let Some(persisted) = outcome.persisted.clone() {
            match run_script(state, &req, EventPhase::AfterCommit, persisted).await {
                Ok(Some(output)) => {
                    if let Err(e) = standard_policy(output, &mut effects) {
                        tracing::warn!(
                            collection = %req.collection,
                            "aftercommit failed after commit: {e}"
                        );
                        suppress_events = true;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        collection = %req.collection,
                        "aftercommit failed after commit: {e}"
                    );
                    suppress_events = true;
                }
            }
        }
    }

    // RESPOND: aftercommit may replace the body; hide() applies last.
    if let Some(body) = effects.response_data.take() {
        outcome.body = body;
    }
    strip_hidden(&mut outcome.body, &effects.hidden);

    let status = effects
        .status_code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(outcome.status);

    // EMIT: only after a successful commit, and with the persisted document
    // (not a script-modified response body).
    if status.is_success() && !suppress_events {
        if let (Some(mut doc), Some(event)) = (outcome.persisted, outcome.event) {
            strip_hidden(&mut doc, &effects.hidden);
            state
                .hub
                .publish_collection_event(&req.collection, event, doc);
        }
        for emitted in effects.pending_events.drain(..) {
            state.hub.publish(emitted.room, &emitted.event, emitted.data);
        }
    }

    Ok(PipelineResponse {
        status,
        body: outcome.body,
        headers: effects.headers,
    })
}

/// Store-less collections: the phase script is the whole response.
async fn execute_no_store(
    state: &AppState,
    req: &PipelineRequest,
    effects: &mut EffectState,
) -> Result<PipelineResponse> {
    let phase = EventPhase::for_method(&req.method)
        .ok_or_else(|| AppError::BadRequest("unsupported method".into()))?;

    let mut data = req.body.clone().unwrap_or(Value::Null);
    if let Some(output) = run_script(state, req, phase, data.clone()).await? {
        data = standard_policy(output, effects)?;
    }

    let mut body = effects
        .result
        .take()
        .or_else(|| effects.response_data.take())
        .unwrap_or(data);

    if let Some(output) = run_script(state, req, EventPhase::AfterCommit, body.clone()).await? {
        // Nothing was committed, so aftercommit failures surface normally.
        body = standard_policy(output, effects)?;
        if let Some(replacement) = effects.result.take().or_else(|| effects.response_data.take())
        {
            body = replacement;
        }
    }

    strip_hidden(&mut body, &effects.hidden);
    let status = effects
        .status_code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);

    Ok(PipelineResponse {
        status,
        body,
        headers: std::mem::take(&mut effects.headers),
    })
}

async fn count(state: &AppState, req: &PipelineRequest) -> Result<Outcome> {
    let filter = Filter::parse(&req.query)?;
    let n = state.store.count(&req.collection, &filter).await?;
    Ok(Outcome {
        status: StatusCode::OK,
        body: json!({ "count": n }),
        persisted: None,
        event: None,
    })
}

async fn get_by_id(
    state: &AppState,
    req: &PipelineRequest,
    effects: &mut EffectState,
) -> Result<Outcome> {
    let id = req
        .id
        .as_deref()
        .ok_or_else(|| AppError::BadRequest("missing id".into()))?;
    let doc = state
        .store
        .find_one(&req.collection, &Filter::by_id(id))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{}/{id}", req.collection)))?;

    let mut value = Value::Object(doc);
    if let Some(output) = run_script(state, req, EventPhase::Get, value.clone()).await? {
        value = standard_policy(output, effects)?;
    }

    if let Some(projection) = &req.options.fields {
        if let Value::Object(doc) = &value {
            value = Value::Object(projection.apply(doc));
        }
    }

    Ok(Outcome {
        status: StatusCode::OK,
        body: value,
        persisted: None,
        event: None,
    })
}

async fn list(
    state: &AppState,
    req: &PipelineRequest,
    effects: &mut EffectState,
) -> Result<Outcome> {
    let filter = Filter::parse(&req.query)?;

    // When a get script runs it must see whole documents, so projection is
    // deferred until after the scripts.
    let handler = if req.skip_events {
        None
    } else {
        state
            .scripts
            .resolve(&req.collection, EventPhase::Get)
            .await?
    };

    let mut options = req.options.clone();
    let projection = options.fields.take();
    let docs = state.store.find(&req.collection, &filter, &options).await?;

    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let mut value = Value::Object(doc);
        if let Some(handler) = &handler {
            let output = invoke_handler(state, req, EventPhase::Get, handler, value.clone()).await?;
            // A cancel in a get script drops the document from the result
            // set instead of failing the request.
            if output.out.cancelled.is_some() {
                continue;
            }
            value = standard_policy(output, effects)?;
        }
        if let Some(projection) = &projection {
            if let Value::Object(doc) = &value {
                value = Value::Object(projection.apply(doc));
            }
        }
        out.push(value);
    }

    Ok(Outcome {
        status: StatusCode::OK,
        body: Value::Array(out),
        persisted: None,
        event: None,
    })
}

async fn create(
    state: &AppState,
    req: &PipelineRequest,
    config: &CollectionConfig,
    effects: &mut EffectState,
) -> Result<Outcome> {
    let is_root = req.principal.is_root();
    let mut doc = body_object(req)?;

    if req.collection == USERS_COLLECTION && !is_root {
        let allowed = state.security.read().allow_registration;
        if !allowed {
            return Err(AppError::Forbidden);
        }
    }

    // A client-supplied id is honored only for root.
    if !is_root {
        doc.remove(ID_FIELD);
    }

    let now = now_iso();
    let (normalized, errors) = config.normalize(WriteOp::Create, doc, is_root, &now);
    let mut doc = normalized;

    if !req.skip_events {
        let mut errors = errors;
        if let Some(output) =
            run_script(state, req, EventPhase::Validate, Value::Object(doc.clone())).await?
        {
            doc = validate_policy(output, &mut errors, effects)?;
        }
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        if let Some(output) =
            run_script(state, req, EventPhase::Post, Value::Object(doc.clone())).await?
        {
            doc = object_data(standard_policy(output, effects)?);
        }
    }

    for field in &effects.protected {
        doc.remove(field);
    }

    let id = match doc.get(ID_FIELD) {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(_) => return Err(AppError::BadRequest("id must be a string".into())),
        None => state.store.create_unique_identifier(),
    };
    doc.insert(ID_FIELD.to_string(), Value::String(id));
    doc.insert(CREATED_AT_FIELD.to_string(), Value::String(now.clone()));
    doc.insert(UPDATED_AT_FIELD.to_string(), Value::String(now));

    if req.collection == USERS_COLLECTION {
        hash_password(&mut doc).await?;
    }

    let stored = state.store.insert(&req.collection, doc).await?;
    let persisted = Value::Object(stored);

    Ok(Outcome {
        status: StatusCode::CREATED,
        body: persisted.clone(),
        persisted: Some(persisted),
        event: Some("created"),
    })
}

async fn update(
    state: &AppState,
    req: &PipelineRequest,
    config: &CollectionConfig,
    effects: &mut EffectState,
) -> Result<Outcome> {
    let id = req
        .id
        .as_deref()
        .ok_or_else(|| AppError::BadRequest("update requires an id".into()))?;
    let is_root = req.principal.is_root();

    // LOAD; a missing id is a 404, never an upsert.
    let existing = state
        .store
        .find_one(&req.collection, &Filter::by_id(id))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{}/{id}", req.collection)))?;

    let patch = body_object(req)?;
    let now = now_iso();
    let (patch, errors) = config.normalize(WriteOp::Update, patch, is_root, &now);

    // Scripts see the merged document, the shape that will be persisted.
    let mut merged = existing.clone();
    merge_patch(&mut merged, patch);

    if !req.skip_events {
        let mut errors = errors;
        if let Some(output) = run_script(
            state,
            req,
            EventPhase::Validate,
            Value::Object(merged.clone()),
        )
        .await?
        {
            merged = validate_policy(output, &mut errors, effects)?;
        }
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        if let Some(output) =
            run_script(state, req, EventPhase::Put, Value::Object(merged.clone())).await?
        {
            merged = object_data(standard_policy(output, effects)?);
        }
    }

    // The store's shallow merge is the single merge authority. Reduce the
    // script-mutated preview back to a sparse patch against the loaded
    // document, so removed fields travel as explicit nulls.
    let mut patch = diff_patch(&existing, &merged);

    // protect() drops this request's value; the stored one survives.
    for field in &effects.protected {
        patch.remove(field);
    }

    patch.remove(ID_FIELD);
    patch.remove(CREATED_AT_FIELD);
    let updated_at = bump_updated_at(&existing, &now);
    patch.insert(UPDATED_AT_FIELD.to_string(), Value::String(updated_at));

    if req.collection == USERS_COLLECTION {
        hash_password(&mut patch).await?;
    }

    let count = state
        .store
        .update(&req.collection, &Filter::by_id(id), patch.clone())
        .await?;
    if count == 0 {
        return Err(AppError::NotFound(format!("{}/{id}", req.collection)));
    }

    // The response reflects storage: the same patch applied the same way.
    let mut committed = existing;
    merge_patch(&mut committed, patch);

    let persisted = Value::Object(committed);
    Ok(Outcome {
        status: StatusCode::OK,
        body: persisted.clone(),
        persisted: Some(persisted),
        event: Some("updated"),
    })
}

/// Reduce an updated document to a sparse patch against its base: changed
/// and added fields carry their new value, fields no longer present carry
/// an explicit `null` so the store's merge removes them.
fn diff_patch(base: &Document, updated: &Document) -> Document {
    let mut patch = Document::new();
    for (key, value) in updated {
        if base.get(key) != Some(value) {
            patch.insert(key.clone(), value.clone());
        }
    }
    for key in base.keys() {
        if !updated.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    patch
}

async fn delete(
    state: &AppState,
    req: &PipelineRequest,
    effects: &mut EffectState,
) -> Result<Outcome> {
    let id = req
        .id
        .as_deref()
        .ok_or_else(|| AppError::BadRequest("delete requires an id".into()))?;

    let existing = state
        .store
        .find_one(&req.collection, &Filter::by_id(id))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{}/{id}", req.collection)))?;

    if !req.skip_events {
        if let Some(output) = run_script(
            state,
            req,
            EventPhase::Delete,
            Value::Object(existing.clone()),
        )
        .await?
        {
            standard_policy(output, effects)?;
        }
    }

    state
        .store
        .remove(&req.collection, &Filter::by_id(id))
        .await?;

    Ok(Outcome {
        status: StatusCode::NO_CONTENT,
        body: Value::Null,
        persisted: Some(Value::Object(existing)),
        event: Some("deleted"),
    })
}

/// Resolve and run a phase script, if any.
async fn run_script(
    state: &AppState,
    req: &PipelineRequest,
    phase: EventPhase,
    data: Value,
) -> Result<Option<ScriptOutput>> {
    if req.skip_events {
        return Ok(None);
    }
    let Some(handler) = state.scripts.resolve(&req.collection, phase).await? else {
        return Ok(None);
    };
    invoke_handler(state, req, phase, &handler, data)
        .await
        .map(Some)
}

async fn invoke_handler(
    state: &AppState,
    req: &PipelineRequest,
    phase: EventPhase,
    handler: &Arc<crate::events::Handler>,
    data: Value,
) -> Result<ScriptOutput> {
    let input = ScriptInput {
        data,
        query: req.query.clone(),
        me: req.principal.me(),
        is_root: req.principal.is_root(),
        method: req.method.to_string(),
        url: req.url.clone(),
        parts: req.parts.clone(),
        headers: req.headers.clone(),
        timeout_ms: state.scripts.timeout().as_millis() as u64,
    };
    let internal = internal_client(state, req);
    state
        .scripts
        .invoke(&req.collection, phase, Arc::clone(handler), input, internal)
        .await
}

/// The default interpretation of a script run: cancel and uncaught
/// exceptions abort, accumulated `error()` calls become a 400, everything
/// else folds into the effect state and yields the mutated data.
fn standard_policy(output: ScriptOutput, effects: &mut EffectState) -> Result<Value> {
    if let Some(cancelled) = output.out.cancelled {
        return Err(AppError::Cancelled {
            message: cancelled.message,
            status: cancelled.status,
        });
    }
    if let Some(message) = output.threw {
        if !output.out.errors.is_empty() {
            let mut errors = ValidationErrors::default();
            for (field, msg) in output.out.errors {
                errors.add(field, msg);
            }
            return Err(AppError::Validation(errors));
        }
        return Err(AppError::Internal(format!("script error: {message}")));
    }
    if !output.out.errors.is_empty() {
        let mut errors = ValidationErrors::default();
        for (field, msg) in &output.out.errors {
            errors.add(field.clone(), msg.clone());
        }
        return Err(AppError::Validation(errors));
    }
    effects.absorb(&output.out);
    Ok(output.data)
}

/// The validate phase merges its field errors with the schema's instead of
/// failing on its own.
fn validate_policy(
    output: ScriptOutput,
    errors: &mut ValidationErrors,
    effects: &mut EffectState,
) -> Result<Document> {
    if let Some(cancelled) = output.out.cancelled {
        return Err(AppError::Cancelled {
            message: cancelled.message,
            status: cancelled.status,
        });
    }
    if let Some(message) = output.threw {
        if output.out.errors.is_empty() {
            return Err(AppError::Internal(format!("script error: {message}")));
        }
    }
    for (field, message) in &output.out.errors {
        errors.add(field.clone(), message.clone());
    }
    effects.absorb(&output.out);
    Ok(object_data(output.data))
}

/// Build the in-process client for cross-collection calls. Runs on the
/// script's blocking thread and re-enters the pipeline through the runtime.
fn internal_client(state: &AppState, req: &PipelineRequest) -> InternalDispatch {
    let state = state.clone();
    let principal = req.principal.clone();
    let depth = req.depth + 1;
    let handle = tokio::runtime::Handle::current();

    Arc::new(move |method: &str, path: &str, query: Value, body: Value| {
        let method = match method {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            other => return Err(format!("unsupported method '{other}'")),
        };

        let mut segments = path.trim_matches('/').splitn(2, '/');
        let collection = segments.next().unwrap_or_default().to_string();
        if collection.is_empty() {
            return Err("missing collection".into());
        }
        let id = segments.next().map(String::from);

        let mut request = PipelineRequest::new(method, &collection, principal.clone());
        request.id = id.clone();
        request.depth = depth;
        request.query = if query.is_null() { json!({}) } else { query };
        request.body = if body.is_null() { None } else { Some(body) };
        if let Some(id) = &id {
            request.url = format!("/{collection}/{id}");
            request.parts.push(id.clone());
        }

        let state = state.clone();
        handle
            .block_on(async move { execute(&state, request).await })
            .map(|response| response.body)
            .map_err(|e| e.to_string())
    })
}

/// Remove hidden fields from a response body (object or array of objects).
fn strip_hidden(body: &mut Value, hidden: &BTreeSet<String>) {
    if hidden.is_empty() {
        return;
    }
    match body {
        Value::Object(map) => {
            for field in hidden {
                map.remove(field);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_hidden(item, hidden);
            }
        }
        _ => {}
    }
}

fn body_object(req: &PipelineRequest) -> Result<Document> {
    match &req.body {
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(AppError::BadRequest("body must be a JSON object".into())),
        None => Err(AppError::BadRequest("missing request body".into())),
    }
}

fn object_data(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// `updatedAt` must strictly increase, even within one millisecond.
fn bump_updated_at(existing: &Document, now: &str) -> String {
    let Some(previous) = existing.get(UPDATED_AT_FIELD).and_then(Value::as_str) else {
        return now.to_string();
    };
    if now > previous {
        return now.to_string();
    }
    chrono::DateTime::parse_from_rfc3339(previous)
        .map(|dt| {
            (dt.with_timezone(&chrono::Utc) + chrono::Duration::milliseconds(1))
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        })
        .unwrap_or_else(|_| now.to_string())
}

/// Hash the `password` field in place, off the async workers.
async fn hash_password(doc: &mut Document) -> Result<()> {
    let Some(Value::String(password)) = doc.get("password") else {
        return Ok(());
    };
    // Already hashed values pass through (internal writes, $skipEvents).
    if password.starts_with("$2") {
        return Ok(());
    }
    let plain = password.clone();
    let hashed = tokio::task::spawn_blocking(move || bcrypt::hash(plain, bcrypt::DEFAULT_COST))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .map_err(|e| AppError::Internal(format!("password hashing: {e}")))?;
    doc.insert("password".to_string(), Value::String(hashed));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_hidden_handles_objects_and_arrays() {
        let hidden: BTreeSet<String> = ["secret".to_string()].into();
        let mut body = json!({"a": 1, "secret": 2});
        strip_hidden(&mut body, &hidden);
        assert_eq!(body, json!({"a": 1}));

        let mut body = json!([{"secret": 1}, {"b": 2}]);
        strip_hidden(&mut body, &hidden);
        assert_eq!(body, json!([{}, {"b": 2}]));
    }

    #[test]
    fn diff_patch_reduces_to_sparse_changes() {
        let base = json!({"id": "1", "title": "a", "priority": 5, "done": false})
            .as_object()
            .unwrap()
            .clone();
        let updated = json!({"id": "1", "title": "a", "done": true, "tag": "x"})
            .as_object()
            .unwrap()
            .clone();

        let patch = diff_patch(&base, &updated);
        assert_eq!(patch.get("done"), Some(&json!(true)));
        assert_eq!(patch.get("tag"), Some(&json!("x")));
        // Removed fields travel as explicit nulls for the store's merge
        assert_eq!(patch.get("priority"), Some(&json!(null)));
        // Unchanged fields stay out of the patch
        assert!(!patch.contains_key("title"));
        assert!(!patch.contains_key("id"));
    }

    #[test]
    fn bump_updated_at_is_strictly_increasing() {
        let mut doc = Document::new();
        doc.insert(
            UPDATED_AT_FIELD.to_string(),
            json!("2026-01-01T00:00:00.500Z"),
        );

        // A later clock wins
        let later = bump_updated_at(&doc, "2026-01-01T00:00:01.000Z");
        assert_eq!(later, "2026-01-01T00:00:01.000Z");

        // Same instant gets nudged forward
        let nudged = bump_updated_at(&doc, "2026-01-01T00:00:00.500Z");
        assert_eq!(nudged, "2026-01-01T00:00:00.501Z");

        let missing = bump_updated_at(&Document::new(), "2026-01-01T00:00:00.000Z");
        assert_eq!(missing, "2026-01-01T00:00:00.000Z");
    }

    #[tokio::test]
    async fn hash_password_hashes_once() {
        let mut doc = Document::new();
        doc.insert("password".to_string(), json!("hunter2"));
        hash_password(&mut doc).await.unwrap();

        let hashed = doc["password"].as_str().unwrap().to_string();
        assert!(hashed.starts_with("$2"));
        assert!(bcrypt::verify("hunter2", &hashed).unwrap());

        // Re-hashing a hash is a no-op
        hash_password(&mut doc).await.unwrap();
        assert_eq!(doc["password"].as_str().unwrap(), hashed);
    }
}
