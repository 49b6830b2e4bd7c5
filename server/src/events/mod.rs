//! The event host: compiles, caches and invokes per-collection scripts.
//!
//! Each collection owns up to seven handlers, one per lifecycle phase, in
//! either of two flavors: embedded JavaScript (`<phase>.js`) or a native
//! module compiled from `<phase>.rs`. Both see the identical context API.
//! Compiled artifacts are cached per (collection, phase) and invalidated
//! when the source file's mtime changes.

pub mod context;
pub mod js;
pub mod native;

use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use context::{ScriptInput, ScriptOutput};

/// Lifecycle phases a collection can attach a handler to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventPhase {
    Validate,
    BeforeRequest,
    Get,
    Post,
    Put,
    Delete,
    AfterCommit,
}

impl EventPhase {
    /// The script filename stem for this phase.
    pub fn as_str(self) -> &'static str {
        match self {
            EventPhase::Validate => "validate",
            EventPhase::BeforeRequest => "beforerequest",
            EventPhase::Get => "get",
            EventPhase::Post => "post",
            EventPhase::Put => "put",
            EventPhase::Delete => "delete",
            EventPhase::AfterCommit => "aftercommit",
        }
    }

    /// The method-specific phase for an HTTP method.
    pub fn for_method(method: &axum::http::Method) -> Option<EventPhase> {
        use axum::http::Method;
        if *method == Method::GET {
            Some(EventPhase::Get)
        } else if *method == Method::POST {
            Some(EventPhase::Post)
        } else if *method == Method::PUT {
            Some(EventPhase::Put)
        } else if *method == Method::DELETE {
            Some(EventPhase::Delete)
        } else {
            None
        }
    }
}

/// Errors from script compilation or execution.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("script timed out")]
    Timeout,

    #[error("script failed: {0}")]
    Failed(String),

    #[error("script compilation failed: {0}")]
    Compile(String),
}

/// The in-process client handed to scripts for cross-collection calls.
/// Arguments: method, path (`collection` or `collection/id`), query, body.
pub type InternalDispatch =
    Arc<dyn Fn(&str, &str, Value, Value) -> std::result::Result<Value, String> + Send + Sync>;

/// A compiled handler ready to invoke.
#[derive(Debug)]
pub enum Handler {
    Js { source: Arc<String> },
    Native { module: Arc<native::NativeModule> },
}

#[derive(Debug)]
struct CacheEntry {
    mtime: SystemTime,
    handler: Arc<Handler>,
}

/// Compiles, caches and invokes event scripts.
pub struct ScriptHost {
    resources_dir: PathBuf,
    plugin_dir: PathBuf,
    timeout: Duration,
    production: bool,
    cache: DashMap<(String, EventPhase), CacheEntry>,
    // Per-entry build locks: concurrent first uses share one compilation.
    build_locks: DashMap<(String, EventPhase), Arc<Mutex<()>>>,
}

impl ScriptHost {
    pub fn new(
        resources_dir: PathBuf,
        plugin_dir: PathBuf,
        timeout: Duration,
        production: bool,
    ) -> Self {
        ScriptHost {
            resources_dir,
            plugin_dir,
            timeout,
            production,
            cache: DashMap::new(),
            build_locks: DashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve the handler for a collection and phase, compiling or
    /// recompiling as needed. Returns `None` when no script file exists.
    pub async fn resolve(
        &self,
        collection: &str,
        phase: EventPhase,
    ) -> Result<Option<Arc<Handler>>> {
        let dir = self.resources_dir.join(collection);
        let js_path = dir.join(format!("{}.js", phase.as_str()));
        let rs_path = dir.join(format!("{}.rs", phase.as_str()));

        let (path, is_native) = if tokio::fs::try_exists(&js_path).await.unwrap_or(false) {
            (js_path, false)
        } else if tokio::fs::try_exists(&rs_path).await.unwrap_or(false) {
            (rs_path, true)
        } else {
            return Ok(None);
        };

        let mtime = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| AppError::Internal(format!("stat {}: {e}", path.display())))?;

        let key = (collection.to_string(), phase);
        if let Some(entry) = self.cache.get(&key) {
            if entry.mtime == mtime {
                return Ok(Some(Arc::clone(&entry.handler)));
            }
        }

        let lock = self
            .build_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another request may have built this while we waited.
        if let Some(entry) = self.cache.get(&key) {
            if entry.mtime == mtime {
                return Ok(Some(Arc::clone(&entry.handler)));
            }
        }

        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| AppError::Internal(format!("read {}: {e}", path.display())))?;

        let handler = if is_native {
            let hash = source_hash(&source);
            let artifact = self
                .plugin_dir
                .join(native::artifact_name(collection, phase.as_str(), &hash));
            if !tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
                native::compile(&path, &artifact)
                    .await
                    .map_err(|e| AppError::Internal(e.to_string()))?;
            }
            let module = native::NativeModule::load(&artifact)
                .map_err(|e| AppError::Internal(e.to_string()))?;
            Handler::Native {
                module: Arc::new(module),
            }
        } else {
            Handler::Js {
                source: Arc::new(source),
            }
        };

        let handler = Arc::new(handler);
        tracing::debug!(
            collection,
            phase = phase.as_str(),
            native = is_native,
            "event handler compiled"
        );
        self.cache.insert(
            key,
            CacheEntry {
                mtime,
                handler: Arc::clone(&handler),
            },
        );
        Ok(Some(handler))
    }

    /// Invoke a handler on the blocking pool, bounded by the script timeout.
    pub async fn invoke(
        &self,
        collection: &str,
        phase: EventPhase,
        handler: Arc<Handler>,
        input: ScriptInput,
        internal: InternalDispatch,
    ) -> Result<ScriptOutput> {
        let timeout = self.timeout;
        let production = self.production;
        let collection = collection.to_string();

        let task = tokio::task::spawn_blocking(move || match handler.as_ref() {
            Handler::Js { source } => js::run(source, &input, internal, timeout),
            Handler::Native { module } => module.run(&input),
        });

        // Native modules cannot be interrupted; give them the declared
        // budget plus a little slack before abandoning the call.
        let output = tokio::time::timeout(timeout + Duration::from_millis(500), task)
            .await
            .map_err(|_| AppError::ScriptTimeout)?
            .map_err(|e| AppError::Internal(format!("script task: {e}")))?
            .map_err(|e| match e {
                ScriptError::Timeout => AppError::ScriptTimeout,
                ScriptError::Failed(msg) | ScriptError::Compile(msg) => {
                    AppError::Internal(format!("{}/{}: {msg}", collection, phase.as_str()))
                }
            })?;

        if !production {
            for line in &output.out.logs {
                match &line.kv {
                    Some(kv) => tracing::debug!(
                        collection = %collection,
                        phase = phase.as_str(),
                        kv = %kv,
                        "script: {}",
                        line.msg
                    ),
                    None => tracing::debug!(
                        collection = %collection,
                        phase = phase.as_str(),
                        "script: {}",
                        line.msg
                    ),
                }
            }
        }

        Ok(output)
    }
}

fn source_hash(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
