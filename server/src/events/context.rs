//! The script context: what a handler sees and what it may do.
//!
//! Both engines exchange the same serialized shapes. The input carries the
//! request snapshot; the output carries the (possibly mutated) document and
//! every side effect the handler requested. Handlers have no other channel
//! to influence the pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Snapshot handed to a script invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptInput {
    /// The document being operated on; mutations propagate
    pub data: Value,
    /// Request query parameters (read-only)
    pub query: Value,
    /// The authenticated user document, or null
    pub me: Option<Value>,
    pub is_root: bool,
    pub method: String,
    /// Collection-relative path
    pub url: String,
    pub parts: Vec<String>,
    pub headers: BTreeMap<String, String>,
    /// Wall-clock budget; native modules must honor it
    pub timeout_ms: u64,
}

/// A `cancel(message, status)` request.
#[derive(Debug, Clone, Deserialize)]
pub struct Cancelled {
    pub message: String,
    #[serde(default = "default_cancel_status")]
    pub status: u16,
}

fn default_cancel_status() -> u16 {
    400
}

/// A realtime event queued by `emit(event, data, room)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmittedEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub room: Option<String>,
}

/// A `log(msg, kv)` line.
#[derive(Debug, Clone, Deserialize)]
pub struct LogLine {
    pub msg: String,
    #[serde(default)]
    pub kv: Option<Value>,
}

/// Side effects accumulated during one invocation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptEffects {
    pub errors: BTreeMap<String, String>,
    pub hidden: Vec<String>,
    pub protected: Vec<String>,
    pub cancelled: Option<Cancelled>,
    pub emitted: Vec<EmittedEvent>,
    pub logs: Vec<LogLine>,
    pub result: Option<Value>,
    pub response_data: Option<Value>,
    pub status_code: Option<u16>,
    pub headers: BTreeMap<String, String>,
}

/// Everything a script invocation produced.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptOutput {
    /// The document after any mutations
    pub data: Value,
    #[serde(default)]
    pub out: ScriptEffects,
    /// Uncaught exception message, if the handler threw
    #[serde(default)]
    pub threw: Option<String>,
}
