//! The broker adapter: cross-instance event fan-out.
//!
//! Every event published by the hub also goes to the broker, tagged with
//! the publishing instance's `server_id`; incoming envelopes with our own
//! id are suppressed to prevent loops. The memory implementation serves
//! single-instance deployments and tests; Redis pub/sub serves fleets.

mod memory;
mod redis;

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// An event crossing instance boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Publishing instance, for self-suppression
    pub server_id: String,
    /// Target room; `None` broadcasts
    pub room: Option<String>,
    pub event: String,
    pub data: Value,
    pub timestamp: i64,
}

/// Errors from broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("envelope encoding: {0}")]
    Encoding(String),
}

/// Pluggable pub/sub fan-out.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Human-readable name for diagnostics.
    fn name(&self) -> &'static str;

    /// Publish an envelope to every instance (including this one).
    async fn publish(&self, envelope: Envelope) -> Result<(), BrokerError>;

    /// Subscribe to incoming envelopes.
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;
}
