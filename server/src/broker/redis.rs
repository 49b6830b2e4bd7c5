//! Redis pub/sub broker for multi-instance deployments.
//!
//! Outbound envelopes go through a connection manager that reconnects on
//! its own; the subscription task reconnects with capped exponential
//! backoff. A broker outage degrades to memory-only delivery: the hub has
//! already served local clients before publish is attempted.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

use super::{Broker, BrokerError, Envelope};

/// Pub/sub channel carrying envelopes.
const CHANNEL: &str = "haven:events";

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

pub struct RedisBroker {
    client: redis::Client,
    publisher: Mutex<Option<ConnectionManager>>,
    local: broadcast::Sender<Envelope>,
}

impl RedisBroker {
    /// Create a broker and start its subscription task.
    pub fn connect(url: &str) -> Result<Arc<RedisBroker>, BrokerError> {
        let client =
            redis::Client::open(url).map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        let (local, _) = broadcast::channel(1024);

        let broker = Arc::new(RedisBroker {
            client,
            publisher: Mutex::new(None),
            local,
        });

        tokio::spawn(Arc::clone(&broker).run_subscriber());
        Ok(broker)
    }

    /// Subscription loop: consume the channel, redistribute locally, and
    /// reconnect with capped exponential backoff on failure.
    async fn run_subscriber(self: Arc<Self>) {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            match self.client.get_async_pubsub().await {
                Ok(mut pubsub) => {
                    if let Err(e) = pubsub.subscribe(CHANNEL).await {
                        tracing::warn!("redis subscribe failed: {e}");
                    } else {
                        tracing::info!(channel = CHANNEL, "redis broker subscribed");
                        backoff = BACKOFF_INITIAL;
                        let mut stream = pubsub.on_message();
                        while let Some(message) = stream.next().await {
                            let Ok(payload) = message.get_payload::<String>() else {
                                continue;
                            };
                            match serde_json::from_str::<Envelope>(&payload) {
                                Ok(envelope) => {
                                    let _ = self.local.send(envelope);
                                }
                                Err(e) => {
                                    tracing::warn!("discarding malformed envelope: {e}")
                                }
                            }
                        }
                        tracing::warn!("redis subscription ended, reconnecting");
                    }
                }
                Err(e) => {
                    tracing::warn!("redis connection failed: {e}");
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    async fn publisher(&self) -> Result<ConnectionManager, BrokerError> {
        let mut guard = self.publisher.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }
        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        *guard = Some(manager.clone());
        Ok(manager)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, envelope: Envelope) -> Result<(), BrokerError> {
        let payload =
            serde_json::to_string(&envelope).map_err(|e| BrokerError::Encoding(e.to_string()))?;
        let mut manager = self.publisher().await?;
        manager
            .publish::<_, _, ()>(CHANNEL, payload)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.local.subscribe()
    }
}
