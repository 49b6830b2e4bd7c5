//! In-memory broker: a process-local broadcast channel.
//!
//! The default for single-instance deployments. Sharing one instance
//! between hubs also models a multi-instance fleet in tests.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Broker, BrokerError, Envelope};

const CHANNEL_DEPTH: usize = 1024;

pub struct MemoryBroker {
    tx: broadcast::Sender<Envelope>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_DEPTH);
        MemoryBroker { tx }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, envelope: Envelope) -> Result<(), BrokerError> {
        // No subscribers is fine; the hub already delivered locally.
        let _ = self.tx.send(envelope);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(server_id: &str) -> Envelope {
        Envelope {
            server_id: server_id.into(),
            room: Some("collection:todos".into()),
            event: "created".into(),
            data: json!({"id": "1"}),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let broker = MemoryBroker::new();
        let mut rx1 = broker.subscribe();
        let mut rx2 = broker.subscribe();

        broker.publish(envelope("a")).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().server_id, "a");
        assert_eq!(rx2.recv().await.unwrap().server_id, "a");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let broker = MemoryBroker::new();
        broker.publish(envelope("a")).await.unwrap();
    }
}
