//! The realtime hub: connection registry, rooms, and fan-out.
//!
//! Connections and room memberships live in two independent maps holding
//! connection ids; a connection's cleanup removes it from both. Outbound
//! delivery goes through a bounded per-connection queue; a full queue
//! closes the connection rather than blocking a request.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::protocol::ServerFrame;
use crate::broker::{Broker, Envelope};

/// Outbound queue depth per connection.
pub const SEND_QUEUE_DEPTH: usize = 64;

/// Sender for frames to one connection.
pub type FrameSender = mpsc::Sender<ServerFrame>;

/// A registered WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    sender: FrameSender,
}

/// Manages connections, rooms and event fan-out.
///
/// Thread-safe and shared across handlers via `Arc`.
pub struct Hub {
    /// Identifies this instance in broker envelopes for self-suppression.
    pub server_id: String,
    connections: DashMap<String, Arc<Connection>>,
    rooms: DashMap<String, HashSet<String>>,
    memberships: DashMap<String, HashSet<String>>,
    broker: Arc<dyn Broker>,
}

impl Hub {
    pub fn new(broker: Arc<dyn Broker>) -> Arc<Hub> {
        Arc::new(Hub {
            server_id: uuid::Uuid::new_v4().simple().to_string(),
            connections: DashMap::new(),
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            broker,
        })
    }

    /// Register a new connection and return its id.
    pub fn register(&self, sender: FrameSender) -> String {
        let conn_id = uuid::Uuid::new_v4().simple().to_string();
        self.connections.insert(
            conn_id.clone(),
            Arc::new(Connection {
                id: conn_id.clone(),
                sender,
            }),
        );
        tracing::info!(conn_id = %conn_id, "websocket connection registered");
        conn_id
    }

    /// Remove a connection from the registry and every room.
    pub fn unregister(&self, conn_id: &str) {
        self.connections.remove(conn_id);
        if let Some((_, rooms)) = self.memberships.remove(conn_id) {
            for room in rooms {
                if let Some(mut members) = self.rooms.get_mut(&room) {
                    members.remove(conn_id);
                    if members.is_empty() {
                        drop(members);
                        self.rooms.remove(&room);
                    }
                }
            }
        }
        tracing::info!(
            conn_id = %conn_id,
            active = self.connections.len(),
            "websocket connection unregistered"
        );
    }

    pub fn join(&self, conn_id: &str, room: &str) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(conn_id.to_string());
        self.memberships
            .entry(conn_id.to_string())
            .or_default()
            .insert(room.to_string());
        tracing::debug!(conn_id = %conn_id, room = %room, "joined room");
    }

    pub fn leave(&self, conn_id: &str, room: &str) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(conn_id);
            if members.is_empty() {
                drop(members);
                self.rooms.remove(room);
            }
        }
        if let Some(mut rooms) = self.memberships.get_mut(conn_id) {
            rooms.remove(room);
        }
    }

    /// Publish an event locally and to the broker.
    ///
    /// Never blocks: local delivery uses bounded queues, broker delivery is
    /// fire-and-forget on its own task.
    pub fn publish(self: &Arc<Self>, room: Option<String>, event: &str, data: Value) {
        let frame = ServerFrame::emit(event, data.clone(), room.clone());
        self.dispatch_local(room.as_deref(), frame);

        let envelope = Envelope {
            server_id: self.server_id.clone(),
            room,
            event: event.to_string(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let broker = Arc::clone(&self.broker);
        tokio::spawn(async move {
            if let Err(e) = broker.publish(envelope).await {
                // Local clients were already served; only fan-out degrades.
                tracing::warn!("broker publish failed, delivering locally only: {e}");
            }
        });
    }

    /// Emit a collection change to its two rooms: the typed
    /// `collection:<name>` room and the wrapped `collections` firehose.
    pub fn publish_collection_event(self: &Arc<Self>, collection: &str, event: &str, doc: Value) {
        self.publish(
            Some(format!("collection:{collection}")),
            event,
            doc.clone(),
        );
        self.publish(
            Some("collections".to_string()),
            event,
            json!({ "collection": collection, "data": doc }),
        );
    }

    /// Deliver a frame to local subscribers only.
    pub fn dispatch_local(&self, room: Option<&str>, frame: ServerFrame) {
        match room {
            Some(room) => {
                let Some(members) = self.rooms.get(room) else {
                    return;
                };
                let targets: Vec<String> = members.iter().cloned().collect();
                drop(members);
                for conn_id in targets {
                    self.deliver(&conn_id, frame.clone());
                }
            }
            None => {
                let targets: Vec<String> =
                    self.connections.iter().map(|e| e.key().clone()).collect();
                for conn_id in targets {
                    self.deliver(&conn_id, frame.clone());
                }
            }
        }
    }

    /// Queue a frame for one connection. Overflow closes the connection.
    fn deliver(&self, conn_id: &str, frame: ServerFrame) {
        let Some(conn) = self.connections.get(conn_id).map(|c| Arc::clone(&c)) else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = conn.sender.try_send(frame) {
            tracing::warn!(conn_id = %conn.id, "send queue overflow, dropping connection");
            self.unregister(conn_id);
        }
    }

    /// Redispatch envelopes arriving from the broker, suppressing our own.
    pub async fn run_broker_loop(self: Arc<Self>) {
        let mut rx = self.broker.subscribe();
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if envelope.server_id == self.server_id {
                        continue;
                    }
                    let frame = ServerFrame::emit(
                        &envelope.event,
                        envelope.data,
                        envelope.room.clone(),
                    );
                    self.dispatch_local(envelope.room.as_deref(), frame);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "broker subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    tracing::info!("broker subscription closed");
                    return;
                }
            }
        }
    }

    /// Number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of members in a room.
    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use serde_json::json;

    fn hub() -> Arc<Hub> {
        Hub::new(Arc::new(MemoryBroker::new()))
    }

    #[tokio::test]
    async fn register_join_and_cleanup() {
        let hub = hub();
        let (tx, _rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let conn = hub.register(tx);

        hub.join(&conn, "collection:todos");
        hub.join(&conn, "collections");
        assert_eq!(hub.room_size("collection:todos"), 1);
        assert_eq!(hub.connection_count(), 1);

        hub.unregister(&conn);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.room_size("collection:todos"), 0);
        assert_eq!(hub.room_size("collections"), 0);
    }

    #[tokio::test]
    async fn room_dispatch_reaches_members_only() {
        let hub = hub();
        let (tx1, mut rx1) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (tx2, mut rx2) = mpsc::channel(SEND_QUEUE_DEPTH);
        let conn1 = hub.register(tx1);
        let _conn2 = hub.register(tx2);
        hub.join(&conn1, "collection:todos");

        hub.dispatch_local(
            Some("collection:todos"),
            ServerFrame::emit("created", json!({"id": "1"}), None),
        );

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone() {
        let hub = hub();
        let (tx1, mut rx1) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (tx2, mut rx2) = mpsc::channel(SEND_QUEUE_DEPTH);
        hub.register(tx1);
        hub.register(tx2);

        hub.dispatch_local(None, ServerFrame::emit("ping", json!(1), None));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn overflow_closes_the_connection() {
        let hub = hub();
        let (tx, _rx) = mpsc::channel(1);
        let conn = hub.register(tx);
        hub.join(&conn, "r");

        hub.dispatch_local(Some("r"), ServerFrame::emit("e", json!(1), None));
        hub.dispatch_local(Some("r"), ServerFrame::emit("e", json!(2), None));
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn collection_events_reach_both_rooms() {
        let hub = hub();
        let (tx, mut rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let conn = hub.register(tx);
        hub.join(&conn, "collection:todos");
        hub.join(&conn, "collections");

        hub.publish_collection_event("todos", "created", json!({"id": "1"}));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let frames = [first, second];
        let typed = frames.iter().any(|f| matches!(
            f,
            ServerFrame::Emit { room: Some(r), data, .. }
                if r == "collection:todos" && data == &json!({"id": "1"})
        ));
        let wrapped = frames.iter().any(|f| matches!(
            f,
            ServerFrame::Emit { room: Some(r), data, .. }
                if r == "collections" && data["collection"] == json!("todos")
        ));
        assert!(typed && wrapped);
    }

    #[tokio::test]
    async fn broker_loop_suppresses_own_server_id() {
        let broker = Arc::new(MemoryBroker::new());
        let hub_a = Hub::new(Arc::clone(&broker) as Arc<dyn Broker>);
        let hub_b = Hub::new(Arc::clone(&broker) as Arc<dyn Broker>);
        tokio::spawn(Arc::clone(&hub_a).run_broker_loop());
        tokio::spawn(Arc::clone(&hub_b).run_broker_loop());

        let (tx_a, mut rx_a) = mpsc::channel(SEND_QUEUE_DEPTH);
        let conn_a = hub_a.register(tx_a);
        hub_a.join(&conn_a, "collection:todos");

        // Published by B: arrives at A via the broker exactly once.
        hub_b.publish(
            Some("collection:todos".into()),
            "created",
            json!({"id": "1"}),
        );

        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(frame, ServerFrame::Emit { event, .. } if event == "created"));

        // And no duplicate from self-redelivery on B's side of A's queue.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(rx_a.try_recv().is_err());
    }
}
