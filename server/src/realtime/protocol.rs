//! WebSocket frame definitions.
//!
//! All frames are JSON text messages tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Authenticate the connection with a session token.
    Auth { token: String },

    /// Join a broadcast room.
    Join { room: String },

    /// Leave a broadcast room.
    Leave { room: String },

    /// Emit a custom event to a room (or broadcast when absent).
    Emit {
        event: String,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        room: Option<String>,
    },
}

/// Frames sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// First frame after the upgrade.
    Connect { data: ConnectData },

    /// An event delivery.
    Emit {
        event: String,
        data: Value,
        room: Option<String>,
        meta: FrameMeta,
    },

    /// A protocol-level error; the connection stays open.
    Error { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectData {
    pub client_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameMeta {
    pub timestamp: i64,
}

impl ServerFrame {
    pub fn connect(client_id: &str) -> ServerFrame {
        ServerFrame::Connect {
            data: ConnectData {
                client_id: client_id.to_string(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        }
    }

    pub fn emit(event: &str, data: Value, room: Option<String>) -> ServerFrame {
        ServerFrame::Emit {
            event: event.to_string(),
            data,
            room,
            meta: FrameMeta {
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        }
    }

    pub fn error(message: impl Into<String>) -> ServerFrame {
        ServerFrame::Error {
            error: message.into(),
        }
    }
}
