//! Realtime support: the WebSocket hub, rooms and the frame protocol.
//!
//! Collection changes are published here by the pipeline after commit;
//! custom events come from scripts and connected clients. Cross-instance
//! fan-out rides the broker adapter.

mod hub;
mod protocol;

pub use hub::{Hub, SEND_QUEUE_DEPTH};
pub use protocol::{ClientFrame, ServerFrame};
