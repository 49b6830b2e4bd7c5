//! The WebSocket endpoint.
//!
//! Lifecycle per connection: upgrade → `connect` frame → optional `auth`
//! frame → `join`/`leave`/`emit` frames, with a server-driven heartbeat.
//! A connection that misses its pong deadline or overflows its send queue
//! is reaped.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::auth::token;
use crate::realtime::{ClientFrame, ServerFrame, SEND_QUEUE_DEPTH};
use crate::AppState;

/// Server ping cadence and the pong grace period.
const PING_INTERVAL: Duration = Duration::from_secs(54);
const PONG_GRACE: Duration = Duration::from_secs(10);

/// Create the WebSocket route.
pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

/// GET /ws - upgrade to a realtime connection.
async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(state, socket))
}

/// Drive one connection: register with the hub, spawn the writer, process
/// inbound frames, clean up on disconnect.
async fn handle_connection(state: AppState, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let (frame_tx, frame_rx) = mpsc::channel::<ServerFrame>(SEND_QUEUE_DEPTH);
    let (pong_tx, pong_rx) = mpsc::channel::<Vec<u8>>(4);

    let conn_id = state.hub.register(frame_tx.clone());
    let _ = frame_tx.try_send(ServerFrame::connect(&conn_id));

    let last_pong = Arc::new(Mutex::new(Instant::now()));
    let send_task = tokio::spawn(write_loop(
        sink,
        frame_rx,
        pong_rx,
        Arc::clone(&last_pong),
        conn_id.clone(),
    ));

    read_loop(&state, stream, &conn_id, &frame_tx, &pong_tx, &last_pong).await;

    state.hub.unregister(&conn_id);
    send_task.abort();
    tracing::info!(
        conn_id = %conn_id,
        active = state.hub.connection_count(),
        "websocket client disconnected"
    );
}

/// Forward queued frames to the socket, interleaved with heartbeat pings.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut frame_rx: mpsc::Receiver<ServerFrame>,
    mut pong_rx: mpsc::Receiver<Vec<u8>>,
    last_pong: Arc<Mutex<Instant>>,
    conn_id: String,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                match serde_json::to_string(&frame) {
                    Ok(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!("frame serialization failed: {e}"),
                }
            }
            data = pong_rx.recv() => {
                let Some(data) = data else { break };
                if sink.send(Message::Pong(data.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if last_pong.lock().elapsed() > PING_INTERVAL + PONG_GRACE {
                    tracing::info!(conn_id = %conn_id, "pong deadline missed, reaping connection");
                    break;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// Process inbound frames until the peer goes away.
async fn read_loop(
    state: &AppState,
    mut stream: SplitStream<WebSocket>,
    conn_id: &str,
    frame_tx: &mpsc::Sender<ServerFrame>,
    pong_tx: &mpsc::Sender<Vec<u8>>,
    last_pong: &Arc<Mutex<Instant>>,
) {
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = frame_tx
                            .try_send(ServerFrame::error(format!("invalid frame: {e}")));
                        continue;
                    }
                };
                handle_frame(state, conn_id, frame_tx, frame);
            }
            Ok(Message::Ping(data)) => {
                let _ = pong_tx.try_send(data.to_vec());
            }
            Ok(Message::Pong(_)) => {
                *last_pong.lock() = Instant::now();
            }
            Ok(Message::Binary(_)) => {
                let _ = frame_tx.try_send(ServerFrame::error("binary frames not supported"));
            }
            Ok(Message::Close(_)) => {
                tracing::debug!(conn_id = %conn_id, "close frame received");
                break;
            }
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, "websocket error: {e}");
                break;
            }
        }
    }
}

fn handle_frame(
    state: &AppState,
    conn_id: &str,
    frame_tx: &mpsc::Sender<ServerFrame>,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::Auth { token: raw } => {
            let secret = state.security.read().jwt_secret.clone();
            match token::verify(&secret, &raw) {
                Ok(claims) => {
                    tracing::debug!(
                        conn_id = %conn_id,
                        username = %claims.username,
                        "websocket connection authenticated"
                    );
                }
                Err(_) => {
                    let _ = frame_tx.try_send(ServerFrame::error("invalid token"));
                }
            }
        }
        ClientFrame::Join { room } => state.hub.join(conn_id, &room),
        ClientFrame::Leave { room } => state.hub.leave(conn_id, &room),
        ClientFrame::Emit { event, data, room } => {
            state.hub.publish(room, &event, data);
        }
    }
}
