//! End-to-end tests for the realtime hub over live WebSocket connections.

use futures::{SinkExt, StreamExt};
use haven_server::broker::{Broker, MemoryBroker};
use haven_server::events::ScriptHost;
use haven_server::realtime::Hub;
use haven_server::resources::Resources;
use haven_server::store::{MemoryStore, Store};
use haven_server::{app, build_state, AppState, Config};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn serve(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_app() -> (String, AppState) {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        host: "127.0.0.1".into(),
        port: 0,
        database_url: None,
        redis_url: None,
        production: false,
        state_dir: tmp.path().to_path_buf(),
        script_timeout_ms: 5_000,
    };
    let state = build_state(config).await.unwrap();
    std::mem::forget(tmp); // keep the state dir for the server's lifetime
    let base = serve(state.clone()).await;
    (base, state)
}

async fn create_todos(base: &str, state: &AppState) {
    let master_key = state.security.read().master_key.clone();
    let response = reqwest::Client::new()
        .post(format!("{base}/_admin/collections/todos"))
        .header("X-Master-Key", master_key)
        .json(&json!({
            "properties": {"title": {"type": "string", "required": true}}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
}

async fn connect_ws(base: &str) -> WsStream {
    let ws_url = format!("{}/ws", base.replace("http://", "ws://"));
    let (stream, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();
    stream
}

/// Read frames until one of type `wanted` arrives or the timeout hits.
async fn expect_frame(ws: &mut WsStream, wanted: &str) -> Value {
    let deadline = Duration::from_secs(5);
    loop {
        let message = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        match message {
            Message::Text(text) => {
                let frame: Value = serde_json::from_str(&text).unwrap();
                if frame["type"] == json!(wanted) {
                    return frame;
                }
            }
            Message::Ping(data) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            _ => {}
        }
    }
}

fn join(room: &str) -> Message {
    Message::Text(json!({"type": "join", "room": room}).to_string().into())
}

#[tokio::test]
async fn connect_frame_carries_a_client_id() {
    let (base, _state) = spawn_app().await;
    let mut ws = connect_ws(&base).await;
    let frame = expect_frame(&mut ws, "connect").await;
    assert!(frame["data"]["client_id"].is_string());
    assert!(frame["data"]["timestamp"].is_i64());
}

#[tokio::test]
async fn commits_fan_out_to_room_subscribers() {
    let (base, state) = spawn_app().await;
    create_todos(&base, &state).await;

    let mut ws = connect_ws(&base).await;
    expect_frame(&mut ws, "connect").await;
    ws.send(join("collection:todos")).await.unwrap();

    // Give the join frame time to land before mutating
    tokio::time::sleep(Duration::from_millis(100)).await;

    let created: Value = reqwest::Client::new()
        .post(format!("{base}/todos"))
        .json(&json!({"title": "x"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let frame = expect_frame(&mut ws, "emit").await;
    assert_eq!(frame["event"], json!("created"));
    assert_eq!(frame["room"], json!("collection:todos"));
    assert_eq!(frame["data"]["id"], created["id"]);
    assert_eq!(frame["data"]["title"], json!("x"));
    assert!(frame["meta"]["timestamp"].is_i64());

    // Exactly one frame for one commit
    tokio::time::sleep(Duration::from_millis(200)).await;
    let extra = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    if let Ok(Some(Ok(Message::Text(text)))) = extra {
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_ne!(frame["event"], json!("created"), "duplicate created frame");
    }
}

#[tokio::test]
async fn failed_requests_emit_nothing() {
    let (base, state) = spawn_app().await;
    create_todos(&base, &state).await;

    let mut ws = connect_ws(&base).await;
    expect_frame(&mut ws, "connect").await;
    ws.send(join("collection:todos")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Validation failure: no document, no event
    let response = reqwest::Client::new()
        .post(format!("{base}/todos"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let extra = tokio::time::timeout(Duration::from_millis(500), ws.next()).await;
    match extra {
        Err(_) => {}
        Ok(Some(Ok(Message::Ping(_)))) => {}
        Ok(other) => panic!("unexpected frame after failed request: {other:?}"),
    }
}

#[tokio::test]
async fn collections_room_wraps_events() {
    let (base, state) = spawn_app().await;
    create_todos(&base, &state).await;

    let mut ws = connect_ws(&base).await;
    expect_frame(&mut ws, "connect").await;
    ws.send(join("collections")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    reqwest::Client::new()
        .post(format!("{base}/todos"))
        .json(&json!({"title": "w"}))
        .send()
        .await
        .unwrap();

    let frame = expect_frame(&mut ws, "emit").await;
    assert_eq!(frame["event"], json!("created"));
    assert_eq!(frame["room"], json!("collections"));
    assert_eq!(frame["data"]["collection"], json!("todos"));
    assert_eq!(frame["data"]["data"]["title"], json!("w"));
}

#[tokio::test]
async fn client_emits_reach_other_clients() {
    let (base, _state) = spawn_app().await;

    let mut a = connect_ws(&base).await;
    let mut b = connect_ws(&base).await;
    expect_frame(&mut a, "connect").await;
    expect_frame(&mut b, "connect").await;
    a.send(join("lobby")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    b.send(Message::Text(
        json!({"type": "emit", "event": "wave", "data": {"from": "b"}, "room": "lobby"})
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let frame = expect_frame(&mut a, "emit").await;
    assert_eq!(frame["event"], json!("wave"));
    assert_eq!(frame["data"]["from"], json!("b"));
}

/// Two instances sharing one broker: a mutation on instance B reaches a
/// client of instance A exactly once, and B does not redeliver to itself.
#[tokio::test]
async fn multi_instance_fan_out_suppresses_self() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

    async fn instance(broker: Arc<dyn Broker>) -> (String, AppState) {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: None,
            redis_url: None,
            production: false,
            state_dir: tmp.path().to_path_buf(),
            script_timeout_ms: 5_000,
        };
        let security = config.load_security().unwrap();
        let store = Arc::new(MemoryStore::new());
        let resources = Arc::new(Resources::load(config.resources_dir()).await.unwrap());
        for name in resources.names() {
            let collection_config = resources.get(&name).unwrap();
            store.sync_collection(&name, &collection_config).await.unwrap();
        }
        let hub = Hub::new(broker);
        tokio::spawn(Arc::clone(&hub).run_broker_loop());
        let scripts = Arc::new(ScriptHost::new(
            config.resources_dir(),
            config.plugin_dir(),
            Duration::from_secs(5),
            false,
        ));
        let state = AppState {
            config: Arc::new(config),
            security: Arc::new(parking_lot::RwLock::new(security)),
            store,
            resources,
            scripts,
            hub,
            started_at: std::time::Instant::now(),
        };
        std::mem::forget(tmp);
        let base = serve(state.clone()).await;
        (base, state)
    }

    let (base_a, _state_a) = instance(Arc::clone(&broker)).await;
    let (base_b, state_b) = instance(broker).await;
    create_todos(&base_b, &state_b).await;

    // Client connected to instance A, mutation processed by instance B
    let mut ws = connect_ws(&base_a).await;
    expect_frame(&mut ws, "connect").await;
    ws.send(join("collection:todos")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    reqwest::Client::new()
        .post(format!("{base_b}/todos"))
        .json(&json!({"title": "cross"}))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let frame = expect_frame(&mut ws, "emit").await;
    assert_eq!(frame["event"], json!("created"));
    assert_eq!(frame["data"]["title"], json!("cross"));

    // Exactly once: no duplicate within the follow-up window
    let extra = tokio::time::timeout(Duration::from_millis(500), ws.next()).await;
    match extra {
        Err(_) => {}
        Ok(Some(Ok(Message::Ping(_)))) => {}
        Ok(Some(Ok(Message::Text(text)))) => {
            let frame: Value = serde_json::from_str(&text).unwrap();
            assert_ne!(frame["event"], json!("created"), "duplicate delivery");
        }
        Ok(other) => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn script_emits_are_delivered_after_commit() {
    let (base, state) = spawn_app().await;
    create_todos(&base, &state).await;

    let dir = state.config.resources_dir().join("todos");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("post.js"),
        r#"function Run(ctx) { ctx.emit('todo-added', {title: ctx.data.title}, 'announcements'); }"#,
    )
    .unwrap();

    let mut ws = connect_ws(&base).await;
    expect_frame(&mut ws, "connect").await;
    ws.send(join("announcements")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    reqwest::Client::new()
        .post(format!("{base}/todos"))
        .json(&json!({"title": "scripted"}))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let frame = expect_frame(&mut ws, "emit").await;
    assert_eq!(frame["event"], json!("todo-added"));
    assert_eq!(frame["data"]["title"], json!("scripted"));
    assert_eq!(frame["room"], json!("announcements"));
}
