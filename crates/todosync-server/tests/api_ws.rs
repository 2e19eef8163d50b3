use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use todosync_db::{create_pool, run_migrations, DbRuntimeSettings};
use todosync_events::delivery_status;
use todosync_server::{app, AppState, SyncCore};
use todosync_types::{DeliveryStatus, SyncPolicy};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (TempDir, SyncCore, SocketAddr) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ws.db");
    let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    {
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();
    }
    let core = SyncCore::new(pool, SyncPolicy::default());
    let app = app(AppState { sync: core.clone() });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (dir, core, addr)
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("failed to send frame");
}

/// Polls until `check` holds, for up to two seconds.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_ws_session_lifecycle() {
    let (_dir, core, addr) = start_server().await;

    // 1. Fresh connect
    let (mut ws, _) = connect_async(format!("ws://{}/ws?user=alice", addr))
        .await
        .expect("failed to connect");
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["resumed"], false);
    let session_id: uuid::Uuid = hello["sessionId"].as_str().unwrap().parse().unwrap();

    // 2. A mutation is pushed live
    core.create_item("alice", "milk", Utc::now()).await.unwrap();
    let event = next_json(&mut ws).await;
    assert_eq!(event["type"], "event");
    assert_eq!(event["eventId"], 1);
    assert_eq!(event["kind"], "lifecycle_change");
    assert_eq!(event["payload"]["item"]["item_id"], "milk");

    // 3. Ack and heartbeat
    send_json(&mut ws, json!({ "type": "ack", "eventId": 1 })).await;
    send_json(&mut ws, json!({ "type": "heartbeat" })).await;
    {
        let core = core.clone();
        eventually(move || {
            let core = core.clone();
            async move {
                let conn = core.pool().get().unwrap();
                delivery_status(&conn, "alice", 1, session_id).unwrap()
                    == Some(DeliveryStatus::Acknowledged)
            }
        })
        .await;
    }

    // 4. Garbage gets an error frame, the socket stays up
    ws.send(Message::Text("not json".into())).await.unwrap();
    let err = next_json(&mut ws).await;
    assert_eq!(err["type"], "error");

    // 5. Disconnect, miss an event, resume
    ws.close(None).await.unwrap();
    drop(ws);
    {
        let core = core.clone();
        eventually(move || {
            let core = core.clone();
            async move { !core.presence().is_live(session_id).await }
        })
        .await;
    }
    core.create_item("alice", "eggs", Utc::now()).await.unwrap();

    let (mut ws, _) = connect_async(format!(
        "ws://{}/ws?user=alice&resume={}",
        addr, session_id
    ))
    .await
    .expect("failed to reconnect");
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["resumed"], true);
    assert_eq!(hello["sessionId"], session_id.to_string());

    let replayed = next_json(&mut ws).await;
    assert_eq!(replayed["type"], "event");
    assert_eq!(replayed["eventId"], 2);
    assert_eq!(replayed["payload"]["item"]["item_id"], "eggs");
}

#[tokio::test]
async fn test_ws_duplicate_session_is_refused() {
    let (_dir, _core, addr) = start_server().await;

    let (mut first, _) = connect_async(format!("ws://{}/ws?user=alice", addr))
        .await
        .unwrap();
    let hello = next_json(&mut first).await;
    let session_id = hello["sessionId"].as_str().unwrap().to_string();

    let (mut second, _) = connect_async(format!(
        "ws://{}/ws?user=alice&resume={}",
        addr, session_id
    ))
    .await
    .unwrap();
    let err = next_json(&mut second).await;
    assert_eq!(err["type"], "error");
    assert!(err["message"].as_str().unwrap().contains("already connected"));

    // The original connection is untouched.
    send_json(&mut first, json!({ "type": "heartbeat" })).await;
}

#[tokio::test]
async fn test_ws_unknown_resume_gets_resync() {
    let (_dir, core, addr) = start_server().await;
    core.create_item("alice", "milk", Utc::now()).await.unwrap();

    let (mut ws, _) = connect_async(format!(
        "ws://{}/ws?user=alice&resume={}",
        addr,
        uuid::Uuid::new_v4()
    ))
    .await
    .unwrap();

    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["resumed"], false);
    let resync = next_json(&mut ws).await;
    assert_eq!(resync, json!({ "type": "resync_required", "head": 1 }));
}

#[tokio::test]
async fn test_ws_rejects_bad_upgrades() {
    let (_dir, _core, addr) = start_server().await;

    assert!(connect_async(format!("ws://{}/ws", addr)).await.is_err());
    assert!(
        connect_async(format!("ws://{}/ws?user=alice&resume=not-a-uuid", addr))
            .await
            .is_err()
    );
}
