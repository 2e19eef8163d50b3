//! Heartbeat eviction and concurrent membership changes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use todosync_db::{create_pool, run_migrations, DbRuntimeSettings};
use todosync_events::get_session;
use todosync_server::{ChannelConnection, PresenceTracker, SessionConnection, SyncCore};
use todosync_types::SyncPolicy;

fn core() -> (TempDir, SyncCore) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("presence.db");
    let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    run_migrations(&pool.get().unwrap()).unwrap();
    (dir, SyncCore::new(pool, SyncPolicy::default()))
}

fn dummy_connection() -> Arc<dyn SessionConnection> {
    Arc::new(ChannelConnection::new(1).0)
}

#[tokio::test(start_paused = true)]
async fn silent_session_is_evicted_and_marked_offline() {
    let (_dir, core) = core();
    let (conn, _rx) = ChannelConnection::new(16);
    let connected = core
        .on_connect("alice", None, Arc::new(conn.clone()))
        .await
        .unwrap();
    let id = connected.session_id;

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(core.sweep_presence().await.unwrap(), 0);
    assert!(core.on_heartbeat(id).await);

    // 44s after the heartbeat: still fine.
    tokio::time::advance(Duration::from_secs(44)).await;
    assert_eq!(core.sweep_presence().await.unwrap(), 0);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(core.sweep_presence().await.unwrap(), 1);

    assert!(conn.is_closed());
    assert!(!core.presence().is_live(id).await);
    assert!(!core.on_heartbeat(id).await);

    let record = get_session(&core.pool().get().unwrap(), id)
        .unwrap()
        .unwrap();
    assert!(record.last_disconnected_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn evicted_session_can_resume_and_replay() {
    let (_dir, core) = core();
    let (conn, _rx) = ChannelConnection::new(16);
    let id = core
        .on_connect("alice", None, Arc::new(conn))
        .await
        .unwrap()
        .session_id;

    tokio::time::advance(Duration::from_secs(60)).await;
    core.sweep_presence().await.unwrap();
    core.create_item("alice", "while-away", Utc::now())
        .await
        .unwrap();

    let (conn, mut rx) = ChannelConnection::new(16);
    let back = core
        .on_connect("alice", Some(id), Arc::new(conn))
        .await
        .unwrap();
    assert!(back.resumed);

    let mut replayed = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let todosync_server::Outbound::Event(e) = frame {
            replayed.push(e.event_id);
        }
    }
    assert_eq!(replayed, vec![1]);
}

#[tokio::test]
async fn concurrent_register_deregister_leaves_no_orphans() {
    let tracker = Arc::new(PresenceTracker::new());
    let mut handles = Vec::new();

    for i in 0..100 {
        let tracker = tracker.clone();
        let user = format!("user_{}", i % 10);
        handles.push(tokio::spawn(async move {
            let id = uuid::Uuid::new_v4();
            tracker
                .register(&user, id, dummy_connection(), 0)
                .await
                .unwrap();
            assert!(tracker.heartbeat(id, tokio::time::Instant::now()).await);
            if i % 2 == 0 {
                tracker.deregister(id).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.expect("task should not panic");
    }

    assert_eq!(tracker.live_count().await, 50);
    let mut total = 0;
    for u in 0..10 {
        total += tracker.live_sessions_of(&format!("user_{u}")).await.len();
    }
    assert_eq!(total, 50);
}

#[tokio::test]
async fn concurrent_duplicate_registration_admits_one() {
    let tracker = Arc::new(PresenceTracker::new());
    let id = uuid::Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            tracker
                .register("alice", id, dummy_connection(), 0)
                .await
                .is_ok()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(tracker.live_count().await, 1);
}
