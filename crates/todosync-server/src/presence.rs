//! Live-session membership, scoped per user.
//!
//! The tracker knows which sessions are connected right now. It is purely
//! in-memory; durable session state (watermarks, resync flags) lives in the
//! event log.
//!
//! Lock ordering: `index` → `users` → a user's session table. Every method
//! that takes more than one lock takes them in that order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use todosync_types::{EventId, SessionId};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::connection::SessionConnection;
use crate::error::SyncError;

/// A registered, connected session.
///
/// Cloning is cheap; clones share the connection and the outbox cursor.
#[derive(Clone)]
pub struct LiveSession {
    pub session_id: SessionId,
    pub user_id: String,
    pub connection: Arc<dyn SessionConnection>,
    /// Highest event id attempted on this connection. Held across a
    /// delivery so frames for one session are produced in id order.
    pub(crate) outbox: Arc<Mutex<EventId>>,
    pub last_heartbeat: Instant,
}

impl std::fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSession")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("last_heartbeat", &self.last_heartbeat)
            .finish_non_exhaustive()
    }
}

impl LiveSession {
    /// The outbox cursor right now.
    pub async fn cursor(&self) -> EventId {
        *self.outbox.lock().await
    }

    /// Whether this entry was registered with `connection`.
    pub fn owned_by(&self, connection: &Arc<dyn SessionConnection>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.connection), Arc::as_ptr(connection))
    }
}

type SessionTable = Arc<RwLock<HashMap<SessionId, LiveSession>>>;

/// Tracks live sessions per user.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    /// user id -> that user's live sessions.
    users: Arc<RwLock<HashMap<String, SessionTable>>>,
    /// session id -> user id, for lookups that arrive with a session id only.
    index: Arc<RwLock<HashMap<SessionId, String>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session to the live set.
    ///
    /// `cursor` seeds the outbox: the highest event id the session has
    /// already been given (by reconciliation) or does not need.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::DuplicateSession` if the id is already live.
    pub async fn register(
        &self,
        user_id: &str,
        session_id: SessionId,
        connection: Arc<dyn SessionConnection>,
        cursor: EventId,
    ) -> Result<LiveSession, SyncError> {
        let mut index = self.index.write().await;
        if index.contains_key(&session_id) {
            return Err(SyncError::DuplicateSession(session_id));
        }

        let table = {
            let mut users = self.users.write().await;
            users.entry(user_id.to_string()).or_default().clone()
        };

        let live = LiveSession {
            session_id,
            user_id: user_id.to_string(),
            connection,
            outbox: Arc::new(Mutex::new(cursor)),
            last_heartbeat: Instant::now(),
        };
        table.write().await.insert(session_id, live.clone());
        index.insert(session_id, user_id.to_string());

        tracing::info!(user_id, session_id = %session_id, "session is live");
        Ok(live)
    }

    /// Removes a session from the live set and returns it.
    ///
    /// The connection is not closed here; callers decide. Returns `None` if
    /// the session was not live.
    pub async fn deregister(&self, session_id: SessionId) -> Option<LiveSession> {
        self.remove_if(session_id, |_| true).await
    }

    /// Removes a session only while `connection` still owns its entry.
    ///
    /// A session id can be resumed on a new connection after the old one
    /// was evicted; the old connection's teardown must leave the new entry
    /// alone.
    pub async fn deregister_connection(
        &self,
        session_id: SessionId,
        connection: &Arc<dyn SessionConnection>,
    ) -> Option<LiveSession> {
        self.remove_if(session_id, |live| live.owned_by(connection))
            .await
    }

    /// Point-in-time snapshot of a user's live sessions.
    pub async fn live_sessions_of(&self, user_id: &str) -> Vec<LiveSession> {
        let table = {
            let users = self.users.read().await;
            match users.get(user_id) {
                Some(table) => table.clone(),
                None => return Vec::new(),
            }
        };
        let sessions = table.read().await;
        sessions.values().cloned().collect()
    }

    /// Looks up one live session.
    pub async fn get(&self, session_id: SessionId) -> Option<LiveSession> {
        let table = self.table_of(session_id).await?;
        let sessions = table.read().await;
        sessions.get(&session_id).cloned()
    }

    pub async fn is_live(&self, session_id: SessionId) -> bool {
        self.index.read().await.contains_key(&session_id)
    }

    /// Number of live sessions across all users.
    pub async fn live_count(&self) -> usize {
        self.index.read().await.len()
    }

    /// Records a heartbeat. Returns `false` if the session is not live.
    pub async fn heartbeat(&self, session_id: SessionId, at: Instant) -> bool {
        let Some(table) = self.table_of(session_id).await else {
            return false;
        };
        let mut sessions = table.write().await;
        match sessions.get_mut(&session_id) {
            Some(live) => {
                if at > live.last_heartbeat {
                    live.last_heartbeat = at;
                }
                true
            }
            None => false,
        }
    }

    /// Evicts every session whose last heartbeat is `timeout` or more
    /// before `now`, closing its connection. Returns the evicted sessions.
    pub async fn evict_expired(&self, now: Instant, timeout: Duration) -> Vec<LiveSession> {
        let is_silent =
            move |live: &LiveSession| now.saturating_duration_since(live.last_heartbeat) >= timeout;

        let candidates: Vec<SessionId> = {
            let tables: Vec<SessionTable> = self.users.read().await.values().cloned().collect();
            let mut ids = Vec::new();
            for table in tables {
                let sessions = table.read().await;
                ids.extend(sessions.values().filter(|s| is_silent(*s)).map(|s| s.session_id));
            }
            ids
        };

        let mut evicted = Vec::new();
        for session_id in candidates {
            // A heartbeat may have landed since the scan.
            if let Some(live) = self.remove_if(session_id, is_silent).await {
                tracing::warn!(
                    user_id = %live.user_id,
                    session_id = %session_id,
                    "evicting session after heartbeat timeout"
                );
                live.connection.close();
                evicted.push(live);
            }
        }
        evicted
    }

    async fn table_of(&self, session_id: SessionId) -> Option<SessionTable> {
        let user_id = self.index.read().await.get(&session_id).cloned()?;
        let users = self.users.read().await;
        users.get(&user_id).cloned()
    }

    async fn remove_if<F>(&self, session_id: SessionId, predicate: F) -> Option<LiveSession>
    where
        F: Fn(&LiveSession) -> bool,
    {
        let mut index = self.index.write().await;
        let user_id = index.get(&session_id)?.clone();

        let mut users = self.users.write().await;
        let table = users.get(&user_id)?.clone();
        let mut sessions = table.write().await;

        if !sessions.get(&session_id).is_some_and(&predicate) {
            return None;
        }
        let removed = sessions.remove(&session_id);
        if sessions.is_empty() {
            users.remove(&user_id);
        }
        index.remove(&session_id);

        if removed.is_some() {
            tracing::info!(user_id = %user_id, session_id = %session_id, "session left live set");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelConnection;
    use uuid::Uuid;

    fn conn() -> Arc<dyn SessionConnection> {
        Arc::new(ChannelConnection::new(8).0)
    }

    #[tokio::test]
    async fn register_and_snapshot_are_scoped_per_user() {
        let presence = PresenceTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        presence.register("alice", a, conn(), 0).await.unwrap();
        presence.register("alice", b, conn(), 0).await.unwrap();
        presence.register("bob", c, conn(), 0).await.unwrap();

        let mut alice: Vec<_> = presence
            .live_sessions_of("alice")
            .await
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        alice.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(alice, expected);
        assert_eq!(presence.live_sessions_of("bob").await.len(), 1);
        assert!(presence.live_sessions_of("carol").await.is_empty());
        assert_eq!(presence.live_count().await, 3);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let presence = PresenceTracker::new();
        let s = Uuid::new_v4();
        presence.register("alice", s, conn(), 0).await.unwrap();
        let err = presence.register("alice", s, conn(), 0).await.unwrap_err();
        assert!(matches!(err, SyncError::DuplicateSession(id) if id == s));
    }

    #[tokio::test]
    async fn deregister_removes_and_is_idempotent() {
        let presence = PresenceTracker::new();
        let s = Uuid::new_v4();
        presence.register("alice", s, conn(), 7).await.unwrap();

        let removed = presence.deregister(s).await.expect("was live");
        assert_eq!(removed.cursor().await, 7);
        assert!(presence.deregister(s).await.is_none());
        assert!(!presence.is_live(s).await);
        assert!(presence.live_sessions_of("alice").await.is_empty());

        // The id can go live again after leaving.
        presence.register("alice", s, conn(), 0).await.unwrap();
    }

    #[tokio::test]
    async fn deregister_connection_only_removes_its_own_entry() {
        let presence = PresenceTracker::new();
        let s = Uuid::new_v4();
        let first = conn();
        presence.register("alice", s, first.clone(), 0).await.unwrap();
        presence.deregister(s).await;

        let second = conn();
        presence.register("alice", s, second.clone(), 0).await.unwrap();
        assert!(presence.deregister_connection(s, &first).await.is_none());
        assert!(presence.is_live(s).await);

        let removed = presence.deregister_connection(s, &second).await.unwrap();
        assert!(removed.owned_by(&second));
        assert!(!presence.is_live(s).await);
    }

    #[tokio::test]
    async fn snapshot_does_not_see_later_changes() {
        let presence = PresenceTracker::new();
        let s = Uuid::new_v4();
        presence.register("alice", s, conn(), 0).await.unwrap();
        let snapshot = presence.live_sessions_of("alice").await;
        presence.deregister(s).await;
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_sessions_are_evicted() {
        let presence = PresenceTracker::new();
        let quiet = Uuid::new_v4();
        let chatty = Uuid::new_v4();
        let (quiet_conn, _rx) = ChannelConnection::new(8);
        presence
            .register("alice", quiet, Arc::new(quiet_conn.clone()), 0)
            .await
            .unwrap();
        presence.register("alice", chatty, conn(), 0).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(presence.heartbeat(chatty, Instant::now()).await);
        tokio::time::advance(Duration::from_secs(20)).await;

        let evicted = presence
            .evict_expired(Instant::now(), Duration::from_secs(45))
            .await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].session_id, quiet);
        assert!(quiet_conn.is_closed());
        assert!(presence.is_live(chatty).await);
        assert!(!presence.is_live(quiet).await);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_session_is_ignored() {
        let presence = PresenceTracker::new();
        assert!(!presence.heartbeat(Uuid::new_v4(), Instant::now()).await);
    }
}
