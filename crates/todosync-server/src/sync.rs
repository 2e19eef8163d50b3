//! The synchronization core as one facade.
//!
//! [`SyncCore`] is what transports talk to. Mutations go through the item
//! state machine and the event log in a single SQLite transaction, then the
//! broadcaster fans the new event out. Connects run the reconciler before
//! the session joins the live set, then catch the session up to the head.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::TransactionBehavior;
use serde::Serialize;
use todosync_db::DbPool;
use todosync_events::{
    acknowledge, append, expire, head, open_session, prune_sessions, record_disconnect,
    resume_session, Event, ExpiryReport, SessionRecord,
};
use todosync_items::{Item, LifecycleChange, TransitionRequest};
use todosync_types::{EventId, EventKind, ItemStatus, SessionId, SyncPolicy};
use uuid::Uuid;

use crate::blocking;
use crate::broadcast::Broadcaster;
use crate::connection::{SessionConnection, SessionNotice};
use crate::error::SyncError;
use crate::presence::PresenceTracker;
use crate::reconcile::Reconciler;

/// How a connect was brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Missed events were replayed.
    Replayed { delivered: usize, through: EventId },
    /// The client was told to refetch full state as of `head`.
    ResyncRequired { head: EventId },
}

/// A session that made it into the live set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected {
    pub session_id: SessionId,
    /// `true` when an existing session was picked up again.
    pub resumed: bool,
    pub outcome: ConnectOutcome,
}

/// Everything a client needs for a full-state resync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FullState {
    pub items: Vec<Item>,
    /// Stream position the item list reflects.
    pub head: EventId,
}

/// The real-time synchronization core.
#[derive(Clone)]
pub struct SyncCore {
    pool: DbPool,
    policy: Arc<SyncPolicy>,
    presence: PresenceTracker,
    broadcaster: Broadcaster,
    reconciler: Reconciler,
}

impl SyncCore {
    pub fn new(pool: DbPool, policy: SyncPolicy) -> Self {
        let presence = PresenceTracker::new();
        Self {
            broadcaster: Broadcaster::new(pool.clone(), presence.clone()),
            reconciler: Reconciler::new(pool.clone(), policy.max_replay_events),
            policy: Arc::new(policy),
            presence,
            pool,
        }
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    // ── channel side ────────────────────────────────────────────────────

    /// Brings a connection online.
    ///
    /// With `resume`, the named session is picked up again and reconciled.
    /// Without it, or when `resume` names no session of this user, a new
    /// session is opened at the stream head; the latter case also tells the
    /// client to resync, since its local state has unknown provenance.
    ///
    /// The connection receives, in order: a hello, a resync notice if one
    /// applies, replayed events, then live events.
    ///
    /// # Errors
    ///
    /// - `SyncError::DuplicateSession` if `resume` is already live.
    /// - `SyncError::DeliveryFailure` if the connection refused a frame
    ///   during setup; the session is left offline.
    pub async fn on_connect(
        &self,
        user_id: &str,
        resume: Option<SessionId>,
        connection: Arc<dyn SessionConnection>,
    ) -> Result<Connected, SyncError> {
        if let Some(id) = resume {
            if self.presence.is_live(id).await {
                return Err(SyncError::DuplicateSession(id));
            }
        }

        let user = user_id.to_string();
        let (record, resumed) = blocking(&self.pool, move |conn| {
            let now = Utc::now();
            if let Some(id) = resume {
                if let Some(record) = resume_session(conn, &user, id, now)? {
                    return Ok((record, true));
                }
            }
            Ok((open_session(conn, &user, Uuid::new_v4(), now)?, false))
        })
        .await?;
        let session_id = record.session_id;
        let fresh_for_unknown = resume.is_some() && !resumed;

        let outcome = match self
            .bring_up_to_date(&record, resumed, fresh_for_unknown, connection.as_ref())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                if !self.presence.is_live(session_id).await {
                    self.mark_offline(session_id).await;
                }
                return Err(e);
            }
        };

        let cursor = match outcome {
            ConnectOutcome::Replayed { through, .. } => through,
            ConnectOutcome::ResyncRequired { head } => head,
        };
        // On a lost race with another connect resuming the same id, that
        // connection owns the session and its record.
        let live = self
            .presence
            .register(user_id, session_id, connection.clone(), cursor)
            .await?;
        if let Err(e) = self.broadcaster.catch_up(&live).await {
            if self
                .presence
                .deregister_connection(session_id, &connection)
                .await
                .is_some()
            {
                self.mark_offline(session_id).await;
            }
            return Err(e);
        }

        tracing::info!(user_id, session_id = %session_id, resumed, ?outcome, "session connected");
        Ok(Connected {
            session_id,
            resumed,
            outcome,
        })
    }

    /// Sends the hello, then replays or signals a resync.
    async fn bring_up_to_date(
        &self,
        record: &SessionRecord,
        resumed: bool,
        fresh_for_unknown: bool,
        connection: &dyn SessionConnection,
    ) -> Result<ConnectOutcome, SyncError> {
        let session_id = record.session_id;
        connection.notify(SessionNotice::Hello {
            session_id,
            resumed,
        })?;

        if fresh_for_unknown {
            tracing::info!(
                user_id = %record.user_id,
                session_id = %session_id,
                "resume named an unknown session, issued a fresh one"
            );
            let head = record.last_seen_event_id;
            connection.notify(SessionNotice::ResyncRequired { head })?;
            return Ok(ConnectOutcome::ResyncRequired { head });
        }

        match self.reconciler.reconcile(session_id, connection).await {
            Ok(replay) => Ok(ConnectOutcome::Replayed {
                delivered: replay.delivered,
                through: replay.through,
            }),
            Err(SyncError::ResyncRequired { head }) => {
                connection.notify(SessionNotice::ResyncRequired { head })?;
                Ok(ConnectOutcome::ResyncRequired { head })
            }
            Err(e) => Err(e),
        }
    }

    /// Takes a session offline. Its watermark and pending events are kept.
    ///
    /// `connection` must be the handle passed to [`SyncCore::on_connect`].
    /// If the session was already dropped, or has since been resumed on
    /// another connection, nothing is recorded and `Ok(false)` is returned.
    pub async fn on_disconnect(
        &self,
        session_id: SessionId,
        connection: &Arc<dyn SessionConnection>,
    ) -> Result<bool, SyncError> {
        connection.close();
        if self
            .presence
            .deregister_connection(session_id, connection)
            .await
            .is_none()
        {
            tracing::debug!(session_id = %session_id, "stale disconnect ignored");
            return Ok(false);
        }
        blocking(&self.pool, move |conn| {
            record_disconnect(conn, session_id, Utc::now())?;
            Ok(())
        })
        .await?;
        tracing::info!(session_id = %session_id, "session disconnected");
        Ok(true)
    }

    /// Records liveness. Returns `false` if the session is not live.
    pub async fn on_heartbeat(&self, session_id: SessionId) -> bool {
        self.presence
            .heartbeat(session_id, tokio::time::Instant::now())
            .await
    }

    /// Records that a session applied `event_id`.
    pub async fn on_ack(&self, session_id: SessionId, event_id: EventId) -> Result<bool, SyncError> {
        let changed = blocking(&self.pool, move |conn| Ok(acknowledge(conn, session_id, event_id)?)).await?;
        tracing::debug!(session_id = %session_id, event_id, changed, "acknowledged");
        Ok(changed)
    }

    // ── CRUD side ──────────────────────────────────────────────────────

    /// Creates an item and announces it to the user's devices.
    pub async fn create_item(
        &self,
        user_id: &str,
        item_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Item, SyncError> {
        let user = user_id.to_string();
        let item_id = item_id.to_string();
        let (item, event) = blocking(&self.pool, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let item = todosync_items::create_item(&tx, &user, &item_id, created_at)?;
            let payload = serde_json::to_value(LifecycleChange::created(&item))?;
            let event = append(&tx, &user, EventKind::LifecycleChange, &payload, Utc::now())?;
            tx.commit()?;
            Ok((item, event))
        })
        .await?;

        self.publish_logged(&event).await;
        Ok(item)
    }

    /// Runs a lifecycle transition and announces it.
    ///
    /// # Errors
    ///
    /// Lifecycle rejections come back as `SyncError::Item` wrapping the
    /// state machine's error; the persisted item is unchanged.
    pub async fn submit_transition(
        &self,
        user_id: &str,
        item_id: &str,
        target: ItemStatus,
        expected_version: i64,
        requested_at: DateTime<Utc>,
    ) -> Result<Item, SyncError> {
        let user = user_id.to_string();
        let item_id = item_id.to_string();
        let request = TransitionRequest {
            target,
            expected_version,
            requested_at,
        };
        let (item, event) = blocking(&self.pool, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let transition = todosync_items::apply_transition(&tx, &user, &item_id, &request)?;
            let payload = serde_json::to_value(&transition.change)?;
            let event = append(&tx, &user, EventKind::LifecycleChange, &payload, Utc::now())?;
            tx.commit()?;
            Ok((transition.item, event))
        })
        .await?;

        self.publish_logged(&event).await;
        Ok(item)
    }

    pub async fn get_item(&self, user_id: &str, item_id: &str) -> Result<Item, SyncError> {
        let user = user_id.to_string();
        let item_id = item_id.to_string();
        blocking(&self.pool, move |conn| {
            Ok(todosync_items::get_item(conn, &user, &item_id)?)
        })
        .await
    }

    /// Every item of the user plus the stream head, read in one snapshot.
    pub async fn full_state(&self, user_id: &str) -> Result<FullState, SyncError> {
        let user = user_id.to_string();
        blocking(&self.pool, move |conn| {
            let tx = conn.transaction()?;
            let head = head(&tx, &user)?;
            let items = todosync_items::list_items(&tx, &user)?;
            tx.commit()?;
            Ok(FullState { items, head })
        })
        .await
    }

    /// Appends a notification for the user and announces it.
    pub async fn notify(&self, user_id: &str, content: serde_json::Value) -> Result<Event, SyncError> {
        let user = user_id.to_string();
        let event = blocking(&self.pool, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let payload = serde_json::json!({ "content": content });
            let event = append(&tx, &user, EventKind::Notification, &payload, Utc::now())?;
            tx.commit()?;
            Ok(event)
        })
        .await?;

        self.publish_logged(&event).await;
        Ok(event)
    }

    // ── maintenance ────────────────────────────────────────────────────

    /// Evicts live sessions that stopped heartbeating. Returns how many.
    pub async fn sweep_presence(&self) -> Result<usize, SyncError> {
        let timeout = Duration::from_secs(self.policy.heartbeat_timeout_secs);
        let evicted = self
            .presence
            .evict_expired(tokio::time::Instant::now(), timeout)
            .await;
        let count = evicted.len();
        let mut ids = Vec::with_capacity(count);
        for session in &evicted {
            // Skip ids already resumed on a new connection.
            if !self.presence.is_live(session.session_id).await {
                ids.push(session.session_id);
            }
        }
        if !ids.is_empty() {
            blocking(&self.pool, move |conn| {
                let now = Utc::now();
                for id in ids {
                    record_disconnect(conn, id, now)?;
                }
                Ok(())
            })
            .await?;
        }
        Ok(count)
    }

    /// Applies event retention and forgets long-gone sessions.
    ///
    /// Returns the expiry report and the number of sessions pruned.
    pub async fn run_retention(&self, now: DateTime<Utc>) -> Result<(ExpiryReport, usize), SyncError> {
        let ceiling = seconds_before(now, self.policy.retention_secs);
        let prune_before = seconds_before(now, self.policy.session_retention_secs);

        blocking(&self.pool, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let pruned = prune_sessions(&tx, prune_before)?;
            let report = expire(&tx, ceiling)?;
            tx.commit()?;
            Ok((report, pruned))
        })
        .await
    }

    async fn publish_logged(&self, event: &Event) {
        // The event is durable; sessions that miss it here get it on reconnect.
        if let Err(e) = self.broadcaster.publish(event).await {
            tracing::error!(
                user_id = %event.user_id,
                event_id = event.event_id,
                error = %e,
                "failed to publish event"
            );
        }
    }

    async fn mark_offline(&self, session_id: SessionId) {
        let result = blocking(&self.pool, move |conn| {
            record_disconnect(conn, session_id, Utc::now())?;
            Ok(())
        })
        .await;
        if let Err(e) = result {
            tracing::error!(session_id = %session_id, error = %e, "failed to record disconnect");
        }
    }
}

/// Longest look-back honoured for retention settings (about a century).
const MAX_LOOKBACK_SECS: i64 = 100 * 365 * 24 * 60 * 60;

fn seconds_before(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(MAX_LOOKBACK_SECS);
    now.checked_sub_signed(chrono::Duration::seconds(secs))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
