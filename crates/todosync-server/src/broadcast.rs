//! Fan-out of new events to live sessions.
//!
//! Each live session has an outbox cursor: the highest event id attempted
//! on its connection. Delivery holds the cursor's mutex, skips ids at or
//! below it, and fills any gap from the log first, so a session never sees
//! event N+1 before N has been attempted. Publishing does not retry: a
//! connection that refuses a frame is dropped, and reconciliation picks up
//! whatever it missed on the next connect.

use chrono::Utc;
use todosync_db::DbPool;
use todosync_events::{events_since, head, mark_delivered, record_disconnect, Event};
use todosync_types::EventId;

use crate::blocking;
use crate::connection::DeliveryFailure;
use crate::error::SyncError;
use crate::presence::{LiveSession, PresenceTracker};

/// What one [`Broadcaster::publish`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Sessions that received at least one frame.
    pub delivered: usize,
    /// Sessions dropped because their connection refused a frame.
    pub dropped: usize,
}

/// Delivers events to a user's live sessions.
#[derive(Clone)]
pub struct Broadcaster {
    pool: DbPool,
    presence: PresenceTracker,
}

impl Broadcaster {
    pub fn new(pool: DbPool, presence: PresenceTracker) -> Self {
        Self { pool, presence }
    }

    /// Delivers `event` to every live session of its user.
    ///
    /// Sessions that are not live keep their `pending` delivery row and get
    /// the event from the reconciler later.
    ///
    /// # Errors
    ///
    /// Only storage failures are returned. Delivery failures are absorbed:
    /// the affected session is deregistered and its connection closed.
    pub async fn publish(&self, event: &Event) -> Result<PublishReport, SyncError> {
        let sessions = self.presence.live_sessions_of(&event.user_id).await;
        let mut report = PublishReport::default();

        for session in sessions {
            match self.drain(&session, event.event_id, Some(event)).await? {
                Drained::Sent(0) => {}
                Drained::Sent(_) => report.delivered += 1,
                Drained::Dropped => report.dropped += 1,
            }
        }

        tracing::debug!(
            user_id = %event.user_id,
            event_id = event.event_id,
            delivered = report.delivered,
            dropped = report.dropped,
            "published event"
        );
        Ok(report)
    }

    /// Brings a freshly registered session up to the current head.
    ///
    /// Closes the window between reconciliation (which read the log) and
    /// registration (after which `publish` sees the session). A refused
    /// frame drops the session and comes back as `DeliveryFailure`.
    pub async fn catch_up(&self, session: &LiveSession) -> Result<usize, SyncError> {
        let user_id = session.user_id.clone();
        let upto = blocking(&self.pool, move |conn| Ok(head(conn, &user_id)?)).await?;
        match self.drain(session, upto, None).await? {
            Drained::Sent(n) => Ok(n),
            Drained::Dropped => Err(DeliveryFailure::new("connection refused catch-up").into()),
        }
    }

    /// Sends everything in `(cursor, upto]` to one session.
    ///
    /// `latest` is the event with id `upto` when the caller already has it,
    /// which spares a log read in the common no-gap case.
    async fn drain(
        &self,
        session: &LiveSession,
        upto: EventId,
        latest: Option<&Event>,
    ) -> Result<Drained, SyncError> {
        let mut cursor = session.outbox.lock().await;
        if *cursor >= upto {
            return Ok(Drained::Sent(0));
        }

        let batch = match latest {
            Some(event) if *cursor + 1 == upto => vec![event.clone()],
            _ => self.load_range(&session.user_id, *cursor, upto).await?,
        };

        let mut sent = Vec::with_capacity(batch.len());
        for event in &batch {
            if let Err(failure) = session.connection.send(event) {
                tracing::warn!(
                    user_id = %session.user_id,
                    session_id = %session.session_id,
                    event_id = event.event_id,
                    reason = %failure.reason,
                    "delivery failed, dropping session"
                );
                drop(cursor);
                self.mark_sent(session, sent).await?;
                self.drop_session(session).await?;
                return Ok(Drained::Dropped);
            }
            *cursor = event.event_id;
            sent.push(event.event_id);
        }
        // Everything up to `upto` has been attempted, including ids that
        // expiry removed from the log.
        *cursor = upto;
        drop(cursor);

        let count = sent.len();
        self.mark_sent(session, sent).await?;
        Ok(Drained::Sent(count))
    }

    async fn load_range(
        &self,
        user_id: &str,
        after: EventId,
        upto: EventId,
    ) -> Result<Vec<Event>, SyncError> {
        let user_id = user_id.to_string();
        blocking(&self.pool, move |conn| {
            let mut events = Vec::new();
            for event in events_since(conn, &user_id, after)? {
                let event = event?;
                if event.event_id > upto {
                    break;
                }
                events.push(event);
            }
            Ok(events)
        })
        .await
    }

    async fn mark_sent(&self, session: &LiveSession, ids: Vec<EventId>) -> Result<(), SyncError> {
        if ids.is_empty() {
            return Ok(());
        }
        let session_id = session.session_id;
        blocking(&self.pool, move |conn| {
            for id in ids {
                mark_delivered(conn, session_id, id)?;
            }
            Ok(())
        })
        .await
    }

    /// Removes a session whose connection failed.
    ///
    /// Only the entry registered with that connection is removed; a resumed
    /// entry on a newer connection stays live.
    pub(crate) async fn drop_session(&self, session: &LiveSession) -> Result<(), SyncError> {
        session.connection.close();
        let session_id = session.session_id;
        if self
            .presence
            .deregister_connection(session_id, &session.connection)
            .await
            .is_none()
        {
            return Ok(());
        }
        blocking(&self.pool, move |conn| {
            record_disconnect(conn, session_id, Utc::now())?;
            Ok(())
        })
        .await
    }
}

enum Drained {
    Sent(usize),
    Dropped,
}
