//! Replay of missed events when a session (re)connects.

use rusqlite::TransactionBehavior;
use todosync_db::DbPool;
use todosync_events::{
    acknowledged_after, advance_watermark, count_since, events_since, get_session,
    mark_delivered, replay_start, reset_to_head, Event,
};
use todosync_types::{EventId, SessionId};

use crate::blocking;
use crate::connection::SessionConnection;
use crate::error::SyncError;

/// Result of a successful replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replay {
    /// Replay started after this id.
    pub start: EventId,
    /// Events sent over the connection.
    pub delivered: usize,
    /// Stream head the replay ran up to. Every id at or below it was either
    /// sent or already acknowledged.
    pub through: EventId,
}

/// Catches sessions up from the event log.
#[derive(Clone)]
pub struct Reconciler {
    pool: DbPool,
    max_replay_events: u64,
}

enum Plan {
    Replay {
        start: EventId,
        through: EventId,
        events: Vec<Event>,
    },
    Resync {
        head: EventId,
    },
}

impl Reconciler {
    pub fn new(pool: DbPool, max_replay_events: u64) -> Self {
        Self {
            pool,
            max_replay_events,
        }
    }

    /// Replays every event `session_id` has not acknowledged, in id order.
    ///
    /// Events are marked `delivered` as they go out and the watermark is
    /// raised to the highest id sent. Must run before the session joins the
    /// live set.
    ///
    /// # Errors
    ///
    /// - `SyncError::ResyncRequired` when the session was flagged by expiry,
    ///   is unknown (reported with `head` 0), or is further behind than
    ///   `max_replay_events`. Known sessions are moved to the head first.
    /// - `SyncError::DeliveryFailure` if the connection refused a frame.
    ///   Frames already sent stay marked delivered.
    pub async fn reconcile(
        &self,
        session_id: SessionId,
        connection: &dyn SessionConnection,
    ) -> Result<Replay, SyncError> {
        let max = self.max_replay_events;
        let plan = blocking(&self.pool, move |conn| {
            let Some(record) = get_session(conn, session_id)? else {
                return Ok(Plan::Resync { head: 0 });
            };

            let start = replay_start(conn, &record)?;
            let backlog = count_since(conn, &record.user_id, start)?;
            if record.resync_required || backlog > max {
                tracing::info!(
                    user_id = %record.user_id,
                    session_id = %session_id,
                    flagged = record.resync_required,
                    backlog,
                    "replay not possible, resetting session to head"
                );
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let head = reset_to_head(&tx, &record)?;
                tx.commit()?;
                return Ok(Plan::Resync { head });
            }

            let acked = acknowledged_after(conn, session_id, start)?;
            let mut seq = events_since(conn, &record.user_id, start)?;
            let mut events = Vec::new();
            for event in seq.by_ref() {
                let event = event?;
                if !acked.contains(&event.event_id) {
                    events.push(event);
                }
            }
            Ok(Plan::Replay {
                start,
                through: seq.upto(),
                events,
            })
        })
        .await?;

        let (start, through, events) = match plan {
            Plan::Resync { head } => return Err(SyncError::ResyncRequired { head }),
            Plan::Replay {
                start,
                through,
                events,
            } => (start, through, events),
        };

        let mut sent = Vec::with_capacity(events.len());
        let mut failure = None;
        for event in &events {
            match connection.send(event) {
                Ok(()) => sent.push(event.event_id),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let delivered = sent.len();
        let highest = sent.last().copied();
        blocking(&self.pool, move |conn| {
            for id in &sent {
                mark_delivered(conn, session_id, *id)?;
            }
            if let Some(highest) = highest {
                advance_watermark(conn, session_id, highest)?;
            }
            Ok(())
        })
        .await?;

        if let Some(e) = failure {
            tracing::warn!(session_id = %session_id, delivered, reason = %e.reason, "replay interrupted");
            return Err(e.into());
        }

        tracing::debug!(session_id = %session_id, start, through, delivered, "replayed backlog");
        Ok(Replay {
            start,
            delivered,
            through,
        })
    }
}
