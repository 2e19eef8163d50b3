//! Persistence operations for the event log.
//!
//! All writes go through [`append`], which bumps the user's allocator row,
//! inserts the event, and creates a `pending` delivery row for every session
//! the user has registered. It takes a [`Transaction`] so the three
//! statements commit or roll back together; a rolled-back append never
//! leaves a hole in the id sequence.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use todosync_types::{format_timestamp, parse_timestamp, DeliveryStatus, EventId, EventKind, SessionId};

use crate::error::EventLogError;
use crate::event::Event;

/// Rows fetched per page by [`EventsSince`].
const PAGE_SIZE: usize = 256;

/// Appends an event to `user_id`'s stream and returns it.
///
/// The id is `last_event_id + 1` for the user, allocated by an upsert on
/// `event_streams`. SQLite admits one writer at a time, so concurrent
/// appends for a user serialize on that row.
///
/// # Errors
///
/// Returns `EventLogError::Database` on SQL failure or
/// `EventLogError::Serialization` if the payload cannot be serialised.
pub fn append(
    tx: &Transaction<'_>,
    user_id: &str,
    kind: EventKind,
    payload: &serde_json::Value,
    created_at: DateTime<Utc>,
) -> Result<Event, EventLogError> {
    let payload_json = serde_json::to_string(payload)?;

    let event_id: EventId = tx.query_row(
        "INSERT INTO event_streams (user_id, last_event_id) VALUES (?1, 1)
         ON CONFLICT (user_id) DO UPDATE SET last_event_id = last_event_id + 1
         RETURNING last_event_id",
        [user_id],
        |row| row.get(0),
    )?;

    tx.execute(
        "INSERT INTO events (user_id, event_id, kind, payload_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            user_id,
            event_id,
            kind.as_str(),
            payload_json,
            format_timestamp(&created_at),
        ],
    )?;

    let fanout = tx.execute(
        "INSERT INTO event_deliveries (user_id, event_id, session_id, status)
         SELECT ?1, ?2, session_id, 'pending' FROM sessions WHERE user_id = ?1",
        params![user_id, event_id],
    )?;

    tracing::debug!(user_id, event_id, kind = %kind, sessions = fanout, "appended event");

    Ok(Event {
        user_id: user_id.to_string(),
        event_id,
        kind,
        payload: payload.clone(),
        created_at,
    })
}

/// Returns the last id allocated for `user_id`, or 0 for an empty stream.
pub fn head(conn: &Connection, user_id: &str) -> Result<EventId, EventLogError> {
    let head: Option<EventId> = conn
        .query_row(
            "SELECT last_event_id FROM event_streams WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(head.unwrap_or(0))
}

/// Marks `event_id` as handed to `session_id`'s connection.
///
/// Only `pending` rows move; repeating the call, or calling it after the
/// event was acknowledged, changes nothing. Returns whether a row changed.
pub fn mark_delivered(
    conn: &Connection,
    session_id: SessionId,
    event_id: EventId,
) -> Result<bool, EventLogError> {
    let changed = conn.execute(
        "UPDATE event_deliveries
         SET status = 'delivered', updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE session_id = ?1 AND event_id = ?2 AND status = 'pending'
           AND user_id = (SELECT user_id FROM sessions WHERE session_id = ?1)",
        params![session_id.to_string(), event_id],
    )?;
    Ok(changed > 0)
}

/// Records that `session_id` applied `event_id`.
///
/// Moves the delivery row to `acknowledged` and raises the session's
/// watermark to `event_id` if that is higher and the event was ever
/// allocated. Idempotent. Returns whether the delivery row changed.
pub fn acknowledge(
    conn: &Connection,
    session_id: SessionId,
    event_id: EventId,
) -> Result<bool, EventLogError> {
    let sid = session_id.to_string();
    let changed = conn.execute(
        "UPDATE event_deliveries
         SET status = 'acknowledged', updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE session_id = ?1 AND event_id = ?2 AND status != 'acknowledged'
           AND user_id = (SELECT user_id FROM sessions WHERE session_id = ?1)",
        params![sid, event_id],
    )?;

    conn.execute(
        "UPDATE sessions SET last_seen_event_id = MAX(last_seen_event_id, ?2)
         WHERE session_id = ?1
           AND ?2 <= (SELECT COALESCE(MAX(last_event_id), 0) FROM event_streams
                      WHERE event_streams.user_id = sessions.user_id)",
        params![sid, event_id],
    )?;

    Ok(changed > 0)
}

/// Reads the delivery state of one event for one session.
///
/// `None` means no row exists: the session registered after the event was
/// appended, or the event has been expired.
pub fn delivery_status(
    conn: &Connection,
    user_id: &str,
    event_id: EventId,
    session_id: SessionId,
) -> Result<Option<DeliveryStatus>, EventLogError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM event_deliveries
             WHERE user_id = ?1 AND event_id = ?2 AND session_id = ?3",
            params![user_id, event_id, session_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    raw.map(|s| {
        s.parse::<DeliveryStatus>().map_err(|e| {
            EventLogError::Database(rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))
        })
    })
    .transpose()
}

/// Counts retained events with id greater than `after`.
pub fn count_since(conn: &Connection, user_id: &str, after: EventId) -> Result<u64, EventLogError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM events WHERE user_id = ?1 AND event_id > ?2",
        params![user_id, after],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or(0))
}

/// Returns a lazy sequence of `user_id`'s events with id greater than `after`.
///
/// The sequence is bounded by the stream head at the time of this call, so
/// it terminates even while new events are being appended. Calling again
/// with the same `after` yields the same events unless [`expire`] ran in
/// between.
pub fn events_since<'conn>(
    conn: &'conn Connection,
    user_id: &str,
    after: EventId,
) -> Result<EventsSince<'conn>, EventLogError> {
    let upto = head(conn, user_id)?;
    Ok(EventsSince {
        conn,
        user_id: user_id.to_string(),
        cursor: after,
        upto,
        buffer: VecDeque::new(),
        exhausted: after >= upto,
    })
}

/// Paged iterator returned by [`events_since`].
pub struct EventsSince<'conn> {
    conn: &'conn Connection,
    user_id: String,
    cursor: EventId,
    upto: EventId,
    buffer: VecDeque<Event>,
    exhausted: bool,
}

impl EventsSince<'_> {
    /// Id of the last event yielded, or the starting watermark.
    pub fn cursor(&self) -> EventId {
        self.cursor
    }

    /// The stream head captured when the sequence was created.
    pub fn upto(&self) -> EventId {
        self.upto
    }

    fn fill(&mut self) -> Result<(), EventLogError> {
        let conn = self.conn;
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, event_id, kind, payload_json, created_at
             FROM events
             WHERE user_id = ?1 AND event_id > ?2 AND event_id <= ?3
             ORDER BY event_id ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![self.user_id, self.cursor, self.upto, PAGE_SIZE as i64],
            map_row_to_event,
        )?;
        for row in rows {
            self.buffer.push_back(row?);
        }
        if self.buffer.len() < PAGE_SIZE {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl Iterator for EventsSince<'_> {
    type Item = Result<Event, EventLogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let event = self.buffer.pop_front()?;
        self.cursor = event.event_id;
        Some(Ok(event))
    }
}

/// Summary of one [`expire`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    /// Events removed because every session acknowledged them (or none
    /// references them).
    pub compacted: usize,
    /// Events removed by the retention ceiling while still unacknowledged.
    pub force_expired: usize,
    /// Sessions flagged for full resync because of forced expiry.
    pub sessions_flagged: usize,
}

/// Applies retention.
///
/// 1. Sessions still owing an acknowledgment for an event created before
///    `ceiling` are flagged `resync_required`.
/// 2. Every event created before `ceiling` is removed.
/// 3. Every remaining event with no unacknowledged delivery row is removed.
///
/// Delivery rows go with their events via `ON DELETE CASCADE`. The
/// allocator in `event_streams` is untouched, so ids never repeat.
pub fn expire(tx: &Transaction<'_>, ceiling: DateTime<Utc>) -> Result<ExpiryReport, EventLogError> {
    let ceiling = format_timestamp(&ceiling);

    let sessions_flagged = tx.execute(
        "UPDATE sessions SET resync_required = 1
         WHERE resync_required = 0 AND session_id IN (
            SELECT d.session_id FROM event_deliveries d
            JOIN events e ON e.user_id = d.user_id AND e.event_id = d.event_id
            WHERE e.created_at < ?1 AND d.status != 'acknowledged'
         )",
        [&ceiling],
    )?;

    let force_expired: i64 = tx.query_row(
        "SELECT COUNT(*) FROM events e
         WHERE e.created_at < ?1 AND EXISTS (
            SELECT 1 FROM event_deliveries d
            WHERE d.user_id = e.user_id AND d.event_id = e.event_id
              AND d.status != 'acknowledged'
         )",
        [&ceiling],
        |row| row.get(0),
    )?;

    let aged = tx.execute("DELETE FROM events WHERE created_at < ?1", [&ceiling])?;

    let settled = tx.execute(
        "DELETE FROM events WHERE NOT EXISTS (
            SELECT 1 FROM event_deliveries d
            WHERE d.user_id = events.user_id AND d.event_id = events.event_id
              AND d.status != 'acknowledged'
         )",
        [],
    )?;

    let force_expired = usize::try_from(force_expired).unwrap_or(0);
    Ok(ExpiryReport {
        compacted: aged.saturating_sub(force_expired) + settled,
        force_expired,
        sessions_flagged,
    })
}

pub(crate) fn map_row_to_event(row: &Row) -> rusqlite::Result<Event> {
    let kind_str: String = row.get(2)?;
    let kind: EventKind = kind_str.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let payload_str: String = row.get(3)?;
    let payload: serde_json::Value = serde_json::from_str(&payload_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_str: String = row.get(4)?;
    let created_at = parse_timestamp(&created_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Event {
        user_id: row.get(0)?,
        event_id: row.get(1)?,
        kind,
        payload,
        created_at,
    })
}
