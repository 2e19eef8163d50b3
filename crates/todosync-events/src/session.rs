//! Durable session records.
//!
//! A session row outlives its connection: the watermark and the
//! `resync_required` flag survive a disconnect so a reconnecting device can
//! be reconciled. Live membership is tracked elsewhere, in memory.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use todosync_types::{format_timestamp, parse_timestamp, EventId, SessionId};

use crate::error::EventLogError;
use crate::store::head;

/// A persisted session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Session identifier.
    pub session_id: SessionId,
    /// Owning user.
    pub user_id: String,
    /// Highest event id the session is known to have processed.
    pub last_seen_event_id: EventId,
    /// When the current (or most recent) connection was established.
    pub connected_at: DateTime<Utc>,
    /// When the most recent connection ended, if it has.
    pub last_disconnected_at: Option<DateTime<Utc>>,
    /// Set by retention when events this session still owed were dropped.
    pub resync_required: bool,
}

const SESSION_COLUMNS: &str = "session_id, user_id, last_seen_event_id, connected_at,
    last_disconnected_at, resync_required";

/// Creates a session whose watermark starts at the user's current head.
///
/// A brand-new device loads full state over the CRUD surface, so it has no
/// use for history that predates it. The head is read inside the same
/// statement as the insert, so no event can slip in between.
pub fn open_session(
    conn: &Connection,
    user_id: &str,
    session_id: SessionId,
    connected_at: DateTime<Utc>,
) -> Result<SessionRecord, EventLogError> {
    conn.execute(
        "INSERT INTO sessions (session_id, user_id, last_seen_event_id, connected_at)
         VALUES (?1, ?2,
            (SELECT COALESCE(MAX(last_event_id), 0) FROM event_streams WHERE user_id = ?2),
            ?3)",
        params![
            session_id.to_string(),
            user_id,
            format_timestamp(&connected_at),
        ],
    )?;

    let record = get_session(conn, session_id)?;
    record.ok_or(EventLogError::Database(rusqlite::Error::QueryReturnedNoRows))
}

/// Loads a session by id.
pub fn get_session(
    conn: &Connection,
    session_id: SessionId,
) -> Result<Option<SessionRecord>, EventLogError> {
    let record = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
            [session_id.to_string()],
            map_row_to_session,
        )
        .optional()?;
    Ok(record)
}

/// Marks an existing session of `user_id` as connected again.
///
/// Returns `None` when the session does not exist or belongs to another
/// user; callers treat both the same way.
pub fn resume_session(
    conn: &Connection,
    user_id: &str,
    session_id: SessionId,
    connected_at: DateTime<Utc>,
) -> Result<Option<SessionRecord>, EventLogError> {
    let updated = conn.execute(
        "UPDATE sessions SET connected_at = ?3, last_disconnected_at = NULL
         WHERE session_id = ?1 AND user_id = ?2",
        params![
            session_id.to_string(),
            user_id,
            format_timestamp(&connected_at),
        ],
    )?;
    if updated == 0 {
        return Ok(None);
    }
    get_session(conn, session_id)
}

/// Records the end of a session's connection. The watermark is kept.
pub fn record_disconnect(
    conn: &Connection,
    session_id: SessionId,
    at: DateTime<Utc>,
) -> Result<(), EventLogError> {
    conn.execute(
        "UPDATE sessions SET last_disconnected_at = ?2 WHERE session_id = ?1",
        params![session_id.to_string(), format_timestamp(&at)],
    )?;
    Ok(())
}

/// Raises the watermark to `event_id` if that is higher.
pub fn advance_watermark(
    conn: &Connection,
    session_id: SessionId,
    event_id: EventId,
) -> Result<(), EventLogError> {
    conn.execute(
        "UPDATE sessions SET last_seen_event_id = MAX(last_seen_event_id, ?2)
         WHERE session_id = ?1",
        params![session_id.to_string(), event_id],
    )?;
    Ok(())
}

/// Lowest event id this session has a delivery row for but has not acknowledged.
pub fn first_unacknowledged(
    conn: &Connection,
    session_id: SessionId,
) -> Result<Option<EventId>, EventLogError> {
    let first: Option<EventId> = conn.query_row(
        "SELECT MIN(d.event_id) FROM event_deliveries d
         JOIN sessions s ON s.session_id = d.session_id AND s.user_id = d.user_id
         WHERE d.session_id = ?1 AND d.status != 'acknowledged'",
        [session_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(first)
}

/// Where replay for this session must start (exclusive).
///
/// This is the lower of the watermark and the id just before the oldest
/// event the session has not acknowledged, so an event that was delivered
/// but never acknowledged is replayed even if the watermark moved past it.
pub fn replay_start(conn: &Connection, record: &SessionRecord) -> Result<EventId, EventLogError> {
    Ok(match first_unacknowledged(conn, record.session_id)? {
        Some(id) => record.last_seen_event_id.min(id - 1),
        None => record.last_seen_event_id,
    })
}

/// Ids greater than `after` that this session has already acknowledged.
pub fn acknowledged_after(
    conn: &Connection,
    session_id: SessionId,
    after: EventId,
) -> Result<HashSet<EventId>, EventLogError> {
    let mut stmt = conn.prepare(
        "SELECT event_id FROM event_deliveries
         WHERE session_id = ?1 AND event_id > ?2 AND status = 'acknowledged'",
    )?;
    let rows = stmt.query_map(params![session_id.to_string(), after], |row| row.get(0))?;
    let mut ids = HashSet::new();
    for row in rows {
        ids.insert(row?);
    }
    Ok(ids)
}

/// Moves a session to the stream head after a full-state resync.
///
/// Clears `resync_required` and drops the session's outstanding delivery
/// rows, which the full state supersedes. Returns the new watermark.
pub fn reset_to_head(tx: &Transaction<'_>, record: &SessionRecord) -> Result<EventId, EventLogError> {
    let head = head(tx, &record.user_id)?;
    let sid = record.session_id.to_string();

    tx.execute(
        "UPDATE sessions SET last_seen_event_id = ?2, resync_required = 0 WHERE session_id = ?1",
        params![sid, head],
    )?;
    tx.execute(
        "DELETE FROM event_deliveries WHERE session_id = ?1 AND status != 'acknowledged'",
        [&sid],
    )?;

    Ok(head)
}

/// Forgets sessions whose connection ended before `disconnected_before`.
///
/// Their delivery rows cascade, which can let retention compact events
/// that were only waiting on them. Returns the number of sessions removed.
pub fn prune_sessions(
    conn: &Connection,
    disconnected_before: DateTime<Utc>,
) -> Result<usize, EventLogError> {
    let removed = conn.execute(
        "DELETE FROM sessions
         WHERE last_disconnected_at IS NOT NULL AND last_disconnected_at < ?1",
        [format_timestamp(&disconnected_before)],
    )?;
    Ok(removed)
}

fn map_row_to_session(row: &Row) -> rusqlite::Result<SessionRecord> {
    let conversion = |idx: usize, e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e)
    };

    let sid: String = row.get(0)?;
    let session_id = SessionId::parse_str(&sid).map_err(|e| conversion(0, Box::new(e)))?;

    let connected: String = row.get(3)?;
    let connected_at = parse_timestamp(&connected).map_err(|e| conversion(3, Box::new(e)))?;

    let disconnected: Option<String> = row.get(4)?;
    let last_disconnected_at = disconnected
        .map(|s| parse_timestamp(&s))
        .transpose()
        .map_err(|e| conversion(4, Box::new(e)))?;

    Ok(SessionRecord {
        session_id,
        user_id: row.get(1)?,
        last_seen_event_id: row.get(2)?,
        connected_at,
        last_disconnected_at,
        resync_required: row.get(5)?,
    })
}
