//! SQLite persistence for items.
//!
//! Writes are guarded by `WHERE version = ?`, so two devices racing on the
//! same item cannot both succeed: the loser sees zero rows updated and gets
//! [`LifecycleError::VersionConflict`] with the persisted row untouched.
//! Callers that also append to the event log wrap these calls in one
//! transaction.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use todosync_types::{format_timestamp, parse_timestamp, ItemStatus};

use crate::error::{ItemError, LifecycleError};
use crate::lifecycle::{self, Item, Transition, TransitionRequest};

const ITEM_COLUMNS: &str = "item_id, user_id, status, version,
    created_at, active_at, completed_at, archived_at, deleted_at";

/// Column holding the entry time for `status`.
fn timestamp_column(status: ItemStatus) -> &'static str {
    match status {
        ItemStatus::Created => "created_at",
        ItemStatus::Active => "active_at",
        ItemStatus::Completed => "completed_at",
        ItemStatus::Archived => "archived_at",
        ItemStatus::Deleted => "deleted_at",
    }
}

/// Inserts a new item in the `created` status.
///
/// # Errors
///
/// Returns `ItemError::AlreadyExists` if the item id is taken.
pub fn create_item(
    conn: &Connection,
    user_id: &str,
    item_id: &str,
    created_at: DateTime<Utc>,
) -> Result<Item, ItemError> {
    let item = Item::new(item_id, user_id, created_at);
    let result = conn.execute(
        "INSERT INTO items (item_id, user_id, status, version, created_at)
         VALUES (?1, ?2, ?3, 0, ?4)",
        params![
            item.item_id,
            item.user_id,
            item.status.as_str(),
            format_timestamp(&created_at),
        ],
    );

    match result {
        Ok(_) => Ok(item),
        Err(rusqlite::Error::SqliteFailure(code, _))
            if code.code == rusqlite::ffi::ErrorCode::ConstraintViolation =>
        {
            Err(ItemError::AlreadyExists(item_id.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Loads an item owned by `user_id`.
///
/// Items owned by someone else are reported as not found.
pub fn get_item(conn: &Connection, user_id: &str, item_id: &str) -> Result<Item, ItemError> {
    conn.query_row(
        &format!("SELECT {ITEM_COLUMNS} FROM items WHERE item_id = ?1 AND user_id = ?2"),
        params![item_id, user_id],
        map_row_to_item,
    )
    .optional()?
    .ok_or_else(|| ItemError::NotFound(item_id.to_string()))
}

/// Lists every item of a user, for full-state resync.
pub fn list_items(conn: &Connection, user_id: &str) -> Result<Vec<Item>, ItemError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM items WHERE user_id = ?1 ORDER BY created_at ASC, item_id ASC"
    ))?;
    let rows = stmt.query_map([user_id], map_row_to_item)?;
    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }
    Ok(items)
}

/// Runs the state machine against the persisted item and writes the result.
///
/// # Errors
///
/// Returns `ItemError::NotFound` for unknown items and
/// `ItemError::Lifecycle` for rejected transitions, including a
/// `VersionConflict` when a concurrent writer got there first.
pub fn apply_transition(
    conn: &Connection,
    user_id: &str,
    item_id: &str,
    request: &TransitionRequest,
) -> Result<Transition, ItemError> {
    let current = get_item(conn, user_id, item_id)?;
    let transition = lifecycle::transition(&current, request)?;

    let sql = format!(
        "UPDATE items SET status = ?1, version = ?2, {} = ?3
         WHERE item_id = ?4 AND user_id = ?5 AND version = ?6",
        timestamp_column(request.target)
    );
    let updated = conn.execute(
        &sql,
        params![
            transition.item.status.as_str(),
            transition.item.version,
            format_timestamp(&request.requested_at),
            item_id,
            user_id,
            current.version,
        ],
    )?;

    if updated == 0 {
        let actual = get_item(conn, user_id, item_id)?.version;
        tracing::debug!(
            item_id,
            expected = current.version,
            actual,
            "lost optimistic concurrency race"
        );
        return Err(LifecycleError::VersionConflict {
            expected: request.expected_version,
            actual,
        }
        .into());
    }

    tracing::debug!(
        item_id,
        from = %current.status,
        to = %transition.item.status,
        version = transition.item.version,
        "item transitioned"
    );

    Ok(transition)
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn map_row_to_item(row: &Row) -> rusqlite::Result<Item> {
    let status_str: String = row.get(2)?;
    let status: ItemStatus = status_str.parse().map_err(|e| conversion_error(2, e))?;

    let mut status_times = BTreeMap::new();
    for (offset, each) in ItemStatus::ALL.into_iter().enumerate() {
        let idx = 4 + offset;
        let raw: Option<String> = row.get(idx)?;
        if let Some(raw) = raw {
            let ts = parse_timestamp(&raw).map_err(|e| conversion_error(idx, e))?;
            status_times.insert(each, ts);
        }
    }

    Ok(Item {
        item_id: row.get(0)?,
        user_id: row.get(1)?,
        status,
        version: row.get(3)?,
        status_times,
    })
}
