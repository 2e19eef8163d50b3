//! The item lifecycle state machine.
//!
//! Everything here is pure: [`transition`] takes the current item and a
//! request and returns either the next item plus the change record to log,
//! or a [`LifecycleError`]. Persistence is the caller's concern.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use todosync_types::ItemStatus;

use crate::error::LifecycleError;

/// A todo item as seen by the synchronization core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Public item identifier.
    pub item_id: String,
    /// Owning user.
    pub user_id: String,
    /// Current lifecycle status.
    pub status: ItemStatus,
    /// Incremented by exactly one on every accepted transition.
    pub version: i64,
    /// When each status was last entered.
    pub status_times: BTreeMap<ItemStatus, DateTime<Utc>>,
}

impl Item {
    /// A new item in `created`, version 0.
    pub fn new(item_id: impl Into<String>, user_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            item_id: item_id.into(),
            user_id: user_id.into(),
            status: ItemStatus::Created,
            version: 0,
            status_times: BTreeMap::from([(ItemStatus::Created, created_at)]),
        }
    }

    /// When `status` was last entered, if ever.
    pub fn entered_at(&self, status: ItemStatus) -> Option<DateTime<Utc>> {
        self.status_times.get(&status).copied()
    }
}

/// A client's request to move an item to a new status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRequest {
    /// Desired status.
    pub target: ItemStatus,
    /// Version the client last saw.
    pub expected_version: i64,
    /// Client-side time of the edit.
    pub requested_at: DateTime<Utc>,
}

/// Payload of a `lifecycle_change` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleChange {
    /// Status before the change; `None` when the item was just created.
    pub from: Option<ItemStatus>,
    /// Status after the change.
    pub to: ItemStatus,
    /// Item version after the change.
    pub version: i64,
    /// Full item snapshot after the change.
    pub item: Item,
}

impl LifecycleChange {
    /// The change record for a freshly created item.
    pub fn created(item: &Item) -> Self {
        Self {
            from: None,
            to: item.status,
            version: item.version,
            item: item.clone(),
        }
    }
}

/// The outcome of an accepted transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// The item after the transition.
    pub item: Item,
    /// The change to append to the event log.
    pub change: LifecycleChange,
}

/// Statuses reachable from `status` in one hop.
pub fn successors(status: ItemStatus) -> &'static [ItemStatus] {
    match status {
        ItemStatus::Created => &[ItemStatus::Active],
        ItemStatus::Active => &[ItemStatus::Completed, ItemStatus::Archived],
        ItemStatus::Completed => &[ItemStatus::Archived],
        ItemStatus::Archived => &[ItemStatus::Deleted],
        ItemStatus::Deleted => &[],
    }
}

/// Returns `true` if `from → to` is an edge of the transition table.
pub fn is_legal_transition(from: ItemStatus, to: ItemStatus) -> bool {
    successors(from).contains(&to)
}

/// Validates and applies one transition.
///
/// Checks run in a fixed order: version first, then the edge, then clock
/// ordering against the time the current status was entered.
///
/// # Errors
///
/// - [`LifecycleError::VersionConflict`] if `expected_version` is not the
///   item's current version.
/// - [`LifecycleError::InvalidTransition`] if the edge is not in the table
///   (this includes self-transitions and anything out of `deleted`).
/// - [`LifecycleError::StaleRequest`] if `requested_at` is earlier than the
///   current status's entry time.
pub fn transition(item: &Item, request: &TransitionRequest) -> Result<Transition, LifecycleError> {
    if request.expected_version != item.version {
        return Err(LifecycleError::VersionConflict {
            expected: request.expected_version,
            actual: item.version,
        });
    }

    if !is_legal_transition(item.status, request.target) {
        return Err(LifecycleError::InvalidTransition {
            from: item.status,
            to: request.target,
        });
    }

    if let Some(entered_at) = item.entered_at(item.status) {
        if request.requested_at < entered_at {
            return Err(LifecycleError::StaleRequest {
                status: item.status,
                entered_at,
                requested_at: request.requested_at,
            });
        }
    }

    let mut next = item.clone();
    next.status = request.target;
    next.version += 1;
    next.status_times.insert(request.target, request.requested_at);

    let change = LifecycleChange {
        from: Some(item.status),
        to: next.status,
        version: next.version,
        item: next.clone(),
    };

    Ok(Transition { item: next, change })
}
