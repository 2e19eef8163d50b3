//! Shared types, identifiers, and constants for the todosync workspace.
//!
//! Every crate that needs to agree on an item status, an event kind, or a
//! delivery state imports it from here. This crate has no knowledge of
//! storage or transport, which keeps the dependency graph acyclic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod policy;
mod time;
pub use policy::SyncPolicy;
pub use time::{format_timestamp, parse_timestamp};

/// Identifier of an event within one user's stream.
///
/// Event ids are allocated per user, start at 1, and are gapless.
pub type EventId = i64;

/// Identifier of a channel session (one per device connection lineage).
pub type SessionId = uuid::Uuid;

/// Error returned when a stored or wire label does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} label: {label}")]
pub struct ParseLabelError {
    /// Which enumeration was being parsed.
    pub kind: &'static str,
    /// The offending label.
    pub label: String,
}

/// Lifecycle status of a todo item.
///
/// Replaces the legacy `done` / `archived` boolean flags with a single
/// enumerated field, so combinations such as "done and deleted" cannot be
/// represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Freshly created, not yet started.
    Created,
    /// Being worked on.
    Active,
    /// Finished.
    Completed,
    /// Hidden from the default view.
    Archived,
    /// Terminal. Irreversible.
    Deleted,
}

impl ItemStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [ItemStatus; 5] = [
        Self::Created,
        Self::Active,
        Self::Completed,
        Self::Archived,
        Self::Deleted,
    ];

    /// Returns the canonical label stored in the database and sent on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }

    /// Returns `true` for the terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseLabelError {
                kind: "item status",
                label: s.to_string(),
            })
    }
}

/// Kind of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An item moved between lifecycle statuses (or was created).
    LifecycleChange,
    /// A free-form notification addressed to the user.
    Notification,
}

impl EventKind {
    /// Returns the canonical label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LifecycleChange => "lifecycle_change",
            Self::Notification => "notification",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lifecycle_change" => Ok(Self::LifecycleChange),
            "notification" => Ok(Self::Notification),
            _ => Err(ParseLabelError {
                kind: "event kind",
                label: s.to_string(),
            }),
        }
    }
}

/// Per-session delivery state of an event.
///
/// States only move forward: `Pending` → `Delivered` → `Acknowledged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Not yet handed to the session's connection.
    Pending,
    /// Handed to the connection; not proof of client-side application.
    Delivered,
    /// The client confirmed it applied the event.
    Acknowledged,
}

impl DeliveryStatus {
    /// Returns the canonical label for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Acknowledged => "acknowledged",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "acknowledged" => Ok(Self::Acknowledged),
            _ => Err(ParseLabelError {
                kind: "delivery status",
                label: s.to_string(),
            }),
        }
    }
}
