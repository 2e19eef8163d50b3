//! Todo items and their lifecycle state machine.
//!
//! An item carries one enumerated [`ItemStatus`], the time each status was
//! last entered, and a `version` bumped on every accepted transition. The
//! pure state machine lives in [`lifecycle`]; the SQLite persistence that
//! guards writes with optimistic concurrency lives in [`store`].
//!
//! ```text
//! created ──▶ active ──▶ completed
//!               │            │
//!               └──▶ archived ◀┘
//!                      │
//!                      ▼
//!                   deleted
//! ```

mod error;
pub mod lifecycle;
pub mod store;

pub use error::{ItemError, LifecycleError};
pub use lifecycle::{
    is_legal_transition, successors, transition, Item, LifecycleChange, Transition,
    TransitionRequest,
};
pub use store::{apply_transition, create_item, get_item, list_items};
pub use todosync_types::ItemStatus;
