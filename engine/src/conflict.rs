//! Per-item conflict handling.
//!
//! A conflicting row surfaces as zero affected rows from a version-predicate
//! write. What happens next depends on the item's change type, on whether the
//! failed attempt was already forced, and on the resolver's directive. This
//! module captures that flow as a pure transition function, so the whole
//! space is unit-testable without a store:
//!
//! ```text
//!     start → attempt(force=false)
//!              ├── rows>0     ──────────────→ applied
//!              └── rows==0
//!                   ├── Insert                ─→ abort change-set
//!                   └── Update|Delete
//!                        → resolver
//!                           ├── Skip         ─→ skipped
//!                           └── ForceWrite
//!                                → attempt(force=true)
//!                                   ├── rows>0         ─→ applied
//!                                   └── rows==0
//!                                        ├── was Delete ─→ skipped
//!                                        └── was Update ─→ insert(force) ─→ applied
//! ```

use crate::ChangeType;
use serde::{Deserialize, Serialize};

/// Resolver directive for a conflicting update or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictAction {
    /// Keep the local row; drop the incoming item (default)
    #[default]
    Skip,
    /// Override the version predicate and write the incoming values
    ForceWrite,
}

/// A single write to attempt against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAttempt {
    /// The mutation kind to perform
    pub change_type: ChangeType,
    /// Whether the version predicate is overridden
    pub force_write: bool,
}

impl WriteAttempt {
    /// The opening attempt for an item: its own change type, no override.
    pub fn first(change_type: ChangeType) -> Self {
        Self {
            change_type,
            force_write: false,
        }
    }

    fn forced(change_type: ChangeType) -> Self {
        Self {
            change_type,
            force_write: true,
        }
    }
}

/// What the driver should do after an attempt affected zero rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Perform another write for the same item
    Retry(WriteAttempt),
    /// Leave the local row untouched and move on
    Skip,
    /// Reject the whole change-set
    Abort,
}

/// Transition taken when `attempt` affected zero rows.
///
/// `resolve` is invoked at most once, and only for an unforced update or
/// delete, the one place the caller's conflict policy has a say.
pub fn next_step(attempt: WriteAttempt, resolve: impl FnOnce() -> ConflictAction) -> NextStep {
    match (attempt.change_type, attempt.force_write) {
        // A key collision that is not an exact duplicate; nothing at this
        // protocol level can reconcile it.
        (ChangeType::Insert, false) => NextStep::Abort,
        // A forced reinstate cannot miss inside one snapshot; saturate.
        (ChangeType::Insert, true) => NextStep::Skip,
        (ChangeType::Update, false) | (ChangeType::Delete, false) => match resolve() {
            ConflictAction::Skip => NextStep::Skip,
            ConflictAction::ForceWrite => NextStep::Retry(WriteAttempt::forced(attempt.change_type)),
        },
        // Even forced, the update found nothing: the row was deleted locally.
        // Reinstate it with the incoming values.
        (ChangeType::Update, true) => NextStep::Retry(WriteAttempt::forced(ChangeType::Insert)),
        // The row is already gone on both sides.
        (ChangeType::Delete, true) => NextStep::Skip,
    }
}
