//! The abstract store contract consumed by the sync provider.
//!
//! A binding adapts one concrete store. It owns provisioning (bootstrapping
//! the bookkeeping entities and enabling row-level change tracking), and it
//! opens snapshot-isolated sessions through which the provider reads the
//! change-tracking oracle, performs conflict-aware row writes, and maintains
//! the remote anchor registry.
//!
//! The engine holds no locks of its own across session calls; isolation is
//! delegated entirely to the store. One session is opened per public
//! operation and closed on every exit path.

use crate::{ChangeType, Result, RowValues, StoreId, SyncItem, TableConfig, TableRef, Version};
use async_trait::async_trait;

/// One row reported by the change-tracking oracle.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    /// Net kind of the change relative to the requested base version
    pub change_type: ChangeType,
    /// Current key columns; inserts and updates also carry every non-key
    /// column, deletes carry the key alone
    pub values: RowValues,
}

impl RowChange {
    /// Create a row change.
    pub fn new(change_type: ChangeType, values: RowValues) -> Self {
        Self {
            change_type,
            values,
        }
    }
}

/// A per-store adapter.
pub trait StoreBinding: Send + Sync {
    /// Bootstrap the store for synchronization. Idempotent.
    ///
    /// Ensures row-level change tracking is enabled for every configured
    /// table, that the identity and anchor-registry bookkeeping entities
    /// exist, and that a durable [`StoreId`] is recorded (generating one on
    /// first provisioning). Returns the store's id.
    async fn apply_provision(&self, tables: &[TableConfig]) -> Result<StoreId>;

    /// Tear change tracking down. User data, the durable identity, and the
    /// anchor registry are left intact; a later
    /// [`apply_provision`](StoreBinding::apply_provision) resumes under the
    /// same [`StoreId`].
    async fn remove_provision(&self, tables: &[TableConfig]) -> Result<()>;

    /// The durable identity recorded by provisioning, or `None` when the
    /// store has never been provisioned.
    async fn load_store_id(&self) -> Result<Option<StoreId>>;

    /// Open a snapshot-isolated session.
    async fn begin(&self) -> Result<Box<dyn SyncSession + '_>>;
}

/// A snapshot-isolated unit of work against one store.
///
/// All reads observe the snapshot taken at [`StoreBinding::begin`]; writes
/// become visible atomically at [`commit`](SyncSession::commit). A session
/// dropped without committing must leave no trace.
#[async_trait]
pub trait SyncSession: Send {
    // --- change-tracking oracle ---

    /// The latest committed version across all tracked tables, as observed
    /// by this session's snapshot.
    async fn current_version(&mut self) -> Result<Version>;

    /// The oldest version from which an incremental delta for `table` can
    /// still be reconstructed. Changes at or below it may be compacted away.
    async fn min_valid_version(&mut self, table: &TableRef) -> Result<Version>;

    /// Net row changes of `table` in the open interval `(since, current]`.
    ///
    /// Fails with [`SyncError::VersionTooOld`](crate::SyncError::VersionTooOld)
    /// when `since` is below the table's tracking horizon.
    async fn changes_since(&mut self, table: &TableRef, since: Version) -> Result<Vec<RowChange>>;

    /// Full scan of `table`, used when the receiver holds no anchor yet.
    async fn initial_snapshot(&mut self, table: &TableRef) -> Result<Vec<RowValues>>;

    // --- conflict-aware row applier ---

    /// Insert the item's row unless one with the same key already exists.
    ///
    /// Returns the number of affected rows; zero means a row with the same
    /// key is already present.
    async fn insert_row(&mut self, item: &SyncItem) -> Result<u64>;

    /// Update the item's row, but only if its tracked change version is at
    /// most `last_sync_version`, unless `force_write` overrides the
    /// predicate.
    ///
    /// Zero affected rows means a concurrent local change won the predicate,
    /// or the row no longer exists.
    async fn update_row(
        &mut self,
        item: &SyncItem,
        last_sync_version: Version,
        force_write: bool,
    ) -> Result<u64>;

    /// Delete the item's row under the same predicate as
    /// [`update_row`](SyncSession::update_row).
    async fn delete_row(
        &mut self,
        item: &SyncItem,
        last_sync_version: Version,
        force_write: bool,
    ) -> Result<u64>;

    // --- anchor registry ---

    /// The highest local version `peer` has acknowledged, if it ever has.
    async fn last_anchor_of(&mut self, peer: StoreId) -> Result<Option<Version>>;

    /// Record `version` as the highest local version `peer` has
    /// acknowledged. Upsert; creates the registry row on first contact.
    async fn record_anchor(&mut self, peer: StoreId, version: Version) -> Result<()>;

    // --- transaction envelope ---

    /// Commit the session's writes atomically.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard the session's writes.
    async fn rollback(self: Box<Self>) -> Result<()>;
}
