//! The sync provider: public surface of the engine.
//!
//! One provider fronts one store. `get_changes` assembles the delta a peer
//! must receive to catch up with this store; `apply_changes` applies a
//! change-set received from a peer, arbitrates conflicts, and advances the
//! acknowledgment anchor. Both run inside a single snapshot-isolated session
//! obtained from the binding, committed on success and rolled back on every
//! other path.

use crate::{
    binding::{StoreBinding, SyncSession},
    changeset::{ChangeType, SyncChangeSet, SyncItem},
    config::SyncSetup,
    conflict::{self, ConflictAction, NextStep, WriteAttempt},
    error::{Result, SyncError},
    StoreId, SyncAnchor, Version,
};
use tokio::sync::OnceCell;

/// A peer store's sync engine.
///
/// Construction is cheap; the store is touched lazily on the first public
/// operation, which loads and caches the durable [`StoreId`]. That first
/// touch is gated behind a one-shot cell, so concurrent first calls are safe
/// and initialization happens exactly once per provider.
pub struct SyncProvider<B: StoreBinding> {
    binding: B,
    setup: SyncSetup,
    store_id: OnceCell<StoreId>,
}

impl<B: StoreBinding> SyncProvider<B> {
    /// Create a provider over a binding and a validated table setup.
    pub fn new(binding: B, setup: SyncSetup) -> Self {
        Self {
            binding,
            setup,
            store_id: OnceCell::new(),
        }
    }

    /// The underlying binding.
    pub fn binding(&self) -> &B {
        &self.binding
    }

    /// The configured table setup.
    pub fn setup(&self) -> &SyncSetup {
        &self.setup
    }

    /// The durable identity of this store.
    pub async fn store_id(&self) -> Result<StoreId> {
        self.initialize().await
    }

    /// Bootstrap the store for synchronization. Idempotent.
    pub async fn apply_provision(&self) -> Result<StoreId> {
        let id = self.binding.apply_provision(self.setup.tables()).await?;
        tracing::info!(store_id = %id, tables = self.setup.len(), "store provisioned");
        Ok(id)
    }

    /// Tear change tracking down, leaving user data intact.
    pub async fn remove_provision(&self) -> Result<()> {
        self.binding.remove_provision(self.setup.tables()).await?;
        tracing::info!("store deprovisioned");
        Ok(())
    }

    async fn initialize(&self) -> Result<StoreId> {
        self.store_id
            .get_or_try_init(|| async {
                match self.binding.load_store_id().await? {
                    Some(id) => Ok(id),
                    None => Err(SyncError::NotInitialized),
                }
            })
            .await
            .copied()
    }

    /// Build the change-set that brings `other` up to date with this store.
    ///
    /// If `other` has acknowledged an anchor before, the set covers the open
    /// interval `(anchor, now]` per uploadable table. Otherwise it is an
    /// initial set: a full snapshot of every uploadable table not marked
    /// `skip_initial_snapshot`, emitted as inserts against version zero.
    pub async fn get_changes(&self, other: StoreId) -> Result<SyncChangeSet> {
        if other.is_nil() {
            return Err(SyncError::InvalidArgument(
                "peer store id must not be the zero id".into(),
            ));
        }
        let self_id = self.initialize().await?;

        let mut session = self.binding.begin().await?;
        match self.assemble(&mut *session, self_id, other).await {
            Ok(change_set) => {
                session.commit().await?;
                tracing::debug!(
                    peer = %other,
                    items = change_set.len(),
                    source = %change_set.source_anchor,
                    "assembled change-set"
                );
                Ok(change_set)
            }
            Err(err) => {
                session.rollback().await?;
                Err(err)
            }
        }
    }

    async fn assemble(
        &self,
        session: &mut (dyn SyncSession + '_),
        self_id: StoreId,
        other: StoreId,
    ) -> Result<SyncChangeSet> {
        let last_acked = session.last_anchor_of(other).await?;
        let v_now = session.current_version().await?;
        let mut items = Vec::new();

        match last_acked {
            Some(since) => {
                for table in self.setup.tables().iter().filter(|t| t.direction.uploads()) {
                    let table_ref = table.table_ref();
                    let min_valid = session.min_valid_version(&table_ref).await?;
                    if since < min_valid {
                        return Err(SyncError::VersionTooOld {
                            table: table_ref.to_string(),
                            version: since,
                            min_valid,
                        });
                    }
                    for change in session.changes_since(&table_ref, since).await? {
                        items.push(SyncItem::new(
                            table_ref.clone(),
                            change.change_type,
                            change.values,
                        ));
                    }
                }
                Ok(SyncChangeSet {
                    source_anchor: SyncAnchor::new(self_id, v_now),
                    target_anchor: SyncAnchor::new(other, since),
                    items,
                })
            }
            None => {
                for table in self
                    .setup
                    .tables()
                    .iter()
                    .filter(|t| t.direction.uploads() && !t.skip_initial_snapshot)
                {
                    let table_ref = table.table_ref();
                    for row in session.initial_snapshot(&table_ref).await? {
                        items.push(SyncItem::new(table_ref.clone(), ChangeType::Insert, row));
                    }
                }
                Ok(SyncChangeSet {
                    source_anchor: SyncAnchor::new(self_id, v_now),
                    target_anchor: SyncAnchor::zero(other),
                    items,
                })
            }
        }
    }

    /// Apply a change-set received from a peer, keeping the local row on
    /// every conflict.
    pub async fn apply_changes(&self, change_set: SyncChangeSet) -> Result<SyncAnchor> {
        self.apply_changes_with(change_set, |_| ConflictAction::Skip)
            .await
    }

    /// Apply a change-set received from a peer, consulting `on_conflict` for
    /// every update or delete that lost its version predicate.
    ///
    /// Runs as one transaction: either every item lands (or is deliberately
    /// skipped) and the acknowledgment anchor advances, or the store is left
    /// untouched. Returns the new anchor the caller must hand back to the
    /// source peer.
    pub async fn apply_changes_with<F>(
        &self,
        change_set: SyncChangeSet,
        mut on_conflict: F,
    ) -> Result<SyncAnchor>
    where
        F: FnMut(&SyncItem) -> ConflictAction + Send,
    {
        let self_id = self.initialize().await?;
        if change_set.target_anchor.store_id != self_id {
            return Err(SyncError::WrongTarget {
                target: change_set.target_anchor.store_id,
            });
        }

        let mut session = self.binding.begin().await?;
        match self
            .apply_inner(&mut *session, self_id, &change_set, &mut on_conflict)
            .await
        {
            Ok(anchor) => {
                session.commit().await?;
                tracing::debug!(
                    source = %change_set.source_anchor,
                    items = change_set.len(),
                    new_anchor = %anchor,
                    "applied change-set"
                );
                Ok(anchor)
            }
            Err(err) => {
                session.rollback().await?;
                Err(err)
            }
        }
    }

    async fn apply_inner<F>(
        &self,
        session: &mut (dyn SyncSession + '_),
        self_id: StoreId,
        change_set: &SyncChangeSet,
        on_conflict: &mut F,
    ) -> Result<SyncAnchor>
    where
        F: FnMut(&SyncItem) -> ConflictAction + Send,
    {
        let v_now = session.current_version().await?;
        let last_sync_version = change_set.target_anchor.version;
        let mut at_least_one_applied = false;

        for item in &change_set.items {
            let config = self.setup.find(&item.table).ok_or_else(|| {
                SyncError::InvalidArgument(format!(
                    "table '{}' is not configured for sync",
                    item.table
                ))
            })?;
            if !config.direction.downloads() {
                return Err(SyncError::InvalidArgument(format!(
                    "table '{}' is upload-only and cannot accept incoming changes",
                    item.table
                )));
            }

            let min_valid = session.min_valid_version(&item.table).await?;
            if last_sync_version < min_valid {
                return Err(SyncError::VersionTooOld {
                    table: item.table.to_string(),
                    version: last_sync_version,
                    min_valid,
                });
            }

            if self
                .apply_item(session, self_id, item, last_sync_version, on_conflict)
                .await?
            {
                at_least_one_applied = true;
            }
        }

        // Applies are themselves tracked writes; the bump keeps this store's
        // own transaction out of the next delta for this peer.
        let new_version = if at_least_one_applied {
            v_now + 1
        } else {
            v_now
        };
        session
            .record_anchor(change_set.source_anchor.store_id, new_version)
            .await?;

        Ok(SyncAnchor::new(self_id, new_version))
    }

    /// Drive one item through the conflict state machine. Returns whether a
    /// row was written.
    async fn apply_item<F>(
        &self,
        session: &mut (dyn SyncSession + '_),
        self_id: StoreId,
        item: &SyncItem,
        last_sync_version: Version,
        on_conflict: &mut F,
    ) -> Result<bool>
    where
        F: FnMut(&SyncItem) -> ConflictAction + Send,
    {
        let mut attempt = WriteAttempt::first(item.change_type);
        loop {
            let affected = match attempt.change_type {
                ChangeType::Insert => session.insert_row(item).await?,
                ChangeType::Update => {
                    session
                        .update_row(item, last_sync_version, attempt.force_write)
                        .await?
                }
                ChangeType::Delete => {
                    session
                        .delete_row(item, last_sync_version, attempt.force_write)
                        .await?
                }
            };
            if affected > 0 {
                return Ok(true);
            }

            match conflict::next_step(attempt, || on_conflict(item)) {
                NextStep::Retry(next) => attempt = next,
                NextStep::Skip => {
                    tracing::debug!(table = %item.table, change = %item.change_type, "conflicting item skipped");
                    return Ok(false);
                }
                NextStep::Abort => {
                    return Err(SyncError::InvalidSyncOperation {
                        suggested_anchor: SyncAnchor::new(self_id, last_sync_version + 1),
                    });
                }
            }
        }
    }
}
