//! In-memory store binding.
//!
//! A complete [`StoreBinding`] over plain maps, with real change tracking:
//! every committed transaction gets one version from a store-wide counter,
//! and a net change entry is kept per row. Sessions are snapshot-isolated by
//! copy-on-write: a session clones the shared state, works on the clone,
//! and swaps it back on commit. The integration tests drive the full
//! protocol through this binding; it also serves as executable documentation
//! of the binding contract.
//!
//! Concurrent sessions never observe partial work, but the last committer
//! wins; serializing writers is the job of a real store's transaction
//! manager, not of this test double.

use crate::{
    binding::{RowChange, StoreBinding, SyncSession},
    changeset::{ChangeType, SyncItem, TableRef},
    config::TableConfig,
    error::{Result, SyncError},
    ColumnName, RowValues, StoreId, Version,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Definition of one table in the memory store: its reference and which
/// columns form the primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryTableDef {
    /// The table this definition describes
    pub table: TableRef,
    /// Primary-key column names
    pub key_columns: Vec<ColumnName>,
}

impl MemoryTableDef {
    /// Define a table with the given key columns.
    pub fn new<I, K>(table: TableRef, key_columns: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<ColumnName>,
    {
        Self {
            table,
            key_columns: key_columns.into_iter().map(Into::into).collect(),
        }
    }
}

/// Canonical string form of a row's key columns.
type RowKey = String;

/// Net change record for one row.
#[derive(Debug, Clone)]
struct ChangeEntry {
    /// Key column values, kept so deletes can still name the row
    key: RowValues,
    /// Version at which the row's current incarnation appeared; reset when
    /// a tracked delete is followed by a reinsert
    created_version: Version,
    /// Version of the latest change
    version: Version,
    /// Whether the latest change removed the row
    deleted: bool,
}

#[derive(Debug, Clone, Default)]
struct TrackedTable {
    rows: BTreeMap<RowKey, RowValues>,
    changes: BTreeMap<RowKey, ChangeEntry>,
    min_valid: Version,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    store_id: Option<StoreId>,
    version: Version,
    tables: BTreeMap<String, TrackedTable>,
    anchors: BTreeMap<StoreId, Version>,
}

impl MemoryState {
    fn table(&self, table: &TableRef) -> Result<&TrackedTable> {
        self.tables
            .get(&table.to_string())
            .ok_or_else(|| SyncError::InvalidArgument(format!("table '{table}' is not tracked")))
    }

    fn table_mut(&mut self, table: &TableRef) -> Result<&mut TrackedTable> {
        self.tables
            .get_mut(&table.to_string())
            .ok_or_else(|| SyncError::InvalidArgument(format!("table '{table}' is not tracked")))
    }
}

/// Extract the key columns of `values` per `def`, producing the canonical
/// row key and the key-only value map.
fn row_key(def: &MemoryTableDef, values: &RowValues) -> Result<(RowKey, RowValues)> {
    let mut key_values = RowValues::new();
    for column in &def.key_columns {
        let value = values.get(column).ok_or_else(|| {
            SyncError::InvalidArgument(format!(
                "missing key column '{}' for table '{}'",
                column, def.table
            ))
        })?;
        key_values.insert(column.clone(), value.clone());
    }
    // BTreeMap ordering makes the serialized key deterministic.
    let key = serde_json::to_string(&key_values).map_err(SyncError::store)?;
    Ok((key, key_values))
}

/// Row mutations against a state. `predicate` carries the last-sync version
/// for conflict-guarded writes; `None` writes unconditionally.
mod mutate {
    use super::*;

    pub(super) fn insert(
        state: &mut MemoryState,
        def: &MemoryTableDef,
        values: RowValues,
        version: Version,
    ) -> Result<u64> {
        let (key, key_values) = row_key(def, &values)?;
        let table = state.table_mut(&def.table)?;
        if table.rows.contains_key(&key) {
            return Ok(0);
        }
        table.rows.insert(key.clone(), values);
        match table.changes.get_mut(&key) {
            // Re-created after a tracked delete: the row is born again at
            // this version, so anchors past the delete net it to an insert.
            Some(entry) => {
                entry.created_version = version;
                entry.version = version;
                entry.deleted = false;
            }
            None => {
                table.changes.insert(
                    key,
                    ChangeEntry {
                        key: key_values,
                        created_version: version,
                        version,
                        deleted: false,
                    },
                );
            }
        }
        Ok(1)
    }

    pub(super) fn update(
        state: &mut MemoryState,
        def: &MemoryTableDef,
        values: &RowValues,
        predicate: Option<Version>,
        version: Version,
    ) -> Result<u64> {
        let (key, key_values) = row_key(def, values)?;
        let table = state.table_mut(&def.table)?;
        if !table.rows.contains_key(&key) {
            return Ok(0);
        }
        if let (Some(last_sync), Some(entry)) = (predicate, table.changes.get(&key)) {
            if entry.version > last_sync {
                return Ok(0);
            }
        }
        let Some(row) = table.rows.get_mut(&key) else {
            return Ok(0);
        };
        for (column, value) in values {
            row.insert(column.clone(), value.clone());
        }
        match table.changes.get_mut(&key) {
            Some(entry) => entry.version = version,
            // The entry was compacted away; the row predates the horizon.
            None => {
                table.changes.insert(
                    key,
                    ChangeEntry {
                        key: key_values,
                        created_version: 0,
                        version,
                        deleted: false,
                    },
                );
            }
        }
        Ok(1)
    }

    pub(super) fn delete(
        state: &mut MemoryState,
        def: &MemoryTableDef,
        values: &RowValues,
        predicate: Option<Version>,
        version: Version,
    ) -> Result<u64> {
        let (key, key_values) = row_key(def, values)?;
        let table = state.table_mut(&def.table)?;
        if !table.rows.contains_key(&key) {
            return Ok(0);
        }
        if let (Some(last_sync), Some(entry)) = (predicate, table.changes.get(&key)) {
            if entry.version > last_sync {
                return Ok(0);
            }
        }
        table.rows.remove(&key);
        match table.changes.get_mut(&key) {
            Some(entry) => {
                entry.deleted = true;
                entry.version = version;
            }
            None => {
                table.changes.insert(
                    key,
                    ChangeEntry {
                        key: key_values,
                        created_version: 0,
                        version,
                        deleted: true,
                    },
                );
            }
        }
        Ok(1)
    }
}

/// An in-memory store with row-level change tracking.
#[derive(Clone)]
pub struct MemoryBinding {
    defs: Arc<Vec<MemoryTableDef>>,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBinding {
    /// Create a store over the given table definitions.
    pub fn new(defs: Vec<MemoryTableDef>) -> Self {
        Self {
            defs: Arc::new(defs),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    fn def(&self, table: &TableRef) -> Result<&MemoryTableDef> {
        self.defs
            .iter()
            .find(|d| d.table == *table)
            .ok_or_else(|| SyncError::InvalidArgument(format!("table '{table}' is not defined")))
    }

    fn collect<I, K>(values: I) -> RowValues
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<ColumnName>,
    {
        values.into_iter().map(|(k, v)| (k.into(), v)).collect()
    }

    /// Insert a row as a local application write (its own transaction).
    pub fn insert_local<I, K>(&self, table: &TableRef, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<ColumnName>,
    {
        let def = self.def(table)?;
        let mut state = self.state.lock();
        let version = state.version + 1;
        if mutate::insert(&mut state, def, Self::collect(values), version)? == 0 {
            return Err(SyncError::InvalidArgument(format!(
                "row already exists in '{table}'"
            )));
        }
        state.version = version;
        Ok(())
    }

    /// Update a row as a local application write.
    pub fn update_local<I, K>(&self, table: &TableRef, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<ColumnName>,
    {
        let def = self.def(table)?;
        let mut state = self.state.lock();
        let version = state.version + 1;
        if mutate::update(&mut state, def, &Self::collect(values), None, version)? == 0 {
            return Err(SyncError::InvalidArgument(format!(
                "no such row in '{table}'"
            )));
        }
        state.version = version;
        Ok(())
    }

    /// Delete a row as a local application write. `key_values` needs the key
    /// columns only.
    pub fn delete_local<I, K>(&self, table: &TableRef, key_values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<ColumnName>,
    {
        let def = self.def(table)?;
        let mut state = self.state.lock();
        let version = state.version + 1;
        if mutate::delete(&mut state, def, &Self::collect(key_values), None, version)? == 0 {
            return Err(SyncError::InvalidArgument(format!(
                "no such row in '{table}'"
            )));
        }
        state.version = version;
        Ok(())
    }

    /// Current rows of a table, in key order.
    pub fn rows(&self, table: &TableRef) -> Result<Vec<RowValues>> {
        let state = self.state.lock();
        Ok(state.table(table)?.rows.values().cloned().collect())
    }

    /// The store-wide version counter.
    pub fn current_version(&self) -> Version {
        self.state.lock().version
    }

    /// Discard change entries at or below `version` and raise the table's
    /// tracking horizon accordingly, as retention cleanup would.
    pub fn compact_through(&self, table: &TableRef, version: Version) -> Result<()> {
        let mut state = self.state.lock();
        let tracked = state.table_mut(table)?;
        tracked.changes.retain(|_, entry| entry.version > version);
        tracked.min_valid = tracked.min_valid.max(version);
        Ok(())
    }
}

impl StoreBinding for MemoryBinding {
    async fn apply_provision(&self, tables: &[TableConfig]) -> Result<StoreId> {
        let mut state = self.state.lock();
        for config in tables {
            let table_ref = config.table_ref();
            if !self.defs.iter().any(|d| d.table == table_ref) {
                return Err(SyncError::InvalidConfig(format!(
                    "no table definition for '{table_ref}'"
                )));
            }
            state.tables.entry(table_ref.to_string()).or_default();
        }
        let id = *state.store_id.get_or_insert_with(StoreId::generate);
        Ok(id)
    }

    async fn remove_provision(&self, tables: &[TableConfig]) -> Result<()> {
        let mut state = self.state.lock();
        for config in tables {
            if let Some(tracked) = state.tables.get_mut(&config.table_ref().to_string()) {
                tracked.changes.clear();
                tracked.min_valid = 0;
            }
        }
        Ok(())
    }

    async fn load_store_id(&self) -> Result<Option<StoreId>> {
        Ok(self.state.lock().store_id)
    }

    async fn begin(&self) -> Result<Box<dyn SyncSession + '_>> {
        let staged = self.state.lock().clone();
        let txn_version = staged.version + 1;
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.state),
            defs: Arc::clone(&self.defs),
            staged,
            txn_version,
            rows_dirty: false,
        }))
    }
}

/// A copy-on-write session over a [`MemoryBinding`].
struct MemorySession {
    shared: Arc<Mutex<MemoryState>>,
    defs: Arc<Vec<MemoryTableDef>>,
    staged: MemoryState,
    /// The one version this session's row writes will commit under
    txn_version: Version,
    rows_dirty: bool,
}

impl MemorySession {
    fn def(&self, table: &TableRef) -> Result<&MemoryTableDef> {
        self.defs
            .iter()
            .find(|d| d.table == *table)
            .ok_or_else(|| SyncError::InvalidArgument(format!("table '{table}' is not defined")))
    }
}

#[async_trait]
impl SyncSession for MemorySession {
    async fn current_version(&mut self) -> Result<Version> {
        Ok(self.staged.version)
    }

    async fn min_valid_version(&mut self, table: &TableRef) -> Result<Version> {
        Ok(self.staged.table(table)?.min_valid)
    }

    async fn changes_since(&mut self, table: &TableRef, since: Version) -> Result<Vec<RowChange>> {
        let tracked = self.staged.table(table)?;
        if since < tracked.min_valid {
            return Err(SyncError::VersionTooOld {
                table: table.to_string(),
                version: since,
                min_valid: tracked.min_valid,
            });
        }

        let mut changes = Vec::new();
        for (key, entry) in &tracked.changes {
            if entry.version <= since {
                continue;
            }
            if entry.deleted {
                // Created and deleted within the window nets to nothing.
                if entry.created_version <= since {
                    changes.push(RowChange::new(ChangeType::Delete, entry.key.clone()));
                }
            } else if let Some(row) = tracked.rows.get(key) {
                let change_type = if entry.created_version > since {
                    ChangeType::Insert
                } else {
                    ChangeType::Update
                };
                changes.push(RowChange::new(change_type, row.clone()));
            }
        }
        Ok(changes)
    }

    async fn initial_snapshot(&mut self, table: &TableRef) -> Result<Vec<RowValues>> {
        Ok(self.staged.table(table)?.rows.values().cloned().collect())
    }

    async fn insert_row(&mut self, item: &SyncItem) -> Result<u64> {
        let def = self.def(&item.table)?.clone();
        let affected = mutate::insert(
            &mut self.staged,
            &def,
            item.values.clone(),
            self.txn_version,
        )?;
        self.rows_dirty |= affected > 0;
        Ok(affected)
    }

    async fn update_row(
        &mut self,
        item: &SyncItem,
        last_sync_version: Version,
        force_write: bool,
    ) -> Result<u64> {
        let def = self.def(&item.table)?.clone();
        let predicate = (!force_write).then_some(last_sync_version);
        let affected = mutate::update(
            &mut self.staged,
            &def,
            &item.values,
            predicate,
            self.txn_version,
        )?;
        self.rows_dirty |= affected > 0;
        Ok(affected)
    }

    async fn delete_row(
        &mut self,
        item: &SyncItem,
        last_sync_version: Version,
        force_write: bool,
    ) -> Result<u64> {
        let def = self.def(&item.table)?.clone();
        let predicate = (!force_write).then_some(last_sync_version);
        let affected = mutate::delete(
            &mut self.staged,
            &def,
            &item.values,
            predicate,
            self.txn_version,
        )?;
        self.rows_dirty |= affected > 0;
        Ok(affected)
    }

    async fn last_anchor_of(&mut self, peer: StoreId) -> Result<Option<Version>> {
        Ok(self.staged.anchors.get(&peer).copied())
    }

    async fn record_anchor(&mut self, peer: StoreId, version: Version) -> Result<()> {
        self.staged.anchors.insert(peer, version);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut staged = self.staged;
        if self.rows_dirty {
            staged.version = self.txn_version;
        }
        *self.shared.lock() = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notes() -> TableRef {
        TableRef::new("notes")
    }

    fn binding() -> MemoryBinding {
        let binding = MemoryBinding::new(vec![MemoryTableDef::new(notes(), ["id"])]);
        let configs = vec![TableConfig::new("notes")];
        futures_block(binding.apply_provision(&configs)).unwrap();
        binding
    }

    /// The memory binding never actually suspends, so a thread-blocking
    /// executor shim keeps the unit tests synchronous.
    fn futures_block<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }

    #[test]
    fn local_writes_advance_version_per_transaction() {
        let b = binding();
        b.insert_local(&notes(), [("id", json!(1)), ("body", json!("a"))])
            .unwrap();
        b.insert_local(&notes(), [("id", json!(2)), ("body", json!("b"))])
            .unwrap();
        assert_eq!(b.current_version(), 2);
        b.update_local(&notes(), [("id", json!(1)), ("body", json!("a2"))])
            .unwrap();
        assert_eq!(b.current_version(), 3);
    }

    #[test]
    fn duplicate_local_insert_is_rejected() {
        let b = binding();
        b.insert_local(&notes(), [("id", json!(1))]).unwrap();
        let err = b.insert_local(&notes(), [("id", json!(1))]).unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));
    }

    #[test]
    fn insert_then_update_nets_to_insert() {
        let b = binding();
        b.insert_local(&notes(), [("id", json!(1)), ("body", json!("a"))])
            .unwrap();
        b.update_local(&notes(), [("id", json!(1)), ("body", json!("a2"))])
            .unwrap();

        let mut session = futures_block(b.begin()).unwrap();
        let changes = futures_block(session.changes_since(&notes(), 0)).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Insert);
        assert_eq!(changes[0].values.get("body"), Some(&json!("a2")));
    }

    #[test]
    fn update_after_baseline_nets_to_update() {
        let b = binding();
        b.insert_local(&notes(), [("id", json!(1)), ("body", json!("a"))])
            .unwrap();
        let baseline = b.current_version();
        b.update_local(&notes(), [("id", json!(1)), ("body", json!("a2"))])
            .unwrap();

        let mut session = futures_block(b.begin()).unwrap();
        let changes = futures_block(session.changes_since(&notes(), baseline)).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Update);
    }

    #[test]
    fn insert_then_delete_nets_to_nothing() {
        let b = binding();
        let baseline = b.current_version();
        b.insert_local(&notes(), [("id", json!(1))]).unwrap();
        b.delete_local(&notes(), [("id", json!(1))]).unwrap();

        let mut session = futures_block(b.begin()).unwrap();
        let changes = futures_block(session.changes_since(&notes(), baseline)).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn reinsert_after_delete_nets_to_insert() {
        let b = binding();
        b.insert_local(&notes(), [("id", json!(1)), ("body", json!("a"))])
            .unwrap();
        b.delete_local(&notes(), [("id", json!(1))]).unwrap();
        let after_delete = b.current_version();
        b.insert_local(&notes(), [("id", json!(1)), ("body", json!("b"))])
            .unwrap();

        // An anchor at the delete has no row; the reinsert must not be
        // classified as an update against it.
        let mut session = futures_block(b.begin()).unwrap();
        let changes = futures_block(session.changes_since(&notes(), after_delete)).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Insert);
        assert_eq!(changes[0].values.get("body"), Some(&json!("b")));
    }

    #[test]
    fn delete_of_old_row_nets_to_delete() {
        let b = binding();
        b.insert_local(&notes(), [("id", json!(1))]).unwrap();
        let baseline = b.current_version();
        b.delete_local(&notes(), [("id", json!(1))]).unwrap();

        let mut session = futures_block(b.begin()).unwrap();
        let changes = futures_block(session.changes_since(&notes(), baseline)).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Delete);
        assert_eq!(changes[0].values.get("id"), Some(&json!(1)));
    }

    #[test]
    fn compaction_raises_horizon() {
        let b = binding();
        b.insert_local(&notes(), [("id", json!(1))]).unwrap();
        b.compact_through(&notes(), 1).unwrap();

        let mut session = futures_block(b.begin()).unwrap();
        assert_eq!(
            futures_block(session.min_valid_version(&notes())).unwrap(),
            1
        );
        let err = futures_block(session.changes_since(&notes(), 0)).unwrap_err();
        assert!(matches!(err, SyncError::VersionTooOld { .. }));
    }

    #[test]
    fn version_predicate_detects_concurrent_change() {
        let b = binding();
        b.insert_local(&notes(), [("id", json!(1)), ("body", json!("a"))])
            .unwrap();
        let seen = b.current_version(); // 1
        b.update_local(&notes(), [("id", json!(1)), ("body", json!("local"))])
            .unwrap(); // version 2 > seen

        let item = SyncItem::new(
            notes(),
            ChangeType::Update,
            [
                ("id".to_string(), json!(1)),
                ("body".to_string(), json!("remote")),
            ]
            .into_iter()
            .collect(),
        );

        let mut session = futures_block(b.begin()).unwrap();
        assert_eq!(
            futures_block(session.update_row(&item, seen, false)).unwrap(),
            0
        );
        // Forcing overrides the predicate.
        assert_eq!(
            futures_block(session.update_row(&item, seen, true)).unwrap(),
            1
        );
    }

    #[test]
    fn sessions_are_snapshot_isolated() {
        let b = binding();
        b.insert_local(&notes(), [("id", json!(1))]).unwrap();

        let mut session = futures_block(b.begin()).unwrap();
        // A write lands after the snapshot was taken.
        b.insert_local(&notes(), [("id", json!(2))]).unwrap();

        let snapshot = futures_block(session.initial_snapshot(&notes())).unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn uncommitted_sessions_leave_no_trace() {
        let b = binding();
        let item = SyncItem::new(
            notes(),
            ChangeType::Insert,
            [("id".to_string(), json!(7))].into_iter().collect(),
        );

        let mut session = futures_block(b.begin()).unwrap();
        assert_eq!(futures_block(session.insert_row(&item)).unwrap(), 1);
        futures_block(session.rollback()).unwrap();

        assert!(b.rows(&notes()).unwrap().is_empty());
        assert_eq!(b.current_version(), 0);
    }

    #[test]
    fn committed_session_bumps_version_once() {
        let b = binding();
        let mut session = futures_block(b.begin()).unwrap();
        for id in [1, 2, 3] {
            let item = SyncItem::new(
                notes(),
                ChangeType::Insert,
                [("id".to_string(), json!(id))].into_iter().collect(),
            );
            assert_eq!(futures_block(session.insert_row(&item)).unwrap(), 1);
        }
        futures_block(session.commit()).unwrap();

        // Three rows, one transaction, one version.
        assert_eq!(b.rows(&notes()).unwrap().len(), 3);
        assert_eq!(b.current_version(), 1);
    }

    #[test]
    fn provisioning_is_idempotent_and_identity_is_stable() {
        let b = binding();
        let configs = vec![TableConfig::new("notes")];
        let first = futures_block(b.apply_provision(&configs)).unwrap();
        let second = futures_block(b.apply_provision(&configs)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn remove_provision_keeps_rows_and_identity() {
        let b = binding();
        let id = futures_block(b.load_store_id()).unwrap().unwrap();
        b.insert_local(&notes(), [("id", json!(1))]).unwrap();
        let configs = vec![TableConfig::new("notes")];
        futures_block(b.remove_provision(&configs)).unwrap();

        assert_eq!(b.rows(&notes()).unwrap().len(), 1);
        assert_eq!(futures_block(b.load_store_id()).unwrap(), Some(id));
        // A later provision resumes under the same identity.
        assert_eq!(futures_block(b.apply_provision(&configs)).unwrap(), id);
    }
}
