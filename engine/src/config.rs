//! Table configuration for the sync setup.
//!
//! The setup is supplied once at construction and is immutable afterwards.
//! Validation happens at build time so a misconfigured table set never
//! reaches a store.

use crate::{error::Result, SyncError, TableName, TableRef};
use serde::{Deserialize, Serialize};

/// Which way rows of a table may travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncDirection {
    /// Local changes are sent to peers; incoming changes are refused
    UploadOnly,
    /// Incoming changes are applied; local changes are never sent
    DownloadOnly,
    /// Both directions (default)
    #[default]
    UploadAndDownload,
}

impl SyncDirection {
    /// Whether local changes of this table are included in outgoing sets.
    pub fn uploads(&self) -> bool {
        !matches!(self, SyncDirection::DownloadOnly)
    }

    /// Whether incoming changes for this table may be applied.
    pub fn downloads(&self) -> bool {
        !matches!(self, SyncDirection::UploadOnly)
    }
}

/// Per-tracked-table metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableConfig {
    /// Logical table name
    pub name: TableName,
    /// Schema namespace, if the store has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Which way rows may travel
    pub direction: SyncDirection,
    /// Leave this table out of the initial change-set for a new peer
    pub skip_initial_snapshot: bool,
    /// Record-type descriptor consumed by higher layers; opaque to the engine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,
}

impl TableConfig {
    /// Configure a table with the default direction and no schema.
    pub fn new(name: impl Into<TableName>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            direction: SyncDirection::default(),
            skip_initial_snapshot: false,
            record_type: None,
        }
    }

    /// Set the schema namespace.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Set the sync direction.
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Exclude this table from initial snapshots.
    pub fn skip_initial_snapshot(mut self) -> Self {
        self.skip_initial_snapshot = true;
        self
    }

    /// Attach a record-type descriptor for higher layers.
    pub fn with_record_type(mut self, record_type: impl Into<String>) -> Self {
        self.record_type = Some(record_type.into());
        self
    }

    /// The table reference this config describes.
    pub fn table_ref(&self) -> TableRef {
        TableRef {
            name: self.name.clone(),
            schema: self.schema.clone(),
        }
    }
}

/// The validated, ordered collection of tracked tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSetup {
    tables: Vec<TableConfig>,
}

impl SyncSetup {
    /// Build a setup from table configs.
    ///
    /// Names are trimmed; empty and duplicate `(schema, name)` pairs are
    /// rejected.
    pub fn new(tables: Vec<TableConfig>) -> Result<Self> {
        let mut seen = Vec::with_capacity(tables.len());
        let mut normalized = Vec::with_capacity(tables.len());

        for mut table in tables {
            table.name = table.name.trim().to_string();
            if table.name.is_empty() {
                return Err(SyncError::InvalidArgument(
                    "table name must not be empty".into(),
                ));
            }
            let key = (table.schema.clone(), table.name.clone());
            if seen.contains(&key) {
                return Err(SyncError::InvalidArgument(format!(
                    "duplicate table '{}' in sync setup",
                    table.table_ref()
                )));
            }
            seen.push(key);
            normalized.push(table);
        }

        Ok(Self { tables: normalized })
    }

    /// The configured tables, in declaration order.
    pub fn tables(&self) -> &[TableConfig] {
        &self.tables
    }

    /// Look up the config for a table reference.
    pub fn find(&self, table: &TableRef) -> Option<&TableConfig> {
        self.tables
            .iter()
            .find(|t| t.name == table.name && t.schema == table.schema)
    }

    /// Number of configured tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether no tables are configured.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_defaults() {
        let setup = SyncSetup::new(vec![TableConfig::new("notes")]).unwrap();
        let table = &setup.tables()[0];
        assert_eq!(table.direction, SyncDirection::UploadAndDownload);
        assert!(!table.skip_initial_snapshot);
        assert_eq!(table.schema, None);
    }

    #[test]
    fn trims_names() {
        let setup = SyncSetup::new(vec![TableConfig::new("  notes ")]).unwrap();
        assert_eq!(setup.tables()[0].name, "notes");
    }

    #[test]
    fn rejects_empty_name() {
        let err = SyncSetup::new(vec![TableConfig::new("   ")]).unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_duplicates() {
        let err = SyncSetup::new(vec![TableConfig::new("notes"), TableConfig::new("notes")])
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));
    }

    #[test]
    fn same_name_in_different_schemas_is_allowed() {
        let setup = SyncSetup::new(vec![
            TableConfig::new("notes").with_schema("a"),
            TableConfig::new("notes").with_schema("b"),
        ])
        .unwrap();
        assert_eq!(setup.len(), 2);
    }

    #[test]
    fn find_matches_schema_and_name() {
        let setup = SyncSetup::new(vec![
            TableConfig::new("notes"),
            TableConfig::new("notes").with_schema("app"),
        ])
        .unwrap();

        let plain = setup.find(&TableRef::new("notes")).unwrap();
        assert_eq!(plain.schema, None);

        let qualified = setup.find(&TableRef::with_schema("app", "notes")).unwrap();
        assert_eq!(qualified.schema.as_deref(), Some("app"));

        assert!(setup.find(&TableRef::new("missing")).is_none());
    }

    #[test]
    fn direction_predicates() {
        assert!(SyncDirection::UploadAndDownload.uploads());
        assert!(SyncDirection::UploadAndDownload.downloads());
        assert!(SyncDirection::UploadOnly.uploads());
        assert!(!SyncDirection::UploadOnly.downloads());
        assert!(!SyncDirection::DownloadOnly.uploads());
        assert!(SyncDirection::DownloadOnly.downloads());
    }
}
