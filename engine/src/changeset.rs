//! Change-set types exchanged between peers.
//!
//! A change-set is assembled by the source store and applied by the target
//! store in a single transaction. It is the in-memory contract between the
//! engine and whatever transport the host chooses; transports must preserve
//! it faithfully, including the distinction between an explicit null value
//! and an absent column.

use crate::{RowValues, SyncAnchor, TableName};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a user table, optionally schema-qualified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRef {
    /// Logical table name
    pub name: TableName,
    /// Schema namespace, if the store has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl TableRef {
    /// Reference a table by name alone.
    pub fn new(name: impl Into<TableName>) -> Self {
        Self {
            name: name.into(),
            schema: None,
        }
    }

    /// Reference a schema-qualified table.
    pub fn with_schema(schema: impl Into<String>, name: impl Into<TableName>) -> Self {
        Self {
            name: name.into(),
            schema: Some(schema.into()),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// The semantic kind of a row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// A row that does not exist on the receiver yet
    Insert,
    /// New values for a row the receiver already has
    Update,
    /// Removal of a row the receiver has
    Delete,
}

impl ChangeType {
    /// Single-letter operation code, as change-tracking facilities record it.
    pub fn code(&self) -> char {
        match self {
            ChangeType::Insert => 'I',
            ChangeType::Update => 'U',
            ChangeType::Delete => 'D',
        }
    }

    /// Parse a single-letter operation code.
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'I' => Some(ChangeType::Insert),
            'U' => Some(ChangeType::Update),
            'D' => Some(ChangeType::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Insert => write!(f, "insert"),
            ChangeType::Update => write!(f, "update"),
            ChangeType::Delete => write!(f, "delete"),
        }
    }
}

/// A single row mutation within a change-set.
///
/// `values` always carries the primary-key columns. Inserts and updates
/// additionally carry every non-key column; deletes only need the key.
/// A `Value::Null` entry is an explicit SQL NULL; a column missing from the
/// map is not carried at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
    /// The table this row belongs to
    pub table: TableRef,
    /// Kind of mutation
    pub change_type: ChangeType,
    /// Column values keyed by column name
    pub values: RowValues,
}

impl SyncItem {
    /// Create an item.
    pub fn new(table: TableRef, change_type: ChangeType, values: RowValues) -> Self {
        Self {
            table,
            change_type,
            values,
        }
    }

    /// Look up a carried column value. `None` means the column is absent,
    /// which is different from a carried null.
    pub fn value(&self, column: &str) -> Option<&serde_json::Value> {
        self.values.get(column)
    }
}

/// The atomic unit exchanged between peers.
///
/// `source_anchor` names the producing store at the version the set was
/// assembled. `target_anchor` names the receiving store, with the version of
/// the *source* that the receiver last acknowledged; the items cover the open
/// interval `(target_anchor.version, source_anchor.version]`. Items are
/// grouped by table but otherwise unordered within a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChangeSet {
    /// Where the producing store is now
    pub source_anchor: SyncAnchor,
    /// What the receiving store last acknowledged
    pub target_anchor: SyncAnchor,
    /// Row mutations, applied in order
    pub items: Vec<SyncItem>,
}

impl SyncChangeSet {
    /// Create an empty change-set between two anchors.
    pub fn new(source_anchor: SyncAnchor, target_anchor: SyncAnchor) -> Self {
        Self {
            source_anchor,
            target_anchor,
            items: Vec::new(),
        }
    }

    /// Number of row mutations carried.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the set carries no mutations. An empty set is still worth
    /// applying: it refreshes the receiver's acknowledgment anchor.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
