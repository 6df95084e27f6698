//! # Tandem Engine
//!
//! Protocol core for bidirectional row-level synchronization between peer
//! relational stores.
//!
//! Every participating store keeps an independent copy of a set of tables and
//! a monotonically increasing version counter that advances whenever a tracked
//! row changes. There is no central authority: any pair of peers can
//! reconcile by exchanging change-sets.
//!
//! ## Core Concepts
//!
//! ### Anchors
//!
//! A [`SyncAnchor`] is a `(StoreId, Version)` pair marking a point in one
//! store's history. A store remembers, per remote peer, the highest local
//! version that peer has acknowledged; that anchor is the base of the next
//! incremental change-set.
//!
//! ### Change-sets
//!
//! A [`SyncChangeSet`] is the atomic unit exchanged between peers: a source
//! anchor (where the producing store is now), a target anchor (what the
//! receiving store last acknowledged), and an ordered list of [`SyncItem`]
//! row mutations. A change-set is applied in a single snapshot-isolated
//! transaction or not at all.
//!
//! ### Conflicts
//!
//! An incoming update or delete whose target row changed locally after the
//! change-set's target anchor shows up as zero affected rows under the
//! binding's version-predicate writes. Resolution is delegated to a
//! caller-supplied policy returning [`ConflictAction`]; the default keeps
//! the local row.
//!
//! ### Store bindings
//!
//! The engine never talks to a database directly. A [`StoreBinding`] adapts
//! one concrete store: provisioning, a change-tracking oracle, a
//! conflict-aware row applier, and the durable anchor registry. The crate
//! ships [`MemoryBinding`], a complete in-memory binding used by the
//! integration tests; `tandem-postgres` provides the PostgreSQL one.
//!
//! ## Quick Start
//!
//! ```rust
//! use tandem_engine::{
//!     MemoryBinding, MemoryTableDef, SyncProvider, SyncSetup, TableConfig, TableRef,
//! };
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tandem_engine::Result<()> {
//! // 1. Describe the tracked tables
//! let setup = SyncSetup::new(vec![TableConfig::new("notes")])?;
//!
//! // 2. Bind a store (here: in-memory) and provision it
//! let binding = MemoryBinding::new(vec![MemoryTableDef::new(
//!     TableRef::new("notes"),
//!     ["id"],
//! )]);
//! let provider = SyncProvider::new(binding, setup);
//! provider.apply_provision().await?;
//!
//! // 3. Write locally, then ask for the delta a peer should receive
//! provider.binding().insert_local(
//!     &TableRef::new("notes"),
//!     [("id", json!(1)), ("body", json!("hello"))],
//! )?;
//! let peer = tandem_engine::StoreId::generate();
//! let change_set = provider.get_changes(peer).await?;
//! assert_eq!(change_set.items.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod anchor;
pub mod binding;
pub mod changeset;
pub mod config;
pub mod conflict;
pub mod error;
pub mod memory;
pub mod provider;

// Re-export main types at crate root
pub use anchor::{StoreId, SyncAnchor};
pub use binding::{RowChange, StoreBinding, SyncSession};
pub use changeset::{ChangeType, SyncChangeSet, SyncItem, TableRef};
pub use config::{SyncDirection, SyncSetup, TableConfig};
pub use conflict::ConflictAction;
pub use error::{Result, SyncError};
pub use memory::{MemoryBinding, MemoryTableDef};
pub use provider::SyncProvider;

/// Type aliases for clarity
pub type Version = u64;
pub type TableName = String;
pub type ColumnName = String;
pub type RowValues = std::collections::BTreeMap<ColumnName, serde_json::Value>;
