//! Store identity and sync anchors.
//!
//! Anchors are the currency of incremental synchronization: a peer that holds
//! an anchor for a store can ask that store for everything that changed after
//! the anchor's version.

use crate::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A 128-bit opaque identifier naming one peer store.
///
/// Generated once when a store is provisioned and durably recorded there.
/// The all-zero id is reserved and never names a valid peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(Uuid);

impl StoreId {
    /// Generate a fresh random store id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The reserved all-zero id.
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Whether this is the reserved all-zero id.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Wrap an existing uuid.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying uuid.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for StoreId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A point in a store's history.
///
/// Anchors are value types: produced by the assembler and the applier,
/// carried inside change-sets, and handed between peers by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAnchor {
    /// The store whose history this anchor points into
    pub store_id: StoreId,
    /// The version within that store's history
    pub version: Version,
}

impl SyncAnchor {
    /// Create an anchor.
    pub fn new(store_id: StoreId, version: Version) -> Self {
        Self { store_id, version }
    }

    /// The anchor at the very beginning of a store's history.
    pub fn zero(store_id: StoreId) -> Self {
        Self {
            store_id,
            version: 0,
        }
    }
}

impl fmt::Display for SyncAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.store_id, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct() {
        let a = StoreId::generate();
        let b = StoreId::generate();
        assert_ne!(a, b);
        assert!(!a.is_nil());
    }

    #[test]
    fn nil_id_is_nil() {
        assert!(StoreId::nil().is_nil());
        assert_eq!(StoreId::nil(), StoreId::from_uuid(Uuid::nil()));
    }

    #[test]
    fn anchor_display() {
        let id = StoreId::from_uuid(Uuid::nil());
        let anchor = SyncAnchor::new(id, 42);
        assert_eq!(
            anchor.to_string(),
            "00000000-0000-0000-0000-000000000000@42"
        );
    }

    #[test]
    fn zero_anchor_starts_at_zero() {
        let anchor = SyncAnchor::zero(StoreId::generate());
        assert_eq!(anchor.version, 0);
    }

    #[test]
    fn serialization_roundtrip() {
        let anchor = SyncAnchor::new(StoreId::generate(), 7);
        let json = serde_json::to_string(&anchor).unwrap();
        let parsed: SyncAnchor = serde_json::from_str(&json).unwrap();
        assert_eq!(anchor, parsed);
    }

    #[test]
    fn serialization_format() {
        let anchor = SyncAnchor::new(StoreId::generate(), 7);
        let json = serde_json::to_string(&anchor).unwrap();
        assert!(json.contains("storeId")); // camelCase
        assert!(json.contains("version"));
    }
}
