//! Error types for the sync engine.

use crate::{StoreId, SyncAnchor, Version};
use thiserror::Error;

/// All possible errors surfaced by the sync engine.
///
/// Conflicts are not errors; they are resolved through the conflict policy.
/// Every error fails the enclosing transaction, so no partial application is
/// ever observable.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store is not initialized; provisioning has not run")]
    NotInitialized,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "anchor version {version} for table '{table}' is below the tracking \
         horizon {min_valid}; a full re-sync is required"
    )]
    VersionTooOld {
        table: String,
        version: Version,
        min_valid: Version,
    },

    #[error("change-set targets store {target}, not this store")]
    WrongTarget { target: StoreId },

    #[error("insert could not be applied and is not a duplicate; resume from {suggested_anchor}")]
    InvalidSyncOperation { suggested_anchor: SyncAnchor },

    #[error("store i/o error: {0}")]
    StoreIo(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl SyncError {
    /// Wrap a binding-level failure.
    ///
    /// Bindings route their driver errors through this constructor; the
    /// orphan rule keeps them from implementing `From` for foreign error
    /// types themselves.
    pub fn store(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        SyncError::StoreIo(err.into())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::InvalidArgument("peer store id must not be the zero id".into());
        assert_eq!(
            err.to_string(),
            "invalid argument: peer store id must not be the zero id"
        );

        let err = SyncError::VersionTooOld {
            table: "notes".into(),
            version: 3,
            min_valid: 9,
        };
        assert_eq!(
            err.to_string(),
            "anchor version 3 for table 'notes' is below the tracking horizon 9; \
             a full re-sync is required"
        );
    }

    #[test]
    fn store_wraps_any_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = SyncError::store(io);
        assert!(err.to_string().starts_with("store i/o error"));
        assert!(matches!(err, SyncError::StoreIo(_)));
    }
}
