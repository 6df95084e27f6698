//! Connection configuration.

use std::env;
use tandem_engine::{Result, SyncError};

/// Connection settings for a PostgreSQL-backed store.
///
/// The connection string must name a concrete database: anchors and change
/// tracking are per-database state, so a URL without a database component is
/// rejected up front.
#[derive(Debug, Clone)]
pub struct PgConfig {
    database_url: String,
}

impl PgConfig {
    /// Validate a connection string.
    pub fn new(database_url: impl Into<String>) -> Result<Self> {
        let database_url = database_url.into();
        if database_name(&database_url).is_none() {
            return Err(SyncError::InvalidConfig(
                "connection string does not name a database".into(),
            ));
        }
        Ok(Self { database_url })
    }

    /// Load the connection string from the `DATABASE_URL` environment
    /// variable.
    pub fn from_env() -> Result<Self> {
        let url = env::var("DATABASE_URL").map_err(|_| {
            SyncError::InvalidConfig("DATABASE_URL environment variable is required".into())
        })?;
        Self::new(url)
    }

    /// The validated connection string.
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// The database named by the connection string.
    pub fn database(&self) -> &str {
        database_name(&self.database_url).unwrap_or_default()
    }
}

/// Extract the database component of a `postgres://` URL, if any.
fn database_name(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map(|(_, rest)| rest)?;
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    let (_, db) = rest.split_once('/')?;
    if db.is_empty() || db.contains('/') {
        return None;
    }
    Some(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_url_with_database() {
        let config = PgConfig::new("postgres://user:pw@localhost:5432/app").unwrap();
        assert_eq!(config.database(), "app");
    }

    #[test]
    fn accepts_url_with_query_parameters() {
        let config = PgConfig::new("postgres://localhost/app?sslmode=disable").unwrap();
        assert_eq!(config.database(), "app");
    }

    #[test]
    fn rejects_url_without_database() {
        for url in [
            "postgres://localhost",
            "postgres://localhost/",
            "postgres://localhost/?sslmode=disable",
        ] {
            let err = PgConfig::new(url).unwrap_err();
            assert!(
                matches!(err, SyncError::InvalidConfig(_)),
                "expected rejection for {url}"
            );
        }
    }
}
