//! PostgreSQL store binding for the tandem sync engine.
//!
//! Implements the engine's store contract over `sqlx`: provisioning creates
//! the bookkeeping tables and a per-table change-tracking trigger, sessions
//! run under `REPEATABLE READ` (PostgreSQL's snapshot isolation), and the
//! row applier performs conflict-aware writes whose affected-row counts feed
//! the engine's conflict arbiter.
//!
//! All row values travel as JSON: reads go through `to_jsonb(table)`, writes
//! through `jsonb_populate_record`, so arbitrary column types round-trip
//! without per-type binding code and explicit SQL NULLs stay distinct from
//! absent columns.
//!
//! ```no_run
//! use tandem_engine::{SyncProvider, SyncSetup, TableConfig};
//! use tandem_postgres::{PgConfig, PgStoreBinding};
//!
//! # async fn demo() -> tandem_engine::Result<()> {
//! let config = PgConfig::new("postgres://localhost/app")?;
//! let binding = PgStoreBinding::connect(config).await?;
//! let setup = SyncSetup::new(vec![TableConfig::new("notes")])?;
//! let provider = SyncProvider::new(binding, setup);
//! provider.apply_provision().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod provision;
mod session;
mod sql;

pub use config::PgConfig;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tandem_engine::{
    Result, StoreBinding, StoreId, SyncError, SyncSession, TableConfig, TableRef,
};
use uuid::Uuid;

/// One row of the remote anchor registry, for host inspection.
#[derive(Debug, Clone)]
pub struct AnchorRow {
    /// The remote peer
    pub store_id: StoreId,
    /// Highest local version that peer has acknowledged
    pub version: i64,
    /// When the acknowledgment last moved
    pub updated_at: DateTime<Utc>,
}

/// A PostgreSQL-backed store.
pub struct PgStoreBinding {
    pool: PgPool,
}

impl PgStoreBinding {
    /// Connect to the database named by `config`.
    pub async fn connect(config: PgConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(config.database_url())
            .await
            .map_err(SyncError::store)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Discard change-tracking entries for `table` at or below `through` and
    /// raise the table's horizon accordingly.
    ///
    /// Retention maintenance: peers whose anchor falls below the new horizon
    /// must re-sync from an initial snapshot.
    pub async fn prune_changes(&self, table: &TableRef, through: i64) -> Result<()> {
        let table_key = table.to_string();
        let mut tx = self.pool.begin().await.map_err(SyncError::store)?;

        sqlx::query("DELETE FROM _tandem_changes WHERE table_key = $1 AND version <= $2")
            .bind(&table_key)
            .bind(through)
            .execute(&mut *tx)
            .await
            .map_err(SyncError::store)?;

        sqlx::query(
            r#"
            INSERT INTO _tandem_horizon (table_key, min_version)
            VALUES ($1, $2)
            ON CONFLICT (table_key) DO UPDATE
                SET min_version = GREATEST(_tandem_horizon.min_version, EXCLUDED.min_version)
            "#,
        )
        .bind(&table_key)
        .bind(through)
        .execute(&mut *tx)
        .await
        .map_err(SyncError::store)?;

        tx.commit().await.map_err(SyncError::store)?;
        tracing::info!(table = %table, through, "pruned change tracking");
        Ok(())
    }

    /// The remote anchor registry, for inspection.
    pub async fn anchors(&self) -> Result<Vec<AnchorRow>> {
        let rows: Vec<(Uuid, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT store_id, version, updated_at FROM _tandem_anchors ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(SyncError::store)?;

        Ok(rows
            .into_iter()
            .map(|(store_id, version, updated_at)| AnchorRow {
                store_id: StoreId::from_uuid(store_id),
                version,
                updated_at,
            })
            .collect())
    }
}

impl StoreBinding for PgStoreBinding {
    async fn apply_provision(&self, tables: &[TableConfig]) -> Result<StoreId> {
        provision::apply(&self.pool, tables).await
    }

    async fn remove_provision(&self, tables: &[TableConfig]) -> Result<()> {
        provision::remove(&self.pool, tables).await
    }

    async fn load_store_id(&self) -> Result<Option<StoreId>> {
        let provisioned: (bool,) =
            sqlx::query_as("SELECT to_regclass('_tandem_identity') IS NOT NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(SyncError::store)?;
        if !provisioned.0 {
            return Ok(None);
        }

        let row: Option<(Uuid,)> = sqlx::query_as("SELECT store_id FROM _tandem_identity")
            .fetch_optional(&self.pool)
            .await
            .map_err(SyncError::store)?;
        Ok(row.map(|(id,)| StoreId::from_uuid(id)))
    }

    async fn begin(&self) -> Result<Box<dyn SyncSession + '_>> {
        let mut tx = self.pool.begin().await.map_err(SyncError::store)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await
            .map_err(SyncError::store)?;
        Ok(Box::new(session::PgSyncSession::new(tx)))
    }
}
