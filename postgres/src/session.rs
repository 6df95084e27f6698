//! The snapshot-isolated session: oracle reads, conflict-aware writes, and
//! the anchor registry, all inside one `REPEATABLE READ` transaction.

use crate::{provision, sql};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use tandem_engine::{
    ChangeType, Result, RowChange, RowValues, StoreId, SyncError, SyncItem, SyncSession, TableRef,
    Version,
};

pub(crate) struct PgSyncSession {
    tx: Transaction<'static, Postgres>,
    /// Key columns discovered this session; never outlives the call.
    key_cache: HashMap<String, Vec<String>>,
}

impl PgSyncSession {
    pub(crate) fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self {
            tx,
            key_cache: HashMap::new(),
        }
    }

    async fn key_columns(&mut self, table: &TableRef) -> Result<Vec<String>> {
        let key = table.to_string();
        if let Some(columns) = self.key_cache.get(&key) {
            return Ok(columns.clone());
        }
        let columns = provision::key_columns(&mut *self.tx, table).await?;
        self.key_cache.insert(key, columns.clone());
        Ok(columns)
    }
}

/// A `to_jsonb` row as a column-value map.
fn object_to_values(value: Value) -> Result<RowValues> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(SyncError::store(format!(
            "expected a json object row, got {other}"
        ))),
    }
}

#[async_trait]
impl SyncSession for PgSyncSession {
    async fn current_version(&mut self) -> Result<Version> {
        // The horizon keeps the counter from regressing after pruning
        // empties the change table.
        let (version,): (i64,) = sqlx::query_as(
            r#"
            SELECT GREATEST(
                COALESCE((SELECT MAX(version) FROM _tandem_changes), 0),
                COALESCE((SELECT MAX(min_version) FROM _tandem_horizon), 0))
            "#,
        )
        .fetch_one(&mut *self.tx)
        .await
        .map_err(SyncError::store)?;
        Ok(version as Version)
    }

    async fn min_valid_version(&mut self, table: &TableRef) -> Result<Version> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT min_version FROM _tandem_horizon WHERE table_key = $1")
                .bind(table.to_string())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(SyncError::store)?;
        Ok(row.map(|(v,)| v as Version).unwrap_or(0))
    }

    async fn changes_since(&mut self, table: &TableRef, since: Version) -> Result<Vec<RowChange>> {
        let min_valid = self.min_valid_version(table).await?;
        if since < min_valid {
            return Err(SyncError::VersionTooOld {
                table: table.to_string(),
                version: since,
                min_valid,
            });
        }

        let query = format!(
            r#"
            SELECT c.row_key, c.first_version, c.deleted, to_jsonb(t) AS row_data
            FROM _tandem_changes c
            LEFT JOIN {table_ident} t ON to_jsonb(t) @> c.row_key
            WHERE c.table_key = $1 AND c.version > $2
            ORDER BY c.row_key
            "#,
            table_ident = sql::table_ident(table)
        );
        let rows: Vec<(Value, i64, bool, Option<Value>)> = sqlx::query_as(&query)
            .bind(table.to_string())
            .bind(since as i64)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(SyncError::store)?;

        let mut changes = Vec::with_capacity(rows.len());
        for (row_key, first_version, deleted, row_data) in rows {
            let born_in_window = first_version as Version > since;
            if deleted {
                // Created and deleted inside the window nets to nothing.
                if !born_in_window {
                    changes.push(RowChange::new(
                        ChangeType::Delete,
                        object_to_values(row_key)?,
                    ));
                }
            } else if let Some(row) = row_data {
                let change_type = if born_in_window {
                    ChangeType::Insert
                } else {
                    ChangeType::Update
                };
                changes.push(RowChange::new(change_type, object_to_values(row)?));
            }
        }
        Ok(changes)
    }

    async fn initial_snapshot(&mut self, table: &TableRef) -> Result<Vec<RowValues>> {
        let query = format!(
            "SELECT to_jsonb(t) FROM {table_ident} t",
            table_ident = sql::table_ident(table)
        );
        let rows: Vec<(Value,)> = sqlx::query_as(&query)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(SyncError::store)?;
        rows.into_iter()
            .map(|(row,)| object_to_values(row))
            .collect()
    }

    async fn insert_row(&mut self, item: &SyncItem) -> Result<u64> {
        let table_ident = sql::table_ident(&item.table);
        let query = format!(
            r#"
            INSERT INTO {table_ident}
            SELECT * FROM jsonb_populate_record(NULL::{table_ident}, $1)
            ON CONFLICT DO NOTHING
            "#
        );
        let result = sqlx::query(&query)
            .bind(sql::values_object(&item.values))
            .execute(&mut *self.tx)
            .await
            .map_err(SyncError::store)?;
        Ok(result.rows_affected())
    }

    async fn update_row(
        &mut self,
        item: &SyncItem,
        last_sync_version: Version,
        force_write: bool,
    ) -> Result<u64> {
        let keys = self.key_columns(&item.table).await?;
        let key = sql::key_object(&item.table, &keys, &item.values)?;
        let table_ident = sql::table_ident(&item.table);
        let query = format!(
            r#"
            UPDATE {table_ident} AS t
            SET {set_list}
            FROM jsonb_populate_record(NULL::{table_ident}, $1) AS r
            WHERE {key_join}
              AND ($2 OR NOT EXISTS (
                    SELECT 1 FROM _tandem_changes c
                    WHERE c.table_key = $3 AND c.row_key = $4 AND c.version > $5))
            "#,
            set_list = sql::set_list(&keys, &item.values),
            key_join = sql::key_join(&keys),
        );
        let result = sqlx::query(&query)
            .bind(sql::values_object(&item.values))
            .bind(force_write)
            .bind(item.table.to_string())
            .bind(key)
            .bind(last_sync_version as i64)
            .execute(&mut *self.tx)
            .await
            .map_err(SyncError::store)?;
        Ok(result.rows_affected())
    }

    async fn delete_row(
        &mut self,
        item: &SyncItem,
        last_sync_version: Version,
        force_write: bool,
    ) -> Result<u64> {
        let keys = self.key_columns(&item.table).await?;
        let key = sql::key_object(&item.table, &keys, &item.values)?;
        let table_ident = sql::table_ident(&item.table);
        let query = format!(
            r#"
            DELETE FROM {table_ident} AS t
            USING jsonb_populate_record(NULL::{table_ident}, $1) AS r
            WHERE {key_join}
              AND ($2 OR NOT EXISTS (
                    SELECT 1 FROM _tandem_changes c
                    WHERE c.table_key = $3 AND c.row_key = $4 AND c.version > $5))
            "#,
            key_join = sql::key_join(&keys),
        );
        let result = sqlx::query(&query)
            .bind(sql::values_object(&item.values))
            .bind(force_write)
            .bind(item.table.to_string())
            .bind(key)
            .bind(last_sync_version as i64)
            .execute(&mut *self.tx)
            .await
            .map_err(SyncError::store)?;
        Ok(result.rows_affected())
    }

    async fn last_anchor_of(&mut self, peer: StoreId) -> Result<Option<Version>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM _tandem_anchors WHERE store_id = $1")
                .bind(peer.as_uuid())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(SyncError::store)?;
        Ok(row.map(|(v,)| v as Version))
    }

    async fn record_anchor(&mut self, peer: StoreId, version: Version) -> Result<()> {
        // If this transaction wrote rows, its allocated tracking version is
        // the post-commit current version and supersedes the computed bump;
        // the GREATEST keeps per-peer acknowledgments monotone either way.
        sqlx::query(
            r#"
            INSERT INTO _tandem_anchors (store_id, version, updated_at)
            VALUES ($1,
                    GREATEST($2, COALESCE(
                        nullif(current_setting('tandem.txn_version', true), '')::bigint, 0)),
                    now())
            ON CONFLICT (store_id) DO UPDATE
                SET version = GREATEST(_tandem_anchors.version, EXCLUDED.version),
                    updated_at = now()
            "#,
        )
        .bind(peer.as_uuid())
        .bind(version as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(SyncError::store)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(SyncError::store)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(SyncError::store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_rows_become_value_maps() {
        let values = object_to_values(json!({"id": 1, "body": null})).unwrap();
        assert_eq!(values.get("id"), Some(&json!(1)));
        assert_eq!(values.get("body"), Some(&Value::Null));
        assert_eq!(values.get("missing"), None);
    }

    #[test]
    fn non_object_rows_are_rejected() {
        let err = object_to_values(json!([1, 2])).unwrap_err();
        assert!(matches!(err, SyncError::StoreIo(_)));
    }
}
