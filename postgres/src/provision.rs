//! Provisioning: bookkeeping tables and change-tracking triggers.
//!
//! Everything here is idempotent. Bookkeeping lives in `_tandem_*` tables;
//! each tracked user table gets an `AFTER` row trigger that maintains one
//! net-change row per primary key, versioned by a store-wide sequence. One
//! version is allocated per transaction (parked in a transaction-local
//! setting), so every row touched by a commit shares its version.

use crate::sql;
use sqlx::{PgConnection, PgPool};
use tandem_engine::{Result, StoreId, SyncError, TableConfig, TableRef};
use uuid::Uuid;

const BOOKKEEPING_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS _tandem_identity (
    singleton boolean PRIMARY KEY DEFAULT true CHECK (singleton),
    store_id uuid NOT NULL,
    provisioned_at timestamptz NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS _tandem_anchors (
    store_id uuid PRIMARY KEY,
    version bigint NOT NULL,
    updated_at timestamptz NOT NULL DEFAULT now()
);
CREATE SEQUENCE IF NOT EXISTS _tandem_version;
CREATE TABLE IF NOT EXISTS _tandem_changes (
    table_key text NOT NULL,
    row_key jsonb NOT NULL,
    first_version bigint NOT NULL,
    version bigint NOT NULL,
    deleted boolean NOT NULL DEFAULT false,
    PRIMARY KEY (table_key, row_key)
);
CREATE INDEX IF NOT EXISTS _tandem_changes_version_idx
    ON _tandem_changes (table_key, version);
CREATE TABLE IF NOT EXISTS _tandem_horizon (
    table_key text PRIMARY KEY,
    min_version bigint NOT NULL DEFAULT 0
);
"#;

/// Primary-key columns of a table, in index order.
pub(crate) async fn key_columns(
    executor: &mut PgConnection,
    table: &TableRef,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT a.attname
        FROM pg_index i
        JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
        WHERE i.indrelid = $1::regclass AND i.indisprimary
        ORDER BY a.attnum
        "#,
    )
    .bind(sql::table_ident(table))
    .fetch_all(executor)
    .await
    .map_err(SyncError::store)?;

    if rows.is_empty() {
        return Err(SyncError::InvalidConfig(format!(
            "table '{table}' has no primary key"
        )));
    }
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

/// Identifier of the trigger function tracking `table`.
fn trigger_fn_ident(table: &TableRef) -> String {
    sql::quote_ident(&format!("_tandem_track_{}", table.to_string().replace('.', "_")))
}

/// `jsonb_build_object('k1', REC."k1", ...)` over the key columns.
fn key_object_sql(record: &str, key_columns: &[String]) -> String {
    let pairs: Vec<String> = key_columns
        .iter()
        .map(|c| format!("{}, {record}.{}", sql::quote_literal(c), sql::quote_ident(c)))
        .collect();
    format!("jsonb_build_object({})", pairs.join(", "))
}

/// The per-table trigger function.
///
/// Inserts record the allocating version as `first_version` so the oracle
/// can tell a row born inside the requested window (net insert) from one
/// merely modified in it (net update). A reinsert after a tracked delete
/// resets `first_version`: the row is born again from any anchor past the
/// delete. A row the tracker has never seen gets `first_version` 0: it
/// predates tracking and always nets to an update.
pub(crate) fn trigger_fn_sql(table: &TableRef, key_columns: &[String]) -> String {
    let fn_ident = trigger_fn_ident(table);
    let table_key = sql::quote_literal(&table.to_string());
    let new_key = key_object_sql("NEW", key_columns);
    let old_key = key_object_sql("OLD", key_columns);

    format!(
        r#"
CREATE OR REPLACE FUNCTION {fn_ident}() RETURNS trigger
LANGUAGE plpgsql AS $fn$
DECLARE
    v bigint;
    k jsonb;
BEGIN
    v := nullif(current_setting('tandem.txn_version', true), '')::bigint;
    IF v IS NULL THEN
        v := nextval('_tandem_version');
        PERFORM set_config('tandem.txn_version', v::text, true);
    END IF;
    IF TG_OP = 'DELETE' THEN
        k := {old_key};
        INSERT INTO _tandem_changes (table_key, row_key, first_version, version, deleted)
        VALUES ({table_key}, k, 0, v, true)
        ON CONFLICT (table_key, row_key) DO UPDATE
            SET version = EXCLUDED.version, deleted = true;
        RETURN OLD;
    ELSIF TG_OP = 'INSERT' THEN
        k := {new_key};
        INSERT INTO _tandem_changes (table_key, row_key, first_version, version, deleted)
        VALUES ({table_key}, k, v, v, false)
        ON CONFLICT (table_key, row_key) DO UPDATE
            SET first_version = EXCLUDED.first_version,
                version = EXCLUDED.version,
                deleted = false;
        RETURN NEW;
    ELSE
        k := {new_key};
        INSERT INTO _tandem_changes (table_key, row_key, first_version, version, deleted)
        VALUES ({table_key}, k, 0, v, false)
        ON CONFLICT (table_key, row_key) DO UPDATE
            SET version = EXCLUDED.version, deleted = false;
        RETURN NEW;
    END IF;
END;
$fn$;
"#
    )
}

pub(crate) fn trigger_sql(table: &TableRef) -> String {
    let table_ident = sql::table_ident(table);
    let fn_ident = trigger_fn_ident(table);
    format!(
        r#"
DROP TRIGGER IF EXISTS _tandem_track ON {table_ident};
CREATE TRIGGER _tandem_track
AFTER INSERT OR UPDATE OR DELETE ON {table_ident}
FOR EACH ROW EXECUTE FUNCTION {fn_ident}();
"#
    )
}

/// Bootstrap the store: bookkeeping tables, durable identity, and a tracking
/// trigger per configured table.
pub(crate) async fn apply(pool: &PgPool, tables: &[TableConfig]) -> Result<StoreId> {
    let mut tx = pool.begin().await.map_err(SyncError::store)?;

    sqlx::raw_sql(BOOKKEEPING_DDL)
        .execute(&mut *tx)
        .await
        .map_err(SyncError::store)?;

    for config in tables {
        let table = config.table_ref();

        let exists: (bool,) = sqlx::query_as("SELECT to_regclass($1) IS NOT NULL")
            .bind(sql::table_ident(&table))
            .fetch_one(&mut *tx)
            .await
            .map_err(SyncError::store)?;
        if !exists.0 {
            return Err(SyncError::InvalidConfig(format!(
                "table '{table}' does not exist"
            )));
        }

        let keys = key_columns(&mut *tx, &table).await?;
        sqlx::raw_sql(&trigger_fn_sql(&table, &keys))
            .execute(&mut *tx)
            .await
            .map_err(SyncError::store)?;
        sqlx::raw_sql(&trigger_sql(&table))
            .execute(&mut *tx)
            .await
            .map_err(SyncError::store)?;

        sqlx::query("INSERT INTO _tandem_horizon (table_key) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(table.to_string())
            .execute(&mut *tx)
            .await
            .map_err(SyncError::store)?;

        tracing::debug!(table = %table, keys = ?keys, "change tracking enabled");
    }

    // First provisioning records a fresh identity; later runs keep it.
    sqlx::query(
        "INSERT INTO _tandem_identity (store_id) VALUES ($1) ON CONFLICT (singleton) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .execute(&mut *tx)
    .await
    .map_err(SyncError::store)?;

    let (store_id,): (Uuid,) = sqlx::query_as("SELECT store_id FROM _tandem_identity")
        .fetch_one(&mut *tx)
        .await
        .map_err(SyncError::store)?;

    tx.commit().await.map_err(SyncError::store)?;
    Ok(StoreId::from_uuid(store_id))
}

/// Tear tracking down: triggers, trigger functions, and the change tables.
/// User tables, the store identity, the anchor registry, and the version
/// sequence are untouched, so a later provision resumes under the same
/// identity with a counter that never regresses.
pub(crate) async fn remove(pool: &PgPool, tables: &[TableConfig]) -> Result<()> {
    let mut tx = pool.begin().await.map_err(SyncError::store)?;

    for config in tables {
        let table = config.table_ref();
        let exists: (bool,) = sqlx::query_as("SELECT to_regclass($1) IS NOT NULL")
            .bind(sql::table_ident(&table))
            .fetch_one(&mut *tx)
            .await
            .map_err(SyncError::store)?;
        if exists.0 {
            let drop_trigger = format!(
                "DROP TRIGGER IF EXISTS _tandem_track ON {}",
                sql::table_ident(&table)
            );
            sqlx::raw_sql(&drop_trigger)
                .execute(&mut *tx)
                .await
                .map_err(SyncError::store)?;
        }
        let drop_fn = format!("DROP FUNCTION IF EXISTS {}()", trigger_fn_ident(&table));
        sqlx::raw_sql(&drop_fn)
            .execute(&mut *tx)
            .await
            .map_err(SyncError::store)?;
    }

    sqlx::raw_sql(
        r#"
        DROP TABLE IF EXISTS _tandem_changes;
        DROP TABLE IF EXISTS _tandem_horizon;
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(SyncError::store)?;

    tx.commit().await.map_err(SyncError::store)?;
    Ok(())
}
