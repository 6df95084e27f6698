//! Integration tests for the PostgreSQL binding.
//!
//! These tests require a running PostgreSQL database and are ignored by
//! default. Point `DATABASE_URL` at a scratch database and run:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/tandem_test cargo test -p tandem-postgres -- --ignored
//! ```

use serde_json::json;
use tandem_engine::{
    ChangeType, RowValues, StoreBinding, StoreId, SyncAnchor, SyncChangeSet, SyncError, SyncItem,
    SyncProvider, SyncSetup, TableConfig, TableRef,
};
use tandem_postgres::{PgConfig, PgStoreBinding};

fn notes() -> TableRef {
    TableRef::new("sync_test_notes")
}

fn values(pairs: &[(&str, serde_json::Value)]) -> RowValues {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

async fn scratch_binding() -> PgStoreBinding {
    let _ = tracing_subscriber::fmt::try_init();
    dotenvy::dotenv().ok();
    let config = PgConfig::from_env().expect("DATABASE_URL must be set for integration tests");
    let binding = PgStoreBinding::connect(config).await.unwrap();

    sqlx::raw_sql(
        r#"
        DROP TABLE IF EXISTS sync_test_notes;
        CREATE TABLE sync_test_notes (
            id bigint PRIMARY KEY,
            body text,
            done boolean NOT NULL DEFAULT false
        );
        "#,
    )
    .execute(binding.pool())
    .await
    .unwrap();

    binding
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database via DATABASE_URL"]
async fn end_to_end_roundtrip() {
    let binding = scratch_binding().await;
    let setup = SyncSetup::new(vec![TableConfig::new("sync_test_notes")]).unwrap();

    // Start from a clean slate, then provision twice: idempotent, stable id.
    binding.remove_provision(setup.tables()).await.ok();
    let provider = SyncProvider::new(binding, setup);
    let id_first = provider.apply_provision().await.unwrap();
    let id_second = provider.apply_provision().await.unwrap();
    assert_eq!(id_first, id_second);

    // Local writes go through the trigger.
    sqlx::query("INSERT INTO sync_test_notes (id, body) VALUES (1, 'hello'), (2, NULL)")
        .execute(provider.binding().pool())
        .await
        .unwrap();

    // Initial change-set for a fresh peer: both rows as inserts, with the
    // explicit NULL carried as a null value.
    let peer = StoreId::generate();
    let initial = provider.get_changes(peer).await.unwrap();
    assert_eq!(initial.len(), 2);
    assert!(initial
        .items
        .iter()
        .all(|item| item.change_type == ChangeType::Insert));
    let row2 = initial
        .items
        .iter()
        .find(|item| item.value("id") == Some(&json!(2)))
        .unwrap();
    assert_eq!(row2.value("body"), Some(&serde_json::Value::Null));
    assert_eq!(initial.target_anchor, SyncAnchor::zero(peer));

    // Apply a change-set from the peer: an insert lands and the anchor moves.
    let self_id = provider.store_id().await.unwrap();
    let mut from_peer = SyncChangeSet::new(
        SyncAnchor::new(peer, 7),
        SyncAnchor::new(self_id, initial.source_anchor.version),
    );
    from_peer.items.push(SyncItem::new(
        notes(),
        ChangeType::Insert,
        values(&[("id", json!(3)), ("body", json!("from peer")), ("done", json!(true))]),
    ));
    let anchor = provider.apply_changes(from_peer.clone()).await.unwrap();
    assert_eq!(anchor.store_id, self_id);
    assert!(anchor.version > initial.source_anchor.version);

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM sync_test_notes WHERE id = 3 AND done")
            .fetch_one(provider.binding().pool())
            .await
            .unwrap();
    assert_eq!(count, 1);

    // Replaying the same set hits the key collision and rolls back whole.
    let err = provider.apply_changes(from_peer).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidSyncOperation { .. }));

    // The peer now has an anchor, so the next outgoing set is incremental
    // and must not echo the row the peer itself sent.
    sqlx::query("UPDATE sync_test_notes SET body = 'hello v2' WHERE id = 1")
        .execute(provider.binding().pool())
        .await
        .unwrap();
    let incremental = provider.get_changes(peer).await.unwrap();
    assert_eq!(incremental.len(), 1);
    assert_eq!(incremental.items[0].change_type, ChangeType::Update);
    assert_eq!(incremental.items[0].value("id"), Some(&json!(1)));

    // A concurrent local edit defeats the version predicate; the default
    // policy keeps the local row.
    sqlx::query("UPDATE sync_test_notes SET body = 'local wins' WHERE id = 3")
        .execute(provider.binding().pool())
        .await
        .unwrap();
    let mut stale = SyncChangeSet::new(
        SyncAnchor::new(peer, 8),
        SyncAnchor::new(self_id, anchor.version),
    );
    stale.items.push(SyncItem::new(
        notes(),
        ChangeType::Update,
        values(&[("id", json!(3)), ("body", json!("remote")), ("done", json!(false))]),
    ));
    provider.apply_changes(stale).await.unwrap();
    let (body,): (String,) = sqlx::query_as("SELECT body FROM sync_test_notes WHERE id = 3")
        .fetch_one(provider.binding().pool())
        .await
        .unwrap();
    assert_eq!(body, "local wins");

    // Pruning moves the horizon; the stale peer anchor is now refused.
    let current = provider
        .binding()
        .anchors()
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.version)
        .max()
        .unwrap_or(0);
    provider
        .binding()
        .prune_changes(&notes(), current + 10)
        .await
        .unwrap();
    let err = provider.get_changes(peer).await.unwrap_err();
    assert!(matches!(err, SyncError::VersionTooOld { .. }));

    // Deprovisioning drops tracking but keeps the data and the identity.
    provider.remove_provision().await.unwrap();
    let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_test_notes")
        .fetch_one(provider.binding().pool())
        .await
        .unwrap();
    assert!(rows >= 3);
    let reprovisioned = provider.apply_provision().await.unwrap();
    assert_eq!(reprovisioned, self_id);
}
