//! Reconciliation behavior driven through the mock database.

use std::sync::Arc;

use models::{Column, PgDataType};
use pgsink::db::mock::{MockColumn, MockDb};
use pgsink::db::DbError;
use pgsink::table_manager::{TableKind, TableManager};
use pgsink::SinkConfig;

fn manager() -> TableManager {
    TableManager::new(&SinkConfig::default())
}

fn required_basic() -> Vec<Column> {
    vec![
        Column::time(),
        Column::tag("host"),
        Column::field("value", PgDataType::Float8),
    ]
}

#[tokio::test]
async fn ensure_structure_is_idempotent() {
    let mut db = MockDb::new();
    let manager = manager();

    let outcome = manager
        .ensure_structure(&mut db, "cpu", &required_basic(), TableKind::Metric)
        .await
        .unwrap();
    assert!(outcome.is_clean());
    assert_eq!(db.lock().ddl_count(), 1);

    let outcome = manager
        .ensure_structure(&mut db, "cpu", &required_basic(), TableKind::Metric)
        .await
        .unwrap();
    assert!(outcome.is_clean());
    // the second call is resolved from the cache: still exactly one DDL
    assert_eq!(db.lock().ddl_count(), 1);
}

#[tokio::test]
async fn create_lists_columns_in_canonical_order() {
    let mut db = MockDb::new();
    let manager = manager();

    // deliberately shuffled
    let required = vec![
        Column::field("zeta", PgDataType::Int8),
        Column::tag("region"),
        Column::time(),
        Column::field("alpha", PgDataType::Int8),
        Column::tag("host"),
    ];
    manager
        .ensure_structure(&mut db, "cpu", &required, TableKind::Metric)
        .await
        .unwrap();

    let create = db
        .lock()
        .exec_log
        .iter()
        .find(|sql| sql.starts_with("CREATE TABLE"))
        .cloned()
        .expect("create statement");
    let time = create.find("\"time\"").unwrap();
    let host = create.find("\"host\"").unwrap();
    let region = create.find("\"region\"").unwrap();
    let alpha = create.find("\"alpha\"").unwrap();
    let zeta = create.find("\"zeta\"").unwrap();
    assert!(time < host && host < region && region < alpha && alpha < zeta);
}

#[tokio::test]
async fn over_long_identifier_is_isolated() {
    let mut db = MockDb::new();
    let manager = manager();

    let long_name = "x".repeat(70);
    let mut required = required_basic();
    required.push(Column::field(long_name.clone(), PgDataType::Int8));

    let outcome = manager
        .ensure_structure(&mut db, "cpu", &required, TableKind::Metric)
        .await
        .unwrap();

    assert_eq!(outcome.invalid.len(), 1);
    assert_eq!(outcome.invalid[0].name, long_name);
    assert!(outcome.missing.is_empty());

    // the rest of the columns were created, and no statement ever carried
    // the rejected name
    let state = db.lock();
    let columns = state.catalog_columns("public", "cpu").expect("table");
    assert_eq!(columns.len(), 3);
    assert!(state.exec_log.iter().all(|sql| !sql.contains(&long_name)));
}

#[tokio::test]
async fn incompatible_existing_type_is_permanent_and_narrow() {
    let mut db = MockDb::new();
    let manager = manager();
    db.lock().seed_table(
        "public",
        "cpu",
        vec![
            MockColumn::new("time", "timestamp with time zone"),
            MockColumn::new("value", "text"),
        ],
    );

    let required = vec![
        Column::time(),
        Column::field("value", PgDataType::Float8),
        Column::field("other", PgDataType::Int8),
    ];
    let outcome = manager
        .ensure_structure(&mut db, "cpu", &required, TableKind::Metric)
        .await
        .unwrap();

    // the conflicting column is reported unusable, the new sibling is
    // still created
    assert_eq!(outcome.missing.len(), 1);
    assert_eq!(outcome.missing[0].name, "value");
    let state = db.lock();
    let columns = state.catalog_columns("public", "cpu").unwrap();
    assert!(columns.iter().any(|c| c.name == "other"));
    // no statement tried to re-type the existing column
    assert!(state.exec_log.iter().all(|sql| !sql.contains("\"value\"")));
}

#[tokio::test]
async fn widening_is_not_required() {
    let mut db = MockDb::new();
    let manager = manager();
    db.lock().seed_table(
        "public",
        "cpu",
        vec![
            MockColumn::new("time", "timestamp with time zone"),
            MockColumn::new("value", "bigint"),
        ],
    );

    // an integer value fits the existing bigint column
    let required = vec![Column::time(), Column::field("value", PgDataType::Int4)];
    let outcome = manager
        .ensure_structure(&mut db, "cpu", &required, TableKind::Metric)
        .await
        .unwrap();
    assert!(outcome.is_clean());
    assert_eq!(db.lock().ddl_count(), 0);
}

#[tokio::test]
async fn tag_columns_get_role_comments() {
    let mut db = MockDb::new();
    let manager = manager();

    manager
        .ensure_structure(&mut db, "cpu", &required_basic(), TableKind::Metric)
        .await
        .unwrap();

    {
        let state = db.lock();
        assert!(state
            .exec_log
            .iter()
            .any(|sql| sql.starts_with("COMMENT ON COLUMN") && sql.contains("\"host\"")));
        let columns = state.catalog_columns("public", "cpu").unwrap();
        let host = columns.iter().find(|c| c.name == "host").unwrap();
        assert_eq!(host.comment.as_deref(), Some("tag"));
    }

    // a cold process rediscovers the tag role from the comment: flush the
    // cache, re-ensure, and nothing needs to change
    manager.clear_cache().await;
    manager
        .ensure_structure(&mut db, "cpu", &required_basic(), TableKind::Metric)
        .await
        .unwrap();
    assert_eq!(db.lock().ddl_count(), 1);
}

#[tokio::test]
async fn missing_alter_template_drops_columns_without_ddl() {
    let mut db = MockDb::new();
    let config = SinkConfig {
        add_column_templates: vec![pgsink::sqltemplate::Template::new(
            // a template that renders but targets nothing we track
            "SELECT 1",
        )],
        ..SinkConfig::default()
    };
    // seed an existing table so the alter path is taken
    db.lock().seed_table(
        "public",
        "cpu",
        vec![MockColumn::new("time", "timestamp with time zone")],
    );
    let manager = TableManager::new(&config);

    let required = vec![Column::time(), Column::field("value", PgDataType::Float8)];
    let outcome = manager
        .ensure_structure(&mut db, "cpu", &required, TableKind::Metric)
        .await
        .unwrap();
    // the configured statement ran but resolved nothing: the column is
    // reported back instead of aborting the batch
    assert_eq!(outcome.missing.len(), 1);
    assert_eq!(outcome.missing[0].name, "value");
}

#[tokio::test]
async fn concurrent_ensure_issues_one_ddl() {
    let db = MockDb::new();
    let manager = Arc::new(manager());

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let mut db = db.clone();
        let manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move {
            manager
                .ensure_structure(&mut db, "cpu", &required_basic(), TableKind::Metric)
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        let outcome = task.await.unwrap();
        assert!(outcome.is_clean());
    }
    assert_eq!(db.lock().ddl_count(), 1);
}

#[tokio::test]
async fn advisory_lock_wraps_every_ddl_transaction() {
    let mut db = MockDb::new();
    let manager = manager();
    manager
        .ensure_structure(&mut db, "cpu", &required_basic(), TableKind::Metric)
        .await
        .unwrap();

    let state = db.lock();
    let begin = state.exec_log.iter().position(|s| s == "BEGIN").unwrap();
    let lock = state
        .exec_log
        .iter()
        .position(|s| s.starts_with("SELECT pg_advisory_xact_lock"))
        .unwrap();
    let create = state
        .exec_log
        .iter()
        .position(|s| s.starts_with("CREATE TABLE"))
        .unwrap();
    let commit = state.exec_log.iter().position(|s| s == "COMMIT").unwrap();
    assert!(begin < lock && lock < create && create < commit);
}

#[tokio::test]
async fn transient_catalog_failure_propagates() {
    let mut db = MockDb::new();
    let manager = manager();
    db.fail_when(
        "information_schema.columns",
        DbError::transient("connection reset"),
        1,
    );

    let err = manager
        .ensure_structure(&mut db, "cpu", &required_basic(), TableKind::Metric)
        .await
        .unwrap_err();
    assert!(err.is_transient());
}
