use std::sync::Arc;
use std::time::Duration;

use dbexec_core::{
    CancelToken, DbClient, DbOptions, DbOptionsStore, DefaultClassifier, DbResilienceOptions,
    QueryDefinition, RetryOptions, Value,
};
use dbexec_test_support::{FakeAttemptOutcome, FakeDataSourceFactory};
use futures::StreamExt;

/// Builds a `DbOptionsStore` rooted at a throwaway app directory (one per
/// test, named with a random suffix) and seeds it with `db`/`resilience`
/// before the store's initial snapshot is read, exactly the way a real
/// process seeds `db_options.json` before startup.
fn options_store(db: DbOptions, resilience: DbResilienceOptions) -> Arc<DbOptionsStore> {
    let _ = env_logger::try_init();

    let app_dir_name = format!("dbexec_test_{}", uuid::Uuid::new_v4());
    let store = DbOptionsStore::new(&app_dir_name).expect("config dir must be writable in tests");

    #[derive(serde::Serialize)]
    struct OnDisk {
        db: DbOptions,
        resilience: DbResilienceOptions,
    }
    let content = serde_json::to_string(&OnDisk { db, resilience }).unwrap();
    std::fs::write(store.path(), content).unwrap();
    store.reload().unwrap();

    Arc::new(store)
}

fn default_db_options() -> DbOptions {
    let mut db = DbOptions::default();
    db.connection_strings.insert("defaultDatabase", "server=fake");
    db
}

fn client(db: DbOptions, resilience: DbResilienceOptions, factory: FakeDataSourceFactory) -> Arc<DbClient> {
    let store = options_store(db, resilience);
    DbClient::new(store, Arc::new(factory), Arc::new(DefaultClassifier))
}

#[tokio::test]
async fn default_path_executes_non_query_without_a_transaction() {
    let factory = FakeDataSourceFactory::new().with_non_query_result("UPDATE accounts SET balance = 0", 4);
    let db_client = client(default_db_options(), DbResilienceOptions::default(), factory.clone());

    let query = QueryDefinition::text("UPDATE accounts SET balance = 0").unwrap();
    let affected = db_client.execute_non_query(&query, CancelToken::new()).await.unwrap();

    assert_eq!(affected, 4);
    let stats = factory.stats();
    assert_eq!(stats.open_count, 1);
    assert_eq!(stats.commits, 0, "no isolation requested, no transaction should open");
    assert_eq!(stats.disposed, 1, "the connection must be disposed after the attempt");
}

#[tokio::test]
async fn retry_recovers_from_a_transient_failure_and_surfaces_the_eventual_success() {
    let factory = FakeDataSourceFactory::new().with_non_query_sequence(
        "INSERT INTO events DEFAULT VALUES",
        vec![
            FakeAttemptOutcome::TransientError("connection reset".to_string()),
            FakeAttemptOutcome::TransientError("connection reset".to_string()),
            FakeAttemptOutcome::Success(1),
        ],
    );

    let mut resilience = DbResilienceOptions::default();
    resilience.enabled = true;
    resilience.retry = RetryOptions {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        backoff_exponent: 1.0,
        use_jitter: false,
    };

    let db_client = client(default_db_options(), resilience, factory.clone());
    let query = QueryDefinition::text("INSERT INTO events DEFAULT VALUES").unwrap();
    let affected = db_client.execute_non_query(&query, CancelToken::new()).await.unwrap();

    assert_eq!(affected, 1);
    assert_eq!(factory.stats().executed_commands, 3);
    assert_eq!(factory.stats().open_count, 3, "each attempt opens its own connection");
}

#[tokio::test]
async fn a_permanent_error_inside_a_transaction_triggers_rollback_not_commit() {
    let factory = FakeDataSourceFactory::new()
        .with_non_query_permanent_error("DELETE FROM locked_table", "constraint violation");

    let db_client = client(default_db_options(), DbResilienceOptions::default(), factory.clone());
    let query = QueryDefinition::text("DELETE FROM locked_table")
        .unwrap()
        .with_isolation(dbexec_core::IsolationLevel::ReadCommitted);

    let result = db_client.execute_non_query(&query, CancelToken::new()).await;

    assert!(matches!(result, Err(dbexec_core::ExecError::Unknown { .. })));
    let stats = factory.stats();
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.commits, 0);
}

#[tokio::test]
async fn a_successful_command_inside_a_transaction_commits_exactly_once() {
    let factory = FakeDataSourceFactory::new().with_non_query_result("UPDATE ledger SET posted = 1", 2);
    let db_client = client(default_db_options(), DbResilienceOptions::default(), factory.clone());

    let query = QueryDefinition::text("UPDATE ledger SET posted = 1")
        .unwrap()
        .with_isolation(dbexec_core::IsolationLevel::Serializable);

    let affected = db_client.execute_non_query(&query, CancelToken::new()).await.unwrap();

    assert_eq!(affected, 2);
    let stats = factory.stats();
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.rollbacks, 0);
}

#[tokio::test]
async fn missing_connection_name_is_a_configuration_error_before_any_connection_opens() {
    let factory = FakeDataSourceFactory::new();
    let mut db = DbOptions::default();
    db.connection_strings.insert("reporting", "server=fake");
    // No entry for the default connection name used by this query.

    let db_client = client(db, DbResilienceOptions::default(), factory.clone());
    let query = QueryDefinition::text("SELECT 1").unwrap();

    let result = db_client.execute_non_query(&query, CancelToken::new()).await;

    assert!(matches!(result, Err(dbexec_core::ExecError::Configuration(_))));
    assert_eq!(factory.stats().open_count, 0);
}

#[tokio::test]
async fn scalar_null_is_preserved_as_none_rather_than_coerced_to_a_zero_value() {
    let factory = FakeDataSourceFactory::new().with_scalar_result("SELECT MAX(id) FROM empty_table", None);
    let db_client = client(default_db_options(), DbResilienceOptions::default(), factory.clone());

    let query = QueryDefinition::text("SELECT MAX(id) FROM empty_table").unwrap();
    let result: Option<i64> = db_client.execute_scalar(&query, CancelToken::new()).await.unwrap();

    assert_eq!(result, None);
}

#[tokio::test]
async fn scalar_value_coerces_to_the_requested_type() {
    let factory = FakeDataSourceFactory::new().with_scalar_result("SELECT COUNT(*) FROM users", Some(Value::Int(42)));
    let db_client = client(default_db_options(), DbResilienceOptions::default(), factory.clone());

    let query = QueryDefinition::text("SELECT COUNT(*) FROM users").unwrap();
    let result: Option<i64> = db_client.execute_scalar(&query, CancelToken::new()).await.unwrap();

    assert_eq!(result, Some(42));
}

#[tokio::test]
async fn a_cancelled_token_stops_the_row_stream_after_buffering() {
    let rows = vec![
        dbexec_core::RowView {
            columns: vec!["id".to_string()],
            values: vec![Value::Int(1)],
        },
        dbexec_core::RowView {
            columns: vec!["id".to_string()],
            values: vec![Value::Int(2)],
        },
    ];
    let factory = FakeDataSourceFactory::new().with_rows_result("SELECT id FROM users", rows);
    let db_client = client(default_db_options(), DbResilienceOptions::default(), factory.clone());

    let query = QueryDefinition::text("SELECT id FROM users").unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let mut stream = db_client
        .query(&query, cancel, |row| {
            row.get(0)
                .and_then(|v| if let Value::Int(i) = v { Some(*i) } else { None })
                .ok_or_else(|| dbexec_core::ExecError::InvalidConversion("missing id".to_string()))
        })
        .await
        .unwrap();

    let first = stream.next().await.unwrap();
    assert!(matches!(first, Err(dbexec_core::ExecError::Cancelled)));
    assert!(stream.next().await.is_none(), "stream must terminate after the cancellation error");
}

#[tokio::test]
async fn hot_reload_evicts_the_data_source_and_pipeline_caches() {
    let factory = FakeDataSourceFactory::new().with_non_query_result("SELECT 1", 0);
    let store = options_store(default_db_options(), DbResilienceOptions::default());
    let db_client = DbClient::new(store.clone(), Arc::new(factory.clone()), Arc::new(DefaultClassifier));
    let _listener = db_client.spawn_reconfiguration_listener();

    let query = QueryDefinition::text("SELECT 1").unwrap();
    db_client.execute_non_query(&query, CancelToken::new()).await.unwrap();
    assert_eq!(factory.stats().open_count, 1);

    let mut changed_db = default_db_options();
    changed_db.connection_strings.insert("defaultDatabase", "server=fake-2");
    #[derive(serde::Serialize)]
    struct OnDisk {
        db: DbOptions,
        resilience: DbResilienceOptions,
    }
    let content = serde_json::to_string(&OnDisk {
        db: changed_db,
        resilience: DbResilienceOptions::default(),
    })
    .unwrap();
    std::fs::write(store.path(), content).unwrap();
    store.reload().unwrap();
    // Give the background listener a tick to observe the change and evict.
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    db_client.execute_non_query(&query, CancelToken::new()).await.unwrap();
    assert_eq!(
        factory.stats().open_count,
        2,
        "a fresh data source must be opened after the cache was evicted"
    );
}

#[tokio::test]
async fn an_unchanged_reload_does_not_evict_the_caches() {
    let factory = FakeDataSourceFactory::new().with_non_query_result("SELECT 1", 0);
    let store = options_store(default_db_options(), DbResilienceOptions::default());
    let db_client = DbClient::new(store.clone(), Arc::new(factory.clone()), Arc::new(DefaultClassifier));
    let _listener = db_client.spawn_reconfiguration_listener();

    let query = QueryDefinition::text("SELECT 1").unwrap();
    db_client.execute_non_query(&query, CancelToken::new()).await.unwrap();
    assert_eq!(factory.stats().open_count, 1);

    store.reload().unwrap();
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    db_client.execute_non_query(&query, CancelToken::new()).await.unwrap();
    assert_eq!(
        factory.stats().open_count,
        1,
        "an unchanged reload must not evict the data source cache"
    );
}

#[tokio::test]
async fn dispose_is_idempotent_and_rejects_further_calls() {
    let factory = FakeDataSourceFactory::new().with_non_query_result("SELECT 1", 0);
    let db_client = client(default_db_options(), DbResilienceOptions::default(), factory.clone());

    db_client.dispose().await;
    db_client.dispose().await;

    let query = QueryDefinition::text("SELECT 1").unwrap();
    let result = db_client.execute_non_query(&query, CancelToken::new()).await;
    assert!(matches!(result, Err(dbexec_core::ExecError::Disposed)));
}
