//! End-to-end executor tests against live SQLite databases: retrieval,
//! masking, retries, halting, caching, and the audit trail.

use anyhow::Result;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use shroud::audit::{ExecutionLogStatus, MemoryLogSink};
use shroud::cache::{InMemoryCache, ResultCache};
use shroud::graph::config::{Collection, Field, FieldAddress, RefDirection};
use shroud::policy::{ActionType, MaskingStrategy, Rule};
use shroud::task::RetryStrategy;
use shroud::{
    CollectionAddress, ConnectionConfig, ConnectionKind, Dataset, Engine, EngineError,
    ExecutionConfig, ExecutionRequest, FieldValue, Policy,
};

fn temp_db_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("shroud_{}_{}.db", tag, uuid::Uuid::new_v4()))
}

async fn seed_store(path: &Path) -> Result<()> {
    let url = format!("sqlite:{}?mode=rwc", path.display());
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await?;
    sqlx::query("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT, name TEXT)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "INSERT INTO users (id, email, name) VALUES \
         (1, 'x@example.com', 'Ada'), (2, 'other@example.com', 'Grace')",
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE TABLE orders (id INTEGER PRIMARY KEY, user_email TEXT, item TEXT)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "INSERT INTO orders (id, user_email, item) VALUES \
         (10, 'x@example.com', 'laptop'), (11, 'x@example.com', 'keyboard'), \
         (12, 'other@example.com', 'mouse')",
    )
    .execute(&pool)
    .await?;
    pool.close().await;
    Ok(())
}

fn app_datasets() -> Vec<Dataset> {
    vec![Dataset {
        name: "app".into(),
        connection_key: "sqlite_main".into(),
        collections: vec![
            Collection {
                name: "users".into(),
                fields: vec![
                    Field::new("id").with_primary_key(),
                    Field::new("email")
                        .with_identity("email")
                        .with_category("contact.email"),
                    Field::new("name").with_category("user.name"),
                ],
            },
            Collection {
                name: "orders".into(),
                fields: vec![
                    Field::new("id").with_primary_key(),
                    Field::new("user_email").with_reference(
                        FieldAddress::new("app", "users", "email"),
                        RefDirection::From,
                    ),
                    Field::new("item"),
                ],
            },
        ],
    }]
}

fn sqlite_connection(key: &str, path: &Path) -> ConnectionConfig {
    ConnectionConfig {
        key: key.into(),
        kind: ConnectionKind::Sqlite,
        secrets: json!({"path": path.display().to_string()}),
    }
}

fn access_policy() -> Policy {
    Policy {
        key: "download".into(),
        rules: vec![Rule {
            data_category: "contact".into(),
            action: ActionType::Access,
            masking: None,
        }],
    }
}

fn erasure_policy() -> Policy {
    Policy {
        key: "erase_contact".into(),
        rules: vec![Rule {
            data_category: "contact.email".into(),
            action: ActionType::Erasure,
            masking: Some(MaskingStrategy::Null),
        }],
    }
}

fn fast_config() -> ExecutionConfig {
    ExecutionConfig {
        max_attempts: 2,
        retry_strategy: RetryStrategy::Immediate,
        ..ExecutionConfig::default()
    }
}

fn engine_with_sinks() -> (Engine, Arc<InMemoryCache>, Arc<MemoryLogSink>) {
    let cache = Arc::new(InMemoryCache::new());
    let log = Arc::new(MemoryLogSink::new());
    let engine = Engine::new(cache.clone(), log.clone(), fast_config()).unwrap();
    (engine, cache, log)
}

fn identity(email: &str) -> BTreeMap<String, FieldValue> {
    BTreeMap::from([("email".to_string(), FieldValue::from(email))])
}

#[tokio::test]
async fn test_access_request_end_to_end() -> Result<()> {
    let path = temp_db_path("access");
    seed_store(&path).await?;
    let (engine, _cache, log) = engine_with_sinks();

    let request = ExecutionRequest::new(
        access_policy(),
        identity("x@example.com"),
        app_datasets(),
        vec![sqlite_connection("sqlite_main", &path)],
    );
    let request_id = request.request_id.clone();
    let report = engine.execute(request).await?;

    assert!(report.overall_success);
    assert_eq!(report.node_outcomes.len(), 2);
    let users = &report.node_outcomes[0];
    assert_eq!(users.address, CollectionAddress::new("app", "users"));
    assert_eq!(users.rows_retrieved, 1);
    assert_eq!(users.attempts, 1);
    let orders = &report.node_outcomes[1];
    assert_eq!(orders.address, CollectionAddress::new("app", "orders"));
    assert_eq!(orders.rows_retrieved, 2);

    // results are readable by address for report assembly
    let exported = engine.export_results(&request_id).await?;
    let user_rows = &exported[&CollectionAddress::new("app", "users")];
    assert_eq!(user_rows.len(), 1);
    assert_eq!(user_rows[0]["email"], FieldValue::from("x@example.com"));
    assert_eq!(user_rows[0]["name"], FieldValue::from("Ada"));
    let order_rows = &exported[&CollectionAddress::new("app", "orders")];
    let mut items: Vec<&str> = order_rows
        .iter()
        .filter_map(|r| r["item"].as_str())
        .collect();
    items.sort();
    assert_eq!(items, vec!["keyboard", "laptop"]);

    // two nodes, each logged as started then complete
    assert_eq!(log.count_status(ExecutionLogStatus::Started), 2);
    assert_eq!(log.count_status(ExecutionLogStatus::Complete), 2);
    assert_eq!(log.count_status(ExecutionLogStatus::Error), 0);

    std::fs::remove_file(&path).ok();
    Ok(())
}

#[tokio::test]
async fn test_zero_row_upstream_completes_with_empty_fields() -> Result<()> {
    let path = temp_db_path("empty");
    seed_store(&path).await?;
    let (engine, _cache, log) = engine_with_sinks();

    let request = ExecutionRequest::new(
        access_policy(),
        identity("nobody@example.com"),
        app_datasets(),
        vec![sqlite_connection("sqlite_main", &path)],
    );
    let report = engine.execute(request).await?;

    assert!(report.overall_success);
    for outcome in &report.node_outcomes {
        assert_eq!(outcome.status, ExecutionLogStatus::Complete);
        assert_eq!(outcome.rows_retrieved, 0);
    }

    // the downstream node could compile no query; it still completes, with
    // no affected fields
    let orders_complete = log
        .entries()
        .into_iter()
        .find(|e| e.collection == "orders" && e.status == ExecutionLogStatus::Complete)
        .unwrap();
    assert!(orders_complete.fields_affected.is_empty());

    std::fs::remove_file(&path).ok();
    Ok(())
}

#[tokio::test]
async fn test_erasure_masks_only_policy_matched_fields() -> Result<()> {
    let path = temp_db_path("erasure");
    seed_store(&path).await?;
    let (engine, _cache, log) = engine_with_sinks();

    let request = ExecutionRequest::new(
        erasure_policy(),
        identity("x@example.com"),
        app_datasets(),
        vec![sqlite_connection("sqlite_main", &path)],
    );
    let report = engine.execute(request).await?;

    assert!(report.overall_success);
    let users = &report.node_outcomes[0];
    assert_eq!(users.records_masked, 1);
    // orders declares no matched category, nothing to mask there
    let orders = &report.node_outcomes[1];
    assert_eq!(orders.records_masked, 0);

    let erasure_entries: Vec<_> = log
        .entries()
        .into_iter()
        .filter(|e| e.action_type == ActionType::Erasure)
        .collect();
    assert_eq!(erasure_entries.len(), 2); // started + complete, users only
    assert!(erasure_entries.iter().all(|e| e.collection == "users"));
    assert_eq!(erasure_entries[1].fields_affected, vec!["email".to_string()]);

    // the matched field is nulled, everything else is untouched
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite:{}", path.display()))
        .await?;
    let rows: Vec<(Option<String>, String)> =
        sqlx::query_as("SELECT email, name FROM users ORDER BY id")
            .fetch_all(&pool)
            .await?;
    pool.close().await;
    assert_eq!(rows[0], (None, "Ada".to_string()));
    assert_eq!(rows[1], (Some("other@example.com".into()), "Grace".into()));

    std::fs::remove_file(&path).ok();
    Ok(())
}

#[tokio::test]
async fn test_node_failure_halts_request_after_retries() -> Result<()> {
    let path = temp_db_path("halt");
    seed_store(&path).await?;
    let (engine, _cache, log) = engine_with_sinks();

    // billing lives on a connection whose store does not exist
    let mut datasets = app_datasets();
    datasets.push(Dataset {
        name: "billing".into(),
        connection_key: "broken".into(),
        collections: vec![
            Collection {
                name: "payments".into(),
                fields: vec![
                    Field::new("id").with_primary_key(),
                    Field::new("billing_email").with_reference(
                        FieldAddress::new("app", "users", "email"),
                        RefDirection::From,
                    ),
                ],
            },
            Collection {
                name: "refunds".into(),
                fields: vec![Field::new("payment_id").with_reference(
                    FieldAddress::new("billing", "payments", "id"),
                    RefDirection::From,
                )],
            },
        ],
    });
    let broken = ConnectionConfig {
        key: "broken".into(),
        kind: ConnectionKind::Sqlite,
        secrets: json!({"path": "/nonexistent/shroud/billing.db"}),
    };

    let request = ExecutionRequest::new(
        access_policy(),
        identity("x@example.com"),
        datasets,
        vec![sqlite_connection("sqlite_main", &path), broken],
    );
    let report = engine.execute(request).await?;

    assert!(!report.overall_success);
    assert!(report.error.as_deref().unwrap().contains("billing:payments"));

    // independent branches processed before the failure stay complete
    let by_address: BTreeMap<_, _> = report
        .node_outcomes
        .iter()
        .map(|o| (o.address.clone(), o))
        .collect();
    assert_eq!(
        by_address[&CollectionAddress::new("app", "users")].status,
        ExecutionLogStatus::Complete
    );
    assert_eq!(
        by_address[&CollectionAddress::new("app", "orders")].status,
        ExecutionLogStatus::Complete
    );
    let payments = by_address[&CollectionAddress::new("billing", "payments")];
    assert_eq!(payments.status, ExecutionLogStatus::Error);
    assert_eq!(payments.attempts, 2);
    // the halted request never reaches the downstream node
    assert!(!by_address.contains_key(&CollectionAddress::new("billing", "refunds")));
    assert!(log.entries().iter().all(|e| e.collection != "refunds"));

    // retried once, then terminal
    let payment_entries: Vec<_> = log
        .entries()
        .into_iter()
        .filter(|e| e.collection == "payments")
        .map(|e| e.status)
        .collect();
    assert_eq!(
        payment_entries,
        vec![
            ExecutionLogStatus::Started,
            ExecutionLogStatus::Retrying,
            ExecutionLogStatus::Error,
        ]
    );

    std::fs::remove_file(&path).ok();
    Ok(())
}

#[tokio::test]
async fn test_resumed_request_reuses_cached_rows() -> Result<()> {
    let path = temp_db_path("resume");
    seed_store(&path).await?;
    let (engine, _cache, _log) = engine_with_sinks();

    let request = ExecutionRequest::new(
        access_policy(),
        identity("x@example.com"),
        app_datasets(),
        vec![sqlite_connection("sqlite_main", &path)],
    )
    .with_request_id("resume-1");
    let first = engine.execute(request.clone()).await?;
    assert!(first.overall_success);
    assert!(first.node_outcomes.iter().all(|o| !o.from_cache));

    // the store disappears; a replay within the TTL still succeeds from
    // cached node results alone
    std::fs::remove_file(&path)?;
    let second = engine.execute(request).await?;
    assert!(second.overall_success);
    assert!(second.node_outcomes.iter().all(|o| o.from_cache));
    assert_eq!(
        second.node_outcomes.iter().map(|o| o.rows_retrieved).collect::<Vec<_>>(),
        first.node_outcomes.iter().map(|o| o.rows_retrieved).collect::<Vec<_>>(),
    );
    Ok(())
}

#[tokio::test]
async fn test_outcomes_stream_over_event_channel() -> Result<()> {
    let path = temp_db_path("events");
    seed_store(&path).await?;
    let cache = Arc::new(InMemoryCache::new());
    let log = Arc::new(MemoryLogSink::new());
    let mut engine = Engine::new(cache, log, fast_config()).unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    engine.set_event_channel(tx);

    let request = ExecutionRequest::new(
        access_policy(),
        identity("x@example.com"),
        app_datasets(),
        vec![sqlite_connection("sqlite_main", &path)],
    );
    let report = engine.execute(request).await?;

    let mut streamed = Vec::new();
    while let Ok(outcome) = rx.try_recv() {
        streamed.push(outcome);
    }
    assert_eq!(streamed.len(), report.node_outcomes.len());
    assert_eq!(streamed[0].address, CollectionAddress::new("app", "users"));

    std::fs::remove_file(&path).ok();
    Ok(())
}

/// Cache that refuses liveness checks, for the fail-fast path.
struct DownCache;

#[async_trait::async_trait]
impl ResultCache for DownCache {
    async fn ping(&self) -> shroud::Result<()> {
        Err(EngineError::cache("cache unreachable"))
    }
    async fn set(
        &self,
        _key: &str,
        _value: FieldValue,
        _ttl: std::time::Duration,
    ) -> shroud::Result<()> {
        Err(EngineError::cache("cache unreachable"))
    }
    async fn get(&self, _key: &str) -> shroud::Result<Option<FieldValue>> {
        Err(EngineError::cache("cache unreachable"))
    }
    async fn get_by_prefix(
        &self,
        _prefix: &str,
    ) -> shroud::Result<BTreeMap<String, FieldValue>> {
        Err(EngineError::cache("cache unreachable"))
    }
    async fn delete_by_prefix(&self, _prefix: &str) -> shroud::Result<u64> {
        Err(EngineError::cache("cache unreachable"))
    }
}

#[tokio::test]
async fn test_unavailable_cache_fails_before_any_side_effect() -> Result<()> {
    let log = Arc::new(MemoryLogSink::new());
    let engine = Engine::new(Arc::new(DownCache), log.clone(), fast_config()).unwrap();

    let request = ExecutionRequest::new(
        access_policy(),
        identity("x@example.com"),
        app_datasets(),
        vec![],
    );
    let err = engine.execute(request).await.unwrap_err();
    assert!(matches!(err, EngineError::Cache { .. }));
    assert!(log.entries().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_connection_probe() -> Result<()> {
    let path = temp_db_path("probe");
    seed_store(&path).await?;
    let (engine, _cache, _log) = engine_with_sinks();

    engine
        .test_connection(&sqlite_connection("sqlite_main", &path))
        .await?;

    let missing = ConnectionConfig {
        key: "missing".into(),
        kind: ConnectionKind::Sqlite,
        secrets: json!({"path": "/nonexistent/shroud/missing.db"}),
    };
    let err = engine.test_connection(&missing).await.unwrap_err();
    assert!(matches!(err, EngineError::Connection { .. }));

    std::fs::remove_file(&path).ok();
    Ok(())
}
