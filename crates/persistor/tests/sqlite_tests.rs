//! SQLite backend integration tests.
//!
//! Behavior specific to the relational adapter: durable files, schema
//! evolution, the `REGEXP` function and verbatim SQLite errors.

#![cfg(feature = "sqlite")]

mod common;

use std::path::Path;
use std::sync::Arc;

use helios_persistor::backends::sqlite::{SqliteBackend, SqliteBackendConfig};
use helios_persistor::schema::{ScalarKind, Template};
use helios_persistor::{
    FetchRequest, FetchSpec, InstanceId, ObjectGraph, Persistor, PersistorConfig, SchemaRegistry,
    TransactionOptions,
};
use serde_json::json;
use tempfile::TempDir;

use common::*;

async fn open_persistor(path: &Path, registry: Arc<SchemaRegistry>) -> Persistor {
    let backend = SqliteBackend::open(path).expect("Failed to create SQLite backend");
    let persistor =
        Persistor::new(registry, Arc::new(backend), PersistorConfig::default()).expect("Failed to create persistor");
    persistor
        .synchronize()
        .await
        .expect("Failed to synchronize storage");
    persistor
}

// ============================================================================
// Durability
// ============================================================================

#[tokio::test]
async fn test_data_survives_reopen() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("bank.db");

    let bank = {
        let persistor = open_persistor(&path, banking_registry()).await;
        create_bank(&persistor).await
    };

    // Synchronizing an up-to-date database is a no-op.
    let persistor = open_persistor(&path, banking_registry()).await;
    assert_eq!(persistor.count("Customer", &json!({})).await.unwrap(), 3);

    let mut graph = persistor.graph();
    let spec = FetchSpec::parse(&json!({"transactions": true, "fromAccountTransactions": true})).unwrap();
    let joint = persistor
        .fetch_by_id(&mut graph, "Account", Some(&bank.joint_account), &spec)
        .await
        .expect("Failed to fetch account")
        .expect("Account not found");
    assert_eq!(balance(&graph, joint), 125.0);
    assert_eq!(
        graph.get(joint, "title").unwrap(),
        &json!(["Karen Burke", "Sam Elsamman"])
    );
}

#[tokio::test]
async fn test_in_memory_database() {
    let backend = SqliteBackend::in_memory().expect("Failed to create SQLite backend");
    let persistor = Persistor::new(banking_registry(), Arc::new(backend), PersistorConfig::default())
        .expect("Failed to create persistor");
    persistor.synchronize().await.expect("Failed to synchronize storage");

    create_bank(&persistor).await;
    assert_eq!(persistor.count("Transaction", &json!({})).await.unwrap(), 6);
}

async fn create_in_memory_persistor() -> Persistor {
    let config = SqliteBackendConfig {
        connection_timeout_ms: 2000,
        ..SqliteBackendConfig::default()
    };
    let backend = SqliteBackend::with_config(":memory:", config).expect("Failed to create SQLite backend");
    let persistor = Persistor::new(banking_registry(), Arc::new(backend), PersistorConfig::default())
        .expect("Failed to create persistor");
    persistor.synchronize().await.expect("Failed to synchronize storage");
    persistor
}

async fn fetch_customer(persistor: &Persistor, graph: &mut ObjectGraph, id: &str) -> InstanceId {
    persistor
        .fetch_by_id(graph, "Customer", Some(id), &FetchSpec::none())
        .await
        .expect("Failed to fetch customer")
        .expect("Customer not found")
}

#[tokio::test]
async fn test_in_memory_reads_inside_open_transaction() {
    let persistor = create_in_memory_persistor().await;
    let bank = create_bank(&persistor).await;

    let mut txn = persistor
        .begin(TransactionOptions::default())
        .await
        .expect("Failed to begin transaction");
    assert!(txn.options().share_connection);

    let mut graph = persistor.graph();
    let sam = fetch_customer(&persistor, &mut graph, &bank.sam).await;
    assert_eq!(persistor.count("Customer", &json!({})).await.unwrap(), 3);
    assert!(!persistor.is_stale(&graph, sam).await.unwrap());

    graph.set(sam, "firstName", "Samuel").unwrap();
    txn.set_dirty(&mut graph, sam).unwrap();
    persistor.end(&mut txn, &mut graph).await.expect("Failed to commit");
    assert_eq!(graph.instance(sam).unwrap().version(), 2);
}

#[tokio::test]
async fn test_in_memory_overlapping_transactions() {
    let persistor = create_in_memory_persistor().await;
    let bank = create_bank(&persistor).await;

    let mut first = persistor.begin(TransactionOptions::default()).await.unwrap();
    let mut second = persistor.begin(TransactionOptions::default()).await.unwrap();

    let mut first_graph = persistor.graph();
    let mut second_graph = persistor.graph();
    let first_sam = fetch_customer(&persistor, &mut first_graph, &bank.sam).await;
    let second_sam = fetch_customer(&persistor, &mut second_graph, &bank.sam).await;

    first_graph.set(first_sam, "firstName", "Samuel").unwrap();
    second_graph.set(second_sam, "firstName", "Sammy").unwrap();
    first.set_dirty(&mut first_graph, first_sam).unwrap();
    second.set_dirty(&mut second_graph, second_sam).unwrap();

    persistor.end(&mut first, &mut first_graph).await.expect("Failed to commit");
    let err = persistor.end(&mut second, &mut second_graph).await.unwrap_err();
    assert_eq!(err.to_string(), "Update Conflict");
    assert!(second_graph.instance(second_sam).unwrap().is_stale());

    let mut graph = persistor.graph();
    let sam = fetch_customer(&persistor, &mut graph, &bank.sam).await;
    assert_eq!(graph.get(sam, "firstName").unwrap(), &json!("Samuel"));
}

// ============================================================================
// Schema Evolution
// ============================================================================

#[tokio::test]
async fn test_synchronize_adds_new_columns() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("evolve.db");

    let before = SchemaRegistry::builder()
        .template(Template::new("Customer").scalar("firstName", ScalarKind::String))
        .build()
        .expect("Failed to build registry");
    let persistor = open_persistor(&path, Arc::new(before)).await;
    let mut graph = persistor.graph();
    let sam = graph.create("Customer").unwrap();
    graph.set(sam, "firstName", "Sam").unwrap();
    persistor.save(&mut graph, &[sam]).await.expect("Failed to save");
    drop(persistor);

    let after = SchemaRegistry::builder()
        .template(
            Template::new("Customer")
                .scalar("firstName", ScalarKind::String)
                .scalar("nickname", ScalarKind::String),
        )
        .build()
        .expect("Failed to build registry");
    let persistor = open_persistor(&path, Arc::new(after)).await;

    let mut graph = persistor.graph();
    let found = persistor
        .fetch(&mut graph, &FetchRequest::new("Customer"))
        .await
        .expect("Failed to fetch");
    assert_eq!(found.len(), 1);
    assert!(graph.get(found[0], "nickname").unwrap().is_null());

    graph.set(found[0], "nickname", "Sammy").unwrap();
    persistor.save(&mut graph, &found).await.expect("Failed to save");
    assert_eq!(
        persistor.count("Customer", &json!({"nickname": "Sammy"})).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_drop_storage_and_recreate() {
    let context = create_sqlite_context().await;
    let persistor = &context.persistor;
    create_bank(persistor).await;

    persistor.drop_storage("Debit").await.expect("Failed to drop storage");
    let err = persistor.count("Transaction", &json!({})).await.unwrap_err();
    assert!(err.to_string().contains("no such table"), "{}", err);

    persistor.synchronize().await.expect("Failed to synchronize storage");
    assert_eq!(persistor.count("Transaction", &json!({})).await.unwrap(), 0);
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_regexp_function() {
    let context = create_sqlite_context().await;
    let persistor = &context.persistor;
    create_bank(persistor).await;

    let filter = json!({"lastName": {"$regex": "^bur", "$options": "i"}});
    assert_eq!(persistor.count("Customer", &filter).await.unwrap(), 2);
    let filter = json!({"lastName": {"$regex": "^bur"}});
    assert_eq!(persistor.count("Customer", &filter).await.unwrap(), 0);
}

#[tokio::test]
async fn test_errors_are_reported_verbatim() {
    let context = create_sqlite_context().await;
    let persistor = &context.persistor;

    let err = persistor
        .count("Customer", &json!({"nosuchfield": 1}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no such column: nosuchfield"), "{}", err);

    // The document store simply finds nothing.
    let memory = create_memory_context().await;
    assert_eq!(
        memory
            .persistor
            .count("Customer", &json!({"nosuchfield": 1}))
            .await
            .unwrap(),
        0
    );
}
