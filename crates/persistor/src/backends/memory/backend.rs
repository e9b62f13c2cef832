//! In-process document backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::{Backend, BackendKind, Connection, Row};
use crate::error::{BackendError, BackendResult};
use crate::query::QueryDialect;
use crate::schema::SchemaRegistry;

use super::connection::MemoryConnection;
use super::lock::LockManager;

/// Configuration for the memory backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBackendConfig {
    /// How long a statement waits for a row lock before failing.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Yield to the scheduler before every statement, so concurrent
    /// transactions on one thread interleave statement by statement.
    #[serde(default = "default_true")]
    pub yield_per_statement: bool,
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            yield_per_statement: true,
        }
    }
}

/// Documents of one collection in insertion order.
#[derive(Debug, Default, Clone)]
pub(crate) struct Collection {
    next_seq: u64,
    documents: BTreeMap<u64, Row>,
    index: HashMap<String, u64>,
}

impl Collection {
    pub(crate) fn get(&self, id: &str) -> Option<&Row> {
        self.index.get(id).and_then(|seq| self.documents.get(seq))
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Documents in insertion order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Row> {
        self.documents.values()
    }

    pub(crate) fn upsert(&mut self, id: &str, document: Row) {
        match self.index.get(id) {
            Some(seq) => {
                self.documents.insert(*seq, document);
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.index.insert(id.to_string(), seq);
                self.documents.insert(seq, document);
            }
        }
    }

    pub(crate) fn remove(&mut self, id: &str) {
        if let Some(seq) = self.index.remove(id) {
            self.documents.remove(&seq);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.documents.len()
    }
}

/// Committed state shared by every connection.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) collections: Mutex<HashMap<String, Collection>>,
    pub(crate) locks: LockManager,
    next_connection: AtomicU64,
}

pub(crate) fn no_collection(target: &str) -> BackendError {
    BackendError::Query {
        backend_name: "memory".to_string(),
        message: format!("no such collection: {}", target),
    }
}

/// Document store kept in process memory.
///
/// Every connection sees committed documents only, plus its own
/// uncommitted writes. Writes take row locks held until commit or rollback;
/// lock cycles are reported as deadlocks.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
    config: MemoryBackendConfig,
}

impl MemoryBackend {
    /// Creates an empty store with default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryBackendConfig::default())
    }

    pub fn with_config(config: MemoryBackendConfig) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            config,
        }
    }

    pub fn config(&self) -> &MemoryBackendConfig {
        &self.config
    }

    /// Number of committed documents in a collection.
    pub fn document_count(&self, target: &str) -> Option<usize> {
        self.shared.collections.lock().get(target).map(Collection::len)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn dialect(&self) -> QueryDialect {
        QueryDialect::Document
    }

    async fn acquire(&self) -> BackendResult<Box<dyn Connection>> {
        let id = self.shared.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Box::new(MemoryConnection::new(
            id,
            Arc::clone(&self.shared),
            self.config.clone(),
        )))
    }

    async fn synchronize(&self, registry: &SchemaRegistry) -> BackendResult<()> {
        let mut collections = self.shared.collections.lock();
        for (target, _) in registry.storage_targets() {
            if !collections.contains_key(target) {
                collections.insert(target.to_string(), Collection::default());
                tracing::info!(collection = %target, "Created collection");
            }
        }
        Ok(())
    }

    async fn drop_storage(&self, target: &str) -> BackendResult<()> {
        self.shared.collections.lock().remove(target);
        tracing::info!(collection = %target, "Dropped collection");
        Ok(())
    }

    async fn health_check(&self) -> BackendResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema::{ScalarKind, Template};

    #[test]
    fn test_collection_keeps_insertion_order() {
        let mut collection = Collection::default();
        for id in ["c", "a", "b"] {
            let mut row = Row::new();
            row.insert("_id".to_string(), json!(id));
            collection.upsert(id, row);
        }
        let mut replaced = Row::new();
        replaced.insert("_id".to_string(), json!("a"));
        replaced.insert("x".to_string(), json!(1));
        collection.upsert("a", replaced);
        collection.remove("c");

        let ids: Vec<_> = collection.iter().map(|r| r["_id"].clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("b")]);
        assert_eq!(collection.get("a").unwrap()["x"], json!(1));
        assert!(!collection.contains("c"));
    }

    #[tokio::test]
    async fn test_synchronize_and_drop() {
        let registry = SchemaRegistry::builder()
            .template(Template::new("Customer").scalar("name", ScalarKind::String))
            .build()
            .unwrap();
        let backend = MemoryBackend::new();
        assert_eq!(backend.document_count("Customer"), None);
        backend.synchronize(&registry).await.unwrap();
        assert_eq!(backend.document_count("Customer"), Some(0));
        backend.drop_storage("Customer").await.unwrap();
        assert_eq!(backend.document_count("Customer"), None);
        assert_eq!(backend.dialect(), QueryDialect::Document);
    }
}
