//! Memory implementation of [`Connection`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{Connection, Row};
use crate::error::{BackendError, BackendResult};
use crate::query::{DocumentQuery, NativePredicate, Pagination, SortSpec};
use crate::schema::{PRIMARY_KEY, VERSION_COLUMN};

use super::backend::{MemoryBackendConfig, Shared, no_collection};
use super::lock::ConnectionId;

type RowKey = (String, String);

/// Uncommitted writes of one transaction; `None` marks a delete.
#[derive(Debug, Default)]
struct PendingTxn {
    order: Vec<RowKey>,
    writes: HashMap<RowKey, Option<Row>>,
}

impl PendingTxn {
    fn record(&mut self, key: RowKey, write: Option<Row>) {
        if !self.writes.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.writes.insert(key, write);
    }
}

fn version_of(document: &Row) -> i64 {
    document
        .get(VERSION_COLUMN)
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn document_predicate(predicate: &NativePredicate) -> BackendResult<&DocumentQuery> {
    match predicate {
        NativePredicate::Document(query) => Ok(query),
        other => Err(BackendError::UnsupportedPredicate {
            backend_name: "memory".to_string(),
            dialect: other.dialect().to_string(),
        }),
    }
}

/// A connection to a [`MemoryBackend`](super::MemoryBackend).
///
/// Statements outside a transaction commit immediately, still honoring row
/// locks held by open transactions.
pub struct MemoryConnection {
    id: ConnectionId,
    shared: Arc<Shared>,
    config: MemoryBackendConfig,
    txn: Option<PendingTxn>,
}

impl Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("in_transaction", &self.txn.is_some())
            .finish()
    }
}

impl MemoryConnection {
    pub(crate) fn new(id: ConnectionId, shared: Arc<Shared>, config: MemoryBackendConfig) -> Self {
        Self {
            id,
            shared,
            config,
            txn: None,
        }
    }

    /// Suspension point before every statement.
    async fn statement(&self) {
        if self.config.yield_per_statement {
            tokio::task::yield_now().await;
        }
    }

    async fn lock(&self, target: &str, id: &str) -> BackendResult<()> {
        self.shared
            .locks
            .acquire(
                self.id,
                target,
                id,
                Duration::from_millis(self.config.lock_timeout_ms),
            )
            .await
    }

    /// Committed documents of `target` overlaid with this connection's writes.
    fn visible(&self, target: &str) -> BackendResult<Vec<Row>> {
        let collections = self.shared.collections.lock();
        let collection = collections.get(target).ok_or_else(|| no_collection(target))?;
        let pending = self.txn.as_ref();

        let mut out = Vec::with_capacity(collection.len());
        for document in collection.iter() {
            let id = document.get(PRIMARY_KEY).and_then(Value::as_str).unwrap_or_default();
            match pending.and_then(|p| p.writes.get(&(target.to_string(), id.to_string()))) {
                Some(Some(written)) => out.push(written.clone()),
                Some(None) => {}
                None => out.push(document.clone()),
            }
        }
        if let Some(pending) = pending {
            for key in pending.order.iter().filter(|(t, id)| t == target && !collection.contains(id)) {
                if let Some(Some(written)) = pending.writes.get(key) {
                    out.push(written.clone());
                }
            }
        }
        Ok(out)
    }

    fn visible_document(&self, target: &str, id: &str) -> BackendResult<Option<Row>> {
        let key = (target.to_string(), id.to_string());
        if let Some(write) = self.txn.as_ref().and_then(|p| p.writes.get(&key)) {
            return Ok(write.clone());
        }
        let collections = self.shared.collections.lock();
        let collection = collections.get(target).ok_or_else(|| no_collection(target))?;
        Ok(collection.get(id).cloned())
    }

    /// Opens an implicit transaction for a write outside `begin`/`commit`.
    fn open_implicit(&mut self) -> bool {
        if self.txn.is_some() {
            false
        } else {
            self.txn = Some(PendingTxn::default());
            true
        }
    }

    fn close_implicit<T>(&mut self, implicit: bool, result: BackendResult<T>) -> BackendResult<T> {
        if implicit {
            match &result {
                Ok(_) => self.apply(),
                Err(_) => self.discard(),
            }
        }
        result
    }

    fn record(&mut self, target: &str, id: &str, write: Option<Row>) -> BackendResult<()> {
        let txn = self.txn.as_mut().ok_or_else(|| BackendError::NoTransaction {
            backend_name: "memory".to_string(),
        })?;
        txn.record((target.to_string(), id.to_string()), write);
        Ok(())
    }

    /// Publishes pending writes and releases this connection's locks.
    fn apply(&mut self) {
        if let Some(txn) = self.txn.take() {
            let mut pending = txn.writes;
            let mut collections = self.shared.collections.lock();
            for key in txn.order {
                let write = pending.remove(&key).flatten();
                let (target, id) = key;
                if let Some(collection) = collections.get_mut(&target) {
                    match write {
                        Some(document) => collection.upsert(&id, document),
                        None => collection.remove(&id),
                    }
                }
            }
        }
        self.shared.locks.release_all(self.id);
    }

    fn discard(&mut self) {
        self.txn = None;
        self.shared.locks.release_all(self.id);
    }

    async fn write_update(&mut self, target: &str, id: &str, row: Row, expected_version: i64) -> BackendResult<u64> {
        self.lock(target, id).await?;
        let mut document = match self.visible_document(target, id)? {
            Some(document) => document,
            None => return Ok(0),
        };
        if version_of(&document) != expected_version {
            return Ok(0);
        }
        for (field, value) in row {
            if field != PRIMARY_KEY {
                document.insert(field, value);
            }
        }
        self.record(target, id, Some(document))?;
        Ok(1)
    }

    async fn write_delete(&mut self, target: &str, id: &str) -> BackendResult<u64> {
        self.lock(target, id).await?;
        if self.visible_document(target, id)?.is_none() {
            return Ok(0);
        }
        self.record(target, id, None)?;
        Ok(1)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.txn.is_some() {
            tracing::debug!(conn = self.id, "Discarding abandoned memory transaction");
            self.discard();
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn begin(&mut self) -> BackendResult<()> {
        if self.txn.is_some() {
            return Err(BackendError::Internal {
                backend_name: "memory".to_string(),
                message: "transaction already open".to_string(),
            });
        }
        self.txn = Some(PendingTxn::default());
        Ok(())
    }

    async fn commit(&mut self) -> BackendResult<()> {
        if self.txn.is_none() {
            return Err(BackendError::NoTransaction {
                backend_name: "memory".to_string(),
            });
        }
        self.statement().await;
        self.apply();
        Ok(())
    }

    async fn rollback(&mut self) -> BackendResult<()> {
        if self.txn.is_none() {
            return Err(BackendError::NoTransaction {
                backend_name: "memory".to_string(),
            });
        }
        self.discard();
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    async fn query(
        &mut self,
        target: &str,
        predicate: &NativePredicate,
        sort: &SortSpec,
        page: Pagination,
    ) -> BackendResult<Vec<Row>> {
        let query = document_predicate(predicate)?;
        self.statement().await;
        let mut rows: Vec<Row> = self
            .visible(target)?
            .into_iter()
            .filter(|document| query.matches(document))
            .collect();
        if !sort.is_empty() {
            rows.sort_by(|a, b| sort.compare(a, b));
        }
        Ok(page.apply(rows))
    }

    async fn count(&mut self, target: &str, predicate: &NativePredicate) -> BackendResult<u64> {
        let query = document_predicate(predicate)?;
        self.statement().await;
        let count = self
            .visible(target)?
            .iter()
            .filter(|document| query.matches(document))
            .count();
        Ok(count as u64)
    }

    async fn read_version(&mut self, target: &str, id: &str) -> BackendResult<Option<i64>> {
        self.statement().await;
        Ok(self.visible_document(target, id)?.as_ref().map(version_of))
    }

    async fn lock_row(&mut self, target: &str, id: &str) -> BackendResult<()> {
        self.statement().await;
        self.visible_document(target, id)?;
        let implicit = self.open_implicit();
        let result = self.lock(target, id).await;
        self.close_implicit(implicit, result)
    }

    async fn insert(&mut self, target: &str, mut row: Row) -> BackendResult<String> {
        self.statement().await;
        let id = match row.get(PRIMARY_KEY) {
            Some(Value::String(id)) => id.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        if self.visible_document(target, &id)?.is_some() {
            return Err(BackendError::Query {
                backend_name: "memory".to_string(),
                message: format!("duplicate key {} in {}", id, target),
            });
        }
        row.insert(PRIMARY_KEY.to_string(), Value::String(id.clone()));

        let implicit = self.open_implicit();
        let result = match self.lock(target, &id).await {
            Ok(()) => self.record(target, &id, Some(row)),
            Err(e) => Err(e),
        };
        self.close_implicit(implicit, result.map(|()| id))
    }

    async fn update(
        &mut self,
        target: &str,
        id: &str,
        row: Row,
        expected_version: i64,
    ) -> BackendResult<u64> {
        self.statement().await;
        let implicit = self.open_implicit();
        let result = self.write_update(target, id, row, expected_version).await;
        self.close_implicit(implicit, result)
    }

    async fn delete(&mut self, target: &str, id: &str) -> BackendResult<u64> {
        self.statement().await;
        let implicit = self.open_implicit();
        let result = self.write_delete(target, id).await;
        self.close_implicit(implicit, result)
    }
}
