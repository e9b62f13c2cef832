//! The per-connection adapter contract.

use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::BackendResult;
use crate::query::{NativePredicate, Pagination, SortSpec};

/// A stored row or document: column/field name to value.
pub type Row = Map<String, Value>;

/// One backend connection.
///
/// Outside a transaction every statement commits on its own. Inside one,
/// reads see the connection's own uncommitted writes plus whatever other
/// transactions have committed, never their uncommitted state.
///
/// Errors are reported verbatim. The engine never reinterprets them except
/// for an `update` affecting zero rows, which it treats as a version conflict.
#[async_trait]
pub trait Connection: Send + Debug {
    /// Opens a transaction on this connection.
    async fn begin(&mut self) -> BackendResult<()>;

    /// Commits the open transaction.
    async fn commit(&mut self) -> BackendResult<()>;

    /// Rolls back the open transaction.
    async fn rollback(&mut self) -> BackendResult<()>;

    /// Whether a transaction is open.
    fn in_transaction(&self) -> bool;

    /// Selects rows of `target` matching `predicate`.
    async fn query(
        &mut self,
        target: &str,
        predicate: &NativePredicate,
        sort: &SortSpec,
        page: Pagination,
    ) -> BackendResult<Vec<Row>>;

    /// Counts rows of `target` matching `predicate`.
    async fn count(&mut self, target: &str, predicate: &NativePredicate) -> BackendResult<u64>;

    /// Current stored version of one row, `None` if it does not exist.
    async fn read_version(&mut self, target: &str, id: &str) -> BackendResult<Option<i64>>;

    /// Acquires the row lock an update would take, waiting if necessary.
    async fn lock_row(&mut self, target: &str, id: &str) -> BackendResult<()>;

    /// Inserts a row and returns its identity.
    ///
    /// A row without `_id` gets a backend-assigned identity.
    async fn insert(&mut self, target: &str, row: Row) -> BackendResult<String>;

    /// Replaces the stored columns of one row if its version equals
    /// `expected_version`. Returns the number of rows affected.
    async fn update(
        &mut self,
        target: &str,
        id: &str,
        row: Row,
        expected_version: i64,
    ) -> BackendResult<u64>;

    /// Deletes one row. Returns the number of rows affected.
    async fn delete(&mut self, target: &str, id: &str) -> BackendResult<u64>;
}
