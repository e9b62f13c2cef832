//! Backend abstraction for storage drivers.
//!
//! A [`Backend`] owns a connection pool and the storage layout; every
//! statement runs on a [`Connection`] acquired from it. The engine only ever
//! talks to storage through these two traits.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::error::BackendResult;
use crate::query::QueryDialect;
use crate::schema::SchemaRegistry;

use super::connection::Connection;

/// Identifies the type of storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// SQLite database (file-based or in-memory).
    Sqlite,
    /// In-process document store.
    Memory,
    /// Custom or unknown backend.
    Custom(&'static str),
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// A storage backend: connection pool plus storage management.
///
/// # Example
///
/// ```ignore
/// let backend: Arc<dyn Backend> = Arc::new(SqliteBackend::open("bank.db")?);
/// backend.synchronize(&registry).await?;
///
/// let mut conn = backend.acquire().await?;
/// conn.begin().await?;
/// let id = conn.insert("customer", row).await?;
/// conn.commit().await?;
/// ```
#[async_trait]
pub trait Backend: Send + Sync + Debug {
    /// Returns the kind of backend.
    fn kind(&self) -> BackendKind;

    /// Returns the backend name for logging and error messages.
    fn name(&self) -> &'static str;

    /// The predicate language this backend's connections evaluate.
    fn dialect(&self) -> QueryDialect;

    /// Acquires a connection from the pool.
    ///
    /// The connection starts in autocommit mode; call
    /// [`Connection::begin`] to open a transaction on it.
    async fn acquire(&self) -> BackendResult<Box<dyn Connection>>;

    /// Whether the pool holds exactly one connection.
    ///
    /// Transactions on such a backend borrow the connection only for the
    /// write phase, so reads between `begin` and `end` can still run.
    fn is_single_connection(&self) -> bool {
        false
    }

    /// Creates missing tables/collections and columns for every storage target.
    async fn synchronize(&self, registry: &SchemaRegistry) -> BackendResult<()>;

    /// Drops one storage target and everything in it.
    async fn drop_storage(&self, target: &str) -> BackendResult<()>;

    /// Checks that the backend is reachable.
    async fn health_check(&self) -> BackendResult<()>;
}
