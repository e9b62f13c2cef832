//! SQLite backend implementation.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use serde::{Deserialize, Serialize};

use crate::core::{Backend, BackendKind, Connection};
use crate::error::{BackendError, BackendResult};
use crate::query::QueryDialect;
use crate::schema::SchemaRegistry;

use super::connection::SqliteConnection;
use super::schema;

/// SQLite backend.
pub struct SqliteBackend {
    pool: Pool<SqliteConnectionManager>,
    config: SqliteBackendConfig,
    is_memory: bool,
}

impl Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("config", &self.config)
            .field("is_memory", &self.is_memory)
            .field("pool_size", &self.pool.state().connections)
            .finish_non_exhaustive()
    }
}

/// Configuration for the SQLite backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteBackendConfig {
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,

    /// Enable WAL mode for better concurrency.
    #[serde(default = "default_true")]
    pub enable_wal: bool,
}

fn default_max_connections() -> u32 {
    10
}

fn default_connection_timeout_ms() -> u64 {
    30000
}

fn default_busy_timeout_ms() -> u32 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for SqliteBackendConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            enable_wal: true,
        }
    }
}

fn connection_failed(message: String) -> BackendError {
    BackendError::ConnectionFailed {
        backend_name: "sqlite".to_string(),
        message,
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Registers `regexp(pattern, text)`, which backs the `REGEXP` operator.
///
/// Case-insensitivity and other options arrive inline in the pattern. Only
/// text values can match, as in the document dialect. The compiled pattern
/// is cached per statement.
fn register_regexp(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let regex: Arc<Regex> = ctx.get_or_create_aux(0, |pattern| -> Result<_, BoxError> {
                Ok(Regex::new(pattern.as_str()?)?)
            })?;
            let matched = match ctx.get_raw(1) {
                ValueRef::Text(bytes) => regex.is_match(&String::from_utf8_lossy(bytes)),
                _ => false,
            };
            Ok(matched)
        },
    )
}

impl SqliteBackend {
    /// Creates a new in-memory SQLite backend.
    ///
    /// The pool holds a single connection. Transactions on it always run
    /// in shared-connection mode.
    pub fn in_memory() -> BackendResult<Self> {
        Self::with_config(":memory:", SqliteBackendConfig::default())
    }

    /// Opens or creates a file-based SQLite database.
    pub fn open<P: AsRef<Path>>(path: P) -> BackendResult<Self> {
        Self::with_config(path, SqliteBackendConfig::default())
    }

    /// Creates a backend with custom configuration.
    pub fn with_config<P: AsRef<Path>>(path: P, config: SqliteBackendConfig) -> BackendResult<Self> {
        let path_str = path.as_ref().to_string_lossy();
        let is_memory = path_str == ":memory:";

        let busy_timeout = Duration::from_millis(u64::from(config.busy_timeout_ms));
        let manager = if is_memory {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(path.as_ref())
        }
        .with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            register_regexp(conn)
        });

        let mut builder = Pool::builder().connection_timeout(Duration::from_millis(config.connection_timeout_ms));
        builder = if is_memory {
            // Every pooled connection to ":memory:" would be its own database.
            builder.max_size(1).min_idle(Some(1)).idle_timeout(None).max_lifetime(None)
        } else {
            builder.max_size(config.max_connections)
        };
        let pool = builder
            .build(manager)
            .map_err(|e| connection_failed(e.to_string()))?;

        let backend = Self {
            pool,
            config,
            is_memory,
        };
        backend.configure_connection()?;

        tracing::info!(path = %path_str, is_memory, "Opened SQLite backend");
        Ok(backend)
    }

    /// Get a connection from the pool.
    pub(crate) fn get_connection(&self) -> BackendResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| connection_failed(e.to_string()))
    }

    /// Configure database-wide settings.
    fn configure_connection(&self) -> BackendResult<()> {
        if self.config.enable_wal && !self.is_memory {
            let conn = self.get_connection()?;
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
                .map_err(|e| BackendError::Internal {
                    backend_name: "sqlite".to_string(),
                    message: format!("Failed to enable WAL mode: {}", e),
                })?;
        }
        Ok(())
    }

    /// Returns whether this is an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.is_memory
    }

    /// Returns the backend configuration.
    pub fn config(&self) -> &SqliteBackendConfig {
        &self.config
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn dialect(&self) -> QueryDialect {
        QueryDialect::Sql
    }

    async fn acquire(&self) -> BackendResult<Box<dyn Connection>> {
        let conn = self.get_connection()?;
        Ok(Box::new(SqliteConnection::new(conn)))
    }

    fn is_single_connection(&self) -> bool {
        self.is_memory
    }

    async fn synchronize(&self, registry: &SchemaRegistry) -> BackendResult<()> {
        let conn = self.get_connection()?;
        schema::synchronize(&conn, registry)
    }

    async fn drop_storage(&self, target: &str) -> BackendResult<()> {
        let conn = self.get_connection()?;
        schema::drop_table(&conn, target)
    }

    async fn health_check(&self) -> BackendResult<()> {
        let conn = self.get_connection()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| BackendError::Internal {
                backend_name: "sqlite".to_string(),
                message: format!("Health check failed: {}", e),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SqliteBackendConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.connection_timeout_ms, 30000);
        assert_eq!(config.busy_timeout_ms, 5000);
        assert!(config.enable_wal);

        let parsed: SqliteBackendConfig = serde_json::from_str(r#"{"max_connections": 2}"#).unwrap();
        assert_eq!(parsed.max_connections, 2);
        assert_eq!(parsed.busy_timeout_ms, 5000);
    }

    #[tokio::test]
    async fn test_in_memory_health_check() {
        let backend = SqliteBackend::in_memory().unwrap();
        assert!(backend.is_memory());
        assert_eq!(backend.kind(), BackendKind::Sqlite);
        assert_eq!(backend.dialect(), QueryDialect::Sql);
        backend.health_check().await.unwrap();
    }

    #[test]
    fn test_regexp_function() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        register_regexp(&conn).unwrap();
        let hit: bool = conn
            .query_row("SELECT 'Sam' REGEXP '(?i)^sam$'", [], |row| row.get(0))
            .unwrap();
        assert!(hit);
        let miss: bool = conn
            .query_row("SELECT 'Karen' REGEXP '^sam'", [], |row| row.get(0))
            .unwrap();
        assert!(!miss);
        let number: bool = conn
            .query_row("SELECT 250 REGEXP '^2'", [], |row| row.get(0))
            .unwrap();
        assert!(!number);
        let numeric_text: bool = conn
            .query_row("SELECT '250' REGEXP '^2'", [], |row| row.get(0))
            .unwrap();
        assert!(numeric_text);
    }

    #[test]
    fn test_regexp_pattern_reused_across_rows() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        register_regexp(&conn).unwrap();
        conn.execute_batch(
            "CREATE TABLE t (name TEXT); INSERT INTO t VALUES ('Sam'), ('sandy'), ('Karen'), (NULL);",
        )
        .unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t WHERE name REGEXP ?1", ["(?i)^sa"], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);

        let err = conn
            .query_row("SELECT 'Sam' REGEXP '('", [], |row| row.get::<_, bool>(0))
            .unwrap_err();
        assert!(err.to_string().contains("regex"));
    }
}
