//! Backends under test.
//!
//! [`TestContext`] owns a [`Persistor`] over the banking schema with storage
//! already synchronized. The [`backend_test!`] macro runs one scenario
//! against every enabled backend.

use std::sync::Arc;

use helios_persistor::backends::memory::MemoryBackend;
use helios_persistor::{Persistor, PersistorConfig, SchemaRegistry};
use tempfile::TempDir;

/// The banking schema used throughout the integration tests.
pub const BANKING_SCHEMA: &str = include_str!("../fixtures/banking.json");

/// A persistor plus whatever must outlive it.
pub struct TestContext {
    pub persistor: Persistor,
    _dir: Option<TempDir>,
}

pub fn banking_registry() -> Arc<SchemaRegistry> {
    Arc::new(SchemaRegistry::from_json_str(BANKING_SCHEMA).expect("Failed to parse banking schema"))
}

pub async fn create_memory_persistor(config: PersistorConfig) -> Persistor {
    let persistor = Persistor::new(banking_registry(), Arc::new(MemoryBackend::new()), config)
        .expect("Failed to create persistor");
    persistor
        .synchronize()
        .await
        .expect("Failed to synchronize storage");
    persistor
}

pub async fn create_memory_context() -> TestContext {
    TestContext {
        persistor: create_memory_persistor(PersistorConfig::default()).await,
        _dir: None,
    }
}

/// A file-backed SQLite database in a fresh temporary directory.
///
/// File mode rather than `:memory:` so transactions hold a dedicated
/// connection from `begin` to `end`, as on a multi-connection pool.
#[cfg(feature = "sqlite")]
pub async fn create_sqlite_context() -> TestContext {
    use helios_persistor::backends::sqlite::SqliteBackend;

    let dir = TempDir::new().expect("Failed to create temp dir");
    let backend = SqliteBackend::open(dir.path().join("bank.db")).expect("Failed to create SQLite backend");
    let persistor = Persistor::new(banking_registry(), Arc::new(backend), PersistorConfig::default())
        .expect("Failed to create persistor");
    persistor
        .synchronize()
        .await
        .expect("Failed to synchronize storage");
    TestContext {
        persistor,
        _dir: Some(dir),
    }
}

/// Generates one `#[tokio::test]` per backend for a scenario taking
/// `&Persistor`.
///
/// ```ignore
/// async fn can_insert(persistor: &Persistor) { ... }
/// backend_test!(can_insert);
/// ```
#[macro_export]
macro_rules! backend_test {
    ($test_fn:ident) => {
        paste::paste! {
            #[tokio::test]
            async fn [<memory_ $test_fn>]() {
                let context = $crate::common::create_memory_context().await;
                $test_fn(&context.persistor).await;
            }

            #[cfg(feature = "sqlite")]
            #[tokio::test]
            async fn [<sqlite_ $test_fn>]() {
                let context = $crate::common::create_sqlite_context().await;
                $test_fn(&context.persistor).await;
            }
        }
    };
}
