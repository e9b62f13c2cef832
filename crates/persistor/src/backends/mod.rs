//! Backend adapter implementations.
//!
//! | Backend | Feature | Dialect | Description |
//! |---------|---------|---------|-------------|
//! | Memory | always | document | In-process collections with row locks and deadlock detection |
//! | SQLite | `sqlite` | SQL | Embedded database, file-based or in-memory |
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "sqlite")]
//! use helios_persistor::backends::sqlite::SqliteBackend;
//! use helios_persistor::backends::memory::MemoryBackend;
//!
//! # #[cfg(feature = "sqlite")]
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = MemoryBackend::new();
//!
//! // Or a file-based SQLite database
//! let backend = SqliteBackend::open("./data/bank.db")?;
//! # Ok(())
//! # }
//! ```

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;
