//! SQLite backend.
//!
//! Each storage target is a table with one column per scalar property and
//! foreign key, plus the reserved `_id`, `__version__` and `_template`
//! columns. Filters arrive as SQL fragments; `$regex` is evaluated by a
//! `regexp` function registered on every pooled connection.
//!
//! # Example
//!
//! ```no_run
//! use helios_persistor::backends::sqlite::SqliteBackend;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Create an in-memory database
//! let backend = SqliteBackend::in_memory()?;
//!
//! // Or use a file-based database
//! let backend = SqliteBackend::open("./data/bank.db")?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod connection;
mod schema;

pub use backend::{SqliteBackend, SqliteBackendConfig};
pub use connection::SqliteConnection;
