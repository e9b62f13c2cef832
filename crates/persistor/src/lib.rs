//! Helios Persistor
//!
//! An object-persistence engine that maps a graph of domain objects onto a
//! relational store (SQL) or a document store, driven by a declarative
//! schema, with transactional saves, optimistic version checks and deadlock
//! recovery.
//!
//! # Features
//!
//! - **Declarative schema**: templates, typed properties, parent/child
//!   relationships with foreign keys, eager fetching and orphan pruning
//! - **Mongo-style filters**: `$in`, `$nin`, `$gt`, `$gte`, `$lt`, `$lte`,
//!   `$ne`, `$eq`, `$regex`/`$options`, `$or`, `$and`, translated to SQL or
//!   to a document predicate
//! - **Transactions**: dirty tracking, cascade saves, foreign-key ordered
//!   writes, `preSave`/`postSave` hooks, all-or-nothing commits
//! - **Concurrency**: optimistic locking ("Update Conflict") and automatic
//!   retry of backend deadlocks
//!
//! Backends:
//! - `sqlite` (default) - SQLite with in-memory and file modes
//! - memory - in-process document store, always available
//!
//! # Architecture
//!
//! - [`schema`] - Schema Registry and property metadata
//! - [`query`] - filter DSL and its translation to backend predicates
//! - [`instance`] - instances, the object graph, dirty/version tracking
//! - [`mapper`] - fetch specifications; the read and write paths
//! - [`transaction`] - transactions and the transaction manager
//! - [`core`] - the backend adapter contract
//! - [`backends`] - SQLite and memory adapters
//! - [`engine`] - [`Persistor`], the context every operation goes through
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use helios_persistor::backends::memory::MemoryBackend;
//! use helios_persistor::schema::{ScalarKind, SchemaRegistry, Template};
//! use helios_persistor::{FetchRequest, Persistor, PersistorConfig, TransactionOptions};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = SchemaRegistry::builder()
//!     .template(Template::new("Customer").scalar("name", ScalarKind::String))
//!     .build()?;
//! let persistor = Persistor::new(
//!     Arc::new(registry),
//!     Arc::new(MemoryBackend::new()),
//!     PersistorConfig::default(),
//! )?;
//! persistor.synchronize().await?;
//!
//! let mut graph = persistor.graph();
//! let sam = graph.create("Customer")?;
//! graph.set(sam, "name", "Sam")?;
//!
//! let mut txn = persistor.begin(TransactionOptions::default()).await?;
//! txn.set_dirty(&mut graph, sam)?;
//! persistor.end(&mut txn, &mut graph).await?;
//!
//! let found = persistor
//!     .fetch(&mut graph, &FetchRequest::new("Customer").filter(json!({"name": "Sam"})))
//!     .await?;
//! assert_eq!(found.len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

pub mod backends;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod instance;
pub mod mapper;
pub mod query;
pub mod schema;
pub mod transaction;

// Re-export commonly used types at crate root
pub use config::PersistorConfig;
pub use engine::{FetchRequest, Persistor};
pub use error::{StorageError, StorageResult};
pub use instance::{Instance, InstanceId, InstanceState, ObjectGraph};
pub use mapper::{FetchDirective, FetchSpec};
pub use query::{Pagination, SortDirection, SortSpec};
pub use schema::{SchemaRegistry, Template};

// Re-export core traits
pub use core::{Backend, BackendKind, Connection};

pub use transaction::{SaveReport, SaveScope, Transaction, TransactionOptions, TransactionState};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
