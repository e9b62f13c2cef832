//! In-process document backend.
//!
//! Evaluates document predicates over collections held in memory. Each
//! connection reads committed documents plus its own pending writes, and
//! writes take row locks that are held until the transaction ends. Lock
//! cycles between connections surface as [`BackendError::Deadlock`], which
//! makes this backend the reference for deadlock-retry behavior.
//!
//! [`BackendError::Deadlock`]: crate::error::BackendError::Deadlock

mod backend;
mod connection;
mod lock;

pub use backend::{MemoryBackend, MemoryBackendConfig};
pub use connection::MemoryConnection;
