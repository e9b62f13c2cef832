//! Backend adapter contract.
//!
//! - [`Backend`] - connection pool and storage management
//! - [`Connection`] - statements, transactions and row locks on one connection
//!
//! The mapper and transaction manager depend only on these traits; concrete
//! adapters live in [`crate::backends`].

pub mod backend;
pub mod connection;

pub use backend::{Backend, BackendKind};
pub use connection::{Connection, Row};
