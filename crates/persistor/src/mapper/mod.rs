//! Object/storage mapping.
//!
//! The read side ([`read`]) turns rows into instances and resolves
//! relationships according to a [`FetchSpec`] plus the schema's eager
//! flags. The write side ([`write`]) turns a set of dirty instances into an
//! ordered list of inserts, updates and deletes.
//!
//! Both sides work on a single [`Connection`](crate::core::Connection) handed
//! to them by the caller; neither opens or ends transactions.

pub mod fetch_spec;
pub(crate) mod read;
pub(crate) mod write;

pub use fetch_spec::{FetchDirective, FetchSpec};
