//! Test infrastructure for the persistence engine.
//!
//! Shared by every integration test binary; each binary uses a different
//! subset, hence the dead-code allowance.

#![allow(dead_code)]

pub mod fixtures;
pub mod harness;

pub use fixtures::*;
pub use harness::*;
