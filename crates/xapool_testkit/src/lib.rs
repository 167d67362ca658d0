//! # xapool Testkit
//!
//! Test utilities for xapool.
//!
//! This crate provides:
//! - Fixtures wiring an in-memory resource, a transaction manager, a
//!   recovery manager and a managed data source
//! - Helpers that leave in-doubt branches behind, as a crashed coordinator would
//! - Integration scenarios across pool, registry and transaction manager
//! - Crash recovery scenarios
//! - Property-based test generators using proptest
//! - Stress testing utilities with pool metrics
//!
//! ## Usage
//!
//! ```rust
//! use xapool_testkit::prelude::*;
//!
//! with_env(test_config(), |env| {
//!     let txn = env.tm.begin();
//!     let mut conn = env.ds.get_connection(Some(&txn)).unwrap();
//!     conn.execute("insert into t values (1)").unwrap();
//!     drop(conn);
//!     env.tm.commit(&txn).unwrap();
//!     assert_eq!(env.source.committed_statements().len(), 1);
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
