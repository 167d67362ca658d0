//! # xapool Resource
//!
//! XA resource abstractions for xapool.
//!
//! This crate is the lowest layer of the workspace. It describes what an
//! XA-capable backing resource looks like to the pool, without knowing
//! anything about pooling, transaction registries, or recovery scheduling.
//!
//! ## Design Principles
//!
//! - A [`XaDataSource`] opens physical [`XaConnection`]s for a given set of
//!   [`Credentials`]
//! - Every connection exposes a shared [`XaResource`] handle so a
//!   transaction coordinator can drive the branch even after the connection
//!   went back to its pool
//! - All handles must be `Send` (and `Sync` where shared) for concurrent use
//!
//! ## Available Resources
//!
//! - [`InMemoryXaDataSource`] - For testing, simulation and fault injection
//!
//! ## Example
//!
//! ```rust
//! use xapool_resource::{Credentials, InMemoryXaDataSource, ResourceDescriptor, XaDataSource};
//!
//! let source = InMemoryXaDataSource::new(ResourceDescriptor::new(
//!     "db1",
//!     Credentials::new("app", "secret"),
//! ));
//! let mut conn = source.connect(&Credentials::new("app", "secret")).unwrap();
//! conn.execute("insert into t values (1)").unwrap();
//! assert_eq!(source.committed_statements(), vec!["insert into t values (1)"]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod credentials;
mod error;
mod memory;
mod source;
mod xid;

pub use credentials::{Credentials, ResourceDescriptor};
pub use error::{ResourceError, ResourceResult, XaErrorCode};
pub use memory::InMemoryXaDataSource;
pub use source::{Vote, XaConnection, XaDataSource, XaResource};
pub use xid::{Xid, MAX_BQUAL_SIZE, MAX_GTRID_SIZE};
