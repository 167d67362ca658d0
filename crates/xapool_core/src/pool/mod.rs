//! Generic object pooling.
//!
//! [`ConnectionPool`] is generic over a [`PooledObjectFactory`]; the
//! data source instantiates it with the poolable XA connection factory,
//! tests with whatever objects they like.

mod connection_pool;
mod object;

pub use connection_pool::{ConnectionPool, EvictionReport, PoolStats, WeakConnectionPool};
pub use object::{PooledObject, PooledObjectFactory};
