//! Connection factories.
//!
//! - [`XaConnectionFactory`] opens physical XA connections and enlists
//!   them in transactions
//! - [`PoolableConnectionFactory`] adapts it to the pool's lifecycle hooks

mod poolable;
mod xa;

pub use poolable::PoolableConnectionFactory;
pub use xa::{XaConnectionFactory, XaPooledConnection};
