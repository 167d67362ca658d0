//! Lifecycle hooks for pooled XA connections.

use crate::error::{CoreError, CoreResult};
use crate::factory::xa::{XaConnectionFactory, XaPooledConnection};
use crate::pool::{PooledObject, PooledObjectFactory};
use std::sync::Arc;
use tracing::{debug, warn};

/// Makes, checks and retires pooled XA connections.
#[derive(Debug)]
pub struct PoolableConnectionFactory {
    factory: Arc<XaConnectionFactory>,
    validation_query: Option<String>,
}

impl PoolableConnectionFactory {
    /// Wraps an XA connection factory.
    ///
    /// Connections are validated with `validation_query` when set and with
    /// a ping otherwise.
    pub fn new(factory: Arc<XaConnectionFactory>, validation_query: Option<String>) -> Self {
        Self {
            factory,
            validation_query,
        }
    }

    /// Returns the wrapped XA connection factory.
    #[must_use]
    pub fn connection_factory(&self) -> &Arc<XaConnectionFactory> {
        &self.factory
    }

    /// Returns the validation query.
    #[must_use]
    pub fn validation_query(&self) -> Option<&str> {
        self.validation_query.as_deref()
    }
}

impl PooledObjectFactory for PoolableConnectionFactory {
    type Object = XaPooledConnection;

    fn make_object(&self) -> CoreResult<XaPooledConnection> {
        self.factory.create_connection(None)
    }

    fn validate_object(&self, obj: &mut PooledObject<XaPooledConnection>) -> CoreResult<()> {
        let id = obj.connection_id();
        let conn = obj.connection_mut();
        let checked = match &self.validation_query {
            Some(query) => conn.execute(query).map(|_| ()),
            None => conn.ping(),
        };
        checked.map_err(|e| CoreError::ConnectionValidationFailed {
            connection: id.as_u64(),
            reason: e.to_string(),
        })
    }

    fn activate_object(&self, obj: &mut PooledObject<XaPooledConnection>) -> CoreResult<()> {
        obj.connection_mut().set_auto_commit(true)?;
        Ok(())
    }

    fn passivate_object(&self, obj: &mut PooledObject<XaPooledConnection>) -> CoreResult<()> {
        if let Some((txid, xid)) = obj.unbind() {
            debug!(connection = %obj.connection_id(), transaction = %txid, xid = %xid, "connection left its branch");
        }
        obj.connection_mut().reset()?;
        Ok(())
    }

    fn destroy_object(&self, obj: PooledObject<XaPooledConnection>) -> CoreResult<()> {
        let mut conn = obj.into_inner();
        let id = conn.connection_id();
        // the connection is unusable either way
        match conn.connection_mut().close() {
            Ok(()) => debug!(connection = %id, "physical connection closed"),
            Err(e) => warn!(connection = %id, error = %e, "failed to close physical connection"),
        }
        Ok(())
    }
}
