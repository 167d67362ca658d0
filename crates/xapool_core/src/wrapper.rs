//! Wiring of a pooled, recoverable data source.

use crate::config::DataSourceConfig;
use crate::datasource::ManagedDataSource;
use crate::error::{CoreError, CoreResult};
use crate::factory::{PoolableConnectionFactory, XaConnectionFactory};
use crate::pool::ConnectionPool;
use crate::recovery::{DataSourceRecoveryHelper, RecoveryManager};
use crate::transaction::TransactionManager;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use xapool_resource::XaDataSource;

/// Turns an XA data source into a pooled, transaction-aware one.
pub trait XaDataSourceWrapper {
    /// Wraps `source`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data source cannot be made ready. No
    /// partially wired data source is returned.
    fn wrap_data_source(&self, source: Arc<dyn XaDataSource>) -> CoreResult<ManagedDataSource>;
}

/// The standard [`XaDataSourceWrapper`].
///
/// Each wrapped data source gets its recovery helper registered with the
/// shared recovery manager before any connection is handed out.
///
/// A resource is pooled once per wrapper: wrapping it again returns the
/// data source built the first time, so every caller shares one pool and
/// one record of enlisted connections.
pub struct XaPoolWrapper {
    tm: Arc<dyn TransactionManager>,
    recovery: Arc<RecoveryManager>,
    config: DataSourceConfig,
    wrapped: Mutex<HashMap<String, ManagedDataSource>>,
}

impl XaPoolWrapper {
    /// Creates a wrapper.
    ///
    /// # Errors
    ///
    /// Returns the configuration error if `config` is invalid, e.g.
    /// [`CoreError::InvalidRecoveryCredentials`] when only one of the
    /// recovery user and password is set.
    pub fn new(
        tm: Arc<dyn TransactionManager>,
        recovery: Arc<RecoveryManager>,
        config: DataSourceConfig,
    ) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            tm,
            recovery,
            config,
            wrapped: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    /// Returns the recovery manager helpers are registered with.
    #[must_use]
    pub fn recovery_manager(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    /// Builds the recovery helper for `source`.
    ///
    /// The helper logs in with the recovery account if one is configured
    /// and with the primary account otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecoveryCredentials`] if only one of the
    /// recovery user and password is set.
    pub fn recovery_helper(&self, source: Arc<dyn XaDataSource>) -> CoreResult<DataSourceRecoveryHelper> {
        DataSourceRecoveryHelper::from_config(source, &self.config)
    }
}

impl XaDataSourceWrapper for XaPoolWrapper {
    fn wrap_data_source(&self, source: Arc<dyn XaDataSource>) -> CoreResult<ManagedDataSource> {
        if source.descriptor() != &self.config.descriptor() {
            return Err(CoreError::invalid_config(format!(
                "data source {} does not match the configured resource {}",
                source.descriptor().endpoint(),
                self.config.resource_endpoint
            )));
        }

        let mut wrapped = self.wrapped.lock();
        let key = source.descriptor().endpoint().to_string();
        if let Some(ds) = wrapped.get(&key).filter(|ds| !ds.pool().is_closed()) {
            debug!(resource = %key, "resource already wrapped");
            return Ok(ds.clone());
        }

        let helper = self.recovery_helper(Arc::clone(&source))?;
        let registration = self.recovery.register_helper(Arc::new(helper))?;

        let xa = Arc::new(XaConnectionFactory::new(Arc::clone(&self.tm), source));
        let factory = PoolableConnectionFactory::new(xa, self.config.validation_query.clone());
        let pool = ConnectionPool::new(factory, self.config.pool_config())?;
        let ds = ManagedDataSource::new(pool);

        if self.config.min_idle > 0 {
            match ds.pool().prefill() {
                Ok(created) => debug!(resource = ds.resource_key(), created, "pool prefilled"),
                Err(e) => warn!(resource = ds.resource_key(), error = %e, "failed to prefill pool"),
            }
        }

        info!(
            resource = ds.resource_key(),
            max_total = self.config.max_total,
            ?registration,
            "data source ready"
        );
        wrapped.insert(key, ds.clone());
        Ok(ds)
    }
}

impl fmt::Debug for XaPoolWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XaPoolWrapper")
            .field("config", &self.config)
            .field("wrapped", &self.wrapped.lock().len())
            .finish_non_exhaustive()
    }
}
