//! Per-resource recovery helpers.

use crate::config::DataSourceConfig;
use crate::error::{CoreError, CoreResult};
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use xapool_resource::{Credentials, XaConnection, XaDataSource, XaResource, Xid};

/// Lists the in-doubt branches of one resource.
pub trait RecoveryHelper: Send + Sync {
    /// Returns the key of the resource this helper recovers.
    fn resource_key(&self) -> &str;

    /// Opens a recovery connection and lists the prepared branches.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource cannot be reached or queried.
    fn scan(&self) -> CoreResult<RecoveryScan>;
}

/// An open recovery session on one resource.
///
/// The session owns a dedicated connection, which is closed on drop.
pub struct RecoveryScan {
    resource: String,
    connection: Box<dyn XaConnection>,
    xa: Arc<dyn XaResource>,
    in_doubt: Vec<Xid>,
}

impl RecoveryScan {
    /// Lists the prepared branches visible through `connection`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Resource`] if the resource cannot be queried.
    /// The connection is closed in that case as well.
    pub fn open(resource: impl Into<String>, connection: Box<dyn XaConnection>) -> CoreResult<Self> {
        let xa = connection.xa_resource();
        let mut scan = Self {
            resource: resource.into(),
            connection,
            xa,
            in_doubt: Vec::new(),
        };
        scan.in_doubt = scan.xa.recover()?;
        Ok(scan)
    }

    /// Returns the resource key.
    #[must_use]
    pub fn resource_key(&self) -> &str {
        &self.resource
    }

    /// Returns every prepared branch, including those of other coordinators.
    #[must_use]
    pub fn in_doubt(&self) -> &[Xid] {
        &self.in_doubt
    }

    /// Commits an in-doubt branch.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Resource`] if the commit fails.
    pub fn commit(&self, xid: &Xid) -> CoreResult<()> {
        self.xa.commit(xid, false)?;
        Ok(())
    }

    /// Rolls back an in-doubt branch.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Resource`] if the rollback fails.
    pub fn rollback(&self, xid: &Xid) -> CoreResult<()> {
        self.xa.rollback(xid)?;
        Ok(())
    }
}

impl Drop for RecoveryScan {
    fn drop(&mut self) {
        if let Err(e) = self.connection.close() {
            warn!(resource = %self.resource, error = %e, "failed to close recovery connection");
        }
    }
}

impl fmt::Debug for RecoveryScan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryScan")
            .field("resource", &self.resource)
            .field("in_doubt", &self.in_doubt)
            .finish_non_exhaustive()
    }
}

/// Recovery helper backed by an [`XaDataSource`].
///
/// Recovery connections use the dedicated recovery account when one is
/// configured and the data source's primary account otherwise.
pub struct DataSourceRecoveryHelper {
    source: Arc<dyn XaDataSource>,
    credentials: Credentials,
}

impl DataSourceRecoveryHelper {
    /// Creates a helper that logs in with the primary credentials.
    pub fn new(source: Arc<dyn XaDataSource>) -> Self {
        let credentials = source.descriptor().credentials().clone();
        Self {
            source,
            credentials,
        }
    }

    /// Creates a helper that logs in with dedicated recovery credentials.
    pub fn with_credentials(source: Arc<dyn XaDataSource>, credentials: Credentials) -> Self {
        Self {
            source,
            credentials,
        }
    }

    /// Creates a helper following the configured recovery account.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecoveryCredentials`] if only one of
    /// the recovery user and password is configured.
    pub fn from_config(source: Arc<dyn XaDataSource>, config: &DataSourceConfig) -> CoreResult<Self> {
        Ok(match config.dedicated_recovery_credentials()? {
            Some(credentials) => Self::with_credentials(source, credentials),
            None => Self::new(source),
        })
    }

    /// Returns the credentials recovery connections log in with.
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

impl RecoveryHelper for DataSourceRecoveryHelper {
    fn resource_key(&self) -> &str {
        self.source.descriptor().endpoint()
    }

    fn scan(&self) -> CoreResult<RecoveryScan> {
        let connection = self
            .source
            .connect(&self.credentials)
            .map_err(|e| CoreError::from_connect(self.resource_key(), e))?;
        RecoveryScan::open(self.resource_key(), connection)
    }
}

impl fmt::Debug for DataSourceRecoveryHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceRecoveryHelper")
            .field("resource", &self.resource_key())
            .field("user", &self.credentials.user())
            .finish_non_exhaustive()
    }
}
