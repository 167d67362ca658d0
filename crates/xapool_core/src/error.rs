//! Error types for xapool core.

use crate::types::TransactionId;
use std::io;
use std::time::Duration;
use thiserror::Error;
use xapool_resource::ResourceError;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in xapool core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Resource error that is not an availability problem.
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    /// The backing resource could not be reached. Retryable.
    #[error("resource unavailable: {message}")]
    ResourceUnavailable {
        /// Description of the failure.
        message: String,
        /// The underlying resource error, if any.
        #[source]
        source: Option<ResourceError>,
    },

    /// No pooled connection became available within the wait limit.
    #[error("pool exhausted: no connection available within {waited:?} (max total {max_total})")]
    PoolExhausted {
        /// The pool's maximum size.
        max_total: usize,
        /// How long the borrower waited.
        waited: Duration,
    },

    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// A pooled connection failed validation.
    ///
    /// This never reaches a borrower: the connection is destroyed and
    /// replaced instead.
    #[error("connection {connection} failed validation: {reason}")]
    ConnectionValidationFailed {
        /// Pool id of the connection.
        connection: u64,
        /// Why validation failed.
        reason: String,
    },

    /// The data source could not provide a connection.
    #[error("data source unavailable: {0}")]
    DataSourceUnavailable(#[source] Box<CoreError>),

    /// Exactly one of the recovery user and password was configured.
    #[error("invalid recovery credentials: {missing} is missing")]
    InvalidRecoveryCredentials {
        /// The setting that is missing.
        missing: &'static str,
    },

    /// The configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// The recovery manager cannot accept registrations.
    #[error("recovery manager unavailable: {message}")]
    RecoveryUnavailable {
        /// Description of the problem.
        message: String,
    },

    /// The transaction is not active.
    #[error("transaction {0} is not active")]
    TransactionNotActive(TransactionId),

    /// The transaction was rolled back instead of committed.
    #[error("transaction {id} rolled back: {reason}")]
    TransactionRolledBack {
        /// The transaction.
        id: TransactionId,
        /// Why it was rolled back.
        reason: String,
    },

    /// The transaction's connection to this resource is already on loan.
    #[error("connection to {resource} is already in use by transaction {transaction}")]
    ConnectionInUse {
        /// The transaction.
        transaction: TransactionId,
        /// The resource key.
        resource: String,
    },

    /// A connection could not be enlisted as a transaction branch.
    #[error("failed to enlist {resource}: {source}")]
    Enlistment {
        /// The resource key.
        resource: String,
        /// The underlying error.
        source: ResourceError,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CoreError {
    /// Creates a resource unavailable error without an underlying cause.
    pub fn resource_unavailable(message: impl Into<String>) -> Self {
        Self::ResourceUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a recovery unavailable error.
    pub fn recovery_unavailable(message: impl Into<String>) -> Self {
        Self::RecoveryUnavailable {
            message: message.into(),
        }
    }

    /// Wraps a pool failure as a data source failure.
    pub fn data_source_unavailable(cause: CoreError) -> Self {
        Self::DataSourceUnavailable(Box::new(cause))
    }

    /// Maps a resource error raised while opening a connection.
    ///
    /// Availability problems become [`CoreError::ResourceUnavailable`];
    /// everything else stays a plain resource error.
    pub fn from_connect(endpoint: &str, err: ResourceError) -> Self {
        if err.is_retryable() {
            Self::ResourceUnavailable {
                message: format!("cannot connect to {endpoint}"),
                source: Some(err),
            }
        } else {
            Self::Resource(err)
        }
    }

    /// Returns the innermost cause, looking through data source wrappers.
    #[must_use]
    pub fn root(&self) -> &CoreError {
        match self {
            Self::DataSourceUnavailable(inner) => inner.root(),
            other => other,
        }
    }

    /// Returns true if the pool ran out of connections.
    #[must_use]
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self.root(), Self::PoolExhausted { .. })
    }

    /// Returns true if the backing resource was unreachable.
    #[must_use]
    pub fn is_resource_unavailable(&self) -> bool {
        matches!(self.root(), Self::ResourceUnavailable { .. })
    }

    /// Returns true if the caller may retry the operation later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::ResourceUnavailable { .. } | Self::PoolExhausted { .. }
        )
    }

    /// Returns true for configuration problems that must stop startup.
    #[must_use]
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Self::InvalidRecoveryCredentials { .. }
                | Self::InvalidConfig { .. }
                | Self::RecoveryUnavailable { .. }
        )
    }
}
