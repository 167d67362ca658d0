//! Data source and pool configuration.

use crate::error::{CoreError, CoreResult};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use xapool_resource::{Credentials, ResourceDescriptor};

/// Order in which idle objects are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleOrder {
    /// Most recently returned first. Keeps a small hot set of connections.
    #[default]
    Lifo,
    /// Least recently returned first. Spreads use over all connections.
    Fifo,
}

/// Configuration of a connection pool.
///
/// A zero `max_idle_time` disables idle expiry and a zero
/// `eviction_interval` disables the background evictor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of objects, idle or on loan.
    pub max_total: usize,

    /// Number of idle objects the evictor keeps around.
    pub min_idle: usize,

    /// How long `borrow` waits before failing with `PoolExhausted`.
    pub max_wait: Duration,

    /// Idle objects older than this are evicted.
    pub max_idle_time: Duration,

    /// How often the background evictor runs.
    pub eviction_interval: Duration,

    /// Whether to validate objects before lending them out.
    pub test_on_borrow: bool,

    /// Whether to validate objects when they are returned.
    pub test_on_return: bool,

    /// Whether the evictor validates idle objects it does not expire.
    pub test_while_idle: bool,

    /// Order in which idle objects are handed out.
    pub idle_order: IdleOrder,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 8,
            min_idle: 0,
            max_wait: Duration::from_secs(30),
            max_idle_time: Duration::from_secs(30 * 60),
            eviction_interval: Duration::ZERO, // disabled
            test_on_borrow: true,
            test_on_return: true,
            test_while_idle: false,
            idle_order: IdleOrder::Lifo,
        }
    }
}

impl PoolConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of objects.
    #[must_use]
    pub const fn max_total(mut self, value: usize) -> Self {
        self.max_total = value;
        self
    }

    /// Sets the minimum number of idle objects.
    #[must_use]
    pub const fn min_idle(mut self, value: usize) -> Self {
        self.min_idle = value;
        self
    }

    /// Sets the borrow wait limit.
    #[must_use]
    pub const fn max_wait(mut self, value: Duration) -> Self {
        self.max_wait = value;
        self
    }

    /// Sets the idle expiry time.
    #[must_use]
    pub const fn max_idle_time(mut self, value: Duration) -> Self {
        self.max_idle_time = value;
        self
    }

    /// Sets the evictor interval.
    #[must_use]
    pub const fn eviction_interval(mut self, value: Duration) -> Self {
        self.eviction_interval = value;
        self
    }

    /// Sets whether to validate on borrow.
    #[must_use]
    pub const fn test_on_borrow(mut self, value: bool) -> Self {
        self.test_on_borrow = value;
        self
    }

    /// Sets whether to validate on return.
    #[must_use]
    pub const fn test_on_return(mut self, value: bool) -> Self {
        self.test_on_return = value;
        self
    }

    /// Sets whether the evictor validates idle objects.
    #[must_use]
    pub const fn test_while_idle(mut self, value: bool) -> Self {
        self.test_while_idle = value;
        self
    }

    /// Sets the idle order.
    #[must_use]
    pub const fn idle_order(mut self, value: IdleOrder) -> Self {
        self.idle_order = value;
        self
    }

    /// Checks the configuration for contradictions.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if `max_total` is zero,
    /// `min_idle` exceeds `max_total`, or objects would be validated
    /// neither on borrow nor on return.
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_total == 0 {
            return Err(CoreError::invalid_config("maxTotal must be at least 1"));
        }
        if !self.test_on_borrow && !self.test_on_return {
            return Err(CoreError::invalid_config(
                "testOnBorrow and testOnReturn cannot both be disabled",
            ));
        }
        if self.min_idle > self.max_total {
            return Err(CoreError::invalid_config(format!(
                "minIdle ({}) must not exceed maxTotal ({})",
                self.min_idle, self.max_total
            )));
        }
        Ok(())
    }
}

/// Configuration of a managed XA data source.
///
/// Field names follow the JSON configuration surface (`resourceEndpoint`,
/// `maxWaitMillis`, ...). Missing fields take their default values.
///
/// # Recovery credentials
///
/// `recovery_user` and `recovery_password` must be set together. When both
/// are absent the recovery helper logs in with the primary credentials.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct DataSourceConfig {
    /// Endpoint of the backing resource.
    pub resource_endpoint: String,
    /// Primary user.
    pub user: String,
    /// Primary password.
    pub password: String,
    /// Dedicated recovery user.
    pub recovery_user: Option<String>,
    /// Dedicated recovery password.
    #[serde(alias = "recoveryPass")]
    pub recovery_password: Option<String>,
    /// Maximum pool size.
    pub max_total: usize,
    /// Minimum idle connections.
    pub min_idle: usize,
    /// Borrow wait limit in milliseconds.
    pub max_wait_millis: u64,
    /// Idle expiry in milliseconds (0 = never).
    pub max_idle_millis: u64,
    /// Evictor interval in milliseconds (0 = no evictor).
    pub eviction_interval_millis: u64,
    /// Statement used to validate connections; `ping` when absent.
    pub validation_query: Option<String>,
    /// Validate before lending out.
    pub test_on_borrow: bool,
    /// Validate when returned.
    pub test_on_return: bool,
    /// Validate idle connections during eviction.
    pub test_while_idle: bool,
    /// Order in which idle connections are handed out.
    pub idle_order: IdleOrder,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            resource_endpoint: String::new(),
            user: String::new(),
            password: String::new(),
            recovery_user: None,
            recovery_password: None,
            max_total: pool.max_total,
            min_idle: pool.min_idle,
            max_wait_millis: duration_millis(pool.max_wait),
            max_idle_millis: duration_millis(pool.max_idle_time),
            eviction_interval_millis: duration_millis(pool.eviction_interval),
            validation_query: None,
            test_on_borrow: pool.test_on_borrow,
            test_on_return: pool.test_on_return,
            test_while_idle: pool.test_while_idle,
            idle_order: pool.idle_order,
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl fmt::Debug for DataSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceConfig")
            .field("resource_endpoint", &self.resource_endpoint)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("recovery_user", &self.recovery_user)
            .field(
                "recovery_password",
                &self.recovery_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("max_total", &self.max_total)
            .field("min_idle", &self.min_idle)
            .field("max_wait_millis", &self.max_wait_millis)
            .field("max_idle_millis", &self.max_idle_millis)
            .field("eviction_interval_millis", &self.eviction_interval_millis)
            .field("validation_query", &self.validation_query)
            .finish_non_exhaustive()
    }
}

impl DataSourceConfig {
    /// Creates a configuration for a resource with default pool settings.
    pub fn new(
        endpoint: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            resource_endpoint: endpoint.into(),
            user: user.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Parses a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if the document is malformed.
    /// The result is not validated; call [`Self::validate`].
    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::invalid_config(e.to_string()))
    }

    /// Sets dedicated recovery credentials.
    #[must_use]
    pub fn recovery_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.recovery_user = Some(user.into());
        self.recovery_password = Some(password.into());
        self
    }

    /// Sets the maximum pool size.
    #[must_use]
    pub fn max_total(mut self, value: usize) -> Self {
        self.max_total = value;
        self
    }

    /// Sets the minimum idle connections.
    #[must_use]
    pub fn min_idle(mut self, value: usize) -> Self {
        self.min_idle = value;
        self
    }

    /// Sets the borrow wait limit.
    #[must_use]
    pub fn max_wait(mut self, value: Duration) -> Self {
        self.max_wait_millis = duration_millis(value);
        self
    }

    /// Sets the idle expiry time.
    #[must_use]
    pub fn max_idle(mut self, value: Duration) -> Self {
        self.max_idle_millis = duration_millis(value);
        self
    }

    /// Sets the evictor interval.
    #[must_use]
    pub fn eviction_interval(mut self, value: Duration) -> Self {
        self.eviction_interval_millis = duration_millis(value);
        self
    }

    /// Sets the validation query.
    #[must_use]
    pub fn validation_query(mut self, query: impl Into<String>) -> Self {
        self.validation_query = Some(query.into());
        self
    }

    /// Returns the primary credentials.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.user.as_str(), self.password.as_str())
    }

    /// Returns the descriptor of the configured resource.
    #[must_use]
    pub fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor::new(self.resource_endpoint.as_str(), self.credentials())
    }

    /// Returns the dedicated recovery credentials.
    ///
    /// `Ok(None)` means the primary credentials are to be used.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecoveryCredentials`] if only one of
    /// the recovery user and password is set.
    pub fn dedicated_recovery_credentials(&self) -> CoreResult<Option<Credentials>> {
        match (&self.recovery_user, &self.recovery_password) {
            (None, None) => Ok(None),
            (Some(user), Some(password)) => {
                Ok(Some(Credentials::new(user.as_str(), password.as_str())))
            }
            (Some(_), None) => Err(CoreError::InvalidRecoveryCredentials {
                missing: "recovery password",
            }),
            (None, Some(_)) => Err(CoreError::InvalidRecoveryCredentials {
                missing: "recovery user",
            }),
        }
    }

    /// Returns the pool part of this configuration.
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_total: self.max_total,
            min_idle: self.min_idle,
            max_wait: Duration::from_millis(self.max_wait_millis),
            max_idle_time: Duration::from_millis(self.max_idle_millis),
            eviction_interval: Duration::from_millis(self.eviction_interval_millis),
            test_on_borrow: self.test_on_borrow,
            test_on_return: self.test_on_return,
            test_while_idle: self.test_while_idle,
            idle_order: self.idle_order,
        }
    }

    /// Checks the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecoveryCredentials`] for a half-set
    /// recovery account and [`CoreError::InvalidConfig`] for an empty
    /// endpoint or inconsistent pool settings.
    pub fn validate(&self) -> CoreResult<()> {
        if self.resource_endpoint.trim().is_empty() {
            return Err(CoreError::invalid_config("resourceEndpoint must not be empty"));
        }
        self.dedicated_recovery_credentials()?;
        self.pool_config().validate()
    }
}
