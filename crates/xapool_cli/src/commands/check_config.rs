//! Check-config command implementation.

use super::{load_config, CliResult, Format};
use serde::Serialize;
use std::path::Path;
use xapool_core::DataSourceConfig;

/// Summary of a validated configuration. Secrets are never included.
#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    /// Resource endpoint.
    pub endpoint: String,
    /// Primary user.
    pub user: String,
    /// User recovery connections log in with.
    pub recovery_user: String,
    /// Whether a dedicated recovery account is configured.
    pub dedicated_recovery_account: bool,
    /// Maximum pool size.
    pub max_total: usize,
    /// Minimum idle connections.
    pub min_idle: usize,
    /// Borrow wait limit in milliseconds.
    pub max_wait_millis: u64,
    /// Idle timeout in milliseconds.
    pub max_idle_millis: u64,
    /// Eviction interval in milliseconds, 0 when disabled.
    pub eviction_interval_millis: u64,
    /// Validation query, if any.
    pub validation_query: Option<String>,
}

impl ConfigSummary {
    /// Summarizes a validated configuration.
    pub fn new(config: &DataSourceConfig) -> CliResult<Self> {
        let dedicated = config.dedicated_recovery_credentials()?;
        Ok(Self {
            endpoint: config.resource_endpoint.clone(),
            user: config.user.clone(),
            recovery_user: dedicated
                .as_ref()
                .map_or_else(|| config.user.clone(), |c| c.user().to_string()),
            dedicated_recovery_account: dedicated.is_some(),
            max_total: config.max_total,
            min_idle: config.min_idle,
            max_wait_millis: config.max_wait_millis,
            max_idle_millis: config.max_idle_millis,
            eviction_interval_millis: config.eviction_interval_millis,
            validation_query: config.validation_query.clone(),
        })
    }
}

/// Runs the check-config command.
pub fn run(path: &Path, format: &str) -> CliResult<()> {
    let format = Format::parse(format)?;
    let config = load_config(path)?;
    let summary = ConfigSummary::new(&config)?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        Format::Text => {
            println!("Configuration {} is valid", path.display());
            println!();
            println!("Resource:        {}", summary.endpoint);
            println!("User:            {}", summary.user);
            println!(
                "Recovery user:   {}{}",
                summary.recovery_user,
                if summary.dedicated_recovery_account { "" } else { " (primary account)" }
            );
            println!("Max total:       {}", summary.max_total);
            println!("Min idle:        {}", summary.min_idle);
            println!("Max wait:        {} ms", summary.max_wait_millis);
            println!("Max idle:        {} ms", summary.max_idle_millis);
            if summary.eviction_interval_millis == 0 {
                println!("Eviction:        disabled");
            } else {
                println!("Eviction:        every {} ms", summary.eviction_interval_millis);
            }
            if let Some(query) = &summary.validation_query {
                println!("Validation:      {query}");
            }
        }
    }
    Ok(())
}
