//! CLI command implementations.

pub mod check_config;
pub mod recover;
pub mod simulate;

use std::path::{Path, PathBuf};
use thiserror::Error;
use xapool_core::{CoreError, DataSourceConfig};

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The configuration file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The configuration is invalid.
    #[error("invalid configuration in {path}: {source}")]
    Config {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: CoreError,
    },

    /// The workload could not run.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The output format is not supported.
    #[error("unsupported output format {0:?} (expected text or json)")]
    Format(String),

    /// JSON output failed.
    #[error("cannot write JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Loads and validates a configuration file.
pub fn load_config(path: &Path) -> CliResult<DataSourceConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = DataSourceConfig::from_json(&text).and_then(|config| {
        config.validate()?;
        Ok(config)
    });
    config.map_err(|source| CliError::Config {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the configuration at `path`, or a local default without one.
pub fn load_or_default(path: Option<&Path>) -> CliResult<DataSourceConfig> {
    match path {
        Some(path) => load_config(path),
        None => Ok(DataSourceConfig::new("memory://simulated", "app", "secret").max_total(4)),
    }
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

impl Format {
    /// Parses a `--format` value.
    pub fn parse(value: &str) -> CliResult<Self> {
        match value {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(CliError::Format(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_valid_file() {
        let file = write(r#"{"resourceEndpoint": "db1", "user": "app", "password": "secret", "maxTotal": 3}"#);
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.max_total, 3);
    }

    #[test]
    fn rejects_half_set_recovery_credentials() {
        let file = write(
            r#"{"resourceEndpoint": "db1", "user": "app", "password": "secret", "recoveryPassword": "r3c"}"#,
        );
        match load_config(file.path()) {
            Err(CliError::Config { source, .. }) => {
                assert!(matches!(source, CoreError::InvalidRecoveryCredentials { .. }));
            }
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_keys_and_missing_files() {
        let file = write(r#"{"resourceEndpoint": "db1", "maxSize": 3}"#);
        assert!(matches!(load_config(file.path()), Err(CliError::Config { .. })));

        let missing = file.path().with_extension("missing");
        assert!(matches!(load_config(&missing), Err(CliError::Read { .. })));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(load_or_default(None).unwrap().validate().is_ok());
    }

    #[test]
    fn formats() {
        assert_eq!(Format::parse("json").unwrap(), Format::Json);
        assert!(matches!(Format::parse("yaml"), Err(CliError::Format(_))));
    }
}
