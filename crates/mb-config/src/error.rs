//! Error types for configuration loading

use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("secret '{key}' not found in secrets.yaml")]
    SecretNotFound { key: String },

    #[error("invalid include path '{path}': {reason}")]
    InvalidIncludePath { path: String, reason: String },

    #[error("circular include detected: {path}")]
    CircularInclude { path: PathBuf },

    #[error("environment variable '{var}' not set")]
    EnvVarNotFound { var: String },

    /// A value is present but unusable (wrong type, out of range)
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}
