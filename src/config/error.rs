//! Configuration errors.

use std::path::PathBuf;
use thiserror::Error;

/// Why configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A layer file exists but could not be read.
    #[error("Cannot read {path}: {source}")]
    Read {
        /// Layer file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A layer is not valid TOML for the schema.
    #[error("Cannot parse {path}: {source}")]
    Parse {
        /// Layer file, or `<built-in defaults>`.
        path: PathBuf,
        /// TOML error with line and column.
        source: toml::de::Error,
    },

    /// The file passed with `--config` does not exist.
    #[error("Config file {0} not found")]
    MissingFile(PathBuf),

    /// Merged configuration failed validation.
    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        /// Dotted field path, e.g. `routes.billing.address`.
        field: String,
        /// What is wrong with it.
        message: String,
    },
}
