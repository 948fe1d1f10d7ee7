//! Error types for settings persistence.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from loading or saving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a settings file.
    #[error("failed to read settings file '{path}': {source}")]
    ReadFile {
        /// Path of the file that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a settings file.
    #[error("failed to write settings file '{path}': {source}")]
    WriteFile {
        /// Path of the file that could not be written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML.
    #[error("failed to parse settings: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Failed to serialize TOML.
    #[error("failed to serialize settings: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience result type for settings operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
