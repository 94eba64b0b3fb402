//! Settings error type

use thiserror::Error;

/// Errors raised while loading or saving the service configuration
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Configuration file could not be read or written
    #[error("config I/O error at {path}: {source}")]
    Io {
        /// File path involved
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Configuration file failed to parse
    #[error("config parse error: {0}")]
    Parse(String),

    /// Configuration file failed to serialize
    #[error("config serialize error: {0}")]
    Serialize(String),

    /// No platform config directory could be resolved
    #[error("no configuration directory available")]
    NoConfigDir,
}

/// Result alias for settings operations
pub type Result<T> = std::result::Result<T, SettingsError>;
