//! Error handling for cncd
//!
//! Provides the error taxonomy shared by all layers:
//! - Validation errors (bad controller type, bad ident, unknown command)
//! - Auth errors (rejected session handshakes)
//! - Transport errors (OS-level open/read/write failures)
//! - Protocol errors (`error:<code>` / `ALARM:<code>` from the firmware)
//! - Invariant violations (Sender/Feeder bookkeeping gone inconsistent)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for cncd
///
/// Validation and Protocol errors never tear down a connection; only
/// Transport errors collapse it.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad controller type, bad ident, unknown command, missing macro/port
    #[error("validation error: {message}")]
    Validation {
        /// What was rejected and why.
        message: String,
    },

    /// Session handshake rejected (token, IP, or user check failed)
    #[error("authentication rejected: {reason}")]
    Auth {
        /// The reason the session was rejected.
        reason: String,
    },

    /// OS-level failure on the serial or TCP link
    #[error("transport error: {message}")]
    Transport {
        /// The underlying failure description.
        message: String,
    },

    /// `error:<code>` or `ALARM:<code>` reported by the firmware
    #[error("firmware protocol error: {raw}")]
    Protocol {
        /// Numeric code when the firmware supplied one.
        code: Option<u16>,
        /// The raw line as received.
        raw: String,
    },

    /// Internal bookkeeping violated an invariant (e.g. `received > sent`)
    #[error("invariant violated: {message}")]
    Invariant {
        /// Description of the violated invariant.
        message: String,
    },

    /// Configuration file problem
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a validation error from a message
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation {
            message: msg.into(),
        }
    }

    /// Create an auth error from a reason
    pub fn auth(reason: impl Into<String>) -> Self {
        Error::Auth {
            reason: reason.into(),
        }
    }

    /// Create a transport error from a message
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport {
            message: msg.into(),
        }
    }

    /// Create an invariant-violation error from a message
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant {
            message: msg.into(),
        }
    }

    /// Create a configuration error from a message
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config {
            message: msg.into(),
        }
    }

    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this error should collapse the connection
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Io(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
