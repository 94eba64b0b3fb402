//! # cncd-settings
//!
//! Configuration file handling for the cncd daemon: auth, connection
//! defaults, controller behavior, macros, and event hooks.

pub mod config;
pub mod error;

pub use config::{
    AccessRule, AuthSettings, ConfiguredPort, ConnectionSettings, ControllerSettings,
    ExceptionSettings, ServiceConfig, SettingsManager, UserRecord, DEFAULT_BAUD_RATES,
};
pub use error::{Result, SettingsError};
