//! Service configuration
//!
//! Configuration is organized into logical sections:
//! - Auth settings (token secret, user list, IP access rules)
//! - Connection defaults (configured ports, extra baud rates)
//! - Controller behavior (exception handling)
//! - User macros and event hooks
//! - Watch directory for `watchdir:load`
//!
//! Files are TOML, stored in the platform config directory. A
//! [`SettingsManager`] wraps the loaded config for shared access and
//! broadcasts a change notification whenever it is updated.

use crate::error::{Result, SettingsError};
use cncd_core::{EventHook, MacroDef};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Baud rates offered to clients by default, descending
pub const DEFAULT_BAUD_RATES: [u32; 7] = [250000, 115200, 57600, 38400, 19200, 9600, 2400];

/// An operator account allowed to open sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Stable user id carried in tokens
    pub id: String,
    /// Display name carried in tokens
    pub name: String,
    /// Disabled users are rejected at the handshake
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// One IP access rule, checked in order; first match wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    /// Allow or deny on match
    pub allow: bool,
    /// IP address or prefix (`192.168.1.` matches the whole subnet);
    /// `*` matches everything
    pub ip: String,
}

/// Authentication settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSettings {
    /// HMAC secret for bearer tokens
    pub secret: String,
    /// Known users; an empty list leaves the user check open
    #[serde(default)]
    pub users: Vec<UserRecord>,
    /// IP access rules; an empty list allows every address
    #[serde(default)]
    pub access_rules: Vec<AccessRule>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            // A fresh install gets a random secret
            secret: uuid::Uuid::new_v4().to_string(),
            users: Vec::new(),
            access_rules: Vec::new(),
        }
    }
}

/// A port the user configured by hand (e.g. a TCP bridge the enumerator
/// cannot discover)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredPort {
    /// Device path or address
    pub path: String,
    /// Optional manufacturer label shown to clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
}

/// Connection defaults
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// User-configured ports merged into enumeration results
    #[serde(default)]
    pub ports: Vec<ConfiguredPort>,
    /// Extra baud rates merged into the defaults
    #[serde(default)]
    pub baud_rates: Vec<u32>,
}

/// Controller exception behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExceptionSettings {
    /// Keep streaming through firmware errors instead of pausing
    #[serde(default)]
    pub ignore_errors: bool,
}

/// Controller behavior settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Exception handling
    #[serde(default)]
    pub exception: ExceptionSettings,
}

/// Top-level service configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Authentication
    #[serde(default)]
    pub auth: AuthSettings,
    /// Connection defaults
    #[serde(default)]
    pub connection: ConnectionSettings,
    /// Controller behavior
    #[serde(default)]
    pub controller: ControllerSettings,
    /// User macros
    #[serde(default)]
    pub macros: Vec<MacroDef>,
    /// Event hooks
    #[serde(default)]
    pub events: Vec<EventHook>,
    /// Root directory served by `watchdir:load`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_directory: Option<PathBuf>,
}

impl ServiceConfig {
    /// The platform default config file path
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
        Ok(dir.join("cncd").join("cncd.toml"))
    }

    /// Load from `path`; a missing file yields the defaults. The format
    /// follows the extension: `.json` is JSON, anything else is TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(SettingsError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };
        if is_json(path) {
            serde_json::from_str(&text).map_err(|e| SettingsError::Parse(e.to_string()))
        } else {
            toml::from_str(&text).map_err(|e| SettingsError::Parse(e.to_string()))
        }
    }

    /// Save to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        let text = if is_json(path) {
            serde_json::to_string_pretty(self).map_err(|e| SettingsError::Serialize(e.to_string()))?
        } else {
            toml::to_string_pretty(self).map_err(|e| SettingsError::Serialize(e.to_string()))?
        };
        std::fs::write(path, text).map_err(|e| SettingsError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// The offered baud rates: defaults merged with the user list,
    /// deduplicated, descending
    pub fn baud_rates(&self) -> Vec<u32> {
        let mut rates: Vec<u32> = DEFAULT_BAUD_RATES
            .iter()
            .copied()
            .chain(self.connection.baud_rates.iter().copied())
            .collect();
        rates.sort_unstable_by(|a, b| b.cmp(a));
        rates.dedup();
        rates
    }
}

/// Shared handle to the loaded configuration with change notification.
#[derive(Debug, Clone)]
pub struct SettingsManager {
    config: Arc<RwLock<ServiceConfig>>,
    change_tx: broadcast::Sender<()>,
}

impl SettingsManager {
    /// Wrap a loaded config
    pub fn new(config: ServiceConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            config: Arc::new(RwLock::new(config)),
            change_tx,
        }
    }

    /// Snapshot of the current config
    pub fn get(&self) -> ServiceConfig {
        self.config.read().clone()
    }

    /// Mutate the config and notify subscribers
    pub fn update(&self, f: impl FnOnce(&mut ServiceConfig)) {
        {
            let mut config = self.config.write();
            f(&mut config);
        }
        let _ = self.change_tx.send(());
    }

    /// Subscribe to change notifications (`config:change`)
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.change_tx.subscribe()
    }
}

impl Default for SettingsManager {
    fn default() -> Self {
        Self::new(ServiceConfig::default())
    }
}

fn default_true() -> bool {
    true
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}
