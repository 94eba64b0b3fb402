//! # cncd
//!
//! A CNC control daemon that mediates between network clients and CNC
//! controller firmwares (Grbl, Smoothieware, TinyG/g2core, Marlin) over
//! serial or TCP transports.
//!
//! ## Architecture
//!
//! cncd is organized as a workspace with focused crates:
//!
//! 1. **cncd-core** - Core types, error taxonomy, G-code line filtering
//! 2. **cncd-communication** - Transports, Feeder/Sender/Workflow state
//!    machines, firmware dialects, per-connection controllers
//! 3. **cncd-settings** - Configuration file handling
//! 4. **cncd-engine** - Session auth, controller registry, dispatch
//! 5. **cncd** - The daemon binary

pub use cncd_communication::{
    ConnectionOptions, Controller, ControllerHandle, ControllerKind, Push, SenderStatus,
    StreamingMode, WorkflowState,
};
pub use cncd_core::{Context, Error, HoldReason, Result, WriteSource};
pub use cncd_engine::{AuthClaims, Engine, PortRecord};
pub use cncd_settings::{ServiceConfig, SettingsManager};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with console output, RUST_LOG environment
/// variable support, and INFO as the default level.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
