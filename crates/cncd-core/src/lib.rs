//! # cncd-core
//!
//! Core types, error taxonomy, and pure G-code line filtering shared by
//! the cncd daemon crates.

pub mod context;
pub mod error;
pub mod gcode;
pub mod types;

pub use context::{Context, Scalar};
pub use error::{Error, Result};
pub use gcode::{strip_comments, translate_line, PauseWord, Translated, WAIT_DWELL, WAIT_SENTINEL};
pub use types::{EventHook, HoldReason, MachinePosition, MacroDef, TriggerKind, WriteSource};
