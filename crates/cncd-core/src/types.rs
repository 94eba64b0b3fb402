//! Shared plain-data types used across the daemon crates.

use serde::{Deserialize, Serialize};

/// A machine or work position reported by the firmware.
///
/// The first three axes are always present; rotary axes are optional and
/// omitted from serialized payloads when the firmware does not report them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MachinePosition {
    /// X position
    pub x: f64,
    /// Y position
    pub y: f64,
    /// Z position
    pub z: f64,
    /// A axis (4th axis) position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub a: Option<f64>,
    /// B axis (5th axis) position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b: Option<f64>,
    /// C axis (6th axis) position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<f64>,
}

impl MachinePosition {
    /// Parse a comma-separated coordinate list (`"0.000,1.000,2.000"`).
    pub fn parse(pos_str: &str) -> Option<Self> {
        let coords: Vec<f64> = pos_str
            .split(',')
            .filter_map(|s| s.trim().parse::<f64>().ok())
            .collect();

        if coords.len() < 3 {
            return None;
        }

        Some(Self {
            x: coords[0],
            y: coords[1],
            z: coords[2],
            a: coords.get(3).copied(),
            b: coords.get(4).copied(),
            c: coords.get(5).copied(),
        })
    }
}

/// Why a Feeder, Sender, or Workflow is currently held.
///
/// Serializes as `{"data": "M0"}` for pause sentinels and `{"err": "..."}`
/// for firmware errors, which is the shape clients consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldReason {
    /// Held because of an inline sentinel or operator pause (`M0`, `M6`, `%wait`)
    #[serde(rename = "data")]
    Data(String),
    /// Held because the firmware reported an error mid-program
    #[serde(rename = "err")]
    Error(String),
}

impl HoldReason {
    /// The pause word or error text carried by this reason
    pub fn message(&self) -> &str {
        match self {
            HoldReason::Data(s) | HoldReason::Error(s) => s,
        }
    }
}

/// A user-defined macro: a named block of G-code runnable through the
/// Feeder (`macro:run`) or loadable as a program (`macro:load`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroDef {
    /// Stable identifier clients pass back
    pub id: String,
    /// Display name
    pub name: String,
    /// G-code content
    pub content: String,
}

/// How a configured event reaction is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    /// Feed the commands to the controller as G-code
    Gcode,
    /// Spawn the commands through the shell-command service
    System,
}

/// A user-configured reaction to a named controller event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHook {
    /// Event name (`sender:start`, `controller:ready`, ...)
    pub event: String,
    /// Dispatch kind
    pub trigger: TriggerKind,
    /// Commands to run (newline-separated for gcode triggers)
    pub commands: String,
    /// Disabled hooks are kept in config but never fire
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Where an outbound write originated. Used to decide which replies are
/// echoed back to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteSource {
    /// An interactive client write
    Client,
    /// The Feeder queue
    Feeder,
    /// The program Sender
    Sender,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_parses_three_and_six_axes() {
        let p = MachinePosition::parse("1.000,2.000,3.000").unwrap();
        assert_eq!((p.x, p.y, p.z), (1.0, 2.0, 3.0));
        assert_eq!(p.a, None);

        let p = MachinePosition::parse("1,2,3,4,5,6").unwrap();
        assert_eq!(p.c, Some(6.0));
    }

    #[test]
    fn position_rejects_short_lists() {
        assert!(MachinePosition::parse("1.0,2.0").is_none());
    }

    #[test]
    fn hold_reason_serializes_tagged() {
        let r = HoldReason::Data("M6".to_string());
        assert_eq!(serde_json::to_string(&r).unwrap(), r#"{"data":"M6"}"#);
        let r = HoldReason::Error("error:22".to_string());
        assert_eq!(serde_json::to_string(&r).unwrap(), r#"{"err":"error:22"}"#);
    }
}
