//! Firmware dialects
//!
//! Four controller firmwares share one streaming skeleton but differ in
//! flow control, realtime byte sets, handshakes, and override encodings.
//! Each dialect implements [`Dialect`]: a line parser producing typed
//! [`RunnerEvent`]s plus the capability set the shared Controller needs.
//!
//! Supported firmwares:
//! - Grbl: character-counting streaming, realtime singleton bytes
//! - Smoothieware: Grbl-like wire surface on a Smoothieboard
//! - TinyG/g2core: JSON framing, queue-report-driven windowing
//! - Marlin: line-oriented send-response streaming

pub mod grbl;
pub mod marlin;
pub mod smoothieware;
pub mod tinyg;

use crate::sender::StreamingMode;
use cncd_core::MachinePosition;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Supported CNC controller firmwares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerKind {
    /// Grbl
    Grbl,
    /// Smoothieware
    Smoothie,
    /// TinyG / g2core
    TinyG,
    /// Marlin
    Marlin,
}

impl ControllerKind {
    /// All supported kinds, in client-visible order
    pub const ALL: [ControllerKind; 4] = [
        ControllerKind::Grbl,
        ControllerKind::Smoothie,
        ControllerKind::TinyG,
        ControllerKind::Marlin,
    ];

    /// Client-visible name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grbl => "Grbl",
            Self::Smoothie => "Smoothie",
            Self::TinyG => "TinyG",
            Self::Marlin => "Marlin",
        }
    }

    /// Parse a client-supplied controller type
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "grbl" => Some(Self::Grbl),
            "smoothie" | "smoothieware" => Some(Self::Smoothie),
            "tinyg" | "g2core" => Some(Self::TinyG),
            "marlin" => Some(Self::Marlin),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A machine status report, normalized across firmwares.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Machine state word (`Idle`, `Run`, `Hold`, `Alarm`, ...)
    pub machine_state: String,
    /// Machine position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mpos: Option<MachinePosition>,
    /// Work position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wpos: Option<MachinePosition>,
    /// Work coordinate offset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wco: Option<MachinePosition>,
    /// Current feed rate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_rate: Option<f64>,
    /// Current spindle speed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spindle_speed: Option<f64>,
    /// Planner buffer blocks free
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planner_blocks: Option<u32>,
    /// Serial RX buffer bytes free
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_bytes: Option<u32>,
    /// Feed/rapid/spindle override percentages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overrides: Option<(u8, u8, u8)>,
}

/// A Marlin M114 position reply
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PositionReport {
    /// X position
    pub x: f64,
    /// Y position
    pub y: f64,
    /// Z position
    pub z: f64,
    /// Extruder position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<f64>,
}

/// One heater's reading in a Marlin temperature report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaterReading {
    /// Current temperature
    pub deg: f64,
    /// Target temperature
    pub deg_target: f64,
    /// Heater power, when reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
}

/// Marlin temperature report
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemperatureReport {
    /// True when the report rode on an `ok` line
    pub ok: bool,
    /// True for `W:`-suffixed heating-wait reports
    pub wait: bool,
    /// Hotend reading
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extruder: Option<HeaterReading>,
    /// Bed reading
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heated_bed: Option<HeaterReading>,
}

/// Typed events produced by a dialect's line parser.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    /// Plain acknowledgment
    Ok,
    /// Firmware error reply
    Error {
        /// Numeric code when the firmware supplied one
        code: Option<u16>,
        /// Decoded human-readable message
        message: String,
        /// Raw line
        raw: String,
    },
    /// Alarm report
    Alarm {
        /// Numeric code when the firmware supplied one
        code: Option<u16>,
        /// Decoded human-readable message
        message: String,
        /// Raw line
        raw: String,
    },
    /// Machine status report
    Status(StatusReport),
    /// Modal parser state, firmware-shaped
    ParserState(serde_json::Value),
    /// A settings line (`$13=0`)
    Setting {
        /// Setting name
        name: String,
        /// Setting value
        value: String,
    },
    /// Firmware banner / version reply
    Startup {
        /// Firmware family name
        firmware: String,
        /// Version string
        version: String,
        /// Raw line
        raw: String,
    },
    /// TinyG planner queue report
    QueueReport {
        /// Free planner slots
        qr: u32,
        /// Slots added since last report
        qi: Option<u32>,
        /// Slots removed since last report
        qo: Option<u32>,
    },
    /// TinyG serial RX buffer report
    Rx {
        /// Free RX buffer bytes
        rx: u32,
    },
    /// Marlin M115 capability reply
    Firmware {
        /// FIRMWARE_NAME value
        firmware_name: String,
        /// PROTOCOL_VERSION value
        protocol_version: Option<String>,
        /// MACHINE_TYPE value
        machine_type: Option<String>,
        /// EXTRUDER_COUNT value
        extruder_count: Option<u8>,
        /// UUID value
        uuid: Option<String>,
    },
    /// Marlin M114 position reply
    Position(PositionReport),
    /// Marlin temperature report
    Temperature(TemperatureReport),
    /// Firmware echo line
    Echo {
        /// Raw line
        raw: String,
    },
    /// Anything the parser did not classify
    Other {
        /// Raw line
        raw: String,
    },
}

/// Bytes for the wire: a realtime byte sequence or a full line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCommand {
    /// Raw bytes written as-is (realtime characters)
    Raw(Vec<u8>),
    /// A line; the Controller appends the LF
    Line(String),
}

/// One step of a firmware readiness handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenStep {
    /// Wait before the next step
    Delay(Duration),
    /// Put a command on the wire
    Send(WireCommand),
}

/// Which override a client is adjusting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideTarget {
    /// Feed rate override
    Feed,
    /// Spindle speed override
    Spindle,
    /// Rapid traverse override
    Rapid,
}

/// Firmware capability set consumed by the shared Controller.
///
/// A dialect owns a thin mutable model (last status, settings, modal
/// state) that `parse_line` keeps current.
pub trait Dialect: Send {
    /// Which firmware this dialect speaks
    fn kind(&self) -> ControllerKind;

    /// Flow-control strategy for streamed programs
    fn streaming_mode(&self) -> StreamingMode;

    /// Parse one inbound line into a typed event, updating the model
    fn parse_line(&mut self, line: &str) -> RunnerEvent;

    /// Whether `data` is a realtime command written without a trailing LF
    fn is_realtime_command(&self, data: &str) -> bool;

    /// Steps driven right after the transport opens
    fn open_sequence(&self) -> Vec<OpenStep>;

    /// Commands issued once, after the firmware reports ready
    fn init_commands(&self) -> Vec<String>;

    /// Commands re-issued when a startup banner arrives after the
    /// controller is already ready (a rebooted Marlin re-announces with
    /// `start` and gets its M115 again)
    fn startup_requery_commands(&self) -> Vec<String> {
        Vec::new()
    }

    /// Periodic machine-status query
    fn status_query(&self) -> Option<WireCommand>;

    /// Throttled modal-state query
    fn parser_state_query(&self) -> Option<WireCommand>;

    /// Feed-hold wire command, when the firmware has one
    fn feedhold_command(&self) -> Option<WireCommand>;

    /// Cycle-start / resume wire command
    fn cyclestart_command(&self) -> Option<WireCommand>;

    /// Commands performing a controller reset
    fn reset_commands(&self) -> Vec<WireCommand>;

    /// Homing command
    fn homing_command(&self) -> Option<String>;

    /// Alarm-unlock command, when the firmware has one
    fn unlock_command(&self) -> Option<String> {
        None
    }

    /// Sleep command, when the firmware has one
    fn sleep_command(&self) -> Option<String> {
        None
    }

    /// Jog-cancel realtime command, when the firmware has one
    fn jog_cancel_command(&self) -> Option<WireCommand> {
        None
    }

    /// Encode an override delta. `delta == 0` means reset to 100%.
    fn encode_override(&mut self, target: OverrideTarget, delta: i32) -> Vec<WireCommand>;

    /// G-code sequence for a bounded laser test pulse
    fn lasertest_commands(&self, power: f64, duration_ms: u64, max_s: f64) -> Vec<String> {
        spindle_lasertest(power, duration_ms, max_s)
    }

    /// Rewrite an outgoing line before it reaches the wire.
    ///
    /// Side effects on the model are allowed (e.g. Grbl reconciling its
    /// report-units flag from a written `$13=` line).
    fn filter_outgoing(&mut self, line: &str) -> String {
        line.to_string()
    }

    /// Whether `ev` is this firmware's readiness signal
    fn is_ready_event(&self, ev: &RunnerEvent) -> bool;

    /// Last reported machine state word
    fn machine_state(&self) -> String;

    /// Whether the machine last reported Idle
    fn is_idle(&self) -> bool;

    /// Whether the machine last reported Hold
    fn is_hold(&self) -> bool;

    /// Whether the machine last reported Alarm
    fn is_alarm(&self) -> bool;

    /// Firmware-shaped settings snapshot for `controller:settings`
    fn settings_snapshot(&self) -> serde_json::Value;

    /// Firmware-shaped state snapshot for `controller:state`
    fn state_snapshot(&self) -> serde_json::Value;
}

/// Construct the dialect for `kind`
pub fn make_dialect(kind: ControllerKind) -> Box<dyn Dialect> {
    match kind {
        ControllerKind::Grbl => Box::new(grbl::GrblDialect::new()),
        ControllerKind::Smoothie => Box::new(smoothieware::SmoothieDialect::new()),
        ControllerKind::TinyG => Box::new(tinyg::TinyGDialect::new()),
        ControllerKind::Marlin => Box::new(marlin::MarlinDialect::new()),
    }
}

/// Shared M3/G4/M5 laser test sequence: spin up at a bounded power, dwell
/// for the requested duration, switch off. All inputs are clamped
/// non-negative.
pub fn spindle_lasertest(power: f64, duration_ms: u64, max_s: f64) -> Vec<String> {
    let power = power.max(0.0);
    let max_s = max_s.max(0.0);
    if power == 0.0 {
        return vec!["M5".to_string()];
    }
    let s = ((power / 100.0) * max_s).min(max_s).round();
    let mut cmds = vec![format!("M3 S{}", s)];
    if duration_ms > 0 {
        cmds.push(format!("G4 P{}", duration_ms as f64 / 1000.0));
        cmds.push("M5".to_string());
    }
    cmds
}
