//! Grbl dialect
//!
//! Character-counting streaming against Grbl's 128-byte input buffer,
//! realtime singleton bytes for status/hold/resume/reset and overrides,
//! `$$`-driven settings, and the `Grbl x.y` banner as the readiness
//! signal.

pub mod error_decoder;
pub mod response_parser;

use super::{
    ControllerKind, Dialect, OpenStep, OverrideTarget, RunnerEvent, StatusReport, WireCommand,
};
use crate::sender::StreamingMode;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Grbl serial input buffer size in bytes
pub const GRBL_RX_BUFFER_SIZE: usize = 128;

// Realtime override bytes (Grbl 1.1)
const FEED_RESET: u8 = 0x90;
const FEED_PLUS_10: u8 = 0x91;
const FEED_MINUS_10: u8 = 0x92;
const FEED_PLUS_1: u8 = 0x93;
const FEED_MINUS_1: u8 = 0x94;
const RAPID_RESET: u8 = 0x95;
const RAPID_50: u8 = 0x96;
const RAPID_25: u8 = 0x97;
const SPINDLE_RESET: u8 = 0x99;
const SPINDLE_PLUS_10: u8 = 0x9A;
const SPINDLE_MINUS_10: u8 = 0x9B;
const SPINDLE_PLUS_1: u8 = 0x9C;
const SPINDLE_MINUS_1: u8 = 0x9D;
const JOG_CANCEL: u8 = 0x85;
const SOFT_RESET: u8 = 0x18;

/// Grbl firmware dialect
#[derive(Debug, Default)]
pub struct GrblDialect {
    status: StatusReport,
    modal: Value,
    settings: BTreeMap<String, String>,
    version: String,
    /// `$13` report-units flag, reconciled from written settings too
    report_inches: bool,
}

impl GrblDialect {
    /// Create the dialect with an empty model
    pub fn new() -> Self {
        Self {
            modal: Value::Null,
            ..Self::default()
        }
    }

    /// Whether `$13` says reports come back in inches
    pub fn report_inches(&self) -> bool {
        self.report_inches
    }
}

impl Dialect for GrblDialect {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Grbl
    }

    fn streaming_mode(&self) -> StreamingMode {
        StreamingMode::CharCounting {
            buffer_size: GRBL_RX_BUFFER_SIZE,
        }
    }

    fn parse_line(&mut self, line: &str) -> RunnerEvent {
        let event = response_parser::parse_line(line);
        match &event {
            RunnerEvent::Status(report) => self.status = report.clone(),
            RunnerEvent::ParserState(modal) => self.modal = modal.clone(),
            RunnerEvent::Setting { name, value } => {
                if name == "$13" {
                    self.report_inches = value != "0";
                }
                self.settings.insert(name.clone(), value.clone());
            }
            RunnerEvent::Startup { version, .. } => self.version = version.clone(),
            _ => {}
        }
        event
    }

    fn is_realtime_command(&self, data: &str) -> bool {
        // Override and jog-cancel bytes are >0x7F and travel as
        // WireCommand::Raw; only the ASCII singletons appear in line input
        let bytes = data.as_bytes();
        bytes.len() == 1 && matches!(bytes[0], b'?' | b'!' | b'~' | SOFT_RESET)
    }

    fn open_sequence(&self) -> Vec<OpenStep> {
        // Grbl announces itself with its banner; give the MCU a moment to
        // finish booting before the first query fires
        vec![OpenStep::Delay(Duration::from_millis(50))]
    }

    fn init_commands(&self) -> Vec<String> {
        vec!["$$".to_string()]
    }

    fn status_query(&self) -> Option<WireCommand> {
        Some(WireCommand::Raw(vec![b'?']))
    }

    fn parser_state_query(&self) -> Option<WireCommand> {
        Some(WireCommand::Line("$G".to_string()))
    }

    fn feedhold_command(&self) -> Option<WireCommand> {
        Some(WireCommand::Raw(vec![b'!']))
    }

    fn cyclestart_command(&self) -> Option<WireCommand> {
        Some(WireCommand::Raw(vec![b'~']))
    }

    fn reset_commands(&self) -> Vec<WireCommand> {
        vec![WireCommand::Raw(vec![SOFT_RESET])]
    }

    fn homing_command(&self) -> Option<String> {
        Some("$H".to_string())
    }

    fn unlock_command(&self) -> Option<String> {
        Some("$X".to_string())
    }

    fn sleep_command(&self) -> Option<String> {
        Some("$SLP".to_string())
    }

    fn jog_cancel_command(&self) -> Option<WireCommand> {
        Some(WireCommand::Raw(vec![JOG_CANCEL]))
    }

    fn encode_override(&mut self, target: OverrideTarget, delta: i32) -> Vec<WireCommand> {
        let byte = match (target, delta) {
            (OverrideTarget::Feed, 0) => Some(FEED_RESET),
            (OverrideTarget::Feed, 10) => Some(FEED_PLUS_10),
            (OverrideTarget::Feed, -10) => Some(FEED_MINUS_10),
            (OverrideTarget::Feed, 1) => Some(FEED_PLUS_1),
            (OverrideTarget::Feed, -1) => Some(FEED_MINUS_1),
            (OverrideTarget::Spindle, 0) => Some(SPINDLE_RESET),
            (OverrideTarget::Spindle, 10) => Some(SPINDLE_PLUS_10),
            (OverrideTarget::Spindle, -10) => Some(SPINDLE_MINUS_10),
            (OverrideTarget::Spindle, 1) => Some(SPINDLE_PLUS_1),
            (OverrideTarget::Spindle, -1) => Some(SPINDLE_MINUS_1),
            (OverrideTarget::Rapid, 0) => Some(RAPID_RESET),
            (OverrideTarget::Rapid, 50) => Some(RAPID_50),
            (OverrideTarget::Rapid, 25) => Some(RAPID_25),
            _ => None,
        };
        byte.map(|b| vec![WireCommand::Raw(vec![b])])
            .unwrap_or_default()
    }

    fn filter_outgoing(&mut self, line: &str) -> String {
        // Keep the report-units flag in sync when a client writes $13=
        if let Some(value) = line.trim().strip_prefix("$13=") {
            self.report_inches = value.trim() != "0";
        }
        line.to_string()
    }

    fn is_ready_event(&self, ev: &RunnerEvent) -> bool {
        matches!(ev, RunnerEvent::Startup { firmware, .. } if firmware == "Grbl")
    }

    fn machine_state(&self) -> String {
        self.status.machine_state.clone()
    }

    fn is_idle(&self) -> bool {
        self.status.machine_state.starts_with("Idle")
    }

    fn is_hold(&self) -> bool {
        self.status.machine_state.starts_with("Hold")
    }

    fn is_alarm(&self) -> bool {
        self.status.machine_state.starts_with("Alarm")
    }

    fn settings_snapshot(&self) -> Value {
        json!({
            "version": self.version,
            "settings": self.settings,
        })
    }

    fn state_snapshot(&self) -> Value {
        json!({
            "status": self.status,
            "parserstate": self.modal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_byte_set() {
        let d = GrblDialect::new();
        assert!(d.is_realtime_command("?"));
        assert!(d.is_realtime_command("!"));
        assert!(d.is_realtime_command("~"));
        assert!(d.is_realtime_command("\u{18}"));
        assert!(!d.is_realtime_command("$H"));
        assert!(!d.is_realtime_command("G0 X0"));
    }

    #[test]
    fn override_encoding() {
        let mut d = GrblDialect::new();
        assert_eq!(
            d.encode_override(OverrideTarget::Feed, 10),
            vec![WireCommand::Raw(vec![0x91])]
        );
        assert_eq!(
            d.encode_override(OverrideTarget::Feed, 0),
            vec![WireCommand::Raw(vec![0x90])]
        );
        assert_eq!(
            d.encode_override(OverrideTarget::Spindle, -1),
            vec![WireCommand::Raw(vec![0x9D])]
        );
        assert_eq!(
            d.encode_override(OverrideTarget::Rapid, 25),
            vec![WireCommand::Raw(vec![0x97])]
        );
        assert!(d.encode_override(OverrideTarget::Feed, 5).is_empty());
    }

    #[test]
    fn write_filter_tracks_report_units() {
        let mut d = GrblDialect::new();
        assert!(!d.report_inches());
        assert_eq!(d.filter_outgoing("$13=1"), "$13=1");
        assert!(d.report_inches());
        d.filter_outgoing("$13=0");
        assert!(!d.report_inches());
    }

    #[test]
    fn ready_on_banner_only() {
        let mut d = GrblDialect::new();
        let banner = d.parse_line("Grbl 1.1h ['$' for help]");
        assert!(d.is_ready_event(&banner));
        let ok = d.parse_line("ok");
        assert!(!d.is_ready_event(&ok));
    }

    #[test]
    fn model_tracks_status_and_settings() {
        let mut d = GrblDialect::new();
        d.parse_line("<Hold:0|MPos:0.000,0.000,0.000>");
        assert!(d.is_hold());
        assert!(!d.is_idle());
        d.parse_line("$13=1");
        assert!(d.report_inches());
        assert_eq!(d.settings_snapshot()["settings"]["$13"], "1");
    }
}
