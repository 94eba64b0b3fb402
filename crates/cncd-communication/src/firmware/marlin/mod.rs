//! Marlin dialect
//!
//! Strictly line-oriented send-response streaming: one outstanding line,
//! advance on `ok`. Readiness comes from the M115 capability reply; a
//! later `start` banner (board reboot) triggers an idempotent re-query.
//! No realtime bytes: reset is M112, overrides are M220/M221 clamped to
//! [10, 500].

pub mod response_parser;

use super::{
    ControllerKind, Dialect, OpenStep, OverrideTarget, PositionReport, RunnerEvent,
    TemperatureReport, WireCommand,
};
use crate::sender::StreamingMode;
use serde_json::{json, Value};

fn clamp_override(pct: i32) -> i32 {
    pct.clamp(10, 500)
}

/// Marlin firmware dialect
#[derive(Debug)]
pub struct MarlinDialect {
    firmware_name: String,
    machine_type: Option<String>,
    extruder_count: Option<u8>,
    position: PositionReport,
    temperature: TemperatureReport,
    feed_override: i32,
    spindle_override: i32,
}

impl MarlinDialect {
    /// Create the dialect with an empty model
    pub fn new() -> Self {
        Self {
            firmware_name: String::new(),
            machine_type: None,
            extruder_count: None,
            position: PositionReport::default(),
            temperature: TemperatureReport::default(),
            feed_override: 100,
            spindle_override: 100,
        }
    }
}

impl Default for MarlinDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for MarlinDialect {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Marlin
    }

    fn streaming_mode(&self) -> StreamingMode {
        StreamingMode::SendResponse
    }

    fn parse_line(&mut self, line: &str) -> RunnerEvent {
        let event = response_parser::parse_line(line);
        match &event {
            RunnerEvent::Firmware {
                firmware_name,
                machine_type,
                extruder_count,
                ..
            } => {
                self.firmware_name = firmware_name.clone();
                self.machine_type = machine_type.clone();
                self.extruder_count = *extruder_count;
            }
            RunnerEvent::Position(pos) => self.position = *pos,
            RunnerEvent::Temperature(temp) => self.temperature = temp.clone(),
            _ => {}
        }
        event
    }

    fn is_realtime_command(&self, _data: &str) -> bool {
        false
    }

    fn open_sequence(&self) -> Vec<OpenStep> {
        vec![OpenStep::Send(WireCommand::Line("M115".to_string()))]
    }

    fn init_commands(&self) -> Vec<String> {
        Vec::new()
    }

    fn startup_requery_commands(&self) -> Vec<String> {
        // A rebooted board says `start`; ask who it is again
        vec!["M115".to_string()]
    }

    fn status_query(&self) -> Option<WireCommand> {
        Some(WireCommand::Line("M114".to_string()))
    }

    fn parser_state_query(&self) -> Option<WireCommand> {
        Some(WireCommand::Line("M105".to_string()))
    }

    fn feedhold_command(&self) -> Option<WireCommand> {
        None
    }

    fn cyclestart_command(&self) -> Option<WireCommand> {
        None
    }

    fn reset_commands(&self) -> Vec<WireCommand> {
        vec![WireCommand::Line("M112".to_string())]
    }

    fn homing_command(&self) -> Option<String> {
        Some("G28.2 X Y Z".to_string())
    }

    fn encode_override(&mut self, target: OverrideTarget, delta: i32) -> Vec<WireCommand> {
        match target {
            OverrideTarget::Feed => {
                self.feed_override = if delta == 0 {
                    100
                } else {
                    clamp_override(self.feed_override + delta)
                };
                vec![WireCommand::Line(format!("M220 S{}", self.feed_override))]
            }
            OverrideTarget::Spindle => {
                self.spindle_override = if delta == 0 {
                    100
                } else {
                    clamp_override(self.spindle_override + delta)
                };
                vec![WireCommand::Line(format!("M221 S{}", self.spindle_override))]
            }
            OverrideTarget::Rapid => Vec::new(),
        }
    }

    fn is_ready_event(&self, ev: &RunnerEvent) -> bool {
        matches!(ev, RunnerEvent::Firmware { .. })
    }

    fn machine_state(&self) -> String {
        // Marlin reports no machine state word
        String::new()
    }

    fn is_idle(&self) -> bool {
        // Without a state report the machine is presumed quiescent; the
        // finish detector then fires on its own 500 ms timer
        true
    }

    fn is_hold(&self) -> bool {
        false
    }

    fn is_alarm(&self) -> bool {
        false
    }

    fn settings_snapshot(&self) -> Value {
        json!({
            "firmwareName": self.firmware_name,
            "machineType": self.machine_type,
            "extruderCount": self.extruder_count,
        })
    }

    fn state_snapshot(&self) -> Value {
        json!({
            "pos": self.position,
            "temperature": self.temperature,
            "ovF": self.feed_override,
            "ovS": self.spindle_override,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_on_firmware_reply_not_start() {
        let mut d = MarlinDialect::new();
        let start = d.parse_line("start");
        assert!(!d.is_ready_event(&start));
        let fw = d.parse_line("FIRMWARE_NAME:Marlin 2.0 PROTOCOL_VERSION:1.0");
        assert!(d.is_ready_event(&fw));
        assert_eq!(d.settings_snapshot()["firmwareName"], "Marlin 2.0");
    }

    #[test]
    fn overrides_clamp_to_marlin_range() {
        let mut d = MarlinDialect::new();
        assert_eq!(
            d.encode_override(OverrideTarget::Feed, 10),
            vec![WireCommand::Line("M220 S110".to_string())]
        );
        for _ in 0..60 {
            d.encode_override(OverrideTarget::Feed, 10);
        }
        assert_eq!(
            d.encode_override(OverrideTarget::Feed, 10),
            vec![WireCommand::Line("M220 S500".to_string())]
        );
        assert_eq!(
            d.encode_override(OverrideTarget::Feed, 0),
            vec![WireCommand::Line("M220 S100".to_string())]
        );
    }

    #[test]
    fn position_updates_model() {
        let mut d = MarlinDialect::new();
        d.parse_line("X:1.00 Y:2.00 Z:3.00 E:0.00 Count X:0 Y:0 Z:0");
        assert_eq!(d.state_snapshot()["pos"]["x"], 1.0);
    }
}
