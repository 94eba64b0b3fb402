//! Smoothieware dialect
//!
//! Smoothieboards expose a Grbl-compatible wire surface: `<...>` status
//! reports, `ok`/`error:` replies, and the `?`/`!`/`~`/0x18 realtime
//! singletons. Differences from Grbl: readiness comes from the `version`
//! reply (queried after a ~1 s boot delay, and marked ready before the
//! post-banner init runs), overrides travel as M220/M221 clamped to
//! [10, 200], and laser testing uses the `fire` console command.

pub mod response_parser;

use super::{
    ControllerKind, Dialect, OpenStep, OverrideTarget, RunnerEvent, StatusReport, WireCommand,
};
use crate::sender::StreamingMode;
use serde_json::{json, Value};
use std::time::Duration;

/// Smoothieware serial input buffer size in bytes
pub const SMOOTHIE_RX_BUFFER_SIZE: usize = 128;

const SOFT_RESET: u8 = 0x18;

fn clamp_override(pct: i32) -> i32 {
    pct.clamp(10, 200)
}

/// Smoothieware firmware dialect
#[derive(Debug)]
pub struct SmoothieDialect {
    status: StatusReport,
    modal: Value,
    version: String,
    feed_override: i32,
    spindle_override: i32,
}

impl SmoothieDialect {
    /// Create the dialect with an empty model
    pub fn new() -> Self {
        Self {
            status: StatusReport::default(),
            modal: Value::Null,
            version: String::new(),
            feed_override: 100,
            spindle_override: 100,
        }
    }
}

impl Default for SmoothieDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for SmoothieDialect {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Smoothie
    }

    fn streaming_mode(&self) -> StreamingMode {
        StreamingMode::CharCounting {
            buffer_size: SMOOTHIE_RX_BUFFER_SIZE,
        }
    }

    fn parse_line(&mut self, line: &str) -> RunnerEvent {
        let event = response_parser::parse_line(line);
        match &event {
            RunnerEvent::Status(report) => self.status = report.clone(),
            RunnerEvent::ParserState(modal) => self.modal = modal.clone(),
            RunnerEvent::Startup { version, .. } => self.version = version.clone(),
            _ => {}
        }
        event
    }

    fn is_realtime_command(&self, data: &str) -> bool {
        let bytes = data.as_bytes();
        bytes.len() == 1 && matches!(bytes[0], b'?' | b'!' | b'~' | SOFT_RESET)
    }

    fn open_sequence(&self) -> Vec<OpenStep> {
        // A Smoothieboard takes around a second to come up; then ask who
        // it is
        vec![
            OpenStep::Delay(Duration::from_millis(1000)),
            OpenStep::Send(WireCommand::Line("version".to_string())),
        ]
    }

    fn init_commands(&self) -> Vec<String> {
        vec!["$G".to_string()]
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

    fn lasertest_commands(&self, power: f64, duration_ms: u64, _max_s: f64) -> Vec<String> {
        let power = power.max(0.0);
        if power == 0.0 {
            return vec!["fire off".to_string()];
        }
        let mut cmds = vec![format!("fire {}", power.min(100.0))];
        if duration_ms > 0 {
            cmds.push(format!("G4 P{}", duration_ms as f64 / 1000.0));
            cmds.push("fire off".to_string());
        }
        cmds
    }

    fn is_ready_event(&self, ev: &RunnerEvent) -> bool {
        matches!(ev, RunnerEvent::Startup { firmware, .. } if firmware == "Smoothie")
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
    fn overrides_clamp_to_smoothie_range() {
        let mut d = SmoothieDialect::new();
        assert_eq!(
            d.encode_override(OverrideTarget::Feed, 10),
            vec![WireCommand::Line("M220 S110".to_string())]
        );
        for _ in 0..20 {
            d.encode_override(OverrideTarget::Feed, 10);
        }
        assert_eq!(
            d.encode_override(OverrideTarget::Feed, 10),
            vec![WireCommand::Line("M220 S200".to_string())]
        );
        assert_eq!(
            d.encode_override(OverrideTarget::Feed, 0),
            vec![WireCommand::Line("M220 S100".to_string())]
        );
        assert!(d.encode_override(OverrideTarget::Rapid, 0).is_empty());
    }

    #[test]
    fn fire_command_for_laser_test() {
        let d = SmoothieDialect::new();
        assert_eq!(
            d.lasertest_commands(30.0, 2000, 255.0),
            vec!["fire 30", "G4 P2", "fire off"]
        );
        assert_eq!(d.lasertest_commands(0.0, 0, 255.0), vec!["fire off"]);
    }

    #[test]
    fn ready_on_version_reply() {
        let mut d = SmoothieDialect::new();
        let ev = d.parse_line(
            "Build version: edge-3332442, Build date: Oct 28 2017, MCU: LPC1769, System Clock: 120MHz",
        );
        assert!(d.is_ready_event(&ev));
    }
}
