//! TinyG/g2core dialect
//!
//! JSON request framing, queue-report-driven streaming: the send window is
//! replenished by the free planner-slot count the firmware publishes in
//! `qr` events rather than by counting `ok`s. Realtime characters `!`,
//! `~`, `%` still work when the board drops to text mode.

pub mod response_parser;

use super::{ControllerKind, Dialect, OpenStep, OverrideTarget, RunnerEvent, StatusReport, WireCommand};
use crate::sender::StreamingMode;
use serde_json::{json, Value};
use std::time::Duration;

/// Planner queue depth when empty
pub const TINYG_PLANNER_QUEUE_SIZE: usize = 28;

/// Stop sending when reported free slots drop to this level
pub const TINYG_QUEUE_LOW_WATER: usize = 4;

const SOFT_RESET: u8 = 0x18;

/// TinyG firmware dialect
#[derive(Debug, Default)]
pub struct TinyGDialect {
    status: StatusReport,
    sys: Value,
    version: String,
}

impl TinyGDialect {
    /// Create the dialect with an empty model
    pub fn new() -> Self {
        Self {
            sys: Value::Null,
            ..Self::default()
        }
    }
}

impl Dialect for TinyGDialect {
    fn kind(&self) -> ControllerKind {
        ControllerKind::TinyG
    }

    fn streaming_mode(&self) -> StreamingMode {
        StreamingMode::QueueReports {
            queue_size: TINYG_PLANNER_QUEUE_SIZE,
            low_water: TINYG_QUEUE_LOW_WATER,
        }
    }

    fn parse_line(&mut self, line: &str) -> RunnerEvent {
        let parsed = response_parser::parse_line(line);
        if let Some(sr) = parsed.embedded_sr {
            self.status = sr;
        }
        if let Some(sys) = parsed.sys {
            self.sys = sys;
        }
        match &parsed.event {
            RunnerEvent::Status(report) => self.status = report.clone(),
            RunnerEvent::Startup { version, .. } => self.version = version.clone(),
            _ => {}
        }
        parsed.event
    }

    fn is_realtime_command(&self, data: &str) -> bool {
        let bytes = data.as_bytes();
        bytes.len() == 1 && matches!(bytes[0], b'!' | b'~' | b'%' | SOFT_RESET)
    }

    fn open_sequence(&self) -> Vec<OpenStep> {
        // Strict JSON mode, terse responses, queue and status reports on,
        // then identify the board
        let setup = [
            json!({"js": 1}),
            json!({"jv": 4}),
            json!({"qv": 1}),
            json!({"sv": 1}),
            json!({"si": 250}),
        ];
        let mut steps = Vec::new();
        for cmd in setup {
            steps.push(OpenStep::Send(WireCommand::Line(cmd.to_string())));
            steps.push(OpenStep::Delay(Duration::from_millis(50)));
        }
        steps.push(OpenStep::Send(WireCommand::Line(
            json!({"sys": null}).to_string(),
        )));
        steps
    }

    fn init_commands(&self) -> Vec<String> {
        vec![
            json!({"sr": null}).to_string(),
            json!({"qr": null}).to_string(),
        ]
    }

    fn status_query(&self) -> Option<WireCommand> {
        Some(WireCommand::Line(json!({"sr": null}).to_string()))
    }

    fn parser_state_query(&self) -> Option<WireCommand> {
        // Modal state rides on the status report
        None
    }

    fn feedhold_command(&self) -> Option<WireCommand> {
        Some(WireCommand::Raw(vec![b'!']))
    }

    fn cyclestart_command(&self) -> Option<WireCommand> {
        Some(WireCommand::Raw(vec![b'~']))
    }

    fn reset_commands(&self) -> Vec<WireCommand> {
        // Flush the planner queue before the hard reset
        vec![
            WireCommand::Raw(vec![b'!']),
            WireCommand::Raw(vec![b'%']),
            WireCommand::Raw(vec![SOFT_RESET]),
        ]
    }

    fn homing_command(&self) -> Option<String> {
        Some("G28.2 X0 Y0 Z0".to_string())
    }

    fn unlock_command(&self) -> Option<String> {
        Some(json!({"clear": null}).to_string())
    }

    fn encode_override(&mut self, _target: OverrideTarget, _delta: i32) -> Vec<WireCommand> {
        // TinyG has no runtime override commands
        Vec::new()
    }

    fn is_ready_event(&self, ev: &RunnerEvent) -> bool {
        matches!(ev, RunnerEvent::Startup { firmware, .. } if firmware == "TinyG")
    }

    fn machine_state(&self) -> String {
        self.status.machine_state.clone()
    }

    fn is_idle(&self) -> bool {
        matches!(
            self.status.machine_state.as_str(),
            "Ready" | "Stop" | "End"
        )
    }

    fn is_hold(&self) -> bool {
        self.status.machine_state == "Hold"
    }

    fn is_alarm(&self) -> bool {
        matches!(
            self.status.machine_state.as_str(),
            "Alarm" | "Shutdown" | "Panic"
        )
    }

    fn settings_snapshot(&self) -> Value {
        json!({
            "version": self.version,
            "sys": self.sys,
        })
    }

    fn state_snapshot(&self) -> Value {
        json!({
            "status": self.status,
        })
    }
}
