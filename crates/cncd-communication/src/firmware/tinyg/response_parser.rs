//! TinyG/g2core response parsing
//!
//! TinyG frames everything in JSON. Asynchronous reports arrive as
//! top-level `sr` (status), `qr` (queue) and `rx` (buffer) objects;
//! command replies arrive wrapped in `r` with an `f` footer whose second
//! element is the status code. A reply may carry an embedded `sr`, which
//! the dialect folds into its model while the reply itself still counts
//! as the acknowledgment.

use crate::firmware::{RunnerEvent, StatusReport};
use cncd_core::MachinePosition;
use serde_json::Value;

/// Machine state word for a TinyG `stat` number
pub fn stat_name(stat: u64) -> &'static str {
    match stat {
        0 => "Init",
        1 => "Ready",
        2 => "Alarm",
        3 => "Stop",
        4 => "End",
        5 => "Run",
        6 => "Hold",
        7 => "Probe",
        8 => "Cycle",
        9 => "Homing",
        10 => "Jog",
        11 => "Interlock",
        12 => "Shutdown",
        13 => "Panic",
        _ => "Unknown",
    }
}

/// Outcome of parsing one TinyG line: the event to dispatch plus any
/// embedded status report to fold into the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    /// Event for the controller
    pub event: RunnerEvent,
    /// Status report embedded in a response wrapper
    pub embedded_sr: Option<StatusReport>,
    /// Queue report embedded in a response wrapper
    pub embedded_qr: Option<u32>,
    /// Raw `sys` object from a system query reply
    pub sys: Option<Value>,
}

impl Parsed {
    fn event(event: RunnerEvent) -> Self {
        Self {
            event,
            embedded_sr: None,
            embedded_qr: None,
            sys: None,
        }
    }
}

/// Parse one TinyG line.
pub fn parse_line(line: &str) -> Parsed {
    let line = line.trim();

    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            return Parsed::event(RunnerEvent::Other {
                raw: line.to_string(),
            })
        }
    };

    // Asynchronous reports
    if let Some(sr) = value.get("sr") {
        if value.get("r").is_none() {
            return Parsed::event(RunnerEvent::Status(parse_sr(sr)));
        }
    }
    if let Some(qr) = value.get("qr").and_then(Value::as_u64) {
        return Parsed::event(RunnerEvent::QueueReport {
            qr: qr as u32,
            qi: value.get("qi").and_then(Value::as_u64).map(|v| v as u32),
            qo: value.get("qo").and_then(Value::as_u64).map(|v| v as u32),
        });
    }
    if let Some(rx) = value.get("rx").and_then(Value::as_u64) {
        return Parsed::event(RunnerEvent::Rx { rx: rx as u32 });
    }

    // Command replies
    if let Some(r) = value.get("r") {
        let status = value
            .get("f")
            .and_then(|f| f.get(1))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let embedded_sr = r.get("sr").map(parse_sr);
        let embedded_qr = r.get("qr").and_then(Value::as_u64).map(|v| v as u32);
        let sys = r.get("sys").cloned();

        let event = if status != 0 {
            RunnerEvent::Error {
                code: Some(status as u16),
                message: format!("TinyG status code {status}"),
                raw: line.to_string(),
            }
        } else if let Some(sys) = r.get("sys") {
            let version = sys
                .get("fb")
                .or_else(|| sys.get("fv"))
                .map(|v| v.to_string())
                .unwrap_or_default();
            RunnerEvent::Startup {
                firmware: "TinyG".to_string(),
                version,
                raw: line.to_string(),
            }
        } else if r.get("fv").is_some() || r.get("fb").is_some() {
            RunnerEvent::Startup {
                firmware: "TinyG".to_string(),
                version: r
                    .get("fb")
                    .or_else(|| r.get("fv"))
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
                raw: line.to_string(),
            }
        } else {
            RunnerEvent::Ok
        };

        return Parsed {
            event,
            embedded_sr,
            embedded_qr,
            sys,
        };
    }

    // Exception report
    if let Some(er) = value.get("er") {
        let msg = er
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("exception report");
        return Parsed::event(RunnerEvent::Error {
            code: er.get("st").and_then(Value::as_u64).map(|v| v as u16),
            message: msg.to_string(),
            raw: line.to_string(),
        });
    }

    Parsed::event(RunnerEvent::Other {
        raw: line.to_string(),
    })
}

/// Parse a status-report object into the normalized shape.
pub fn parse_sr(sr: &Value) -> StatusReport {
    let mut report = StatusReport::default();

    if let Some(stat) = sr.get("stat").and_then(Value::as_u64) {
        report.machine_state = stat_name(stat).to_string();
    }

    let axis = |key: &str| sr.get(key).and_then(Value::as_f64);
    if let (Some(x), Some(y), Some(z)) = (axis("posx"), axis("posy"), axis("posz")) {
        report.wpos = Some(MachinePosition {
            x,
            y,
            z,
            a: axis("posa"),
            b: axis("posb"),
            c: axis("posc"),
        });
    }
    if let (Some(x), Some(y), Some(z)) = (axis("mpox"), axis("mpoy"), axis("mpoz")) {
        report.mpos = Some(MachinePosition {
            x,
            y,
            z,
            a: axis("mpoa"),
            b: None,
            c: None,
        });
    }
    report.feed_rate = axis("feed");
    report.spindle_speed = axis("sps");

    report
}
