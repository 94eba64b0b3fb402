//! Grbl response parsing
//!
//! Classifies Grbl protocol lines into typed events: `ok`, `error:N`,
//! `ALARM:N`, `<...>` status reports (1.1 pipe format and 0.9 comma
//! format), `$N=V` settings, `[GC:...]` parser state, bracketed feedback
//! messages, and the startup banner.

use super::error_decoder;
use crate::firmware::{RunnerEvent, StatusReport};
use cncd_core::MachinePosition;
use serde_json::{json, Value};

/// Parse one Grbl line into a typed event.
pub fn parse_line(line: &str) -> RunnerEvent {
    let line = line.trim();

    if line == "ok" {
        return RunnerEvent::Ok;
    }

    if let Some(rest) = line.strip_prefix("error:") {
        let rest = rest.trim();
        return match rest.parse::<u16>() {
            Ok(code) => RunnerEvent::Error {
                code: Some(code),
                message: error_decoder::decode_error(code).to_string(),
                raw: line.to_string(),
            },
            // Grbl 0.9 reports a text message instead of a code
            Err(_) => RunnerEvent::Error {
                code: None,
                message: rest.to_string(),
                raw: line.to_string(),
            },
        };
    }

    if let Some(rest) = line.strip_prefix("ALARM:") {
        let code = rest.trim().parse::<u16>().ok();
        let message = match code {
            Some(code) => error_decoder::decode_alarm(code).to_string(),
            None => rest.trim().to_string(),
        };
        return RunnerEvent::Alarm {
            code,
            message,
            raw: line.to_string(),
        };
    }

    if line.starts_with('<') && line.ends_with('>') {
        return RunnerEvent::Status(parse_status(&line[1..line.len() - 1]));
    }

    if line.starts_with('$') && line.contains('=') {
        if let Some((name, value)) = line.split_once('=') {
            return RunnerEvent::Setting {
                name: name.to_string(),
                value: value.trim().to_string(),
            };
        }
    }

    if let Some(rest) = line.strip_prefix("[GC:").and_then(|r| r.strip_suffix(']')) {
        return RunnerEvent::ParserState(parse_modal(rest));
    }

    // Grbl 0.9 parser state is bracketed without the GC: tag; parameter
    // reports like [G54:...] carry a colon and are not modal state
    if line.starts_with("[G") && line.ends_with(']') && !line.contains(':') {
        return RunnerEvent::ParserState(parse_modal(&line[1..line.len() - 1]));
    }

    if line.starts_with("Grbl ") {
        let version = line
            .split_whitespace()
            .nth(1)
            .unwrap_or_default()
            .to_string();
        return RunnerEvent::Startup {
            firmware: "Grbl".to_string(),
            version,
            raw: line.to_string(),
        };
    }

    RunnerEvent::Other {
        raw: line.to_string(),
    }
}

/// Parse the inside of a `<...>` status report.
pub fn parse_status(body: &str) -> StatusReport {
    let mut report = StatusReport::default();

    if body.contains('|') {
        // Grbl 1.1: <Idle|MPos:0,0,0|Bf:15,128|FS:0,0|Ov:100,100,100>
        let mut parts = body.split('|');
        report.machine_state = parts.next().unwrap_or_default().trim().to_string();
        for part in parts {
            let part = part.trim();
            if let Some(pos) = part.strip_prefix("MPos:") {
                report.mpos = MachinePosition::parse(pos);
            } else if let Some(pos) = part.strip_prefix("WPos:") {
                report.wpos = MachinePosition::parse(pos);
            } else if let Some(pos) = part.strip_prefix("WCO:") {
                report.wco = MachinePosition::parse(pos);
            } else if let Some(buf) = part.strip_prefix("Bf:") {
                let mut nums = buf.split(',');
                report.planner_blocks = nums.next().and_then(|n| n.trim().parse().ok());
                report.rx_bytes = nums.next().and_then(|n| n.trim().parse().ok());
            } else if let Some(fs) = part.strip_prefix("FS:") {
                let mut nums = fs.split(',');
                report.feed_rate = nums.next().and_then(|n| n.trim().parse().ok());
                report.spindle_speed = nums.next().and_then(|n| n.trim().parse().ok());
            } else if let Some(f) = part.strip_prefix("F:") {
                report.feed_rate = f.trim().parse().ok();
            } else if let Some(ov) = part.strip_prefix("Ov:") {
                let nums: Vec<u8> = ov.split(',').filter_map(|n| n.trim().parse().ok()).collect();
                if nums.len() == 3 {
                    report.overrides = Some((nums[0], nums[1], nums[2]));
                }
            }
        }
    } else {
        // Grbl 0.9: <Idle,MPos:0.000,0.000,0.000,WPos:0.000,0.000,0.000>
        report.machine_state = body.split(',').next().unwrap_or_default().trim().to_string();
        if let Some(pos) = scan_coords(body, "MPos:") {
            report.mpos = Some(pos);
        }
        if let Some(pos) = scan_coords(body, "WPos:") {
            report.wpos = Some(pos);
        }
        if let Some(buf) = scan_field(body, "Buf:") {
            report.planner_blocks = buf.parse().ok();
        }
        if let Some(rx) = scan_field(body, "RX:") {
            report.rx_bytes = rx.parse().ok();
        }
    }

    report
}

fn scan_coords(body: &str, tag: &str) -> Option<MachinePosition> {
    let start = body.find(tag)? + tag.len();
    let coords: String = body[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == ',')
        .collect();
    MachinePosition::parse(coords.trim_end_matches(','))
}

fn scan_field<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let start = body.find(tag)? + tag.len();
    let rest = &body[start..];
    Some(rest.split(',').next().unwrap_or(rest).trim())
}

/// Parse a modal word list (`G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0`) into
/// the modal-group snapshot clients consume.
pub fn parse_modal(words: &str) -> Value {
    let mut motion = Value::Null;
    let mut wcs = Value::Null;
    let mut plane = Value::Null;
    let mut units = Value::Null;
    let mut distance = Value::Null;
    let mut feedrate_mode = Value::Null;
    let mut program = Value::Null;
    let mut spindle = Value::Null;
    let mut coolant: Vec<String> = Vec::new();
    let mut tool = Value::Null;
    let mut feedrate = Value::Null;
    let mut rpm = Value::Null;

    for word in words.split_whitespace() {
        let (letter, number) = match word.split_at_checked(1) {
            Some((l, n)) if !n.is_empty() => (l, n),
            _ => continue,
        };
        let value: f64 = match number.parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        match letter {
            "G" => match value as u32 {
                0..=3 | 38 | 80 => motion = json!(word),
                54..=59 => wcs = json!(word),
                17..=19 => plane = json!(word),
                20 | 21 => units = json!(word),
                90 | 91 => distance = json!(word),
                93 | 94 => feedrate_mode = json!(word),
                _ => {}
            },
            "M" => match value as u32 {
                0..=2 | 30 => program = json!(word),
                3..=5 => spindle = json!(word),
                7..=9 => coolant.push(word.to_string()),
                _ => {}
            },
            "T" => tool = json!(value as u32),
            "F" => feedrate = json!(value),
            "S" => rpm = json!(value),
            _ => {}
        }
    }

    json!({
        "modal": {
            "motion": motion,
            "wcs": wcs,
            "plane": plane,
            "units": units,
            "distance": distance,
            "feedrate": feedrate_mode,
            "program": program,
            "spindle": spindle,
            "coolant": coolant,
        },
        "tool": tool,
        "feedrate": feedrate,
        "spindle": rpm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ok_error_alarm() {
        assert_eq!(parse_line("ok"), RunnerEvent::Ok);

        match parse_line("error:22") {
            RunnerEvent::Error { code, message, .. } => {
                assert_eq!(code, Some(22));
                assert!(message.contains("Feed rate"));
            }
            other => panic!("unexpected {other:?}"),
        }

        match parse_line("error: Bad number format") {
            RunnerEvent::Error { code, message, .. } => {
                assert_eq!(code, None);
                assert_eq!(message, "Bad number format");
            }
            other => panic!("unexpected {other:?}"),
        }

        match parse_line("ALARM:2") {
            RunnerEvent::Alarm { code, message, raw } => {
                assert_eq!(code, Some(2));
                assert!(message.contains("exceeds machine travel"));
                assert_eq!(raw, "ALARM:2");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_v11_status() {
        let ev = parse_line("<Idle|MPos:1.000,2.000,3.000|Bf:15,128|FS:500,8000|Ov:100,50,25>");
        let report = match ev {
            RunnerEvent::Status(r) => r,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(report.machine_state, "Idle");
        assert_eq!(report.mpos.unwrap().y, 2.0);
        assert_eq!(report.planner_blocks, Some(15));
        assert_eq!(report.rx_bytes, Some(128));
        assert_eq!(report.feed_rate, Some(500.0));
        assert_eq!(report.overrides, Some((100, 50, 25)));
    }

    #[test]
    fn parses_v09_status() {
        let ev = parse_line("<Run,MPos:5.529,0.560,7.000,WPos:1.529,-5.440,-0.000>");
        let report = match ev {
            RunnerEvent::Status(r) => r,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(report.machine_state, "Run");
        assert_eq!(report.mpos.unwrap().x, 5.529);
        assert_eq!(report.wpos.unwrap().z, -0.0);
    }

    #[test]
    fn parses_settings_and_banner() {
        assert_eq!(
            parse_line("$13=0"),
            RunnerEvent::Setting {
                name: "$13".to_string(),
                value: "0".to_string()
            }
        );

        match parse_line("Grbl 1.1h ['$' for help]") {
            RunnerEvent::Startup {
                firmware, version, ..
            } => {
                assert_eq!(firmware, "Grbl");
                assert_eq!(version, "1.1h");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_parser_state() {
        let ev = parse_line("[GC:G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0]");
        let v = match ev {
            RunnerEvent::ParserState(v) => v,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(v["modal"]["motion"], "G0");
        assert_eq!(v["modal"]["wcs"], "G54");
        assert_eq!(v["modal"]["units"], "G21");
        assert_eq!(v["tool"], 0);
    }

    #[test]
    fn feedback_messages_are_other() {
        assert!(matches!(
            parse_line("[MSG:Caution: Unlocked]"),
            RunnerEvent::Other { .. }
        ));
    }
}
