//! Smoothieware response parsing
//!
//! Smoothieware deliberately mimics the Grbl wire format for status
//! reports and modal state, so those fields are parsed with the shared
//! Grbl field walkers. Version replies and console errors have their own
//! shapes.

use crate::firmware::grbl::response_parser::{parse_modal, parse_status};
use crate::firmware::RunnerEvent;

/// Parse one Smoothieware line into a typed event.
pub fn parse_line(line: &str) -> RunnerEvent {
    let line = line.trim();

    if line.eq_ignore_ascii_case("ok") {
        return RunnerEvent::Ok;
    }

    if let Some(rest) = line
        .strip_prefix("error:")
        .or_else(|| line.strip_prefix("Error:"))
    {
        return RunnerEvent::Error {
            code: None,
            message: rest.trim().to_string(),
            raw: line.to_string(),
        };
    }

    if let Some(rest) = line.strip_prefix("ALARM:") {
        // Smoothieware reports Grbl-numbered alarms
        let code = rest.trim().parse::<u16>().ok();
        let message = match code {
            Some(code) => crate::firmware::grbl::error_decoder::decode_alarm(code).to_string(),
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

    if let Some(rest) = line.strip_prefix("[GC:").and_then(|r| r.strip_suffix(']')) {
        return RunnerEvent::ParserState(parse_modal(rest));
    }

    if line.starts_with("[G") && line.ends_with(']') && !line.contains(':') {
        return RunnerEvent::ParserState(parse_modal(&line[1..line.len() - 1]));
    }

    if let Some(rest) = line.strip_prefix("Build version:") {
        let version = rest
            .split(',')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        return RunnerEvent::Startup {
            firmware: "Smoothie".to_string(),
            version,
            raw: line.to_string(),
        };
    }

    RunnerEvent::Other {
        raw: line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_reply_is_startup() {
        let ev = parse_line(
            "Build version: edge-94de12c, Build date: Jan 1 2018, MCU: LPC1769, System Clock: 120MHz",
        );
        match ev {
            RunnerEvent::Startup {
                firmware, version, ..
            } => {
                assert_eq!(firmware, "Smoothie");
                assert_eq!(version, "edge-94de12c");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn grbl_shaped_status_parses() {
        let ev = parse_line("<Run|MPos:10.000,20.000,5.000|WPos:0.000,0.000,0.000|F:4000.0,100.0>");
        match ev {
            RunnerEvent::Status(report) => {
                assert_eq!(report.machine_state, "Run");
                assert_eq!(report.mpos.unwrap().x, 10.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn console_error_has_no_code() {
        match parse_line("error: Unsupported command") {
            RunnerEvent::Error { code, message, .. } => {
                assert_eq!(code, None);
                assert_eq!(message, "Unsupported command");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
