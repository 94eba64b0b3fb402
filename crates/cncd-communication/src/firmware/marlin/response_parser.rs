//! Marlin response parsing
//!
//! Marlin is strictly line-oriented: `start` on boot, a key:value
//! capability dump for M115, `ok` acknowledgments that may carry a
//! temperature payload, `X:.. Y:.. Z:.. E:..` position replies, and
//! `echo:`/`Error:` messages.

use crate::firmware::{HeaterReading, PositionReport, RunnerEvent, TemperatureReport};

/// Parse one Marlin line into a typed event.
pub fn parse_line(line: &str) -> RunnerEvent {
    let line = line.trim();

    if line == "start" {
        return RunnerEvent::Startup {
            firmware: "Marlin".to_string(),
            version: String::new(),
            raw: line.to_string(),
        };
    }

    if line.starts_with("FIRMWARE_NAME:") {
        return parse_firmware(line);
    }

    if line == "ok" {
        return RunnerEvent::Ok;
    }

    if let Some(rest) = line.strip_prefix("ok ") {
        if rest.contains("T:") || rest.contains("B:") {
            return RunnerEvent::Temperature(parse_temperature(rest, true));
        }
        return RunnerEvent::Ok;
    }

    if (line.starts_with("T:") || line.starts_with("B:")) && line.contains(':') {
        return RunnerEvent::Temperature(parse_temperature(line, false));
    }

    if line.starts_with("X:") && line.contains("Y:") && line.contains("Z:") {
        if let Some(pos) = parse_position(line) {
            return RunnerEvent::Position(pos);
        }
    }

    if let Some(rest) = line.strip_prefix("echo:") {
        return RunnerEvent::Echo {
            raw: rest.trim().to_string(),
        };
    }

    if let Some(rest) = line.strip_prefix("Error:") {
        return RunnerEvent::Error {
            code: None,
            message: rest.trim().to_string(),
            raw: line.to_string(),
        };
    }

    RunnerEvent::Other {
        raw: line.to_string(),
    }
}

const FIRMWARE_KEYS: [&str; 6] = [
    "FIRMWARE_NAME:",
    "SOURCE_CODE_URL:",
    "PROTOCOL_VERSION:",
    "MACHINE_TYPE:",
    "EXTRUDER_COUNT:",
    "UUID:",
];

/// Extract the value of `key`, ending at the next known key.
fn field(line: &str, key: &str) -> Option<String> {
    let start = line.find(key)? + key.len();
    let rest = &line[start..];
    let end = FIRMWARE_KEYS
        .iter()
        .filter_map(|k| rest.find(k))
        .min()
        .unwrap_or(rest.len());
    let value = rest[..end].trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_firmware(line: &str) -> RunnerEvent {
    RunnerEvent::Firmware {
        firmware_name: field(line, "FIRMWARE_NAME:").unwrap_or_default(),
        protocol_version: field(line, "PROTOCOL_VERSION:"),
        machine_type: field(line, "MACHINE_TYPE:"),
        extruder_count: field(line, "EXTRUDER_COUNT:").and_then(|v| v.parse().ok()),
        uuid: field(line, "UUID:"),
    }
}

/// Parse `X:0.00 Y:0.00 Z:0.00 E:0.00 Count X:0 ...`
fn parse_position(line: &str) -> Option<PositionReport> {
    // Ignore the stepper-count tail
    let head = line.split("Count").next().unwrap_or(line);
    let mut x = None;
    let mut y = None;
    let mut z = None;
    let mut e = None;
    for token in head.split_whitespace() {
        if let Some((axis, value)) = token.split_once(':') {
            let value: f64 = value.parse().ok()?;
            match axis {
                "X" => x = Some(value),
                "Y" => y = Some(value),
                "Z" => z = Some(value),
                "E" => e = Some(value),
                _ => {}
            }
        }
    }
    Some(PositionReport {
        x: x?,
        y: y?,
        z: z?,
        e,
    })
}

/// Parse `T:201.52 /230.00 B:62.31 /65.00 @:127 B@:64 W:?`
fn parse_temperature(body: &str, ok: bool) -> TemperatureReport {
    let mut report = TemperatureReport {
        ok,
        ..TemperatureReport::default()
    };

    let tokens: Vec<&str> = body.split_whitespace().collect();
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        if let Some((key, value)) = token.split_once(':') {
            let target = tokens
                .get(i + 1)
                .and_then(|t| t.strip_prefix('/'))
                .and_then(|t| t.parse::<f64>().ok());
            match key {
                "T" | "T0" => {
                    if let Ok(deg) = value.parse::<f64>() {
                        report.extruder = Some(HeaterReading {
                            deg,
                            deg_target: target.unwrap_or(0.0),
                            power: None,
                        });
                        if target.is_some() {
                            i += 1;
                        }
                    }
                }
                "B" => {
                    if let Ok(deg) = value.parse::<f64>() {
                        report.heated_bed = Some(HeaterReading {
                            deg,
                            deg_target: target.unwrap_or(0.0),
                            power: None,
                        });
                        if target.is_some() {
                            i += 1;
                        }
                    }
                }
                "@" => {
                    if let (Some(ext), Ok(power)) = (report.extruder.as_mut(), value.parse()) {
                        ext.power = Some(power);
                    }
                }
                "B@" => {
                    if let (Some(bed), Ok(power)) = (report.heated_bed.as_mut(), value.parse()) {
                        bed.power = Some(power);
                    }
                }
                "W" => report.wait = true,
                _ => {}
            }
        }
        i += 1;
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_and_capability_lines() {
        assert!(matches!(
            parse_line("start"),
            RunnerEvent::Startup { firmware, .. } if firmware == "Marlin"
        ));

        let ev = parse_line(
            "FIRMWARE_NAME:Marlin 1.1.0 (Github) SOURCE_CODE_URL:https://github.com/MarlinFirmware/Marlin \
             PROTOCOL_VERSION:1.0 MACHINE_TYPE:RepRap EXTRUDER_COUNT:1 UUID:cede2a2f-41a2-4748-9b12-c55c62f367ff",
        );
        match ev {
            RunnerEvent::Firmware {
                firmware_name,
                protocol_version,
                machine_type,
                extruder_count,
                uuid,
            } => {
                assert_eq!(firmware_name, "Marlin 1.1.0 (Github)");
                assert_eq!(protocol_version.as_deref(), Some("1.0"));
                assert_eq!(machine_type.as_deref(), Some("RepRap"));
                assert_eq!(extruder_count, Some(1));
                assert_eq!(
                    uuid.as_deref(),
                    Some("cede2a2f-41a2-4748-9b12-c55c62f367ff")
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn plain_ok() {
        assert_eq!(parse_line("ok"), RunnerEvent::Ok);
    }

    #[test]
    fn ok_with_temperature_payload() {
        let ev = parse_line("ok T:201.52 /230.00 B:62.31 /65.00 @:127 B@:64");
        match ev {
            RunnerEvent::Temperature(t) => {
                assert!(t.ok);
                assert!(!t.wait);
                let ext = t.extruder.unwrap();
                assert_eq!(ext.deg, 201.52);
                assert_eq!(ext.deg_target, 230.0);
                assert_eq!(ext.power, Some(127.0));
                assert_eq!(t.heated_bed.unwrap().deg, 62.31);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn heating_wait_report() {
        let ev = parse_line("T:26.38 /60.00 B:25.62 /0.00 @:127 B@:0 W:?");
        match ev {
            RunnerEvent::Temperature(t) => {
                assert!(!t.ok);
                assert!(t.wait);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn position_reply() {
        let ev = parse_line("X:0.00 Y:0.00 Z:10.00 E:0.00 Count X:0 Y:0 Z:4000");
        match ev {
            RunnerEvent::Position(p) => {
                assert_eq!(p.z, 10.0);
                assert_eq!(p.e, Some(0.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn echo_and_error() {
        assert_eq!(
            parse_line("echo:busy: processing"),
            RunnerEvent::Echo {
                raw: "busy: processing".to_string()
            }
        );
        assert!(matches!(
            parse_line("Error:checksum mismatch, Last Line: 71"),
            RunnerEvent::Error { code: None, .. }
        ));
    }
}
