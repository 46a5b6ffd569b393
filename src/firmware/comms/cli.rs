/// Diagnostic CLI.
///
/// Token-based line protocol over the debug stream. Every line is answered
/// with `OK\r\n` (possibly preceded by payload lines) or `ERR <msg>\r\n`.
/// The CLI shares the register file with the bus protocol, so `conf set`
/// and a bus register write are the same operation.

use core::fmt::Write as _;
use heapless::String;

use super::registers::{RegValue, RegisterFile, lookup_name};
use crate::firmware::control::ServoCommand;
use crate::firmware::control::modes::{HomingCmd, ModeRequest, PositionCmd, StayWithinCmd};

/// Response buffer; large enough for `tel list`.
pub type CliResponse = String<1024>;

fn ok(mut out: CliResponse) -> CliResponse {
    let _ = out.push_str("OK\r\n");
    out
}

fn err(message: &str) -> CliResponse {
    let mut out = CliResponse::new();
    let _ = write!(out, "ERR {message}\r\n");
    out
}

fn parse_f32(token: Option<&str>) -> Option<f32> {
    token?.parse::<f32>().ok()
}

fn parse_f32_or(token: Option<&str>, default: f32) -> Option<f32> {
    match token {
        None => Some(default),
        Some(t) => t.parse::<f32>().ok(),
    }
}

fn format_value(out: &mut CliResponse, value: RegValue) {
    match value {
        RegValue::I8(v) => {
            let _ = write!(out, "{v}");
        }
        RegValue::I16(v) => {
            let _ = write!(out, "{v}");
        }
        RegValue::I32(v) => {
            let _ = write!(out, "{v}");
        }
        RegValue::U32(v) => {
            let _ = write!(out, "{v}");
        }
        RegValue::F32(v) => {
            let _ = write!(out, "{v}");
        }
    }
}

/// Process one command line.
pub fn process_line(line: &str, registers: &mut RegisterFile) -> CliResponse {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some("d") => process_d(&mut tokens, registers),
        Some("tel") => process_tel(&mut tokens, registers),
        Some("conf") => process_conf(&mut tokens, registers),
        Some(_) => err("unknown command"),
        None => ok(CliResponse::new()),
    }
}

fn process_d<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    registers: &mut RegisterFile,
) -> CliResponse {
    match tokens.next() {
        Some("stop") => {
            registers.submit(ServoCommand::Mode(ModeRequest::Stop));
            ok(CliResponse::new())
        }
        Some("brake") => {
            registers.submit(ServoCommand::Mode(ModeRequest::Brake));
            ok(CliResponse::new())
        }
        Some("zero") => {
            registers.submit(ServoCommand::Mode(ModeRequest::ZeroVelocity));
            ok(CliResponse::new())
        }
        Some("pos") => {
            let Some(position) = parse_f32(tokens.next()) else {
                return err("usage: d pos <pos> <vel> <max_t> [kp] [kd] [ff] [wd]");
            };
            let Some(velocity) = parse_f32(tokens.next()) else {
                return err("missing velocity");
            };
            let Some(max_torque) = parse_f32(tokens.next()) else {
                return err("missing max torque");
            };
            let Some(kp_scale) = parse_f32_or(tokens.next(), 1.0) else {
                return err("bad kp scale");
            };
            let Some(kd_scale) = parse_f32_or(tokens.next(), 1.0) else {
                return err("bad kd scale");
            };
            let Some(ff_torque) = parse_f32_or(tokens.next(), 0.0) else {
                return err("bad feedforward");
            };
            let Some(watchdog_s) = parse_f32_or(tokens.next(), 0.0) else {
                return err("bad watchdog");
            };
            registers.submit(ServoCommand::Mode(ModeRequest::Position(PositionCmd {
                position,
                velocity,
                max_torque,
                kp_scale,
                kd_scale,
                ff_torque,
                stop_position: f32::NAN,
                watchdog_s,
            })));
            ok(CliResponse::new())
        }
        Some("vel") => {
            let Some(velocity) = parse_f32(tokens.next()) else {
                return err("usage: d vel <vel> <max_t> [ff] [wd]");
            };
            let Some(max_torque) = parse_f32(tokens.next()) else {
                return err("missing max torque");
            };
            let Some(ff_torque) = parse_f32_or(tokens.next(), 0.0) else {
                return err("bad feedforward");
            };
            let Some(watchdog_s) = parse_f32_or(tokens.next(), 0.0) else {
                return err("bad watchdog");
            };
            registers.submit(ServoCommand::Mode(ModeRequest::Position(PositionCmd {
                position: f32::NAN,
                velocity,
                max_torque,
                ff_torque,
                watchdog_s,
                ..PositionCmd::default()
            })));
            ok(CliResponse::new())
        }
        Some("tq") => {
            let Some(torque) = parse_f32(tokens.next()) else {
                return err("usage: d tq <torque> [wd]");
            };
            let Some(watchdog_s) = parse_f32_or(tokens.next(), 0.0) else {
                return err("bad watchdog");
            };
            // Pure torque: feedforward only, no position or velocity gains.
            registers.submit(ServoCommand::Mode(ModeRequest::Position(PositionCmd {
                position: f32::NAN,
                kp_scale: 0.0,
                kd_scale: 0.0,
                ff_torque: torque,
                watchdog_s,
                ..PositionCmd::default()
            })));
            ok(CliResponse::new())
        }
        Some("dq") => {
            let Some(d) = parse_f32(tokens.next()) else {
                return err("usage: d dq <id> <iq>");
            };
            let Some(q) = parse_f32(tokens.next()) else {
                return err("missing iq");
            };
            registers.submit(ServoCommand::Mode(ModeRequest::Current { id: d, iq: q }));
            ok(CliResponse::new())
        }
        Some("within") => {
            let Some(lower) = parse_f32(tokens.next()) else {
                return err("usage: d within <lo> <hi> <max_t>");
            };
            let Some(upper) = parse_f32(tokens.next()) else {
                return err("missing upper bound");
            };
            let Some(max_torque) = parse_f32(tokens.next()) else {
                return err("missing max torque");
            };
            registers.submit(ServoCommand::Mode(ModeRequest::StayWithin(StayWithinCmd {
                lower,
                upper,
                max_torque,
                kp_scale: 1.0,
                kd_scale: 1.0,
                ff_torque: 0.0,
                watchdog_s: 0.0,
            })));
            ok(CliResponse::new())
        }
        Some("rezero") => {
            let Some(position) = parse_f32_or(tokens.next(), 0.0) else {
                return err("bad position");
            };
            registers.submit(ServoCommand::Rezero { position });
            ok(CliResponse::new())
        }
        Some("index") => {
            let Some(velocity) = parse_f32_or(tokens.next(), 0.1) else {
                return err("bad velocity");
            };
            registers.submit(ServoCommand::Mode(ModeRequest::Home(HomingCmd {
                velocity,
                max_torque: 0.5,
            })));
            ok(CliResponse::new())
        }
        Some("cal") => {
            let Some(voltage) = parse_f32_or(tokens.next(), 1.0) else {
                return err("bad voltage");
            };
            registers.submit(ServoCommand::Mode(ModeRequest::CalibrateEncoder {
                voltage,
            }));
            ok(CliResponse::new())
        }
        Some("ical") => {
            registers.submit(ServoCommand::Mode(ModeRequest::CalibrateCurrent));
            ok(CliResponse::new())
        }
        Some("ind") => {
            let Some(voltage) = parse_f32(tokens.next()) else {
                return err("usage: d ind <voltage> [period_cycles]");
            };
            let period_cycles = tokens
                .next()
                .and_then(|t| t.parse::<u32>().ok())
                .unwrap_or(8);
            registers.submit(ServoCommand::Mode(ModeRequest::MeasureInductance {
                voltage,
                period_cycles,
            }));
            ok(CliResponse::new())
        }
        _ => err("unknown d command"),
    }
}

fn process_tel<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    registers: &mut RegisterFile,
) -> CliResponse {
    match tokens.next() {
        Some("get") => {
            let Some(name) = tokens.next() else {
                return err("usage: tel get <name>");
            };
            let Some(def) = lookup_name(name) else {
                return err("unknown field");
            };
            match registers.read(def.address) {
                Ok(value) => {
                    let mut out = CliResponse::new();
                    let _ = write!(out, "{name} ");
                    format_value(&mut out, value);
                    let _ = out.push_str("\r\n");
                    ok(out)
                }
                Err(_) => err("not readable"),
            }
        }
        Some("list") => {
            let mut out = CliResponse::new();
            for def in super::registers::REGISTERS {
                let _ = write!(out, "{}\r\n", def.name);
            }
            ok(out)
        }
        _ => err("unknown tel command"),
    }
}

fn process_conf<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    registers: &mut RegisterFile,
) -> CliResponse {
    match tokens.next() {
        Some("get") => {
            let Some(name) = tokens.next() else {
                return err("usage: conf get <name>");
            };
            let Some(def) = lookup_name(name) else {
                return err("unknown field");
            };
            match registers.read(def.address) {
                Ok(value) => {
                    let mut out = CliResponse::new();
                    format_value(&mut out, value);
                    let _ = out.push_str("\r\n");
                    ok(out)
                }
                Err(_) => err("not readable"),
            }
        }
        Some("set") => {
            let Some(name) = tokens.next() else {
                return err("usage: conf set <name> <value>");
            };
            let Some(def) = lookup_name(name) else {
                return err("unknown field");
            };
            let Some(token) = tokens.next() else {
                return err("missing value");
            };
            // Integer-typed registers take integers; everything else f32.
            let value = match registers.read(def.address) {
                Ok(RegValue::U32(_)) => match token.parse::<u32>() {
                    Ok(v) => RegValue::U32(v),
                    Err(_) => return err("bad value"),
                },
                _ => match token.parse::<f32>() {
                    Ok(v) => RegValue::F32(v),
                    Err(_) => return err("bad value"),
                },
            };
            match registers.write(def.address, value) {
                Ok(()) => ok(CliResponse::new()),
                Err(_) => err("write failed"),
            }
        }
        Some("write") => {
            registers.persist_requested = true;
            ok(CliResponse::new())
        }
        Some("load") => {
            registers.load_requested = true;
            ok(CliResponse::new())
        }
        _ => err("unknown conf command"),
    }
}
