// Register server scenarios: bus frames and CLI lines against the same
// register file, with the command path verified down to the core.

#![cfg(test)]

use heapless::Vec;
use servo_firmware::firmware::comms::cli::process_line;
use servo_firmware::firmware::comms::protocol::{
    MAX_PAYLOAD, frame_flags, opcode, pad_to_dlc, process_frame,
};
use servo_firmware::firmware::comms::registers::{
    REG_CFG_MAX_TORQUE, REG_CMD_MAX_TORQUE, REG_FAULT, REG_MODE, RegValue, RegisterFile,
};
use servo_firmware::firmware::config::{
    PositionSourceConfig, ServoConfig, SourceKind, SourceReference,
};
use servo_firmware::firmware::control::modes::ModeRequest;
use servo_firmware::firmware::control::{ServoCommand, ServoCore};
use servo_firmware::firmware::encoder::SampleBuilder;
use servo_firmware::firmware::sampling::RawSamples;

fn test_config() -> ServoConfig {
    let mut config = ServoConfig::default();
    config.motor.phase_resistance_ohm = 0.08;
    config.motor.torque_constant_nm_per_a = 0.05;
    let mut onboard =
        PositionSourceConfig::new(SourceKind::OnboardSpi, 1 << 16, SourceReference::Rotor);
    onboard.primary = true;
    config.position.sources[0] = Some(onboard);
    config.enable_delay_cycles = 2;
    config
}

fn subframe_write_f32(payload: &mut Vec<u8, MAX_PAYLOAD>, address: u16, value: f32) {
    payload.push(opcode::WRITE_F32).unwrap();
    payload.push(1).unwrap();
    payload.extend_from_slice(&address.to_le_bytes()).unwrap();
    payload.extend_from_slice(&value.to_le_bytes()).unwrap();
}

fn subframe_read_f32(payload: &mut Vec<u8, MAX_PAYLOAD>, address: u16) {
    payload.push(opcode::READ_F32).unwrap();
    payload.push(1).unwrap();
    payload.extend_from_slice(&address.to_le_bytes()).unwrap();
}

#[test]
fn write_max_torque_then_read_back_verbatim() {
    let mut registers = RegisterFile::new(test_config());

    let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
    subframe_write_f32(&mut payload, REG_CMD_MAX_TORQUE, 0.5);
    subframe_read_f32(&mut payload, REG_CMD_MAX_TORQUE);
    pad_to_dlc(&mut payload);

    let result = process_frame(&payload, &mut registers);
    assert_eq!(result.flags & frame_flags::OVERFLOW, 0);
    let value = f32::from_le_bytes(result.reply[4..8].try_into().unwrap());
    assert_eq!(value, 0.5);
}

#[test]
fn max_torque_register_clamps_next_cycle() {
    let config = test_config();
    let mut registers = RegisterFile::new(config);
    let mut core = ServoCore::new(config);
    let mut builder = SampleBuilder::new();
    let raw = RawSamples {
        phase_a: 2048,
        phase_b: 2048,
        phase_c: 2048,
        vbus: 1800,
        fet_temp: 943,
        ..RawSamples::default()
    };

    let mut time_us = 0u64;
    let mut step = |core: &mut ServoCore, command: Option<ServoCommand>| {
        let sample = builder.fresh(0, 0);
        time_us += 33;
        core.cycle(&raw, &[Some(sample), None, None], false, false, time_us, 20, command)
    };
    step(&mut core, None);

    // Stage a far position target with a 0.1 Nm ceiling via bus frames,
    // then trigger position mode through the MODE register.
    let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
    subframe_write_f32(&mut payload, 0x020, 0.4); // cmd.position
    subframe_write_f32(&mut payload, REG_CMD_MAX_TORQUE, 0.1);
    payload.push(opcode::WRITE_I8).unwrap();
    payload.push(1).unwrap();
    payload.extend_from_slice(&REG_MODE.to_le_bytes()).unwrap();
    payload.push(6).unwrap();
    process_frame(&payload, &mut registers);

    let command = registers.take_pending();
    assert!(matches!(
        command,
        Some(ServoCommand::Mode(ModeRequest::Position(_)))
    ));
    step(&mut core, command);

    for _ in 0..100 {
        let (_, snapshot) = step(&mut core, None);
        assert!(snapshot.torque_nm.abs() <= 0.1 + 1e-6);
    }
    let (_, snapshot) = step(&mut core, None);
    // The ceiling is active: the huge position error saturates right at it.
    assert!((snapshot.torque_nm.abs() - 0.1).abs() < 1e-3);
}

#[test]
fn fault_register_reads_over_bus_and_cli() {
    let mut registers = RegisterFile::new(test_config());
    assert_eq!(registers.read(REG_FAULT).unwrap(), RegValue::I8(0));

    let out = process_line("tel get fault", &mut registers);
    assert_eq!(out.as_str(), "fault 0\r\nOK\r\n");
}

#[test]
fn cli_and_bus_share_configuration_state() {
    let mut registers = RegisterFile::new(test_config());

    // Set via bus frame, read via CLI.
    let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
    subframe_write_f32(&mut payload, REG_CFG_MAX_TORQUE, 2.25);
    process_frame(&payload, &mut registers);
    // Config writes emit a Config command; drop it for this check.
    let _ = registers.take_pending();

    let out = process_line("conf get limits.max_torque", &mut registers);
    assert_eq!(out.as_str(), "2.25\r\nOK\r\n");
}

#[test]
fn cli_velocity_command_reaches_the_core() {
    let config = test_config();
    let mut registers = RegisterFile::new(config);
    let mut core = ServoCore::new(config);
    let mut builder = SampleBuilder::new();
    let raw = RawSamples {
        phase_a: 2048,
        phase_b: 2048,
        phase_c: 2048,
        vbus: 1800,
        fet_temp: 943,
        ..RawSamples::default()
    };

    let mut time_us = 0;
    for i in 0..40u32 {
        let command = if i == 2 {
            let out = process_line("d vel 1.0 1.0", &mut registers);
            assert_eq!(out.as_str(), "OK\r\n");
            registers.take_pending()
        } else {
            None
        };
        let sample = builder.fresh(0, 0);
        time_us += 33;
        core.cycle(&raw, &[Some(sample), None, None], false, false, time_us, 20, command);
    }
    assert_eq!(core.mode_id(), 6, "velocity runs as position mode");
}
