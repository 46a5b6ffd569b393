// End-to-end control scenarios against the pure-logic core.
//
// A tiny rigid-body plant closes the loop: the commanded torque from each
// cycle's snapshot accelerates an inertia, and the resulting angle feeds
// back through a simulated absolute encoder. No peripherals involved.

#![cfg(test)]

use servo_firmware::firmware::comms::cli::process_line;
use servo_firmware::firmware::comms::registers::RegisterFile;
use servo_firmware::firmware::config::{
    PositionSourceConfig, ServoConfig, SourceKind, SourceReference,
};
use servo_firmware::firmware::control::modes::ModeRequest;
use servo_firmware::firmware::control::{PwmCommand, ServoCommand, ServoCore};
use servo_firmware::firmware::encoder::{SampleBuilder, SourceSample};
use servo_firmware::firmware::error::FaultCode;
use servo_firmware::firmware::sampling::RawSamples;

const CPR: u32 = 1 << 16;
const PWM_HZ: f32 = 30_000.0;
const DT: f32 = 1.0 / PWM_HZ;

fn test_config() -> ServoConfig {
    let mut config = ServoConfig::default();
    config.motor.phase_resistance_ohm = 0.08;
    config.motor.phase_inductance_h = 60e-6;
    config.motor.torque_constant_nm_per_a = 0.05;
    let mut onboard =
        PositionSourceConfig::new(SourceKind::OnboardSpi, CPR, SourceReference::Rotor);
    onboard.primary = true;
    config.position.sources[0] = Some(onboard);
    config.enable_delay_cycles = 4;
    config
}

/// Rigid body on the output shaft plus the encoder that watches it.
struct Rig {
    core: ServoCore,
    registers: RegisterFile,
    builder: SampleBuilder,
    /// Output position in turns.
    position: f32,
    /// Output velocity in turns/s.
    velocity: f32,
    /// Rotor plus load inertia, kg m^2.
    inertia: f32,
    time_us: u64,
    /// When false, the encoder reports inactive (disconnected).
    encoder_ok: bool,
    driver_fault: bool,
    last_pwm: PwmCommand,
}

impl Rig {
    fn new() -> Self {
        let config = test_config();
        Self {
            core: ServoCore::new(config),
            registers: RegisterFile::new(config),
            builder: SampleBuilder::new(),
            position: 0.0,
            velocity: 0.0,
            inertia: 1e-4,
            time_us: 0,
            encoder_ok: true,
            driver_fault: false,
            last_pwm: PwmCommand::Disabled,
        }
    }

    fn command(&mut self, line: &str) {
        let response = process_line(line, &mut self.registers);
        assert!(response.ends_with("OK\r\n"), "{line}: {response}");
    }

    fn step(&mut self) {
        let command = self.registers.take_pending();
        self.step_with(command);
    }

    fn step_with(&mut self, command: Option<ServoCommand>) {
        let counts = ((self.position - libm::floorf(self.position)) * CPR as f32) as u32 % CPR;
        let sample = if self.encoder_ok {
            self.builder.fresh(counts, 0)
        } else {
            self.builder.inactive()
        };
        let raw = RawSamples {
            phase_a: 2048,
            phase_b: 2048,
            phase_c: 2048,
            vbus: 1800, // about 24 V through the default divider
            fet_temp: 943,
            ..RawSamples::default()
        };
        self.time_us += 33;
        let (pwm, snapshot) = self.core.cycle(
            &raw,
            &[Some(sample), None, None],
            false,
            self.driver_fault,
            self.time_us,
            20,
            command,
        );
        self.last_pwm = pwm;
        self.registers.update_snapshot(snapshot, 0);

        // Plant: commanded torque spins the inertia.
        let torque = if matches!(pwm, PwmCommand::Duties(_)) {
            snapshot.torque_nm
        } else {
            0.0
        };
        self.velocity += torque / self.inertia * DT / core::f32::consts::TAU;
        self.position += self.velocity * DT;
    }

    fn run_ms(&mut self, ms: u32) {
        for _ in 0..(ms as f32 / 1000.0 * PWM_HZ) as u32 {
            self.step();
        }
    }

    /// Run cycles with a fixed raw bus-voltage reading, optionally
    /// delivering one command on the first cycle.
    fn run_at_vbus(&mut self, vbus_counts: u16, cycles: u32, command: Option<ServoCommand>) {
        let mut command = command;
        for _ in 0..cycles {
            let counts =
                ((self.position - libm::floorf(self.position)) * CPR as f32) as u32 % CPR;
            let sample = self.builder.fresh(counts, 0);
            let raw = RawSamples {
                phase_a: 2048,
                phase_b: 2048,
                phase_c: 2048,
                vbus: vbus_counts,
                fet_temp: 943,
                ..RawSamples::default()
            };
            self.time_us += 33;
            let (pwm, snapshot) = self.core.cycle(
                &raw,
                &[Some(sample), None, None],
                false,
                false,
                self.time_us,
                20,
                command.take(),
            );
            self.last_pwm = pwm;
            self.registers.update_snapshot(snapshot, 0);
        }
    }

    fn mode(&self) -> u8 {
        self.core.mode_id()
    }

    fn fault(&self) -> FaultCode {
        self.core.fault()
    }
}

#[test]
fn cold_start_position_hold() {
    let mut rig = Rig::new();
    rig.run_ms(2);
    rig.command("d pos 0 0 1");
    rig.run_ms(10);

    // Within 10 ms: position mode, holding near zero with no fault.
    assert_eq!(rig.mode(), 6, "mode should be position");
    assert_eq!(rig.fault(), FaultCode::Success);
    assert!(rig.position.abs() < 0.001, "position {}", rig.position);
    let iq = rig.registers.snapshot().iq_ref;
    assert!(iq.abs() < 0.5, "idle holding current {iq}");
}

#[test]
fn velocity_step_settles_within_100ms() {
    let mut rig = Rig::new();
    rig.run_ms(2);
    rig.command("d vel 1.0 1.0");
    rig.run_ms(100);

    assert_eq!(rig.fault(), FaultCode::Success);
    assert!(
        (rig.velocity - 1.0).abs() < 0.05,
        "velocity {}",
        rig.velocity
    );
    // No field weakening configured: d-axis reference stays zero.
    assert_eq!(rig.registers.snapshot().id_ref, 0.0);
}

#[test]
fn driver_fault_drops_the_inverter_immediately() {
    let mut rig = Rig::new();
    rig.run_ms(2);
    rig.command("d pos 0 0 1");
    rig.run_ms(10);
    assert!(matches!(rig.last_pwm, PwmCommand::Duties(_)));

    rig.driver_fault = true;
    rig.step();

    // Same control period: outputs off, fault latched.
    assert_eq!(rig.last_pwm, PwmCommand::Disabled);
    assert_eq!(rig.fault(), FaultCode::MotorDriverFault);

    // A new motion command does not clear it.
    rig.driver_fault = false;
    rig.command("d pos 0 0 1");
    rig.run_ms(2);
    assert_eq!(rig.mode(), 1, "still faulted");

    // Only stop does.
    rig.command("d stop");
    rig.run_ms(2);
    assert_eq!(rig.fault(), FaultCode::Success);
    assert_eq!(rig.mode(), 0);
}

#[test]
fn encoder_disconnection_faults_within_a_few_cycles() {
    let mut rig = Rig::new();
    rig.run_ms(2);
    rig.command("d pos 0 0 1");
    rig.run_ms(10);
    assert_eq!(rig.mode(), 6);

    rig.encoder_ok = false;
    for _ in 0..3 {
        rig.step();
    }

    assert_eq!(rig.fault(), FaultCode::EncoderFault);
    assert_eq!(rig.mode(), 1);
    assert_eq!(rig.last_pwm, PwmCommand::Disabled);
}

#[test]
fn stalled_nonce_faults_after_stall_limit() {
    let mut rig = Rig::new();
    rig.run_ms(2);
    rig.command("d pos 0 0 1");
    rig.run_ms(10);

    // Device still answers but the value never refreshes.
    let stall_limit = rig.core.config().position.nonce_stall_cycles as u32;
    let stale: SourceSample = rig.builder.stale();
    for _ in 0..=stall_limit {
        let raw = RawSamples {
            phase_a: 2048,
            phase_b: 2048,
            phase_c: 2048,
            vbus: 1800,
            fet_temp: 943,
            ..RawSamples::default()
        };
        rig.time_us += 33;
        let (pwm, snapshot) =
            rig.core
                .cycle(&raw, &[Some(stale), None, None], false, false, rig.time_us, 20, None);
        rig.last_pwm = pwm;
        rig.registers.update_snapshot(snapshot, 0);
    }

    assert_eq!(rig.fault(), FaultCode::EncoderFault);
}

#[test]
fn watchdog_demotes_then_stops() {
    let mut rig = Rig::new();
    rig.run_ms(2);
    rig.command("d pos 0 0 1 1 1 0 0.2");
    rig.run_ms(10);
    assert_eq!(rig.mode(), 6);

    // 200 ms of silence: standstill regulator.
    rig.run_ms(200);
    assert_eq!(rig.mode(), 8, "position_timeout after watchdog expiry");

    // By one second total the controller has given up and stopped.
    rig.run_ms(800);
    assert_eq!(rig.mode(), 0);
    assert_eq!(rig.last_pwm, PwmCommand::Disabled);
}

#[test]
fn commanded_torque_respects_max_torque_register() {
    let mut rig = Rig::new();
    rig.run_ms(2);
    // Large position error, tiny torque ceiling.
    rig.command("d pos 0.4 0 0.05");
    for _ in 0..3000 {
        rig.step();
        assert!(
            rig.registers.snapshot().torque_nm.abs() <= 0.05 + 1e-6,
            "torque exceeded ceiling"
        );
    }
}

#[test]
fn brake_command_shorts_low_sides() {
    let mut rig = Rig::new();
    rig.run_ms(2);
    rig.command("d brake");
    rig.run_ms(2);
    assert_eq!(rig.mode(), 14);
    assert_eq!(rig.last_pwm, PwmCommand::BrakeLow);
}

#[test]
fn rezero_shifts_reported_position() {
    let mut rig = Rig::new();
    rig.run_ms(2);
    rig.command("d rezero 5.0");
    rig.run_ms(2);
    assert!((rig.registers.snapshot().position - 5.0).abs() < 0.01);
}

#[test]
fn undervoltage_latches_once_without_flapping() {
    let mut rig = Rig::new();
    rig.run_ms(2);
    rig.command("d pos 0 0 1");
    rig.run_ms(10);

    // Drop the bus just under v_min (10 V) and let the filter settle.
    let low_counts = (9.9 / rig.core.config().supply.vsense_adc_scale) as u16;
    rig.run_at_vbus(low_counts, 6000, None);
    assert_eq!(rig.fault(), FaultCode::UnderVoltage);

    // Recover to just inside the 0.2 V hysteresis band: stop cannot clear
    // the fault because the condition immediately re-latches.
    let inside_counts = (10.1 / rig.core.config().supply.vsense_adc_scale) as u16;
    rig.run_at_vbus(inside_counts, 6000, None);
    rig.run_at_vbus(inside_counts, 1, Some(ServoCommand::Mode(ModeRequest::Stop)));
    rig.run_at_vbus(inside_counts, 1, None);
    assert_eq!(rig.fault(), FaultCode::UnderVoltage, "hysteresis holds");

    // Past the band it clears for good.
    let good_counts = (10.5 / rig.core.config().supply.vsense_adc_scale) as u16;
    rig.run_at_vbus(good_counts, 6000, None);
    rig.run_at_vbus(good_counts, 1, Some(ServoCommand::Mode(ModeRequest::Stop)));
    rig.run_at_vbus(good_counts, 10, None);
    assert_eq!(rig.fault(), FaultCode::Success);
}
