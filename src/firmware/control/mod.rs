/// Control cycle core.
///
/// `ServoCore` is the whole per-cycle pipeline with the hardware factored
/// out: the control task hands it the latched ADC results, the cached
/// source samples and the pin states, and gets back what to do with the
/// inverter plus the finished telemetry snapshot. Keeping it free of
/// peripherals is what lets the scenario tests drive entire maneuvers.

pub mod foc;
pub mod limits;
pub mod modes;
pub mod outer;
pub mod torque;

use crate::firmware::config::{MAX_SOURCES, ServoConfig};
use crate::firmware::encoder::SourceSample;
use crate::firmware::error::FaultCode;
use crate::firmware::hardware::cordic::sin_cos_soft;
use crate::firmware::position::PositionAggregator;
use crate::firmware::safety::{SafetyInputs, SafetyManager};
use crate::firmware::sampling::{RawSamples, SamplePipeline};
use crate::firmware::telemetry::{ControlCycleSnapshot, CycleStats};
use foc::{CurrentLoop, FocInputs, FocOutputs, inverse_clarke, inverse_park};
use modes::{ControlRequest, CycleInputs, EntryState, ModeMachine, ModeRequest};

/// Commands the mailbox delivers into the cycle.
#[derive(Clone, Copy, Debug)]
pub enum ServoCommand {
    Mode(ModeRequest),
    /// Pin the output position (absolute reference now known).
    Rezero { position: f32 },
    /// Replace the configuration. Applied only outside closed-loop modes;
    /// mid-mode writes latch `ConfigChanged`.
    Config(ServoConfig),
}

/// What the inverter should do this period.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PwmCommand {
    /// Outputs off, pre-driver disabled.
    Disabled,
    /// Pre-driver enabled, PWM still off.
    EnableOnly,
    /// All three low sides on.
    BrakeLow,
    /// Commanded duties.
    Duties([f32; 3]),
}

pub struct ServoCore {
    config: ServoConfig,
    samples: SamplePipeline,
    position: PositionAggregator,
    safety: SafetyManager,
    machine: ModeMachine,
    current_loop: CurrentLoop,
    stats: CycleStats,
    /// Configuration written mid-mode, waiting for Stopped.
    pending_config: Option<ServoConfig>,
    /// Previous cycle's FOC outputs, for telemetry and inductance cal.
    last_foc: FocOutputs,
    cycle_budget_us: u16,
}

impl ServoCore {
    pub fn new(config: ServoConfig) -> Self {
        let dt = config.pwm.period_s();
        let budget_us = (0.9 * dt * 1e6) as u16;
        Self {
            samples: SamplePipeline::new(
                &config.supply,
                &config.thermal,
                config.calibration.current_offsets,
                dt,
            ),
            position: PositionAggregator::new(
                &config.position,
                config.calibration.commutation_offsets,
                config.motor.pole_pairs,
                dt,
            ),
            safety: SafetyManager::new(&config.supply, config.thermal),
            machine: ModeMachine::new(
                config.motor,
                &config.pwm,
                config.position_pid,
                config.limits,
                config.thermal,
                config.enable_delay_cycles,
                config.default_watchdog_ms as f32 / 1000.0,
                config.watchdog_stop_ms as f32 / 1000.0,
            ),
            current_loop: CurrentLoop::new(&config.current_pi, &config.pwm),
            stats: CycleStats::new(),
            pending_config: None,
            last_foc: FocOutputs::default(),
            cycle_budget_us: budget_us,
            config,
        }
    }

    pub fn config(&self) -> &ServoConfig {
        &self.config
    }

    pub fn fault(&self) -> FaultCode {
        self.safety.fault()
    }

    pub fn mode_id(&self) -> u8 {
        self.machine.mode().id()
    }

    pub fn mode_name(&self) -> &'static str {
        self.machine.mode().name()
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    /// One full control cycle.
    ///
    /// `command` is whatever the mailbox held at this cycle's consumption
    /// point; `cycle_time_us` is the measured duration of the previous
    /// cycle, judged against the PWM-period budget.
    pub fn cycle(
        &mut self,
        raw: &RawSamples,
        sources: &[Option<SourceSample>; MAX_SOURCES],
        index_seen: bool,
        driver_fault: bool,
        timestamp_us: u64,
        cycle_time_us: u16,
        command: Option<ServoCommand>,
    ) -> (PwmCommand, ControlCycleSnapshot) {
        // Sampling strictly precedes the position update.
        let samples = self.samples.convert(raw);
        self.position.update(sources, index_seen);
        let rotor = *self.position.state();

        // Command application point. Anything posted after this instant is
        // seen next cycle.
        if let Some(command) = command {
            self.apply_command(command, rotor.output_position);
        }

        // A pending configuration lands as soon as the controller idles.
        if matches!(
            self.machine.mode(),
            modes::Mode::Stopped | modes::Mode::Fault(_)
        ) {
            if let Some(config) = self.pending_config.take() {
                self.reconfigure(config);
            }
        }

        // Safety checks, in priority order.
        self.stats.record(cycle_time_us);
        let safety_inputs = SafetyInputs {
            driver_fault,
            vbus: samples.vbus,
            fet_temp_c: samples.fet_temp_c,
            motor_temp_c: samples.motor_temp_c,
            theta_required: self.machine.theta_required(),
            rotor_valid: rotor.valid,
            rotor_fault: rotor.fault_reason,
            cycle_overrun: cycle_time_us > self.cycle_budget_us,
        };
        if let Some(code) = self.safety.check(&safety_inputs) {
            self.machine.force_fault(code);
        }

        // The mode machine selects the controller and produces the
        // current references.
        let cycle_inputs = CycleInputs {
            rotor_valid: rotor.valid,
            homed: rotor.homed,
            mech_theta: rotor.mechanical_theta_wrapped,
            output_position: rotor.output_position,
            output_velocity: rotor.output_velocity,
            electrical_omega: rotor.electrical_omega,
            vbus: samples.vbus,
            fet_temp_c: samples.fet_temp_c,
            motor_temp_c: samples.motor_temp_c,
            driver_fault,
            id_measured: self.last_foc.id,
            raw: *raw,
        };
        let request = self.machine.update(&cycle_inputs);
        self.harvest_calibration();

        // Run the current loop or the open-loop voltage paths.
        let (sin, cos) = sin_cos_soft(rotor.electrical_theta);
        let (sin, cos) = (sin.to_num::<f32>(), cos.to_num::<f32>());
        let mut foc_out = FocOutputs::default();
        let mut id_ref = 0.0;
        let mut iq_ref = 0.0;

        let pwm = match request {
            ControlRequest::HiZ => {
                self.current_loop.reset();
                PwmCommand::Disabled
            }
            ControlRequest::Enabling => {
                self.current_loop.reset();
                PwmCommand::EnableOnly
            }
            ControlRequest::BrakeLowSides => {
                self.current_loop.reset();
                PwmCommand::BrakeLow
            }
            ControlRequest::Current {
                id_ref: id,
                iq_ref: iq,
            } => {
                id_ref = id;
                iq_ref = iq;
                let inputs = FocInputs {
                    currents: samples.currents,
                    vbus: samples.vbus,
                    sin,
                    cos,
                    id_ref,
                    iq_ref,
                };
                foc_out = self.current_loop.update(&inputs);
                PwmCommand::Duties(foc_out.duties)
            }
            ControlRequest::PhaseVoltage { va, vb, vc } => {
                self.current_loop.reset();
                let duties = self.current_loop.modulate(va, vb, vc, samples.vbus);
                foc_out.duties = duties;
                PwmCommand::Duties(duties)
            }
            ControlRequest::VoltageDq {
                vd,
                vq,
                use_measured_theta,
                theta,
            } => {
                self.current_loop.reset();
                let (s, c) = if use_measured_theta {
                    (sin, cos)
                } else {
                    let (s, c) = sin_cos_soft(theta);
                    (s.to_num::<f32>(), c.to_num::<f32>())
                };
                let (v_alpha, v_beta) = inverse_park(vd, vq, s, c);
                let (va, vb, vc) = inverse_clarke(v_alpha, v_beta);
                let duties = self.current_loop.modulate(va, vb, vc, samples.vbus);
                foc_out.vd = vd;
                foc_out.vq = vq;
                foc_out.duties = duties;
                PwmCommand::Duties(duties)
            }
        };
        self.last_foc = foc_out;

        let snapshot = ControlCycleSnapshot {
            timestamp_us,
            mode: self.machine.mode().id(),
            fault: self.safety.fault(),
            currents: samples.currents,
            vbus: samples.vbus,
            fet_temp_c: samples.fet_temp_c,
            motor_temp_c: samples.motor_temp_c.unwrap_or(f32::NAN),
            electrical_theta: rotor.electrical_theta,
            id: foc_out.id,
            iq: foc_out.iq,
            id_ref,
            iq_ref,
            vd: foc_out.vd,
            vq: foc_out.vq,
            duties: match pwm {
                PwmCommand::Duties(d) => d,
                _ => [0.0; 3],
            },
            position: rotor.output_position,
            velocity: rotor.output_velocity,
            torque_nm: self.machine.commanded_torque(),
            cycle_time_us,
        };

        (pwm, snapshot)
    }

    fn apply_command(&mut self, command: ServoCommand, measured_position: f32) {
        match command {
            ServoCommand::Mode(request) => {
                if matches!(request, ModeRequest::Stop) {
                    // Stop clears the latch; a persisting condition
                    // re-latches on the very next check.
                    self.safety.clear();
                }
                let entry = EntryState {
                    config_dirty: self.pending_config.is_some(),
                    motor_configured: self.config.motor.is_configured(),
                    supply_fault: self.safety.supply_fault(),
                    theta_valid: self.position.state().valid,
                    measured_position,
                };
                if let Err(code) = self.machine.request(request, &entry) {
                    self.safety.force(code);
                    self.machine.force_fault(code);
                }
            }
            ServoCommand::Rezero { position } => {
                self.position.rezero(position);
            }
            ServoCommand::Config(config) => {
                if matches!(
                    self.machine.mode(),
                    modes::Mode::Stopped | modes::Mode::Fault(_)
                ) {
                    self.reconfigure(config);
                } else {
                    // Mid-flight retune is refused loudly.
                    self.pending_config = Some(config);
                    self.safety.force(FaultCode::ConfigChanged);
                    self.machine.force_fault(FaultCode::ConfigChanged);
                }
            }
        }
    }

    /// Results of a finished calibration sequence land in the active
    /// configuration immediately; persisting them is the host's call.
    fn harvest_calibration(&mut self) {
        let cal = self.machine.take_calibration();
        if let Some(offsets) = cal.current_offsets {
            self.config.calibration.current_offsets = offsets;
            self.config.calibration.valid = true;
            self.samples.set_offsets(offsets);
        }
        if let Some(table) = cal.commutation_offsets {
            self.config.calibration.commutation_offsets = table;
            self.config.calibration.valid = true;
            let dt = self.config.pwm.period_s();
            self.position = PositionAggregator::new(
                &self.config.position,
                table,
                self.config.motor.pole_pairs,
                dt,
            );
        }
        if let Some(inductance) = cal.inductance_h {
            self.config.motor.phase_inductance_h = inductance;
        }
    }

    /// Rebuild every sub-component around a new configuration.
    fn reconfigure(&mut self, config: ServoConfig) {
        defmt::info!("configuration applied");
        let fault = self.safety.fault();
        *self = Self::new(config);
        // A latched fault survives reconfiguration.
        if fault.is_latching() {
            self.safety.force(fault);
            self.machine.force_fault(fault);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::config::{PositionSourceConfig, SourceKind, SourceReference};
    use crate::firmware::control::modes::PositionCmd;
    use crate::firmware::encoder::SampleBuilder;

    const CPR: u32 = 1 << 14;

    fn test_config() -> ServoConfig {
        let mut config = ServoConfig::default();
        config.motor.phase_resistance_ohm = 0.08;
        config.motor.torque_constant_nm_per_a = 0.05;
        config.motor.phase_inductance_h = 60e-6;
        let mut source =
            PositionSourceConfig::new(SourceKind::OnboardSpi, CPR, SourceReference::Rotor);
        source.primary = true;
        config.position.sources[0] = Some(source);
        config.enable_delay_cycles = 2;
        config
    }

    fn quiet_raw() -> RawSamples {
        RawSamples {
            phase_a: 2048,
            phase_b: 2048,
            phase_c: 2048,
            vbus: 1800, // ~24 V at the default divider scale
            fet_temp: 943,
            ..RawSamples::default()
        }
    }

    struct Bench {
        core: ServoCore,
        builder: SampleBuilder,
        counts: u32,
        time_us: u64,
    }

    impl Bench {
        fn new() -> Self {
            Self {
                core: ServoCore::new(test_config()),
                builder: SampleBuilder::new(),
                counts: 0,
                time_us: 0,
            }
        }

        fn step(&mut self, command: Option<ServoCommand>) -> (PwmCommand, ControlCycleSnapshot) {
            let sample = self.builder.fresh(self.counts, 0);
            self.time_us += 33;
            self.core.cycle(
                &quiet_raw(),
                &[Some(sample), None, None],
                false,
                false,
                self.time_us,
                20,
                command,
            )
        }
    }

    #[test]
    fn stopped_core_stays_disabled() {
        let mut bench = Bench::new();
        let (pwm, snap) = bench.step(None);
        assert_eq!(pwm, PwmCommand::Disabled);
        assert_eq!(snap.mode, 0);
        assert_eq!(snap.fault, FaultCode::Success);
    }

    #[test]
    fn position_entry_reaches_closed_loop() {
        let mut bench = Bench::new();
        bench.step(None);
        let cmd = ServoCommand::Mode(ModeRequest::Position(PositionCmd {
            position: 0.0,
            max_torque: 1.0,
            ..PositionCmd::default()
        }));
        bench.step(Some(cmd));
        let mut last = None;
        for _ in 0..20 {
            last = Some(bench.step(None));
        }
        let (pwm, snap) = last.unwrap();
        assert!(matches!(pwm, PwmCommand::Duties(_)));
        assert_eq!(snap.mode, 6);
    }

    #[test]
    fn config_write_mid_mode_faults() {
        let mut bench = Bench::new();
        bench.step(None);
        bench.step(Some(ServoCommand::Mode(ModeRequest::Position(PositionCmd {
            position: 0.0,
            max_torque: 1.0,
            ..PositionCmd::default()
        }))));
        for _ in 0..10 {
            bench.step(None);
        }
        bench.step(Some(ServoCommand::Config(test_config())));
        let (pwm, snap) = bench.step(None);
        assert_eq!(snap.fault, FaultCode::ConfigChanged);
        assert_eq!(pwm, PwmCommand::Disabled);
        assert_eq!(snap.mode, 1);
    }

    #[test]
    fn stop_clears_fault_when_condition_gone() {
        let mut bench = Bench::new();
        bench.step(None);
        // Driver fault asserted for one cycle, then released.
        let sample = bench.builder.fresh(0, 0);
        bench
            .core
            .cycle(&quiet_raw(), &[Some(sample), None, None], false, true, 1, 20, None);
        assert_eq!(bench.core.fault(), FaultCode::MotorDriverFault);

        bench.step(Some(ServoCommand::Mode(ModeRequest::Stop)));
        let (_, snap) = bench.step(None);
        assert_eq!(snap.fault, FaultCode::Success);
        assert_eq!(snap.mode, 0);
    }

    #[test]
    fn rezero_moves_reported_position() {
        let mut bench = Bench::new();
        bench.step(None);
        bench.step(Some(ServoCommand::Rezero { position: 3.25 }));
        let (_, snap) = bench.step(None);
        assert!((snap.position - 3.25).abs() < 0.01);
    }

    #[test]
    fn overrun_cycle_latches_fault() {
        let mut bench = Bench::new();
        bench.step(None);
        let sample = bench.builder.fresh(1, 0);
        // 30 us budget at 30 kHz; report a 40 us cycle.
        let (_, snap) = bench.core.cycle(
            &quiet_raw(),
            &[Some(sample), None, None],
            false,
            false,
            1,
            40,
            None,
        );
        assert_eq!(snap.fault, FaultCode::PwmCycleOverrun);
    }

    #[test]
    fn duties_zero_in_snapshot_when_disabled() {
        let mut bench = Bench::new();
        let (_, snap) = bench.step(None);
        assert_eq!(snap.duties, [0.0; 3]);
    }
}
