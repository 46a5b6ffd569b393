/// Mode state machine and controller selection.
///
/// The mode is a tagged enum; each variant carries only the fields its
/// controller needs and the cycle dispatches on it exactly once. The
/// machine owns the outer loop, the torque limiter and the torque model;
/// FOC itself stays outside and consumes the returned request.

use crate::firmware::config::{
    COMMUTATION_BINS, LimitsConfig, MotorConfig, PwmConfig, PositionPidConfig, K_SVM,
    ThermalConfig,
};
use crate::firmware::control::limits::{LimitContext, TorqueLimiter};
use crate::firmware::control::outer::{OuterCommand, OuterLoop, field_weakening_id, flux_linkage};
use crate::firmware::control::torque::TorqueModel;
use crate::firmware::error::FaultCode;
use crate::firmware::position::Homed;
use crate::firmware::position::pll::{wrap_delta, wrap_turns};
use crate::firmware::sampling::{OffsetCalibrator, RawSamples};

/// Electrical sweep rate of the encoder calibration, revolutions/s.
const ENCODER_CAL_SPEED: f32 = 2.0;
/// Cycles the bridge idles at 50 % duty before offsets are averaged.
const CURRENT_CAL_SETTLE_CYCLES: u32 = 512;
/// Samples averaged for the current offsets.
const CURRENT_CAL_SAMPLES: u32 = 1024;
/// Half-period toggles used by the inductance measurement.
const INDUCTANCE_TOGGLES: u32 = 32;
/// Homing gives up after this long without an index pulse.
const HOMING_TIMEOUT_S: f32 = 20.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PositionCmd {
    /// Turns; NaN runs velocity-only.
    pub position: f32,
    /// Turns/s.
    pub velocity: f32,
    pub max_torque: f32,
    pub kp_scale: f32,
    pub kd_scale: f32,
    pub ff_torque: f32,
    /// Velocity mode stops and holds here; NaN disables.
    pub stop_position: f32,
    /// Seconds; 0 disables the watchdog.
    pub watchdog_s: f32,
}

impl Default for PositionCmd {
    fn default() -> Self {
        Self {
            position: f32::NAN,
            velocity: 0.0,
            max_torque: f32::MAX,
            kp_scale: 1.0,
            kd_scale: 1.0,
            ff_torque: 0.0,
            stop_position: f32::NAN,
            watchdog_s: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StayWithinCmd {
    pub lower: f32,
    pub upper: f32,
    pub max_torque: f32,
    pub kp_scale: f32,
    pub kd_scale: f32,
    pub ff_torque: f32,
    pub watchdog_s: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HomingCmd {
    /// Search velocity in turns/s, signed.
    pub velocity: f32,
    pub max_torque: f32,
}

/// Requests arriving from the command server.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ModeRequest {
    Stop,
    Brake,
    ZeroVelocity,
    Position(PositionCmd),
    Current { id: f32, iq: f32 },
    Voltage { phase: [f32; 3] },
    VoltageFoc { theta: f32, voltage: f32 },
    VoltageDq { d: f32, q: f32 },
    StayWithin(StayWithinCmd),
    MeasureInductance { voltage: f32, period_cycles: u32 },
    CalibrateCurrent,
    CalibrateEncoder { voltage: f32 },
    Home(HomingCmd),
}

impl ModeRequest {
    /// Whether the requested controller depends on a valid rotor angle.
    fn needs_theta(&self) -> bool {
        !matches!(
            self,
            Self::Stop
                | Self::Brake
                | Self::Voltage { .. }
                | Self::VoltageFoc { .. }
                | Self::CalibrateCurrent
                | Self::CalibrateEncoder { .. }
                | Self::MeasureInductance { .. }
        )
    }

    /// Whether it drives current and therefore needs motor parameters.
    fn needs_motor(&self) -> bool {
        matches!(
            self,
            Self::ZeroVelocity
                | Self::Position(_)
                | Self::Current { .. }
                | Self::StayWithin(_)
                | Self::Home(_)
        )
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CurrentCalState {
    settle_left: u32,
    calibrator: OffsetCalibrator,
}

#[derive(Clone, Copy, Debug)]
pub struct EncoderCalState {
    voltage: f32,
    /// Applied electrical angle, unwrapped turns.
    pub applied_e_turns: f32,
    /// One mechanical revolution worth of electrical turns.
    target_e_turns: f32,
    sums: [f32; COMMUTATION_BINS],
    counts: [u16; COMMUTATION_BINS],
}

#[derive(Clone, Copy, Debug)]
pub struct InductanceState {
    voltage: f32,
    period_cycles: u32,
    cycles_in_half: u32,
    sign: f32,
    id_at_toggle: f32,
    delta_sum: f32,
    toggles: u32,
}

/// The ~18 controller states.
#[derive(Clone, Copy, Debug)]
pub enum Mode {
    Stopped,
    Fault(FaultCode),
    Enabling {
        cycles_left: u32,
        request: ModeRequest,
    },
    CalibratingCurrent(CurrentCalState),
    CalibratingEncoder(EncoderCalState),
    /// Entered Position before the angle was valid; waits for it.
    PositionWait(PositionCmd),
    Position(PositionCmd),
    /// Velocity move finished; holding the stop position.
    PositionHold(PositionCmd),
    /// Command watchdog expired: standstill regulator, then Stopped.
    PositionTimeout { elapsed_s: f32 },
    ZeroVelocity,
    Voltage { phase: [f32; 3] },
    VoltageFoc { theta: f32, voltage: f32 },
    VoltageDq { d: f32, q: f32 },
    Current { id: f32, iq: f32 },
    Brake,
    MeasureInductance(InductanceState),
    StayWithin(StayWithinCmd),
    Homing { cmd: HomingCmd, elapsed_s: f32 },
}

impl Mode {
    /// Stable numeric id, exposed through the mode register.
    pub const fn id(&self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Fault(_) => 1,
            Self::Enabling { .. } => 2,
            Self::CalibratingCurrent(_) => 3,
            Self::CalibratingEncoder(_) => 4,
            Self::PositionWait(_) => 5,
            Self::Position(_) => 6,
            Self::PositionHold(_) => 7,
            Self::PositionTimeout { .. } => 8,
            Self::ZeroVelocity => 9,
            Self::Voltage { .. } => 10,
            Self::VoltageFoc { .. } => 11,
            Self::VoltageDq { .. } => 12,
            Self::Current { .. } => 13,
            Self::Brake => 14,
            Self::MeasureInductance(_) => 15,
            Self::StayWithin(_) => 16,
            Self::Homing { .. } => 17,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Fault(_) => "fault",
            Self::Enabling { .. } => "enabling",
            Self::CalibratingCurrent(_) => "cal_current",
            Self::CalibratingEncoder(_) => "cal_encoder",
            Self::PositionWait(_) => "position_wait",
            Self::Position(_) => "position",
            Self::PositionHold(_) => "position_hold",
            Self::PositionTimeout { .. } => "position_timeout",
            Self::ZeroVelocity => "zero_velocity",
            Self::Voltage { .. } => "voltage",
            Self::VoltageFoc { .. } => "voltage_foc",
            Self::VoltageDq { .. } => "voltage_dq",
            Self::Current { .. } => "current",
            Self::Brake => "brake",
            Self::MeasureInductance(_) => "measure_inductance",
            Self::StayWithin(_) => "stay_within",
            Self::Homing { .. } => "homing",
        }
    }
}

/// What the rest of the cycle should do with the inverter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControlRequest {
    /// PWM off, outputs high impedance.
    HiZ,
    /// PWM off, pre-driver enable asserted (settling).
    Enabling,
    /// Short all three low sides.
    BrakeLowSides,
    /// Closed current loop on (id_ref, iq_ref).
    Current { id_ref: f32, iq_ref: f32 },
    /// Open-loop phase voltages.
    PhaseVoltage { va: f32, vb: f32, vc: f32 },
    /// d/q voltages at either the measured or a commanded angle.
    VoltageDq {
        vd: f32,
        vq: f32,
        use_measured_theta: bool,
        theta: f32,
    },
}

/// Snapshot of everything a mode entry decision looks at.
#[derive(Clone, Copy, Debug)]
pub struct EntryState {
    pub config_dirty: bool,
    pub motor_configured: bool,
    pub supply_fault: Option<FaultCode>,
    pub theta_valid: bool,
    pub measured_position: f32,
}

/// Per-cycle measurements feeding the dispatch.
#[derive(Clone, Copy, Debug, Default)]
pub struct CycleInputs {
    pub rotor_valid: bool,
    pub homed: Homed,
    pub mech_theta: f32,
    pub output_position: f32,
    pub output_velocity: f32,
    /// Rotor electrical rate in rad/s.
    pub electrical_omega: f32,
    pub vbus: f32,
    pub fet_temp_c: f32,
    pub motor_temp_c: Option<f32>,
    /// Pre-driver fault line, sampled this cycle.
    pub driver_fault: bool,
    /// Measured Id from the previous cycle's FOC pass.
    pub id_measured: f32,
    pub raw: RawSamples,
}

/// Calibration results the pipeline harvests after a sequence finishes.
#[derive(Clone, Copy, Debug, Default)]
pub struct CalibrationOutput {
    pub current_offsets: Option<[f32; 3]>,
    pub commutation_offsets: Option<[f32; COMMUTATION_BINS]>,
    pub inductance_h: Option<f32>,
}

pub struct ModeMachine {
    mode: Mode,
    outer: OuterLoop,
    limiter: TorqueLimiter,
    torque_model: TorqueModel,
    motor: MotorConfig,
    limits: LimitsConfig,
    dt: f32,
    enable_delay_cycles: u32,
    default_watchdog_s: f32,
    watchdog_stop_s: f32,
    /// Seconds since the last command touched the active mode.
    command_age_s: f32,
    /// Watchdog for the active command; 0 disables.
    watchdog_s: f32,
    /// Last limited torque, for telemetry and the command-clamp invariant.
    commanded_torque: f32,
    calibration_output: CalibrationOutput,
}

impl ModeMachine {
    pub fn new(
        motor: MotorConfig,
        pwm: &PwmConfig,
        pid: PositionPidConfig,
        limits: LimitsConfig,
        thermal: ThermalConfig,
        enable_delay_cycles: u32,
        default_watchdog_s: f32,
        watchdog_stop_s: f32,
    ) -> Self {
        let dt = pwm.period_s();
        Self {
            mode: Mode::Stopped,
            outer: OuterLoop::new(pid, dt),
            limiter: TorqueLimiter::new(limits, thermal, motor),
            torque_model: TorqueModel::new(&motor),
            motor,
            limits,
            dt,
            enable_delay_cycles,
            default_watchdog_s,
            watchdog_stop_s,
            command_age_s: 0.0,
            watchdog_s: 0.0,
            commanded_torque: 0.0,
            calibration_output: CalibrationOutput::default(),
        }
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Whether the active controller depends on a valid rotor angle right
    /// now. PositionWait is excluded: it exists to wait for validity.
    pub fn theta_required(&self) -> bool {
        matches!(
            self.mode,
            Mode::Position(_)
                | Mode::PositionHold(_)
                | Mode::PositionTimeout { .. }
                | Mode::ZeroVelocity
                | Mode::Current { .. }
                | Mode::VoltageDq { .. }
                | Mode::StayWithin(_)
                | Mode::Homing { .. }
        )
    }

    pub fn commanded_torque(&self) -> f32 {
        self.commanded_torque
    }

    /// Harvest finished calibration results (cleared on read).
    pub fn take_calibration(&mut self) -> CalibrationOutput {
        core::mem::take(&mut self.calibration_output)
    }

    /// Fault entry: called by the safety manager when a code latches.
    pub fn force_fault(&mut self, code: FaultCode) {
        if !matches!(self.mode, Mode::Fault(_)) {
            defmt::warn!("mode -> fault: {}", code);
            self.mode = Mode::Fault(code);
        }
    }

    /// Handle a mode request from the command server.
    ///
    /// Returns the fault code that should latch when entry is refused for
    /// a reason that is itself a fault (start-outside-limit, config dirty).
    pub fn request(&mut self, request: ModeRequest, entry: &EntryState) -> Result<(), FaultCode> {
        // Stop is always honored; the caller clears the fault latch.
        if matches!(request, ModeRequest::Stop) {
            self.enter_stopped();
            return Ok(());
        }

        if let Mode::Fault(code) = self.mode {
            // Everything except Stop bounces off a latched fault.
            return Err(code);
        }

        if matches!(request, ModeRequest::Brake) {
            self.mode = Mode::Brake;
            self.command_age_s = 0.0;
            return Ok(());
        }

        // Entry guards for active modes.
        if entry.config_dirty {
            return Err(FaultCode::ConfigChanged);
        }
        if let Some(code) = entry.supply_fault {
            return Err(code);
        }
        if request.needs_motor() && !entry.motor_configured {
            return Err(FaultCode::MotorNotConfigured);
        }
        // Position requests may wait for the angle; everything else that
        // depends on theta must have it at entry.
        if request.needs_theta()
            && !entry.theta_valid
            && !matches!(request, ModeRequest::Position(_))
        {
            return Err(FaultCode::ThetaInvalid);
        }
        if let ModeRequest::Position(cmd) = &request {
            if !cmd.position.is_nan()
                && self.limits.start_limit > 0.0
                && (cmd.position - entry.measured_position).abs() > self.limits.start_limit
            {
                return Err(FaultCode::StartOutsideLimit);
            }
        }

        self.command_age_s = 0.0;
        self.watchdog_s = match &request {
            ModeRequest::Position(cmd) => cmd.watchdog_s,
            ModeRequest::StayWithin(cmd) => cmd.watchdog_s,
            _ => self.default_watchdog_s,
        };

        if matches!(self.mode, Mode::Stopped) {
            // Cold entry passes through Enabling for the pre-driver.
            self.mode = Mode::Enabling {
                cycles_left: self.enable_delay_cycles,
                request,
            };
            return Ok(());
        }

        self.activate(request, entry.theta_valid, entry.measured_position);
        Ok(())
    }

    fn enter_stopped(&mut self) {
        defmt::info!("mode -> stopped");
        self.mode = Mode::Stopped;
        self.commanded_torque = 0.0;
        self.command_age_s = 0.0;
    }

    /// Switch straight into the controller for `request`. The pre-driver
    /// is already enabled at this point.
    fn activate(&mut self, request: ModeRequest, theta_valid: bool, measured_position: f32) {
        let was_position_family = matches!(
            self.mode,
            Mode::Position(_) | Mode::PositionHold(_) | Mode::PositionWait(_) | Mode::ZeroVelocity
        );
        match request {
            ModeRequest::Stop => self.enter_stopped(),
            ModeRequest::Brake => self.mode = Mode::Brake,
            ModeRequest::ZeroVelocity => {
                if !was_position_family {
                    self.outer.reset(measured_position);
                }
                self.mode = Mode::ZeroVelocity;
            }
            ModeRequest::Position(cmd) => {
                // Position/velocity/torque flavors interchange instantly
                // and keep the integrator (gains have not changed).
                if !was_position_family {
                    self.outer.reset(measured_position);
                }
                self.mode = if theta_valid {
                    Mode::Position(cmd)
                } else {
                    Mode::PositionWait(cmd)
                };
            }
            ModeRequest::Current { id, iq } => self.mode = Mode::Current { id, iq },
            ModeRequest::Voltage { phase } => self.mode = Mode::Voltage { phase },
            ModeRequest::VoltageFoc { theta, voltage } => {
                self.mode = Mode::VoltageFoc { theta, voltage }
            }
            ModeRequest::VoltageDq { d, q } => self.mode = Mode::VoltageDq { d, q },
            ModeRequest::StayWithin(cmd) => {
                self.outer.reset(measured_position);
                self.mode = Mode::StayWithin(cmd);
            }
            ModeRequest::MeasureInductance {
                voltage,
                period_cycles,
            } => {
                self.mode = Mode::MeasureInductance(InductanceState {
                    voltage,
                    period_cycles: period_cycles.max(1),
                    cycles_in_half: 0,
                    sign: 1.0,
                    id_at_toggle: 0.0,
                    delta_sum: 0.0,
                    toggles: 0,
                });
            }
            ModeRequest::CalibrateCurrent => {
                self.mode = Mode::CalibratingCurrent(CurrentCalState {
                    settle_left: CURRENT_CAL_SETTLE_CYCLES,
                    calibrator: OffsetCalibrator::new(CURRENT_CAL_SAMPLES),
                });
            }
            ModeRequest::CalibrateEncoder { voltage } => {
                self.mode = Mode::CalibratingEncoder(EncoderCalState {
                    voltage,
                    applied_e_turns: 0.0,
                    target_e_turns: self.motor.pole_pairs as f32,
                    sums: [0.0; COMMUTATION_BINS],
                    counts: [0; COMMUTATION_BINS],
                });
            }
            ModeRequest::Home(cmd) => {
                self.outer.reset(measured_position);
                self.mode = Mode::Homing {
                    cmd,
                    elapsed_s: 0.0,
                };
            }
        }
        defmt::info!("mode -> {}", self.mode.name());
    }

    /// One dispatch per control cycle.
    pub fn update(&mut self, inputs: &CycleInputs) -> ControlRequest {
        self.command_age_s += self.dt;

        // Watchdog demotion for command-driven modes.
        if self.watchdog_s > 0.0 && self.command_age_s > self.watchdog_s {
            let demotable = matches!(
                self.mode,
                Mode::Position(_)
                    | Mode::PositionHold(_)
                    | Mode::PositionWait(_)
                    | Mode::ZeroVelocity
                    | Mode::Current { .. }
                    | Mode::StayWithin(_)
                    | Mode::Voltage { .. }
                    | Mode::VoltageFoc { .. }
                    | Mode::VoltageDq { .. }
            );
            if demotable {
                defmt::warn!("command watchdog expired; mode -> position_timeout");
                self.outer.reset(inputs.output_position);
                self.mode = Mode::PositionTimeout { elapsed_s: 0.0 };
            }
        }

        match self.mode {
            Mode::Stopped => {
                self.commanded_torque = 0.0;
                ControlRequest::HiZ
            }
            Mode::Fault(_) => {
                self.commanded_torque = 0.0;
                ControlRequest::HiZ
            }
            Mode::Enabling {
                cycles_left,
                request,
            } => {
                if cycles_left > 0 {
                    self.mode = Mode::Enabling {
                        cycles_left: cycles_left - 1,
                        request,
                    };
                    return ControlRequest::Enabling;
                }
                // Delay elapsed: the fault line must have released.
                if inputs.driver_fault {
                    self.force_fault(FaultCode::DriverEnableFault);
                    return ControlRequest::HiZ;
                }
                self.activate(request, inputs.rotor_valid, inputs.output_position);
                ControlRequest::Enabling
            }
            Mode::PositionWait(cmd) => {
                self.commanded_torque = 0.0;
                if inputs.rotor_valid {
                    self.outer.reset(inputs.output_position);
                    self.mode = Mode::Position(cmd);
                }
                ControlRequest::Enabling
            }
            Mode::Position(cmd) => {
                // A velocity move past its stop position converts to hold.
                if cmd.position.is_nan() && !cmd.stop_position.is_nan() && cmd.velocity != 0.0 {
                    let passed = (inputs.output_position - cmd.stop_position) * sign(cmd.velocity);
                    if passed >= 0.0 {
                        let hold = PositionCmd {
                            position: cmd.stop_position,
                            velocity: 0.0,
                            ..cmd
                        };
                        self.mode = Mode::PositionHold(hold);
                        return self.run_position(&hold, inputs);
                    }
                }
                self.run_position(&cmd, inputs)
            }
            Mode::PositionHold(cmd) => self.run_position(&cmd, inputs),
            Mode::PositionTimeout { elapsed_s } => {
                let elapsed_s = elapsed_s + self.dt;
                if elapsed_s > self.watchdog_stop_s {
                    self.enter_stopped();
                    return ControlRequest::HiZ;
                }
                self.mode = Mode::PositionTimeout { elapsed_s };
                self.run_zero_velocity(inputs)
            }
            Mode::ZeroVelocity => self.run_zero_velocity(inputs),
            Mode::Voltage { phase } => {
                self.commanded_torque = 0.0;
                ControlRequest::PhaseVoltage {
                    va: phase[0],
                    vb: phase[1],
                    vc: phase[2],
                }
            }
            Mode::VoltageFoc { theta, voltage } => {
                self.commanded_torque = 0.0;
                ControlRequest::VoltageDq {
                    vd: voltage,
                    vq: 0.0,
                    use_measured_theta: false,
                    theta,
                }
            }
            Mode::VoltageDq { d, q } => {
                self.commanded_torque = 0.0;
                ControlRequest::VoltageDq {
                    vd: d,
                    vq: q,
                    use_measured_theta: true,
                    theta: 0.0,
                }
            }
            Mode::Current { id, iq } => {
                self.commanded_torque = self.torque_model.torque_from_current(iq);
                ControlRequest::Current {
                    id_ref: id,
                    iq_ref: iq,
                }
            }
            Mode::Brake => {
                self.commanded_torque = 0.0;
                ControlRequest::BrakeLowSides
            }
            Mode::StayWithin(cmd) => {
                let outer_cmd = OuterCommand {
                    position: f32::NAN,
                    velocity: 0.0,
                    ff_torque: cmd.ff_torque,
                    kp_scale: cmd.kp_scale,
                    kd_scale: cmd.kd_scale,
                };
                let raw_torque = self.outer.update_stay_within(
                    cmd.lower,
                    cmd.upper,
                    &outer_cmd,
                    inputs.output_position,
                    inputs.output_velocity,
                );
                self.finish_torque(raw_torque, cmd.max_torque, inputs)
            }
            Mode::Homing { cmd, elapsed_s } => {
                if inputs.homed != Homed::Never {
                    let hold = PositionCmd {
                        position: inputs.output_position,
                        max_torque: cmd.max_torque,
                        ..PositionCmd::default()
                    };
                    defmt::info!("homing complete; holding");
                    self.outer.reset(inputs.output_position);
                    self.mode = Mode::PositionHold(hold);
                    return self.run_position(&hold, inputs);
                }
                let elapsed_s = elapsed_s + self.dt;
                if elapsed_s > HOMING_TIMEOUT_S {
                    self.force_fault(FaultCode::CalibrationFault);
                    return ControlRequest::HiZ;
                }
                self.mode = Mode::Homing { cmd, elapsed_s };
                let outer_cmd = OuterCommand {
                    velocity: cmd.velocity,
                    ..OuterCommand::default()
                };
                let raw_torque =
                    self.outer
                        .update(&outer_cmd, inputs.output_position, inputs.output_velocity);
                self.finish_torque(raw_torque, cmd.max_torque, inputs)
            }
            Mode::CalibratingCurrent(mut state) => {
                self.commanded_torque = 0.0;
                if state.settle_left > 0 {
                    state.settle_left -= 1;
                    self.mode = Mode::CalibratingCurrent(state);
                } else if let Some(offsets) = state.calibrator.push(&inputs.raw) {
                    defmt::info!("current offsets calibrated");
                    self.calibration_output.current_offsets = Some(offsets);
                    self.enter_stopped();
                } else {
                    self.mode = Mode::CalibratingCurrent(state);
                }
                // 50 % duty on every phase: zero differential voltage with
                // the shunts in their linear region.
                ControlRequest::PhaseVoltage {
                    va: 0.0,
                    vb: 0.0,
                    vc: 0.0,
                }
            }
            Mode::CalibratingEncoder(mut state) => {
                self.commanded_torque = 0.0;
                // Record the offset between the applied and observed
                // electrical angle into the bin the observation lands in.
                let observed = wrap_turns(inputs.mech_theta * self.motor.pole_pairs as f32);
                let applied = wrap_turns(state.applied_e_turns);
                let bin = ((observed * COMMUTATION_BINS as f32) as usize).min(COMMUTATION_BINS - 1);
                state.sums[bin] += wrap_delta(applied - observed);
                state.counts[bin] = state.counts[bin].saturating_add(1);

                state.applied_e_turns += ENCODER_CAL_SPEED * self.dt;
                if state.applied_e_turns >= state.target_e_turns {
                    if state.counts.iter().any(|&c| c == 0) {
                        // The rotor did not follow the sweep.
                        self.force_fault(FaultCode::CalibrationFault);
                        return ControlRequest::HiZ;
                    }
                    let mut table = [0.0f32; COMMUTATION_BINS];
                    for i in 0..COMMUTATION_BINS {
                        table[i] = state.sums[i] / state.counts[i] as f32;
                    }
                    defmt::info!("commutation table calibrated");
                    self.calibration_output.commutation_offsets = Some(table);
                    self.enter_stopped();
                    return ControlRequest::HiZ;
                }
                self.mode = Mode::CalibratingEncoder(state);
                ControlRequest::VoltageDq {
                    vd: state.voltage,
                    vq: 0.0,
                    use_measured_theta: false,
                    theta: applied * core::f32::consts::TAU,
                }
            }
            Mode::MeasureInductance(mut state) => {
                self.commanded_torque = 0.0;
                state.cycles_in_half += 1;
                if state.cycles_in_half >= state.period_cycles {
                    let delta = (inputs.id_measured - state.id_at_toggle).abs();
                    if state.toggles > 0 {
                        // Skip the first half-period; it starts from rest.
                        state.delta_sum += delta;
                    }
                    state.id_at_toggle = inputs.id_measured;
                    state.sign = -state.sign;
                    state.cycles_in_half = 0;
                    state.toggles += 1;

                    if state.toggles > INDUCTANCE_TOGGLES {
                        let avg_delta = state.delta_sum / (state.toggles - 1) as f32;
                        if avg_delta > 1e-3 {
                            let half_period_s = state.period_cycles as f32 * self.dt;
                            // di/dt = V/L while either polarity is applied.
                            let inductance = state.voltage * half_period_s / avg_delta;
                            self.calibration_output.inductance_h = Some(inductance);
                            defmt::info!("inductance measured");
                            self.enter_stopped();
                        } else {
                            self.force_fault(FaultCode::CalibrationFault);
                        }
                        return ControlRequest::HiZ;
                    }
                }
                self.mode = Mode::MeasureInductance(state);
                ControlRequest::VoltageDq {
                    vd: state.sign * state.voltage,
                    vq: 0.0,
                    use_measured_theta: false,
                    theta: 0.0,
                }
            }
        }
    }

    fn run_position(&mut self, cmd: &PositionCmd, inputs: &CycleInputs) -> ControlRequest {
        let outer_cmd = OuterCommand {
            position: cmd.position,
            velocity: cmd.velocity,
            ff_torque: cmd.ff_torque,
            kp_scale: cmd.kp_scale,
            kd_scale: cmd.kd_scale,
        };
        let raw_torque = self
            .outer
            .update(&outer_cmd, inputs.output_position, inputs.output_velocity);
        self.finish_torque(raw_torque, cmd.max_torque, inputs)
    }

    fn run_zero_velocity(&mut self, inputs: &CycleInputs) -> ControlRequest {
        let outer_cmd = OuterCommand::default();
        let raw_torque = self
            .outer
            .update(&outer_cmd, inputs.output_position, inputs.output_velocity);
        self.finish_torque(raw_torque, f32::MAX, inputs)
    }

    /// Limit the torque, convert to current references.
    fn finish_torque(
        &mut self,
        raw_torque: f32,
        command_max: f32,
        inputs: &CycleInputs,
    ) -> ControlRequest {
        let ctx = LimitContext {
            output_position: inputs.output_position,
            output_velocity: inputs.output_velocity,
            electrical_omega: inputs.electrical_omega,
            vbus: inputs.vbus,
            fet_temp_c: inputs.fet_temp_c,
            motor_temp_c: inputs.motor_temp_c,
        };
        let limited = self.limiter.apply(raw_torque, command_max, &ctx);
        self.outer.notify_clamped(limited.clamped);
        self.commanded_torque = limited.torque;

        let iq_ref = self.torque_model.current_from_torque(limited.torque);
        let id_ref = if self.limits.field_weakening {
            field_weakening_id(
                inputs.electrical_omega,
                inputs.vbus * K_SVM,
                flux_linkage(self.motor.torque_constant_nm_per_a, self.motor.pole_pairs),
                self.motor.phase_inductance_h,
            )
        } else {
            0.0
        };
        ControlRequest::Current { id_ref, iq_ref }
    }
}

fn sign(x: f32) -> f32 {
    if x >= 0.0 { 1.0 } else { -1.0 }
}
