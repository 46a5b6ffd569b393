/// Register file.
///
/// A flat namespace of addressable scalars covering telemetry, the staged
/// command fields, and the persistent configuration. The bus protocol and
/// the CLI both dispatch through this table; the tag namespace of the
/// flash blob is the same address space.
///
/// Commands work moteus-style: a host stages the command fields (position,
/// velocity, torque ceiling, ...) and then writes the MODE register, which
/// turns the staged fields into one mailbox command.

use crate::firmware::config::ServoConfig;
use crate::firmware::control::modes::{ModeRequest, PositionCmd, StayWithinCmd};
use crate::firmware::control::ServoCommand;
use crate::firmware::telemetry::ControlCycleSnapshot;

/// Scalar value as carried by the wire protocol.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RegValue {
    I8(i8),
    I16(i16),
    I32(i32),
    U32(u32),
    F32(f32),
}

impl RegValue {
    pub fn as_f32(&self) -> f32 {
        match *self {
            Self::I8(v) => v as f32,
            Self::I16(v) => v as f32,
            Self::I32(v) => v as f32,
            Self::U32(v) => v as f32,
            Self::F32(v) => v,
        }
    }

    pub fn as_u32(&self) -> u32 {
        match *self {
            Self::I8(v) => v as u32,
            Self::I16(v) => v as u32,
            Self::I32(v) => v as u32,
            Self::U32(v) => v,
            Self::F32(v) => v as u32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegError {
    UnknownRegister,
    ReadOnly,
    WriteOnly,
    BadValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    R,
    RW,
    W,
}

/// One table row: address, CLI name, access.
pub struct RegisterDef {
    pub address: u16,
    pub name: &'static str,
    pub access: Access,
}

// Telemetry block.
pub const REG_MODE: u16 = 0x000;
pub const REG_POSITION: u16 = 0x001;
pub const REG_VELOCITY: u16 = 0x002;
pub const REG_TORQUE: u16 = 0x003;
pub const REG_Q_CURRENT: u16 = 0x004;
pub const REG_D_CURRENT: u16 = 0x005;
pub const REG_VOLTAGE: u16 = 0x00D;
pub const REG_TEMPERATURE: u16 = 0x00E;
pub const REG_FAULT: u16 = 0x00F;
pub const REG_MOTOR_TEMPERATURE: u16 = 0x010;
pub const REG_CYCLE_TIME_US: u16 = 0x011;
pub const REG_TELEMETRY_DROPPED: u16 = 0x012;

// Staged command block.
pub const REG_CMD_POSITION: u16 = 0x020;
pub const REG_CMD_VELOCITY: u16 = 0x021;
pub const REG_CMD_FF_TORQUE: u16 = 0x022;
pub const REG_CMD_KP_SCALE: u16 = 0x023;
pub const REG_CMD_KD_SCALE: u16 = 0x024;
pub const REG_CMD_MAX_TORQUE: u16 = 0x025;
pub const REG_CMD_STOP_POSITION: u16 = 0x026;
pub const REG_CMD_WATCHDOG_MS: u16 = 0x027;
pub const REG_CMD_BOUND_LOWER: u16 = 0x028;
pub const REG_CMD_BOUND_UPPER: u16 = 0x029;
pub const REG_CMD_D_CURRENT: u16 = 0x02A;
pub const REG_CMD_Q_CURRENT: u16 = 0x02B;
pub const REG_REZERO: u16 = 0x02F;

// Configuration block; the flash TLV tags are these addresses.
pub const REG_CFG_POLE_PAIRS: u16 = 0x100;
pub const REG_CFG_RESISTANCE: u16 = 0x101;
pub const REG_CFG_KT: u16 = 0x102;
pub const REG_CFG_CURRENT_CUTOFF: u16 = 0x103;
pub const REG_CFG_TORQUE_SCALE: u16 = 0x104;
pub const REG_CFG_CURRENT_SCALE: u16 = 0x105;
pub const REG_CFG_PID_KP: u16 = 0x110;
pub const REG_CFG_PID_KD: u16 = 0x111;
pub const REG_CFG_PID_KI: u16 = 0x112;
pub const REG_CFG_PID_ILIMIT: u16 = 0x113;
pub const REG_CFG_MAX_RATE: u16 = 0x114;
pub const REG_CFG_PI_KP: u16 = 0x120;
pub const REG_CFG_PI_KI: u16 = 0x121;
pub const REG_CFG_MAX_TORQUE: u16 = 0x130;
pub const REG_CFG_MAX_VELOCITY: u16 = 0x131;
pub const REG_CFG_MAX_POWER: u16 = 0x132;
pub const REG_CFG_POSITION_MIN: u16 = 0x133;
pub const REG_CFG_POSITION_MAX: u16 = 0x134;
pub const REG_CFG_START_LIMIT: u16 = 0x135;
pub const REG_CFG_MAX_VOLTAGE: u16 = 0x136;
pub const REG_CFG_V_MIN: u16 = 0x140;
pub const REG_CFG_V_MAX: u16 = 0x141;
pub const REG_CFG_PWM_FREQUENCY: u16 = 0x150;

pub const REGISTERS: &[RegisterDef] = &[
    RegisterDef { address: REG_MODE, name: "mode", access: Access::RW },
    RegisterDef { address: REG_POSITION, name: "position", access: Access::R },
    RegisterDef { address: REG_VELOCITY, name: "velocity", access: Access::R },
    RegisterDef { address: REG_TORQUE, name: "torque", access: Access::R },
    RegisterDef { address: REG_Q_CURRENT, name: "q_current", access: Access::R },
    RegisterDef { address: REG_D_CURRENT, name: "d_current", access: Access::R },
    RegisterDef { address: REG_VOLTAGE, name: "voltage", access: Access::R },
    RegisterDef { address: REG_TEMPERATURE, name: "temperature", access: Access::R },
    RegisterDef { address: REG_FAULT, name: "fault", access: Access::R },
    RegisterDef { address: REG_MOTOR_TEMPERATURE, name: "motor_temperature", access: Access::R },
    RegisterDef { address: REG_CYCLE_TIME_US, name: "cycle_time_us", access: Access::R },
    RegisterDef { address: REG_TELEMETRY_DROPPED, name: "telemetry_dropped", access: Access::R },
    RegisterDef { address: REG_CMD_POSITION, name: "cmd.position", access: Access::RW },
    RegisterDef { address: REG_CMD_VELOCITY, name: "cmd.velocity", access: Access::RW },
    RegisterDef { address: REG_CMD_FF_TORQUE, name: "cmd.ff_torque", access: Access::RW },
    RegisterDef { address: REG_CMD_KP_SCALE, name: "cmd.kp_scale", access: Access::RW },
    RegisterDef { address: REG_CMD_KD_SCALE, name: "cmd.kd_scale", access: Access::RW },
    RegisterDef { address: REG_CMD_MAX_TORQUE, name: "cmd.max_torque", access: Access::RW },
    RegisterDef { address: REG_CMD_STOP_POSITION, name: "cmd.stop_position", access: Access::RW },
    RegisterDef { address: REG_CMD_WATCHDOG_MS, name: "cmd.watchdog_ms", access: Access::RW },
    RegisterDef { address: REG_CMD_BOUND_LOWER, name: "cmd.bound_lower", access: Access::RW },
    RegisterDef { address: REG_CMD_BOUND_UPPER, name: "cmd.bound_upper", access: Access::RW },
    RegisterDef { address: REG_CMD_D_CURRENT, name: "cmd.d_current", access: Access::RW },
    RegisterDef { address: REG_CMD_Q_CURRENT, name: "cmd.q_current", access: Access::RW },
    RegisterDef { address: REG_REZERO, name: "rezero", access: Access::W },
    RegisterDef { address: REG_CFG_POLE_PAIRS, name: "motor.pole_pairs", access: Access::RW },
    RegisterDef { address: REG_CFG_RESISTANCE, name: "motor.resistance", access: Access::RW },
    RegisterDef { address: REG_CFG_KT, name: "motor.kt", access: Access::RW },
    RegisterDef { address: REG_CFG_CURRENT_CUTOFF, name: "motor.current_cutoff", access: Access::RW },
    RegisterDef { address: REG_CFG_TORQUE_SCALE, name: "motor.torque_scale", access: Access::RW },
    RegisterDef { address: REG_CFG_CURRENT_SCALE, name: "motor.current_scale", access: Access::RW },
    RegisterDef { address: REG_CFG_PID_KP, name: "servo.kp", access: Access::RW },
    RegisterDef { address: REG_CFG_PID_KD, name: "servo.kd", access: Access::RW },
    RegisterDef { address: REG_CFG_PID_KI, name: "servo.ki", access: Access::RW },
    RegisterDef { address: REG_CFG_PID_ILIMIT, name: "servo.ilimit", access: Access::RW },
    RegisterDef { address: REG_CFG_MAX_RATE, name: "servo.max_rate", access: Access::RW },
    RegisterDef { address: REG_CFG_PI_KP, name: "foc.kp", access: Access::RW },
    RegisterDef { address: REG_CFG_PI_KI, name: "foc.ki", access: Access::RW },
    RegisterDef { address: REG_CFG_MAX_TORQUE, name: "limits.max_torque", access: Access::RW },
    RegisterDef { address: REG_CFG_MAX_VELOCITY, name: "limits.max_velocity", access: Access::RW },
    RegisterDef { address: REG_CFG_MAX_POWER, name: "limits.max_power", access: Access::RW },
    RegisterDef { address: REG_CFG_POSITION_MIN, name: "limits.position_min", access: Access::RW },
    RegisterDef { address: REG_CFG_POSITION_MAX, name: "limits.position_max", access: Access::RW },
    RegisterDef { address: REG_CFG_START_LIMIT, name: "limits.start_limit", access: Access::RW },
    RegisterDef { address: REG_CFG_MAX_VOLTAGE, name: "limits.max_voltage", access: Access::RW },
    RegisterDef { address: REG_CFG_V_MIN, name: "supply.v_min", access: Access::RW },
    RegisterDef { address: REG_CFG_V_MAX, name: "supply.v_max", access: Access::RW },
    RegisterDef { address: REG_CFG_PWM_FREQUENCY, name: "pwm.frequency", access: Access::RW },
];

pub fn lookup_name(name: &str) -> Option<&'static RegisterDef> {
    REGISTERS.iter().find(|r| r.name == name)
}

pub fn lookup_address(address: u16) -> Option<&'static RegisterDef> {
    REGISTERS.iter().find(|r| r.address == address)
}

/// Staged command fields, combined into a mailbox command by a MODE write.
#[derive(Clone, Copy, Debug)]
pub struct StagedCommand {
    pub position: f32,
    pub velocity: f32,
    pub ff_torque: f32,
    pub kp_scale: f32,
    pub kd_scale: f32,
    pub max_torque: f32,
    pub stop_position: f32,
    pub watchdog_ms: f32,
    pub bound_lower: f32,
    pub bound_upper: f32,
    pub d_current: f32,
    pub q_current: f32,
}

impl Default for StagedCommand {
    fn default() -> Self {
        Self {
            position: f32::NAN,
            velocity: 0.0,
            ff_torque: 0.0,
            kp_scale: 1.0,
            kd_scale: 1.0,
            max_torque: f32::MAX,
            stop_position: f32::NAN,
            watchdog_ms: 0.0,
            bound_lower: f32::NAN,
            bound_upper: f32::NAN,
            d_current: 0.0,
            q_current: 0.0,
        }
    }
}

impl StagedCommand {
    fn position_cmd(&self) -> PositionCmd {
        PositionCmd {
            position: self.position,
            velocity: self.velocity,
            max_torque: self.max_torque,
            kp_scale: self.kp_scale,
            kd_scale: self.kd_scale,
            ff_torque: self.ff_torque,
            stop_position: self.stop_position,
            watchdog_s: self.watchdog_ms / 1000.0,
        }
    }
}

pub struct RegisterFile {
    staged: StagedCommand,
    snapshot: ControlCycleSnapshot,
    config: ServoConfig,
    config_written: bool,
    pending: Option<ServoCommand>,
    telemetry_dropped: u32,
    pub persist_requested: bool,
    pub load_requested: bool,
}

impl RegisterFile {
    pub fn new(config: ServoConfig) -> Self {
        Self {
            staged: StagedCommand::default(),
            snapshot: ControlCycleSnapshot::default(),
            config,
            config_written: false,
            pending: None,
            telemetry_dropped: 0,
            persist_requested: false,
            load_requested: false,
        }
    }

    /// Background loop publishes the latest cycle snapshot here.
    pub fn update_snapshot(&mut self, snapshot: ControlCycleSnapshot, dropped: u32) {
        self.snapshot = snapshot;
        self.telemetry_dropped = dropped;
    }

    /// Mirror of the active configuration, kept current by the background
    /// loop so config reads reflect what the control cycle uses.
    pub fn sync_config(&mut self, config: ServoConfig) {
        if !self.config_written {
            self.config = config;
        }
    }

    pub fn config(&self) -> &ServoConfig {
        &self.config
    }

    pub fn snapshot(&self) -> &ControlCycleSnapshot {
        &self.snapshot
    }

    pub fn staged(&self) -> &StagedCommand {
        &self.staged
    }

    /// Take whatever command the last frame produced. Config writes fold
    /// into a single `Config` command per frame.
    pub fn take_pending(&mut self) -> Option<ServoCommand> {
        if let Some(command) = self.pending.take() {
            return Some(command);
        }
        if self.config_written {
            self.config_written = false;
            return Some(ServoCommand::Config(self.config));
        }
        None
    }

    pub fn read(&self, address: u16) -> Result<RegValue, RegError> {
        let def = lookup_address(address).ok_or(RegError::UnknownRegister)?;
        if def.access == Access::W {
            return Err(RegError::WriteOnly);
        }
        let value = match address {
            REG_MODE => RegValue::I8(self.snapshot.mode as i8),
            REG_POSITION => RegValue::F32(self.snapshot.position),
            REG_VELOCITY => RegValue::F32(self.snapshot.velocity),
            REG_TORQUE => RegValue::F32(self.snapshot.torque_nm),
            REG_Q_CURRENT => RegValue::F32(self.snapshot.iq),
            REG_D_CURRENT => RegValue::F32(self.snapshot.id),
            REG_VOLTAGE => RegValue::F32(self.snapshot.vbus),
            REG_TEMPERATURE => RegValue::F32(self.snapshot.fet_temp_c),
            REG_FAULT => RegValue::I8(self.snapshot.fault as i8),
            REG_MOTOR_TEMPERATURE => RegValue::F32(self.snapshot.motor_temp_c),
            REG_CYCLE_TIME_US => RegValue::U32(self.snapshot.cycle_time_us as u32),
            REG_TELEMETRY_DROPPED => RegValue::U32(self.telemetry_dropped),
            REG_CMD_POSITION => RegValue::F32(self.staged.position),
            REG_CMD_VELOCITY => RegValue::F32(self.staged.velocity),
            REG_CMD_FF_TORQUE => RegValue::F32(self.staged.ff_torque),
            REG_CMD_KP_SCALE => RegValue::F32(self.staged.kp_scale),
            REG_CMD_KD_SCALE => RegValue::F32(self.staged.kd_scale),
            REG_CMD_MAX_TORQUE => RegValue::F32(self.staged.max_torque),
            REG_CMD_STOP_POSITION => RegValue::F32(self.staged.stop_position),
            REG_CMD_WATCHDOG_MS => RegValue::F32(self.staged.watchdog_ms),
            REG_CMD_BOUND_LOWER => RegValue::F32(self.staged.bound_lower),
            REG_CMD_BOUND_UPPER => RegValue::F32(self.staged.bound_upper),
            REG_CMD_D_CURRENT => RegValue::F32(self.staged.d_current),
            REG_CMD_Q_CURRENT => RegValue::F32(self.staged.q_current),
            REG_CFG_POLE_PAIRS => RegValue::U32(self.config.motor.pole_pairs as u32),
            REG_CFG_RESISTANCE => RegValue::F32(self.config.motor.phase_resistance_ohm),
            REG_CFG_KT => RegValue::F32(self.config.motor.torque_constant_nm_per_a),
            REG_CFG_CURRENT_CUTOFF => RegValue::F32(self.config.motor.current_cutoff_a),
            REG_CFG_TORQUE_SCALE => RegValue::F32(self.config.motor.torque_scale),
            REG_CFG_CURRENT_SCALE => RegValue::F32(self.config.motor.current_scale),
            REG_CFG_PID_KP => RegValue::F32(self.config.position_pid.kp),
            REG_CFG_PID_KD => RegValue::F32(self.config.position_pid.kd),
            REG_CFG_PID_KI => RegValue::F32(self.config.position_pid.ki),
            REG_CFG_PID_ILIMIT => RegValue::F32(self.config.position_pid.ilimit),
            REG_CFG_MAX_RATE => RegValue::F32(self.config.position_pid.max_desired_rate),
            REG_CFG_PI_KP => RegValue::F32(self.config.current_pi.kp),
            REG_CFG_PI_KI => RegValue::F32(self.config.current_pi.ki),
            REG_CFG_MAX_TORQUE => RegValue::F32(self.config.limits.max_torque_nm),
            REG_CFG_MAX_VELOCITY => RegValue::F32(self.config.limits.max_velocity),
            REG_CFG_MAX_POWER => RegValue::F32(self.config.limits.max_power_w),
            REG_CFG_POSITION_MIN => RegValue::F32(self.config.limits.position_min),
            REG_CFG_POSITION_MAX => RegValue::F32(self.config.limits.position_max),
            REG_CFG_START_LIMIT => RegValue::F32(self.config.limits.start_limit),
            REG_CFG_MAX_VOLTAGE => RegValue::F32(self.config.limits.max_voltage),
            REG_CFG_V_MIN => RegValue::F32(self.config.supply.v_min),
            REG_CFG_V_MAX => RegValue::F32(self.config.supply.v_max),
            REG_CFG_PWM_FREQUENCY => RegValue::U32(self.config.pwm.frequency_hz),
            _ => return Err(RegError::UnknownRegister),
        };
        Ok(value)
    }

    pub fn write(&mut self, address: u16, value: RegValue) -> Result<(), RegError> {
        let def = lookup_address(address).ok_or(RegError::UnknownRegister)?;
        if def.access == Access::R {
            return Err(RegError::ReadOnly);
        }
        match address {
            REG_MODE => self.write_mode(value.as_u32() as u8)?,
            REG_CMD_POSITION => self.staged.position = value.as_f32(),
            REG_CMD_VELOCITY => self.staged.velocity = value.as_f32(),
            REG_CMD_FF_TORQUE => self.staged.ff_torque = value.as_f32(),
            REG_CMD_KP_SCALE => self.staged.kp_scale = value.as_f32(),
            REG_CMD_KD_SCALE => self.staged.kd_scale = value.as_f32(),
            REG_CMD_MAX_TORQUE => self.staged.max_torque = value.as_f32(),
            REG_CMD_STOP_POSITION => self.staged.stop_position = value.as_f32(),
            REG_CMD_WATCHDOG_MS => self.staged.watchdog_ms = value.as_f32(),
            REG_CMD_BOUND_LOWER => self.staged.bound_lower = value.as_f32(),
            REG_CMD_BOUND_UPPER => self.staged.bound_upper = value.as_f32(),
            REG_CMD_D_CURRENT => self.staged.d_current = value.as_f32(),
            REG_CMD_Q_CURRENT => self.staged.q_current = value.as_f32(),
            REG_REZERO => {
                self.pending = Some(ServoCommand::Rezero {
                    position: value.as_f32(),
                });
            }
            REG_CFG_POLE_PAIRS => {
                let v = value.as_u32();
                if v == 0 || v > 64 {
                    return Err(RegError::BadValue);
                }
                self.config.motor.pole_pairs = v as u8;
                self.config_written = true;
            }
            REG_CFG_RESISTANCE => {
                self.config.motor.phase_resistance_ohm = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_KT => {
                self.config.motor.torque_constant_nm_per_a = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_CURRENT_CUTOFF => {
                self.config.motor.current_cutoff_a = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_TORQUE_SCALE => {
                self.config.motor.torque_scale = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_CURRENT_SCALE => {
                self.config.motor.current_scale = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_PID_KP => {
                self.config.position_pid.kp = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_PID_KD => {
                self.config.position_pid.kd = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_PID_KI => {
                self.config.position_pid.ki = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_PID_ILIMIT => {
                self.config.position_pid.ilimit = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_MAX_RATE => {
                self.config.position_pid.max_desired_rate = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_PI_KP => {
                self.config.current_pi.kp = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_PI_KI => {
                self.config.current_pi.ki = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_MAX_TORQUE => {
                self.config.limits.max_torque_nm = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_MAX_VELOCITY => {
                self.config.limits.max_velocity = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_MAX_POWER => {
                self.config.limits.max_power_w = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_POSITION_MIN => {
                self.config.limits.position_min = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_POSITION_MAX => {
                self.config.limits.position_max = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_START_LIMIT => {
                self.config.limits.start_limit = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_MAX_VOLTAGE => {
                self.config.limits.max_voltage = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_V_MIN => {
                self.config.supply.v_min = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_V_MAX => {
                self.config.supply.v_max = value.as_f32();
                self.config_written = true;
            }
            REG_CFG_PWM_FREQUENCY => {
                let v = value.as_u32();
                self.config.pwm.frequency_hz = v;
                if !self.config.pwm.is_valid() {
                    self.config.pwm.frequency_hz = 30_000;
                    return Err(RegError::BadValue);
                }
                self.config_written = true;
            }
            _ => return Err(RegError::UnknownRegister),
        }
        Ok(())
    }

    /// A MODE write converts the staged fields into a mailbox command.
    fn write_mode(&mut self, mode_id: u8) -> Result<(), RegError> {
        let request = match mode_id {
            0 => ModeRequest::Stop,
            6 => ModeRequest::Position(self.staged.position_cmd()),
            9 => ModeRequest::ZeroVelocity,
            13 => ModeRequest::Current {
                id: self.staged.d_current,
                iq: self.staged.q_current,
            },
            14 => ModeRequest::Brake,
            16 => ModeRequest::StayWithin(StayWithinCmd {
                lower: self.staged.bound_lower,
                upper: self.staged.bound_upper,
                max_torque: self.staged.max_torque,
                kp_scale: self.staged.kp_scale,
                kd_scale: self.staged.kd_scale,
                ff_torque: self.staged.ff_torque,
                watchdog_s: self.staged.watchdog_ms / 1000.0,
            }),
            _ => return Err(RegError::BadValue),
        };
        self.pending = Some(ServoCommand::Mode(request));
        Ok(())
    }

    /// Stage and fire a full request in one step (CLI path).
    pub fn submit(&mut self, command: ServoCommand) {
        self.pending = Some(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> RegisterFile {
        RegisterFile::new(ServoConfig::default())
    }

    #[test]
    fn every_rw_register_reads_back_written_value() {
        let mut f = file();
        for def in REGISTERS {
            // MODE triggers a command and the PWM frequency is
            // range-checked; both have dedicated tests.
            if def.access != Access::RW
                || def.address == REG_MODE
                || def.address == REG_CFG_PWM_FREQUENCY
            {
                continue;
            }
            let value = match f.read(def.address).unwrap() {
                RegValue::U32(_) => RegValue::U32(7),
                _ => RegValue::F32(0.5),
            };
            f.write(def.address, value).unwrap();
            assert_eq!(f.read(def.address).unwrap(), value, "{}", def.name);
        }
    }

    #[test]
    fn read_only_rejects_writes() {
        let mut f = file();
        assert_eq!(
            f.write(REG_POSITION, RegValue::F32(1.0)),
            Err(RegError::ReadOnly)
        );
    }

    #[test]
    fn write_only_rejects_reads() {
        let f = file();
        assert_eq!(f.read(REG_REZERO), Err(RegError::WriteOnly));
    }

    #[test]
    fn unknown_register() {
        let f = file();
        assert_eq!(f.read(0x7FFF), Err(RegError::UnknownRegister));
    }

    #[test]
    fn mode_write_emits_position_request() {
        let mut f = file();
        f.write(REG_CMD_POSITION, RegValue::F32(1.5)).unwrap();
        f.write(REG_CMD_MAX_TORQUE, RegValue::F32(0.5)).unwrap();
        f.write(REG_MODE, RegValue::I8(6)).unwrap();
        match f.take_pending() {
            Some(ServoCommand::Mode(ModeRequest::Position(cmd))) => {
                assert_eq!(cmd.position, 1.5);
                assert_eq!(cmd.max_torque, 0.5);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn config_writes_fold_into_one_command() {
        let mut f = file();
        f.write(REG_CFG_MAX_TORQUE, RegValue::F32(0.5)).unwrap();
        f.write(REG_CFG_V_MIN, RegValue::F32(11.0)).unwrap();
        match f.take_pending() {
            Some(ServoCommand::Config(cfg)) => {
                assert_eq!(cfg.limits.max_torque_nm, 0.5);
                assert_eq!(cfg.supply.v_min, 11.0);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(f.take_pending().is_none());
    }

    #[test]
    fn invalid_mode_id_rejected() {
        let mut f = file();
        assert_eq!(f.write(REG_MODE, RegValue::I8(99)), Err(RegError::BadValue));
        assert!(f.take_pending().is_none());
    }

    #[test]
    fn rezero_register_emits_command() {
        let mut f = file();
        f.write(REG_REZERO, RegValue::F32(2.0)).unwrap();
        match f.take_pending() {
            Some(ServoCommand::Rezero { position }) => assert_eq!(position, 2.0),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn pwm_frequency_bounds_enforced() {
        let mut f = file();
        assert_eq!(
            f.write(REG_CFG_PWM_FREQUENCY, RegValue::U32(5_000)),
            Err(RegError::BadValue)
        );
        f.write(REG_CFG_PWM_FREQUENCY, RegValue::U32(45_000)).unwrap();
        assert_eq!(f.read(REG_CFG_PWM_FREQUENCY).unwrap(), RegValue::U32(45_000));
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(lookup_name("position").unwrap().address, REG_POSITION);
        assert!(lookup_name("nonsense").is_none());
    }
}
