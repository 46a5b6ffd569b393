/// Static configuration for the servo controller.
///
/// Everything here is plain data: the register server writes it, the flash
/// blob persists it, and the control cycle reads a snapshot of it. Changing
/// any field while a closed-loop mode is active raises `ConfigChanged`.

use crate::firmware::error::{FaultCode, Result};

pub const SYSCLK_HZ: u32 = 170_000_000;

/// SVPWM linear-region factor: |V| may reach V_bus / sqrt(3).
pub const K_SVM: f32 = 0.577_350_3;

/// Commutation offset table length, binned over one electrical revolution.
pub const COMMUTATION_BINS: usize = 64;

/// Per-source linearization table length, binned over one rotor revolution.
pub const OFFSET_BINS: usize = 32;

/// Maximum number of configured position sources.
pub const MAX_SOURCES: usize = 3;

#[derive(Clone, Copy, Debug)]
pub struct PwmConfig {
    /// PWM (and control cycle) frequency in Hz.
    pub frequency_hz: u32,
    /// Lowest commanded duty, keeps bootstrap capacitors charged.
    pub min_duty: f32,
    /// Highest commanded duty.
    pub max_duty: f32,
    /// Dead time between complementary transitions, in timer ticks.
    pub deadtime_ticks: u16,
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 30_000,
            min_duty: 0.01,
            max_duty: 0.97,
            deadtime_ticks: 100,
        }
    }
}

impl PwmConfig {
    pub const MIN_FREQUENCY_HZ: u32 = 15_000;
    pub const MAX_FREQUENCY_HZ: u32 = 60_000;

    pub fn period_s(&self) -> f32 {
        1.0 / self.frequency_hz as f32
    }

    pub fn is_valid(&self) -> bool {
        (Self::MIN_FREQUENCY_HZ..=Self::MAX_FREQUENCY_HZ).contains(&self.frequency_hz)
            && self.min_duty >= 0.0
            && self.max_duty <= 1.0
            && self.min_duty < self.max_duty
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MotorConfig {
    pub pole_pairs: u8,
    /// Phase resistance in ohms, measured or pushed by the host.
    pub phase_resistance_ohm: f32,
    /// Phase inductance in henries.
    pub phase_inductance_h: f32,
    /// Torque constant in Nm/A, valid below `current_cutoff_a`.
    pub torque_constant_nm_per_a: f32,
    /// Iq above which torque rolls off logarithmically.
    pub current_cutoff_a: f32,
    /// Scale of the logarithmic torque region, Nm per octave.
    pub torque_scale: f32,
    /// Current scale inside the log argument, 1/A.
    pub current_scale: f32,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            pole_pairs: 7,
            phase_resistance_ohm: 0.0,
            phase_inductance_h: 0.0,
            torque_constant_nm_per_a: 0.0,
            current_cutoff_a: 10.0,
            torque_scale: 0.05,
            current_scale: 1.0,
        }
    }
}

impl MotorConfig {
    /// A motor is configured once the host (or calibration) has pushed a
    /// resistance and a torque constant. Closed-loop modes refuse to start
    /// before that.
    pub fn is_configured(&self) -> bool {
        self.pole_pairs > 0
            && self.phase_resistance_ohm > 0.0
            && self.torque_constant_nm_per_a > 0.0
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SupplyConfig {
    pub v_min: f32,
    pub v_max: f32,
    /// Hysteresis applied when a voltage fault condition clears.
    pub hysteresis_v: f32,
    /// Bus-voltage divider scale, volts per ADC count.
    pub vsense_adc_scale: f32,
    /// Phase-current scale, amps per ADC count.
    pub isense_adc_scale: f32,
}

impl Default for SupplyConfig {
    fn default() -> Self {
        Self {
            v_min: 10.0,
            v_max: 51.0,
            hysteresis_v: 0.2,
            vsense_adc_scale: 0.0133,
            isense_adc_scale: 0.0122,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ThermalConfig {
    /// FET temperature at which the controller faults.
    pub fet_max_c: f32,
    /// Motor temperature at which the controller faults (if sensed).
    pub motor_max_c: f32,
    /// Width of the linear torque-derate band below each cutoff.
    pub derate_band_c: f32,
    /// Single-pole IIR cutoff for temperature and bus-voltage filtering.
    pub filter_cutoff_hz: f32,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            fet_max_c: 75.0,
            motor_max_c: 100.0,
            derate_band_c: 10.0,
            filter_cutoff_hz: 10.0,
        }
    }
}

/// What a position source measures through its gearing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum SourceReference {
    Rotor,
    Output,
}

/// Which hardware a position source slot is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum SourceKind {
    /// On-board SPI magnetic encoder (AS5047 / MA732), sampled in the ISR.
    OnboardSpi,
    /// External SPI encoder, sampled in the ISR.
    ExternalSpi,
    /// RLS AkSIM-2 over UART.
    UartAksim2,
    /// CUI AMT21 over RS-485 half-duplex UART.
    UartAmt21,
    /// AMS AS5048B over I2C.
    I2cAs5048,
    /// AMS AS5600 over I2C.
    I2cAs5600,
    /// Quadrature decoded in software from two GPIO lines.
    QuadratureSoft,
    /// Quadrature counted by a hardware timer.
    QuadratureHard,
    /// Six-step hall sensors.
    Hall,
    /// Analog sin/cos pair.
    SinCos,
    /// Index pulse, position qualifier only.
    Index,
}

impl SourceKind {
    /// Bit width of the raw value this kind reports.
    pub const fn bits(&self) -> u8 {
        match self {
            Self::OnboardSpi | Self::ExternalSpi => 16,
            Self::UartAksim2 => 24,
            Self::UartAmt21 => 14,
            Self::I2cAs5048 => 14,
            Self::I2cAs5600 => 12,
            Self::QuadratureSoft | Self::QuadratureHard => 16,
            Self::Hall => 3,
            Self::SinCos => 16,
            Self::Index => 1,
        }
    }

    /// True for sources the ISR samples itself; everything else arrives
    /// through the background pollers.
    pub const fn sampled_in_isr(&self) -> bool {
        matches!(
            self,
            Self::OnboardSpi
                | Self::ExternalSpi
                | Self::QuadratureSoft
                | Self::QuadratureHard
                | Self::Hall
                | Self::SinCos
                | Self::Index
        )
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PositionSourceConfig {
    pub kind: SourceKind,
    /// Counts per revolution of whatever the source is attached to.
    pub cpr: u32,
    /// +1 or -1.
    pub sign: i8,
    pub reference: SourceReference,
    /// Fusion prefers this source when several measure the same frame.
    /// At most one source may carry the mark.
    pub primary: bool,
    /// Linearization offsets in turns, binned over one revolution.
    pub offset_table: [f32; OFFSET_BINS],
    /// PLL natural frequency in Hz.
    pub pll_bandwidth_hz: f32,
    /// When set, the raw value is replaced for bench debugging.
    pub debug_override: Option<u32>,
}

impl PositionSourceConfig {
    pub fn new(kind: SourceKind, cpr: u32, reference: SourceReference) -> Self {
        Self {
            kind,
            cpr,
            sign: 1,
            reference,
            primary: false,
            offset_table: [0.0; OFFSET_BINS],
            pll_bandwidth_hz: 100.0,
            debug_override: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.cpr > 0 && (self.sign == 1 || self.sign == -1) && self.pll_bandwidth_hz > 0.0
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PositionConfig {
    pub sources: [Option<PositionSourceConfig>; MAX_SOURCES],
    /// Rotor turns per output turn.
    pub gear_ratio: f32,
    /// Cycles of unchanged nonce before a source is marked inactive.
    pub nonce_stall_cycles: u8,
    /// Allowed disagreement between rotor sources, in turns.
    pub disagreement_tolerance: f32,
    /// Allowed gap between PLL prediction and fused measurement, in turns.
    pub tracking_tolerance: f32,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            sources: [None; MAX_SOURCES],
            gear_ratio: 1.0,
            nonce_stall_cycles: 8,
            disagreement_tolerance: 0.01,
            tracking_tolerance: 0.05,
        }
    }
}

impl PositionConfig {
    /// Number of sources carrying the fusion-reference mark.
    pub fn primary_count(&self) -> usize {
        self.sources.iter().flatten().filter(|s| s.primary).count()
    }

    pub fn is_valid(&self) -> bool {
        self.gear_ratio > 0.0
            && self.nonce_stall_cycles > 0
            && self.sources.iter().flatten().all(|s| s.is_valid())
            && self.primary_count() <= 1
    }
}

/// Position-loop PID gains and shaping.
#[derive(Clone, Copy, Debug)]
pub struct PositionPidConfig {
    /// Nm per turn of position error.
    pub kp: f32,
    /// Nm per turn/s of velocity error.
    pub kd: f32,
    /// Nm per turn-second of integrated error.
    pub ki: f32,
    /// Integrator magnitude clamp in Nm.
    pub ilimit: f32,
    /// Per-cycle integrator change clamp in Nm.
    pub int_rate_limit: f32,
    /// First-order slew applied to the commanded position, turns/s.
    pub max_desired_rate: f32,
}

impl Default for PositionPidConfig {
    fn default() -> Self {
        Self {
            kp: 4.0,
            kd: 0.1,
            ki: 0.0,
            ilimit: 0.0,
            int_rate_limit: 0.01,
            max_desired_rate: 0.0,
        }
    }
}

/// FOC current-loop PI gains. D and Q share gains unless split.
#[derive(Clone, Copy, Debug)]
pub struct CurrentPiConfig {
    /// V per A of current error.
    pub kp: f32,
    /// V per A-second of integrated error.
    pub ki: f32,
    /// Separate D-axis gains; `None` shares the Q-axis gains.
    pub d_axis: Option<(f32, f32)>,
}

impl Default for CurrentPiConfig {
    fn default() -> Self {
        Self {
            kp: 0.5,
            ki: 600.0,
            d_axis: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LimitsConfig {
    /// Hard torque ceiling regardless of command, Nm.
    pub max_torque_nm: f32,
    /// Velocity above which torque is cut, turns/s. Zero disables.
    pub max_velocity: f32,
    /// Phase-voltage ceiling for the torque clamp, V. At speed, back-EMF
    /// eats into this budget and the allowed torque shrinks. Zero
    /// disables.
    pub max_voltage: f32,
    /// Electrical power ceiling, W. Zero disables.
    pub max_power_w: f32,
    /// Output position bounds, turns. NaN disables a bound.
    pub position_min: f32,
    pub position_max: f32,
    /// Position-mode entry refuses targets further away than this, turns.
    /// Zero disables the check.
    pub start_limit: f32,
    /// Enables negative-Id field weakening above base speed.
    pub field_weakening: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_torque_nm: 1.0,
            max_velocity: 0.0,
            max_voltage: 0.0,
            max_power_w: 0.0,
            position_min: f32::NAN,
            position_max: f32::NAN,
            start_limit: 0.0,
            field_weakening: false,
        }
    }
}

/// Measured calibration state, pushed by the staged calibration modes or by
/// the host tooling. Written only outside closed-loop modes.
#[derive(Clone, Copy, Debug)]
pub struct Calibration {
    /// Zero-current ADC offsets per phase, in counts.
    pub current_offsets: [f32; 3],
    /// Commutation offset per electrical-angle bin, in electrical turns.
    pub commutation_offsets: [f32; COMMUTATION_BINS],
    pub valid: bool,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            current_offsets: [2048.0; 3],
            commutation_offsets: [0.0; COMMUTATION_BINS],
            valid: false,
        }
    }
}

/// Aggregate configuration consumed by the control cycle.
#[derive(Clone, Copy, Debug)]
pub struct ServoConfig {
    pub pwm: PwmConfig,
    pub motor: MotorConfig,
    pub supply: SupplyConfig,
    pub thermal: ThermalConfig,
    pub position: PositionConfig,
    pub position_pid: PositionPidConfig,
    pub current_pi: CurrentPiConfig,
    pub limits: LimitsConfig,
    pub calibration: Calibration,
    /// Default command watchdog in ms when a command does not carry one.
    pub default_watchdog_ms: u32,
    /// Additional timeout after ZeroVelocity demotion before Stopped, ms.
    pub watchdog_stop_ms: u32,
    /// Pre-driver enable settle time in control cycles.
    pub enable_delay_cycles: u32,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            pwm: PwmConfig::default(),
            motor: MotorConfig::default(),
            supply: SupplyConfig::default(),
            thermal: ThermalConfig::default(),
            position: PositionConfig::default(),
            position_pid: PositionPidConfig::default(),
            current_pi: CurrentPiConfig::default(),
            limits: LimitsConfig::default(),
            calibration: Calibration::default(),
            default_watchdog_ms: 0,
            watchdog_stop_ms: 800,
            enable_delay_cycles: 30,
        }
    }
}

impl ServoConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.pwm.is_valid() || !self.position.is_valid() {
            return Err(FaultCode::MotorNotConfigured);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pwm_in_range() {
        let pwm = PwmConfig::default();
        assert!(pwm.is_valid());
        assert!((pwm.period_s() - 1.0 / 30_000.0).abs() < 1e-9);
    }

    #[test]
    fn pwm_frequency_bounds() {
        let mut pwm = PwmConfig::default();
        pwm.frequency_hz = 14_999;
        assert!(!pwm.is_valid());
        pwm.frequency_hz = 60_000;
        assert!(pwm.is_valid());
    }

    #[test]
    fn motor_unconfigured_by_default() {
        assert!(!MotorConfig::default().is_configured());

        let motor = MotorConfig {
            phase_resistance_ohm: 0.08,
            torque_constant_nm_per_a: 0.05,
            ..MotorConfig::default()
        };
        assert!(motor.is_configured());
    }

    #[test]
    fn at_most_one_primary_source() {
        let mut pos = PositionConfig::default();
        let mut a =
            PositionSourceConfig::new(SourceKind::OnboardSpi, 1 << 14, SourceReference::Rotor);
        a.primary = true;
        let mut b =
            PositionSourceConfig::new(SourceKind::UartAksim2, 1 << 24, SourceReference::Rotor);
        b.primary = true;
        pos.sources[0] = Some(a);
        pos.sources[1] = Some(b);
        assert_eq!(pos.primary_count(), 2);
        assert!(!pos.is_valid());
    }

    #[test]
    fn source_cpr_must_be_positive() {
        let cfg = PositionSourceConfig::new(SourceKind::Hall, 0, SourceReference::Rotor);
        assert!(!cfg.is_valid());
    }

    #[test]
    fn isr_sampled_kinds() {
        assert!(SourceKind::OnboardSpi.sampled_in_isr());
        assert!(SourceKind::Hall.sampled_in_isr());
        assert!(!SourceKind::UartAmt21.sampled_in_isr());
        assert!(!SourceKind::I2cAs5600.sampled_in_isr());
    }
}
