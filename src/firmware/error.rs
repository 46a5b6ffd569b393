/// Firmware-wide fault taxonomy.
///
/// Every error the controller can report travels as one of these codes,
/// whether it latched inside the control cycle or bubbled up from a
/// background peripheral transaction.

/// Fault and error codes.
///
/// The numeric value is stable: it is what the fault register reads back
/// and what status frames carry on the bus.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, defmt::Format)]
pub enum FaultCode {
    #[default]
    Success = 0,

    // === Peripheral transients (counted, retried) ===
    /// DMA stream transfer error.
    DmaStreamTransfer = 1,
    /// DMA stream FIFO error.
    DmaStreamFifo = 2,
    /// UART receiver overrun.
    UartOverrun = 3,
    /// UART framing error.
    UartFraming = 4,
    /// UART noise detected on the line.
    UartNoise = 5,
    /// UART software receive buffer overrun.
    UartBufferOverrun = 6,
    /// UART parity error.
    UartParity = 7,

    // === Latched faults (motor stops, cleared only by Stop) ===
    /// Calibration sequence failed or produced out-of-range results.
    CalibrationFault = 32,
    /// Pre-driver asserted its fault line.
    MotorDriverFault = 33,
    /// Bus voltage above the configured maximum.
    OverVoltage = 34,
    /// Bus voltage below the configured minimum.
    UnderVoltage = 35,
    /// All position sources inactive, or sources disagree beyond tolerance.
    EncoderFault = 36,
    /// Closed-loop mode requested before motor parameters were configured.
    MotorNotConfigured = 37,
    /// Control cycle failed to finish within its PWM period budget.
    PwmCycleOverrun = 38,
    /// FET or motor temperature above the configured cutoff.
    OverTemperature = 39,
    /// Position mode entered with the target further than start_limit away.
    StartOutsideLimit = 40,
    /// Configuration was written while a closed-loop mode was active.
    ConfigChanged = 41,
    /// Rotor electrical angle is not valid but the mode requires it.
    ThetaInvalid = 42,
    /// Output position is not valid but the mode requires it.
    PositionInvalid = 43,
    /// Pre-driver enable readback did not confirm within the enable delay.
    DriverEnableFault = 44,
    /// Control timing constraint violated outside the PWM budget check.
    TimingViolation = 45,
}

impl FaultCode {
    /// Transient codes are counted and retried by their source; they only
    /// escalate to a latched fault through the source-inactive path.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DmaStreamTransfer
                | Self::DmaStreamFifo
                | Self::UartOverrun
                | Self::UartFraming
                | Self::UartNoise
                | Self::UartBufferOverrun
                | Self::UartParity
        )
    }

    /// Latched codes force PWM off and pre-driver Hi-Z until an explicit
    /// Stop command clears them.
    pub const fn is_latching(&self) -> bool {
        !matches!(self, Self::Success) && !self.is_transient()
    }

    /// Check if this code requires the inverter to be shut down immediately.
    pub const fn requires_motor_stop(&self) -> bool {
        self.is_latching()
    }

    /// Get human-readable description.
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Success => "no fault",
            Self::DmaStreamTransfer => "DMA stream transfer error",
            Self::DmaStreamFifo => "DMA stream FIFO error",
            Self::UartOverrun => "UART overrun",
            Self::UartFraming => "UART framing error",
            Self::UartNoise => "UART noise",
            Self::UartBufferOverrun => "UART buffer overrun",
            Self::UartParity => "UART parity error",
            Self::CalibrationFault => "calibration fault",
            Self::MotorDriverFault => "motor driver fault",
            Self::OverVoltage => "over voltage",
            Self::UnderVoltage => "under voltage",
            Self::EncoderFault => "encoder fault",
            Self::MotorNotConfigured => "motor not configured",
            Self::PwmCycleOverrun => "PWM cycle overrun",
            Self::OverTemperature => "over temperature",
            Self::StartOutsideLimit => "start outside limit",
            Self::ConfigChanged => "config changed",
            Self::ThetaInvalid => "theta invalid",
            Self::PositionInvalid => "position invalid",
            Self::DriverEnableFault => "driver enable fault",
            Self::TimingViolation => "timing violation",
        }
    }

    pub fn from_register(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Success),
            1 => Some(Self::DmaStreamTransfer),
            2 => Some(Self::DmaStreamFifo),
            3 => Some(Self::UartOverrun),
            4 => Some(Self::UartFraming),
            5 => Some(Self::UartNoise),
            6 => Some(Self::UartBufferOverrun),
            7 => Some(Self::UartParity),
            32 => Some(Self::CalibrationFault),
            33 => Some(Self::MotorDriverFault),
            34 => Some(Self::OverVoltage),
            35 => Some(Self::UnderVoltage),
            36 => Some(Self::EncoderFault),
            37 => Some(Self::MotorNotConfigured),
            38 => Some(Self::PwmCycleOverrun),
            39 => Some(Self::OverTemperature),
            40 => Some(Self::StartOutsideLimit),
            41 => Some(Self::ConfigChanged),
            42 => Some(Self::ThetaInvalid),
            43 => Some(Self::PositionInvalid),
            44 => Some(Self::DriverEnableFault),
            45 => Some(Self::TimingViolation),
            _ => None,
        }
    }
}

/// Firmware result type (alias for convenience).
pub type Result<T> = core::result::Result<T, FaultCode>;

/// First-hit fault latch.
///
/// The control cycle reports conditions in priority order; the first
/// latching code sticks and later reports are ignored until `clear()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultLatch {
    code: FaultCode,
}

impl FaultLatch {
    pub const fn new() -> Self {
        Self {
            code: FaultCode::Success,
        }
    }

    /// Latch `code` if nothing is latched yet. Returns true when this call
    /// was the one that latched.
    pub fn raise(&mut self, code: FaultCode) -> bool {
        if !code.is_latching() || self.is_latched() {
            return false;
        }
        self.code = code;
        true
    }

    pub fn is_latched(&self) -> bool {
        self.code != FaultCode::Success
    }

    pub fn code(&self) -> FaultCode {
        self.code
    }

    /// Clear the latch. Only the Stop command path calls this, and only
    /// after the underlying condition has been rechecked.
    pub fn clear(&mut self) {
        self.code = FaultCode::Success;
    }
}
