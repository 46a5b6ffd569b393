/// DRV8323 pre-driver control.
///
/// Hardware connections on the reference board:
/// - ENABLE (GPIO output): gate-driver enable, active high
/// - nFAULT (GPIO input): fault report, active low, open drain
/// - CAL (GPIO output): shunt-amplifier calibration mode, active high

use embassy_stm32::Peri;
use embassy_stm32::gpio::{Input, Level, Output, Pin, Pull, Speed};

pub struct PreDriver {
    enable: Output<'static>,
    fault: Input<'static>,
    cal: Output<'static>,
}

impl PreDriver {
    /// Initial state: disabled, amplifiers in normal mode.
    pub fn new(
        enable: Peri<'static, impl Pin>,
        fault: Peri<'static, impl Pin>,
        cal: Peri<'static, impl Pin>,
    ) -> Self {
        Self {
            enable: Output::new(enable, Level::Low, Speed::Medium),
            fault: Input::new(fault, Pull::Up),
            cal: Output::new(cal, Level::Low, Speed::Medium),
        }
    }

    /// Raise the enable line. The DRV8323 needs about 1 ms before the
    /// gate drivers are usable; the mode machine's Enabling state covers
    /// that with its cycle delay.
    pub fn enable(&mut self) {
        self.enable.set_high();
    }

    /// Drop the enable line; outputs go high impedance immediately.
    pub fn disable(&mut self) {
        self.enable.set_low();
    }

    pub fn is_enabled(&self) -> bool {
        self.enable.is_set_high()
    }

    /// True when nFAULT is asserted (overcurrent, gate fault, UVLO or
    /// thermal shutdown inside the pre-driver).
    pub fn is_fault(&self) -> bool {
        self.fault.is_low()
    }

    /// Put the current-sense amplifiers into calibration mode while the
    /// offset calibration sequence runs.
    pub fn set_amp_cal(&mut self, on: bool) {
        if on {
            self.cal.set_high();
        } else {
            self.cal.set_low();
        }
    }
}
