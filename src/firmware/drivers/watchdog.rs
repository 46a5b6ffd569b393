/// Independent watchdog (IWDG).
///
/// Armed once at boot and fed by the background loop. A wedged firmware
/// resets instead of leaving the inverter free-running; the PWM outputs
/// default to high impedance out of reset, so a watchdog reset is a safe
/// stop.
///
/// Once started, the IWDG cannot be stopped.

use embassy_stm32::Peri;
use embassy_stm32::peripherals::IWDG;
use embassy_stm32::wdg::IndependentWatchdog;

/// Timeout generous enough for the slowest background iteration plus a
/// flash erase (the longest blocking operation we perform).
pub const WATCHDOG_TIMEOUT_US: u32 = 500_000;

pub struct Watchdog {
    iwdg: IndependentWatchdog<'static, IWDG>,
}

impl Watchdog {
    pub fn new(iwdg: Peri<'static, IWDG>) -> Self {
        let mut iwdg = IndependentWatchdog::new(iwdg, WATCHDOG_TIMEOUT_US);
        iwdg.unleash();
        defmt::info!("watchdog armed: {} us", WATCHDOG_TIMEOUT_US);
        Self { iwdg }
    }

    /// Reset the timeout. Called from the background loop, well inside
    /// half the timeout period.
    #[inline]
    pub fn feed(&mut self) {
        self.iwdg.pet();
    }
}
