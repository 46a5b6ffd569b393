/// Safety and fault manager.
///
/// Runs inside the control cycle after position fusion and before the mode
/// dispatch. Conditions are evaluated in a fixed priority order and the
/// first hit latches; once latched the inverter is forced off and only an
/// explicit Stop, issued after the condition has cleared, releases it.

use crate::firmware::config::{SupplyConfig, ThermalConfig};
use crate::firmware::error::{FaultCode, FaultLatch};

/// Everything the checks look at, gathered once per cycle.
#[derive(Clone, Copy, Debug)]
pub struct SafetyInputs {
    /// Pre-driver nFAULT, already converted to active-high.
    pub driver_fault: bool,
    /// Filtered bus voltage.
    pub vbus: f32,
    pub fet_temp_c: f32,
    pub motor_temp_c: Option<f32>,
    /// The active mode depends on the rotor angle.
    pub theta_required: bool,
    pub rotor_valid: bool,
    /// Why the aggregator says the angle is not valid.
    pub rotor_fault: FaultCode,
    /// This cycle ran past its PWM-period budget.
    pub cycle_overrun: bool,
}

impl Default for SafetyInputs {
    fn default() -> Self {
        Self {
            driver_fault: false,
            vbus: 24.0,
            fet_temp_c: 25.0,
            motor_temp_c: None,
            theta_required: false,
            rotor_valid: true,
            rotor_fault: FaultCode::Success,
            cycle_overrun: false,
        }
    }
}

/// Threshold comparator with hysteresis: asserts crossing `threshold` in
/// the direction given by `rising`, releases only past the band.
#[derive(Clone, Copy, Debug)]
struct Hysteresis {
    threshold: f32,
    band: f32,
    rising: bool,
    asserted: bool,
}

impl Hysteresis {
    fn new(threshold: f32, band: f32, rising: bool) -> Self {
        Self {
            threshold,
            band,
            rising,
            asserted: false,
        }
    }

    fn update(&mut self, value: f32) -> bool {
        if self.rising {
            if value > self.threshold {
                self.asserted = true;
            } else if value < self.threshold - self.band {
                self.asserted = false;
            }
        } else {
            if value < self.threshold {
                self.asserted = true;
            } else if value > self.threshold + self.band {
                self.asserted = false;
            }
        }
        self.asserted
    }
}

pub struct SafetyManager {
    thermal: ThermalConfig,
    undervoltage: Hysteresis,
    overvoltage: Hysteresis,
    latch: FaultLatch,
}

impl SafetyManager {
    pub fn new(supply: &SupplyConfig, thermal: ThermalConfig) -> Self {
        Self {
            thermal,
            undervoltage: Hysteresis::new(supply.v_min, supply.hysteresis_v, false),
            overvoltage: Hysteresis::new(supply.v_max, supply.hysteresis_v, true),
            latch: FaultLatch::new(),
        }
    }

    pub fn fault(&self) -> FaultCode {
        self.latch.code()
    }

    pub fn is_latched(&self) -> bool {
        self.latch.is_latched()
    }

    /// The supply-rail condition alone, for mode-entry guards.
    pub fn supply_fault(&self) -> Option<FaultCode> {
        if self.undervoltage.asserted {
            Some(FaultCode::UnderVoltage)
        } else if self.overvoltage.asserted {
            Some(FaultCode::OverVoltage)
        } else {
            None
        }
    }

    /// Evaluate all conditions in priority order. Returns the code that
    /// latched this cycle, if any.
    pub fn check(&mut self, inputs: &SafetyInputs) -> Option<FaultCode> {
        // The comparators track every cycle so hysteresis state stays
        // current even while another fault holds the latch.
        let under = self.undervoltage.update(inputs.vbus);
        let over = self.overvoltage.update(inputs.vbus);

        // A position invalid because every source went dark is a distinct,
        // lower-priority condition than an angle the fusion cannot trust.
        let position_invalid = inputs.theta_required && !inputs.rotor_valid;
        let encoder_dark = position_invalid && inputs.rotor_fault == FaultCode::EncoderFault;

        let condition = if inputs.driver_fault {
            Some(FaultCode::MotorDriverFault)
        } else if under {
            Some(FaultCode::UnderVoltage)
        } else if over {
            Some(FaultCode::OverVoltage)
        } else if inputs.fet_temp_c > self.thermal.fet_max_c
            || inputs.motor_temp_c.is_some_and(|t| t > self.thermal.motor_max_c)
        {
            Some(FaultCode::OverTemperature)
        } else if position_invalid && !encoder_dark {
            Some(match inputs.rotor_fault {
                FaultCode::PositionInvalid => FaultCode::PositionInvalid,
                _ => FaultCode::ThetaInvalid,
            })
        } else if inputs.cycle_overrun {
            Some(FaultCode::PwmCycleOverrun)
        } else if encoder_dark {
            Some(FaultCode::EncoderFault)
        } else {
            None
        };

        let code = condition?;
        if self.latch.raise(code) {
            defmt::error!("fault latched: {}", code);
            return Some(code);
        }
        None
    }

    /// Latch a code found outside the per-cycle checks (config written
    /// mid-mode, failed mode entry).
    pub fn force(&mut self, code: FaultCode) {
        if self.latch.raise(code) {
            defmt::error!("fault latched: {}", code);
        }
    }

    /// Stop-command path: clear the latch. If the condition persists the
    /// very next cycle re-latches it, so no separate recheck is needed.
    pub fn clear(&mut self) {
        self.latch.clear();
    }
}
