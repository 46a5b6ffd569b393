/// Torque model.
///
/// Below the current cutoff, torque is linear in Iq through the torque
/// constant. Above it the rotor saturates and torque grows only
/// logarithmically; the model and its exact inverse share the same
/// breakpoint so commanded torque and reported torque round-trip. The
/// log2/exp2 pair uses the exponent-field decomposition with a short
/// mantissa polynomial, good to a few 1e-4 over the working range.

use crate::firmware::config::MotorConfig;

/// log2 via exponent extraction and a quartic fit of ln(mantissa) in [1, 2).
pub fn fast_log2(x: f32) -> f32 {
    debug_assert!(x > 0.0);
    let bits = x.to_bits();
    let exponent = ((bits >> 23) & 0xFF) as i32 - 127;
    let m = f32::from_bits((bits & 0x007F_FFFF) | 0x3F80_0000);
    let ln_m = -1.741_793_9
        + (2.821_202_6 + (-1.469_956_8 + (0.447_179_55 - 0.056_570_851 * m) * m) * m) * m;
    exponent as f32 + ln_m * core::f32::consts::LOG2_E
}

/// 2^x via integer exponent and a quartic of the fraction in [0, 1).
pub fn fast_exp2(x: f32) -> f32 {
    let n = libm::floorf(x);
    let f = x - n;
    let poly = 1.0
        + f * (0.693_147_18 + f * (0.240_226_51 + f * (0.055_504_11 + f * 0.009_618_13)));
    let scale = f32::from_bits(((n as i32 + 127) as u32) << 23);
    scale * poly
}

#[derive(Clone, Copy, Debug)]
pub struct TorqueModel {
    kt: f32,
    cutoff_a: f32,
    torque_scale: f32,
    current_scale: f32,
}

impl TorqueModel {
    pub fn new(motor: &MotorConfig) -> Self {
        Self {
            kt: motor.torque_constant_nm_per_a,
            cutoff_a: motor.current_cutoff_a,
            torque_scale: motor.torque_scale,
            current_scale: motor.current_scale,
        }
    }

    fn log_region_enabled(&self) -> bool {
        self.torque_scale > 0.0 && self.current_scale > 0.0 && self.cutoff_a > 0.0
    }

    /// Torque in Nm produced by a Q-axis current in amps.
    pub fn torque_from_current(&self, iq: f32) -> f32 {
        let magnitude = iq.abs();
        if !self.log_region_enabled() || magnitude <= self.cutoff_a {
            return self.kt * iq;
        }
        let excess = (magnitude - self.cutoff_a) * self.current_scale;
        let torque = self.kt * self.cutoff_a + self.torque_scale * fast_log2(1.0 + excess);
        if iq < 0.0 { -torque } else { torque }
    }

    /// Q-axis current in amps required for a torque in Nm.
    pub fn current_from_torque(&self, torque: f32) -> f32 {
        if self.kt <= 0.0 {
            return 0.0;
        }
        let magnitude = torque.abs();
        let knee = self.kt * self.cutoff_a;
        if !self.log_region_enabled() || magnitude <= knee {
            return torque / self.kt;
        }
        let excess = (fast_exp2((magnitude - knee) / self.torque_scale) - 1.0) / self.current_scale;
        let current = self.cutoff_a + excess;
        if torque < 0.0 { -current } else { current }
    }
}
