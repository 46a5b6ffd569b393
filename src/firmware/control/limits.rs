/// Torque-command limiting.
///
/// Applied after the outer loop computes its raw torque and before the
/// inverse torque model produces Iq_ref. The limiter reports whether it
/// clipped anything so the outer-loop integrator can freeze.

use crate::firmware::config::{K_SVM, LimitsConfig, MotorConfig, ThermalConfig};
use crate::firmware::control::outer::flux_linkage;

/// Per-cycle measurements the limiter judges against.
#[derive(Clone, Copy, Debug, Default)]
pub struct LimitContext {
    pub output_position: f32,
    pub output_velocity: f32,
    /// Rotor electrical rate in rad/s, for the voltage headroom estimate.
    pub electrical_omega: f32,
    pub vbus: f32,
    pub fet_temp_c: f32,
    pub motor_temp_c: Option<f32>,
}

/// Linear derate from 1.0 at (cutoff - band) down to 0.0 at cutoff.
pub fn derate_factor(temp_c: f32, cutoff_c: f32, band_c: f32) -> f32 {
    if band_c <= 0.0 || temp_c <= cutoff_c - band_c {
        1.0
    } else if temp_c >= cutoff_c {
        0.0
    } else {
        (cutoff_c - temp_c) / band_c
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TorqueLimiter {
    limits: LimitsConfig,
    thermal: ThermalConfig,
    motor: MotorConfig,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LimitedTorque {
    pub torque: f32,
    /// True when any limit clipped the request.
    pub clamped: bool,
}

impl TorqueLimiter {
    pub fn new(limits: LimitsConfig, thermal: ThermalConfig, motor: MotorConfig) -> Self {
        Self {
            limits,
            thermal,
            motor,
        }
    }

    pub fn apply(&self, requested: f32, command_max: f32, ctx: &LimitContext) -> LimitedTorque {
        let mut torque = requested;

        // Voltage limit: at speed the back-EMF eats the drive budget, and
        // whatever phase voltage is left over the winding resistance bounds
        // the torque current.
        if self.limits.max_voltage > 0.0
            && self.motor.phase_resistance_ohm > 0.0
            && self.motor.torque_constant_nm_per_a > 0.0
        {
            let v_limit = self.limits.max_voltage.min(ctx.vbus * K_SVM);
            let lambda = flux_linkage(
                self.motor.torque_constant_nm_per_a,
                self.motor.pole_pairs,
            );
            let bemf = ctx.electrical_omega.abs() * lambda;
            let iq_available = ((v_limit - bemf) / self.motor.phase_resistance_ohm).max(0.0);
            let torque_cap = self.motor.torque_constant_nm_per_a * iq_available;
            torque = torque.clamp(-torque_cap, torque_cap);
        }

        // Hard ceiling: the lower of the configured and commanded maxima,
        // scaled by the thermal derate bands.
        let mut ceiling = self.limits.max_torque_nm.min(command_max);
        let mut derate = derate_factor(ctx.fet_temp_c, self.thermal.fet_max_c, self.thermal.derate_band_c);
        if let Some(motor_temp) = ctx.motor_temp_c {
            derate = derate.min(derate_factor(
                motor_temp,
                self.thermal.motor_max_c,
                self.thermal.derate_band_c,
            ));
        }
        ceiling *= derate;
        torque = torque.clamp(-ceiling, ceiling);

        // Velocity limit: outside the band only decelerating torque passes.
        if self.limits.max_velocity > 0.0 {
            if ctx.output_velocity > self.limits.max_velocity {
                torque = torque.min(0.0);
            } else if ctx.output_velocity < -self.limits.max_velocity {
                torque = torque.max(0.0);
            }
        }

        // Position bounds: torque may only point back into the window.
        // NaN bounds are disabled.
        if ctx.output_position > self.limits.position_max {
            torque = torque.min(0.0);
        }
        if ctx.output_position < self.limits.position_min {
            torque = torque.max(0.0);
        }

        // Mechanical power ceiling.
        if self.limits.max_power_w > 0.0 {
            let omega = ctx.output_velocity * core::f32::consts::TAU;
            let power = torque * omega;
            if power.abs() > self.limits.max_power_w && omega.abs() > 1e-3 {
                torque = if power > 0.0 {
                    self.limits.max_power_w / omega
                } else {
                    -self.limits.max_power_w / omega
                };
            }
        }

        LimitedTorque {
            torque,
            clamped: torque != requested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_motor() -> MotorConfig {
        MotorConfig {
            pole_pairs: 7,
            phase_resistance_ohm: 0.08,
            phase_inductance_h: 60e-6,
            torque_constant_nm_per_a: 0.05,
            ..MotorConfig::default()
        }
    }

    fn limiter(limits: LimitsConfig) -> TorqueLimiter {
        TorqueLimiter::new(limits, ThermalConfig::default(), test_motor())
    }

    #[test]
    fn passes_inside_all_limits() {
        let l = limiter(LimitsConfig::default());
        let ctx = LimitContext {
            fet_temp_c: 30.0,
            ..LimitContext::default()
        };
        let out = l.apply(0.5, 1.0, &ctx);
        assert_eq!(out.torque, 0.5);
        assert!(!out.clamped);
    }

    #[test]
    fn command_max_clamps() {
        let l = limiter(LimitsConfig::default());
        let ctx = LimitContext {
            fet_temp_c: 30.0,
            ..LimitContext::default()
        };
        let out = l.apply(0.9, 0.4, &ctx);
        assert_eq!(out.torque, 0.4);
        assert!(out.clamped);
    }

    #[test]
    fn thermal_derate_scales_to_zero() {
        let l = limiter(LimitsConfig::default());
        let thermal = ThermalConfig::default();

        let mid = LimitContext {
            fet_temp_c: thermal.fet_max_c - thermal.derate_band_c / 2.0,
            ..LimitContext::default()
        };
        let out = l.apply(1.0, 1.0, &mid);
        assert!((out.torque - 0.5).abs() < 1e-4);

        let hot = LimitContext {
            fet_temp_c: thermal.fet_max_c,
            ..LimitContext::default()
        };
        let out = l.apply(1.0, 1.0, &hot);
        assert_eq!(out.torque, 0.0);
    }

    #[test]
    fn overspeed_allows_only_deceleration() {
        let limits = LimitsConfig {
            max_velocity: 10.0,
            ..LimitsConfig::default()
        };
        let l = limiter(limits);
        let ctx = LimitContext {
            output_velocity: 12.0,
            fet_temp_c: 30.0,
            ..LimitContext::default()
        };
        assert_eq!(l.apply(0.5, 1.0, &ctx).torque, 0.0);
        assert!(l.apply(-0.5, 1.0, &ctx).torque < 0.0);
    }

    #[test]
    fn position_bound_blocks_outward_torque() {
        let limits = LimitsConfig {
            position_min: -1.0,
            position_max: 1.0,
            ..LimitsConfig::default()
        };
        let l = limiter(limits);
        let ctx = LimitContext {
            output_position: 1.5,
            fet_temp_c: 30.0,
            ..LimitContext::default()
        };
        assert_eq!(l.apply(0.5, 1.0, &ctx).torque, 0.0);
        assert!(l.apply(-0.5, 1.0, &ctx).torque < 0.0);
    }

    #[test]
    fn nan_position_bounds_disabled() {
        let l = limiter(LimitsConfig::default());
        let ctx = LimitContext {
            output_position: 1e6,
            fet_temp_c: 30.0,
            ..LimitContext::default()
        };
        let out = l.apply(0.5, 1.0, &ctx);
        assert_eq!(out.torque, 0.5);
    }

    #[test]
    fn power_limit_scales_torque() {
        let limits = LimitsConfig {
            max_power_w: 10.0,
            max_torque_nm: 100.0,
            ..LimitsConfig::default()
        };
        let l = limiter(limits);
        let ctx = LimitContext {
            output_velocity: 5.0,
            fet_temp_c: 30.0,
            ..LimitContext::default()
        };
        let out = l.apply(10.0, 100.0, &ctx);
        let power = out.torque * ctx.output_velocity * core::f32::consts::TAU;
        assert!((power - 10.0).abs() < 1e-3);
        assert!(out.clamped);
    }

    #[test]
    fn voltage_limit_inert_at_standstill() {
        let limits = LimitsConfig {
            max_voltage: 14.0,
            ..LimitsConfig::default()
        };
        let l = limiter(limits);
        let ctx = LimitContext {
            vbus: 24.0,
            fet_temp_c: 30.0,
            ..LimitContext::default()
        };
        // Full bus headroom over 80 mOhm: the cap is far above the
        // torque ceiling.
        let out = l.apply(0.8, 1.0, &ctx);
        assert_eq!(out.torque, 0.8);
    }

    #[test]
    fn voltage_limit_shrinks_with_speed() {
        let limits = LimitsConfig {
            max_voltage: 14.0,
            max_torque_nm: 10.0,
            ..LimitsConfig::default()
        };
        let l = limiter(limits);
        let motor = test_motor();
        let lambda = flux_linkage(motor.torque_constant_nm_per_a, motor.pole_pairs);

        // Speed where back-EMF uses all but 0.4 V of the ceiling.
        let v_limit = 14.0f32.min(24.0 * K_SVM);
        let omega = (v_limit - 0.4) / lambda;
        let ctx = LimitContext {
            vbus: 24.0,
            electrical_omega: omega,
            fet_temp_c: 30.0,
            ..LimitContext::default()
        };
        let expected = motor.torque_constant_nm_per_a * 0.4 / motor.phase_resistance_ohm;
        let out = l.apply(10.0, 10.0, &ctx);
        assert!((out.torque - expected).abs() < 1e-3, "{}", out.torque);
        assert!(out.clamped);
    }

    #[test]
    fn voltage_limit_zero_torque_past_base_speed() {
        let limits = LimitsConfig {
            max_voltage: 14.0,
            ..LimitsConfig::default()
        };
        let l = limiter(limits);
        let motor = test_motor();
        let lambda = flux_linkage(motor.torque_constant_nm_per_a, motor.pole_pairs);
        let ctx = LimitContext {
            vbus: 24.0,
            electrical_omega: 20.0 / lambda, // bemf far above the ceiling
            fet_temp_c: 30.0,
            ..LimitContext::default()
        };
        let out = l.apply(1.0, 1.0, &ctx);
        assert_eq!(out.torque, 0.0);
    }

    #[test]
    fn voltage_limit_capped_by_bus() {
        // A generous configured ceiling still cannot exceed what the bus
        // and the SVM region physically allow.
        let limits = LimitsConfig {
            max_voltage: 100.0,
            max_torque_nm: 1000.0,
            ..LimitsConfig::default()
        };
        let l = limiter(limits);
        let motor = test_motor();
        let ctx = LimitContext {
            vbus: 24.0,
            fet_temp_c: 30.0,
            ..LimitContext::default()
        };
        let cap = motor.torque_constant_nm_per_a * 24.0 * K_SVM / motor.phase_resistance_ohm;
        let out = l.apply(1e6, 1e6, &ctx);
        assert!((out.torque - cap).abs() < 1e-2);
    }
}
