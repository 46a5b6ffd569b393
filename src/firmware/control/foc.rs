/// Field-oriented current loop.
///
/// Runs once per PWM period inside the control cycle: Clarke/Park the
/// measured phase currents, PI the d/q errors, clamp the voltage vector to
/// the linear SVPWM region with d-axis priority, transform back and write
/// duties. The whole path is straight-line arithmetic; nothing here
/// branches on time or blocks.

use crate::firmware::config::{CurrentPiConfig, K_SVM, PwmConfig, SYSCLK_HZ};

/// Clarke transform, amplitude-invariant form.
pub fn clarke(a: f32, b: f32, c: f32) -> (f32, f32) {
    ((2.0 * a - b - c) / 3.0, (b - c) / 1.732_050_8)
}

/// Inverse Clarke: (alpha, beta) to phase quantities.
pub fn inverse_clarke(alpha: f32, beta: f32) -> (f32, f32, f32) {
    let a = alpha;
    let b = -0.5 * alpha + 0.866_025_4 * beta;
    let c = -0.5 * alpha - 0.866_025_4 * beta;
    (a, b, c)
}

/// Park rotation into the rotor frame.
pub fn park(alpha: f32, beta: f32, sin: f32, cos: f32) -> (f32, f32) {
    (cos * alpha + sin * beta, cos * beta - sin * alpha)
}

/// Inverse Park rotation back to the stator frame.
pub fn inverse_park(d: f32, q: f32, sin: f32, cos: f32) -> (f32, f32) {
    (cos * d - sin * q, sin * d + cos * q)
}

/// Everything the loop needs for one cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct FocInputs {
    /// Phase currents in amps, offset-corrected, unfiltered.
    pub currents: [f32; 3],
    pub vbus: f32,
    /// sin/cos of the electrical angle.
    pub sin: f32,
    pub cos: f32,
    pub id_ref: f32,
    pub iq_ref: f32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FocOutputs {
    pub id: f32,
    pub iq: f32,
    pub vd: f32,
    pub vq: f32,
    /// Commanded duties in [min_duty, max_duty].
    pub duties: [f32; 3],
}

pub struct CurrentLoop {
    kp_d: f32,
    ki_d: f32,
    kp_q: f32,
    ki_q: f32,
    dt: f32,
    min_duty: f32,
    max_duty: f32,
    /// Fraction of the period lost to dead time, for compensation.
    deadtime_fraction: f32,
    integral_d: f32,
    integral_q: f32,
}

impl CurrentLoop {
    pub fn new(pi: &CurrentPiConfig, pwm: &PwmConfig) -> Self {
        let (kp_d, ki_d) = pi.d_axis.unwrap_or((pi.kp, pi.ki));
        let ticks_per_period = SYSCLK_HZ / pwm.frequency_hz;
        Self {
            kp_d,
            ki_d,
            kp_q: pi.kp,
            ki_q: pi.ki,
            dt: pwm.period_s(),
            min_duty: pwm.min_duty,
            max_duty: pwm.max_duty,
            deadtime_fraction: pwm.deadtime_ticks as f32 / ticks_per_period as f32,
            integral_d: 0.0,
            integral_q: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.integral_d = 0.0;
        self.integral_q = 0.0;
    }

    /// One current-loop iteration. ISR context.
    pub fn update(&mut self, input: &FocInputs) -> FocOutputs {
        let [ia, ib, ic] = input.currents;
        let (i_alpha, i_beta) = clarke(ia, ib, ic);
        let (id, iq) = park(i_alpha, i_beta, input.sin, input.cos);

        let error_d = input.id_ref - id;
        let error_q = input.iq_ref - iq;

        let vd_unclamped = self.kp_d * error_d + self.integral_d;
        let vq_unclamped = self.kp_q * error_q + self.integral_q;

        // Clamp the voltage vector to the linear region, d axis first: at
        // high speed the d voltage holds the field and must not be traded
        // away for torque.
        let v_limit = input.vbus * K_SVM;
        let vd = vd_unclamped.clamp(-v_limit, v_limit);
        let headroom = libm::sqrtf((v_limit * v_limit - vd * vd).max(0.0));
        let vq = vq_unclamped.clamp(-headroom, headroom);

        // Conditional integration per axis: hold the integrator only while
        // that axis is clamped and the error keeps pushing into the clamp.
        let d_saturated = vd != vd_unclamped;
        if !(d_saturated && error_d * vd_unclamped > 0.0) {
            self.integral_d += self.ki_d * error_d * self.dt;
        }
        let q_saturated = vq != vq_unclamped;
        if !(q_saturated && error_q * vq_unclamped > 0.0) {
            self.integral_q += self.ki_q * error_q * self.dt;
        }

        let (v_alpha, v_beta) = inverse_park(vd, vq, input.sin, input.cos);
        let (mut va, mut vb, mut vc) = inverse_clarke(v_alpha, v_beta);

        // Dead-time compensation: each phase loses deadtime_fraction of the
        // bus in the direction its current flows through the body diodes.
        let comp = self.deadtime_fraction * input.vbus;
        va += comp * sign(ia);
        vb += comp * sign(ib);
        vc += comp * sign(ic);

        let duties = self.modulate(va, vb, vc, input.vbus);

        FocOutputs {
            id,
            iq,
            vd,
            vq,
            duties,
        }
    }

    /// Min/max common-mode injection, then duty conversion and clamping.
    /// Also used directly by the open-loop voltage modes.
    pub fn modulate(&self, va: f32, vb: f32, vc: f32, vbus: f32) -> [f32; 3] {
        if vbus <= 0.0 {
            return [self.min_duty; 3];
        }
        let v_min = va.min(vb).min(vc);
        let v_max = va.max(vb).max(vc);
        // Shift so that min + max = vbus, centering the active vectors.
        let shift = (vbus - v_min - v_max) * 0.5;
        [
            ((va + shift) / vbus).clamp(self.min_duty, self.max_duty),
            ((vb + shift) / vbus).clamp(self.min_duty, self.max_duty),
            ((vc + shift) / vbus).clamp(self.min_duty, self.max_duty),
        ]
    }
}

fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loop_under_test() -> CurrentLoop {
        CurrentLoop::new(&CurrentPiConfig::default(), &PwmConfig::default())
    }

    fn inputs_at(theta: f32) -> FocInputs {
        FocInputs {
            currents: [0.0; 3],
            vbus: 24.0,
            sin: libm::sinf(theta),
            cos: libm::cosf(theta),
            id_ref: 0.0,
            iq_ref: 0.0,
        }
    }

    #[test]
    fn clarke_park_identity() {
        let mut theta = 0.0f32;
        while theta < core::f32::consts::TAU {
            let sin = libm::sinf(theta);
            let cos = libm::cosf(theta);
            for (d, q) in [(1.0, 0.0), (0.0, 1.0), (0.3, -0.7), (-1.2, 0.4)] {
                let (alpha, beta) = inverse_park(d, q, sin, cos);
                let (d2, q2) = park(alpha, beta, sin, cos);
                assert!((d - d2).abs() < 1e-5);
                assert!((q - q2).abs() < 1e-5);

                let (a, b, c) = inverse_clarke(alpha, beta);
                let (alpha2, beta2) = park(a, b, sin, cos);
                let _ = (alpha2, beta2);
                let (alpha3, beta3) = clarke(a, b, c);
                assert!((alpha - alpha3).abs() < 1e-5);
                assert!((beta - beta3).abs() < 1e-5);
            }
            theta += 0.173;
        }
    }

    #[test]
    fn balanced_currents_sum_to_zero_in_clarke() {
        let (alpha, beta) = clarke(2.0, -1.0, -1.0);
        assert!((alpha - 2.0).abs() < 1e-5);
        assert!(beta.abs() < 1e-5);
    }

    #[test]
    fn duties_always_inside_limits() {
        let mut current_loop = loop_under_test();
        let pwm = PwmConfig::default();
        for step in 0..500 {
            let theta = step as f32 * 0.07;
            let mut input = inputs_at(theta);
            input.iq_ref = if step % 2 == 0 { 40.0 } else { -40.0 };
            input.id_ref = -10.0;
            input.currents = [libm::sinf(theta) * 5.0, -2.0, 1.0];
            let out = current_loop.update(&input);
            for duty in out.duties {
                assert!(duty >= pwm.min_duty - 1e-6, "{duty}");
                assert!(duty <= pwm.max_duty + 1e-6, "{duty}");
            }
        }
    }

    #[test]
    fn voltage_vector_respects_svm_limit() {
        let mut current_loop = loop_under_test();
        let mut input = inputs_at(0.4);
        input.iq_ref = 1000.0; // force deep saturation
        for _ in 0..100 {
            let out = current_loop.update(&input);
            let magnitude = libm::sqrtf(out.vd * out.vd + out.vq * out.vq);
            assert!(magnitude <= input.vbus * K_SVM + 1e-3);
        }
    }

    #[test]
    fn integrator_frozen_while_saturated() {
        let mut current_loop = loop_under_test();
        let mut input = inputs_at(0.0);
        input.iq_ref = 1000.0;
        for _ in 0..200 {
            current_loop.update(&input);
        }
        let frozen = current_loop.integral_q;
        for _ in 0..200 {
            current_loop.update(&input);
        }
        // Saturated with the error still pushing in: no further growth.
        assert!((current_loop.integral_q - frozen).abs() < 1e-3);
    }

    #[test]
    fn integrator_recovers_when_error_reverses() {
        let mut current_loop = loop_under_test();
        let mut input = inputs_at(0.0);
        input.iq_ref = 1000.0;
        for _ in 0..100 {
            current_loop.update(&input);
        }
        input.iq_ref = -10.0;
        input.currents = [0.0; 3];
        let before = current_loop.integral_q;
        current_loop.update(&input);
        // Error reversed: integration resumes immediately.
        assert!(current_loop.integral_q < before);
    }

    #[test]
    fn svpwm_centers_zero_vector() {
        let mut current_loop = loop_under_test();
        let input = inputs_at(1.0);
        current_loop.reset();
        let out = current_loop.update(&input);
        // Zero demand: all duties near 50 %.
        for duty in out.duties {
            assert!((duty - 0.5).abs() < 0.05, "{duty}");
        }
    }

    #[test]
    fn min_plus_max_injection_property() {
        // For any unclamped modulation, min + max duty must equal 1.
        let current_loop = loop_under_test();
        let duties = current_loop.modulate(3.0, -1.0, 0.5, 24.0);
        let min = duties.iter().cloned().fold(f32::MAX, f32::min);
        let max = duties.iter().cloned().fold(f32::MIN, f32::max);
        assert!((min + max - 1.0).abs() < 1e-5);
    }

    #[test]
    fn measured_currents_reported_in_dq() {
        let mut current_loop = loop_under_test();
        // Construct phase currents for a known (id, iq) at theta.
        let theta = 0.9f32;
        let sin = libm::sinf(theta);
        let cos = libm::cosf(theta);
        let (alpha, beta) = inverse_park(2.0, -3.0, sin, cos);
        let (a, b, c) = inverse_clarke(alpha, beta);
        let input = FocInputs {
            currents: [a, b, c],
            vbus: 24.0,
            sin,
            cos,
            id_ref: 0.0,
            iq_ref: 0.0,
        };
        let out = current_loop.update(&input);
        assert!((out.id - 2.0).abs() < 1e-4);
        assert!((out.iq + 3.0).abs() < 1e-4);
    }
}
