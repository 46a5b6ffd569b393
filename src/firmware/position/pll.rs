/// Second-order angle tracking loop.
///
/// Tracks a wrapped angle expressed in turns, producing a smoothed angle
/// and an angular-rate estimate. Gains derive once from the natural
/// frequency as (2*zeta*wn, wn^2) with zeta = 1, so bandwidth is the only
/// tuning knob a source exposes.

/// Wrap to [0, 1).
pub fn wrap_turns(x: f32) -> f32 {
    let wrapped = x - libm::floorf(x);
    // floorf(1.0 - epsilon) rounding can still yield exactly 1.0.
    if wrapped >= 1.0 { 0.0 } else { wrapped }
}

/// Shortest signed distance between two wrapped angles, in [-0.5, 0.5).
pub fn wrap_delta(x: f32) -> f32 {
    let wrapped = wrap_turns(x);
    if wrapped >= 0.5 { wrapped - 1.0 } else { wrapped }
}

#[derive(Clone, Copy, Debug)]
pub struct AnglePll {
    kp: f32,
    ki: f32,
    dt: f32,
    theta: f32,
    omega: f32,
    seeded: bool,
}

impl AnglePll {
    /// `bandwidth_hz` is the tracker natural frequency; `dt` the control
    /// period in seconds.
    pub fn new(bandwidth_hz: f32, dt: f32) -> Self {
        let wn = 2.0 * core::f32::consts::PI * bandwidth_hz;
        Self {
            kp: 2.0 * wn,
            ki: wn * wn,
            dt,
            theta: 0.0,
            omega: 0.0,
            seeded: false,
        }
    }

    /// Track a fresh measurement, in turns.
    pub fn update(&mut self, measured_turns: f32) {
        if !self.seeded {
            self.theta = wrap_turns(measured_turns);
            self.omega = 0.0;
            self.seeded = true;
            return;
        }
        let error = wrap_delta(measured_turns - self.theta);
        self.theta = wrap_turns(self.theta + (self.omega + self.kp * error) * self.dt);
        self.omega += self.ki * error * self.dt;
    }

    /// Propagate with no fresh measurement.
    pub fn predict(&mut self) {
        if self.seeded {
            self.theta = wrap_turns(self.theta + self.omega * self.dt);
        }
    }

    /// Discard tracking state; the next update re-seeds.
    pub fn reset(&mut self) {
        self.seeded = false;
        self.theta = 0.0;
        self.omega = 0.0;
    }

    /// Filtered angle in turns, [0, 1).
    pub fn theta(&self) -> f32 {
        self.theta
    }

    /// Estimated rate in turns/s.
    pub fn omega(&self) -> f32 {
        self.omega
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 1.0 / 30_000.0;

    #[test]
    fn wrap_helpers() {
        assert!((wrap_turns(1.25) - 0.25).abs() < 1e-6);
        assert!((wrap_turns(-0.25) - 0.75).abs() < 1e-6);
        assert!((wrap_delta(0.9) - -0.1).abs() < 1e-6);
        assert!((wrap_delta(0.1) - 0.1).abs() < 1e-6);
        assert_eq!(wrap_turns(0.0), 0.0);
    }

    #[test]
    fn first_sample_seeds_without_transient() {
        let mut pll = AnglePll::new(100.0, DT);
        pll.update(0.75);
        assert!((pll.theta() - 0.75).abs() < 1e-6);
        assert_eq!(pll.omega(), 0.0);
    }

    #[test]
    fn converges_to_constant_rate() {
        let mut pll = AnglePll::new(200.0, DT);
        let rate = 5.0; // turns/s
        let mut truth = 0.0f32;
        for _ in 0..30_000 {
            truth = wrap_turns(truth + rate * DT);
            pll.update(truth);
        }
        assert!((pll.omega() - rate).abs() < 0.05 * rate);
        assert!(wrap_delta(pll.theta() - truth).abs() < 0.001);
    }

    #[test]
    fn tracks_across_the_wrap() {
        let mut pll = AnglePll::new(200.0, DT);
        let mut truth = 0.999f32;
        pll.update(truth);
        for _ in 0..100 {
            truth = wrap_turns(truth + 0.0005);
            pll.update(truth);
        }
        // No full-turn glitch: tracked angle stays near truth.
        assert!(wrap_delta(pll.theta() - truth).abs() < 0.01);
    }

    #[test]
    fn predict_holds_rate() {
        let mut pll = AnglePll::new(100.0, DT);
        let mut truth = 0.0f32;
        for _ in 0..20_000 {
            truth = wrap_turns(truth + 1.0 * DT);
            pll.update(truth);
        }
        let theta_before = pll.theta();
        pll.predict();
        let expected = wrap_turns(theta_before + pll.omega() * DT);
        assert!(wrap_delta(pll.theta() - expected).abs() < 1e-6);
    }
}
