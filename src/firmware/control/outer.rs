/// Outer position/velocity/torque loops.
///
/// One loop instance serves every closed-loop mode; the mode machine picks
/// which fields of the command it populates. Output is a raw torque in Nm,
/// which the limiter clips and the inverse torque model turns into Iq_ref.

use crate::firmware::config::PositionPidConfig;

/// Mode-specific setpoints for one cycle.
#[derive(Clone, Copy, Debug)]
pub struct OuterCommand {
    /// Target position in turns; NaN means velocity-only.
    pub position: f32,
    /// Target velocity in turns/s.
    pub velocity: f32,
    /// Feedforward torque in Nm.
    pub ff_torque: f32,
    pub kp_scale: f32,
    pub kd_scale: f32,
}

impl Default for OuterCommand {
    fn default() -> Self {
        Self {
            position: f32::NAN,
            velocity: 0.0,
            ff_torque: 0.0,
            kp_scale: 1.0,
            kd_scale: 1.0,
        }
    }
}

pub struct OuterLoop {
    cfg: PositionPidConfig,
    dt: f32,
    integral: f32,
    /// Rate-limited internal position target; NaN until seeded.
    desired_position: f32,
    /// Set when the previous cycle's torque was clipped by any limit.
    integrator_frozen: bool,
}

impl OuterLoop {
    pub fn new(cfg: PositionPidConfig, dt: f32) -> Self {
        Self {
            cfg,
            dt,
            integral: 0.0,
            desired_position: f32::NAN,
            integrator_frozen: false,
        }
    }

    /// Re-arm for mode entry at the measured position.
    pub fn reset(&mut self, measured_position: f32) {
        self.integral = 0.0;
        self.desired_position = measured_position;
        self.integrator_frozen = false;
    }

    /// Replace the gains; the integrator survives only if ki is unchanged.
    pub fn set_gains(&mut self, cfg: PositionPidConfig) {
        if cfg.ki != self.cfg.ki {
            self.integral = 0.0;
        }
        self.cfg = cfg;
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    /// The limiter reports back after each cycle; a clipped torque freezes
    /// integration on the next one.
    pub fn notify_clamped(&mut self, clamped: bool) {
        self.integrator_frozen = clamped;
    }

    /// Where the rate limiter currently is, for hold-position entries.
    pub fn desired_position(&self) -> f32 {
        self.desired_position
    }

    /// One outer-loop iteration. Returns unclamped torque in Nm.
    pub fn update(&mut self, cmd: &OuterCommand, position: f32, velocity: f32) -> f32 {
        let position_error = if cmd.position.is_nan() {
            // Velocity-only: the internal target follows the measurement
            // so a later switch to position control starts error-free.
            self.desired_position = position;
            0.0
        } else {
            if self.desired_position.is_nan() {
                self.desired_position = position;
            }
            if self.cfg.max_desired_rate > 0.0 {
                let max_step = self.cfg.max_desired_rate * self.dt;
                let gap = cmd.position - self.desired_position;
                self.desired_position += gap.clamp(-max_step, max_step);
            } else {
                self.desired_position = cmd.position;
            }
            self.desired_position - position
        };

        let velocity_error = cmd.velocity - velocity;

        if self.cfg.ki > 0.0 && !self.integrator_frozen {
            let step = (self.cfg.ki * position_error * self.dt)
                .clamp(-self.cfg.int_rate_limit, self.cfg.int_rate_limit);
            self.integral = (self.integral + step).clamp(-self.cfg.ilimit, self.cfg.ilimit);
        }

        self.cfg.kp * cmd.kp_scale * position_error
            + self.cfg.kd * cmd.kd_scale * velocity_error
            + self.integral
            + cmd.ff_torque
    }

    /// Stay-within band: torque only when the measurement leaves [lo, hi],
    /// pulling back toward the violated bound; inside the band, coast with
    /// just the feedforward and damping terms.
    pub fn update_stay_within(
        &mut self,
        lo: f32,
        hi: f32,
        cmd: &OuterCommand,
        position: f32,
        velocity: f32,
    ) -> f32 {
        let target = if !lo.is_nan() && position < lo {
            lo
        } else if !hi.is_nan() && position > hi {
            hi
        } else {
            self.desired_position = position;
            let damping = self.cfg.kd * cmd.kd_scale * (0.0 - velocity);
            return cmd.ff_torque + damping;
        };
        let banded = OuterCommand {
            position: target,
            velocity: 0.0,
            ..*cmd
        };
        self.update(&banded, position, velocity)
    }
}

/// Field-weakening Id: negative d-axis current required to keep the
/// voltage vector inside `v_limit` at the present electrical speed.
/// `lambda` is the rotor flux linkage in V-s/rad.
pub fn field_weakening_id(
    electrical_omega: f32,
    v_limit: f32,
    lambda: f32,
    inductance_h: f32,
) -> f32 {
    let speed = electrical_omega.abs();
    if speed < 1.0 || inductance_h <= 0.0 {
        return 0.0;
    }
    let bemf = speed * lambda;
    if bemf <= v_limit {
        return 0.0;
    }
    -((bemf - v_limit) / (speed * inductance_h))
}

/// Rotor flux linkage from the torque constant of a three-phase SPM motor.
pub fn flux_linkage(torque_constant: f32, pole_pairs: u8) -> f32 {
    if pole_pairs == 0 {
        return 0.0;
    }
    torque_constant / (1.5 * pole_pairs as f32)
}
