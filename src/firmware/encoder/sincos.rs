/// Analog sin/cos resolver-style input.
///
/// Two ADC channels carry a sine and cosine of the rotor angle around a
/// mid-scale offset. The decoder takes the pair sampled by the injected
/// conversion chain and produces counts over the configured CPR.

use libm::atan2f;

use super::{SampleBuilder, SourceSample};

pub struct SinCosDecoder {
    cpr: u32,
    /// Mid-scale ADC offsets for the two channels.
    offset_sin: f32,
    offset_cos: f32,
    /// Minimum vector magnitude in counts; below this the signal is
    /// considered disconnected.
    min_magnitude: f32,
    builder: SampleBuilder,
}

impl SinCosDecoder {
    pub fn new(cpr: u32, offset_sin: f32, offset_cos: f32, min_magnitude: f32) -> Self {
        Self {
            cpr,
            offset_sin,
            offset_cos,
            min_magnitude,
            builder: SampleBuilder::new(),
        }
    }

    /// Decode one sample pair. ISR context.
    pub fn isr_update(&mut self, sin_raw: u16, cos_raw: u16) -> SourceSample {
        let sin = sin_raw as f32 - self.offset_sin;
        let cos = cos_raw as f32 - self.offset_cos;
        if sin * sin + cos * cos < self.min_magnitude * self.min_magnitude {
            return self.builder.inactive();
        }
        let angle = atan2f(sin, cos);
        let turns = angle / (2.0 * core::f32::consts::PI);
        let wrapped = turns - libm::floorf(turns);
        let counts = (wrapped * self.cpr as f32) as u32 % self.cpr;
        self.builder.fresh(counts, 0)
    }
}
