/// Current, voltage and temperature sampling.
///
/// The PWM timer triggers the injected conversion chains at the center of
/// the low-side pulse; by ISR entry the results are latched and this
/// pipeline turns raw counts into calibrated amps, volts and degrees for
/// the rest of the cycle. Phase currents feed FOC unfiltered to keep the
/// loop latency at one cycle; filtered copies exist for telemetry and
/// protection only.

use crate::firmware::config::{SupplyConfig, ThermalConfig};

/// Latched injected-conversion results for one PWM period.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawSamples {
    pub phase_a: u16,
    pub phase_b: u16,
    pub phase_c: u16,
    pub vbus: u16,
    pub fet_temp: u16,
    pub motor_temp: Option<u16>,
    /// Analog sin/cos encoder pair, when that source is fitted.
    pub sincos: Option<(u16, u16)>,
}

/// Calibrated per-cycle measurements.
#[derive(Clone, Copy, Debug, Default)]
pub struct CycleSamples {
    /// Phase currents in amps, offset-corrected, unfiltered.
    pub currents: [f32; 3],
    /// Low-passed copies for telemetry and protection.
    pub currents_filtered: [f32; 3],
    /// Filtered bus voltage in volts.
    pub vbus: f32,
    /// This cycle's unfiltered bus voltage.
    pub vbus_raw: f32,
    /// Filtered FET temperature in Celsius.
    pub fet_temp_c: f32,
    /// Filtered motor temperature, when the sensor is fitted.
    pub motor_temp_c: Option<f32>,
}

/// Single-pole IIR low-pass.
#[derive(Clone, Copy, Debug)]
pub struct LowPass {
    alpha: f32,
    state: f32,
    primed: bool,
}

impl LowPass {
    pub fn new(cutoff_hz: f32, dt: f32) -> Self {
        let rc = 1.0 / (2.0 * core::f32::consts::PI * cutoff_hz);
        Self {
            alpha: dt / (dt + rc),
            state: 0.0,
            primed: false,
        }
    }

    pub fn update(&mut self, x: f32) -> f32 {
        if !self.primed {
            self.primed = true;
            self.state = x;
        } else {
            self.state += self.alpha * (x - self.state);
        }
        self.state
    }

    pub fn value(&self) -> f32 {
        self.state
    }
}

/// Temperature sensor linear transfer: counts to millivolts to Celsius.
///
/// The STM32G4 internal sensor reads about 760 mV at 25 C with a 2.5 mV/C
/// slope; an external NTC stage is configured with its own pair.
pub fn temp_from_counts(raw: u16, v25_mv: f32, slope_mv_per_c: f32) -> f32 {
    let mv = raw as f32 * 3300.0 / 4096.0;
    (mv - v25_mv) / slope_mv_per_c + 25.0
}

pub const TEMP_V25_MV: f32 = 760.0;
pub const TEMP_SLOPE_MV_PER_C: f32 = 2.5;

/// Zero-current offset calibration: averages raw phase counts while the
/// bridge idles at 50 % duty.
#[derive(Clone, Copy, Debug)]
pub struct OffsetCalibrator {
    sums: [f32; 3],
    count: u32,
    target: u32,
}

impl OffsetCalibrator {
    pub fn new(target: u32) -> Self {
        Self {
            sums: [0.0; 3],
            count: 0,
            target,
        }
    }

    /// Accumulate one sample set; yields the mean offsets once done.
    pub fn push(&mut self, raw: &RawSamples) -> Option<[f32; 3]> {
        self.sums[0] += raw.phase_a as f32;
        self.sums[1] += raw.phase_b as f32;
        self.sums[2] += raw.phase_c as f32;
        self.count += 1;
        if self.count < self.target {
            return None;
        }
        let n = self.count as f32;
        Some([self.sums[0] / n, self.sums[1] / n, self.sums[2] / n])
    }
}

/// Per-cycle conversion pipeline.
pub struct SamplePipeline {
    offsets: [f32; 3],
    isense_scale: f32,
    vsense_scale: f32,
    current_filters: [LowPass; 3],
    vbus_filter: LowPass,
    fet_filter: LowPass,
    motor_filter: LowPass,
}

impl SamplePipeline {
    pub fn new(supply: &SupplyConfig, thermal: &ThermalConfig, offsets: [f32; 3], dt: f32) -> Self {
        let cutoff = thermal.filter_cutoff_hz;
        // Telemetry copies of the phase currents get a wider filter; they
        // only need to strip switching noise.
        let current_cutoff = 1_000.0;
        Self {
            offsets,
            isense_scale: supply.isense_adc_scale,
            vsense_scale: supply.vsense_adc_scale,
            current_filters: [
                LowPass::new(current_cutoff, dt),
                LowPass::new(current_cutoff, dt),
                LowPass::new(current_cutoff, dt),
            ],
            vbus_filter: LowPass::new(cutoff, dt),
            fet_filter: LowPass::new(cutoff, dt),
            motor_filter: LowPass::new(cutoff, dt),
        }
    }

    pub fn set_offsets(&mut self, offsets: [f32; 3]) {
        self.offsets = offsets;
    }

    pub fn offsets(&self) -> [f32; 3] {
        self.offsets
    }

    /// Convert one cycle's raw results. ISR context, constant time.
    pub fn convert(&mut self, raw: &RawSamples) -> CycleSamples {
        let currents = [
            (raw.phase_a as f32 - self.offsets[0]) * self.isense_scale,
            (raw.phase_b as f32 - self.offsets[1]) * self.isense_scale,
            (raw.phase_c as f32 - self.offsets[2]) * self.isense_scale,
        ];
        let currents_filtered = [
            self.current_filters[0].update(currents[0]),
            self.current_filters[1].update(currents[1]),
            self.current_filters[2].update(currents[2]),
        ];
        let vbus_raw = raw.vbus as f32 * self.vsense_scale;
        let vbus = self.vbus_filter.update(vbus_raw);
        let fet_temp_c = self.fet_filter.update(temp_from_counts(
            raw.fet_temp,
            TEMP_V25_MV,
            TEMP_SLOPE_MV_PER_C,
        ));
        let motor_temp_c = raw.motor_temp.map(|t| {
            self.motor_filter
                .update(temp_from_counts(t, TEMP_V25_MV, TEMP_SLOPE_MV_PER_C))
        });
        CycleSamples {
            currents,
            currents_filtered,
            vbus,
            vbus_raw,
            fet_temp_c,
            motor_temp_c,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 1.0 / 30_000.0;

    fn pipeline() -> SamplePipeline {
        SamplePipeline::new(
            &SupplyConfig::default(),
            &ThermalConfig::default(),
            [2048.0; 3],
            DT,
        )
    }

    #[test]
    fn zero_current_at_offset() {
        let mut p = pipeline();
        let raw = RawSamples {
            phase_a: 2048,
            phase_b: 2048,
            phase_c: 2048,
            vbus: 1800,
            fet_temp: 943,
            ..RawSamples::default()
        };
        let out = p.convert(&raw);
        for i in out.currents {
            assert!(i.abs() < 1e-3);
        }
    }

    #[test]
    fn current_sign_follows_counts() {
        let mut p = pipeline();
        let raw = RawSamples {
            phase_a: 2048 + 100,
            phase_b: 2048 - 100,
            phase_c: 2048,
            ..RawSamples::default()
        };
        let out = p.convert(&raw);
        assert!(out.currents[0] > 0.0);
        assert!(out.currents[1] < 0.0);
        assert!((out.currents[0] + out.currents[1]).abs() < 1e-3);
    }

    #[test]
    fn vbus_filter_settles() {
        let mut p = pipeline();
        let raw = RawSamples {
            vbus: 1800,
            ..RawSamples::default()
        };
        let mut out = p.convert(&raw);
        for _ in 0..20_000 {
            out = p.convert(&raw);
        }
        let expected = 1800.0 * SupplyConfig::default().vsense_adc_scale;
        assert!((out.vbus - expected).abs() < 0.05);
        assert!((out.vbus_raw - expected).abs() < 1e-3);
    }

    #[test]
    fn filtered_currents_lag_step() {
        let mut p = pipeline();
        let quiet = RawSamples {
            phase_a: 2048,
            phase_b: 2048,
            phase_c: 2048,
            ..RawSamples::default()
        };
        let _ = p.convert(&quiet); // prime the filters at zero current
        let step = RawSamples {
            phase_a: 4000,
            phase_b: 2048,
            phase_c: 2048,
            ..RawSamples::default()
        };
        let out = p.convert(&step);
        assert!(out.currents_filtered[0].abs() < out.currents[0].abs());
    }

    #[test]
    fn temp_conversion_at_25c() {
        // 760 mV -> 943 counts at 3.3 V full scale.
        let t = temp_from_counts(943, TEMP_V25_MV, TEMP_SLOPE_MV_PER_C);
        assert!((t - 25.0).abs() < 1.0);
    }

    #[test]
    fn offset_calibrator_means() {
        let mut cal = OffsetCalibrator::new(4);
        let mk = |a: u16| RawSamples {
            phase_a: a,
            phase_b: 2000,
            phase_c: 2100,
            ..RawSamples::default()
        };
        assert!(cal.push(&mk(2040)).is_none());
        assert!(cal.push(&mk(2050)).is_none());
        assert!(cal.push(&mk(2060)).is_none());
        let offsets = cal.push(&mk(2050)).unwrap();
        assert!((offsets[0] - 2050.0).abs() < 1e-3);
        assert!((offsets[1] - 2000.0).abs() < 1e-3);
        assert!((offsets[2] - 2100.0).abs() < 1e-3);
    }
}
