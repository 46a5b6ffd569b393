/// Injected-conversion acquisition for the control cycle.
///
/// TIM1's update event triggers the injected sequence at the counter
/// valley, with all low sides conducting; by the time the control task
/// runs, the sample-and-hold results are latched and one DMA burst
/// collects them. Scaling to amps and volts happens in the sampling
/// pipeline, not here.
///
/// Channel map on the reference board:
/// - PA0/PA1/PA2: phase A/B/C shunt amplifiers
/// - PA3: bus-voltage divider
/// - PB0: FET thermistor divider
/// - PB1: motor thermistor divider (optional)
/// - PB11/PB12: analog sin/cos encoder pair (optional)

use embassy_stm32::Peri;
use embassy_stm32::adc::{Adc, AdcChannel, AnyAdcChannel, SampleTime};
use embassy_stm32::peripherals::{ADC1, DMA2_CH1};

use crate::firmware::sampling::RawSamples;

pub const ADC_SAMPLE_TIME: SampleTime = SampleTime::CYCLES12_5;

pub struct InverterSense {
    adc: Adc<'static, ADC1>,
    dma: Peri<'static, DMA2_CH1>,
    phase_a: AnyAdcChannel<ADC1>,
    phase_b: AnyAdcChannel<ADC1>,
    phase_c: AnyAdcChannel<ADC1>,
    vbus: AnyAdcChannel<ADC1>,
    fet_temp: AnyAdcChannel<ADC1>,
    motor_temp: Option<AnyAdcChannel<ADC1>>,
    sincos: Option<(AnyAdcChannel<ADC1>, AnyAdcChannel<ADC1>)>,
    buffer: [u16; 8],
}

impl InverterSense {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adc1: Peri<'static, ADC1>,
        dma: Peri<'static, DMA2_CH1>,
        phase_a: Peri<'static, embassy_stm32::peripherals::PA0>,
        phase_b: Peri<'static, embassy_stm32::peripherals::PA1>,
        phase_c: Peri<'static, embassy_stm32::peripherals::PA2>,
        vbus: Peri<'static, embassy_stm32::peripherals::PA3>,
        fet_temp: Peri<'static, embassy_stm32::peripherals::PB0>,
        motor_temp: Option<Peri<'static, embassy_stm32::peripherals::PB1>>,
        sincos: Option<(
            Peri<'static, embassy_stm32::peripherals::PB11>,
            Peri<'static, embassy_stm32::peripherals::PB12>,
        )>,
    ) -> Self {
        let adc = Adc::new(adc1);
        Self {
            adc,
            dma,
            phase_a: phase_a.degrade_adc(),
            phase_b: phase_b.degrade_adc(),
            phase_c: phase_c.degrade_adc(),
            vbus: vbus.degrade_adc(),
            fet_temp: fet_temp.degrade_adc(),
            motor_temp: motor_temp.map(|p| p.degrade_adc()),
            sincos: sincos.map(|(s, c)| (s.degrade_adc(), c.degrade_adc())),
            buffer: [0; 8],
        }
    }

    /// Collect this period's conversions.
    pub async fn read_latched(&mut self) -> RawSamples {
        let mut set: heapless::Vec<(&mut AnyAdcChannel<ADC1>, SampleTime), 8> = heapless::Vec::new();
        let _ = set.push((&mut self.phase_a, ADC_SAMPLE_TIME));
        let _ = set.push((&mut self.phase_b, ADC_SAMPLE_TIME));
        let _ = set.push((&mut self.phase_c, ADC_SAMPLE_TIME));
        let _ = set.push((&mut self.vbus, ADC_SAMPLE_TIME));
        let _ = set.push((&mut self.fet_temp, ADC_SAMPLE_TIME));
        let has_motor = self.motor_temp.is_some();
        if let Some(channel) = self.motor_temp.as_mut() {
            let _ = set.push((channel, ADC_SAMPLE_TIME));
        }
        let has_sincos = self.sincos.is_some();
        if let Some((sin, cos)) = self.sincos.as_mut() {
            let _ = set.push((sin, ADC_SAMPLE_TIME));
            let _ = set.push((cos, ADC_SAMPLE_TIME));
        }

        let count = set.len();
        self.adc
            .read(self.dma.reborrow(), set.into_iter(), &mut self.buffer[..count])
            .await;

        let mut next = 5;
        let motor_temp = if has_motor {
            let value = self.buffer[next];
            next += 1;
            Some(value)
        } else {
            None
        };
        let sincos = if has_sincos {
            Some((self.buffer[next], self.buffer[next + 1]))
        } else {
            None
        };

        RawSamples {
            phase_a: self.buffer[0],
            phase_b: self.buffer[1],
            phase_c: self.buffer[2],
            vbus: self.buffer[3],
            fet_temp: self.buffer[4],
            motor_temp,
            sincos,
        }
    }
}
