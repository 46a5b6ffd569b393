/// Three-phase inverter PWM on TIM1.
///
/// Center-aligned complementary outputs with hardware dead time; the
/// timer update event (counter valley, all low sides conducting) triggers
/// the injected ADC chains, which is what keeps current sampling aligned
/// with the duty midpoint.

use embassy_stm32::Peri;
use embassy_stm32::gpio::OutputType;
use embassy_stm32::peripherals::TIM1;
use embassy_stm32::time::Hertz;
use embassy_stm32::timer::Channel;
use embassy_stm32::timer::complementary_pwm::{ComplementaryPwm, ComplementaryPwmPin};
use embassy_stm32::timer::low_level::CountingMode;
use embassy_stm32::timer::simple_pwm::PwmPin;

use crate::firmware::config::PwmConfig;

pub struct InverterPwm {
    pwm: ComplementaryPwm<'static, TIM1>,
    max_duty: u16,
}

impl InverterPwm {
    /// Bring up the three phase legs. Outputs start disabled.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tim1: Peri<'static, TIM1>,
        ch1: Peri<'static, embassy_stm32::peripherals::PA8>,
        ch1n: Peri<'static, embassy_stm32::peripherals::PC13>,
        ch2: Peri<'static, embassy_stm32::peripherals::PA9>,
        ch2n: Peri<'static, embassy_stm32::peripherals::PB14>,
        ch3: Peri<'static, embassy_stm32::peripherals::PA10>,
        ch3n: Peri<'static, embassy_stm32::peripherals::PB15>,
        config: &PwmConfig,
    ) -> Self {
        let ch1 = PwmPin::new(ch1, OutputType::PushPull);
        let ch1n = ComplementaryPwmPin::new(ch1n, OutputType::PushPull);
        let ch2 = PwmPin::new(ch2, OutputType::PushPull);
        let ch2n = ComplementaryPwmPin::new(ch2n, OutputType::PushPull);
        let ch3 = PwmPin::new(ch3, OutputType::PushPull);
        let ch3n = ComplementaryPwmPin::new(ch3n, OutputType::PushPull);

        let mut pwm = ComplementaryPwm::new(
            tim1,
            Some(ch1),
            Some(ch1n),
            Some(ch2),
            Some(ch2n),
            Some(ch3),
            Some(ch3n),
            None,
            None,
            Hertz(config.frequency_hz),
            CountingMode::CenterAlignedBothInterrupts,
        );
        pwm.set_dead_time(config.deadtime_ticks);

        let max_duty = pwm.get_max_duty();
        let mut this = Self { pwm, max_duty };
        this.hi_z();
        this
    }

    /// Write the three commanded duties, already clamped to [0, 1], and
    /// make sure the outputs are live. ISR context.
    pub fn write_duties(&mut self, duties: [f32; 3]) {
        let scale = self.max_duty as f32;
        for (channel, duty) in [Channel::Ch1, Channel::Ch2, Channel::Ch3]
            .into_iter()
            .zip(duties)
        {
            let counts = (duty.clamp(0.0, 1.0) * scale) as u16;
            self.pwm.set_duty(channel, counts.min(self.max_duty));
            self.pwm.enable(channel);
        }
    }

    /// Short the motor: zero duty on every leg leaves all low sides on.
    pub fn brake_low_sides(&mut self) {
        for channel in [Channel::Ch1, Channel::Ch2, Channel::Ch3] {
            self.pwm.set_duty(channel, 0);
            self.pwm.enable(channel);
        }
    }

    /// All outputs off; the motor coasts.
    pub fn hi_z(&mut self) {
        for channel in [Channel::Ch1, Channel::Ch2, Channel::Ch3] {
            self.pwm.disable(channel);
        }
    }

    pub fn max_duty(&self) -> u16 {
        self.max_duty
    }
}
