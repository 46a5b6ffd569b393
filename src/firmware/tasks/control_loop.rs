/// The PWM-synchronized control task.
///
/// Runs on the interrupt executor at TIM1-update priority, so it preempts
/// every background task unconditionally. One iteration per PWM period:
/// collect latched samples, run the `ServoCore` pipeline, write the
/// inverter, publish telemetry. No allocation, no locks, no logging in
/// the loop body.

use cortex_m::peripheral::DWT;
use embassy_stm32::gpio::Input;
use embassy_stm32::peripherals::TIM4;
use embassy_stm32::timer::qei::Qei;
use embassy_time::{Duration, Ticker};

use super::{ACTIVE_CONFIG, COMMAND_MAILBOX, INDEX_LATCH, SOURCE_SLOTS, TELEMETRY};
use crate::firmware::config::{MAX_SOURCES, SYSCLK_HZ};
use crate::firmware::control::{PwmCommand, ServoCore};
use crate::firmware::drivers::adc::InverterSense;
use crate::firmware::drivers::motor_driver::PreDriver;
use crate::firmware::drivers::pwm::InverterPwm;
use crate::firmware::encoder::SourceSample;
use crate::firmware::encoder::hall::HallDecoder;
use crate::firmware::encoder::quadrature::{HardQuadrature, SoftQuadrature};
use crate::firmware::encoder::sincos::SinCosDecoder;
use crate::firmware::encoder::spi_magnetic::SpiEncoder;
use crate::firmware::sampling::RawSamples;

/// The source the control cycle samples itself, in slot 0. One of these
/// exists per configured ISR-side kind; the background kinds never appear
/// here.
pub enum IsrSource {
    /// On-board or external SPI magnetic encoder.
    Spi(SpiEncoder),
    /// Three hall lines read as GPIO.
    Hall {
        lines: [Input<'static>; 3],
        decoder: HallDecoder,
    },
    /// Two quadrature lines decoded in software.
    SoftQuad {
        a: Input<'static>,
        b: Input<'static>,
        decoder: SoftQuadrature,
    },
    /// Hardware quadrature counter on TIM4.
    HardQuad {
        counter: Qei<'static, TIM4>,
        decoder: HardQuadrature,
    },
    /// Analog sin/cos pair from the injected conversion chain.
    SinCos(SinCosDecoder),
}

impl IsrSource {
    /// Sample once per control cycle. Constant-time.
    pub fn isr_sample(&mut self, raw: &RawSamples) -> SourceSample {
        match self {
            Self::Spi(encoder) => encoder.isr_sample(),
            Self::Hall { lines, decoder } => {
                let state = ((lines[2].is_high() as u8) << 2)
                    | ((lines[1].is_high() as u8) << 1)
                    | lines[0].is_high() as u8;
                decoder.isr_update(state)
            }
            Self::SoftQuad { a, b, decoder } => decoder.isr_update(a.is_high(), b.is_high()),
            Self::HardQuad { counter, decoder } => decoder.isr_update(counter.count()),
            Self::SinCos(decoder) => match raw.sincos {
                Some((sin, cos)) => decoder.isr_update(sin, cos),
                None => SourceSample::inactive(),
            },
        }
    }
}

#[embassy_executor::task]
pub async fn control_loop(
    mut core: ServoCore,
    mut pwm: InverterPwm,
    mut sense: InverterSense,
    mut driver: PreDriver,
    mut isr_source: Option<IsrSource>,
) -> ! {
    let period_us = 1_000_000 / core.config().pwm.frequency_hz as u64;
    let mut ticker = Ticker::every(Duration::from_micros(period_us));
    defmt::info!("control loop: {} us period", period_us);

    let mut mailbox_cursor = 0u32;
    let mut last_cycle_us = 0u16;
    let mut timestamp_us = 0u64;
    let mut cycle_count = 0u32;

    loop {
        ticker.next().await;
        let started = DWT::cycle_count();
        timestamp_us += period_us;
        cycle_count = cycle_count.wrapping_add(1);

        // Latched conversions first: the sin/cos source reads out of them.
        let raw = sense.read_latched().await;

        // Sources: slot 0 is sampled here, everything else comes out of
        // the background slots.
        let mut sources: [Option<SourceSample>; MAX_SOURCES] = [None; MAX_SOURCES];
        if let Some(source) = isr_source.as_mut() {
            sources[0] = Some(source.isr_sample(&raw));
        }
        for (i, slot) in SOURCE_SLOTS.iter().enumerate() {
            if sources[i].is_none() {
                sources[i] = slot.read();
            }
        }

        let index_seen = INDEX_LATCH.isr_sample(false);
        let driver_fault = driver.is_fault();
        let command = COMMAND_MAILBOX.take(&mut mailbox_cursor);

        let (request, snapshot) = core.cycle(
            &raw,
            &sources,
            index_seen,
            driver_fault,
            timestamp_us,
            last_cycle_us,
            command,
        );

        match request {
            PwmCommand::Disabled => {
                pwm.hi_z();
                driver.disable();
            }
            PwmCommand::EnableOnly => {
                pwm.hi_z();
                driver.enable();
            }
            PwmCommand::BrakeLow => {
                driver.enable();
                pwm.brake_low_sides();
            }
            PwmCommand::Duties(duties) => {
                driver.enable();
                pwm.write_duties(duties);
            }
        }

        // The active configuration mirrors out at a slow cadence so
        // calibration results become visible to the servers.
        if cycle_count % 4096 == 0 {
            ACTIVE_CONFIG.write(Some(*core.config()));
        }

        // Publication is the last store of the cycle.
        TELEMETRY.publish(snapshot);

        let elapsed = DWT::cycle_count().wrapping_sub(started);
        last_cycle_us = (elapsed / (SYSCLK_HZ / 1_000_000)) as u16;
    }
}
