/// System assembly: the hardware bag.
///
/// Everything peripheral-shaped is constructed exactly once here and
/// handed by value into the task that owns it. The control task runs on
/// its own interrupt executor so it preempts the thread-mode background
/// executor unconditionally; nothing else in the firmware takes an
/// interrupt priority.

use embassy_executor::{InterruptExecutor, Spawner};
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::gpio::{Input, Level, Output, Pull, Speed};
use embassy_stm32::interrupt;
use embassy_stm32::interrupt::{InterruptExt, Priority};
use embassy_stm32::i2c::{self, I2c};
use embassy_stm32::spi::{Config as SpiConfig, Spi};
use embassy_stm32::time::Hertz;
use embassy_stm32::timer::qei::{Qei, QeiPin};
use embassy_stm32::usart::{self, Uart};
use embassy_stm32::{Peripherals, bind_interrupts, peripherals};
use embassy_time::{Duration, Timer};

use crate::firmware::comms::registers::RegisterFile;
use crate::firmware::config::{
    PositionSourceConfig, ServoConfig, SourceKind, SourceReference,
};
use crate::firmware::control::ServoCore;
use crate::firmware::drivers::adc::InverterSense;
use crate::firmware::drivers::can::BusConfig;
use crate::firmware::drivers::flash_storage::ConfigStorage;
use crate::firmware::drivers::motor_driver::PreDriver;
use crate::firmware::drivers::pwm::InverterPwm;
use crate::firmware::drivers::status_leds::StatusLeds;
use crate::firmware::drivers::watchdog::Watchdog;
use crate::firmware::encoder::hall::HallDecoder;
use crate::firmware::encoder::i2c::{I2cDevice, I2cEncoder};
use crate::firmware::encoder::quadrature::{HardQuadrature, SoftQuadrature};
use crate::firmware::encoder::sincos::SinCosDecoder;
use crate::firmware::encoder::spi_magnetic::{SpiEncoder, SpiVariant};
use crate::firmware::encoder::uart::{UartDevice, UartEncoder};
use crate::firmware::hardware::profile::HardwareProfile;
use crate::firmware::identity::Identity;
use crate::firmware::tasks;
use crate::firmware::tasks::control_loop::IsrSource;

static CONTROL_EXECUTOR: InterruptExecutor = InterruptExecutor::new();

#[interrupt]
unsafe fn TIM1_UP_TIM16() {
    unsafe { CONTROL_EXECUTOR.on_interrupt() }
}

bind_interrupts!(struct UsartIrqs {
    USART3 => usart::InterruptHandler<peripherals::USART3>;
});

bind_interrupts!(struct EncoderBusIrqs {
    USART1 => usart::InterruptHandler<peripherals::USART1>;
    I2C1_EV => i2c::EventInterruptHandler<peripherals::I2C1>;
    I2C1_ER => i2c::ErrorInterruptHandler<peripherals::I2C1>;
});

/// Default configuration for a board that has not been provisioned yet:
/// the on-board magnetic encoder as the only, primary rotor source.
fn default_config(profile: &HardwareProfile) -> ServoConfig {
    let mut config = ServoConfig::default();
    config.supply.vsense_adc_scale = profile.vsense_adc_scale;
    config.supply.isense_adc_scale = profile.isense_adc_scale;
    let mut onboard =
        PositionSourceConfig::new(SourceKind::OnboardSpi, 1 << 16, SourceReference::Rotor);
    onboard.primary = true;
    config.position.sources[0] = Some(onboard);
    config
}

pub async fn initialize(spawner: Spawner, p: Peripherals) -> ! {
    // DWT cycle counter backs the per-cycle timing measurement.
    if let Some(mut cp) = cortex_m::Peripherals::take() {
        cp.DCB.enable_trace();
        cp.DWT.enable_cycle_counter();
    }

    let profile = HardwareProfile::g4_servo_r3();
    let identity = Identity::read(&profile);
    identity.log();

    let mut storage = ConfigStorage::new(p.FLASH);
    let config = match storage.load(default_config(&profile)) {
        Ok(config) => {
            defmt::info!("configuration loaded from flash");
            config
        }
        Err(_) => {
            defmt::info!("no stored configuration, using defaults");
            default_config(&profile)
        }
    };
    if let Err(code) = config.validate() {
        defmt::warn!("stored configuration invalid: {}", code);
    }

    *tasks::REGISTERS.lock().await = Some(RegisterFile::new(config));

    // Inverter and sensing. The sin/cos aux channels ride the injected
    // chain only when slot 0 is configured for that source.
    let slot0 = config.position.sources[0];
    let slot0_kind = slot0.map(|s| s.kind);
    let pwm = InverterPwm::new(
        p.TIM1, p.PA8, p.PC13, p.PA9, p.PB14, p.PA10, p.PB15, &config.pwm,
    );
    let sincos_pins = if matches!(slot0_kind, Some(SourceKind::SinCos)) {
        Some((p.PB11, p.PB12))
    } else {
        None
    };
    let sense = InverterSense::new(
        p.ADC1, p.DMA2_CH1, p.PA0, p.PA1, p.PA2, p.PA3, p.PB0, None, sincos_pins,
    );
    let driver = PreDriver::new(p.PC6, p.PC7, p.PC8);

    // The ISR-sampled source in slot 0. Exactly one of the alternatives
    // is wired; every unused peripheral stays untouched.
    let isr_source = match slot0 {
        None => None,
        Some(source) => match source.kind {
            SourceKind::OnboardSpi => {
                let mut spi_config = SpiConfig::default();
                spi_config.frequency = Hertz(8_000_000);
                let spi = Spi::new_blocking(p.SPI1, p.PA5, p.PA7, p.PA6, spi_config);
                let cs = Output::new(p.PB2, Level::High, Speed::VeryHigh);
                Some(IsrSource::Spi(SpiEncoder::new(spi, cs, SpiVariant::As5047)))
            }
            SourceKind::ExternalSpi => {
                let mut spi_config = SpiConfig::default();
                spi_config.frequency = Hertz(8_000_000);
                let spi = Spi::new_blocking(p.SPI3, p.PB3, p.PB5, p.PB4, spi_config);
                let cs = Output::new(p.PA15, Level::High, Speed::VeryHigh);
                Some(IsrSource::Spi(SpiEncoder::new(spi, cs, SpiVariant::Ma732)))
            }
            SourceKind::Hall => Some(IsrSource::Hall {
                lines: [
                    Input::new(p.PC1, Pull::Up),
                    Input::new(p.PC2, Pull::Up),
                    Input::new(p.PC3, Pull::Up),
                ],
                decoder: HallDecoder::new(0, source.cpr),
            }),
            SourceKind::QuadratureSoft => Some(IsrSource::SoftQuad {
                a: Input::new(p.PC1, Pull::Up),
                b: Input::new(p.PC2, Pull::Up),
                decoder: SoftQuadrature::new(source.cpr),
            }),
            SourceKind::QuadratureHard => Some(IsrSource::HardQuad {
                counter: Qei::new(p.TIM4, QeiPin::new_ch1(p.PB6), QeiPin::new_ch2(p.PB7)),
                decoder: HardQuadrature::new(source.cpr),
            }),
            SourceKind::SinCos => Some(IsrSource::SinCos(SinCosDecoder::new(
                source.cpr, 2048.0, 2048.0, 200.0,
            ))),
            // Background-polled kinds belong in slots 1 and 2.
            _ => None,
        },
    };

    let index_pin = ExtiInput::new(p.PC0, p.EXTI0, Pull::Down);
    let leds = StatusLeds::new(p.PC9, p.PD2);
    let watchdog = Watchdog::new(p.IWDG);

    // Control task on its own executor, above everything thread-mode.
    let core = ServoCore::new(config);
    interrupt::TIM1_UP_TIM16.set_priority(Priority::P2);
    let control_spawner = CONTROL_EXECUTOR.start(interrupt::TIM1_UP_TIM16);
    control_spawner
        .spawn(tasks::control_loop::control_loop(
            core,
            pwm,
            sense,
            driver,
            isr_source,
        ))
        .ok();

    // Background services.
    spawner
        .spawn(tasks::background::housekeeping(watchdog, storage))
        .ok();
    spawner
        .spawn(tasks::can_comm::can_server(
            p.FDCAN1,
            p.PA11,
            p.PA12,
            BusConfig::default(),
        ))
        .ok();
    spawner.spawn(tasks::background::index_watch(index_pin)).ok();
    spawner.spawn(tasks::background::status_leds(leds)).ok();

    match Uart::new(
        p.USART3,
        p.PC11,
        p.PC10,
        UsartIrqs,
        p.DMA1_CH1,
        p.DMA1_CH2,
        usart::Config::default(),
    ) {
        Ok(console_uart) => {
            spawner.spawn(tasks::console::console(console_uart)).ok();
        }
        Err(_) => defmt::warn!("console UART unavailable"),
    }

    // Background-polled sources: slot 1 owns the encoder UART, slot 2 the
    // encoder I2C bus, when the configuration binds them.
    if let Some(source) = config.position.sources[1] {
        if !source.kind.sampled_in_isr() {
            let device = match source.kind {
                SourceKind::UartAmt21 => UartDevice::Amt21 { address: 0x54 },
                _ => UartDevice::Aksim2,
            };
            match Uart::new(
                p.USART1,
                p.PC5,
                p.PC4,
                EncoderBusIrqs,
                p.DMA1_CH3,
                p.DMA1_CH4,
                usart::Config::default(),
            ) {
                Ok(uart) => {
                    let encoder = UartEncoder::new(
                        uart,
                        device,
                        Duration::from_micros(500),
                        &tasks::SOURCE_SLOTS[1],
                    );
                    spawner.spawn(tasks::background::uart_encoder(encoder)).ok();
                }
                Err(_) => defmt::warn!("encoder UART unavailable"),
            }
        }
    }
    if let Some(source) = config.position.sources[2] {
        if !source.kind.sampled_in_isr() {
            let device = match source.kind {
                SourceKind::I2cAs5600 => I2cDevice::As5600,
                _ => I2cDevice::As5048,
            };
            let mut i2c_config = i2c::Config::default();
            i2c_config.frequency = Hertz(400_000);
            let i2c = I2c::new(
                p.I2C1,
                p.PB8,
                p.PB9,
                EncoderBusIrqs,
                p.DMA1_CH5,
                p.DMA1_CH6,
                i2c_config,
            );
            let encoder = I2cEncoder::new(
                i2c,
                device,
                Duration::from_micros(1000),
                &tasks::SOURCE_SLOTS[2],
            );
            spawner.spawn(tasks::background::i2c_encoder(encoder)).ok();
        }
    }

    defmt::info!("system ready");

    loop {
        Timer::after(Duration::from_secs(10)).await;
    }
}
