/// Cooperative background tasks.
///
/// Everything that is allowed to wait lives here: the encoder bus
/// pollers, the register-file housekeeping loop, the LED animation and
/// the hardware watchdog feed. All of it is preempted by the control
/// task.

use embassy_stm32::exti::ExtiInput;
use embassy_time::{Duration, Ticker, Timer};

use super::{ACTIVE_CONFIG, COMMAND_MAILBOX, INDEX_LATCH, REGISTERS, TELEMETRY};
use crate::firmware::drivers::flash_storage::ConfigStorage;
use crate::firmware::drivers::status_leds::{StatusLeds, pattern_for};
use crate::firmware::drivers::watchdog::Watchdog;
use crate::firmware::encoder::i2c::I2cEncoder;
use crate::firmware::encoder::uart::UartEncoder;
use crate::firmware::error::FaultCode;

/// Housekeeping loop: moves telemetry into the register file, pumps
/// pending commands into the mailbox, feeds the watchdog and services
/// persistence requests. 1 ms cadence.
#[embassy_executor::task]
pub async fn housekeeping(mut watchdog: Watchdog, mut storage: ConfigStorage) -> ! {
    let mut ticker = Ticker::every(Duration::from_millis(1));
    let mut telemetry_cursor = 0u32;

    loop {
        ticker.next().await;
        watchdog.feed();

        let mut guard = REGISTERS.lock().await;
        let Some(registers) = guard.as_mut() else {
            continue;
        };

        // Drain the telemetry ring down to the newest snapshot.
        let mut newest = None;
        while let Some(snapshot) = TELEMETRY.pop(&mut telemetry_cursor) {
            newest = Some(snapshot);
        }
        if let Some(snapshot) = newest {
            registers.update_snapshot(snapshot, TELEMETRY.dropped());
        }
        if let Some(Some(config)) = ACTIVE_CONFIG.read() {
            registers.sync_config(config);
        }

        // Commands accumulated by the servers go to the control cycle.
        while let Some(command) = registers.take_pending() {
            COMMAND_MAILBOX.post(command);
        }

        if registers.persist_requested {
            registers.persist_requested = false;
            let config = *registers.config();
            match storage.store(&config) {
                Ok(()) => {}
                Err(e) => defmt::warn!("config store failed: {}", e as u8),
            }
        }
        if registers.load_requested {
            registers.load_requested = false;
            match storage.load(*registers.config()) {
                Ok(config) => {
                    registers.submit(crate::firmware::control::ServoCommand::Config(config));
                }
                Err(_) => defmt::warn!("config load failed"),
            }
        }
    }
}

/// UART encoder poller: one transaction per interval.
#[embassy_executor::task]
pub async fn uart_encoder(mut encoder: UartEncoder) -> ! {
    loop {
        encoder.poll_once().await;
        Timer::after(encoder.poll_interval()).await;
    }
}

/// I2C encoder poller.
#[embassy_executor::task]
pub async fn i2c_encoder(mut encoder: I2cEncoder) -> ! {
    loop {
        encoder.poll_once().await;
        Timer::after(encoder.poll_interval()).await;
    }
}

/// Index pulse watcher: every rising edge sets the latch so the control
/// cycle cannot miss a pulse shorter than its period.
#[embassy_executor::task]
pub async fn index_watch(mut pin: ExtiInput<'static>) -> ! {
    loop {
        pin.wait_for_rising_edge().await;
        INDEX_LATCH.on_edge();
    }
}

/// LED animation from the latest telemetry snapshot.
#[embassy_executor::task]
pub async fn status_leds(mut leds: StatusLeds) -> ! {
    let mut ticker = Ticker::every(Duration::from_millis(100));
    let mut phase = 0u32;
    loop {
        ticker.next().await;
        phase = phase.wrapping_add(1);
        let (mode, faulted) = TELEMETRY
            .latest()
            .map(|s| (s.mode, s.fault != FaultCode::Success))
            .unwrap_or((0, false));
        leds.drive(pattern_for(mode, faulted), phase);
    }
}
