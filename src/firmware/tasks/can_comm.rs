/// FDCAN register server task.
///
/// One received frame maps to one call into the frame codec against the
/// shared register file, and at most one reply frame. Commands produced
/// by the frame are pumped into the mailbox immediately rather than
/// waiting for the housekeeping tick, which is what keeps the
/// two-PWM-period apply bound.

use embassy_stm32::{bind_interrupts, can, peripherals};

use super::{COMMAND_MAILBOX, REGISTERS};
use crate::firmware::comms::protocol::{frame_flags, process_frame};
use crate::firmware::drivers::can::{BusConfig, DATA_BITRATE, NOMINAL_BITRATE};

bind_interrupts!(struct Irqs {
    FDCAN1_IT0 => can::IT0InterruptHandler<peripherals::FDCAN1>;
    FDCAN1_IT1 => can::IT1InterruptHandler<peripherals::FDCAN1>;
});

#[embassy_executor::task]
pub async fn can_server(
    fdcan: embassy_stm32::Peri<'static, peripherals::FDCAN1>,
    rx_pin: embassy_stm32::Peri<'static, peripherals::PA11>,
    tx_pin: embassy_stm32::Peri<'static, peripherals::PA12>,
    bus: BusConfig,
) -> ! {
    let mut configurator = can::CanConfigurator::new(fdcan, rx_pin, tx_pin, Irqs);
    configurator.set_bitrate(NOMINAL_BITRATE);
    configurator.set_fd_data_bitrate(DATA_BITRATE, true);
    let mut can = configurator.into_normal_mode();

    defmt::info!(
        "can server: node 0x{:02x}, {} / {} bps",
        bus.node_id,
        NOMINAL_BITRATE,
        DATA_BITRATE
    );

    loop {
        let envelope = match can.read_fd().await {
            Ok(envelope) => envelope,
            Err(e) => {
                defmt::warn!("can rx error: {}", e);
                continue;
            }
        };

        let frame = envelope.frame;
        let embedded_can::Id::Extended(id) = frame.header().id() else {
            continue;
        };
        let Some(source) = bus.accept(id.as_raw()) else {
            continue;
        };

        let result = {
            let mut guard = REGISTERS.lock().await;
            let Some(registers) = guard.as_mut() else {
                continue;
            };
            let result = process_frame(frame.data(), registers);
            // Writes are live before the reply leaves the node.
            while let Some(command) = registers.take_pending() {
                COMMAND_MAILBOX.post(command);
            }
            result
        };

        if result.reply.is_empty() && result.flags & frame_flags::OVERFLOW == 0 {
            continue;
        }
        let (reply_id, payload) = bus.reply(source, result.reply);
        let embedded_can::Id::Extended(reply_id) = reply_id else {
            continue;
        };
        match can::frame::FdFrame::new_extended(reply_id.as_raw(), &payload) {
            Ok(reply) => {
                can.write_fd(&reply).await;
            }
            Err(_) => defmt::warn!("reply frame build failed"),
        }
    }
}
