/// I2C absolute encoders: AMS AS5048B and AS5600.
///
/// Polled from the background loop at the configured per-device cadence.
/// A NACK or lost arbitration aborts the transaction; the controller is
/// re-initialized on the next poll before another transfer is attempted.

use embassy_stm32::i2c::{I2c, Master};
use embassy_stm32::mode::Async;
use embassy_time::{Duration, with_timeout};

use super::{SampleBuilder, SourceHealth, SourceSlot};

/// AS5048B 7-bit bus address (A1/A2 low).
pub const AS5048_ADDRESS: u8 = 0x40;
/// AS5600 fixed 7-bit bus address.
pub const AS5600_ADDRESS: u8 = 0x36;

/// AS5048B angle registers: 8 MSBs then 6 LSBs.
const AS5048_REG_ANGLE: u8 = 0xFE;
/// AS5600 raw angle registers: high nibble then low byte.
const AS5600_REG_RAW_ANGLE: u8 = 0x0C;

/// Assemble the AS5048B 14-bit angle from its two registers.
pub fn as5048_angle(msb: u8, lsb: u8) -> u16 {
    ((msb as u16) << 6) | (lsb as u16 & 0x3F)
}

/// Assemble the AS5600 12-bit angle from its two registers.
pub fn as5600_angle(high: u8, low: u8) -> u16 {
    (((high as u16) & 0x0F) << 8) | low as u16
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum I2cDevice {
    As5048,
    As5600,
}

impl I2cDevice {
    pub const fn address(&self) -> u8 {
        match self {
            Self::As5048 => AS5048_ADDRESS,
            Self::As5600 => AS5600_ADDRESS,
        }
    }

    const fn angle_register(&self) -> u8 {
        match self {
            Self::As5048 => AS5048_REG_ANGLE,
            Self::As5600 => AS5600_REG_RAW_ANGLE,
        }
    }
}

/// Background I2C encoder poller.
pub struct I2cEncoder {
    i2c: I2c<'static, Async, Master>,
    device: I2cDevice,
    poll_interval: Duration,
    builder: SampleBuilder,
    slot: &'static SourceSlot,
    reinit_pending: bool,
}

impl I2cEncoder {
    pub fn new(
        i2c: I2c<'static, Async, Master>,
        device: I2cDevice,
        poll_interval: Duration,
        slot: &'static SourceSlot,
    ) -> Self {
        Self {
            i2c,
            device,
            poll_interval,
            builder: SampleBuilder::new(),
            slot,
            reinit_pending: false,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn health(&self) -> SourceHealth {
        self.builder.health
    }

    /// Issue one register read and commit the result.
    pub async fn poll_once(&mut self) {
        if self.reinit_pending {
            // A failed transfer may have left the bus mid-transaction;
            // clock out any stuck byte before talking again.
            self.reinit_pending = false;
            let mut scratch = [0u8; 1];
            let _ = self.i2c.read(self.device.address(), &mut scratch).await;
            return;
        }

        let mut raw = [0u8; 2];
        let transfer = self.i2c.write_read(
            self.device.address(),
            &[self.device.angle_register()],
            &mut raw,
        );
        let sample = match with_timeout(self.poll_interval, transfer).await {
            Ok(Ok(())) => {
                let value = match self.device {
                    I2cDevice::As5048 => as5048_angle(raw[0], raw[1]),
                    I2cDevice::As5600 => as5600_angle(raw[0], raw[1]),
                };
                self.builder.fresh(value as u32, 0)
            }
            _ => {
                self.reinit_pending = true;
                self.builder.inactive()
            }
        };
        self.slot.write(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as5048_assembles_14_bits() {
        assert_eq!(as5048_angle(0xFF, 0x3F), 0x3FFF);
        assert_eq!(as5048_angle(0x80, 0x00), 0x2000);
        // Upper bits of the LSB register are status bits, masked out.
        assert_eq!(as5048_angle(0x00, 0xFF), 0x003F);
    }

    #[test]
    fn as5600_assembles_12_bits() {
        assert_eq!(as5600_angle(0x0F, 0xFF), 0x0FFF);
        assert_eq!(as5600_angle(0xF0, 0x00), 0x0000);
        assert_eq!(as5600_angle(0x01, 0x80), 0x0180);
    }

    #[test]
    fn device_addresses() {
        assert_eq!(I2cDevice::As5048.address(), 0x40);
        assert_eq!(I2cDevice::As5600.address(), 0x36);
    }
}
