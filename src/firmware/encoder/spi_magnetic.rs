/// On-board SPI magnetic encoders (AS5047P, MA732).
///
/// These are the only sources sampled inside the control cycle itself: the
/// transfer is started at ISR entry and the latched result is parsed a few
/// microseconds later, so the angle is phase-aligned with the current
/// samples. Both devices answer a 16-bit frame; the 14-bit angle is
/// left-aligned to the common 16-bit convention.

use embassy_stm32::gpio::Output;
use embassy_stm32::mode::Blocking;
use embassy_stm32::spi::Spi;

use super::{SampleBuilder, SourceSample, flags};

/// AS5047P ANGLECOM register, read command with parity bit.
const AS5047_READ_ANGLE: u16 = 0xFFFF;

/// Supported on-board device variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum SpiVariant {
    As5047,
    Ma732,
}

/// Parse one AS5047P response frame.
///
/// Bit 15 carries even parity over bits 14..0, bit 14 is the error flag,
/// bits 13..0 are the angle. An all-ones frame is what a floating MISO
/// line reads and is treated as a disconnected device.
pub fn parse_as5047(raw: u16) -> Option<(u16, u8)> {
    if raw == 0xFFFF {
        return None;
    }
    let parity = ((raw >> 15) & 1) as u32;
    if ((raw & 0x7FFF).count_ones() + parity) & 1 != 0 {
        return None;
    }
    let mut sample_flags = 0;
    if raw & (1 << 14) != 0 {
        sample_flags |= flags::ERR;
    }
    Some(((raw & 0x3FFF) << 2, sample_flags))
}

/// Parse one MA732 response frame: plain 16-bit angle, 14 significant bits
/// already left-aligned by the device. All-ones means disconnected.
pub fn parse_ma732(raw: u16) -> Option<(u16, u8)> {
    if raw == 0xFFFF {
        return None;
    }
    Some((raw & 0xFFFC, 0))
}

/// On-board SPI magnetic encoder.
pub struct SpiEncoder {
    spi: Spi<'static, Blocking>,
    cs: Output<'static>,
    variant: SpiVariant,
    builder: SampleBuilder,
}

impl SpiEncoder {
    pub fn new(spi: Spi<'static, Blocking>, cs: Output<'static>, variant: SpiVariant) -> Self {
        Self {
            spi,
            cs,
            variant,
            builder: SampleBuilder::new(),
        }
    }

    /// Sample the device. Constant-time, called from the control cycle.
    pub fn isr_sample(&mut self) -> SourceSample {
        let tx = AS5047_READ_ANGLE.to_be_bytes();
        let mut rx = [0u8; 2];

        self.cs.set_low();
        let result = self.spi.blocking_transfer(&mut rx, &tx);
        self.cs.set_high();

        if result.is_err() {
            return self.builder.inactive();
        }

        let raw = u16::from_be_bytes(rx);
        let parsed = match self.variant {
            SpiVariant::As5047 => parse_as5047(raw),
            SpiVariant::Ma732 => parse_ma732(raw),
        };

        match parsed {
            Some((value, sample_flags)) => self.builder.fresh(value as u32, sample_flags),
            None => self.builder.inactive(),
        }
    }

    pub fn health(&self) -> super::SourceHealth {
        self.builder.health
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_parity(frame: u16) -> u16 {
        let parity = ((frame & 0x7FFF).count_ones() & 1) as u16;
        frame | (parity << 15)
    }

    #[test]
    fn as5047_accepts_valid_frame() {
        let raw = with_parity(0x1234);
        let (value, f) = parse_as5047(raw).unwrap();
        assert_eq!(value, (0x1234 & 0x3FFF) << 2);
        assert_eq!(f, 0);
    }

    #[test]
    fn as5047_rejects_bad_parity() {
        let raw = with_parity(0x1234) ^ 0x0001;
        assert!(parse_as5047(raw).is_none());
    }

    #[test]
    fn as5047_reports_error_flag() {
        let raw = with_parity(0x4000 | 0x0123);
        let (_, f) = parse_as5047(raw).unwrap();
        assert_ne!(f & flags::ERR, 0);
    }

    #[test]
    fn all_ones_is_disconnected() {
        assert!(parse_as5047(0xFFFF).is_none());
        assert!(parse_ma732(0xFFFF).is_none());
    }

    #[test]
    fn ma732_left_aligned() {
        let (value, _) = parse_ma732(0xABCD).unwrap();
        assert_eq!(value & 0x0003, 0);
        assert_eq!(value, 0xABCD & 0xFFFC);
    }
}
