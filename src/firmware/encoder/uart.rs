/// UART absolute encoders: RLS AkSIM-2 and CUI AMT21.
///
/// Both are request/response devices polled from the background loop. The
/// response parsers are pure so the framing and checksum rules are testable
/// without a bus; the poller owns the UART, the per-transaction timeout
/// (2x the poll interval) and the resync policy, and commits into the
/// source slot.

use embassy_stm32::mode::Async;
use embassy_stm32::usart::Uart;
use embassy_time::{Duration, with_timeout};

use super::{SampleBuilder, SourceHealth, SourceSlot, flags};

/// AkSIM-2 response: marker, 24-bit position (MSB first), 16-bit status.
pub const AKSIM2_FRAME_LEN: usize = 6;

/// Leading marker byte of every AkSIM-2 answer.
pub const AKSIM2_MARKER: u8 = b'd';

/// Bytes dropped hunting for the marker before the attempt is abandoned.
const AKSIM2_MAX_RESYNC: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, defmt::Format)]
pub struct Aksim2Frame {
    pub position: u32,
    pub error: bool,
    pub warning: bool,
    pub status: u16,
}

/// Parse an aligned AkSIM-2 frame.
pub fn parse_aksim2(buf: &[u8; AKSIM2_FRAME_LEN]) -> Option<Aksim2Frame> {
    if buf[0] != AKSIM2_MARKER {
        return None;
    }
    let position = ((buf[1] as u32) << 16) | ((buf[2] as u32) << 8) | buf[3] as u32;
    let status = u16::from_be_bytes([buf[4], buf[5]]);
    Some(Aksim2Frame {
        position,
        error: status & (1 << 15) != 0,
        warning: status & (1 << 14) != 0,
        status,
    })
}

/// Locate a frame inside `buf`, dropping at most `AKSIM2_MAX_RESYNC` leading
/// bytes. Returns the frame and how many bytes were dropped.
pub fn resync_aksim2(buf: &[u8]) -> Option<(Aksim2Frame, usize)> {
    for skip in 0..=AKSIM2_MAX_RESYNC {
        let Some(window) = buf.get(skip..skip + AKSIM2_FRAME_LEN) else {
            return None;
        };
        let mut frame = [0u8; AKSIM2_FRAME_LEN];
        frame.copy_from_slice(window);
        if let Some(parsed) = parse_aksim2(&frame) {
            return Some((parsed, skip));
        }
    }
    None
}

/// Validate an AMT21 response word.
///
/// Bits 13..0 carry the position; bit 15 is the inverted XOR of the odd
/// data bits (K1), bit 14 of the even data bits (K0). A mismatch means the
/// word was corrupted and the previous value must be kept.
pub fn parse_amt21(raw: u16) -> Option<u16> {
    let mut odd = 0u16;
    let mut even = 0u16;
    for bit in 0..14 {
        let value = (raw >> bit) & 1;
        if bit % 2 == 0 {
            even ^= value;
        } else {
            odd ^= value;
        }
    }
    let k1 = (raw >> 15) & 1;
    let k0 = (raw >> 14) & 1;
    if k1 == odd ^ 1 && k0 == even ^ 1 {
        Some(raw & 0x3FFF)
    } else {
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UartDevice {
    Aksim2,
    /// AMT21 node address on the RS-485 bus.
    Amt21 { address: u8 },
}

/// Background UART encoder poller.
pub struct UartEncoder {
    uart: Uart<'static, Async>,
    device: UartDevice,
    poll_interval: Duration,
    builder: SampleBuilder,
    slot: &'static SourceSlot,
}

impl UartEncoder {
    pub fn new(
        uart: Uart<'static, Async>,
        device: UartDevice,
        poll_interval: Duration,
        slot: &'static SourceSlot,
    ) -> Self {
        Self {
            uart,
            device,
            poll_interval,
            builder: SampleBuilder::new(),
            slot,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn health(&self) -> SourceHealth {
        self.builder.health
    }

    /// Issue one request/response transaction and commit the result.
    pub async fn poll_once(&mut self) {
        let timeout = self.poll_interval * 2;
        let sample = match self.device {
            UartDevice::Aksim2 => self.poll_aksim2(timeout).await,
            UartDevice::Amt21 { address } => self.poll_amt21(address, timeout).await,
        };
        self.slot.write(sample);
    }

    async fn poll_aksim2(&mut self, timeout: Duration) -> super::SourceSample {
        // Request: a single marker byte, answered with one frame. Read a
        // little extra so a slipped byte can be resynced in place.
        let mut buf = [0u8; AKSIM2_FRAME_LEN + AKSIM2_MAX_RESYNC];
        if self.uart.write(&[AKSIM2_MARKER]).await.is_err() {
            return self.builder.inactive();
        }
        let n = match with_timeout(timeout, self.uart.read_until_idle(&mut buf)).await {
            Ok(Ok(n)) => n,
            _ => return self.builder.inactive(),
        };
        match resync_aksim2(&buf[..n]) {
            Some((frame, dropped)) => {
                if dropped > 0 {
                    self.builder.health.resyncs += 1;
                }
                let mut sample_flags = 0;
                if frame.error {
                    sample_flags |= flags::ERR;
                }
                if frame.warning {
                    sample_flags |= flags::WARN;
                }
                self.builder.fresh(frame.position, sample_flags)
            }
            None => {
                self.builder.health.checksum_errors += 1;
                self.builder.stale()
            }
        }
    }

    async fn poll_amt21(&mut self, address: u8, timeout: Duration) -> super::SourceSample {
        let mut buf = [0u8; 2];
        if self.uart.write(&[address]).await.is_err() {
            return self.builder.inactive();
        }
        match with_timeout(timeout, self.uart.read(&mut buf)).await {
            Ok(Ok(())) => {}
            _ => return self.builder.inactive(),
        }
        let raw = u16::from_le_bytes(buf);
        match parse_amt21(raw) {
            Some(value) => self.builder.fresh(value as u32, 0),
            None => {
                // Parity mismatch: count it, keep the previous value.
                self.builder.health.checksum_errors += 1;
                self.builder.stale()
            }
        }
    }
}
