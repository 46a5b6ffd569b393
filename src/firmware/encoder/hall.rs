/// Six-step hall sensor decoding.
///
/// The three hall lines walk a Gray sequence, one sector per 60 electrical
/// degrees. Any transition other than +-1 sector, and either all-low or
/// all-high line states, are invalid; the count then holds its last value
/// and the error counter advances.

use super::{SampleBuilder, SourceSample};

/// Hall line state (3 bits) to sector 0..5; 0b000 and 0b111 are invalid.
const HALL_SECTOR: [Option<u8>; 8] = [
    None,    // 0b000
    Some(0), // 0b001
    Some(2), // 0b010
    Some(1), // 0b011
    Some(4), // 0b100
    Some(5), // 0b101
    Some(3), // 0b110
    None,    // 0b111
];

pub struct HallDecoder {
    /// XOR mask applied to the raw lines for inverted sensors.
    polarity: u8,
    cpr: u32,
    count: u32,
    last_sector: Option<u8>,
    pub invalid_codes: u32,
    builder: SampleBuilder,
}

impl HallDecoder {
    pub fn new(polarity: u8, cpr: u32) -> Self {
        Self {
            polarity: polarity & 0b111,
            cpr,
            count: 0,
            last_sector: None,
            invalid_codes: 0,
            builder: SampleBuilder::new(),
        }
    }

    /// Decode the current hall lines. Constant-time, ISR context.
    pub fn isr_update(&mut self, lines: u8) -> SourceSample {
        let state = (lines ^ self.polarity) & 0b111;
        let Some(sector) = HALL_SECTOR[state as usize] else {
            self.invalid_codes += 1;
            return self.builder.stale();
        };

        match self.last_sector {
            None => {
                // First observation seeds the count at the sector center.
                self.count = sector as u32 * self.cpr / 6;
            }
            Some(last) if last == sector => return self.builder.stale(),
            Some(last) => {
                let forward = (sector + 6 - last) % 6;
                match forward {
                    1 => self.count = (self.count + self.cpr / 6) % self.cpr,
                    5 => self.count = (self.count + self.cpr - self.cpr / 6) % self.cpr,
                    _ => {
                        // Skipped sector: a transition was missed or the
                        // lines glitched. Keep the count.
                        self.invalid_codes += 1;
                        return self.builder.stale();
                    }
                }
            }
        }
        self.last_sector = Some(sector);
        self.builder.fresh(self.count, 0)
    }
}
