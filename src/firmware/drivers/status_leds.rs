/// Status LED patterns.
///
/// One green/red pair on the reference board, active low. The background
/// LED task maps controller state to a pattern; nothing here knows about
/// modes beyond the pattern enum.

use embassy_stm32::Peri;
use embassy_stm32::gpio::{Level, Output, Pin, Speed};

/// What the LEDs should express.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedPattern {
    /// Slow green heartbeat: powered, Stopped.
    Idle,
    /// Solid green: closed-loop mode active.
    Active,
    /// Fast red blink: fault latched.
    Fault,
    /// Alternating red/green: calibration in progress.
    Calibrating,
}

pub struct StatusLeds {
    green: Output<'static>,
    red: Output<'static>,
}

impl StatusLeds {
    /// Both LEDs start off (pins high, active low).
    pub fn new(green: Peri<'static, impl Pin>, red: Peri<'static, impl Pin>) -> Self {
        Self {
            green: Output::new(green, Level::High, Speed::Low),
            red: Output::new(red, Level::High, Speed::Low),
        }
    }

    /// Drive the pattern for one animation tick. `phase` advances once
    /// per tick (100 ms cadence from the LED task).
    pub fn drive(&mut self, pattern: LedPattern, phase: u32) {
        let (green, red) = match pattern {
            LedPattern::Idle => (phase % 10 == 0, false),
            LedPattern::Active => (true, false),
            // ~2.5 Hz at the 100 ms tick, mirroring the hard-fault blink.
            LedPattern::Fault => (false, phase % 4 < 2),
            LedPattern::Calibrating => (phase % 4 < 2, phase % 4 >= 2),
        };
        // Active low.
        if green {
            self.green.set_low();
        } else {
            self.green.set_high();
        }
        if red {
            self.red.set_low();
        } else {
            self.red.set_high();
        }
    }
}

/// Map a mode id and fault state to a pattern.
pub fn pattern_for(mode_id: u8, faulted: bool) -> LedPattern {
    if faulted {
        return LedPattern::Fault;
    }
    match mode_id {
        0 => LedPattern::Idle,
        3 | 4 | 15 => LedPattern::Calibrating,
        _ => LedPattern::Active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_wins_over_mode() {
        assert_eq!(pattern_for(6, true), LedPattern::Fault);
        assert_eq!(pattern_for(0, true), LedPattern::Fault);
    }

    #[test]
    fn calibration_modes_get_their_pattern() {
        assert_eq!(pattern_for(3, false), LedPattern::Calibrating);
        assert_eq!(pattern_for(15, false), LedPattern::Calibrating);
    }

    #[test]
    fn stopped_is_idle_everything_else_active() {
        assert_eq!(pattern_for(0, false), LedPattern::Idle);
        assert_eq!(pattern_for(6, false), LedPattern::Active);
        assert_eq!(pattern_for(9, false), LedPattern::Active);
    }
}
