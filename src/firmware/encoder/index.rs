/// Index pulse capture.
///
/// The pulse can be far shorter than a control period, so the EXTI edge
/// handler latches it; the control cycle ORs the latch with the live pin
/// level when it samples, and the latch is consumed in the same call.

use core::sync::atomic::{AtomicBool, Ordering};

pub struct IndexLatch {
    seen: AtomicBool,
}

impl IndexLatch {
    pub const fn new() -> Self {
        Self {
            seen: AtomicBool::new(false),
        }
    }

    /// Called from the EXTI rising-edge handler.
    pub fn on_edge(&self) {
        self.seen.store(true, Ordering::Release);
    }

    /// Consume the latch, OR-ed with the live pin level. ISR context.
    pub fn isr_sample(&self, live_level: bool) -> bool {
        self.seen.swap(false, Ordering::AcqRel) || live_level
    }
}
