/// Cycle telemetry.
///
/// The control cycle assembles one `ControlCycleSnapshot` per PWM period
/// and publishes it to the snapshot ring as its very last action; the
/// transport drains the ring from the background loop. Snapshots are plain
/// `Copy` data so publication is a single seq-guarded store.

use crate::firmware::error::FaultCode;
use crate::firmware::sync::SnapshotRing;

/// Depth of the telemetry ring. The transport runs far slower than the
/// control cycle; overwrites are expected and counted, not prevented.
pub const TELEMETRY_RING_DEPTH: usize = 8;

#[derive(Clone, Copy, Debug, Default)]
pub struct ControlCycleSnapshot {
    pub timestamp_us: u64,
    /// Mode id, as exposed by the mode register.
    pub mode: u8,
    pub fault: FaultCode,

    /// Unfiltered phase currents in amps.
    pub currents: [f32; 3],
    pub vbus: f32,
    pub fet_temp_c: f32,
    /// NaN when no motor thermistor is fitted.
    pub motor_temp_c: f32,

    pub electrical_theta: f32,
    pub id: f32,
    pub iq: f32,
    pub id_ref: f32,
    pub iq_ref: f32,
    pub vd: f32,
    pub vq: f32,
    pub duties: [f32; 3],

    pub position: f32,
    pub velocity: f32,
    pub torque_nm: f32,

    pub cycle_time_us: u16,
}

pub type TelemetryRing = SnapshotRing<ControlCycleSnapshot, TELEMETRY_RING_DEPTH>;

pub const fn telemetry_ring() -> TelemetryRing {
    SnapshotRing::new(ControlCycleSnapshot {
        timestamp_us: 0,
        mode: 0,
        fault: FaultCode::Success,
        currents: [0.0; 3],
        vbus: 0.0,
        fet_temp_c: 0.0,
        motor_temp_c: f32::NAN,
        electrical_theta: 0.0,
        id: 0.0,
        iq: 0.0,
        id_ref: 0.0,
        iq_ref: 0.0,
        vd: 0.0,
        vq: 0.0,
        duties: [0.0; 3],
        position: 0.0,
        velocity: 0.0,
        torque_nm: 0.0,
        cycle_time_us: 0,
    })
}

/// Control-cycle duration statistics, feeding the overrun check and the
/// timing registers.
#[derive(Clone, Copy, Debug, Default)]
pub struct CycleStats {
    pub last_us: u16,
    pub min_us: u16,
    pub max_us: u16,
    primed: bool,
}

impl CycleStats {
    pub const fn new() -> Self {
        Self {
            last_us: 0,
            min_us: 0,
            max_us: 0,
            primed: false,
        }
    }

    pub fn record(&mut self, duration_us: u16) {
        self.last_us = duration_us;
        if !self.primed {
            self.primed = true;
            self.min_us = duration_us;
            self.max_us = duration_us;
        } else {
            self.min_us = self.min_us.min(duration_us);
            self.max_us = self.max_us.max(duration_us);
        }
    }
}
