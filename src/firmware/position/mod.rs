/// Motor position subsystem.
///
/// Fuses the configured sources into one rotor electrical angle for
/// commutation and one unwrapped output position for the outer loops.
/// The aggregator never latches faults itself; it reports `valid` and a
/// reason, and the mode machine decides what that means for the mode it
/// is in (open-loop voltage modes keep running with an invalid theta).

pub mod pll;

use crate::firmware::config::{
    COMMUTATION_BINS, MAX_SOURCES, PositionConfig, PositionSourceConfig,
    SourceReference,
};
use crate::firmware::encoder::{SourceSample, flags};
use crate::firmware::error::FaultCode;
use pll::{AnglePll, wrap_delta, wrap_turns};

/// What the controller knows about its zero reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default, defmt::Format)]
pub enum Homed {
    #[default]
    Never,
    /// Rotor-relative zero observed (index pulse).
    Rotor,
    /// Absolute output position established.
    Output,
}

/// Fused position state, refreshed every control cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct RotorState {
    /// Rotor electrical angle in radians, [0, 2*pi).
    pub electrical_theta: f32,
    /// Rotor electrical rate in rad/s.
    pub electrical_omega: f32,
    /// Rotor mechanical angle in turns, [0, 1).
    pub mechanical_theta_wrapped: f32,
    /// Unwrapped output position in turns.
    pub output_position: f32,
    /// Output velocity in turns/s.
    pub output_velocity: f32,
    pub homed: Homed,
    pub valid: bool,
    pub fault_reason: FaultCode,
}

impl RotorState {
    /// Electrical angle as a Q31 fraction of one electrical revolution.
    pub fn electrical_theta_q31(&self) -> u32 {
        let turns = self.electrical_theta / (2.0 * core::f32::consts::PI);
        (wrap_turns(turns) * 2_147_483_648.0) as u32
    }
}

/// Interpolate a binned offset table at a wrapped angle in turns.
fn table_offset<const N: usize>(table: &[f32; N], turns: f32) -> f32 {
    let scaled = wrap_turns(turns) * N as f32;
    let lo = scaled as usize % N;
    let hi = (lo + 1) % N;
    let frac = scaled - scaled as u32 as f32;
    table[lo] * (1.0 - frac) + table[hi] * frac
}

struct SourceTracker {
    cfg: PositionSourceConfig,
    /// Which sample slot this source reads from.
    slot: usize,
    pll: AnglePll,
    last_nonce: u8,
    nonce_seen: bool,
    stall_count: u8,
    /// Seeded, reporting, and not stalled this cycle.
    usable: bool,
    /// Last converted measurement in turns, for the tracking check.
    last_measured: f32,
    fresh: bool,
}

impl SourceTracker {
    fn new(cfg: PositionSourceConfig, slot: usize, dt: f32) -> Self {
        Self {
            cfg,
            slot,
            pll: AnglePll::new(cfg.pll_bandwidth_hz, dt),
            last_nonce: 0,
            nonce_seen: false,
            stall_count: 0,
            usable: false,
            last_measured: 0.0,
            fresh: false,
        }
    }

    /// Convert a raw sample to wrapped turns of this source's frame.
    fn convert(&self, raw: u32) -> f32 {
        let raw = self.cfg.debug_override.unwrap_or(raw);
        let fraction = raw as f32 / self.cfg.cpr as f32;
        let signed = fraction * self.cfg.sign as f32;
        let turns = wrap_turns(signed);
        wrap_turns(turns + table_offset(&self.cfg.offset_table, turns))
    }

    fn step(&mut self, sample: Option<SourceSample>, stall_limit: u8) {
        self.fresh = false;
        let Some(sample) = sample else {
            self.pll.predict();
            self.usable = self.pll.is_seeded();
            return;
        };

        if !sample.active || sample.flags & flags::ERR != 0 {
            self.usable = false;
            self.pll.predict();
            return;
        }

        let nonce_advanced = !self.nonce_seen || sample.nonce != self.last_nonce;
        if nonce_advanced {
            self.nonce_seen = true;
            self.last_nonce = sample.nonce;
            self.stall_count = 0;
            self.last_measured = self.convert(sample.value);
            self.pll.update(self.last_measured);
            self.fresh = true;
            self.usable = true;
        } else {
            self.stall_count = self.stall_count.saturating_add(1);
            self.pll.predict();
            // A stalled nonce means the device stopped answering even
            // though the slot still reads `active`.
            self.usable = self.stall_count < stall_limit && self.pll.is_seeded();
        }
    }
}

pub struct PositionAggregator {
    trackers: heapless::Vec<SourceTracker, MAX_SOURCES>,
    gear_ratio: f32,
    pole_pairs: u8,
    nonce_stall_cycles: u8,
    disagreement_tolerance: f32,
    tracking_tolerance: f32,
    commutation_offsets: [f32; COMMUTATION_BINS],
    state: RotorState,
    prev_mech: Option<f32>,
}

impl PositionAggregator {
    pub fn new(
        config: &PositionConfig,
        commutation_offsets: [f32; COMMUTATION_BINS],
        pole_pairs: u8,
        dt: f32,
    ) -> Self {
        let mut trackers = heapless::Vec::new();
        for (slot, source) in config.sources.iter().enumerate() {
            if let Some(source) = source {
                // Capacity equals MAX_SOURCES; push cannot fail.
                let _ = trackers.push(SourceTracker::new(*source, slot, dt));
            }
        }
        Self {
            trackers,
            gear_ratio: config.gear_ratio,
            pole_pairs,
            nonce_stall_cycles: config.nonce_stall_cycles,
            disagreement_tolerance: config.disagreement_tolerance,
            tracking_tolerance: config.tracking_tolerance,
            commutation_offsets,
            state: RotorState::default(),
            prev_mech: None,
        }
    }

    pub fn state(&self) -> &RotorState {
        &self.state
    }

    /// Pin the output position; the absolute reference is now known.
    pub fn rezero(&mut self, output_turns: f32) {
        self.state.output_position = output_turns;
        self.state.homed = Homed::Output;
    }

    /// Fuse this cycle's source samples. `samples` is indexed like the
    /// configured source list; `index_seen` is the latched index pulse.
    pub fn update(&mut self, samples: &[Option<SourceSample>; MAX_SOURCES], index_seen: bool) {
        let stall_limit = self.nonce_stall_cycles;
        for tracker in self.trackers.iter_mut() {
            tracker.step(samples[tracker.slot], stall_limit);
        }

        self.state.valid = true;
        self.state.fault_reason = FaultCode::Success;

        // Reference rotor source: the primary if it is usable, otherwise
        // the first usable rotor source.
        let rotor_ref = self
            .trackers
            .iter()
            .position(|t| t.cfg.reference == SourceReference::Rotor && t.cfg.primary && t.usable)
            .or_else(|| {
                self.trackers
                    .iter()
                    .position(|t| t.cfg.reference == SourceReference::Rotor && t.usable)
            });

        let Some(ref_idx) = rotor_ref else {
            self.invalidate(FaultCode::EncoderFault);
            return;
        };

        // Consistency: every other usable rotor source must agree with the
        // reference within tolerance.
        let ref_theta = self.trackers[ref_idx].pll.theta();
        for (i, tracker) in self.trackers.iter().enumerate() {
            if i == ref_idx || !tracker.usable {
                continue;
            }
            if tracker.cfg.reference == SourceReference::Rotor
                && wrap_delta(tracker.pll.theta() - ref_theta).abs() > self.disagreement_tolerance
            {
                self.invalidate(FaultCode::EncoderFault);
                return;
            }
        }

        // Tracking check: a fresh measurement must sit near the PLL's
        // prediction, otherwise the angle jumped and cannot be trusted.
        let reference = &self.trackers[ref_idx];
        if reference.fresh
            && wrap_delta(reference.last_measured - ref_theta).abs() > self.tracking_tolerance
        {
            self.invalidate(FaultCode::ThetaInvalid);
            return;
        }

        let mech = ref_theta;
        let mech_omega = reference.pll.omega();

        // Commutation: electrical angle plus the calibrated offset for the
        // bin it lands in.
        let raw_electrical = wrap_turns(mech * self.pole_pairs as f32);
        let electrical = wrap_turns(
            raw_electrical + table_offset(&self.commutation_offsets, raw_electrical),
        );
        self.state.mechanical_theta_wrapped = mech;
        self.state.electrical_theta = electrical * 2.0 * core::f32::consts::PI;
        self.state.electrical_omega =
            mech_omega * self.pole_pairs as f32 * 2.0 * core::f32::consts::PI;

        // Unwrap the output from the rotor delta.
        if let Some(prev) = self.prev_mech {
            self.state.output_position += wrap_delta(mech - prev) / self.gear_ratio;
        }
        self.prev_mech = Some(mech);
        self.state.output_velocity = mech_omega / self.gear_ratio;

        // An absolute output source seeds homing and snaps the unwrapped
        // position to within one output turn.
        if let Some(output) = self
            .trackers
            .iter()
            .find(|t| t.cfg.reference == SourceReference::Output && t.usable)
        {
            let absolute = output.pll.theta();
            let turns = libm::roundf(self.state.output_position - absolute);
            self.state.output_position = absolute + turns;
            self.state.homed = Homed::Output;
        }

        if index_seen && self.state.homed == Homed::Never {
            self.state.homed = Homed::Rotor;
        }
    }

    fn invalidate(&mut self, reason: FaultCode) {
        self.state.valid = false;
        self.state.fault_reason = reason;
        self.state.output_velocity = 0.0;
        // Re-seed the unwrap when the angle becomes trustworthy again so a
        // bad cycle cannot inject a position step.
        self.prev_mech = None;
    }
}
