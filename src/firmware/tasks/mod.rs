/// Task set and the cross-context publication points.
///
/// Exactly one writer and one reader context per static: the source slots
/// and command mailbox flow background -> control cycle, the telemetry
/// ring flows control cycle -> background. The register file is shared
/// between the background-side servers only and lives behind a mutex the
/// control cycle never touches.

pub mod background;
pub mod can_comm;
pub mod console;
pub mod control_loop;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;

use crate::firmware::comms::registers::RegisterFile;
use crate::firmware::config::{MAX_SOURCES, ServoConfig};
use crate::firmware::control::ServoCommand;
use crate::firmware::control::modes::ModeRequest;
use crate::firmware::encoder::index::IndexLatch;
use crate::firmware::encoder::{SourceSample, SourceSlot};
use crate::firmware::sync::{Mailbox, SeqSlot};
use crate::firmware::telemetry::{TelemetryRing, telemetry_ring};

/// Background pollers commit here; the control cycle reads each slot once
/// per period.
pub static SOURCE_SLOTS: [SourceSlot; MAX_SOURCES] = [
    SourceSlot::new(SourceSample::inactive()),
    SourceSlot::new(SourceSample::inactive()),
    SourceSlot::new(SourceSample::inactive()),
];

/// Single-slot command mailbox, consumed at one point per control cycle.
pub static COMMAND_MAILBOX: Mailbox<ServoCommand> =
    Mailbox::new(ServoCommand::Mode(ModeRequest::Stop));

/// Cycle snapshots, control cycle -> transport.
pub static TELEMETRY: TelemetryRing = telemetry_ring();

/// Index pulse latch, EXTI -> control cycle.
pub static INDEX_LATCH: IndexLatch = IndexLatch::new();

/// Register file shared by the bus server, the CLI and the background
/// snapshot sync. Never locked from the control cycle.
pub static REGISTERS: Mutex<CriticalSectionRawMutex, Option<RegisterFile>> = Mutex::new(None);

/// Periodic mirror of the configuration the control cycle actually runs,
/// so calibration results show up in `conf get` and persist correctly.
pub static ACTIVE_CONFIG: SeqSlot<Option<ServoConfig>> = SeqSlot::new(None);
