/// FDCAN bus parameters and the servo frame shape.
///
/// The hardware binding (interrupt wiring, configurator) lives in the bus
/// task; this module is the protocol-facing description of a frame so the
/// codec and its tests stay off the peripheral.

use heapless::Vec;

use crate::firmware::comms::protocol::{MAX_PAYLOAD, frame_id, pad_to_dlc, split_id};

/// Arbitration timing: 1 Mbps nominal, 5 Mbps data phase with BRS.
pub const NOMINAL_BITRATE: u32 = 1_000_000;
pub const DATA_BITRATE: u32 = 5_000_000;

/// Default id prefix for servo control frames.
pub const DEFAULT_PREFIX: u16 = 0x0001;

#[derive(Clone, Copy, Debug)]
pub struct BusConfig {
    pub prefix: u16,
    /// This controller's node id; frames addressed elsewhere are ignored.
    pub node_id: u8,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX,
            node_id: 0x01,
        }
    }
}

/// One control frame, already stripped of CAN framing.
#[derive(Clone, Debug)]
pub struct ServoFrame {
    pub source: u8,
    pub destination: u8,
    pub payload: Vec<u8, MAX_PAYLOAD>,
}

impl BusConfig {
    /// Accept a received extended id; returns the source node when the
    /// frame is addressed to us with our prefix.
    pub fn accept(&self, raw_id: u32) -> Option<u8> {
        let (prefix, source, destination) = split_id(raw_id);
        (prefix == self.prefix && destination == self.node_id).then_some(source)
    }

    /// Build the reply id and padded payload for a processed frame.
    pub fn reply(
        &self,
        to: u8,
        mut payload: Vec<u8, MAX_PAYLOAD>,
    ) -> (embedded_can::Id, Vec<u8, MAX_PAYLOAD>) {
        pad_to_dlc(&mut payload);
        (frame_id(self.prefix, self.node_id, to), payload)
    }
}
