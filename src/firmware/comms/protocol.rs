/// Bus frame protocol.
///
/// Each control frame is one FDCAN frame. The 29-bit id carries
/// `(prefix << 16) | (source << 8) | destination`; the payload is a stream
/// of subframes `{opcode, count, start_register, [values]}`. Writes apply
/// atomically in frame order before any reply subframe is emitted, and the
/// reply always fits one 64-byte frame; when it cannot, it is truncated
/// and flagged.

use embedded_can::{ExtendedId, Id};
use heapless::Vec;

use super::registers::{RegError, RegValue, RegisterFile};

/// Maximum FDCAN payload.
pub const MAX_PAYLOAD: usize = 64;

/// Valid FDCAN payload sizes.
pub const DLC_SIZES: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Padding byte used to round payloads up to a valid DLC.
pub const PAD_BYTE: u8 = 0x50;

/// Flags byte bits.
pub mod frame_flags {
    /// Frame uses CAN-FD encoding.
    pub const FD: u8 = 1 << 0;
    /// Bit-rate switch requested for the data phase.
    pub const BRS: u8 = 1 << 1;
    /// Reply was truncated to fit the 64-byte bound.
    pub const OVERFLOW: u8 = 1 << 7;
}

/// Subframe opcodes.
pub mod opcode {
    pub const NOP: u8 = 0x00;
    pub const READ_I8: u8 = 0x10;
    pub const READ_I16: u8 = 0x11;
    pub const READ_I32: u8 = 0x12;
    pub const READ_U32: u8 = 0x13;
    pub const READ_F32: u8 = 0x14;
    pub const WRITE_I8: u8 = 0x20;
    pub const WRITE_I16: u8 = 0x21;
    pub const WRITE_I32: u8 = 0x22;
    pub const WRITE_U32: u8 = 0x23;
    pub const WRITE_F32: u8 = 0x24;
    pub const REPLY_I8: u8 = 0x30;
    pub const REPLY_I16: u8 = 0x31;
    pub const REPLY_I32: u8 = 0x32;
    pub const REPLY_U32: u8 = 0x33;
    pub const REPLY_F32: u8 = 0x34;
}

/// Round a payload length up to the next valid DLC size.
pub fn round_up_dlc(len: usize) -> Option<usize> {
    DLC_SIZES.iter().copied().find(|&s| s >= len)
}

/// Pad a payload in place to a valid DLC length.
pub fn pad_to_dlc(payload: &mut Vec<u8, MAX_PAYLOAD>) {
    if let Some(target) = round_up_dlc(payload.len()) {
        while payload.len() < target {
            let _ = payload.push(PAD_BYTE);
        }
    }
}

/// Assemble the 29-bit arbitration id.
pub fn frame_id(prefix: u16, source: u8, destination: u8) -> Id {
    let raw = ((prefix as u32 & 0x1FFF) << 16) | ((source as u32) << 8) | destination as u32;
    // The prefix is bounded by configuration; the id always fits 29 bits.
    Id::Extended(ExtendedId::new(raw).unwrap_or(ExtendedId::ZERO))
}

/// Split an arbitration id back into (prefix, source, destination).
pub fn split_id(id: u32) -> (u16, u8, u8) {
    (((id >> 16) & 0x1FFF) as u16, (id >> 8) as u8, id as u8)
}

fn value_size(op_base: u8, op: u8) -> usize {
    match op - op_base {
        0 => 1,
        1 => 2,
        2 | 3 | 4 => 4,
        _ => 0,
    }
}

fn read_value(kind: u8, bytes: &[u8]) -> Option<RegValue> {
    Some(match kind {
        0 => RegValue::I8(bytes[0] as i8),
        1 => RegValue::I16(i16::from_le_bytes([bytes[0], bytes[1]])),
        2 => RegValue::I32(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        3 => RegValue::U32(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        4 => RegValue::F32(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        _ => return None,
    })
}

fn convert(value: RegValue, kind: u8) -> RegValue {
    match kind {
        0 => RegValue::I8(value.as_f32() as i8),
        1 => RegValue::I16(value.as_f32() as i16),
        2 => RegValue::I32(value.as_f32() as i32),
        3 => RegValue::U32(value.as_u32()),
        _ => RegValue::F32(value.as_f32()),
    }
}

fn push_value(out: &mut Vec<u8, MAX_PAYLOAD>, value: RegValue) -> bool {
    let result = match value {
        RegValue::I8(v) => out.push(v as u8).map_err(|_| ()),
        RegValue::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
        RegValue::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
        RegValue::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
        RegValue::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
    };
    result.is_ok()
}

/// Result of processing one frame.
pub struct FrameResult {
    pub reply: Vec<u8, MAX_PAYLOAD>,
    /// Reply flags; OVERFLOW set when the reply was truncated.
    pub flags: u8,
}

/// Process one frame payload against the register file.
///
/// Subframes execute strictly in order; all writes have been applied by
/// the time the first reply byte is produced, because replies only append
/// to the output buffer.
pub fn process_frame(payload: &[u8], registers: &mut RegisterFile) -> FrameResult {
    let mut reply: Vec<u8, MAX_PAYLOAD> = Vec::new();
    let mut flags = frame_flags::FD;
    let mut cursor = 0usize;

    while cursor < payload.len() {
        let op = payload[cursor];
        cursor += 1;
        match op {
            opcode::NOP | PAD_BYTE => continue,
            op if (opcode::READ_I8..=opcode::READ_F32).contains(&op) => {
                let kind = op - opcode::READ_I8;
                let Some(&count) = payload.get(cursor) else { break };
                let Some(start_bytes) = payload.get(cursor + 1..cursor + 3) else {
                    break;
                };
                cursor += 3;
                let start = u16::from_le_bytes([start_bytes[0], start_bytes[1]]);

                // Reply subframe header mirrors the request.
                let header_at = reply.len();
                let header_ok = reply.push(opcode::REPLY_I8 + kind).is_ok()
                    && reply.push(count).is_ok()
                    && reply.extend_from_slice(&start.to_le_bytes()).is_ok();
                if !header_ok {
                    reply.truncate(header_at);
                    flags |= frame_flags::OVERFLOW;
                    break;
                }
                let mut replied = 0u8;
                for i in 0..count {
                    let address = start.wrapping_add(i as u16);
                    let value = match registers.read(address) {
                        Ok(v) => convert(v, kind),
                        // Unknown or write-only registers read as zero of
                        // the requested width; the host sees the gap.
                        Err(_) => convert(RegValue::I32(0), kind),
                    };
                    if !push_value(&mut reply, value) {
                        flags |= frame_flags::OVERFLOW;
                        break;
                    }
                    replied += 1;
                }
                if replied != count {
                    // Patch the count to what actually fit.
                    reply[header_at + 1] = replied;
                    break;
                }
            }
            op if (opcode::WRITE_I8..=opcode::WRITE_F32).contains(&op) => {
                let kind = op - opcode::WRITE_I8;
                let size = value_size(opcode::WRITE_I8, op);
                let Some(&count) = payload.get(cursor) else { break };
                let Some(start_bytes) = payload.get(cursor + 1..cursor + 3) else {
                    break;
                };
                cursor += 3;
                let start = u16::from_le_bytes([start_bytes[0], start_bytes[1]]);
                for i in 0..count {
                    let Some(bytes) = payload.get(cursor..cursor + size) else {
                        cursor = payload.len();
                        break;
                    };
                    cursor += size;
                    let Some(value) = read_value(kind, bytes) else {
                        continue;
                    };
                    let address = start.wrapping_add(i as u16);
                    if let Err(error) = registers.write(address, value) {
                        // Bad writes are dropped, not replied; matching
                        // the bounded-reply budget.
                        let _ = error;
                    }
                }
            }
            _ => {
                // Unknown opcode: cannot resynchronize within this frame.
                break;
            }
        }
    }

    FrameResult { reply, flags }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::comms::registers::{
        REG_CFG_MAX_TORQUE, REG_CMD_POSITION, REG_VOLTAGE, RegisterFile,
    };
    use crate::firmware::config::ServoConfig;
    use crate::firmware::telemetry::ControlCycleSnapshot;

    fn file() -> RegisterFile {
        RegisterFile::new(ServoConfig::default())
    }

    fn write_f32(payload: &mut Vec<u8, MAX_PAYLOAD>, address: u16, value: f32) {
        payload.push(opcode::WRITE_F32).unwrap();
        payload.push(1).unwrap();
        payload.extend_from_slice(&address.to_le_bytes()).unwrap();
        payload.extend_from_slice(&value.to_le_bytes()).unwrap();
    }

    fn read_f32(payload: &mut Vec<u8, MAX_PAYLOAD>, address: u16, count: u8) {
        payload.push(opcode::READ_F32).unwrap();
        payload.push(count).unwrap();
        payload.extend_from_slice(&address.to_le_bytes()).unwrap();
    }

    #[test]
    fn dlc_rounding() {
        assert_eq!(round_up_dlc(0), Some(0));
        assert_eq!(round_up_dlc(5), Some(5));
        assert_eq!(round_up_dlc(9), Some(12));
        assert_eq!(round_up_dlc(13), Some(16));
        assert_eq!(round_up_dlc(33), Some(48));
        assert_eq!(round_up_dlc(49), Some(64));
        assert_eq!(round_up_dlc(64), Some(64));
        assert_eq!(round_up_dlc(65), None);
    }

    #[test]
    fn padding_uses_pad_byte() {
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        pad_to_dlc(&mut payload);
        assert_eq!(payload.len(), 12);
        assert_eq!(&payload[9..], &[PAD_BYTE; 3]);
    }

    #[test]
    fn id_layout_round_trip() {
        let id = frame_id(0x0050, 0x12, 0x34);
        let Id::Extended(ext) = id else {
            panic!("expected extended id")
        };
        assert_eq!(split_id(ext.as_raw()), (0x0050, 0x12, 0x34));
    }

    #[test]
    fn write_then_read_in_one_frame_sees_new_value() {
        let mut registers = file();
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        write_f32(&mut payload, REG_CMD_POSITION, 2.5);
        read_f32(&mut payload, REG_CMD_POSITION, 1);

        let result = process_frame(&payload, &mut registers);
        assert_eq!(result.flags & frame_flags::OVERFLOW, 0);
        // Reply: header (4 bytes) + one f32.
        assert_eq!(result.reply.len(), 8);
        assert_eq!(result.reply[0], opcode::REPLY_F32);
        assert_eq!(result.reply[1], 1);
        let value = f32::from_le_bytes(result.reply[4..8].try_into().unwrap());
        assert_eq!(value, 2.5);
    }

    #[test]
    fn consecutive_register_read() {
        let mut registers = file();
        let mut snap = ControlCycleSnapshot::default();
        snap.vbus = 24.0;
        registers.update_snapshot(snap, 0);

        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        read_f32(&mut payload, REG_VOLTAGE, 1);
        let result = process_frame(&payload, &mut registers);
        let value = f32::from_le_bytes(result.reply[4..8].try_into().unwrap());
        assert_eq!(value, 24.0);
    }

    #[test]
    fn nop_and_padding_skipped() {
        let mut registers = file();
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        payload.push(opcode::NOP).unwrap();
        payload.push(PAD_BYTE).unwrap();
        read_f32(&mut payload, REG_CMD_POSITION, 1);
        payload.push(PAD_BYTE).unwrap();

        let result = process_frame(&payload, &mut registers);
        assert_eq!(result.reply[0], opcode::REPLY_F32);
    }

    #[test]
    fn oversized_read_truncates_with_overflow_flag() {
        let mut registers = file();
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        // 20 f32 registers = 80 bytes of values; cannot fit.
        read_f32(&mut payload, 0x020, 20);
        let result = process_frame(&payload, &mut registers);
        assert_ne!(result.flags & frame_flags::OVERFLOW, 0);
        assert!(result.reply.len() <= MAX_PAYLOAD);
        // Patched count matches what fit: (64 - 4) / 4 = 15.
        assert_eq!(result.reply[1], 15);
    }

    #[test]
    fn int_read_converts_from_native() {
        let mut registers = file();
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        write_f32(&mut payload, REG_CFG_MAX_TORQUE, 3.0);
        payload.push(opcode::READ_I8).unwrap();
        payload.push(1).unwrap();
        payload
            .extend_from_slice(&REG_CFG_MAX_TORQUE.to_le_bytes())
            .unwrap();

        let result = process_frame(&payload, &mut registers);
        assert_eq!(result.reply[0], opcode::REPLY_I8);
        assert_eq!(result.reply[4] as i8, 3);
    }

    #[test]
    fn writes_apply_before_any_reply() {
        let mut registers = file();
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        // Subframes execute in frame order: a read ahead of a write sees
        // the old value, and the whole frame is applied before the reply
        // frame goes out.
        read_f32(&mut payload, REG_CMD_POSITION, 1);
        write_f32(&mut payload, REG_CMD_POSITION, 9.0);

        let result = process_frame(&payload, &mut registers);
        let value = f32::from_le_bytes(result.reply[4..8].try_into().unwrap());
        assert!(value.is_nan(), "default staged position is NaN");
        // And the write still landed.
        use crate::firmware::comms::registers::RegValue;
        assert_eq!(
            registers.read(REG_CMD_POSITION).unwrap(),
            RegValue::F32(9.0)
        );
    }

    #[test]
    fn unknown_opcode_stops_processing() {
        let mut registers = file();
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        payload.push(0xEE).unwrap();
        read_f32(&mut payload, REG_CMD_POSITION, 1);
        let result = process_frame(&payload, &mut registers);
        assert!(result.reply.is_empty());
    }
}
