/// Persistent configuration in internal flash.
///
/// The last 4 KiB of flash hold two copies of the configuration blob, one
/// per 2 KiB page, written erase-then-program. Layout:
///
///   { magic u32, schema u32, crc u32, TLV... }
///
/// where each TLV is `{ tag u16, length u16, bytes }` and the tag
/// namespace is the register address space, so anything the host can
/// `conf set` is exactly what persists.

use crc::{CRC_32_CKSUM, Crc};
use embassy_stm32::Peri;
use embassy_stm32::flash::{Blocking, Flash};
use heapless::Vec;

use crate::firmware::comms::registers::{Access, REGISTERS, RegValue, RegisterFile};
use crate::firmware::config::ServoConfig;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_CKSUM);

pub const MAGIC: u32 = 0x5652_4553; // "SERV"
pub const SCHEMA: u32 = 1;

/// Maximum encoded blob size.
pub const MAX_BLOB: usize = 512;

const HEADER_LEN: usize = 12;

/// First tag of the persisted range: only configuration registers are
/// stored, never telemetry or staged command fields.
const CONFIG_BASE: u16 = 0x100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageError {
    /// No valid blob in either page.
    Missing,
    /// Magic or schema matched but the CRC did not.
    Corrupt,
    /// The flash peripheral refused the operation.
    Flash,
    /// Encoded configuration would not fit the reserved area.
    Overflow,
}

/// Serialize the persistable registers of `config` into a blob.
pub fn encode_config(config: &ServoConfig) -> Result<Vec<u8, MAX_BLOB>, StorageError> {
    let registers = RegisterFile::new(*config);
    let mut blob: Vec<u8, MAX_BLOB> = Vec::new();
    blob.extend_from_slice(&MAGIC.to_le_bytes())
        .map_err(|_| StorageError::Overflow)?;
    blob.extend_from_slice(&SCHEMA.to_le_bytes())
        .map_err(|_| StorageError::Overflow)?;
    // CRC placeholder, patched below.
    blob.extend_from_slice(&[0u8; 4])
        .map_err(|_| StorageError::Overflow)?;

    for def in REGISTERS {
        if def.address < CONFIG_BASE || def.access != Access::RW {
            continue;
        }
        let value = registers.read(def.address).map_err(|_| StorageError::Corrupt)?;
        let bytes: [u8; 4] = match value {
            RegValue::U32(v) => v.to_le_bytes(),
            other => other.as_f32().to_le_bytes(),
        };
        blob.extend_from_slice(&def.address.to_le_bytes())
            .map_err(|_| StorageError::Overflow)?;
        blob.extend_from_slice(&4u16.to_le_bytes())
            .map_err(|_| StorageError::Overflow)?;
        blob.extend_from_slice(&bytes)
            .map_err(|_| StorageError::Overflow)?;
    }

    let crc = CRC.checksum(&blob[HEADER_LEN..]);
    blob[8..12].copy_from_slice(&crc.to_le_bytes());
    Ok(blob)
}

/// Parse a blob back into a configuration, starting from `base` so fields
/// missing from an older blob keep their defaults.
pub fn decode_config(bytes: &[u8], base: ServoConfig) -> Result<ServoConfig, StorageError> {
    if bytes.len() < HEADER_LEN {
        return Err(StorageError::Missing);
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(StorageError::Missing);
    }
    let schema = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if schema != SCHEMA {
        return Err(StorageError::Missing);
    }
    let stored_crc = u32::from_le_bytes(bytes[8..12].try_into().unwrap());

    // A flash read hands back the blob plus erased 0xFF padding; the TLV
    // stream structurally ends at the first erased tag.
    let mut end = HEADER_LEN;
    while end + 4 <= bytes.len() {
        let tag = u16::from_le_bytes(bytes[end..end + 2].try_into().unwrap());
        if tag == 0xFFFF {
            break;
        }
        let length = u16::from_le_bytes(bytes[end + 2..end + 4].try_into().unwrap()) as usize;
        if end + 4 + length > bytes.len() {
            break;
        }
        end += 4 + length;
    }
    if CRC.checksum(&bytes[HEADER_LEN..end]) != stored_crc {
        return Err(StorageError::Corrupt);
    }
    let bytes = &bytes[..end];

    let mut registers = RegisterFile::new(base);
    let mut cursor = HEADER_LEN;
    while cursor + 4 <= bytes.len() {
        let tag = u16::from_le_bytes(bytes[cursor..cursor + 2].try_into().unwrap());
        let length = u16::from_le_bytes(bytes[cursor + 2..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        if cursor + length > bytes.len() {
            return Err(StorageError::Corrupt);
        }
        let value_bytes = &bytes[cursor..cursor + length];
        cursor += length;

        if length != 4 {
            // Unknown entry shape from a newer firmware: skip it.
            continue;
        }
        let raw: [u8; 4] = value_bytes.try_into().unwrap();
        // Native type decides the interpretation; unknown tags are skipped
        // so blobs remain forward compatible.
        let value = match registers.read(tag) {
            Ok(RegValue::U32(_)) => RegValue::U32(u32::from_le_bytes(raw)),
            Ok(_) => RegValue::F32(f32::from_le_bytes(raw)),
            Err(_) => continue,
        };
        let _ = registers.write(tag, value);
    }

    Ok(*registers.config())
}

/// The two reserved pages at the top of the 512 KiB flash.
const PAGE_A_OFFSET: u32 = 0x7F000;
const PAGE_B_OFFSET: u32 = 0x7F800;
const PAGE_SIZE: u32 = 2048;

pub struct ConfigStorage {
    flash: Flash<'static, Blocking>,
}

impl ConfigStorage {
    pub fn new(flash: Peri<'static, embassy_stm32::peripherals::FLASH>) -> Self {
        Self {
            flash: Flash::new_blocking(flash),
        }
    }

    /// Load the configuration, preferring page A, falling back to B.
    pub fn load(&mut self, base: ServoConfig) -> Result<ServoConfig, StorageError> {
        for offset in [PAGE_A_OFFSET, PAGE_B_OFFSET] {
            let mut buffer = [0u8; MAX_BLOB];
            if self.flash.blocking_read(offset, &mut buffer).is_err() {
                continue;
            }
            match decode_config(&buffer, base) {
                Ok(config) => return Ok(config),
                Err(StorageError::Missing) | Err(StorageError::Corrupt) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::Missing)
    }

    /// Persist the configuration to both pages, erase then program.
    pub fn store(&mut self, config: &ServoConfig) -> Result<(), StorageError> {
        let blob = encode_config(config)?;
        // Flash programs in double words; pad the image out.
        let mut padded = [0xFFu8; MAX_BLOB];
        padded[..blob.len()].copy_from_slice(&blob);
        let write_len = blob.len().div_ceil(8) * 8;

        for offset in [PAGE_A_OFFSET, PAGE_B_OFFSET] {
            self.flash
                .blocking_erase(offset, offset + PAGE_SIZE)
                .map_err(|_| StorageError::Flash)?;
            self.flash
                .blocking_write(offset, &padded[..write_len])
                .map_err(|_| StorageError::Flash)?;
        }
        defmt::info!("configuration persisted ({} bytes)", blob.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom_config() -> ServoConfig {
        let mut config = ServoConfig::default();
        config.motor.pole_pairs = 11;
        config.motor.phase_resistance_ohm = 0.123;
        config.motor.torque_constant_nm_per_a = 0.045;
        config.position_pid.kp = 17.0;
        config.limits.max_torque_nm = 2.5;
        config.supply.v_min = 11.5;
        config.pwm.frequency_hz = 40_000;
        config
    }

    #[test]
    fn encode_decode_round_trip() {
        let config = custom_config();
        let blob = encode_config(&config).unwrap();
        let decoded = decode_config(&blob, ServoConfig::default()).unwrap();
        assert_eq!(decoded.motor.pole_pairs, 11);
        assert_eq!(decoded.motor.phase_resistance_ohm, 0.123);
        assert_eq!(decoded.position_pid.kp, 17.0);
        assert_eq!(decoded.limits.max_torque_nm, 2.5);
        assert_eq!(decoded.supply.v_min, 11.5);
        assert_eq!(decoded.pwm.frequency_hz, 40_000);
    }

    #[test]
    fn nan_fields_survive_the_round_trip() {
        let config = ServoConfig::default();
        assert!(config.limits.position_min.is_nan());
        let blob = encode_config(&config).unwrap();
        let decoded = decode_config(&blob, ServoConfig::default()).unwrap();
        assert!(decoded.limits.position_min.is_nan());
    }

    #[test]
    fn corrupt_crc_rejected() {
        let config = custom_config();
        let mut blob = encode_config(&config).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        assert_eq!(
            decode_config(&blob, ServoConfig::default()),
            Err(StorageError::Corrupt)
        );
    }

    #[test]
    fn wrong_magic_is_missing() {
        let config = custom_config();
        let mut blob = encode_config(&config).unwrap();
        blob[0] ^= 0xFF;
        assert_eq!(
            decode_config(&blob, ServoConfig::default()),
            Err(StorageError::Missing)
        );
    }

    #[test]
    fn unknown_tags_are_skipped() {
        let config = custom_config();
        let mut blob = encode_config(&config).unwrap();
        // Append a TLV with an unallocated tag and fix up the CRC.
        blob.extend_from_slice(&0x7EEEu16.to_le_bytes()).unwrap();
        blob.extend_from_slice(&4u16.to_le_bytes()).unwrap();
        blob.extend_from_slice(&[1, 2, 3, 4]).unwrap();
        let crc = CRC.checksum(&blob[HEADER_LEN..]);
        blob[8..12].copy_from_slice(&crc.to_le_bytes());

        let decoded = decode_config(&blob, ServoConfig::default()).unwrap();
        assert_eq!(decoded.motor.pole_pairs, 11);
    }

    #[test]
    fn truncated_tlv_is_corrupt() {
        let config = custom_config();
        let blob = encode_config(&config).unwrap();
        // Chop mid-TLV but keep a consistent CRC over the shortened body.
        let mut short: Vec<u8, MAX_BLOB> = Vec::from_slice(&blob[..blob.len() - 2]).unwrap();
        let crc = CRC.checksum(&short[HEADER_LEN..]);
        short[8..12].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(
            decode_config(&short, ServoConfig::default()),
            Err(StorageError::Corrupt)
        );
    }
}
