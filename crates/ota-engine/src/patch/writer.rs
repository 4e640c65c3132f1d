//! Granule output to flash

use ota_errors::{OtaError, PatchError};
use tracing::trace;

use super::PatchOutput;
use crate::flash::ENCRYPT_ADDR_FLAG;
use crate::partition::{CRC_PAYLOAD_SIZE, CRC_RECORD_SIZE, PartitionFlags};
use crate::storage::OtaStorage;

const GRANULE: usize = CRC_PAYLOAD_SIZE as usize;
const RECORD: usize = CRC_RECORD_SIZE as usize;

const CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MCRF4XX);

/// Record checksum for one 32-byte granule, in stored byte order.
///
/// The device stores the bit-reflected CRC-16/MCRF4XX high byte first.
pub fn granule_crc(granule: &[u8]) -> [u8; 2] {
    CRC16.checksum(granule).reverse_bits().to_be_bytes()
}

/// Writes rebuilt data to flash in 32-byte granules.
///
/// Plain partitions are written straight through. CRC-framed partitions get
/// a 34-byte record per granule at `base + (pos / 32) * 34`; encrypted ones
/// have the encryption flag set on every address. The last partial granule
/// is zero-padded by [`finish`](Self::finish).
#[derive(Debug)]
pub struct GranuleWriter<'a> {
    storage: &'a mut OtaStorage,
    base: u32,
    flags: PartitionFlags,
    cache: [u8; RECORD],
    cached: usize,
    granule_pos: u64,
    next_pos: u64,
}

impl<'a> GranuleWriter<'a> {
    /// Writer for a file starting at physical address `base`.
    pub fn new(storage: &'a mut OtaStorage, base: u32, flags: PartitionFlags) -> Self {
        Self {
            storage,
            base,
            flags,
            cache: [0u8; RECORD],
            cached: 0,
            granule_pos: 0,
            next_pos: 0,
        }
    }

    /// Logical bytes accepted so far.
    pub fn position(&self) -> u64 {
        self.next_pos
    }

    fn buffered(&self) -> bool {
        self.flags.crc || self.flags.encrypted
    }

    fn address(&self, logical: u64) -> Result<u32, OtaError> {
        let physical = if self.flags.crc {
            (logical / GRANULE as u64).saturating_mul(RECORD as u64)
        } else {
            logical
        };
        let addr = u32::try_from(physical)
            .ok()
            .and_then(|p| self.base.checked_add(p))
            .ok_or_else(|| PatchError::failed(format!("output position {logical:#x} beyond flash")))?;
        if self.flags.encrypted {
            Ok(addr | ENCRYPT_ADDR_FLAG)
        } else {
            Ok(addr)
        }
    }

    fn flush_granule(&mut self) -> Result<(), OtaError> {
        let addr = self.address(self.granule_pos)?;
        let len = if self.flags.crc {
            let crc = granule_crc(self.cache.get(..GRANULE).unwrap_or_default());
            if let Some(slot) = self.cache.get_mut(GRANULE..RECORD) {
                slot.copy_from_slice(&crc);
            }
            RECORD
        } else {
            GRANULE
        };
        trace!(addr, pos = self.granule_pos, "flush granule");
        self.storage
            .write(addr, self.cache.get(..len).unwrap_or_default())?;
        self.granule_pos = self.granule_pos.saturating_add(GRANULE as u64);
        self.cached = 0;
        Ok(())
    }

    /// Flush a trailing partial granule, zero-padded, and return the number of
    /// logical bytes written.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the final write.
    pub fn finish(mut self) -> Result<u64, OtaError> {
        if self.buffered() && self.cached > 0 {
            if let Some(tail) = self.cache.get_mut(self.cached..GRANULE) {
                tail.fill(0);
            }
            self.flush_granule()?;
        }
        Ok(self.next_pos)
    }
}

impl PatchOutput for GranuleWriter<'_> {
    fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<(), OtaError> {
        if pos != self.next_pos {
            return Err(PatchError::NonSequential {
                expected: self.next_pos,
                actual: pos,
            }
            .into());
        }
        if !self.buffered() {
            let addr = self.address(pos)?;
            self.storage.write(addr, data)?;
            self.next_pos = pos.saturating_add(data.len() as u64);
            return Ok(());
        }

        let mut rest = data;
        while !rest.is_empty() {
            let take = GRANULE.saturating_sub(self.cached).min(rest.len());
            let (head, tail) = rest.split_at(take);
            if let Some(slot) = self.cache.get_mut(self.cached..self.cached.saturating_add(take)) {
                slot.copy_from_slice(head);
            }
            self.cached = self.cached.saturating_add(take);
            rest = tail;
            if self.cached == GRANULE {
                self.flush_granule()?;
            }
        }
        self.next_pos = pos.saturating_add(data.len() as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFlash;

    /// Bitwise CRC-16 as the boot ROM computes it.
    fn rom_crc16(data: &[u8]) -> [u8; 2] {
        let mut crc: u16 = 0xFFFF;
        for &b in data {
            crc ^= u16::from(b);
            for _ in 0..8 {
                crc = if crc & 1 != 0 { (crc >> 1) ^ 0x8408 } else { crc >> 1 };
            }
        }
        let stored = crc.reverse_bits().swap_bytes();
        stored.to_le_bytes()
    }

    #[test]
    fn test_granule_crc_matches_rom() {
        let data: Vec<u8> = (0..32u8).map(|b| b.wrapping_mul(7)).collect();
        assert_eq!(granule_crc(&data), rom_crc16(&data));
        assert_eq!(granule_crc(&[0u8; 32]), rom_crc16(&[0u8; 32]));
    }

    #[test]
    fn test_plain_writes_pass_through() -> Result<(), OtaError> {
        let flash = SimFlash::new(0x1_0000);
        let mut storage = OtaStorage::new(Box::new(flash.clone()));
        let mut writer = GranuleWriter::new(&mut storage, 0x1000, PartitionFlags::default());
        writer.write_at(0, b"abc")?;
        writer.write_at(3, b"def")?;
        assert_eq!(writer.finish()?, 6);
        assert_eq!(flash.slice(0x1000, 6), b"abcdef".to_vec());
        Ok(())
    }

    #[test]
    fn test_crc_records_and_padding() -> Result<(), OtaError> {
        let flash = SimFlash::new(0x1_0000);
        let mut storage = OtaStorage::new(Box::new(flash.clone()));
        let flags = PartitionFlags {
            crc: true,
            encrypted: false,
        };
        let data: Vec<u8> = (0..40u8).collect();
        let mut writer = GranuleWriter::new(&mut storage, 0x2000, flags);
        writer.write_at(0, data.get(..10).unwrap_or_default())?;
        writer.write_at(10, data.get(10..).unwrap_or_default())?;
        assert_eq!(writer.finish()?, 40);

        let first = flash.slice(0x2000, 34);
        assert_eq!(first.get(..32), data.get(..32));
        assert_eq!(first.get(32..), Some(granule_crc(data.get(..32).unwrap_or_default()).as_slice()));

        let mut padded = data.get(32..).unwrap_or_default().to_vec();
        padded.resize(32, 0);
        let second = flash.slice(0x2022, 34);
        assert_eq!(second.get(..32), Some(padded.as_slice()));
        assert_eq!(second.get(32..), Some(granule_crc(&padded).as_slice()));
        Ok(())
    }

    #[test]
    fn test_gap_is_rejected() {
        let flash = SimFlash::new(0x1_0000);
        let mut storage = OtaStorage::new(Box::new(flash));
        let mut writer = GranuleWriter::new(&mut storage, 0, PartitionFlags::default());
        assert!(matches!(
            writer.write_at(4, b"x"),
            Err(OtaError::Patch(PatchError::NonSequential { .. }))
        ));
    }
}
