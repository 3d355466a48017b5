//! The storage boundary the cache reads through and writes back to.
//!
//! A real deployment would back this with a block device driver; this
//! crate only defines the contract and ships an in-memory implementation
//! for tests.

use std::sync::Mutex;

use crate::param::SECTOR_SIZE;

/// A single fixed-size sector.
pub type Sector = [u8; SECTOR_SIZE];

/// A randomly addressable, sector-granularity storage device.
///
/// Implementations must be safe to call from multiple threads; the cache
/// serializes access to any individual sector itself but may dispatch
/// reads/writes for distinct sectors concurrently.
pub trait BlockDevice: Send + Sync {
    /// Total number of sectors on the device.
    fn sector_count(&self) -> u32;

    /// Reads sector `sector` into `buf`.
    fn read_sector(&self, sector: u32, buf: &mut Sector) -> std::io::Result<()>;

    /// Writes `buf` to sector `sector`.
    fn write_sector(&self, sector: u32, buf: &Sector) -> std::io::Result<()>;
}

/// A `BlockDevice` backed by a `Vec` of zeroed sectors, for tests and for
/// hosts with no real storage attached.
#[derive(Debug)]
pub struct MemoryDevice {
    sectors: Mutex<Vec<Sector>>,
}

impl MemoryDevice {
    pub fn new(sector_count: u32) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; sector_count as usize]),
        }
    }
}

impl BlockDevice for MemoryDevice {
    fn sector_count(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }

    fn read_sector(&self, sector: u32, buf: &mut Sector) -> std::io::Result<()> {
        let sectors = self.sectors.lock().unwrap();
        let src = sectors.get(sector as usize).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "sector out of range")
        })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_sector(&self, sector: u32, buf: &Sector) -> std::io::Result<()> {
        let mut sectors = self.sectors.lock().unwrap();
        let dst = sectors.get_mut(sector as usize).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "sector out of range")
        })?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_sector() {
        let dev = MemoryDevice::new(4);
        let mut data = [0u8; SECTOR_SIZE];
        data[0] = 0xab;
        dev.write_sector(2, &data).unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        dev.read_sector(2, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn rejects_out_of_range_sectors() {
        let dev = MemoryDevice::new(1);
        let data = [0u8; SECTOR_SIZE];
        assert!(dev.write_sector(5, &data).is_err());
    }
}
