//! The free-sector bitmap: one bit per sector on the volume.
//!
//! The bitmap itself lives in an ordinary file whose inode occupies the
//! reserved [`FREE_MAP_SECTOR`](crate::param::FREE_MAP_SECTOR) — its data
//! sectors are allocated the same way any other file's are, through this
//! same `FreeMap`'s own `allocate`. That bootstraps cleanly as long as the
//! sectors reserved before the free map's own data is written (its own
//! inode sector, and the root directory's) are marked used in memory
//! first; see [`FreeMap::reserve`].

use arrayvec::ArrayVec;
use log::{debug, trace};
use std::sync::Mutex;

use crate::cache::Cache;
use crate::error::{FsError, FsResult};
use crate::fs::inode::{self, external_content_guard, Dinode};
use crate::lock::Sleeplock;
use crate::param::{FREE_MAP_SECTOR, SECTOR_SIZE};

/// A bitmap of free/used sectors, held entirely in memory and backed by a
/// file on disk rooted at `FREE_MAP_SECTOR`.
#[derive(Debug)]
pub struct FreeMap {
    bits: Mutex<Vec<bool>>,
    /// Serializes access to the free map's own backing sectors, playing
    /// the role an `Inode`'s content lock would if the free map were
    /// registered in the open-inode table like an ordinary file.
    content_lock: Sleeplock<()>,
}

impl FreeMap {
    /// Creates a fresh map with every sector marked free, for formatting a
    /// new volume. Callers must `reserve` every sector claimed before the
    /// map's own backing file is laid down (its own inode sector, the root
    /// directory's), then call [`create_on_disk`](Self::create_on_disk).
    pub fn new(sector_count: u32) -> Self {
        Self {
            bits: Mutex::new(vec![false; sector_count as usize]),
            content_lock: Sleeplock::new("free map content", ()),
        }
    }

    fn bytes_needed(sector_count: usize) -> usize {
        (sector_count + 7) / 8
    }

    /// Writes the free map's own inode and its initial (all-reservations-
    /// applied) content to disk. Called exactly once, while formatting a
    /// fresh volume, after every sector the volume itself needs (its own
    /// inode sector and the root directory's) has been `reserve`d.
    pub fn create_on_disk(&self, cache: &Cache) -> FsResult<()> {
        let len = Self::bytes_needed(self.bits.lock().unwrap().len());
        inode::write_dinode(cache, FREE_MAP_SECTOR, &Dinode::new_file(false))?;
        self.persist_to(cache, len)?;
        debug!("free map created on disk ({} bytes)", len);
        Ok(())
    }

    /// Loads the bitmap from its backing file. Called once, at filesystem
    /// mount, before any other sector is allocated.
    pub fn open(cache: &Cache, sector_count: u32) -> FsResult<Self> {
        let map = Self::new(sector_count);
        let dinode = inode::read_dinode(cache, FREE_MAP_SECTOR)?;
        if dinode.magic != inode::MAGIC {
            return Err(FsError::NotFormatted);
        }
        let bytes_needed = (dinode.length as usize).min(Self::bytes_needed(sector_count as usize));

        let content = external_content_guard(&map.content_lock);
        let mut bits = map.bits.lock().unwrap();
        let mut read = 0usize;
        while read < bytes_needed {
            let chunk = (bytes_needed - read).min(SECTOR_SIZE);
            let mut buf: ArrayVec<u8, SECTOR_SIZE> = ArrayVec::new();
            buf.extend(std::iter::repeat(0u8).take(chunk));
            let n = inode::read_at(cache, FREE_MAP_SECTOR, &content, read as u32, &mut buf)?;
            debug_assert_eq!(n, chunk);
            for (i, byte) in buf.iter().enumerate() {
                for bit in 0..8 {
                    let sector_idx = (read + i) * 8 + bit;
                    if sector_idx < bits.len() {
                        bits[sector_idx] = (byte >> bit) & 1 == 1;
                    }
                }
            }
            read += chunk;
        }
        drop(bits);
        drop(content);
        debug!("free map loaded ({} sectors)", sector_count);
        Ok(map)
    }

    /// Persists the bitmap back to its backing file. Called at filesystem
    /// shutdown.
    pub fn close(&self, cache: &Cache) -> FsResult<()> {
        let len = Self::bytes_needed(self.bits.lock().unwrap().len());
        self.persist_to(cache, len)?;
        debug!("free map persisted ({} bytes)", len);
        Ok(())
    }

    fn persist_to(&self, cache: &Cache, bytes_needed: usize) -> FsResult<()> {
        let content = external_content_guard(&self.content_lock);
        let bits = self.bits.lock().unwrap();
        let mut written = 0usize;
        while written < bytes_needed {
            let chunk = (bytes_needed - written).min(SECTOR_SIZE);
            let mut buf: ArrayVec<u8, SECTOR_SIZE> = ArrayVec::new();
            for i in 0..chunk {
                let mut byte = 0u8;
                for bit in 0..8 {
                    let sector_idx = (written + i) * 8 + bit;
                    if sector_idx < bits.len() && bits[sector_idx] {
                        byte |= 1 << bit;
                    }
                }
                buf.push(byte);
            }
            inode::write_at(cache, self, FREE_MAP_SECTOR, &content, written as u32, &buf)?;
            written += chunk;
        }
        Ok(())
    }

    /// Allocates a single free sector, marking it used.
    pub fn allocate(&self) -> FsResult<u32> {
        let mut bits = self.bits.lock().unwrap();
        for (idx, used) in bits.iter_mut().enumerate() {
            if !*used {
                *used = true;
                trace!("allocated sector {}", idx);
                return Ok(idx as u32);
            }
        }
        Err(FsError::NoSpace)
    }

    /// Marks a previously-allocated sector free again.
    pub fn free(&self, sector: u32) {
        let mut bits = self.bits.lock().unwrap();
        let idx = sector as usize;
        assert!(
            idx < bits.len() && bits[idx],
            "freeing a sector that was not allocated: {}",
            sector
        );
        bits[idx] = false;
    }

    /// Reserves `sector` directly, used during formatting to claim the
    /// fixed sectors (the free map's own inode sector and the root
    /// directory's) before any sector is allocated through `allocate`.
    pub fn reserve(&self, sector: u32) {
        let mut bits = self.bits.lock().unwrap();
        bits[sector as usize] = true;
    }

    pub fn free_count(&self) -> usize {
        self.bits.lock().unwrap().iter().filter(|b| !**b).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::param::ROOT_DIR_SECTOR;
    use std::sync::Arc;

    #[test]
    fn allocate_marks_sectors_used() {
        let map = FreeMap::new(8);
        let a = map.allocate().unwrap();
        let b = map.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(map.free_count(), 6);
    }

    #[test]
    fn free_allows_reuse() {
        let map = FreeMap::new(2);
        let a = map.allocate().unwrap();
        map.free(a);
        let b = map.allocate().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exhaustion_errors_instead_of_panicking() {
        let map = FreeMap::new(1);
        map.allocate().unwrap();
        assert!(matches!(map.allocate(), Err(FsError::NoSpace)));
    }

    /// A volume large enough that the bitmap itself needs more than one
    /// sector of backing storage must not let that storage collide with
    /// the root directory's fixed sector.
    #[test]
    fn large_volume_bitmap_storage_does_not_collide_with_root_sector() {
        let sector_count = 40960u32; // bitmap needs 10 sectors, not 1
        let device = Arc::new(MemoryDevice::new(sector_count));
        let cache = Cache::new(device.clone());
        let map = FreeMap::new(sector_count);
        map.reserve(FREE_MAP_SECTOR);
        map.reserve(ROOT_DIR_SECTOR);
        map.create_on_disk(&cache).unwrap();
        cache.flush_all().unwrap();

        let dinode = inode::read_dinode(&cache, ROOT_DIR_SECTOR).unwrap();
        assert_eq!(dinode.magic, 0, "root sector must still be untouched data, not the bitmap's own inode");

        let reopened = Cache::new(device);
        let loaded = FreeMap::open(&reopened, sector_count).unwrap();
        assert_eq!(loaded.free_count(), map.free_count());
    }
}
