//! The sector buffer cache: a fixed pool of in-memory slots shared by
//! every reader and writer of the volume, with clock (second-chance)
//! eviction.
//!
//! Lookup and eviction bookkeeping is serialized by `table`. Once a
//! sector has been admitted into a slot, callers hold a [`CacheGuard`]
//! referencing that slot's own lock, so transferring bytes in and out of
//! an already-resident sector does not contend with lookups for other
//! sectors. The table lock is always acquired before any slot lock, and
//! no code path ever holds two slot locks at once.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use array_macro::array;
use log::{debug, trace, warn};

use crate::device::{BlockDevice, Sector};
use crate::lock::{Sleeplock, Spinlock};
use crate::param::{CACHE_CHANCES_INIT, CACHE_SLOTS, SECTOR_SIZE};

/// Whether admitting a sector on a cache miss needs to read the device
/// first, or whether the caller is about to clobber every byte anyway.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Fill {
    FromDevice,
    WholeSectorWrite,
}

#[derive(Debug)]
struct Slot {
    sector: Option<u32>,
    data: Sector,
    dirty: bool,
    chances: u32,
    pins: u32,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            sector: None,
            data: [0u8; SECTOR_SIZE],
            dirty: false,
            chances: 0,
            pins: 0,
        }
    }
}

#[derive(Default)]
struct RawStats {
    accesses: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Cumulative cache access counters, exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub accesses: u64,
    pub hits: u64,
    pub misses: u64,
}

pub struct Cache {
    device: Arc<dyn BlockDevice>,
    table: Spinlock<HashMap<u32, usize>>,
    clock_hand: Spinlock<usize>,
    slots: [Sleeplock<Slot>; CACHE_SLOTS],
    stats: RawStats,
}

impl Cache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            table: Spinlock::new("cache table", HashMap::with_capacity(CACHE_SLOTS)),
            clock_hand: Spinlock::new("cache clock", 0),
            slots: array![_ => Sleeplock::new("cache slot", Slot::empty()); CACHE_SLOTS],
            stats: RawStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            accesses: self.stats.accesses.load(Ordering::Relaxed),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
        }
    }

    /// Pins `sector` into a slot, loading it from the device first if it
    /// isn't already resident, and returns a guard over that slot.
    pub fn get(&self, sector: u32) -> io::Result<CacheGuard<'_>> {
        self.get_with(sector, Fill::FromDevice)
    }

    /// Pins `sector` the way [`get`](Self::get) does, but on a miss skips
    /// the device read entirely: the caller is about to overwrite the
    /// whole 512 bytes (a freshly allocated data sector, or a dinode
    /// being written in full) and has no use for whatever garbage
    /// currently lives there.
    pub fn get_for_whole_sector_write(&self, sector: u32) -> io::Result<CacheGuard<'_>> {
        self.get_with(sector, Fill::WholeSectorWrite)
    }

    fn get_with(&self, sector: u32, fill: Fill) -> io::Result<CacheGuard<'_>> {
        self.stats.accesses.fetch_add(1, Ordering::Relaxed);
        let idx = self.admit(sector, fill)?;
        self.slots[idx].lock().pins += 1;
        Ok(CacheGuard {
            cache: self,
            slot: idx,
        })
    }

    /// Resolves `sector` to a slot index, evicting a victim and loading
    /// from the device on a miss (unless `fill` says the caller is about
    /// to overwrite the sector wholesale).
    ///
    /// `table` is held only long enough to pick the victim and update its
    /// mapping; it is released before any device I/O so that lookups for
    /// other sectors (hits in particular) never queue up behind a write-back
    /// or a read. The victim's own slot lock stays held across the I/O,
    /// which is what keeps a second admission of `sector` from racing this
    /// one: any concurrent caller sees the reservation already in `table`,
    /// resolves it as a hit, and simply blocks on the slot lock until this
    /// load finishes.
    fn admit(&self, sector: u32, fill: Fill) -> io::Result<usize> {
        let mut table = self.table.lock();
        if let Some(&idx) = table.get(&sector) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            drop(table);
            self.slots[idx].lock().chances = CACHE_CHANCES_INIT;
            trace!("cache hit sector {}", sector);
            return Ok(idx);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let victim = self.find_victim()?;
        let mut slot = self.slots[victim].lock();
        let old_sector = slot.sector.take();
        if let Some(old_sector) = old_sector {
            table.remove(&old_sector);
        }
        table.insert(sector, victim);
        drop(table);

        let loaded = self.load_victim(&mut slot, old_sector, victim, sector, fill);
        if let Err(e) = loaded {
            slot.sector = None;
            slot.dirty = false;
            drop(slot);
            self.table.lock().remove(&sector);
            return Err(e);
        }

        slot.sector = Some(sector);
        slot.chances = CACHE_CHANCES_INIT;
        trace!("cache miss, loaded sector {} into slot {}", sector, victim);
        Ok(victim)
    }

    /// Writes back `old_sector` if it was dirty, then fills the slot with
    /// `sector`'s contents (or skips the read for a whole-sector write).
    /// Runs with only the slot's own lock held.
    fn load_victim(
        &self,
        slot: &mut Slot,
        old_sector: Option<u32>,
        victim: usize,
        sector: u32,
        fill: Fill,
    ) -> io::Result<()> {
        if let Some(old_sector) = old_sector {
            if slot.dirty {
                debug!("evicting dirty sector {} from slot {}", old_sector, victim);
                self.device.write_sector(old_sector, &slot.data)?;
                slot.dirty = false;
            }
        }
        match fill {
            Fill::FromDevice => self.device.read_sector(sector, &mut slot.data)?,
            Fill::WholeSectorWrite => trace!("skipping device read for whole-sector write of sector {}", sector),
        }
        Ok(())
    }

    /// Runs the clock sweep to find a free or expired slot. Every slot is
    /// visited at most twice before this gives up, matching the fact that
    /// a slot's chance budget is spent on the first pass and it becomes
    /// evictable on the second.
    fn find_victim(&self) -> io::Result<usize> {
        let mut hand = self.clock_hand.lock();
        let limit = CACHE_SLOTS * 2 + 1;
        for _ in 0..limit {
            let idx = *hand;
            *hand = (*hand + 1) % CACHE_SLOTS;

            let mut slot = self.slots[idx].lock();
            if slot.sector.is_none() {
                return Ok(idx);
            }
            if slot.pins > 0 {
                continue;
            }
            if slot.chances > 0 {
                slot.chances -= 1;
                continue;
            }
            return Ok(idx);
        }
        warn!("cache exhausted: every slot is pinned");
        Err(io::Error::new(
            io::ErrorKind::Other,
            "buffer cache exhausted: all slots pinned",
        ))
    }

    /// Writes every dirty slot back to the device. Called when the
    /// filesystem shuts down.
    pub fn flush_all(&self) -> io::Result<()> {
        for slot_lock in &self.slots {
            let mut slot = slot_lock.lock();
            if let (Some(sector), true) = (slot.sector, slot.dirty) {
                self.device.write_sector(sector, &slot.data)?;
                slot.dirty = false;
            }
        }
        Ok(())
    }

    /// Drops `sector` from the cache without writing it back, used when a
    /// sector is freed and its old contents are no longer meaningful.
    pub fn invalidate(&self, sector: u32) {
        let mut table = self.table.lock();
        if let Some(idx) = table.remove(&sector) {
            let mut slot = self.slots[idx].lock();
            slot.sector = None;
            slot.dirty = false;
        }
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("slots", &CACHE_SLOTS)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A pinned reference to a resident cache slot. While a guard is alive,
/// the clock sweep will never select its slot as an eviction victim.
pub struct CacheGuard<'c> {
    cache: &'c Cache,
    slot: usize,
}

impl CacheGuard<'_> {
    pub fn sector(&self) -> u32 {
        self.cache.slots[self.slot]
            .lock()
            .sector
            .expect("guard references an empty slot")
    }

    pub fn read_all(&self, out: &mut Sector) {
        out.copy_from_slice(&self.cache.slots[self.slot].lock().data);
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= SECTOR_SIZE, "read past sector end");
        let slot = self.cache.slots[self.slot].lock();
        buf.copy_from_slice(&slot.data[offset..offset + buf.len()]);
    }

    pub fn write_at(&self, offset: usize, buf: &[u8]) {
        assert!(offset + buf.len() <= SECTOR_SIZE, "write past sector end");
        let mut slot = self.cache.slots[self.slot].lock();
        slot.data[offset..offset + buf.len()].copy_from_slice(buf);
        slot.dirty = true;
        slot.chances = CACHE_CHANCES_INIT;
    }

    pub fn zero(&self) {
        let mut slot = self.cache.slots[self.slot].lock();
        slot.data = [0u8; SECTOR_SIZE];
        slot.dirty = true;
        slot.chances = CACHE_CHANCES_INIT;
    }
}

impl Drop for CacheGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.cache.slots[self.slot].lock();
        slot.pins = slot.pins.saturating_sub(1);
    }
}

impl fmt::Debug for CacheGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheGuard").field("slot", &self.slot).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, MemoryDevice};
    use std::sync::atomic::AtomicUsize;

    fn cache_with(sectors: u32) -> Cache {
        Cache::new(Arc::new(MemoryDevice::new(sectors)))
    }

    /// Wraps a `MemoryDevice`, counting `read_sector` calls so tests can
    /// assert on whether the cache actually touched the device.
    struct CountingDevice {
        inner: MemoryDevice,
        reads: AtomicUsize,
    }

    impl CountingDevice {
        fn new(sectors: u32) -> Self {
            Self {
                inner: MemoryDevice::new(sectors),
                reads: AtomicUsize::new(0),
            }
        }
    }

    impl BlockDevice for CountingDevice {
        fn sector_count(&self) -> u32 {
            self.inner.sector_count()
        }

        fn read_sector(&self, sector: u32, buf: &mut Sector) -> io::Result<()> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            self.inner.read_sector(sector, buf)
        }

        fn write_sector(&self, sector: u32, buf: &Sector) -> io::Result<()> {
            self.inner.write_sector(sector, buf)
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let cache = cache_with(4);
        {
            let guard = cache.get(1).unwrap();
            guard.write_at(0, b"hello");
        }
        let guard = cache.get(1).unwrap();
        let mut buf = [0u8; 5];
        guard.read_at(0, &mut buf);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn repeated_access_is_a_hit() {
        let cache = cache_with(4);
        let _ = cache.get(0).unwrap();
        let _ = cache.get(0).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn eviction_flushes_dirty_slots() {
        let cache = cache_with((CACHE_SLOTS as u32) + 1);
        for s in 0..CACHE_SLOTS as u32 {
            let guard = cache.get(s).unwrap();
            guard.write_at(0, &[s as u8]);
        }
        // One more distinct sector forces an eviction.
        let guard = cache.get(CACHE_SLOTS as u32).unwrap();
        guard.write_at(0, &[0xff]);
        drop(guard);

        // Re-fetch sector 0; whether it was evicted or not, its write
        // must have survived via flush-on-evict.
        let guard = cache.get(0).unwrap();
        let mut buf = [0u8; 1];
        guard.read_at(0, &mut buf);
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn pinned_slots_are_not_evicted() {
        let cache = cache_with((CACHE_SLOTS as u32) + 1);
        let pinned = cache.get(0).unwrap();
        for s in 1..=CACHE_SLOTS as u32 {
            let _ = cache.get(s).unwrap();
        }
        assert_eq!(pinned.sector(), 0);
    }

    #[test]
    fn exhausting_every_slot_with_pins_errors_instead_of_looping_forever() {
        let cache = cache_with((CACHE_SLOTS as u32) + 1);
        let _guards: Vec<_> = (0..CACHE_SLOTS as u32).map(|s| cache.get(s).unwrap()).collect();
        assert!(cache.get(CACHE_SLOTS as u32).is_err());
    }

    #[test]
    fn a_hit_does_not_block_behind_a_concurrent_miss_s_device_io() {
        use std::sync::{Barrier, Mutex as StdMutex};
        use std::thread;

        /// Blocks inside `read_sector` for one designated sector until
        /// released, so a test can pin a miss mid-flight.
        struct GatedDevice {
            inner: MemoryDevice,
            gated_sector: u32,
            entered: Barrier,
            release: StdMutex<bool>,
            released_cond: std::sync::Condvar,
        }

        impl BlockDevice for GatedDevice {
            fn sector_count(&self) -> u32 {
                self.inner.sector_count()
            }

            fn read_sector(&self, sector: u32, buf: &mut Sector) -> io::Result<()> {
                if sector == self.gated_sector {
                    self.entered.wait();
                    let mut released = self.release.lock().unwrap();
                    while !*released {
                        released = self.released_cond.wait(released).unwrap();
                    }
                }
                self.inner.read_sector(sector, buf)
            }

            fn write_sector(&self, sector: u32, buf: &Sector) -> io::Result<()> {
                self.inner.write_sector(sector, buf)
            }
        }

        let device = Arc::new(GatedDevice {
            inner: MemoryDevice::new(4),
            gated_sector: 1,
            entered: Barrier::new(2),
            release: StdMutex::new(false),
            released_cond: std::sync::Condvar::new(),
        });
        let cache = Arc::new(Cache::new(device.clone()));

        // Warm sector 0 so the main thread's access below is a guaranteed hit.
        drop(cache.get(0).unwrap());

        let miss_cache = cache.clone();
        let miss_thread = thread::spawn(move || {
            miss_cache.get(1).unwrap();
        });

        // Wait until the other thread is blocked inside its device read for
        // the miss on sector 1, holding only that slot's own lock.
        device.entered.wait();

        let guard = cache.get(0).unwrap();
        assert_eq!(guard.sector(), 0);
        drop(guard);

        *device.release.lock().unwrap() = true;
        device.released_cond.notify_all();
        miss_thread.join().unwrap();
    }

    #[test]
    fn whole_sector_write_skips_the_device_read_on_a_miss() {
        let device = Arc::new(CountingDevice::new(4));
        let cache = Cache::new(device.clone());

        let guard = cache.get_for_whole_sector_write(2).unwrap();
        guard.zero();
        drop(guard);
        assert_eq!(device.reads.load(Ordering::Relaxed), 0);

        // An ordinary miss still reads through.
        let _ = cache.get(3).unwrap();
        assert_eq!(device.reads.load(Ordering::Relaxed), 1);
    }
}
