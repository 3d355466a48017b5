//! On-disk and in-memory inode representation, and the table of inodes
//! currently open anywhere in the system.
//!
//! Deliberately, nothing here caches the on-disk inode image: every
//! operation re-reads the 512-byte `Dinode` record from the cache before
//! touching it and writes it straight back afterwards. The cache already
//! keeps hot sectors in memory, so a second layer of inode caching would
//! only add a consistency hazard (two in-memory copies of the same
//! on-disk state) for no real performance gain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{trace, warn};
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::cache::Cache;
use crate::error::{FsError, FsResult};
use crate::freemap::FreeMap;
use crate::lock::Sleeplock;
use crate::param::{DIRECT_BLOCKS, INDIRECT_BLOCKS, MAX_FILE_SIZE, MAX_OPEN_INODES, SECTOR_SIZE};

pub const MAGIC: u32 = 0x494e_4f44; // "INOD"

/// The fixed-size, on-disk inode record. Exactly one sector.
#[derive(Clone, Copy, Debug, AsBytes, FromBytes)]
#[repr(C)]
pub struct Dinode {
    pub direct: [u32; DIRECT_BLOCKS],
    pub indirect: u32,
    pub doubly_indirect: u32,
    pub is_dir: u8,
    _pad: [u8; 3],
    pub length: u32,
    pub magic: u32,
}

const_assert_eq!(std::mem::size_of::<Dinode>(), SECTOR_SIZE);

impl Dinode {
    pub fn new_file(is_dir: bool) -> Self {
        Self {
            direct: [0; DIRECT_BLOCKS],
            indirect: 0,
            doubly_indirect: 0,
            is_dir: is_dir as u8,
            _pad: [0; 3],
            length: 0,
            magic: MAGIC,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }
}

/// An indirect block: a sector holding nothing but block-number entries.
#[derive(Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
struct IndirectBlock {
    entries: [u32; INDIRECT_BLOCKS],
}

const_assert_eq!(std::mem::size_of::<IndirectBlock>(), SECTOR_SIZE);

/// Reads the `Dinode` record for `sector` fresh from the cache.
pub fn read_dinode(cache: &Cache, sector: u32) -> FsResult<Dinode> {
    let guard = cache.get(sector)?;
    let mut bytes = [0u8; SECTOR_SIZE];
    guard.read_at(0, &mut bytes);
    Ok(Dinode::read_from(bytes.as_slice()).expect("Dinode is POD and sector-sized"))
}

/// Writes `dinode` back to its sector. Always overwrites the whole
/// sector, so a cache miss never needs to read the old contents first.
pub fn write_dinode(cache: &Cache, sector: u32, dinode: &Dinode) -> FsResult<()> {
    let guard = cache.get_for_whole_sector_write(sector)?;
    guard.write_at(0, dinode.as_bytes());
    Ok(())
}

fn read_indirect(cache: &Cache, sector: u32) -> FsResult<IndirectBlock> {
    let guard = cache.get(sector)?;
    let mut bytes = [0u8; SECTOR_SIZE];
    guard.read_at(0, &mut bytes);
    Ok(IndirectBlock::read_from(bytes.as_slice()).expect("IndirectBlock is sector-sized"))
}

fn write_indirect(cache: &Cache, sector: u32, block: &IndirectBlock) -> FsResult<()> {
    let guard = cache.get_for_whole_sector_write(sector)?;
    guard.write_at(0, block.as_bytes());
    Ok(())
}

/// Maps a zero-based sector index within a file to its on-disk sector
/// number without allocating: an index past whatever is currently
/// assigned resolves to `0` (a hole). Used by reads, which must never
/// extend a file.
fn bmap_readonly(cache: &Cache, dinode: &Dinode, index: usize) -> FsResult<u32> {
    if index < DIRECT_BLOCKS {
        return Ok(dinode.direct[index]);
    }
    let index = index - DIRECT_BLOCKS;
    if index < INDIRECT_BLOCKS {
        if dinode.indirect == 0 {
            return Ok(0);
        }
        let block = read_indirect(cache, dinode.indirect)?;
        return Ok(block.entries[index]);
    }
    let index = index - INDIRECT_BLOCKS;
    if dinode.doubly_indirect == 0 || index >= INDIRECT_BLOCKS * INDIRECT_BLOCKS {
        return Ok(0);
    }
    let outer = read_indirect(cache, dinode.doubly_indirect)?;
    let outer_sector = outer.entries[index / INDIRECT_BLOCKS];
    if outer_sector == 0 {
        return Ok(0);
    }
    let inner = read_indirect(cache, outer_sector)?;
    Ok(inner.entries[index % INDIRECT_BLOCKS])
}

/// Maps a zero-based sector index within a file to its on-disk sector
/// number, allocating and zeroing new sectors (and, if needed, the
/// indirect blocks that point to them) as it goes. Allocation is
/// idempotent: re-walking an index that already has a sector assigned
/// never allocates again.
fn bmap(cache: &Cache, freemap: &FreeMap, dinode: &mut Dinode, index: usize) -> FsResult<u32> {
    if index < DIRECT_BLOCKS {
        if dinode.direct[index] == 0 {
            let sector = freemap.allocate()?;
            cache.get_for_whole_sector_write(sector)?.zero();
            dinode.direct[index] = sector;
        }
        return Ok(dinode.direct[index]);
    }

    let index = index - DIRECT_BLOCKS;
    if index < INDIRECT_BLOCKS {
        return bmap_indirect(cache, freemap, &mut dinode.indirect, index);
    }

    let index = index - INDIRECT_BLOCKS;
    if index >= INDIRECT_BLOCKS * INDIRECT_BLOCKS {
        return Err(FsError::FileTooLarge);
    }
    if dinode.doubly_indirect == 0 {
        let sector = freemap.allocate()?;
        cache.get_for_whole_sector_write(sector)?.zero();
        dinode.doubly_indirect = sector;
    }
    let mut outer = read_indirect(cache, dinode.doubly_indirect)?;
    let outer_index = index / INDIRECT_BLOCKS;
    let inner_index = index % INDIRECT_BLOCKS;
    let result = bmap_indirect(cache, freemap, &mut outer.entries[outer_index], inner_index)?;
    write_indirect(cache, dinode.doubly_indirect, &outer)?;
    Ok(result)
}

fn bmap_indirect(
    cache: &Cache,
    freemap: &FreeMap,
    indirect_sector: &mut u32,
    index: usize,
) -> FsResult<u32> {
    if *indirect_sector == 0 {
        let sector = freemap.allocate()?;
        cache.get_for_whole_sector_write(sector)?.zero();
        *indirect_sector = sector;
    }
    let mut block = read_indirect(cache, *indirect_sector)?;
    if block.entries[index] == 0 {
        let data_sector = freemap.allocate()?;
        cache.get_for_whole_sector_write(data_sector)?.zero();
        block.entries[index] = data_sector;
        write_indirect(cache, *indirect_sector, &block)?;
    }
    Ok(block.entries[index])
}

/// Releases every sector a file occupies, including its indirect blocks,
/// back to the free map. Does not touch the inode's own sector.
pub fn deallocate(cache: &Cache, freemap: &FreeMap, dinode: &Dinode) -> FsResult<()> {
    let sectors = (dinode.length as usize + SECTOR_SIZE - 1) / SECTOR_SIZE;

    for &s in dinode.direct.iter().take(sectors.min(DIRECT_BLOCKS)) {
        if s != 0 {
            freemap.free(s);
            cache.invalidate(s);
        }
    }

    if sectors > DIRECT_BLOCKS && dinode.indirect != 0 {
        deallocate_indirect(cache, freemap, dinode.indirect)?;
    }

    if sectors > DIRECT_BLOCKS + INDIRECT_BLOCKS && dinode.doubly_indirect != 0 {
        let outer = read_indirect(cache, dinode.doubly_indirect)?;
        for &inner_sector in outer.entries.iter() {
            if inner_sector != 0 {
                deallocate_indirect(cache, freemap, inner_sector)?;
            }
        }
        freemap.free(dinode.doubly_indirect);
        cache.invalidate(dinode.doubly_indirect);
    }
    Ok(())
}

fn deallocate_indirect(cache: &Cache, freemap: &FreeMap, indirect_sector: u32) -> FsResult<()> {
    let block = read_indirect(cache, indirect_sector)?;
    for &s in block.entries.iter() {
        if s != 0 {
            freemap.free(s);
            cache.invalidate(s);
        }
    }
    freemap.free(indirect_sector);
    cache.invalidate(indirect_sector);
    Ok(())
}

/// The in-memory half of an inode: open/deny-write counters and the
/// removed flag, none of which exist on disk.
#[derive(Debug)]
struct InodeState {
    open_count: u32,
    deny_write_count: u32,
    removed: bool,
}

/// A handle to an inode shared by every task that has it open. Content
/// operations (read/write/truncate) are serialized by `content_lock`; the
/// handle itself carries no cached copy of the on-disk record.
#[derive(Debug)]
pub struct Inode {
    pub sector: u32,
    state: Mutex<InodeState>,
    content_lock: Sleeplock<()>,
}

impl Inode {
    pub fn deny_write(&self) {
        self.state.lock().unwrap().deny_write_count += 1;
    }

    pub fn allow_write(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.deny_write_count > 0);
        state.deny_write_count -= 1;
    }

    pub fn write_denied(&self) -> bool {
        self.state.lock().unwrap().deny_write_count > 0
    }

    pub fn mark_removed(&self) {
        self.state.lock().unwrap().removed = true;
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().unwrap().removed
    }

    /// Acquires the per-inode content lock, serializing reads/writes of
    /// this particular inode against each other (but not against other
    /// inodes).
    pub fn lock_content(&self) -> InodeContentGuard<'_> {
        InodeContentGuard {
            _guard: self.content_lock.lock(),
        }
    }
}

/// RAII token proving the caller holds an inode's content lock. Carries
/// no data of its own; callers pass the inode sector alongside it to the
/// free read/write functions in this module.
#[derive(Debug)]
pub struct InodeContentGuard<'a> {
    _guard: std::sync::MutexGuard<'a, ()>,
}

/// Builds a content guard from a caller-owned lock rather than one
/// registered in the [`InodeTable`]. The free map's own backing sector is
/// a file in every sense the inode layer cares about, but it is read and
/// written before the table (and the rest of the filesystem) exists, so it
/// serializes its own content access instead of going through `InodeTable`.
pub(crate) fn external_content_guard(lock: &Sleeplock<()>) -> InodeContentGuard<'_> {
    InodeContentGuard { _guard: lock.lock() }
}

/// The set of inodes currently open anywhere in the system, keyed by
/// sector. An inode is only removed from this table once its open count
/// drops to zero.
#[derive(Debug)]
pub struct InodeTable {
    table: Mutex<HashMap<u32, Arc<Inode>>>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a handle to the inode at `sector`, creating an in-memory
    /// entry for it if this is the first task to open it.
    pub fn get(&self, sector: u32) -> Arc<Inode> {
        let mut table = self.table.lock().unwrap();
        let inode = table.entry(sector).or_insert_with(|| {
            trace!("inode table: new entry for sector {}", sector);
            Arc::new(Inode {
                sector,
                state: Mutex::new(InodeState {
                    open_count: 0,
                    deny_write_count: 0,
                    removed: false,
                }),
                content_lock: Sleeplock::new("inode content", ()),
            })
        });
        inode.state.lock().unwrap().open_count += 1;
        if table.len() > MAX_OPEN_INODES {
            warn!(
                "inode table holds {} entries, past the soft limit of {}",
                table.len(),
                MAX_OPEN_INODES
            );
        }
        inode.clone()
    }

    /// Drops one open reference to `inode`. If this was the last
    /// reference and the inode had been unlinked, its sectors (and the
    /// inode sector itself) are released and the table entry is dropped.
    pub fn put(&self, inode: Arc<Inode>, cache: &Cache, freemap: &FreeMap) -> FsResult<()> {
        let sector = inode.sector;
        let should_free = {
            let mut state = inode.state.lock().unwrap();
            state.open_count -= 1;
            state.open_count == 0 && state.removed
        };
        if should_free {
            let dinode = read_dinode(cache, sector)?;
            deallocate(cache, freemap, &dinode)?;
            freemap.free(sector);
            cache.invalidate(sector);
            self.table.lock().unwrap().remove(&sector);
            trace!("inode table: freed sector {}", sector);
        } else {
            let mut table = self.table.lock().unwrap();
            // The table's own reference plus our local `inode` make two;
            // if nothing else holds a reference, evict the entry. The
            // inode's on-disk record is untouched.
            if Arc::strong_count(&inode) <= 2 {
                table.remove(&sector);
            }
        }
        Ok(())
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads up to `buf.len()` bytes starting at `offset`, stopping early at
/// end-of-file. Returns the number of bytes actually read.
pub fn read_at(
    cache: &Cache,
    sector: u32,
    _content: &InodeContentGuard<'_>,
    offset: u32,
    buf: &mut [u8],
) -> FsResult<usize> {
    let dinode = read_dinode(cache, sector)?;
    if offset >= dinode.length {
        return Ok(0);
    }
    let end = (offset as usize + buf.len()).min(dinode.length as usize);
    let mut read = 0usize;
    let mut pos = offset as usize;
    while pos < end {
        let block_index = pos / SECTOR_SIZE;
        let block_offset = pos % SECTOR_SIZE;
        let chunk = (SECTOR_SIZE - block_offset).min(end - pos);
        let data_sector = bmap_readonly(cache, &dinode, block_index)?;
        if data_sector == 0 {
            // A hole: bytes here are implicitly zero.
            buf[read..read + chunk].fill(0);
        } else {
            let guard = cache.get(data_sector)?;
            guard.read_at(block_offset, &mut buf[read..read + chunk]);
        }
        read += chunk;
        pos += chunk;
    }
    Ok(read)
}

/// Writes `buf` at `offset`, extending the file (allocating new sectors
/// as needed) if the write runs past the current end-of-file.
pub fn write_at(
    cache: &Cache,
    freemap: &FreeMap,
    sector: u32,
    _content: &InodeContentGuard<'_>,
    offset: u32,
    buf: &[u8],
) -> FsResult<usize> {
    let mut dinode = read_dinode(cache, sector)?;
    let end = offset as usize + buf.len();
    if end > MAX_FILE_SIZE {
        return Err(FsError::FileTooLarge);
    }

    let mut written = 0usize;
    let mut pos = offset as usize;
    while pos < end {
        let block_index = pos / SECTOR_SIZE;
        let block_offset = pos % SECTOR_SIZE;
        let chunk = (SECTOR_SIZE - block_offset).min(end - pos);
        let data_sector = bmap(cache, freemap, &mut dinode, block_index)?;
        let guard = cache.get(data_sector)?;
        guard.write_at(block_offset, &buf[written..written + chunk]);
        written += chunk;
        pos += chunk;
    }

    if end as u32 > dinode.length {
        dinode.length = end as u32;
    }
    write_dinode(cache, sector, &dinode)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn harness() -> (Cache, FreeMap) {
        let cache = Cache::new(Arc::new(MemoryDevice::new(40960)));
        let freemap = FreeMap::new(40960);
        freemap.reserve(0);
        (cache, freemap)
    }

    #[test]
    fn dinode_round_trips_through_the_cache() {
        let (cache, _freemap) = harness();
        let mut dinode = Dinode::new_file(false);
        dinode.length = 42;
        write_dinode(&cache, 10, &dinode).unwrap();
        let back = read_dinode(&cache, 10).unwrap();
        assert_eq!(back.length, 42);
        assert_eq!(back.magic, MAGIC);
        assert!(!back.is_dir());
    }

    #[test]
    fn write_then_read_within_a_single_sector() {
        let (cache, freemap) = harness();
        let table = InodeTable::new();
        let sector = 20;
        write_dinode(&cache, sector, &Dinode::new_file(false)).unwrap();
        let inode = table.get(sector);
        let content = inode.lock_content();

        write_at(&cache, &freemap, sector, &content, 0, b"hello world").unwrap();
        let mut buf = [0u8; 11];
        let n = read_at(&cache, sector, &content, 0, &mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn write_past_a_sector_boundary_spans_blocks() {
        let (cache, freemap) = harness();
        let table = InodeTable::new();
        let sector = 21;
        write_dinode(&cache, sector, &Dinode::new_file(false)).unwrap();
        let inode = table.get(sector);
        let content = inode.lock_content();

        let data = vec![0xab; SECTOR_SIZE + 100];
        write_at(&cache, &freemap, sector, &content, 0, &data).unwrap();
        let mut buf = vec![0u8; SECTOR_SIZE + 100];
        let n = read_at(&cache, sector, &content, 0, &mut buf).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(buf, data);
    }

    #[test]
    fn read_past_end_of_file_returns_zero_bytes_read() {
        let (cache, freemap) = harness();
        let table = InodeTable::new();
        let sector = 22;
        write_dinode(&cache, sector, &Dinode::new_file(false)).unwrap();
        let inode = table.get(sector);
        let content = inode.lock_content();
        write_at(&cache, &freemap, sector, &content, 0, b"abc").unwrap();

        let mut buf = [0u8; 10];
        let n = read_at(&cache, sector, &content, 100, &mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn deallocate_frees_every_sector_including_indirect_blocks() {
        let (cache, freemap) = harness();
        let mut dinode_sector = Dinode::new_file(false);
        let offset = (DIRECT_BLOCKS * SECTOR_SIZE) as u32;
        let sector = 23;
        write_dinode(&cache, sector, &dinode_sector).unwrap();
        let table = InodeTable::new();
        let inode = table.get(sector);
        let content = inode.lock_content();
        write_at(&cache, &freemap, sector, &content, offset, b"x").unwrap();
        drop(content);

        dinode_sector = read_dinode(&cache, sector).unwrap();
        assert_ne!(dinode_sector.indirect, 0);
        let before = freemap.free_count();
        deallocate(&cache, &freemap, &dinode_sector).unwrap();
        assert!(freemap.free_count() > before);
    }

    #[test]
    fn file_larger_than_direct_and_indirect_reaches_doubly_indirect() {
        let (cache, freemap) = harness();
        let mut dinode = Dinode::new_file(false);
        let far_index = DIRECT_BLOCKS + INDIRECT_BLOCKS + 5;
        let sector = bmap(&cache, &freemap, &mut dinode, far_index).unwrap();
        assert_ne!(sector, 0);
        assert_ne!(dinode.doubly_indirect, 0);
    }
}
