//! Directories: a directory is nothing but a regular file whose content
//! is an array of fixed-width [`Dirent`] records. Entry 0 is always the
//! reserved `..` slot, written once when the directory is created and
//! overwritten (never appended) whenever the directory is reparented.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::cache::Cache;
use crate::error::{FsError, FsResult};
use crate::fs::inode::{self, read_dinode, InodeContentGuard};
use crate::fs::path::{FileName, NAME_MAX};
use crate::freemap::FreeMap;

/// One directory entry. Exactly 20 bytes: a sector number, a
/// NUL-terminated name, and an in-use flag.
#[derive(Clone, Copy, Debug, AsBytes, FromBytes)]
#[repr(C)]
pub struct Dirent {
    pub inode_sector: u32,
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

const_assert_eq!(std::mem::size_of::<Dirent>(), 20);

/// Byte offset reserved for the `..` entry in every directory.
pub const PARENT_ENTRY_OFFSET: u32 = 0;

impl Dirent {
    fn empty() -> Self {
        Self {
            inode_sector: 0,
            name: [0; NAME_MAX + 1],
            in_use: 0,
        }
    }

    fn new(name: FileName<'_>, inode_sector: u32) -> Self {
        let mut entry = Self {
            inode_sector,
            name: [0; NAME_MAX + 1],
            in_use: 1,
        };
        let bytes = name.as_str().as_bytes();
        entry.name[..bytes.len()].copy_from_slice(bytes);
        entry
    }

    fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn is_in_use(&self) -> bool {
        self.in_use != 0
    }
}

const ENTRY_SIZE: u32 = std::mem::size_of::<Dirent>() as u32;

/// Writes the initial `..` entry of a freshly-created directory, pointing
/// at `parent_sector` (a directory's own sector, for the root).
pub fn init(
    cache: &Cache,
    freemap: &FreeMap,
    sector: u32,
    content: &InodeContentGuard<'_>,
    parent_sector: u32,
) -> FsResult<()> {
    let parent_name = FileName::from_str_truncated("..");
    let entry = Dirent::new(parent_name, parent_sector);
    inode::write_at(cache, freemap, sector, content, PARENT_ENTRY_OFFSET, entry.as_bytes())?;
    Ok(())
}

/// Repoints a directory's `..` entry, used when a directory is moved.
pub fn set_parent(
    cache: &Cache,
    freemap: &FreeMap,
    sector: u32,
    content: &InodeContentGuard<'_>,
    new_parent_sector: u32,
) -> FsResult<()> {
    init(cache, freemap, sector, content, new_parent_sector)
}

/// Reads the reserved `..` entry directly. This bypasses the ordinary
/// entry scan, which skips offset 0 precisely because it is never itself
/// a lookup target.
pub fn parent(cache: &Cache, sector: u32, content: &InodeContentGuard<'_>) -> FsResult<u32> {
    let mut bytes = [0u8; 20];
    inode::read_at(cache, sector, content, PARENT_ENTRY_OFFSET, &mut bytes)?;
    let entry = Dirent::read_from(bytes.as_slice()).expect("Dirent is 20 bytes");
    Ok(entry.inode_sector)
}

/// Iterates over every in-use entry, skipping the reserved `..` slot.
fn for_each_entry<F>(
    cache: &Cache,
    sector: u32,
    content: &InodeContentGuard<'_>,
    mut f: F,
) -> FsResult<()>
where
    F: FnMut(u32, Dirent) -> FsResult<bool>,
{
    let dinode = read_dinode(cache, sector)?;
    let mut offset = ENTRY_SIZE; // entry 0 is `..`, never a lookup target
    while offset < dinode.length {
        let mut bytes = [0u8; 20];
        let n = inode::read_at(cache, sector, content, offset, &mut bytes)?;
        if n < bytes.len() {
            break;
        }
        let entry = Dirent::read_from(bytes.as_slice()).expect("Dirent is 20 bytes");
        if entry.is_in_use() && !f(offset, entry)? {
            return Ok(());
        }
        offset += ENTRY_SIZE;
    }
    Ok(())
}

/// Looks up `name` in the directory, returning its inode sector and the
/// byte offset of its entry (for `remove`).
pub fn lookup(
    cache: &Cache,
    sector: u32,
    content: &InodeContentGuard<'_>,
    name: FileName<'_>,
) -> FsResult<Option<(u32, u32)>> {
    let mut found = None;
    for_each_entry(cache, sector, content, |offset, entry| {
        if entry.name() == name.as_str() {
            found = Some((entry.inode_sector, offset));
            Ok(false)
        } else {
            Ok(true)
        }
    })?;
    Ok(found)
}

/// Adds an entry for `name` pointing at `child_sector`, reusing the first
/// free (previously removed) slot if there is one, or appending a new
/// entry otherwise. Fails if `name` already exists.
pub fn add(
    cache: &Cache,
    freemap: &FreeMap,
    sector: u32,
    content: &InodeContentGuard<'_>,
    name: FileName<'_>,
    child_sector: u32,
) -> FsResult<()> {
    if lookup(cache, sector, content, name)?.is_some() {
        return Err(FsError::AlreadyExists);
    }

    let dinode = read_dinode(cache, sector)?;
    let mut offset = ENTRY_SIZE;
    let mut free_offset = None;
    while offset < dinode.length {
        let mut bytes = [0u8; 20];
        inode::read_at(cache, sector, content, offset, &mut bytes)?;
        let entry = Dirent::read_from(bytes.as_slice()).expect("Dirent is 20 bytes");
        if !entry.is_in_use() {
            free_offset = Some(offset);
            break;
        }
        offset += ENTRY_SIZE;
    }

    let target_offset = free_offset.unwrap_or(dinode.length.max(ENTRY_SIZE));
    let entry = Dirent::new(name, child_sector);
    inode::write_at(cache, freemap, sector, content, target_offset, entry.as_bytes())?;
    Ok(())
}

/// Removes the entry for `name`, clearing its slot without shrinking the
/// directory (so later `add` calls can reuse it). Checking that a
/// subdirectory is empty before unlinking it is the caller's
/// responsibility, via [`is_empty`] on the child's own sector.
pub fn remove(
    cache: &Cache,
    freemap: &FreeMap,
    sector: u32,
    content: &InodeContentGuard<'_>,
    name: FileName<'_>,
) -> FsResult<u32> {
    let (child_sector, offset) = lookup(cache, sector, content, name)?.ok_or(FsError::NotFound)?;
    let empty = Dirent::empty();
    inode::write_at(cache, freemap, sector, content, offset, empty.as_bytes())?;
    Ok(child_sector)
}

/// Returns `true` if the directory has no entries besides the reserved
/// `..` slot.
pub fn is_empty(cache: &Cache, sector: u32, content: &InodeContentGuard<'_>) -> FsResult<bool> {
    let mut empty = true;
    for_each_entry(cache, sector, content, |_, _| {
        empty = false;
        Ok(false)
    })?;
    Ok(empty)
}

/// One entry as exposed to directory-listing callers.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub inode_sector: u32,
}

/// Lists every live entry in the directory, in on-disk order, skipping
/// the reserved `..` slot (matching the reference design's `readdir`,
/// which never reports it).
pub fn read_all(
    cache: &Cache,
    sector: u32,
    content: &InodeContentGuard<'_>,
) -> FsResult<Vec<DirEntry>> {
    let mut out = Vec::new();
    for_each_entry(cache, sector, content, |_, entry| {
        out.push(DirEntry {
            name: entry.name().to_string(),
            inode_sector: entry.inode_sector,
        });
        Ok(true)
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::fs::inode::{Dinode, InodeTable};
    use std::sync::Arc;

    fn harness() -> (Cache, FreeMap) {
        let cache = Cache::new(Arc::new(MemoryDevice::new(4096)));
        let freemap = FreeMap::new(4096);
        freemap.reserve(0);
        (cache, freemap)
    }

    #[test]
    fn new_directory_has_only_the_parent_entry() {
        let (cache, freemap) = harness();
        let sector = 5;
        crate::fs::inode::write_dinode(&cache, sector, &Dinode::new_file(true)).unwrap();
        let table = InodeTable::new();
        let inode = table.get(sector);
        let content = inode.lock_content();
        init(&cache, &freemap, sector, &content, sector).unwrap();
        assert!(is_empty(&cache, sector, &content).unwrap());
    }

    #[test]
    fn add_then_lookup_finds_the_entry() {
        let (cache, freemap) = harness();
        let sector = 6;
        crate::fs::inode::write_dinode(&cache, sector, &Dinode::new_file(true)).unwrap();
        let table = InodeTable::new();
        let inode = table.get(sector);
        let content = inode.lock_content();
        init(&cache, &freemap, sector, &content, sector).unwrap();

        let name = FileName::from_str_truncated("foo");
        add(&cache, &freemap, sector, &content, name, 99).unwrap();
        let found = lookup(&cache, sector, &content, name).unwrap();
        assert_eq!(found.map(|(s, _)| s), Some(99));
        assert!(!is_empty(&cache, sector, &content).unwrap());
    }

    #[test]
    fn adding_a_duplicate_name_fails() {
        let (cache, freemap) = harness();
        let sector = 7;
        crate::fs::inode::write_dinode(&cache, sector, &Dinode::new_file(true)).unwrap();
        let table = InodeTable::new();
        let inode = table.get(sector);
        let content = inode.lock_content();
        init(&cache, &freemap, sector, &content, sector).unwrap();

        let name = FileName::from_str_truncated("foo");
        add(&cache, &freemap, sector, &content, name, 1).unwrap();
        assert!(matches!(
            add(&cache, &freemap, sector, &content, name, 2),
            Err(FsError::AlreadyExists)
        ));
    }

    #[test]
    fn remove_frees_the_slot_for_reuse() {
        let (cache, freemap) = harness();
        let sector = 8;
        crate::fs::inode::write_dinode(&cache, sector, &Dinode::new_file(true)).unwrap();
        let table = InodeTable::new();
        let inode = table.get(sector);
        let content = inode.lock_content();
        init(&cache, &freemap, sector, &content, sector).unwrap();

        let a = FileName::from_str_truncated("a");
        let b = FileName::from_str_truncated("b");
        add(&cache, &freemap, sector, &content, a, 1).unwrap();
        remove(&cache, &freemap, sector, &content, a).unwrap();
        add(&cache, &freemap, sector, &content, b, 2).unwrap();

        let dinode = read_dinode(&cache, sector).unwrap();
        // `b` reused `a`'s slot instead of growing the directory.
        assert_eq!(dinode.length, ENTRY_SIZE * 2);
    }

    #[test]
    fn readdir_skips_the_parent_entry() {
        let (cache, freemap) = harness();
        let sector = 9;
        crate::fs::inode::write_dinode(&cache, sector, &Dinode::new_file(true)).unwrap();
        let table = InodeTable::new();
        let inode = table.get(sector);
        let content = inode.lock_content();
        init(&cache, &freemap, sector, &content, sector).unwrap();
        add(
            &cache,
            &freemap,
            sector,
            &content,
            FileName::from_str_truncated("child"),
            42,
        )
        .unwrap();

        let entries = read_all(&cache, sector, &content).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "child");
        assert_eq!(entries[0].inode_sector, 42);
    }

    #[test]
    fn parent_reads_the_reserved_entry_that_lookup_would_never_find() {
        let (cache, freemap) = harness();
        let sector = 10;
        crate::fs::inode::write_dinode(&cache, sector, &Dinode::new_file(true)).unwrap();
        let table = InodeTable::new();
        let inode = table.get(sector);
        let content = inode.lock_content();
        init(&cache, &freemap, sector, &content, 1).unwrap();

        assert_eq!(parent(&cache, sector, &content).unwrap(), 1);
        assert_eq!(
            lookup(&cache, sector, &content, FileName::from_str_truncated("..")).unwrap(),
            None
        );
    }
}
