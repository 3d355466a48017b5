//! The filesystem facade: formatting, mounting, path resolution, and the
//! handful of whole-path operations (`create`, `open`, `remove`,
//! `chdir`) built on top of the cache, free map, and inode layers.

pub mod directory;
pub mod handle;
pub mod inode;
pub mod path;

use std::sync::Arc;

use log::{info, warn};

use crate::cache::{Cache, CacheStats};
use crate::device::BlockDevice;
use crate::error::{FsError, FsResult};
use crate::freemap::FreeMap;
use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};
use inode::{Dinode, Inode, InodeTable};
use path::{FileName, Path};

pub use inode::Inode as OpenInode;

#[derive(Debug)]
pub struct FileSystem {
    cache: Arc<Cache>,
    freemap: FreeMap,
    inodes: InodeTable,
}

/// Borrows an inode from the table for the span of a single facade
/// operation. Dropping it (including via an early `?` return) always runs
/// `InodeTable::put`, so a fallible step between `get` and the matching
/// `put` can never leak an open reference. Call [`release`](Self::release)
/// on the ordinary success path to observe the `put` error; on an early
/// return, `Drop` still runs it, but only logs a failure since destructors
/// cannot propagate one.
struct InodeRef<'a> {
    fs: &'a FileSystem,
    inode: Option<Arc<Inode>>,
}

impl<'a> InodeRef<'a> {
    fn get(fs: &'a FileSystem, sector: u32) -> Self {
        Self {
            fs,
            inode: Some(fs.inodes.get(sector)),
        }
    }

    fn inode(&self) -> &Inode {
        self.inode.as_ref().expect("InodeRef used after release")
    }

    /// Puts the inode back now, returning any error from reclaiming its
    /// sectors (only possible if this was the last reference to an
    /// unlinked inode).
    fn release(mut self) -> FsResult<()> {
        let inode = self.inode.take().expect("InodeRef released twice");
        self.fs.inodes.put(inode, &self.fs.cache, &self.fs.freemap)
    }
}

impl Drop for InodeRef<'_> {
    fn drop(&mut self) {
        if let Some(inode) = self.inode.take() {
            if let Err(e) = self.fs.inodes.put(inode, &self.fs.cache, &self.fs.freemap) {
                warn!("inode put on unwind path failed: {}", e);
            }
        }
    }
}

impl FileSystem {
    /// Formats a brand-new volume on `device`: reserves the bitmap and
    /// root directory sectors and writes an empty root directory whose
    /// `..` points at itself.
    pub fn format(device: Arc<dyn BlockDevice>) -> FsResult<Self> {
        let sector_count = device.sector_count();
        let cache = Arc::new(Cache::new(device));
        let freemap = FreeMap::new(sector_count);
        freemap.reserve(FREE_MAP_SECTOR);
        freemap.reserve(ROOT_DIR_SECTOR);

        inode::write_dinode(&cache, ROOT_DIR_SECTOR, &Dinode::new_file(true))?;
        let inodes = InodeTable::new();
        let root = inodes.get(ROOT_DIR_SECTOR);
        {
            let content = root.lock_content();
            directory::init(&cache, &freemap, ROOT_DIR_SECTOR, &content, ROOT_DIR_SECTOR)?;
        }
        inodes.put(root, &cache, &freemap)?;

        freemap.create_on_disk(&cache)?;
        cache.flush_all()?;
        info!("formatted volume: {} sectors", sector_count);

        Ok(Self {
            cache,
            freemap,
            inodes: InodeTable::new(),
        })
    }

    /// Mounts an already-formatted volume, loading the free map from its
    /// reserved sector.
    pub fn open(device: Arc<dyn BlockDevice>) -> FsResult<Self> {
        let sector_count = device.sector_count();
        let cache = Arc::new(Cache::new(device));
        let root = inode::read_dinode(&cache, ROOT_DIR_SECTOR)?;
        if root.magic != inode::MAGIC {
            return Err(FsError::NotFormatted);
        }
        let freemap = FreeMap::open(&cache, sector_count)?;
        info!("mounted volume: {} sectors", sector_count);
        Ok(Self {
            cache,
            freemap,
            inodes: InodeTable::new(),
        })
    }

    /// Persists the free map and flushes every dirty cache slot. After
    /// this call, the underlying device holds a self-consistent image.
    pub fn shutdown(&self) -> FsResult<()> {
        self.freemap.close(&self.cache)?;
        self.cache.flush_all()?;
        info!("filesystem shut down cleanly");
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn root_sector(&self) -> u32 {
        ROOT_DIR_SECTOR
    }

    /// Returns another open reference onto the inode at `sector`,
    /// incrementing its open count the same way `open` does. Used to give a
    /// task's working directory its own reference independent of whatever
    /// handle resolved it.
    pub fn reopen(&self, sector: u32) -> Arc<Inode> {
        self.inodes.get(sector)
    }

    pub fn is_root(&self, inode: &Inode) -> bool {
        inode.sector == ROOT_DIR_SECTOR
    }

    /// Whether `a` and `b` are handles onto the same inode, the way two
    /// lookups of the same path (or a path and a relative alias of it,
    /// e.g. via `.`) would be.
    pub fn is_same(&self, a: &Inode, b: &Inode) -> bool {
        a.sector == b.sector
    }

    /// Walks `path` component by component starting from `start`.  `.` is
    /// resolved to the current sector without touching the directory at
    /// all; `..` is resolved through [`directory::parent`], which reads
    /// the reserved offset-0 entry directly rather than through the
    /// ordinary (and deliberately `..`-blind) entry scan. After the walk,
    /// a target that has since been unlinked (but is still open
    /// elsewhere) resolves to not-found rather than handing back a
    /// sector whose directory entry no longer exists.
    fn walk(&self, start: u32, path: Path<'_>) -> FsResult<u32> {
        let mut sector = start;
        let mut remaining = path;
        while let Some((rest, component)) = remaining.skip_elem()? {
            let dinode = inode::read_dinode(&self.cache, sector)?;
            if !dinode.is_dir() {
                return Err(FsError::NotADirectory);
            }
            let next = match component.as_str() {
                "." => sector,
                ".." => {
                    let dir_inode = InodeRef::get(self, sector);
                    let content = dir_inode.inode().lock_content();
                    let parent = directory::parent(&self.cache, sector, &content)?;
                    drop(content);
                    dir_inode.release()?;
                    parent
                }
                _ => {
                    let dir_inode = InodeRef::get(self, sector);
                    let content = dir_inode.inode().lock_content();
                    let found = directory::lookup(&self.cache, sector, &content, component)?;
                    drop(content);
                    dir_inode.release()?;
                    found.map(|(s, _)| s).ok_or(FsError::NotFound)?
                }
            };
            sector = next;
            remaining = rest;
        }

        let inode = InodeRef::get(self, sector);
        let removed = inode.inode().is_removed();
        inode.release()?;
        if removed {
            return Err(FsError::NotFound);
        }
        Ok(sector)
    }

    /// Looks up `name` in the directory at `dir_sector`, special-casing
    /// `.` and `..`, neither of which the ordinary entry scan can answer
    /// (the former is never stored as an entry at all; the latter is
    /// stored but excluded from the scan).
    fn lookup_named(
        &self,
        dir_sector: u32,
        content: &inode::InodeContentGuard<'_>,
        name: FileName<'_>,
    ) -> FsResult<Option<u32>> {
        match name.as_str() {
            "." => Ok(Some(dir_sector)),
            ".." => Ok(Some(directory::parent(&self.cache, dir_sector, content)?)),
            _ => Ok(directory::lookup(&self.cache, dir_sector, content, name)?.map(|(s, _)| s)),
        }
    }

    fn resolve_start(&self, cwd: u32, path: Path<'_>) -> u32 {
        if path.is_absolute() {
            ROOT_DIR_SECTOR
        } else {
            cwd
        }
    }

    /// Climbs the `..` chain from `start` to the root, returning whether
    /// `candidate` is `start` itself or a transitive parent of it. Used
    /// to refuse removing a directory that is (or contains) a task's
    /// working directory.
    fn is_ancestor(&self, candidate: u32, start: u32) -> FsResult<bool> {
        let mut sector = start;
        loop {
            if sector == candidate {
                return Ok(true);
            }
            if sector == ROOT_DIR_SECTOR {
                return Ok(false);
            }
            let inode = InodeRef::get(self, sector);
            let content = inode.inode().lock_content();
            let parent = directory::parent(&self.cache, sector, &content)?;
            drop(content);
            inode.release()?;
            sector = parent;
        }
    }

    /// Creates a new file or directory at `path`, relative to `cwd` if
    /// `path` is not absolute.
    pub fn create(&self, cwd: u32, path: &str, is_dir: bool) -> FsResult<()> {
        let p = Path::new(path)?;
        let (dir_path, name) = p.split()?;
        let start = self.resolve_start(cwd, p);
        let dir_sector = self.walk(start, dir_path)?;

        let dir_inode = InodeRef::get(self, dir_sector);
        let dir_content = dir_inode.inode().lock_content();
        let parent_dinode = inode::read_dinode(&self.cache, dir_sector)?;
        if !parent_dinode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if self.lookup_named(dir_sector, &dir_content, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let child_sector = self.freemap.allocate()?;
        inode::write_dinode(&self.cache, child_sector, &Dinode::new_file(is_dir))?;
        if is_dir {
            let child_inode = InodeRef::get(self, child_sector);
            {
                let child_content = child_inode.inode().lock_content();
                directory::init(&self.cache, &self.freemap, child_sector, &child_content, dir_sector)?;
            }
            child_inode.release()?;
        }

        let added = directory::add(&self.cache, &self.freemap, dir_sector, &dir_content, name, child_sector);
        drop(dir_content);
        dir_inode.release()?;

        if let Err(e) = added {
            // The child inode was allocated and initialized but never
            // linked into a directory; nothing else can ever reach it
            // by name, so reclaim it immediately.
            self.freemap.free(child_sector);
            self.cache.invalidate(child_sector);
            return Err(e);
        }
        Ok(())
    }

    /// Opens `path`, returning a live handle to its inode. `""` is not a
    /// valid path and resolves to not-found; `"."` and `"/"` resolve to
    /// `cwd` and the root respectively, as ordinary walks of a path whose
    /// only component is `.` or whose only content is slashes.
    pub fn open(&self, cwd: u32, path: &str) -> FsResult<Arc<Inode>> {
        let p = Path::new(path)?;
        if p.is_empty() {
            return Err(FsError::NotFound);
        }
        let start = self.resolve_start(cwd, p);
        let sector = self.walk(start, p)?;
        Ok(self.inodes.get(sector))
    }

    /// Releases a handle obtained from `open` or `create`. The inode's
    /// sectors are only actually reclaimed once every open handle (and
    /// every directory entry) referencing it is gone.
    pub fn close(&self, inode: Arc<Inode>) -> FsResult<()> {
        self.inodes.put(inode, &self.cache, &self.freemap)
    }

    /// Unlinks `path`'s directory entry. If the target is itself open
    /// elsewhere, its sectors stay allocated until the last handle to it
    /// closes.
    pub fn remove(&self, cwd: u32, path: &str) -> FsResult<()> {
        let p = Path::new(path)?;
        let (dir_path, name) = p.split()?;
        let start = self.resolve_start(cwd, p);
        let dir_sector = self.walk(start, dir_path)?;

        let dir_inode = InodeRef::get(self, dir_sector);
        let dir_content = dir_inode.inode().lock_content();
        let target = self.lookup_named(dir_sector, &dir_content, name)?;
        let child_sector = match target {
            Some(s) => s,
            None => return Err(FsError::NotFound),
        };

        if child_sector == ROOT_DIR_SECTOR {
            return Err(FsError::RootViolation);
        }

        if self.is_ancestor(child_sector, cwd)? {
            return Err(FsError::Busy);
        }

        let child_dinode = inode::read_dinode(&self.cache, child_sector)?;
        if child_dinode.is_dir() {
            let child_inode = InodeRef::get(self, child_sector);
            let empty = {
                let child_content = child_inode.inode().lock_content();
                directory::is_empty(&self.cache, child_sector, &child_content)?
            };
            child_inode.release()?;
            if !empty {
                return Err(FsError::NotEmpty);
            }
        }

        directory::remove(&self.cache, &self.freemap, dir_sector, &dir_content, name)?;
        drop(dir_content);
        dir_inode.release()?;

        let child_inode = InodeRef::get(self, child_sector);
        child_inode.inode().mark_removed();
        child_inode.release()?;
        Ok(())
    }

    /// Resolves `path` to a directory, for changing a task's working
    /// directory. Returns a fresh open reference onto the target; the
    /// caller is responsible for closing whatever inode it was holding as
    /// the previous working directory. Keeping the working directory
    /// itself open this way is what stops a concurrent `remove` elsewhere
    /// from reclaiming its sectors out from under a task that merely has it
    /// as `cwd` rather than a live handle.
    pub fn chdir(&self, cwd: &Inode, path: &str) -> FsResult<Arc<Inode>> {
        let p = Path::new(path)?;
        let start = self.resolve_start(cwd.sector, p);
        let sector = self.walk(start, p)?;
        let dinode = inode::read_dinode(&self.cache, sector)?;
        if !dinode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(self.inodes.get(sector))
    }

    pub fn read(&self, inode: &Inode, offset: u32, buf: &mut [u8]) -> FsResult<usize> {
        let content = inode.lock_content();
        inode::read_at(&self.cache, inode.sector, &content, offset, buf)
    }

    pub fn write(&self, inode: &Inode, offset: u32, buf: &[u8]) -> FsResult<usize> {
        if inode.write_denied() {
            return Err(FsError::WriteDenied);
        }
        let content = inode.lock_content();
        inode::write_at(&self.cache, &self.freemap, inode.sector, &content, offset, buf)
    }

    pub fn file_length(&self, inode: &Inode) -> FsResult<u32> {
        Ok(inode::read_dinode(&self.cache, inode.sector)?.length)
    }

    pub fn is_dir(&self, inode: &Inode) -> FsResult<bool> {
        Ok(inode::read_dinode(&self.cache, inode.sector)?.is_dir())
    }

    pub fn read_dir(&self, inode: &Inode) -> FsResult<Vec<directory::DirEntry>> {
        let content = inode.lock_content();
        directory::read_all(&self.cache, inode.sector, &content)
    }
}
