//! Open-file and open-directory handles: a live inode reference plus the
//! cursor state (byte offset for files, entry index for directories)
//! that only makes sense while something has the inode open.

use std::sync::{Arc, Mutex};

use crate::error::{FsError, FsResult};
use crate::fs::directory::DirEntry;
use crate::fs::inode::Inode;
use crate::fs::FileSystem;

/// A handle to an open file, positioned at a byte offset that advances
/// with each read or write.
#[derive(Debug)]
pub struct FileHandle {
    fs: Arc<FileSystem>,
    inode: Option<Arc<Inode>>,
    offset: Mutex<u32>,
}

impl FileHandle {
    pub(crate) fn new(fs: Arc<FileSystem>, inode: Arc<Inode>) -> FsResult<Self> {
        if fs.is_dir(&inode)? {
            fs.close(inode)?;
            return Err(FsError::IsADirectory);
        }
        Ok(Self {
            fs,
            inode: Some(inode),
            offset: Mutex::new(0),
        })
    }

    fn inode(&self) -> &Inode {
        self.inode.as_ref().expect("handle used after close")
    }

    pub fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        let mut offset = self.offset.lock().unwrap();
        let n = self.fs.read(self.inode(), *offset, buf)?;
        *offset += n as u32;
        Ok(n)
    }

    pub fn write(&self, buf: &[u8]) -> FsResult<usize> {
        let mut offset = self.offset.lock().unwrap();
        let n = self.fs.write(self.inode(), *offset, buf)?;
        *offset += n as u32;
        Ok(n)
    }

    pub fn seek(&self, pos: u32) {
        *self.offset.lock().unwrap() = pos;
    }

    pub fn tell(&self) -> u32 {
        *self.offset.lock().unwrap()
    }

    pub fn length(&self) -> FsResult<u32> {
        self.fs.file_length(self.inode())
    }

    pub fn close(mut self) -> FsResult<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> FsResult<()> {
        if let Some(inode) = self.inode.take() {
            self.fs.close(inode)?;
        }
        Ok(())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}

/// A handle to an open directory, positioned at an entry index that
/// advances with each `read_dir_entry` call.
#[derive(Debug)]
pub struct DirHandle {
    fs: Arc<FileSystem>,
    inode: Option<Arc<Inode>>,
    next_index: Mutex<usize>,
}

impl DirHandle {
    pub(crate) fn new(fs: Arc<FileSystem>, inode: Arc<Inode>) -> FsResult<Self> {
        if !fs.is_dir(&inode)? {
            fs.close(inode)?;
            return Err(FsError::NotADirectory);
        }
        Ok(Self {
            fs,
            inode: Some(inode),
            next_index: Mutex::new(0),
        })
    }

    fn inode(&self) -> &Inode {
        self.inode.as_ref().expect("handle used after close")
    }

    /// Returns the next live entry, or `None` once every entry has been
    /// returned.
    pub fn read_entry(&self) -> FsResult<Option<DirEntry>> {
        let entries = self.fs.read_dir(self.inode())?;
        let mut index = self.next_index.lock().unwrap();
        let entry = entries.into_iter().nth(*index);
        if entry.is_some() {
            *index += 1;
        }
        Ok(entry)
    }

    pub fn rewind(&self) {
        *self.next_index.lock().unwrap() = 0;
    }

    pub fn is_root(&self) -> bool {
        self.fs.is_root(self.inode())
    }

    pub fn is_same(&self, other: &DirHandle) -> bool {
        self.fs.is_same(self.inode(), other.inode())
    }

    pub fn close(mut self) -> FsResult<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> FsResult<()> {
        if let Some(inode) = self.inode.take() {
            self.fs.close(inode)?;
        }
        Ok(())
    }
}

impl Drop for DirHandle {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}
