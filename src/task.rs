//! A task's filesystem-facing state: just a working directory. Every
//! other piece of process state (scheduling, memory, open file
//! descriptor numbers) belongs to whatever embeds this crate.

use std::sync::{Arc, Mutex};

use crate::error::FsResult;
use crate::fs::handle::{DirHandle, FileHandle};
use crate::fs::inode::Inode;
use crate::fs::FileSystem;

/// A task's filesystem-facing state: just a working directory, held open
/// for as long as it is current so that a removal elsewhere can never
/// reclaim its sectors while this task still resolves relative paths
/// through it.
#[derive(Debug)]
pub struct Task {
    fs: Arc<FileSystem>,
    cwd: Mutex<Arc<Inode>>,
}

impl Task {
    /// Creates a task whose working directory is the volume root.
    pub fn new(fs: Arc<FileSystem>) -> Self {
        let cwd = fs.reopen(fs.root_sector());
        Self {
            fs,
            cwd: Mutex::new(cwd),
        }
    }

    /// Creates a task that inherits `parent`'s working directory, the way
    /// a forked process would. The child gets its own open reference, not
    /// a shared one, so either task's later `chdir` or drop doesn't affect
    /// the other.
    pub fn spawn_from(parent: &Task) -> Self {
        let parent_cwd = parent.cwd.lock().unwrap();
        let cwd = parent.fs.reopen(parent_cwd.sector);
        Self {
            fs: parent.fs.clone(),
            cwd: Mutex::new(cwd),
        }
    }

    pub fn cwd_sector(&self) -> u32 {
        self.cwd.lock().unwrap().sector
    }

    pub fn chdir(&self, path: &str) -> FsResult<()> {
        let mut cwd = self.cwd.lock().unwrap();
        let new_cwd = self.fs.chdir(&cwd, path)?;
        let old = std::mem::replace(&mut *cwd, new_cwd);
        drop(cwd);
        self.fs.close(old)?;
        Ok(())
    }

    pub fn create(&self, path: &str, is_dir: bool) -> FsResult<()> {
        self.fs.create(self.cwd_sector(), path, is_dir)
    }

    pub fn open_file(&self, path: &str) -> FsResult<FileHandle> {
        let inode = self.fs.open(self.cwd_sector(), path)?;
        FileHandle::new(self.fs.clone(), inode)
    }

    pub fn open_dir(&self, path: &str) -> FsResult<DirHandle> {
        let inode = self.fs.open(self.cwd_sector(), path)?;
        DirHandle::new(self.fs.clone(), inode)
    }

    pub fn remove(&self, path: &str) -> FsResult<()> {
        self.fs.remove(self.cwd_sector(), path)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Ok(cwd) = self.cwd.get_mut() {
            let cwd = cwd.clone();
            let _ = self.fs.close(cwd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use std::sync::Arc;

    fn fs() -> Arc<FileSystem> {
        let device = Arc::new(MemoryDevice::new(4096));
        FileSystem::format(device.clone()).unwrap();
        Arc::new(FileSystem::open(device).unwrap())
    }

    #[test]
    fn chdir_changes_relative_resolution() {
        let fs = fs();
        let task = Task::new(fs);
        task.create("sub", true).unwrap();
        task.chdir("sub").unwrap();
        task.create("leaf", false).unwrap();
        task.chdir("..").unwrap();
        assert_eq!(task.cwd_sector(), task.fs.root_sector());

        let mut handle = task.open_dir("sub").unwrap();
        let entry = handle.read_entry().unwrap().unwrap();
        assert_eq!(entry.name, "leaf");
    }

    #[test]
    fn spawned_task_inherits_cwd() {
        let fs = fs();
        let parent = Task::new(fs);
        parent.create("sub", true).unwrap();
        parent.chdir("sub").unwrap();
        let child = Task::spawn_from(&parent);
        assert_eq!(child.cwd_sector(), parent.cwd_sector());
    }

    #[test]
    fn removing_a_directory_that_is_another_tasks_cwd_does_not_corrupt_it() {
        let fs = fs();
        let a = Task::new(fs.clone());
        a.create("d", true).unwrap();
        a.chdir("d").unwrap();

        let b = Task::new(fs.clone());
        // `d` has no handle open anywhere, only `a`'s cwd reference, but
        // that reference keeps its sectors alive past this unlink.
        b.remove("d").unwrap();

        a.create("leaf", false).unwrap();
        let mut handle = a.open_dir(".").unwrap();
        let entry = handle.read_entry().unwrap().unwrap();
        assert_eq!(entry.name, "leaf");
    }

    #[test]
    fn file_handle_reads_back_what_it_wrote() {
        let fs = fs();
        let task = Task::new(fs);
        task.create("f", false).unwrap();
        let handle = task.open_file("f").unwrap();
        handle.write(b"data").unwrap();
        handle.seek(0);
        let mut buf = [0u8; 4];
        handle.read(&mut buf).unwrap();
        assert_eq!(&buf, b"data");
        handle.close().unwrap();
    }
}
