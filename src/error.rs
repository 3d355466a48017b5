//! Error types returned across the crate's public API.

use thiserror::Error;

use crate::fs::path::PathError;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("file or directory already exists")]
    AlreadyExists,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory is not empty")]
    NotEmpty,

    #[error("device is out of free space")]
    NoSpace,

    #[error("device has no free inodes")]
    NoInodes,

    #[error("file has reached its maximum size")]
    FileTooLarge,

    #[error("cannot write: file is open for execution")]
    WriteDenied,

    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),

    #[error("I/O error on underlying block device: {0}")]
    Io(#[from] std::io::Error),

    #[error("attempted to remove or move the filesystem root")]
    RootViolation,

    #[error("cannot remove an ancestor of the current working directory")]
    Busy,

    #[error("device does not contain a formatted volume")]
    NotFormatted,
}

pub type FsResult<T> = Result<T, FsError>;
