use std::io;

use libsqlite3_sys as ffi;
use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to seek range file {range} to page {page}: {source}")]
    Seek {
        range: u32,
        page: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to read page {page} from range file {range}: {source}")]
    Read {
        range: u32,
        page: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to write page {page} to range file {range}: {source}")]
    Write {
        range: u32,
        page: u64,
        #[source]
        source: io::Error,
    },

    #[error("short read of page {page}: got {got} of {expected} bytes")]
    ShortRead {
        page: u64,
        got: usize,
        expected: usize,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("no vfs registered under name {0:?}")]
    UnknownVfs(String),

    #[error("range file {0} is not open")]
    UnknownRange(u32),

    #[error("invalid vfs configuration: {0}")]
    Config(&'static str),

    #[error(transparent)]
    Register(#[from] vfs_bridge::RegisterError),
}

impl StoreError {
    /// The SQLite result code reported through the VFS contract for this
    /// error.
    pub fn sqlite_code(&self) -> i32 {
        match self {
            StoreError::Seek { .. } => ffi::SQLITE_IOERR_SEEK,
            StoreError::Read { .. } => ffi::SQLITE_IOERR_READ,
            StoreError::Write { .. } => ffi::SQLITE_IOERR_WRITE,
            StoreError::ShortRead { .. } => ffi::SQLITE_IOERR_SHORT_READ,
            StoreError::Io(_) => ffi::SQLITE_IOERR,
            StoreError::UnknownVfs(_) | StoreError::UnknownRange(_) | StoreError::Config(_) => {
                ffi::SQLITE_ERROR
            }
            StoreError::Register(_) => ffi::SQLITE_ERROR,
        }
    }
}
