use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_void};
use std::sync::Arc;

use libsqlite3_sys as ffi;
use vfs_bridge::{LockLevel, OpenOptions, Vfs, VfsResult};

use crate::host::HostFile;
use crate::registry;
use crate::vfs::VfsInstance;

/// A file is treated as a journal iff its name carries one of SQLite's
/// auxiliary suffixes; everything else is a main database.
pub(crate) fn is_journal_name(name: &str) -> bool {
    name.ends_with("-wal") || name.ends_with("-journal")
}

/// The dispatcher registered with SQLite for one VFS instance. Every open is
/// classified once; main-DB handles are routed into paged storage while
/// journal handles pass through to the host VFS, as do all VFS-level calls.
pub(crate) struct RangeVfs {
    instance: Arc<VfsInstance>,
}

impl RangeVfs {
    pub fn new(instance: Arc<VfsInstance>) -> Self {
        Self { instance }
    }
}

impl Vfs for RangeVfs {
    type File = DbFile;

    fn open(&mut self, path: &CStr, opts: OpenOptions) -> VfsResult<Self::File> {
        let name = path.to_string_lossy().into_owned();
        log::debug!("open {} {:?}", name, opts);

        // every handle keeps a usable host file beneath it: journals use it
        // for all I/O, main databases for locking, shm and file-control
        let host = self.instance.host().open(path.as_ptr(), opts.flags)?;

        Ok(if is_journal_name(&name) {
            DbFile::Journal(JournalFile { name, host })
        } else {
            self.instance.notify_open(&name);
            DbFile::Main(MainDb {
                name,
                vfs_name: self.instance.name().to_owned(),
                host,
            })
        })
    }

    fn delete(&mut self, path: &CStr, sync_dir: bool) -> VfsResult<()> {
        log::debug!("delete {:?}", path);
        self.instance.host().delete(path, sync_dir)
    }

    fn exists(&mut self, path: &CStr) -> VfsResult<bool> {
        self.instance.host().access(path, ffi::SQLITE_ACCESS_EXISTS)
    }

    fn access(&mut self, path: &CStr, write: bool) -> VfsResult<bool> {
        let flags = if write {
            ffi::SQLITE_ACCESS_READWRITE
        } else {
            ffi::SQLITE_ACCESS_READ
        };
        self.instance.host().access(path, flags)
    }

    fn full_pathname(&mut self, path: &CStr) -> VfsResult<CString> {
        self.instance.host().full_pathname(path)
    }

    fn randomness(&self, bytes: &mut [u8]) -> usize {
        self.instance.host().randomness(bytes)
    }

    fn sleep(&self, n_micro: usize) -> usize {
        self.instance.host().sleep(n_micro)
    }

    fn current_time(&self) -> f64 {
        self.instance.host().current_time()
    }

    fn current_time_int64(&self) -> i64 {
        self.instance.host().current_time_int64()
    }

    fn dl_open(&mut self, path: &CStr) -> *mut c_void {
        self.instance.host().dl_open(path)
    }

    fn dl_error(&mut self, buf: &mut [u8]) {
        self.instance.host().dl_error(buf)
    }

    fn dl_sym(&mut self, handle: *mut c_void, symbol: &CStr) -> Option<unsafe extern "C" fn()> {
        self.instance.host().dl_sym(handle, symbol)
    }

    fn dl_close(&mut self, handle: *mut c_void) {
        self.instance.host().dl_close(handle)
    }
}

/// A main database handle. Page I/O, truncation and size queries go to the
/// paged store, found by VFS name on every operation; everything else is
/// delegated to the host file.
pub(crate) struct MainDb {
    name: String,
    vfs_name: String,
    host: HostFile,
}

impl MainDb {
    fn instance(&self) -> VfsResult<Arc<VfsInstance>> {
        registry::lookup(&self.vfs_name).ok_or(ffi::SQLITE_ERROR)
    }
}

/// A journal or WAL handle: a pure pass-through to the host file.
pub(crate) struct JournalFile {
    name: String,
    host: HostFile,
}

pub(crate) enum DbFile {
    Main(MainDb),
    Journal(JournalFile),
}

impl DbFile {
    fn host(&self) -> &HostFile {
        match self {
            DbFile::Main(f) => &f.host,
            DbFile::Journal(f) => &f.host,
        }
    }

    fn host_mut(&mut self) -> &mut HostFile {
        match self {
            DbFile::Main(f) => &mut f.host,
            DbFile::Journal(f) => &mut f.host,
        }
    }
}

impl vfs_bridge::File for DbFile {
    fn file_size(&self) -> VfsResult<u64> {
        match self {
            DbFile::Main(f) => Ok(f.instance()?.database_size()),
            DbFile::Journal(f) => f.host.file_size(),
        }
    }

    fn truncate(&mut self, size: u64) -> VfsResult<()> {
        match self {
            DbFile::Main(f) => {
                log::debug!("truncate {} to {} bytes", f.name, size);
                f.instance()?
                    .truncate_pages(size)
                    .map_err(|err| err.sqlite_code())
            }
            DbFile::Journal(f) => f.host.truncate(size),
        }
    }

    fn write(&mut self, pos: u64, buf: &[u8]) -> VfsResult<usize> {
        match self {
            DbFile::Main(f) => {
                f.instance()?
                    .write_page(pos, buf)
                    .map_err(|err| err.sqlite_code())?;
                Ok(buf.len())
            }
            DbFile::Journal(f) => {
                log::trace!("journal write {} offset={}", f.name, pos);
                f.host.write(pos, buf)?;
                Ok(buf.len())
            }
        }
    }

    fn read(&mut self, pos: u64, buf: &mut [u8]) -> VfsResult<usize> {
        match self {
            DbFile::Main(f) => f
                .instance()?
                .read_page(pos, buf)
                .map_err(|err| err.sqlite_code()),
            DbFile::Journal(f) => {
                log::trace!("journal read {} offset={}", f.name, pos);
                f.host.read(pos, buf)?;
                Ok(buf.len())
            }
        }
    }

    fn sync(&mut self, flags: c_int) -> VfsResult<()> {
        match self {
            // page writes go straight through to the host filesystem
            DbFile::Main(_) => Ok(()),
            DbFile::Journal(f) => f.host.sync(flags),
        }
    }

    fn lock(&mut self, level: LockLevel) -> VfsResult<()> {
        self.host_mut().lock(level.as_raw())
    }

    fn unlock(&mut self, level: LockLevel) -> VfsResult<()> {
        self.host_mut().unlock(level.as_raw())
    }

    fn check_reserved_lock(&mut self) -> VfsResult<bool> {
        self.host_mut().check_reserved_lock()
    }

    fn file_control(&mut self, op: c_int, arg: *mut c_void) -> c_int {
        self.host_mut().file_control(op, arg)
    }

    fn sector_size(&self) -> c_int {
        self.host().sector_size()
    }

    fn device_characteristics(&self) -> c_int {
        self.host().device_characteristics()
    }

    fn shm_map(&mut self, region: c_int, size: c_int, extend: bool, pp: *mut *mut c_void) -> c_int {
        self.host_mut().shm_map(region, size, extend, pp)
    }

    fn shm_lock(&mut self, offset: c_int, n: c_int, flags: c_int) -> c_int {
        self.host_mut().shm_lock(offset, n, flags)
    }

    fn shm_barrier(&mut self) {
        self.host_mut().shm_barrier()
    }

    fn shm_unmap(&mut self, delete: bool) -> c_int {
        self.host_mut().shm_unmap(delete)
    }

    fn fetch(&mut self, pos: u64, amt: c_int, pp: *mut *mut c_void) -> c_int {
        self.host_mut().fetch(pos, amt, pp)
    }

    fn unfetch(&mut self, pos: u64, page: *mut c_void) -> c_int {
        self.host_mut().unfetch(pos, page)
    }
}
