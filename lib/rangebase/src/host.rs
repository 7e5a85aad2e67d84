use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ffi::{CStr, CString};
use std::mem::{align_of, size_of};
use std::os::raw::{c_char, c_int, c_void};

use libsqlite3_sys as ffi;

use crate::error::{StoreError, StoreResult};

/// Handle on the process's default SQLite VFS. Every pass-through operation
/// (journal I/O, locking, shared memory, randomness, time, dynamic loading)
/// is delegated here.
pub(crate) struct HostVfs {
    vfs: *mut ffi::sqlite3_vfs,
}

// SAFETY: the default VFS returned by sqlite3_vfs_find is a process-lifetime
// singleton and its methods are safe to call from any thread.
unsafe impl Send for HostVfs {}
unsafe impl Sync for HostVfs {}

fn check(rc: c_int) -> Result<(), i32> {
    if rc == ffi::SQLITE_OK {
        Ok(())
    } else {
        Err(rc)
    }
}

impl HostVfs {
    /// Locate the default VFS registered with SQLite.
    pub fn find_default() -> StoreResult<Self> {
        let vfs = unsafe { ffi::sqlite3_vfs_find(std::ptr::null()) };
        if vfs.is_null() {
            return Err(StoreError::Config("no default sqlite vfs found"));
        }
        Ok(Self { vfs })
    }

    /// Open `path` through the host VFS into a freshly allocated file buffer
    /// of the host's advertised size. `path` must stay valid for the lifetime
    /// of the returned file, which SQLite guarantees for names passed to
    /// xOpen.
    pub fn open(&self, path: *const c_char, flags: c_int) -> Result<HostFile, i32> {
        let size = unsafe { (*self.vfs).szOsFile }.max(size_of::<ffi::sqlite3_file>() as c_int);
        let layout = Layout::from_size_align(size as usize, align_of::<ffi::sqlite3_file>())
            .map_err(|_| ffi::SQLITE_NOMEM)?;

        let file = unsafe { alloc_zeroed(layout) } as *mut ffi::sqlite3_file;
        if file.is_null() {
            return Err(ffi::SQLITE_NOMEM);
        }

        let mut out_flags: c_int = 0;
        let rc = match unsafe { (*self.vfs).xOpen } {
            Some(f) => unsafe { f(self.vfs, path, file, flags, &mut out_flags) },
            None => ffi::SQLITE_ERROR,
        };

        if rc != ffi::SQLITE_OK {
            // a failed xOpen that still installed methods expects a close
            close_host_file(file);
            unsafe { dealloc(file as *mut u8, layout) };
            return Err(rc);
        }

        Ok(HostFile { file, layout })
    }

    pub fn delete(&self, path: &CStr, sync_dir: bool) -> Result<(), i32> {
        match unsafe { (*self.vfs).xDelete } {
            Some(f) => check(unsafe { f(self.vfs, path.as_ptr(), sync_dir as c_int) }),
            None => Err(ffi::SQLITE_ERROR),
        }
    }

    pub fn access(&self, path: &CStr, flags: c_int) -> Result<bool, i32> {
        let mut out: c_int = 0;
        match unsafe { (*self.vfs).xAccess } {
            Some(f) => check(unsafe { f(self.vfs, path.as_ptr(), flags, &mut out) })?,
            None => return Err(ffi::SQLITE_ERROR),
        }
        Ok(out != 0)
    }

    pub fn full_pathname(&self, path: &CStr) -> Result<CString, i32> {
        let n = unsafe { (*self.vfs).mxPathname }.max(1) as usize + 1;
        let mut buf = vec![0u8; n];
        match unsafe { (*self.vfs).xFullPathname } {
            Some(f) => check(unsafe {
                f(
                    self.vfs,
                    path.as_ptr(),
                    n as c_int,
                    buf.as_mut_ptr() as *mut c_char,
                )
            })?,
            None => return Err(ffi::SQLITE_ERROR),
        }
        CStr::from_bytes_until_nul(&buf)
            .map(CStr::to_owned)
            .map_err(|_| ffi::SQLITE_ERROR)
    }

    pub fn randomness(&self, buf: &mut [u8]) -> usize {
        match unsafe { (*self.vfs).xRandomness } {
            Some(f) => unsafe {
                f(
                    self.vfs,
                    buf.len() as c_int,
                    buf.as_mut_ptr() as *mut c_char,
                )
            }
            .max(0) as usize,
            None => 0,
        }
    }

    pub fn sleep(&self, micros: usize) -> usize {
        match unsafe { (*self.vfs).xSleep } {
            Some(f) => unsafe { f(self.vfs, micros as c_int) }.max(0) as usize,
            None => 0,
        }
    }

    pub fn current_time(&self) -> f64 {
        let mut out = 0f64;
        if let Some(f) = unsafe { (*self.vfs).xCurrentTime } {
            unsafe { f(self.vfs, &mut out) };
        }
        out
    }

    pub fn current_time_int64(&self) -> i64 {
        match unsafe { (*self.vfs).xCurrentTimeInt64 } {
            Some(f) => {
                let mut out = 0i64;
                unsafe { f(self.vfs, &mut out) };
                out
            }
            // pre-v2 hosts only expose the floating point clock
            None => (self.current_time() * 864.0e5) as i64,
        }
    }

    pub fn dl_open(&self, path: &CStr) -> *mut c_void {
        match unsafe { (*self.vfs).xDlOpen } {
            Some(f) => unsafe { f(self.vfs, path.as_ptr()) },
            None => std::ptr::null_mut(),
        }
    }

    pub fn dl_error(&self, buf: &mut [u8]) {
        if let Some(f) = unsafe { (*self.vfs).xDlError } {
            unsafe { f(self.vfs, buf.len() as c_int, buf.as_mut_ptr() as *mut c_char) };
        }
    }

    pub fn dl_sym(&self, handle: *mut c_void, symbol: &CStr) -> Option<unsafe extern "C" fn()> {
        match unsafe { (*self.vfs).xDlSym } {
            // SQLite declares xDlSym's return type with a placeholder signature;
            // the actual symbol may have any signature, so this cast is required.
            Some(f) => unsafe {
                std::mem::transmute::<_, Option<unsafe extern "C" fn()>>(f(
                    self.vfs,
                    handle,
                    symbol.as_ptr(),
                ))
            },
            None => None,
        }
    }

    pub fn dl_close(&self, handle: *mut c_void) {
        if let Some(f) = unsafe { (*self.vfs).xDlClose } {
            unsafe { f(self.vfs, handle) };
        }
    }
}

macro_rules! io_call {
    ($self:ident, $method:ident $(, $arg:expr)*) => {{
        let methods = unsafe { (*$self.file).pMethods };
        if methods.is_null() {
            ffi::SQLITE_IOERR
        } else {
            match unsafe { (*methods).$method } {
                Some(f) => unsafe { f($self.file $(, $arg)*) },
                None => ffi::SQLITE_IOERR,
            }
        }
    }};
}

/// A file opened through the host VFS. Owns the `szOsFile`-sized buffer the
/// host opened into; dropping the value closes the file and releases the
/// buffer.
pub(crate) struct HostFile {
    file: *mut ffi::sqlite3_file,
    layout: Layout,
}

// SAFETY: the buffer is an owned heap allocation and the host VFS attaches
// no thread affinity to its files; SQLite serializes use of each handle.
unsafe impl Send for HostFile {}

impl HostFile {
    pub fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<(), i32> {
        check(io_call!(
            self,
            xRead,
            buf.as_mut_ptr() as *mut c_void,
            buf.len() as c_int,
            pos as ffi::sqlite3_int64
        ))
    }

    pub fn write(&mut self, pos: u64, buf: &[u8]) -> Result<(), i32> {
        check(io_call!(
            self,
            xWrite,
            buf.as_ptr() as *const c_void,
            buf.len() as c_int,
            pos as ffi::sqlite3_int64
        ))
    }

    pub fn truncate(&mut self, size: u64) -> Result<(), i32> {
        check(io_call!(self, xTruncate, size as ffi::sqlite3_int64))
    }

    pub fn sync(&mut self, flags: c_int) -> Result<(), i32> {
        check(io_call!(self, xSync, flags))
    }

    pub fn file_size(&self) -> Result<u64, i32> {
        let mut size: ffi::sqlite3_int64 = 0;
        check(io_call!(self, xFileSize, &mut size))?;
        Ok(size.max(0) as u64)
    }

    pub fn lock(&mut self, level: c_int) -> Result<(), i32> {
        check(io_call!(self, xLock, level))
    }

    pub fn unlock(&mut self, level: c_int) -> Result<(), i32> {
        check(io_call!(self, xUnlock, level))
    }

    pub fn check_reserved_lock(&mut self) -> Result<bool, i32> {
        let mut out: c_int = 0;
        check(io_call!(self, xCheckReservedLock, &mut out))?;
        Ok(out != 0)
    }

    pub fn file_control(&mut self, op: c_int, arg: *mut c_void) -> c_int {
        io_call!(self, xFileControl, op, arg)
    }

    pub fn sector_size(&self) -> c_int {
        io_call!(self, xSectorSize)
    }

    pub fn device_characteristics(&self) -> c_int {
        io_call!(self, xDeviceCharacteristics)
    }

    pub fn shm_map(
        &mut self,
        region: c_int,
        size: c_int,
        extend: bool,
        pp: *mut *mut c_void,
    ) -> c_int {
        io_call!(self, xShmMap, region, size, extend as c_int, pp)
    }

    pub fn shm_lock(&mut self, offset: c_int, n: c_int, flags: c_int) -> c_int {
        io_call!(self, xShmLock, offset, n, flags)
    }

    pub fn shm_barrier(&mut self) {
        let methods = unsafe { (*self.file).pMethods };
        if !methods.is_null() {
            if let Some(f) = unsafe { (*methods).xShmBarrier } {
                unsafe { f(self.file) };
            }
        }
    }

    pub fn shm_unmap(&mut self, delete: bool) -> c_int {
        io_call!(self, xShmUnmap, delete as c_int)
    }

    pub fn fetch(&mut self, pos: u64, amt: c_int, pp: *mut *mut c_void) -> c_int {
        io_call!(self, xFetch, pos as ffi::sqlite3_int64, amt, pp)
    }

    pub fn unfetch(&mut self, pos: u64, page: *mut c_void) -> c_int {
        io_call!(self, xUnfetch, pos as ffi::sqlite3_int64, page)
    }
}

impl Drop for HostFile {
    fn drop(&mut self) {
        close_host_file(self.file);
        unsafe { dealloc(self.file as *mut u8, self.layout) };
    }
}

fn close_host_file(file: *mut ffi::sqlite3_file) {
    let methods = unsafe { (*file).pMethods };
    if !methods.is_null() {
        if let Some(f) = unsafe { (*methods).xClose } {
            unsafe { f(file) };
        }
    }
}
