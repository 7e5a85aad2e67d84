//! Create a custom SQLite virtual file system by implementing the [Vfs] and
//! [File] traits and registering the implementation with [register].
//!
//! Every method of SQLite's version-3 `sqlite3_vfs` and `sqlite3_io_methods`
//! tables is surfaced through the traits, so an implementation can either
//! interpose on a call or forward it to another VFS. [register] returns a
//! [Registration] which can later unregister the VFS and reclaim every
//! allocation made during registration.

use std::ffi::{c_void, CStr, CString};
use std::mem::{size_of, MaybeUninit};
use std::os::raw::{c_char, c_int};
use std::ptr::null_mut;
use std::slice;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

pub use libsqlite3_sys as ffi;

pub type VfsError = i32;
pub type VfsResult<T> = std::result::Result<T, VfsError>;

// re-export constants that a vfs implementation commonly needs
pub use ffi::{SQLITE_IOERR, SQLITE_IOERR_SHORT_READ, SQLITE_NOTFOUND, SQLITE_OK};

const MAX_PATH_LENGTH: usize = 512;

/// A file opened by a [Vfs].
///
/// See https://sqlite.org/c3ref/io_methods.html
///
/// Dropping the value corresponds to xClose.
pub trait File {
    /// int (*xFileSize)(sqlite3_file*, sqlite3_int64 *pSize);
    fn file_size(&self) -> VfsResult<u64>;

    /// int (*xTruncate)(sqlite3_file*, sqlite3_int64 size);
    fn truncate(&mut self, size: u64) -> VfsResult<()>;

    /// int (*xWrite)(sqlite3_file*, const void*, int iAmt, sqlite3_int64 iOfst);
    fn write(&mut self, pos: u64, buf: &[u8]) -> VfsResult<usize>;

    /// int (*xRead)(sqlite3_file*, void*, int iAmt, sqlite3_int64 iOfst);
    ///
    /// Returning fewer bytes than `buf.len()` reports a short read to SQLite;
    /// the glue zero-fills the unread tail of the buffer.
    fn read(&mut self, pos: u64, buf: &mut [u8]) -> VfsResult<usize>;

    /// int (*xSync)(sqlite3_file*, int flags);
    fn sync(&mut self, flags: c_int) -> VfsResult<()>;

    /// int (*xLock)(sqlite3_file*, int);
    fn lock(&mut self, level: LockLevel) -> VfsResult<()> {
        let _ = level;
        Ok(())
    }

    /// int (*xUnlock)(sqlite3_file*, int);
    fn unlock(&mut self, level: LockLevel) -> VfsResult<()> {
        let _ = level;
        Ok(())
    }

    /// int (*xCheckReservedLock)(sqlite3_file*, int *pResOut);
    fn check_reserved_lock(&mut self) -> VfsResult<bool> {
        Ok(false)
    }

    /// int (*xFileControl)(sqlite3_file*, int op, void *pArg);
    ///
    /// The return value is handed to SQLite verbatim.
    fn file_control(&mut self, op: c_int, arg: *mut c_void) -> c_int {
        let _ = (op, arg);
        ffi::SQLITE_NOTFOUND
    }

    /// The xSectorSize() method returns the sector size of the device that
    /// underlies the file.
    ///
    /// int (*xSectorSize)(sqlite3_file*);
    fn sector_size(&self) -> c_int {
        1024
    }

    /// int (*xDeviceCharacteristics)(sqlite3_file*);
    fn device_characteristics(&self) -> c_int {
        // same capability set sqlite's memvfs advertises
        ffi::SQLITE_IOCAP_ATOMIC
            | ffi::SQLITE_IOCAP_POWERSAFE_OVERWRITE
            | ffi::SQLITE_IOCAP_SAFE_APPEND
            | ffi::SQLITE_IOCAP_SEQUENTIAL
    }

    /// int (*xShmMap)(sqlite3_file*, int iPg, int pgsz, int, void volatile**);
    fn shm_map(&mut self, region: c_int, size: c_int, extend: bool, pp: *mut *mut c_void) -> c_int {
        let _ = (region, size, extend, pp);
        ffi::SQLITE_IOERR_SHMMAP
    }

    /// int (*xShmLock)(sqlite3_file*, int offset, int n, int flags);
    fn shm_lock(&mut self, offset: c_int, n: c_int, flags: c_int) -> c_int {
        let _ = (offset, n, flags);
        ffi::SQLITE_IOERR_SHMLOCK
    }

    /// void (*xShmBarrier)(sqlite3_file*);
    fn shm_barrier(&mut self) {}

    /// int (*xShmUnmap)(sqlite3_file*, int deleteFlag);
    fn shm_unmap(&mut self, delete: bool) -> c_int {
        let _ = delete;
        ffi::SQLITE_OK
    }

    /// int (*xFetch)(sqlite3_file*, sqlite3_int64 iOfst, int iAmt, void **pp);
    ///
    /// The default reports the page as unavailable, which makes SQLite fall
    /// back to ordinary reads.
    fn fetch(&mut self, pos: u64, amt: c_int, pp: *mut *mut c_void) -> c_int {
        let _ = (pos, amt);
        if !pp.is_null() {
            unsafe { *pp = null_mut() };
        }
        ffi::SQLITE_OK
    }

    /// int (*xUnfetch)(sqlite3_file*, sqlite3_int64 iOfst, void *p);
    fn unfetch(&mut self, pos: u64, page: *mut c_void) -> c_int {
        let _ = (pos, page);
        ffi::SQLITE_OK
    }
}

/// A sqlite vfs
///
/// See https://sqlite.org/c3ref/vfs.html
pub trait Vfs {
    /// The file returned by [Vfs::open].
    type File: File;

    /// Open the database object at `path`.
    ///
    /// int (*xOpen)(sqlite3_vfs*, const char *zName, sqlite3_file*, int flags, int *pOutFlags);
    fn open(&mut self, path: &CStr, opts: OpenOptions) -> VfsResult<Self::File>;

    /// Delete the database object at `path`.
    ///
    /// int (*xDelete)(sqlite3_vfs*, const char *zName, int syncDir);
    fn delete(&mut self, path: &CStr, sync_dir: bool) -> VfsResult<()>;

    /// Check if an object at `path` already exists (xAccess with
    /// SQLITE_ACCESS_EXISTS).
    fn exists(&mut self, path: &CStr) -> VfsResult<bool>;

    /// Check read (or read-write) access to `path`. The default always grants
    /// access.
    #[allow(unused_variables)]
    fn access(&mut self, path: &CStr, write: bool) -> VfsResult<bool> {
        Ok(true)
    }

    /// Canonicalize `path` (xFullPathname). The default returns the path
    /// unchanged.
    fn full_pathname(&mut self, path: &CStr) -> VfsResult<CString> {
        Ok(path.to_owned())
    }

    /// Generate up to `bytes.len()` bytes of randomness.
    ///
    /// int (*xRandomness)(sqlite3_vfs*, int nByte, char *zOut);
    fn randomness(&self, bytes: &mut [u8]) -> usize {
        use rand::Rng;
        rand::thread_rng().fill(bytes);
        bytes.len()
    }

    /// Sleep for at least `n_micro` microseconds; return the number of
    /// microseconds actually slept.
    ///
    /// int (*xSleep)(sqlite3_vfs*, int microseconds);
    fn sleep(&self, n_micro: usize) -> usize {
        let instant = Instant::now();
        thread::sleep(Duration::from_micros(n_micro as u64));
        instant.elapsed().as_micros() as usize
    }

    /// The current date and time as a Julian Day number.
    ///
    /// int (*xCurrentTime)(sqlite3_vfs*, double*);
    fn current_time(&self) -> f64 {
        let now = time::OffsetDateTime::now_utc().unix_timestamp() as f64;
        2440587.5 + now / 864.0e5
    }

    /// int (*xCurrentTimeInt64)(sqlite3_vfs*, sqlite3_int64*);
    fn current_time_int64(&self) -> i64 {
        (self.current_time() * 864.0e5) as i64
    }

    /// void* (*xDlOpen)(sqlite3_vfs*, const char *zFilename);
    fn dl_open(&mut self, path: &CStr) -> *mut c_void {
        let _ = path;
        null_mut()
    }

    /// void (*xDlError)(sqlite3_vfs*, int nByte, char *zErrMsg);
    ///
    /// Write a NUL-terminated utf-8 message into `buf`.
    fn dl_error(&mut self, buf: &mut [u8]) {
        static MSG: &[u8] = b"loadable extensions are not supported\0";
        let n = MSG.len().min(buf.len());
        buf[..n].copy_from_slice(&MSG[..n]);
        if let Some(last) = buf.last_mut() {
            *last = 0;
        }
    }

    /// void (*(*xDlSym)(sqlite3_vfs*, void*, const char *zSymbol))(void);
    fn dl_sym(&mut self, handle: *mut c_void, symbol: &CStr) -> Option<unsafe extern "C" fn()> {
        let _ = (handle, symbol);
        None
    }

    /// void (*xDlClose)(sqlite3_vfs*, void*);
    fn dl_close(&mut self, handle: *mut c_void) {
        let _ = handle;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenOptions {
    /// The object type that is being opened.
    pub kind: OpenKind,

    /// The access an object is opened with.
    pub access: OpenAccess,

    /// The file should be deleted when it is closed.
    pub delete_on_close: bool,

    /// The unparsed SQLITE_OPEN_* flag word, for implementations that forward
    /// the open to another VFS.
    pub flags: c_int,
}

/// The object type that is being opened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpenKind {
    MainDb,
    MainJournal,
    TempDb,
    TempJournal,
    TransientDb,
    SubJournal,
    SuperJournal,
    Wal,
}

/// The access an object is opened with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpenAccess {
    /// Read access.
    Read,

    /// Write access (includes read access).
    Write,

    /// Create the file if it does not exist (includes write and read access).
    Create,

    /// Create the file, but throw if it it already exist (includes write and
    /// read access).
    CreateNew,
}

/// One of SQLite's five file lock states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    Unlocked,
    Shared,
    Reserved,
    Pending,
    Exclusive,
}

impl LockLevel {
    pub fn from_raw(raw: c_int) -> Option<Self> {
        match raw {
            ffi::SQLITE_LOCK_NONE => Some(Self::Unlocked),
            ffi::SQLITE_LOCK_SHARED => Some(Self::Shared),
            ffi::SQLITE_LOCK_RESERVED => Some(Self::Reserved),
            ffi::SQLITE_LOCK_PENDING => Some(Self::Pending),
            ffi::SQLITE_LOCK_EXCLUSIVE => Some(Self::Exclusive),
            _ => None,
        }
    }

    pub fn as_raw(self) -> c_int {
        match self {
            Self::Unlocked => ffi::SQLITE_LOCK_NONE,
            Self::Shared => ffi::SQLITE_LOCK_SHARED,
            Self::Reserved => ffi::SQLITE_LOCK_RESERVED,
            Self::Pending => ffi::SQLITE_LOCK_PENDING,
            Self::Exclusive => ffi::SQLITE_LOCK_EXCLUSIVE,
        }
    }
}

struct State<V> {
    vfs: Mutex<V>,
    io_methods: ffi::sqlite3_io_methods,
    last_error: Arc<AtomicI32>,
}

#[repr(C)]
struct FileState<F> {
    base: ffi::sqlite3_file,
    ext: MaybeUninit<FileExt<F>>,
}

#[repr(C)]
struct FileExt<F> {
    name: String,
    file: F,
    last_error: Arc<AtomicI32>,
}

impl<F> FileExt<F> {
    fn unset_last_error(&mut self) {
        self.last_error.store(ffi::SQLITE_OK, Ordering::Relaxed);
    }

    fn set_last_error(&mut self, err: VfsError) {
        self.last_error.store(err, Ordering::Relaxed);
    }
}

/// A registered virtual file system.
///
/// Keeps the raw allocations handed to SQLite alive until [unregister] is
/// called. Dropping the handle without unregistering leaves the VFS
/// registered for the rest of the process lifetime.
///
/// [unregister]: Registration::unregister
pub struct Registration {
    vfs: *mut ffi::sqlite3_vfs,
    reclaim: unsafe fn(*mut ffi::sqlite3_vfs),
}

// SAFETY: the pointers are only dereferenced by unregister(), which consumes
// the handle; until then they are owned, stable heap allocations.
unsafe impl Send for Registration {}

impl Registration {
    /// Unregister the VFS from SQLite and reclaim the registration's
    /// allocations.
    ///
    /// Callers must close every connection opened through this VFS first:
    /// open file handles keep pointing at the reclaimed method tables.
    pub fn unregister(self) -> Result<(), RegisterError> {
        let rc = unsafe { ffi::sqlite3_vfs_unregister(self.vfs) };
        if rc != ffi::SQLITE_OK {
            return Err(RegisterError::Unregister(rc));
        }
        unsafe { (self.reclaim)(self.vfs) };
        Ok(())
    }
}

unsafe fn reclaim<F: File, V: Vfs<File = F>>(p_vfs: *mut ffi::sqlite3_vfs) {
    let vfs = Box::from_raw(p_vfs);
    drop(Box::from_raw(vfs.pAppData as *mut State<V>));
    drop(CString::from_raw(vfs.zName as *mut c_char));
}

/// Register a virtual file system ([Vfs]) with SQLite under `name`.
pub fn register<F: File, V: Vfs<File = F>>(
    name: &str,
    vfs: V,
) -> Result<Registration, RegisterError> {
    let io_methods = ffi::sqlite3_io_methods {
        iVersion: 3,
        xClose: Some(io::close::<F>),
        xRead: Some(io::read::<F>),
        xWrite: Some(io::write::<F>),
        xTruncate: Some(io::truncate::<F>),
        xSync: Some(io::sync::<F>),
        xFileSize: Some(io::file_size::<F>),
        xLock: Some(io::lock::<F>),
        xUnlock: Some(io::unlock::<F>),
        xCheckReservedLock: Some(io::check_reserved_lock::<F>),
        xFileControl: Some(io::file_control::<F>),
        xSectorSize: Some(io::sector_size::<F>),
        xDeviceCharacteristics: Some(io::device_characteristics::<F>),
        xShmMap: Some(io::shm_map::<F>),
        xShmLock: Some(io::shm_lock::<F>),
        xShmBarrier: Some(io::shm_barrier::<F>),
        xShmUnmap: Some(io::shm_unmap::<F>),
        xFetch: Some(io::fetch::<F>),
        xUnfetch: Some(io::unfetch::<F>),
    };

    let name = CString::new(name)?.into_raw();
    let state = Box::into_raw(Box::new(State {
        vfs: Mutex::new(vfs),
        io_methods,
        last_error: Arc::new(AtomicI32::new(ffi::SQLITE_OK)),
    }));
    let p_vfs = Box::into_raw(Box::new(ffi::sqlite3_vfs {
        iVersion: 3,
        szOsFile: size_of::<FileState<F>>() as i32,
        mxPathname: MAX_PATH_LENGTH as i32,
        pNext: null_mut(),
        zName: name,
        pAppData: state as _,
        xOpen: Some(vfs::open::<F, V>),
        xDelete: Some(vfs::delete::<V>),
        xAccess: Some(vfs::access::<V>),
        xFullPathname: Some(vfs::full_pathname::<V>),
        xDlOpen: Some(vfs::dl_open::<V>),
        xDlError: Some(vfs::dl_error::<V>),
        xDlSym: Some(vfs::dl_sym::<V>),
        xDlClose: Some(vfs::dl_close::<V>),
        xRandomness: Some(vfs::randomness::<V>),
        xSleep: Some(vfs::sleep::<V>),
        xCurrentTime: Some(vfs::current_time::<V>),
        xGetLastError: Some(vfs::get_last_error::<V>),
        xCurrentTimeInt64: Some(vfs::current_time_int64::<V>),
        xSetSystemCall: None,
        xGetSystemCall: None,
        xNextSystemCall: None,
    }));

    let rc = unsafe { ffi::sqlite3_vfs_register(p_vfs, false as i32) };
    if rc != ffi::SQLITE_OK {
        unsafe { reclaim::<F, V>(p_vfs) };
        return Err(RegisterError::Register(rc));
    }

    Ok(Registration {
        vfs: p_vfs,
        reclaim: reclaim::<F, V>,
    })
}

mod vfs {
    use super::*;

    fn locked_vfs<V>(state: &State<V>) -> std::sync::MutexGuard<'_, V> {
        state.vfs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new file handle.
    pub unsafe extern "C" fn open<F: File, V: Vfs<File = F>>(
        p_vfs: *mut ffi::sqlite3_vfs,
        z_name: *const c_char,
        p_file: *mut ffi::sqlite3_file,
        flags: c_int,
        p_out_flags: *mut c_int,
    ) -> c_int {
        if z_name.is_null() {
            return ffi::SQLITE_CANTOPEN;
        }
        let path = CStr::from_ptr(z_name);
        log::trace!("open z_name={:?} flags={}", path, flags);

        let state = match vfs_state::<V>(p_vfs) {
            Ok(state) => state,
            Err(_) => return ffi::SQLITE_ERROR,
        };
        state.last_error.store(ffi::SQLITE_OK, Ordering::Relaxed);

        let opts = match OpenOptions::from_flags(flags) {
            Some(opts) => opts,
            None => {
                state.last_error.store(ffi::SQLITE_IOERR, Ordering::Relaxed);
                return ffi::SQLITE_CANTOPEN;
            }
        };

        let result = locked_vfs(state).open(path, opts).and_then(|file| {
            let out_file = (p_file as *mut FileState<F>)
                .as_mut()
                .ok_or_else(null_ptr_error)?;
            out_file.base.pMethods = &state.io_methods;
            out_file.ext.write(FileExt {
                name: path.to_string_lossy().into_owned(),
                file,
                last_error: Arc::clone(&state.last_error),
            });
            Ok(())
        });

        if let Err(err) = result {
            state.last_error.store(err, Ordering::Relaxed);
            return ffi::SQLITE_CANTOPEN;
        }

        if let Some(p_out_flags) = p_out_flags.as_mut() {
            *p_out_flags = flags;
        }

        ffi::SQLITE_OK
    }

    /// Delete the file located at `z_path`.
    pub unsafe extern "C" fn delete<V: Vfs>(
        p_vfs: *mut ffi::sqlite3_vfs,
        z_path: *const c_char,
        sync_dir: c_int,
    ) -> c_int {
        if z_path.is_null() {
            return ffi::SQLITE_IOERR_DELETE;
        }
        let path = CStr::from_ptr(z_path);
        log::trace!("delete z_path={:?}", path);

        let state = match vfs_state::<V>(p_vfs) {
            Ok(state) => state,
            Err(_) => return ffi::SQLITE_ERROR,
        };
        state.last_error.store(ffi::SQLITE_OK, Ordering::Relaxed);

        match locked_vfs(state).delete(path, sync_dir != 0) {
            Ok(_) => ffi::SQLITE_OK,
            Err(err) => {
                state.last_error.store(err, Ordering::Relaxed);
                err
            }
        }
    }

    /// Test for access permissions.
    pub unsafe extern "C" fn access<V: Vfs>(
        p_vfs: *mut ffi::sqlite3_vfs,
        z_path: *const c_char,
        flags: c_int,
        p_res_out: *mut c_int,
    ) -> c_int {
        if z_path.is_null() {
            return ffi::SQLITE_IOERR_ACCESS;
        }
        let path = CStr::from_ptr(z_path);
        log::trace!("access z_path={:?} flags={}", path, flags);

        let state = match vfs_state::<V>(p_vfs) {
            Ok(state) => state,
            Err(_) => return ffi::SQLITE_ERROR,
        };
        state.last_error.store(ffi::SQLITE_OK, Ordering::Relaxed);

        let result = match flags {
            ffi::SQLITE_ACCESS_EXISTS => locked_vfs(state).exists(path),
            ffi::SQLITE_ACCESS_READ => locked_vfs(state).access(path, false),
            ffi::SQLITE_ACCESS_READWRITE => locked_vfs(state).access(path, true),
            _ => return ffi::SQLITE_IOERR_ACCESS,
        };

        if let Err(err) = result.and_then(|ok| {
            let p_res_out: &mut c_int = p_res_out.as_mut().ok_or_else(null_ptr_error)?;
            *p_res_out = ok as i32;
            Ok(())
        }) {
            state.last_error.store(err, Ordering::Relaxed);
            return ffi::SQLITE_IOERR_ACCESS;
        }

        ffi::SQLITE_OK
    }

    /// Populate `z_out` with the full canonical pathname of `z_path`.
    pub unsafe extern "C" fn full_pathname<V: Vfs>(
        p_vfs: *mut ffi::sqlite3_vfs,
        z_path: *const c_char,
        n_out: c_int,
        z_out: *mut c_char,
    ) -> c_int {
        let path = CStr::from_ptr(z_path);
        log::trace!("full_pathname z_path={:?}", path);

        let state = match vfs_state::<V>(p_vfs) {
            Ok(state) => state,
            Err(_) => return ffi::SQLITE_ERROR,
        };
        state.last_error.store(ffi::SQLITE_OK, Ordering::Relaxed);

        let full = match locked_vfs(state).full_pathname(path) {
            Ok(full) => full,
            Err(err) => {
                state.last_error.store(err, Ordering::Relaxed);
                return ffi::SQLITE_ERROR;
            }
        };

        let full = full.as_bytes_with_nul();
        if full.len() > n_out as usize || full.len() > MAX_PATH_LENGTH {
            return ffi::SQLITE_ERROR;
        }
        let out = slice::from_raw_parts_mut(z_out as *mut u8, full.len());
        out.copy_from_slice(full);

        ffi::SQLITE_OK
    }

    /// Open the dynamic library located at `z_path`.
    pub unsafe extern "C" fn dl_open<V: Vfs>(
        p_vfs: *mut ffi::sqlite3_vfs,
        z_path: *const c_char,
    ) -> *mut c_void {
        log::trace!("dl_open");

        let state = match vfs_state::<V>(p_vfs) {
            Ok(state) => state,
            Err(_) => return null_mut(),
        };
        if z_path.is_null() {
            return null_mut();
        }
        locked_vfs(state).dl_open(CStr::from_ptr(z_path))
    }

    /// Populate `z_err_msg` with the most recent dynamic-library error.
    pub unsafe extern "C" fn dl_error<V: Vfs>(
        p_vfs: *mut ffi::sqlite3_vfs,
        n_byte: c_int,
        z_err_msg: *mut c_char,
    ) {
        log::trace!("dl_error");

        let state = match vfs_state::<V>(p_vfs) {
            Ok(state) => state,
            Err(_) => return,
        };
        if z_err_msg.is_null() || n_byte <= 0 {
            return;
        }
        let buf = slice::from_raw_parts_mut(z_err_msg as *mut u8, n_byte as usize);
        locked_vfs(state).dl_error(buf);
    }

    /// Resolve the symbol `z_sym` in the dynamic library `p_handle`.
    pub unsafe extern "C" fn dl_sym<V: Vfs>(
        p_vfs: *mut ffi::sqlite3_vfs,
        p_handle: *mut c_void,
        z_sym: *const c_char,
    ) -> Option<
        unsafe extern "C" fn(*mut ffi::sqlite3_vfs, *mut c_void, *const c_char),
    > {
        log::trace!("dl_sym");

        let state = match vfs_state::<V>(p_vfs) {
            Ok(state) => state,
            Err(_) => return None,
        };
        if z_sym.is_null() {
            return None;
        }
        let sym = locked_vfs(state).dl_sym(p_handle, CStr::from_ptr(z_sym));
        // SQLite declares xDlSym's return type with a placeholder signature;
        // the actual symbol may have any signature, so this cast is required.
        std::mem::transmute::<Option<unsafe extern "C" fn()>, _>(sym)
    }

    /// Close the dynamic library handle `p_handle`.
    pub unsafe extern "C" fn dl_close<V: Vfs>(p_vfs: *mut ffi::sqlite3_vfs, p_handle: *mut c_void) {
        log::trace!("dl_close");

        if let Ok(state) = vfs_state::<V>(p_vfs) {
            locked_vfs(state).dl_close(p_handle);
        }
    }

    /// Populate the buffer pointed to by `z_buf_out` with `n_byte` bytes of
    /// random data.
    pub unsafe extern "C" fn randomness<V: Vfs>(
        p_vfs: *mut ffi::sqlite3_vfs,
        n_byte: c_int,
        z_buf_out: *mut c_char,
    ) -> c_int {
        log::trace!("randomness");

        let state = match vfs_state::<V>(p_vfs) {
            Ok(state) => state,
            Err(_) => return 0,
        };
        let bytes = slice::from_raw_parts_mut(z_buf_out as *mut u8, n_byte as usize);
        locked_vfs(state).randomness(bytes) as c_int
    }

    /// Sleep for `n_micro` microseconds.
    pub unsafe extern "C" fn sleep<V: Vfs>(p_vfs: *mut ffi::sqlite3_vfs, n_micro: c_int) -> c_int {
        log::trace!("sleep");

        let state = match vfs_state::<V>(p_vfs) {
            Ok(state) => state,
            Err(_) => return 0,
        };
        locked_vfs(state).sleep(n_micro as usize) as c_int
    }

    /// Return the current time as a Julian Day number in `p_time_out`.
    pub unsafe extern "C" fn current_time<V: Vfs>(
        p_vfs: *mut ffi::sqlite3_vfs,
        p_time_out: *mut f64,
    ) -> c_int {
        log::trace!("current_time");

        let state = match vfs_state::<V>(p_vfs) {
            Ok(state) => state,
            Err(_) => return ffi::SQLITE_ERROR,
        };
        *p_time_out = locked_vfs(state).current_time();
        ffi::SQLITE_OK
    }

    pub unsafe extern "C" fn current_time_int64<V: Vfs>(
        p_vfs: *mut ffi::sqlite3_vfs,
        p: *mut i64,
    ) -> i32 {
        log::trace!("current_time_int64");

        let state = match vfs_state::<V>(p_vfs) {
            Ok(state) => state,
            Err(_) => return ffi::SQLITE_ERROR,
        };
        *p = locked_vfs(state).current_time_int64();
        ffi::SQLITE_OK
    }

    pub unsafe extern "C" fn get_last_error<V>(
        p_vfs: *mut ffi::sqlite3_vfs,
        n_byte: c_int,
        z_err_msg: *mut c_char,
    ) -> c_int {
        let state = match vfs_state::<V>(p_vfs) {
            Ok(state) => state,
            Err(_) => return ffi::SQLITE_ERROR,
        };
        let err = state.last_error.swap(ffi::SQLITE_OK, Ordering::Relaxed);
        if err != ffi::SQLITE_OK {
            let msg = match CString::new(format!("vfs error code {}", err)) {
                Ok(msg) => msg,
                Err(_) => return ffi::SQLITE_ERROR,
            };

            let msg = msg.to_bytes_with_nul();
            if msg.len() > n_byte as usize {
                return ffi::SQLITE_ERROR;
            }
            let out = slice::from_raw_parts_mut(z_err_msg as *mut u8, msg.len());
            out.copy_from_slice(msg);
        }
        ffi::SQLITE_OK
    }
}

mod io {
    use std::mem;

    use super::*;

    /// Close a file.
    pub unsafe extern "C" fn close<F>(p_file: *mut ffi::sqlite3_file) -> c_int {
        log::trace!("close");

        if let Some(f) = (p_file as *mut FileState<F>).as_mut() {
            let ext = mem::replace(&mut f.ext, MaybeUninit::uninit());
            let mut ext = ext.assume_init(); // extract the value to drop it
            ext.unset_last_error();
        }

        ffi::SQLITE_OK
    }

    /// Read data from a file.
    pub unsafe extern "C" fn read<F: File>(
        p_file: *mut ffi::sqlite3_file,
        z_buf: *mut c_void,
        i_amt: c_int,
        i_ofst: ffi::sqlite3_int64,
    ) -> c_int {
        log::trace!("read offset={} len={}", i_ofst, i_amt);

        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_IOERR_READ,
        };
        if i_ofst < 0 {
            return ffi::SQLITE_IOERR_READ;
        }

        let out = slice::from_raw_parts_mut(z_buf as *mut u8, i_amt as usize);
        match state.file.read(i_ofst as u64, out) {
            Ok(n) if n == out.len() => ffi::SQLITE_OK,
            Ok(n) => {
                out[n..].fill(0);
                ffi::SQLITE_IOERR_SHORT_READ
            }
            Err(err) => {
                if err != ffi::SQLITE_IOERR_SHORT_READ {
                    state.set_last_error(err);
                }
                err
            }
        }
    }

    /// Write data to a file.
    pub unsafe extern "C" fn write<F: File>(
        p_file: *mut ffi::sqlite3_file,
        z: *const c_void,
        i_amt: c_int,
        i_ofst: ffi::sqlite3_int64,
    ) -> c_int {
        log::trace!("write offset={} len={}", i_ofst, i_amt);

        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_IOERR_WRITE,
        };
        if i_ofst < 0 {
            return ffi::SQLITE_IOERR_WRITE;
        }

        let data = slice::from_raw_parts(z as *const u8, i_amt as usize);
        match state.file.write(i_ofst as u64, data) {
            Ok(n) if n == data.len() => ffi::SQLITE_OK,
            Ok(_) => ffi::SQLITE_IOERR_WRITE,
            Err(err) => {
                state.set_last_error(err);
                err
            }
        }
    }

    /// Truncate a file.
    pub unsafe extern "C" fn truncate<F: File>(
        p_file: *mut ffi::sqlite3_file,
        size: ffi::sqlite3_int64,
    ) -> c_int {
        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_IOERR_TRUNCATE,
        };
        log::trace!("truncate ({}) size={}", state.name, size);

        if let Err(err) = state.file.truncate(size.max(0) as u64) {
            state.set_last_error(err);
            return err;
        }

        ffi::SQLITE_OK
    }

    /// Persist changes to a file.
    pub unsafe extern "C" fn sync<F: File>(p_file: *mut ffi::sqlite3_file, flags: c_int) -> c_int {
        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_IOERR_FSYNC,
        };
        log::trace!("sync ({})", state.name);

        if let Err(err) = state.file.sync(flags) {
            state.set_last_error(err);
            return err;
        }

        ffi::SQLITE_OK
    }

    /// Return the current file-size of a file.
    pub unsafe extern "C" fn file_size<F: File>(
        p_file: *mut ffi::sqlite3_file,
        p_size: *mut ffi::sqlite3_int64,
    ) -> c_int {
        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_IOERR_FSTAT,
        };
        log::trace!("file_size ({})", state.name);

        if let Err(err) = state.file.file_size().and_then(|n| {
            let p_size: &mut ffi::sqlite3_int64 = p_size.as_mut().ok_or_else(null_ptr_error)?;
            *p_size = n as ffi::sqlite3_int64;
            Ok(())
        }) {
            state.set_last_error(err);
            return ffi::SQLITE_IOERR_FSTAT;
        }

        ffi::SQLITE_OK
    }

    /// Lock a file.
    pub unsafe extern "C" fn lock<F: File>(p_file: *mut ffi::sqlite3_file, e_lock: c_int) -> c_int {
        log::trace!("lock level={}", e_lock);

        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_IOERR_LOCK,
        };
        let level = match LockLevel::from_raw(e_lock) {
            Some(level) => level,
            None => return ffi::SQLITE_IOERR_LOCK,
        };

        match state.file.lock(level) {
            Ok(_) => ffi::SQLITE_OK,
            Err(err) => {
                state.set_last_error(err);
                err
            }
        }
    }

    /// Unlock a file.
    pub unsafe extern "C" fn unlock<F: File>(
        p_file: *mut ffi::sqlite3_file,
        e_lock: c_int,
    ) -> c_int {
        log::trace!("unlock level={}", e_lock);

        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_IOERR_UNLOCK,
        };
        let level = match LockLevel::from_raw(e_lock) {
            Some(level) => level,
            None => return ffi::SQLITE_IOERR_UNLOCK,
        };

        match state.file.unlock(level) {
            Ok(_) => ffi::SQLITE_OK,
            Err(err) => {
                state.set_last_error(err);
                err
            }
        }
    }

    /// Check if another file-handle holds a RESERVED lock on a file.
    pub unsafe extern "C" fn check_reserved_lock<F: File>(
        p_file: *mut ffi::sqlite3_file,
        p_res_out: *mut c_int,
    ) -> c_int {
        log::trace!("check_reserved_lock");

        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_IOERR_CHECKRESERVEDLOCK,
        };

        if let Err(err) = state.file.check_reserved_lock().and_then(|reserved| {
            let p_res_out: &mut c_int = p_res_out.as_mut().ok_or_else(null_ptr_error)?;
            *p_res_out = reserved as i32;
            Ok(())
        }) {
            state.set_last_error(err);
            return ffi::SQLITE_IOERR_CHECKRESERVEDLOCK;
        }

        ffi::SQLITE_OK
    }

    /// File control method. For custom operations on a file.
    pub unsafe extern "C" fn file_control<F: File>(
        p_file: *mut ffi::sqlite3_file,
        op: c_int,
        p_arg: *mut c_void,
    ) -> c_int {
        log::trace!("file_control op={}", op);

        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_ERROR,
        };
        state.file.file_control(op, p_arg)
    }

    /// Return the sector-size in bytes for a file.
    pub unsafe extern "C" fn sector_size<F: File>(p_file: *mut ffi::sqlite3_file) -> c_int {
        log::trace!("sector_size");

        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_ERROR,
        };
        state.file.sector_size()
    }

    /// Return the device characteristic flags supported by a file.
    pub unsafe extern "C" fn device_characteristics<F: File>(
        p_file: *mut ffi::sqlite3_file,
    ) -> c_int {
        log::trace!("device_characteristics");

        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_ERROR,
        };
        state.file.device_characteristics()
    }

    /// Create a shared memory file mapping.
    pub unsafe extern "C" fn shm_map<F: File>(
        p_file: *mut ffi::sqlite3_file,
        i_pg: i32,
        pgsz: i32,
        b_extend: i32,
        pp: *mut *mut c_void,
    ) -> i32 {
        log::trace!("shm_map pg={} sz={} extend={}", i_pg, pgsz, b_extend);

        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_IOERR_SHMMAP,
        };
        state.file.shm_map(i_pg, pgsz, b_extend != 0, pp)
    }

    /// Perform locking on a shared-memory segment.
    pub unsafe extern "C" fn shm_lock<F: File>(
        p_file: *mut ffi::sqlite3_file,
        offset: i32,
        n: i32,
        flags: i32,
    ) -> i32 {
        log::trace!("shm_lock");

        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_IOERR_SHMLOCK,
        };
        state.file.shm_lock(offset, n, flags)
    }

    /// Memory barrier operation on shared memory.
    pub unsafe extern "C" fn shm_barrier<F: File>(p_file: *mut ffi::sqlite3_file) {
        log::trace!("shm_barrier");

        if let Ok(state) = file_state::<F>(p_file, false) {
            state.file.shm_barrier();
        }
    }

    /// Unmap a shared memory segment.
    pub unsafe extern "C" fn shm_unmap<F: File>(
        p_file: *mut ffi::sqlite3_file,
        delete_flag: i32,
    ) -> i32 {
        log::trace!("shm_unmap");

        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_IOERR_SHMMAP,
        };
        state.file.shm_unmap(delete_flag != 0)
    }

    /// Fetch a page of a memory-mapped file.
    pub unsafe extern "C" fn fetch<F: File>(
        p_file: *mut ffi::sqlite3_file,
        i_ofst: i64,
        i_amt: i32,
        pp: *mut *mut c_void,
    ) -> i32 {
        log::trace!("fetch offset={} len={}", i_ofst, i_amt);

        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_ERROR,
        };
        state.file.fetch(i_ofst.max(0) as u64, i_amt, pp)
    }

    /// Release a memory-mapped page.
    pub unsafe extern "C" fn unfetch<F: File>(
        p_file: *mut ffi::sqlite3_file,
        i_ofst: i64,
        p_page: *mut c_void,
    ) -> i32 {
        log::trace!("unfetch offset={}", i_ofst);

        let state = match file_state::<F>(p_file, true) {
            Ok(f) => f,
            Err(_) => return ffi::SQLITE_ERROR,
        };
        state.file.unfetch(i_ofst.max(0) as u64, p_page)
    }
}

fn null_ptr_error() -> VfsError {
    ffi::SQLITE_IOERR
}

unsafe fn vfs_state<'a, V>(ptr: *mut ffi::sqlite3_vfs) -> VfsResult<&'a mut State<V>> {
    let vfs: &mut ffi::sqlite3_vfs = ptr.as_mut().ok_or_else(null_ptr_error)?;
    let state = (vfs.pAppData as *mut State<V>)
        .as_mut()
        .ok_or_else(null_ptr_error)?;
    Ok(state)
}

unsafe fn file_state<'a, F>(
    ptr: *mut ffi::sqlite3_file,
    reset_last_error: bool,
) -> VfsResult<&'a mut FileExt<F>> {
    let f = (ptr as *mut FileState<F>)
        .as_mut()
        .ok_or_else(null_ptr_error)?;
    let ext = f.ext.assume_init_mut();
    if reset_last_error {
        ext.unset_last_error();
    }
    Ok(ext)
}

impl OpenOptions {
    fn from_flags(flags: i32) -> Option<Self> {
        Some(OpenOptions {
            kind: OpenKind::from_flags(flags)?,
            access: OpenAccess::from_flags(flags)?,
            delete_on_close: flags & ffi::SQLITE_OPEN_DELETEONCLOSE > 0,
            flags,
        })
    }
}

impl OpenKind {
    fn from_flags(flags: i32) -> Option<Self> {
        match flags {
            flags if flags & ffi::SQLITE_OPEN_MAIN_DB > 0 => Some(Self::MainDb),
            flags if flags & ffi::SQLITE_OPEN_MAIN_JOURNAL > 0 => Some(Self::MainJournal),
            flags if flags & ffi::SQLITE_OPEN_TEMP_DB > 0 => Some(Self::TempDb),
            flags if flags & ffi::SQLITE_OPEN_TEMP_JOURNAL > 0 => Some(Self::TempJournal),
            flags if flags & ffi::SQLITE_OPEN_TRANSIENT_DB > 0 => Some(Self::TransientDb),
            flags if flags & ffi::SQLITE_OPEN_SUBJOURNAL > 0 => Some(Self::SubJournal),
            flags if flags & ffi::SQLITE_OPEN_SUPER_JOURNAL > 0 => Some(Self::SuperJournal),
            flags if flags & ffi::SQLITE_OPEN_WAL > 0 => Some(Self::Wal),
            _ => None,
        }
    }
}

impl OpenAccess {
    fn from_flags(flags: i32) -> Option<Self> {
        match flags {
            flags
                if (flags & ffi::SQLITE_OPEN_CREATE > 0)
                    && (flags & ffi::SQLITE_OPEN_EXCLUSIVE > 0) =>
            {
                Some(Self::CreateNew)
            }
            flags if flags & ffi::SQLITE_OPEN_CREATE > 0 => Some(Self::Create),
            flags if flags & ffi::SQLITE_OPEN_READWRITE > 0 => Some(Self::Write),
            flags if flags & ffi::SQLITE_OPEN_READONLY > 0 => Some(Self::Read),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum RegisterError {
    Nul(std::ffi::NulError),
    Register(i32),
    Unregister(i32),
}

impl std::error::Error for RegisterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Nul(err) => Some(err),
            Self::Register(_) | Self::Unregister(_) => None,
        }
    }
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nul(_) => f.write_str("interior nul byte in name found"),
            Self::Register(code) => {
                write!(f, "registering sqlite vfs failed with error code: {}", code)
            }
            Self::Unregister(code) => {
                write!(
                    f,
                    "unregistering sqlite vfs failed with error code: {}",
                    code
                )
            }
        }
    }
}

impl From<std::ffi::NulError> for RegisterError {
    fn from(err: std::ffi::NulError) -> Self {
        Self::Nul(err)
    }
}

#[cfg(test)]
mod tests {
    use super::{LockLevel, OpenAccess, OpenKind, OpenOptions};
    use libsqlite3_sys as ffi;

    #[test]
    fn open_options_from_flags() {
        let flags = ffi::SQLITE_OPEN_MAIN_DB | ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        let opts = OpenOptions::from_flags(flags).unwrap();
        assert_eq!(opts.kind, OpenKind::MainDb);
        assert_eq!(opts.access, OpenAccess::Create);
        assert!(!opts.delete_on_close);
        assert_eq!(opts.flags, flags);

        let flags = ffi::SQLITE_OPEN_MAIN_JOURNAL
            | ffi::SQLITE_OPEN_READWRITE
            | ffi::SQLITE_OPEN_CREATE
            | ffi::SQLITE_OPEN_DELETEONCLOSE;
        let opts = OpenOptions::from_flags(flags).unwrap();
        assert_eq!(opts.kind, OpenKind::MainJournal);
        assert!(opts.delete_on_close);

        assert!(OpenOptions::from_flags(0).is_none());
    }

    #[test]
    fn lock_level_round_trip() {
        for raw in [
            ffi::SQLITE_LOCK_NONE,
            ffi::SQLITE_LOCK_SHARED,
            ffi::SQLITE_LOCK_RESERVED,
            ffi::SQLITE_LOCK_PENDING,
            ffi::SQLITE_LOCK_EXCLUSIVE,
        ] {
            let level = LockLevel::from_raw(raw).unwrap();
            assert_eq!(level.as_raw(), raw);
        }
        assert_eq!(LockLevel::from_raw(99), None);
    }
}
