use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::cache::PageCache;
use crate::error::{StoreError, StoreResult};
use crate::host::HostVfs;
use crate::meta::Meta;
use crate::range::{page_number, range_number};
use crate::ranges::RangeSet;

/// Smallest page size a VFS may be created with.
pub const MIN_PAGE_SIZE: usize = 512;

/// Number of pages held by the per-instance page cache.
const CACHED_PAGES: usize = 64;

/// Hook fired after every successful main-DB page write, with the write's
/// byte offset and page contents. The return value is ignored.
pub type WriteHook = Box<dyn FnMut(u64, &[u8]) -> i32 + Send>;

/// Hook fired with the file name whenever a main database is opened.
pub type OpenHook = Box<dyn FnMut(&str) + Send>;

struct VfsShared {
    ranges: RangeSet,
    meta: Meta,
    cache: PageCache,
    has_page_one: bool,
    write_hook: Option<WriteHook>,
    open_hook: Option<OpenHook>,
}

/// A named binding of a data directory and page size. Shared by every file
/// handle opened through the same registered VFS name; lives from register
/// until unregister.
pub struct VfsInstance {
    name: String,
    data_dir: PathBuf,
    page_size: usize,
    host: HostVfs,
    shared: Mutex<VfsShared>,
}

impl VfsInstance {
    pub(crate) fn create(name: &str, data_dir: PathBuf, page_size: usize) -> StoreResult<Self> {
        if name.is_empty() {
            return Err(StoreError::Config("vfs name must not be empty"));
        }
        if data_dir.as_os_str().is_empty() {
            return Err(StoreError::Config("data path must not be empty"));
        }
        if page_size < MIN_PAGE_SIZE {
            return Err(StoreError::Config("page size must be at least 512"));
        }

        let host = HostVfs::find_default()?;
        let meta = Meta::open(&data_dir, page_size)?;
        let ranges = RangeSet::new(data_dir.clone(), page_size);

        Ok(Self {
            name: name.to_owned(),
            data_dir,
            page_size,
            host,
            shared: Mutex::new(VfsShared {
                ranges,
                meta,
                cache: PageCache::new(CACHED_PAGES, page_size),
                has_page_one: false,
                write_hook: None,
                open_hook: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn host(&self) -> &HostVfs {
        &self.host
    }

    fn shared(&self) -> MutexGuard<'_, VfsShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the page containing byte `pos` into `buf`, starting from the
    /// page's first byte. Sparse, never-written space surfaces as
    /// [StoreError::ShortRead] with the buffer zero-filled.
    pub fn read_page(&self, pos: u64, buf: &mut [u8]) -> StoreResult<usize> {
        let page = page_number(pos, self.page_size);
        let mut shared = self.shared();

        if shared.cache.get(page, buf) {
            if page == 1 {
                shared.has_page_one = true;
            }
            return Ok(buf.len());
        }

        let range = shared.ranges.get_or_open(range_number(page))?;
        let n = range.read_at(buf, page)?;

        if buf.len() == self.page_size {
            shared.cache.put(page, buf);
        }
        if page == 1 && n > 0 {
            shared.has_page_one = true;
        }
        Ok(n)
    }

    /// Write one page at byte `pos`, growing the metadata page count when the
    /// write lands past the current high-water mark and firing the write hook
    /// before returning.
    pub fn write_page(&self, pos: u64, buf: &[u8]) -> StoreResult<()> {
        let page = page_number(pos, self.page_size);
        log::trace!("write page {} ({} bytes)", page, buf.len());

        let mut shared = self.shared();
        shared
            .ranges
            .get_or_open(range_number(page))?
            .write_at(page, buf)?;
        shared.cache.put(page, buf);

        if page == 1 {
            shared.has_page_one = true;
        }

        // one page per write, matching the engine's sequential append pattern
        if shared.meta.page_count() < page {
            shared.meta.add_page()?;
        }

        if let Some(hook) = shared.write_hook.as_mut() {
            // the hook's return value is ignored
            let _ = hook(pos, buf);
        }

        Ok(())
    }

    /// Shrink the logical database to `size` bytes by removing whole range
    /// files from the tail and truncating the first survivor. Growing is a
    /// no-op. The metadata page count keeps its pre-truncate value until a
    /// later write extends the database again.
    pub fn truncate_pages(&self, size: u64) -> StoreResult<()> {
        let mut shared = self.shared();

        let current = shared.meta.file_size();
        if size >= current {
            return Ok(());
        }
        log::debug!("truncate {} -> {} bytes", current, size);

        let mut remaining = current - size;
        let last = range_number(shared.meta.page_count());
        for number in (1..=last).rev() {
            if remaining == 0 {
                break;
            }
            let range_size = shared.ranges.get_or_open(number)?.size()?;
            if range_size <= remaining {
                shared.ranges.remove(number)?;
                remaining -= range_size;
            } else {
                shared
                    .ranges
                    .get_or_open(number)?
                    .truncate(range_size - remaining)?;
                break;
            }
        }

        shared.cache.flush();
        Ok(())
    }

    /// The logical size of the database as recorded by the metadata file,
    /// which is the ground truth across range files.
    pub fn database_size(&self) -> u64 {
        self.shared().meta.file_size()
    }

    pub fn page_count(&self) -> u64 {
        self.shared().meta.page_count()
    }

    /// Whether any read or write has touched page 1 since registration.
    pub fn has_page_one(&self) -> bool {
        self.shared().has_page_one
    }

    pub fn set_write_hook(&self, hook: WriteHook) {
        self.shared().write_hook = Some(hook);
    }

    pub fn set_open_hook(&self, hook: OpenHook) {
        self.shared().open_hook = Some(hook);
    }

    pub(crate) fn notify_open(&self, name: &str) {
        let mut shared = self.shared();
        if let Some(hook) = shared.open_hook.as_mut() {
            hook(name);
        }
    }
}
