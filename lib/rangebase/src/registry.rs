use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::dispatch::RangeVfs;
use crate::error::{StoreError, StoreResult};
use crate::vfs::VfsInstance;

struct Registered {
    instance: Arc<VfsInstance>,
    registration: vfs_bridge::Registration,
}

/// Process-wide table of live VFS instances, looked up by name on every
/// main-DB file operation.
static REGISTRY: Mutex<Vec<Registered>> = Mutex::new(Vec::new());

fn registry() -> MutexGuard<'static, Vec<Registered>> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a VFS instance over `data_dir` and register it with SQLite under
/// `name`. The database opened through this VFS is stored as range files
/// plus a `_METADATA` file inside `data_dir`; journals stay at their
/// original paths.
///
/// `page_size` must be at least 512 and match the SQLite page size of the
/// databases opened through this VFS.
pub fn register(name: &str, data_dir: impl AsRef<Path>, page_size: usize) -> StoreResult<()> {
    let data_dir = data_dir.as_ref();
    let instance = Arc::new(VfsInstance::create(
        name,
        data_dir.to_path_buf(),
        page_size,
    )?);

    let mut entries = registry();
    let registration = vfs_bridge::register(name, RangeVfs::new(Arc::clone(&instance)))?;
    entries.push(Registered {
        instance,
        registration,
    });

    log::info!(
        "registered vfs {:?} over {} (page_size={})",
        name,
        data_dir.display(),
        page_size
    );
    Ok(())
}

/// Unregister `name` from SQLite and drop its instance, closing every open
/// range file and the metadata handle. Range files themselves stay on disk.
///
/// Connections opened through the VFS must be closed first.
pub fn unregister(name: &str) -> StoreResult<()> {
    let mut entries = registry();
    let idx = entries
        .iter()
        .position(|entry| entry.instance.name() == name)
        .ok_or_else(|| StoreError::UnknownVfs(name.to_owned()))?;

    let entry = entries.remove(idx);
    entry.registration.unregister()?;

    log::info!("unregistered vfs {:?}", name);
    Ok(())
}

/// Find the live VFS instance registered under `name`.
pub fn lookup(name: &str) -> Option<Arc<VfsInstance>> {
    registry()
        .iter()
        .find(|entry| entry.instance.name() == name)
        .map(|entry| Arc::clone(&entry.instance))
}

/// Install a replication write hook on the VFS registered under `name`. The
/// hook fires synchronously after every successful main-DB page write with
/// the write's byte offset and page contents; its return value is ignored.
pub fn set_write_hook(
    name: &str,
    hook: impl FnMut(u64, &[u8]) -> i32 + Send + 'static,
) -> StoreResult<()> {
    let instance = lookup(name).ok_or_else(|| StoreError::UnknownVfs(name.to_owned()))?;
    instance.set_write_hook(Box::new(hook));
    Ok(())
}

/// Install a hook fired with the file name on every main-DB open through the
/// VFS registered under `name`.
pub fn set_open_hook(name: &str, hook: impl FnMut(&str) + Send + 'static) -> StoreResult<()> {
    let instance = lookup(name).ok_or_else(|| StoreError::UnknownVfs(name.to_owned()))?;
    instance.set_open_hook(Box::new(hook));
    Ok(())
}
