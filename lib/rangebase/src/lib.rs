//! A SQLite storage backend that spreads the main database file across a
//! directory of fixed-size range files.
//!
//! [register] binds a data directory and page size to a VFS name. Databases
//! opened through that name store their pages in numbered range files of
//! [RANGE_PAGES] pages each, with the logical database length persisted in a
//! `_METADATA` file. Journal and WAL files pass through untouched to the
//! host filesystem, so SQLite's locking and crash recovery keep working. A
//! [write hook](set_write_hook) exposes every committed page to a
//! replication consumer.

mod cache;
mod dispatch;
mod error;
mod host;
mod meta;
mod range;
mod ranges;
mod registry;
mod vfs;

pub use error::{StoreError, StoreResult};
pub use meta::META_FILE_NAME;
pub use range::{page_number, range_number, range_offset, PageNumber, RANGE_PAGES};
pub use registry::{lookup, register, set_open_hook, set_write_hook, unregister};
pub use vfs::{OpenHook, VfsInstance, WriteHook, MIN_PAGE_SIZE};
