use std::fs;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::StoreResult;

/// Name of the metadata file inside a data directory.
pub const META_FILE_NAME: &str = "_METADATA";

/// The `_METADATA` file records the logical page count of the database as a
/// little-endian u64 at offset 0, so a SQLite file size can be derived even
/// though the database is spread over many range files.
pub struct Meta {
    file: fs::File,
    path: PathBuf,
    page_size: usize,
    page_count: u64,
}

impl Meta {
    /// Open (creating if necessary) the metadata file inside `dir`. A missing
    /// data directory is created and the open retried. A file shorter than 8
    /// bytes reads as a page count of 0.
    pub fn open(dir: &Path, page_size: usize) -> StoreResult<Self> {
        let path = dir.join(META_FILE_NAME);
        let file = match open_meta_file(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(dir)?;
                open_meta_file(&path)?
            }
            Err(err) => return Err(err.into()),
        };

        let mut meta = Self {
            file,
            path,
            page_size,
            page_count: 0,
        };
        meta.load()?;

        log::debug!(
            "opened metadata {} (page_count={})",
            meta.path.display(),
            meta.page_count
        );

        Ok(meta)
    }

    fn load(&mut self) -> StoreResult<()> {
        self.file.seek(SeekFrom::Start(0))?;

        let mut buf = [0u8; 8];
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        self.page_count = if filled == buf.len() {
            u64::from_le_bytes(buf)
        } else {
            0
        };
        Ok(())
    }

    fn persist(&mut self) -> StoreResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.page_count.to_le_bytes())?;
        Ok(())
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Grow the logical database by one page and persist the new count. A
    /// failed persist rolls the increment back.
    pub fn add_page(&mut self) -> StoreResult<()> {
        self.page_count += 1;
        if let Err(err) = self.persist() {
            self.page_count -= 1;
            return Err(err);
        }
        Ok(())
    }

    /// Overwrite the page count and persist it.
    pub fn set_page_count(&mut self, page_count: u64) -> StoreResult<()> {
        self.page_count = page_count;
        self.persist()
    }

    /// The logical size of the database in bytes.
    pub fn file_size(&self) -> u64 {
        self.page_count * self.page_size as u64
    }
}

fn open_meta_file(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_metadata_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Meta::open(dir.path(), 4096).unwrap();
        assert_eq!(meta.page_count(), 0);
        assert_eq!(meta.file_size(), 0);
        assert!(dir.path().join(META_FILE_NAME).exists());
    }

    #[test]
    fn add_page_persists_little_endian() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = Meta::open(dir.path(), 4096).unwrap();
        meta.add_page().unwrap();
        meta.add_page().unwrap();
        meta.add_page().unwrap();

        assert_eq!(meta.page_count(), 3);
        assert_eq!(meta.file_size(), 3 * 4096);

        let raw = std::fs::read(dir.path().join(META_FILE_NAME)).unwrap();
        assert_eq!(raw, 3u64.to_le_bytes());
    }

    #[test]
    fn page_count_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut meta = Meta::open(dir.path(), 512).unwrap();
            meta.set_page_count(41).unwrap();
        }
        let meta = Meta::open(dir.path(), 512).unwrap();
        assert_eq!(meta.page_count(), 41);
        assert_eq!(meta.file_size(), 41 * 512);
    }

    #[test]
    fn creates_missing_data_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("store");
        let meta = Meta::open(&nested, 4096).unwrap();
        assert_eq!(meta.page_count(), 0);
        assert!(nested.join(META_FILE_NAME).exists());
    }
}
