use std::path::PathBuf;

use crate::error::{StoreError, StoreResult};
use crate::range::RangeFile;

/// The set of range files opened by one VFS instance, kept in insertion
/// order. Lookups are a linear scan; the working set is expected to stay
/// small because every opened range stays open until unregister.
pub struct RangeSet {
    dir: PathBuf,
    page_size: usize,
    ranges: Vec<RangeFile>,
}

impl RangeSet {
    pub fn new(dir: PathBuf, page_size: usize) -> Self {
        Self {
            dir,
            page_size,
            ranges: Vec::new(),
        }
    }

    /// Fetch the open range file for `number`, opening (and creating) it on
    /// first reference.
    pub fn get_or_open(&mut self, number: u32) -> StoreResult<&mut RangeFile> {
        if let Some(idx) = self.ranges.iter().position(|r| r.number() == number) {
            return Ok(&mut self.ranges[idx]);
        }

        let range = RangeFile::open(&self.dir, number, self.page_size)?;
        let idx = self.ranges.len();
        self.ranges.push(range);
        Ok(&mut self.ranges[idx])
    }

    /// Delete the backing file of range `number` and forget the entry.
    pub fn remove(&mut self, number: u32) -> StoreResult<()> {
        let idx = self
            .ranges
            .iter()
            .position(|r| r.number() == number)
            .ok_or(StoreError::UnknownRange(number))?;
        self.ranges.remove(idx).remove()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 4096;

    #[test]
    fn opens_on_first_reference_and_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let mut ranges = RangeSet::new(dir.path().to_path_buf(), PAGE_SIZE);
        assert!(ranges.is_empty());

        ranges.get_or_open(3).unwrap();
        ranges.get_or_open(1).unwrap();
        ranges.get_or_open(3).unwrap();
        assert_eq!(ranges.len(), 2);

        assert!(dir.path().join("0000000003").exists());
        assert!(dir.path().join("0000000001").exists());
    }

    #[test]
    fn remove_deletes_the_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut ranges = RangeSet::new(dir.path().to_path_buf(), PAGE_SIZE);

        ranges.get_or_open(2).unwrap();
        ranges.remove(2).unwrap();
        assert!(ranges.is_empty());
        assert!(!dir.path().join("0000000002").exists());

        assert!(matches!(
            ranges.remove(2),
            Err(StoreError::UnknownRange(2))
        ));
    }
}
