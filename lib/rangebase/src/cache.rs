use std::collections::HashMap;
use std::collections::VecDeque;

use crate::range::PageNumber;

/// Capacity-bounded cache of recently touched pages, consulted before the
/// range files on the read path. Only complete pages are cached; partial
/// header reads are served as a prefix of the cached page.
pub struct PageCache {
    capacity: usize,
    page_size: usize,
    pages: HashMap<PageNumber, Box<[u8]>>,
    lru: VecDeque<PageNumber>,
}

impl PageCache {
    pub fn new(capacity: usize, page_size: usize) -> Self {
        Self {
            capacity,
            page_size,
            pages: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    /// Copy the first `buf.len()` bytes of the cached page into `buf`,
    /// returning whether the page was cached.
    pub fn get(&mut self, page: PageNumber, buf: &mut [u8]) -> bool {
        debug_assert!(buf.len() <= self.page_size);

        match self.pages.get(&page) {
            Some(data) => {
                buf.copy_from_slice(&data[..buf.len()]);
                self.touch(page);
                true
            }
            None => false,
        }
    }

    /// Cache a full page, evicting the least recently used entry when over
    /// capacity. Anything but a complete page is ignored.
    pub fn put(&mut self, page: PageNumber, data: &[u8]) {
        if self.capacity == 0 || data.len() != self.page_size {
            return;
        }

        self.pages.insert(page, data.into());
        self.touch(page);

        while self.pages.len() > self.capacity {
            match self.lru.pop_back() {
                Some(evicted) => {
                    self.pages.remove(&evicted);
                }
                None => break,
            }
        }
    }

    /// Drop every cached page.
    pub fn flush(&mut self) {
        self.pages.clear();
        self.lru.clear();
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    fn touch(&mut self, page: PageNumber) {
        if let Some(pos) = self.lru.iter().position(|p| *p == page) {
            self.lru.remove(pos);
        }
        self.lru.push_front(page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_and_serves_prefix_reads() {
        let mut cache = PageCache::new(4, 4096);
        let mut page = vec![0u8; 4096];
        page[0] = 0xAB;
        page[100] = 0xCD;

        cache.put(1, &page);

        let mut full = vec![0u8; 4096];
        assert!(cache.get(1, &mut full));
        assert_eq!(full, page);

        // sqlite reads the 100 byte header of page 1
        let mut header = vec![0u8; 100];
        assert!(cache.get(1, &mut header));
        assert_eq!(header, page[..100]);

        assert!(!cache.get(2, &mut full));
    }

    #[test]
    fn ignores_partial_pages() {
        let mut cache = PageCache::new(4, 4096);
        cache.put(1, &[0u8; 100]);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = PageCache::new(2, 8);
        cache.put(1, &[1u8; 8]);
        cache.put(2, &[2u8; 8]);

        // touch page 1 so page 2 becomes the eviction candidate
        let mut buf = [0u8; 8];
        assert!(cache.get(1, &mut buf));

        cache.put(3, &[3u8; 8]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(1, &mut buf));
        assert!(!cache.get(2, &mut buf));
        assert!(cache.get(3, &mut buf));
    }

    #[test]
    fn flush_empties_the_cache() {
        let mut cache = PageCache::new(2, 8);
        cache.put(1, &[1u8; 8]);
        cache.flush();
        assert_eq!(cache.len(), 0);
    }
}
