// LRU page cache with pin-count-based eviction (spec §3.2, §4.1).
//
// Grounded on the teacher's `BufferFrame`/`FrameGuard` split (pin count +
// dirty flag + RAII unpin) but collapsed from its per-core, lock-free,
// multi-eviction-policy buffer pool into a single `Mutex`-guarded frame
// table with one eviction policy (true LRU via a monotonic access tick).
// A page this small (a handful of KB) and a workload this modest don't
// need lock sharding; the teacher's sharding existed for a buffer pool
// sized in the hundreds of thousands of frames.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::PageId;
use crate::error::{DbError, Result};
use crate::storage::disk::DiskManager;
use crate::storage::page::{Page, PageType};
use crate::wal::Wal;

struct Frame {
    page: Arc<RwLock<Page>>,
    pin_count: usize,
    tick: u64,
}

struct Inner {
    frames: HashMap<PageId, Frame>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    /// Head of the on-disk free list (spec §4.1), 0 ("null page") means
    /// empty. Seeded from the header page by `Database::open` and persisted
    /// back to it by `Database::close`; a bare `PageCache` over a file with
    /// no real header page (as several unit tests below construct) simply
    /// never has anything seeded here and behaves as if the list is empty.
    free_list_head: PageId,
}

/// Point-in-time counters surfaced by `Database::stats()` (SPEC_FULL.md §11).
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident_pages: usize,
}

pub struct PageCache {
    disk: Arc<DiskManager>,
    capacity: usize,
    inner: parking_lot::Mutex<Inner>,
    wal: Option<Arc<Wal>>,
}

impl PageCache {
    pub fn new(disk: Arc<DiskManager>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            disk,
            capacity,
            inner: parking_lot::Mutex::new(Inner {
                frames: HashMap::new(),
                next_tick: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                free_list_head: 0,
            }),
            wal: None,
        })
    }

    /// Attaches the WAL the cache must consult before flushing a dirty page
    /// to disk, enforcing spec §3.3 invariant 4 (write-ahead rule).
    pub fn with_wal(disk: Arc<DiskManager>, capacity: usize, wal: Arc<Wal>) -> Arc<Self> {
        Arc::new(Self {
            disk,
            capacity,
            inner: parking_lot::Mutex::new(Inner {
                frames: HashMap::new(),
                next_tick: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                free_list_head: 0,
            }),
            wal: Some(wal),
        })
    }

    /// Ensures `page`'s WAL record is durable before its bytes reach disk.
    fn ensure_write_ahead(&self, page: &Page) -> Result<()> {
        if let Some(wal) = &self.wal {
            if page.page_lsn() > wal.durable_lsn() {
                wal.fsync()?;
            }
        }
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.disk.page_size()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            resident_pages: inner.frames.len(),
        }
    }

    /// Mutates `page_id` via `f`, recording a before/after WAL image when
    /// `journal` is given (spec §3.3 invariant 4, §4.7 "apply to collection
    /// page(s) ... appends WAL record"). Used identically by the collection
    /// store and the B+tree so every page-mutating path gets the same
    /// write-ahead treatment.
    pub fn mutate<F>(self: &Arc<Self>, page_id: PageId, journal: Option<(&Wal, crate::common::TransactionId)>, f: F) -> Result<()>
    where
        F: FnOnce(&mut Page) -> Result<()>,
    {
        let guard = self.fetch(page_id)?;
        let before = journal.map(|_| guard.read().as_bytes().to_vec());
        f(&mut guard.write())?;
        if let Some((wal, txn_id)) = journal {
            let after = guard.read().as_bytes().to_vec();
            if before.as_ref() != Some(&after) {
                let lsn = wal.append_page_image(txn_id, page_id, before.unwrap(), after)?;
                guard.write().set_page_lsn(lsn);
            }
        }
        Ok(())
    }

    /// Pins and returns `page_id`, reading it from disk on a cache miss.
    pub fn fetch(self: &Arc<Self>, page_id: PageId) -> Result<PinGuard> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(&page_id) {
            frame.pin_count += 1;
            frame.tick = inner.next_tick;
            inner.next_tick += 1;
            inner.hits += 1;
            let page = frame.page.clone();
            drop(inner);
            return Ok(PinGuard { cache: self.clone(), page_id, page });
        }
        inner.misses += 1;
        drop(inner);

        let page = self.disk.read_page(page_id)?;
        self.insert_pinned(page_id, page)
    }

    /// Allocates a page: pops the free list head if non-empty, else extends
    /// the file (spec §4.1 `new_page`).
    pub fn new_page(self: &Arc<Self>, page_type: PageType) -> Result<PinGuard> {
        let page_id = match self.pop_free_list()? {
            Some(id) => id,
            None => self.disk.allocate_page()?,
        };
        let page = Page::new(page_id, self.disk.page_size(), page_type);
        self.insert_pinned(page_id, page)
    }

    /// Pops the free list head, if any, re-pointing the head at its
    /// `next_page_id` link.
    fn pop_free_list(self: &Arc<Self>) -> Result<Option<PageId>> {
        let head = self.inner.lock().free_list_head;
        if head == 0 {
            return Ok(None);
        }
        let next = self.fetch(head)?.read().next_page_id();
        self.inner.lock().free_list_head = next;
        Ok(Some(head))
    }

    /// Marks `page_id` free and pushes it onto the free list head (spec
    /// §4.1 `free(page_id)`).
    pub fn free_page(self: &Arc<Self>, page_id: PageId, journal: Option<(&Wal, crate::common::TransactionId)>) -> Result<()> {
        let prior_head = self.inner.lock().free_list_head;
        self.mutate(page_id, journal, |page| {
            page.set_page_type(PageType::Free);
            page.set_next_page_id(prior_head);
            Ok(())
        })?;
        self.inner.lock().free_list_head = page_id;
        Ok(())
    }

    /// Seeds the in-memory free list head from the database header page.
    /// Called once by `Database::open` on a reopen.
    pub fn set_free_list_head(&self, head: PageId) {
        self.inner.lock().free_list_head = head;
    }

    /// Current free list head, persisted back into the header page by
    /// `Database::close`.
    pub fn free_list_head(&self) -> PageId {
        self.inner.lock().free_list_head
    }

    fn insert_pinned(self: &Arc<Self>, page_id: PageId, page: Page) -> Result<PinGuard> {
        let mut inner = self.inner.lock();
        if inner.frames.len() >= self.capacity && !inner.frames.contains_key(&page_id) {
            self.evict_one(&mut inner)?;
        }
        let tick = inner.next_tick;
        inner.next_tick += 1;
        let page = Arc::new(RwLock::new(page));
        inner.frames.insert(
            page_id,
            Frame { page: page.clone(), pin_count: 1, tick },
        );
        drop(inner);
        Ok(PinGuard { cache: self.clone(), page_id, page })
    }

    fn evict_one(&self, inner: &mut Inner) -> Result<()> {
        let victim = inner
            .frames
            .iter()
            .filter(|(_, f)| f.pin_count == 0)
            .min_by_key(|(_, f)| f.tick)
            .map(|(id, _)| *id);

        let Some(victim_id) = victim else {
            return Err(DbError::InvalidArgument(
                "page cache exhausted: all resident pages are pinned".to_string(),
            ));
        };

        let frame = inner.frames.remove(&victim_id).expect("victim present");
        let dirty = frame.page.read().dirty;
        if dirty {
            self.ensure_write_ahead(&frame.page.read())?;
            self.disk.write_page(&frame.page.read())?;
        }
        inner.evictions += 1;
        Ok(())
    }

    fn unpin(&self, page_id: PageId) {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(&page_id) {
            frame.pin_count = frame.pin_count.saturating_sub(1);
        }
    }

    /// Writes `page_id` to disk if dirty, clearing the dirty flag. No-op if
    /// the page isn't resident.
    pub fn flush(&self, page_id: PageId) -> Result<()> {
        let inner = self.inner.lock();
        if let Some(frame) = inner.frames.get(&page_id) {
            let mut page = frame.page.write();
            if page.dirty {
                self.ensure_write_ahead(&page)?;
                self.disk.write_page(&page)?;
                page.dirty = false;
            }
        }
        Ok(())
    }

    /// Flushes every dirty resident page.
    pub fn flush_all(&self) -> Result<()> {
        let page_ids: Vec<PageId> = self.inner.lock().frames.keys().copied().collect();
        for id in page_ids {
            self.flush(id)?;
        }
        Ok(())
    }
}

/// RAII pin: the page is unpinned (made eligible for eviction) when this
/// guard drops.
pub struct PinGuard {
    cache: Arc<PageCache>,
    page_id: PageId,
    page: Arc<RwLock<Page>>,
}

impl PinGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, Page> {
        self.page.write()
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.cache.unpin(self.page_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> Arc<PageCache> {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskManager::open(dir.path().join("data.db"), 256).unwrap());
        PageCache::new(disk, capacity)
    }

    #[test]
    fn new_page_then_fetch_hits_cache() {
        let cache = self_test_cache();
        let guard = cache.new_page(PageType::CollectionData).unwrap();
        let id = guard.page_id();
        drop(guard);

        let stats_before = cache.stats();
        let _g = cache.fetch(id).unwrap();
        let stats_after = cache.stats();
        assert_eq!(stats_after.hits, stats_before.hits + 1);
    }

    fn self_test_cache() -> Arc<PageCache> {
        cache(4)
    }

    #[test]
    fn eviction_flushes_dirty_pages() {
        let cache = cache(1);
        let guard = cache.new_page(PageType::CollectionData).unwrap();
        let id = guard.page_id();
        guard.write().insert_slot(b"data").unwrap();
        drop(guard);

        // Forces eviction of `id` since capacity is 1.
        let guard2 = cache.new_page(PageType::CollectionData).unwrap();
        let id2 = guard2.page_id();
        drop(guard2);
        assert_ne!(id, id2);

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);

        let refetched = cache.fetch(id).unwrap();
        assert_eq!(refetched.read().get_slot(0), Some(&b"data"[..]));
    }

    #[test]
    fn new_page_reuses_freed_page_before_extending_file() {
        let cache = cache(4);
        let guard = cache.new_page(PageType::CollectionData).unwrap();
        let freed_id = guard.page_id();
        drop(guard);
        cache.free_page(freed_id, None).unwrap();
        assert_eq!(cache.free_list_head(), freed_id);

        let reused = cache.new_page(PageType::BTreeLeaf).unwrap();
        assert_eq!(reused.page_id(), freed_id);
        assert_eq!(reused.read().page_type().unwrap(), PageType::BTreeLeaf);
        assert_eq!(cache.free_list_head(), 0);
    }

    #[test]
    fn free_list_chains_multiple_freed_pages_lifo() {
        let cache = cache(8);
        let a = cache.new_page(PageType::CollectionData).unwrap().page_id();
        let b = cache.new_page(PageType::CollectionData).unwrap().page_id();
        cache.free_page(a, None).unwrap();
        cache.free_page(b, None).unwrap();

        let first_reused = cache.new_page(PageType::CollectionData).unwrap().page_id();
        let second_reused = cache.new_page(PageType::CollectionData).unwrap().page_id();
        assert_eq!(first_reused, b);
        assert_eq!(second_reused, a);
        assert_eq!(cache.free_list_head(), 0);
    }

    #[test]
    fn pinned_pages_are_not_evicted() {
        let cache = cache(1);
        let guard = cache.new_page(PageType::CollectionData).unwrap();
        let result = cache.new_page(PageType::CollectionData);
        assert!(result.is_err());
        drop(guard);
    }
}
