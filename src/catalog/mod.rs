// Catalog: the reserved collection of collections (spec §4.5).
//
// "The catalog is itself a reserved collection holding one document per
// user collection describing its data-page chain head, declared indexes,
// and declared foreign-key constraints." Rather than bootstrapping through
// `Collection` itself (which would need a catalog to exist first), the
// catalog is a small standalone chain of `Catalog`-typed pages always
// rooted at a fixed page id, carrying one JSON blob (a `Vec<CollectionDescriptor>`)
// chunked across as many pages as it needs — grounded on the same
// chain-of-pages idea `collection::Collection` uses for documents, applied
// to a single serialized blob instead of many independent slots since the
// catalog is expected to stay small.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::buffer::page_cache::PageCache;
use crate::collection::CollectionDescriptor;
use crate::common::{PageId, TransactionId};
use crate::error::{DbError, Result};
use crate::storage::page::PageType;
use crate::wal::Wal;

/// The catalog always lives at this fixed page id; page 0 is the header.
pub const CATALOG_ROOT_PAGE: PageId = 1;

pub struct Catalog {
    cache: Arc<PageCache>,
    descriptors: RwLock<Vec<CollectionDescriptor>>,
}

impl Catalog {
    /// Allocates the catalog's first page (must be called immediately after
    /// the header page on a brand-new database, so it lands on
    /// `CATALOG_ROOT_PAGE`).
    pub fn bootstrap(cache: Arc<PageCache>) -> Result<Self> {
        let guard = cache.new_page(PageType::Catalog)?;
        let page_id = guard.page_id();
        drop(guard);
        if page_id != CATALOG_ROOT_PAGE {
            return Err(DbError::Corruption(format!(
                "catalog bootstrap expected page {CATALOG_ROOT_PAGE}, got {page_id}"
            )));
        }
        let catalog = Self { cache, descriptors: RwLock::new(Vec::new()) };
        catalog.persist(None)?;
        Ok(catalog)
    }

    pub fn open(cache: Arc<PageCache>) -> Result<Self> {
        let bytes = Self::read_chain(&cache)?;
        let descriptors = if bytes.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok(Self { cache, descriptors: RwLock::new(descriptors) })
    }

    fn read_chain(cache: &Arc<PageCache>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut page_id = CATALOG_ROOT_PAGE;
        loop {
            let guard = cache.fetch(page_id)?;
            let page = guard.read();
            if let Some(chunk) = page.get_slot(0) {
                out.extend_from_slice(chunk);
            }
            let next = page.next_page_id();
            drop(page);
            drop(guard);
            if next == 0 {
                break;
            }
            page_id = next;
        }
        Ok(out)
    }

    fn persist(&self, journal: Option<(&Wal, TransactionId)>) -> Result<()> {
        let bytes = serde_json::to_vec(&*self.descriptors.read())?;
        let page_size = self.cache.page_size();
        let chunk_size = page_size.saturating_sub(64).max(64);
        let chunks: Vec<&[u8]> = if bytes.is_empty() { vec![&[][..]] } else { bytes.chunks(chunk_size).collect() };

        // Walk (or extend) the existing chain, writing one chunk per page.
        let mut page_id = CATALOG_ROOT_PAGE;
        let mut chain = Vec::new();
        loop {
            chain.push(page_id);
            let next = self.cache.fetch(page_id)?.read().next_page_id();
            if next == 0 {
                break;
            }
            page_id = next;
        }

        for (i, chunk) in chunks.iter().enumerate() {
            if i >= chain.len() {
                let guard = self.cache.new_page(PageType::Catalog)?;
                let new_id = guard.page_id();
                drop(guard);
                let prev = *chain.last().unwrap();
                self.cache.mutate(prev, journal, |page| {
                    page.set_next_page_id(new_id);
                    Ok(())
                })?;
                chain.push(new_id);
            }
            let target = chain[i];
            self.cache.mutate(target, journal, |page| {
                if page.slot_count() == 0 {
                    page.insert_slot(chunk)?;
                } else {
                    page.update_slot(0, chunk)?;
                }
                Ok(())
            })?;
        }
        // Truncate any leftover pages from a previous, larger catalog.
        for &stale in &chain[chunks.len()..] {
            self.cache.free_page(stale, journal)?;
        }
        if chunks.len() < chain.len() {
            let last_live = chain[chunks.len() - 1];
            self.cache.mutate(last_live, journal, |page| {
                page.set_next_page_id(0);
                Ok(())
            })?;
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<CollectionDescriptor> {
        self.descriptors.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<CollectionDescriptor> {
        self.descriptors.read().iter().find(|d| d.name == name).cloned()
    }

    pub fn register(&self, descriptor: CollectionDescriptor, journal: Option<(&Wal, TransactionId)>) -> Result<()> {
        {
            let mut descriptors = self.descriptors.write();
            if descriptors.iter().any(|d| d.name == descriptor.name) {
                return Err(DbError::InvalidArgument(format!("collection {} already exists", descriptor.name)));
            }
            descriptors.push(descriptor);
        }
        self.persist(journal)
    }

    /// Replaces a collection's descriptor (e.g. after an index is added or
    /// its active page/id counter changed).
    pub fn update(&self, descriptor: CollectionDescriptor, journal: Option<(&Wal, TransactionId)>) -> Result<()> {
        {
            let mut descriptors = self.descriptors.write();
            let slot = descriptors
                .iter_mut()
                .find(|d| d.name == descriptor.name)
                .ok_or_else(|| DbError::NotFound(format!("collection {}", descriptor.name)))?;
            *slot = descriptor;
        }
        self.persist(journal)
    }

    pub fn remove(&self, name: &str, journal: Option<(&Wal, TransactionId)>) -> Result<()> {
        {
            let mut descriptors = self.descriptors.write();
            let before = descriptors.len();
            descriptors.retain(|d| d.name != name);
            if descriptors.len() == before {
                return Err(DbError::NotFound(format!("collection {name}")));
            }
        }
        self.persist(journal)
    }

    pub fn list_names(&self) -> Vec<String> {
        self.descriptors.read().iter().map(|d| d.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{IdPolicy};
    use crate::storage::disk::DiskManager;
    use tempfile::tempdir;

    fn fresh_catalog() -> Catalog {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::open(dir.path().join("cat.db"), 256).unwrap());
        let cache = PageCache::new(disk, 64);
        // Page 0 is conventionally the header; allocate it first so the
        // catalog bootstrap lands on page 1.
        let _header = cache.new_page(PageType::Header).unwrap();
        Catalog::bootstrap(cache).unwrap()
    }

    fn descriptor(name: &str) -> CollectionDescriptor {
        CollectionDescriptor {
            name: name.to_string(),
            head_page: 2,
            active_page: 2,
            id_policy: IdPolicy::ObjectId,
            next_int_id: 1,
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    #[test]
    fn register_then_reopen_round_trips() {
        let catalog = fresh_catalog();
        catalog.register(descriptor("users"), None).unwrap();
        catalog.register(descriptor("orders"), None).unwrap();
        assert_eq!(catalog.list_names(), vec!["users".to_string(), "orders".to_string()]);

        let reopened = Catalog::open(catalog_cache(&catalog)).unwrap();
        assert_eq!(reopened.list_names(), vec!["users".to_string(), "orders".to_string()]);
    }

    #[test]
    fn register_duplicate_name_fails() {
        let catalog = fresh_catalog();
        catalog.register(descriptor("users"), None).unwrap();
        assert!(catalog.register(descriptor("users"), None).is_err());
    }

    #[test]
    fn remove_then_reopen_reflects_removal() {
        let catalog = fresh_catalog();
        catalog.register(descriptor("users"), None).unwrap();
        catalog.remove("users", None).unwrap();
        let reopened = Catalog::open(catalog_cache(&catalog)).unwrap();
        assert!(reopened.list_names().is_empty());
    }

    fn catalog_cache(catalog: &Catalog) -> Arc<PageCache> {
        catalog.cache.clone()
    }
}
