// Collections: named chains of document data pages (spec §4.5).
//
// Grounded on the teacher's `document_store::collections` (Oracle
// SODA-like collection management) for the overall shape — a named store
// with a declarative index set and a pluggable id-generation policy — but
// document placement now goes through the slotted `Page`/`PageCache`
// rather than an in-memory `Vec<Document>`.

pub mod index_manager;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::buffer::page_cache::PageCache;
use crate::common::{PageId, TransactionId};
use crate::crypto::PagePayloadCipher;
use crate::error::{DbError, Result};
use crate::index::{IndexKey, Journal};
use crate::storage::page::PageType;
use crate::value::{decode_document, encode_document, Document, ObjectId, Value};
use crate::wal::Wal;

pub use index_manager::{IndexDescriptor, IndexManager, ID_INDEX_NAME};

/// `_id` generation policy, declared per collection (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdPolicy {
    ObjectId,
    Int64Identity,
    Guid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyDescriptor {
    pub field: String,
    pub target_collection: String,
}

/// Persisted catalog record for one collection (spec §4.5, §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub name: String,
    pub head_page: PageId,
    pub active_page: PageId,
    pub id_policy: IdPolicy,
    pub next_int_id: u64,
    pub indexes: Vec<IndexDescriptor>,
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
}

pub struct Collection {
    cache: Arc<PageCache>,
    name: String,
    head_page: PageId,
    active_page: Mutex<PageId>,
    id_policy: IdPolicy,
    next_int_id: Mutex<u64>,
    index_manager: IndexManager,
    foreign_keys: RwLock<Vec<ForeignKeyDescriptor>>,
    cipher: Option<Arc<PagePayloadCipher>>,
}

impl Collection {
    /// Allocates a brand-new, empty collection.
    pub fn create(cache: Arc<PageCache>, name: impl Into<String>, id_policy: IdPolicy) -> Result<Self> {
        let guard = cache.new_page(PageType::CollectionData)?;
        let head_page = guard.page_id();
        drop(guard);
        let index_manager = IndexManager::bootstrap(cache.clone())?;
        Ok(Self {
            cache,
            name: name.into(),
            head_page,
            active_page: Mutex::new(head_page),
            id_policy,
            next_int_id: Mutex::new(1),
            index_manager,
            foreign_keys: RwLock::new(Vec::new()),
            cipher: None,
        })
    }

    /// Reopens a collection from its persisted descriptor.
    pub fn open(cache: Arc<PageCache>, descriptor: &CollectionDescriptor) -> Self {
        let index_manager = IndexManager::open(cache.clone(), &descriptor.indexes);
        Self {
            cache,
            name: descriptor.name.clone(),
            head_page: descriptor.head_page,
            active_page: Mutex::new(descriptor.active_page),
            id_policy: descriptor.id_policy,
            next_int_id: Mutex::new(descriptor.next_int_id),
            index_manager,
            foreign_keys: RwLock::new(descriptor.foreign_keys.clone()),
            cipher: None,
        }
    }

    /// Enables authenticated encryption of this collection's document
    /// payloads (spec §6.3 `password` option). A no-op on the read/decode
    /// path unless called before any reads occur against this handle.
    pub fn with_cipher(mut self, cipher: Arc<PagePayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    fn encode_doc(&self, doc: &Document) -> Result<Vec<u8>> {
        let bytes = encode_document(doc)?;
        Ok(match &self.cipher {
            Some(cipher) => cipher.encrypt(self.name.as_bytes(), &bytes),
            None => bytes,
        })
    }

    fn decode_doc(&self, bytes: &[u8]) -> Result<Document> {
        match &self.cipher {
            Some(cipher) => {
                let raw = cipher.decrypt(self.name.as_bytes(), bytes)?;
                decode_document(&raw)
            }
            None => decode_document(bytes),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index_manager(&self) -> &IndexManager {
        &self.index_manager
    }

    pub fn foreign_keys(&self) -> Vec<ForeignKeyDescriptor> {
        self.foreign_keys.read().clone()
    }

    pub fn declare_foreign_key(&self, fk: ForeignKeyDescriptor) {
        self.foreign_keys.write().push(fk);
    }

    /// A serializable snapshot suitable for persisting into the catalog.
    pub fn descriptor(&self) -> CollectionDescriptor {
        CollectionDescriptor {
            name: self.name.clone(),
            head_page: self.head_page,
            active_page: *self.active_page.lock(),
            id_policy: self.id_policy,
            next_int_id: *self.next_int_id.lock(),
            indexes: self.index_manager.descriptors(),
            foreign_keys: self.foreign_keys.read().clone(),
        }
    }

    fn generate_id(&self) -> Value {
        match self.id_policy {
            IdPolicy::ObjectId => Value::ObjectId(ObjectId::new()),
            IdPolicy::Int64Identity => {
                let mut next = self.next_int_id.lock();
                let id = *next;
                *next += 1;
                Value::I64(id as i64)
            }
            IdPolicy::Guid => Value::String(Uuid::new_v4().to_string()),
        }
    }

    fn place(&self, bytes: &[u8], journal: Journal<'_>) -> Result<(PageId, u16)> {
        let mut active = self.active_page.lock();
        let fits = {
            let guard = self.cache.fetch(*active)?;
            guard.read().free_space_after_compaction() >= bytes.len() + 4
        };

        if fits {
            let mut result = None;
            self.cache.mutate(*active, journal, |page| {
                result = Some(page.insert_slot(bytes)?);
                Ok(())
            })?;
            return Ok((*active, result.unwrap()));
        }

        let new_guard = self.cache.new_page(PageType::CollectionData)?;
        let new_id = new_guard.page_id();
        drop(new_guard);
        self.cache.mutate(*active, journal, |page| {
            page.set_next_page_id(new_id);
            Ok(())
        })?;
        self.cache.mutate(new_id, journal, |page| {
            page.set_prev_page_id(*active);
            Ok(())
        })?;
        *active = new_id;
        let mut result = None;
        self.cache.mutate(new_id, journal, |page| {
            result = Some(page.insert_slot(bytes)?);
            Ok(())
        })?;
        Ok((new_id, result.unwrap()))
    }

    /// Assigns an `_id` per this collection's `IdPolicy` if `doc` doesn't
    /// already carry one, and returns it. Split out of `insert` so a
    /// buffered transaction can assign `_id` at record time (spec §4.7)
    /// without touching shared page state.
    pub fn assign_id_if_missing(&self, doc: &mut Document) -> Value {
        if doc.get_id().is_none() {
            let id = self.generate_id();
            doc.insert("_id", id);
        }
        doc.get_id().cloned().unwrap()
    }

    pub fn insert(&self, mut doc: Document, journal: Journal<'_>) -> Result<Value> {
        let id = self.assign_id_if_missing(&mut doc);
        let bytes = self.encode_doc(&doc)?;
        let location = self.place(&bytes, journal)?;
        if let Err(e) = self.index_manager.on_insert(&doc, &id, location, journal) {
            let _ = self.cache.mutate(location.0, journal, |page| page.delete_slot(location.1));
            return Err(e);
        }
        Ok(id)
    }

    pub fn find_by_id(&self, id: &Value) -> Result<Option<Document>> {
        let Some((page_id, slot)) = self.index_manager.location_of(id)? else {
            return Ok(None);
        };
        let guard = self.cache.fetch(page_id)?;
        let bytes = guard
            .read()
            .get_slot(slot)
            .ok_or_else(|| DbError::Corruption(format!("collection {} missing slot {slot} on page {page_id}", self.name)))?
            .to_vec();
        Ok(Some(self.decode_doc(&bytes)?))
    }

    pub fn update(&self, id: &Value, mut new_doc: Document, journal: Journal<'_>) -> Result<()> {
        let old_location = self
            .index_manager
            .location_of(id)?
            .ok_or_else(|| DbError::NotFound(format!("document {id:?}")))?;
        let guard = self.cache.fetch(old_location.0)?;
        let old_bytes = guard
            .read()
            .get_slot(old_location.1)
            .ok_or_else(|| DbError::Corruption("stale index entry".to_string()))?
            .to_vec();
        drop(guard);
        let old_doc = self.decode_doc(&old_bytes)?;

        if let Some(new_id) = new_doc.get_id() {
            if new_id != id {
                return Err(DbError::InvalidArgument("_id is immutable".to_string()));
            }
        } else {
            new_doc.insert("_id", id.clone());
        }

        let new_bytes = self.encode_doc(&new_doc)?;
        let mut new_location = old_location;
        let mut updated_in_place = false;
        self.cache.mutate(old_location.0, journal, |page| {
            if page.get_slot(old_location.1).map(|s| s.len() >= new_bytes.len()).unwrap_or(false) {
                page.update_slot(old_location.1, &new_bytes)?;
                updated_in_place = true;
            }
            Ok(())
        })?;
        if !updated_in_place {
            self.cache.mutate(old_location.0, journal, |page| page.delete_slot(old_location.1))?;
            new_location = self.place(&new_bytes, journal)?;
        }

        self.index_manager
            .on_update(&old_doc, &new_doc, id, old_location, new_location, journal)
    }

    pub fn delete(&self, id: &Value, journal: Journal<'_>) -> Result<Document> {
        let location = self
            .index_manager
            .location_of(id)?
            .ok_or_else(|| DbError::NotFound(format!("document {id:?}")))?;
        let guard = self.cache.fetch(location.0)?;
        let bytes = guard
            .read()
            .get_slot(location.1)
            .ok_or_else(|| DbError::Corruption("stale index entry".to_string()))?
            .to_vec();
        drop(guard);
        let doc = self.decode_doc(&bytes)?;
        self.cache.mutate(location.0, journal, |page| page.delete_slot(location.1))?;
        self.index_manager.on_delete(&doc, id, location, journal)?;
        Ok(doc)
    }

    /// Full collection scan, in data-page chain order.
    pub fn scan_all(&self) -> Result<Vec<Document>> {
        Ok(self.scan_with_ids()?.into_iter().map(|(doc, _)| doc).collect())
    }

    pub fn scan_with_ids(&self) -> Result<Vec<(Document, Value)>> {
        let mut out = Vec::new();
        let mut page_id = self.head_page;
        loop {
            let guard = self.cache.fetch(page_id)?;
            let next = guard.read().next_page_id();
            for (_, bytes) in guard.read().iter_slots() {
                let doc = self.decode_doc(bytes)?;
                let id = doc.get_id().cloned().ok_or_else(|| DbError::Corruption("document missing _id".to_string()))?;
                out.push((doc, id));
            }
            drop(guard);
            if next == 0 {
                break;
            }
            page_id = next;
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.scan_all()?.len())
    }

    pub fn ensure_index(&self, name: impl Into<String>, fields: Vec<String>, unique: bool, sparse: bool, journal: Journal<'_>) -> Result<()> {
        let entries = self.scan_with_ids()?;
        self.index_manager.create_index(name.into(), fields, unique, sparse, entries, journal)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.index_manager.drop_index(name)
    }

    pub fn all_indexes(&self) -> Vec<String> {
        self.index_manager.all_indexes()
    }

    pub fn find_by_index(&self, index_name: &str, key: &IndexKey) -> Result<Vec<Document>> {
        let ids = self.index_manager.lookup(index_name, key)?;
        ids.iter().filter_map(|id| self.find_by_id(id).transpose()).collect()
    }

    pub fn range_by_index(
        &self,
        index_name: &str,
        lo: Option<&IndexKey>,
        hi: Option<&IndexKey>,
        incl_lo: bool,
        incl_hi: bool,
    ) -> Result<Vec<Document>> {
        let entries = self.index_manager.range(index_name, lo, hi, incl_lo, incl_hi)?;
        let ids: Vec<Value> = if index_name == ID_INDEX_NAME {
            entries.into_iter().map(|(k, _)| k.0[0].clone()).collect()
        } else {
            entries.into_iter().map(|(_, v)| v).collect()
        };
        ids.iter().filter_map(|id| self.find_by_id(id).transpose()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::DiskManager;
    use tempfile::tempdir;

    fn collection() -> Collection {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::open(dir.path().join("coll.db"), 4096).unwrap());
        let cache = PageCache::new(disk, 64);
        Collection::create(cache, "users", IdPolicy::Int64Identity).unwrap()
    }

    fn doc(name: &str, age: i64) -> Document {
        let mut d = Document::new();
        d.insert("name", Value::String(name.to_string()));
        d.insert("age", Value::I64(age));
        d
    }

    #[test]
    fn insert_then_find_round_trips() {
        let coll = collection();
        let id = coll.insert(doc("alice", 30), None).unwrap();
        let found = coll.find_by_id(&id).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&Value::String("alice".to_string())));
        assert_eq!(coll.count().unwrap(), 1);
    }

    #[test]
    fn unique_secondary_index_rejects_duplicate() {
        let coll = collection();
        coll.ensure_index("email_idx", vec!["email".to_string()], true, false, None).unwrap();
        let mut a = Document::new();
        a.insert("email", Value::String("x@y".to_string()));
        coll.insert(a, None).unwrap();

        let mut b = Document::new();
        b.insert("email", Value::String("x@y".to_string()));
        let err = coll.insert(b, None).unwrap_err();
        assert!(matches!(err, DbError::UniqueConstraint { .. }));
        assert_eq!(coll.count().unwrap(), 1);
    }

    #[test]
    fn update_changes_document_in_place() {
        let coll = collection();
        let id = coll.insert(doc("bob", 20), None).unwrap();
        coll.update(&id, doc("bob", 21), None).unwrap();
        let found = coll.find_by_id(&id).unwrap().unwrap();
        assert_eq!(found.get("age"), Some(&Value::I64(21)));
    }

    #[test]
    fn delete_removes_document_and_index_entry() {
        let coll = collection();
        let id = coll.insert(doc("carl", 40), None).unwrap();
        coll.delete(&id, None).unwrap();
        assert_eq!(coll.find_by_id(&id).unwrap(), None);
        assert_eq!(coll.count().unwrap(), 0);
    }

    #[test]
    fn many_inserts_span_multiple_pages() {
        let coll = collection();
        for i in 0..500 {
            coll.insert(doc(&format!("user{i}"), i), None).unwrap();
        }
        assert_eq!(coll.count().unwrap(), 500);
    }
}
