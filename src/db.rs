// Top-level engine facade (spec §2 data flow, §3.4 database lifecycle).
//
// Grounded on the teacher's `Database`/`Engine` split: a small public
// handle wrapping an `Arc`-shared inner state, so the handle is cheap to
// clone and every subsystem (collections, WAL, lock manager, transaction
// manager) is reached through one owner. `DbInner` is what
// `transaction::Transaction` holds onto in order to apply buffered ops at
// commit time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::buffer::page_cache::{CacheStats, PageCache};
use crate::catalog::Catalog;
use crate::collection::{Collection, CollectionDescriptor, ForeignKeyDescriptor, IdPolicy};
use crate::common::TransactionId;
use crate::config::{Config, WriteConcern};
use crate::crypto::PagePayloadCipher;
use crate::error::{DbError, Result};
use crate::flush::FlushScheduler;
use crate::index::IndexKey;
use crate::storage::disk::DiskManager;
use crate::storage::header::Header;
use crate::storage::page::PageType;
use crate::transaction::lock_manager::{LockKey, LockManager, LockMode};
use crate::transaction::manager::TransactionManager;
use crate::transaction::Transaction;
use crate::value::{Document, Value};
use crate::wal::{recover, Wal};

/// Everything a `Transaction` needs to apply its buffered ops at commit.
/// Owned by `Arc` so both `Database` and every open `Transaction` can see
/// the same live state.
pub struct DbInner {
    pub(crate) path: PathBuf,
    pub(crate) config: Config,
    pub(crate) disk: Arc<DiskManager>,
    pub(crate) cache: Arc<PageCache>,
    pub(crate) wal: Option<Arc<Wal>>,
    pub(crate) catalog: Catalog,
    pub(crate) collections: RwLock<HashMap<String, Arc<Collection>>>,
    pub(crate) lock_manager: Arc<LockManager>,
    pub(crate) txn_manager: TransactionManager,
    pub(crate) cipher: Option<Arc<PagePayloadCipher>>,
    pub(crate) degraded: AtomicBool,
    pub(crate) closed: AtomicBool,
    flush_scheduler: Mutex<Option<FlushScheduler>>,
}

impl DbInner {
    pub(crate) fn check_open_for_write(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::Closed);
        }
        if self.config.read_only {
            return Err(DbError::ReadOnly);
        }
        if self.degraded.load(Ordering::SeqCst) {
            return Err(DbError::Io(std::io::Error::other("database is in degraded mode after a background flush failure")));
        }
        Ok(())
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    pub(crate) fn collection_handle(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("collection {name}")))
    }

    pub(crate) fn foreign_keys_of(&self, name: &str) -> Vec<ForeignKeyDescriptor> {
        self.collections.read().get(name).map(|c| c.foreign_keys()).unwrap_or_default()
    }

    /// Persists a touched collection's latest descriptor (id counters,
    /// index roots) into the catalog so a reopen sees consistent state.
    pub(crate) fn persist_collection(&self, name: &str, journal: Option<(&Wal, TransactionId)>) -> Result<()> {
        let coll = self.collection_handle(name)?;
        self.catalog.update(coll.descriptor(), journal)
    }
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

fn derive_salt(header: &Header) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(header.created_at_ms.to_le_bytes());
    hasher.update(header.database_name.as_bytes());
    hasher.finalize().to_vec()
}

/// Point-in-time engine statistics (SPEC_FULL.md §11 `Database::stats()`).
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub cache: CacheStats,
    pub active_transactions: usize,
    pub collection_count: usize,
    pub degraded: bool,
}

/// Handle to an open database file. Cheap to clone-by-reference via the
/// methods that return `Transaction`s, each of which holds its own `Arc`
/// into the same `DbInner`.
pub struct Database(Arc<DbInner>);

impl Database {
    /// Opens (creating if absent) the database file at `path` (spec §3.4
    /// "opened: validates header, replays WAL if needed, initializes page
    /// cache and schedulers").
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let disk = Arc::new(DiskManager::open(&path, config.page_size as usize)?);
        let brand_new = disk.page_count()? == 0;

        let header = if brand_new {
            let header = Header::new(config.page_size, config.database_name.clone(), now_millis());
            let page0 = disk.allocate_page()?;
            if page0 != 0 {
                return Err(DbError::Corruption(format!("expected header at page 0, allocated {page0}")));
            }
            disk.write_raw_page(0, &header.encode(config.page_size as usize))?;
            header
        } else {
            let raw = disk.read_raw_page(0)?;
            let header = Header::decode(&raw)?;
            if header.page_size != config.page_size {
                return Err(DbError::Corruption(format!(
                    "configured page_size {} does not match header page_size {}",
                    config.page_size, header.page_size
                )));
            }
            header
        };

        let wal = if config.enable_journaling {
            Some(Arc::new(Wal::open(&path, config.journal_flush_delay)?))
        } else {
            None
        };

        let cache = match &wal {
            Some(wal) => PageCache::with_wal(disk.clone(), config.cache_size, wal.clone()),
            None => PageCache::new(disk.clone(), config.cache_size),
        };
        if !brand_new {
            cache.set_free_list_head(header.free_list_head);
        }

        if !brand_new {
            if let Some(wal) = &wal {
                let disk_for_redo = disk.clone();
                let disk_for_undo = disk.clone();
                let stats = recover(
                    wal,
                    move |page_id, image| disk_for_redo.write_raw_page(page_id, image),
                    move |page_id, image| disk_for_undo.write_raw_page(page_id, image),
                )?;
                info!(redone = stats.redone_pages, undone = stats.undone_pages, "recovery complete on open");
                wal.checkpoint_and_truncate(Vec::new())?;
                disk.fsync()?;
            }
        }

        let catalog = if brand_new { Catalog::bootstrap(cache.clone())? } else { Catalog::open(cache.clone())? };
        if brand_new {
            disk.fsync()?;
        }

        let cipher = config.password.as_ref().map(|password| Arc::new(PagePayloadCipher::derive(password, &derive_salt(&header))));

        let mut collections = HashMap::new();
        for descriptor in catalog.list() {
            let mut coll = Collection::open(cache.clone(), &descriptor);
            if let Some(cipher) = &cipher {
                coll = coll.with_cipher(cipher.clone());
            }
            collections.insert(descriptor.name.clone(), Arc::new(coll));
        }

        let inner = Arc::new(DbInner {
            path,
            disk,
            cache,
            wal,
            catalog,
            collections: RwLock::new(collections),
            lock_manager: Arc::new(LockManager::new(config.timeout)),
            txn_manager: TransactionManager::new(config.max_transactions),
            cipher,
            degraded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            flush_scheduler: Mutex::new(None),
            config,
        });

        if let Some(interval) = inner.config.background_flush_interval {
            if !inner.config.read_only {
                let scheduler = FlushScheduler::start(
                    inner.cache.clone(),
                    inner.disk.clone(),
                    inner.wal.clone(),
                    interval,
                )?;
                *inner.flush_scheduler.lock() = Some(scheduler);
            }
        }

        Ok(Database(inner))
    }

    /// Flushes clean, truncates the WAL to its last checkpoint, fsyncs, and
    /// marks the engine closed (spec §3.4). Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(scheduler) = self.0.flush_scheduler.lock().take() {
            scheduler.stop();
        }
        self.0.cache.flush_all()?;

        let raw = self.0.disk.read_raw_page(0)?;
        let mut header = Header::decode(&raw)?;
        header.free_list_head = self.0.cache.free_list_head();
        header.modified_at_ms = now_millis();
        self.0.disk.write_raw_page(0, &header.encode(self.0.config.page_size as usize))?;

        if let Some(wal) = &self.0.wal {
            wal.fsync()?;
            wal.checkpoint_and_truncate(Vec::new())?;
        }
        self.0.disk.fsync()?;
        info!(path = %self.0.path.display(), "database closed");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.0.path
    }

    pub fn create_collection(&self, name: impl Into<String>, id_policy: IdPolicy) -> Result<()> {
        self.0.check_open_for_write()?;
        let name = name.into();
        if self.0.collections.read().contains_key(&name) {
            return Err(DbError::InvalidArgument(format!("collection {name} already exists")));
        }
        let mut coll = Collection::create(self.0.cache.clone(), name.clone(), id_policy)?;
        if let Some(cipher) = &self.0.cipher {
            coll = coll.with_cipher(cipher.clone());
        }
        self.0.catalog.register(coll.descriptor(), None)?;
        self.0.collections.write().insert(name, Arc::new(coll));
        Ok(())
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.0.catalog.list_names()
    }

    pub fn declare_foreign_key(&self, collection: &str, field: impl Into<String>, target_collection: impl Into<String>) -> Result<()> {
        self.0.check_open_for_write()?;
        let coll = self.0.collection_handle(collection)?;
        let target = target_collection.into();
        if !self.0.collections.read().contains_key(&target) {
            return Err(DbError::NotFound(format!("collection {target}")));
        }
        coll.declare_foreign_key(ForeignKeyDescriptor { field: field.into(), target_collection: target });
        self.0.catalog.update(coll.descriptor(), None)
    }

    pub fn ensure_index(&self, collection: &str, name: impl Into<String>, fields: Vec<String>, unique: bool, sparse: bool) -> Result<()> {
        self.0.check_open_for_write()?;
        let coll = self.0.collection_handle(collection)?;
        coll.ensure_index(name, fields, unique, sparse, None)?;
        self.0.catalog.update(coll.descriptor(), None)
    }

    /// Begins a new transaction (spec §4.7 `begin()`).
    pub fn begin(&self) -> Result<Transaction> {
        self.0.check_open()?;
        let id = self.0.txn_manager.begin()?;
        Ok(Transaction::new(id, self.0.clone()))
    }

    /// Autocommit insert: equivalent to beginning a transaction, recording
    /// one insert, and committing it.
    pub fn insert_one(&self, collection: &str, doc: Document) -> Result<Value> {
        let mut txn = self.begin()?;
        let id = txn.record_insert(collection, doc)?;
        txn.commit()?;
        Ok(id)
    }

    pub fn update_one(&self, collection: &str, id: &Value, new_doc: Document) -> Result<()> {
        let mut txn = self.begin()?;
        txn.record_update(collection, id.clone(), new_doc)?;
        txn.commit()
    }

    pub fn delete_one(&self, collection: &str, id: &Value) -> Result<()> {
        let mut txn = self.begin()?;
        txn.record_delete(collection, id.clone())?;
        txn.commit()
    }

    /// Reads never buffer against a transaction; they take a brief shared
    /// collection lock so they cannot observe a commit's partial,
    /// in-progress page mutations.
    fn with_collection_read_lock<T>(&self, collection: &str, f: impl FnOnce(&Collection) -> Result<T>) -> Result<T> {
        self.0.check_open()?;
        let coll = self.0.collection_handle(collection)?;
        let reader_id = self.0.txn_manager.begin()?;
        let result = (|| {
            self.0.lock_manager.acquire(reader_id, LockKey::Collection(collection.to_string()), LockMode::Shared)?;
            let out = f(&coll);
            self.0.lock_manager.release_all(reader_id);
            out
        })();
        self.0.txn_manager.end(reader_id);
        result
    }

    pub fn find_by_id(&self, collection: &str, id: &Value) -> Result<Option<Document>> {
        self.with_collection_read_lock(collection, |coll| coll.find_by_id(id))
    }

    pub fn find_all(&self, collection: &str) -> Result<Vec<Document>> {
        self.with_collection_read_lock(collection, |coll| coll.scan_all())
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        self.with_collection_read_lock(collection, |coll| coll.count())
    }

    pub fn find_by_index(&self, collection: &str, index_name: &str, key: &IndexKey) -> Result<Vec<Document>> {
        self.with_collection_read_lock(collection, |coll| coll.find_by_index(index_name, key))
    }

    /// A predicate-driven query against `collection` (spec §4.8).
    pub fn query<'a>(&'a self, collection: &str) -> Result<crate::query::QueryBuilder<'a>> {
        self.0.check_open()?;
        let coll = self.0.collection_handle(collection)?;
        Ok(crate::query::QueryBuilder::new(self, coll))
    }

    pub(crate) fn inner(&self) -> &Arc<DbInner> {
        &self.0
    }

    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            cache: self.0.cache.stats(),
            active_transactions: self.0.txn_manager.active_count(),
            collection_count: self.0.collections.read().len(),
            degraded: self.0.degraded.load(Ordering::SeqCst),
        }
    }
}

/// WAL fsync (and, under `Synced`, a data flush) appropriate for `concern`.
/// Shared by `Transaction::commit` and any autocommit path.
pub(crate) fn sync_for_write_concern(db: &DbInner, concern: WriteConcern) -> Result<()> {
    match concern {
        WriteConcern::None => Ok(()),
        WriteConcern::Journaled => {
            if let Some(wal) = &db.wal {
                wal.fsync()?;
            }
            Ok(())
        }
        WriteConcern::Synced => {
            if let Some(wal) = &db.wal {
                wal.fsync()?;
            }
            db.cache.flush_all()?;
            if let Err(e) = db.disk.fsync() {
                warn!(error = %e, "data file fsync failed under WriteConcern::Synced");
                return Err(e);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Document;
    use tempfile::tempdir;

    fn doc(name: &str) -> Document {
        let mut d = Document::new();
        d.insert("name", Value::String(name.to_string()));
        d
    }

    #[test]
    fn open_create_insert_find_round_trips() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db"), Config::default().with_cache_size(32)).unwrap();
        db.create_collection("users", IdPolicy::ObjectId).unwrap();
        let id = db.insert_one("users", doc("alice")).unwrap();
        let found = db.find_by_id("users", &id).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&Value::String("alice".to_string())));
        db.close().unwrap();
    }

    #[test]
    fn reopen_after_close_preserves_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let config = Config::default().with_write_concern(WriteConcern::Synced);
        let id;
        {
            let db = Database::open(&path, config.clone()).unwrap();
            db.create_collection("users", IdPolicy::Int64Identity).unwrap();
            id = db.insert_one("users", doc("bob")).unwrap();
            db.close().unwrap();
        }
        let db2 = Database::open(&path, config).unwrap();
        let found = db2.find_by_id("users", &id).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&Value::String("bob".to_string())));
        db2.close().unwrap();
    }

    #[test]
    fn read_only_database_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let db = Database::open(&path, Config::default()).unwrap();
            db.create_collection("users", IdPolicy::ObjectId).unwrap();
            db.close().unwrap();
        }
        let db = Database::open(&path, Config::default().with_read_only(true)).unwrap();
        let err = db.insert_one("users", doc("carl")).unwrap_err();
        assert!(matches!(err, DbError::ReadOnly));
    }
}
