// Buffered-ops transaction manager (spec §4.7).
//
// Grounded on the teacher's `transaction::manager::TransactionManager`
// (active-transaction registry with an id counter and a capacity cap) and
// the buffered-write idea from the teacher's `mvcc`/`occ` modules, where a
// transaction records its intended writes and only touches shared state
// when it validates. Here validation and application are the same step:
// nothing is written to a page, an index, or the WAL until `commit()` runs,
// so `rollback()` before that point never has to undo anything.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::collection::ForeignKeyDescriptor;
use crate::common::TransactionId;
use crate::db::DbInner;
use crate::error::{DbError, Result};
use crate::transaction::lock_manager::{LockKey, LockMode};
use crate::value::{Document, Value};

/// One buffered write, recorded but not yet applied to any page.
#[derive(Debug, Clone)]
pub enum BufferedOp {
    Insert { collection: String, doc: Document },
    Update { collection: String, id: Value, new_doc: Document },
    Delete { collection: String, id: Value },
}

impl BufferedOp {
    fn collection(&self) -> &str {
        match self {
            BufferedOp::Insert { collection, .. } => collection,
            BufferedOp::Update { collection, .. } => collection,
            BufferedOp::Delete { collection, .. } => collection,
        }
    }
}

pub type SavepointId = u64;

struct Savepoint {
    id: SavepointId,
    op_len: usize,
}

/// Records enough of the prior state to compensate a partially applied
/// commit (spec §4.7 "if a later op fails to apply, undo already-applied
/// ops in reverse using the captured before-state").
enum Applied {
    Insert { collection: String, id: Value },
    Update { collection: String, id: Value, before: Document },
    Delete { collection: String, before: Document },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// A handle to one in-flight transaction. Writes recorded through
/// `record_insert`/`record_update`/`record_delete` are buffered in memory;
/// nothing reaches a page, an index, or the WAL until `commit()` runs.
pub struct Transaction {
    id: TransactionId,
    db: Arc<DbInner>,
    ops: Vec<BufferedOp>,
    savepoints: Vec<Savepoint>,
    next_savepoint: SavepointId,
    state: TransactionState,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, db: Arc<DbInner>) -> Self {
        Self { id, db, ops: Vec::new(), savepoints: Vec::new(), next_savepoint: 1, state: TransactionState::Active }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn check_active(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(DbError::InvalidArgument("transaction is no longer active".to_string()));
        }
        Ok(())
    }

    /// Assigns `doc`'s `_id` (per the collection's `IdPolicy`) immediately,
    /// so callers learn the id before `commit()`, and buffers the insert.
    pub fn record_insert(&mut self, collection: &str, mut doc: Document) -> Result<Value> {
        self.check_active()?;
        self.db.check_open_for_write()?;
        let coll = self.db.collection_handle(collection)?;
        let id = coll.assign_id_if_missing(&mut doc);
        self.ops.push(BufferedOp::Insert { collection: collection.to_string(), doc });
        Ok(id)
    }

    pub fn record_update(&mut self, collection: &str, id: Value, new_doc: Document) -> Result<()> {
        self.check_active()?;
        self.db.check_open_for_write()?;
        self.db.collection_handle(collection)?;
        self.ops.push(BufferedOp::Update { collection: collection.to_string(), id, new_doc });
        Ok(())
    }

    pub fn record_delete(&mut self, collection: &str, id: Value) -> Result<()> {
        self.check_active()?;
        self.db.check_open_for_write()?;
        self.db.collection_handle(collection)?;
        self.ops.push(BufferedOp::Delete { collection: collection.to_string(), id });
        Ok(())
    }

    /// Looks up `id` in `collection`, overlaid with this transaction's own
    /// not-yet-committed writes (read-your-writes), last write wins.
    pub fn find_by_id(&self, collection: &str, id: &Value) -> Result<Option<Document>> {
        for op in self.ops.iter().rev() {
            if op.collection() != collection {
                continue;
            }
            match op {
                BufferedOp::Insert { doc, .. } if doc.get_id() == Some(id) => return Ok(Some(doc.clone())),
                BufferedOp::Update { id: uid, new_doc, .. } if uid == id => return Ok(Some(new_doc.clone())),
                BufferedOp::Delete { id: did, .. } if did == id => return Ok(None),
                _ => continue,
            }
        }
        let coll = self.db.collection_handle(collection)?;
        coll.find_by_id(id)
    }

    /// Marks a point in the buffered op list that `rollback_to` can return
    /// to. Multiple savepoints may be live at once.
    pub fn create_savepoint(&mut self) -> Result<SavepointId> {
        self.check_active()?;
        let id = self.next_savepoint;
        self.next_savepoint += 1;
        self.savepoints.push(Savepoint { id, op_len: self.ops.len() });
        Ok(id)
    }

    /// Truncates buffered ops back to `savepoint`'s creation point. Any
    /// savepoint created after `savepoint` is invalidated; `savepoint`
    /// itself survives and can be rolled back to again.
    pub fn rollback_to(&mut self, savepoint: SavepointId) -> Result<()> {
        self.check_active()?;
        let pos = self
            .savepoints
            .iter()
            .position(|sp| sp.id == savepoint)
            .ok_or_else(|| DbError::NotFound(format!("savepoint {savepoint}")))?;
        let op_len = self.savepoints[pos].op_len;
        self.ops.truncate(op_len);
        self.savepoints.truncate(pos + 1);
        Ok(())
    }

    pub fn release_savepoint(&mut self, savepoint: SavepointId) -> Result<()> {
        let before = self.savepoints.len();
        self.savepoints.retain(|sp| sp.id != savepoint);
        if self.savepoints.len() == before {
            return Err(DbError::NotFound(format!("savepoint {savepoint}")));
        }
        Ok(())
    }

    /// Validates foreign keys, acquires locks in canonical order (database
    /// shared, then collections exclusive sorted by name, then documents
    /// exclusive sorted by key), applies every buffered op, and fsyncs per
    /// `WriteConcern`. On any failure, already-applied ops are compensated
    /// in reverse and the transaction aborts.
    pub fn commit(mut self) -> Result<()> {
        self.check_active()?;
        let result = self.commit_inner();
        self.state = if result.is_ok() { TransactionState::Committed } else { TransactionState::RolledBack };
        self.db.txn_manager.end(self.id);
        result
    }

    fn commit_inner(&mut self) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        self.db.check_open_for_write()?;

        let mut collections: Vec<String> = self.ops.iter().map(|op| op.collection().to_string()).collect();
        collections.sort();
        collections.dedup();

        let mut doc_keys: Vec<(String, Value)> = self
            .ops
            .iter()
            .filter_map(|op| match op {
                BufferedOp::Update { collection, id, .. } => Some((collection.clone(), id.clone())),
                BufferedOp::Delete { collection, id } => Some((collection.clone(), id.clone())),
                BufferedOp::Insert { .. } => None,
            })
            .collect();
        doc_keys.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.compare(&b.1)));
        doc_keys.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);

        let lm = &self.db.lock_manager;
        lm.acquire(self.id, LockKey::Database, LockMode::Shared)?;
        for name in &collections {
            if let Err(e) = lm.acquire(self.id, LockKey::Collection(name.clone()), LockMode::Exclusive) {
                lm.release_all(self.id);
                return Err(e);
            }
        }
        for (collection, id) in &doc_keys {
            if let Err(e) = lm.acquire(self.id, LockKey::document(collection, id), LockMode::Exclusive) {
                lm.release_all(self.id);
                return Err(e);
            }
        }

        let result = self.validate_and_apply(&collections);
        lm.release_all(self.id);
        result
    }

    fn validate_and_apply(&mut self, touched_collections: &[String]) -> Result<()> {
        self.validate_foreign_keys()?;

        let journal = self.db.wal.as_ref().map(|wal| (wal.as_ref(), self.id));
        let mut applied: Vec<Applied> = Vec::with_capacity(self.ops.len());

        for op in self.ops.clone() {
            let outcome = self.apply_one(&op, journal);
            match outcome {
                Ok(record) => applied.push(record),
                Err(e) => {
                    warn!(error = %e, txn = self.id, "commit failed partway, compensating");
                    self.compensate(applied, journal);
                    if let Some(wal) = &self.db.wal {
                        let _ = wal.append_abort(self.id);
                    }
                    return Err(e);
                }
            }
        }

        if let Some(wal) = &self.db.wal {
            wal.append_commit(self.id)?;
        }
        for name in touched_collections {
            self.db.persist_collection(name, journal)?;
        }
        crate::db::sync_for_write_concern(&self.db, self.db.config.write_concern)?;
        Ok(())
    }

    fn apply_one(&self, op: &BufferedOp, journal: Option<(&crate::wal::Wal, TransactionId)>) -> Result<Applied> {
        match op {
            BufferedOp::Insert { collection, doc } => {
                let coll = self.db.collection_handle(collection)?;
                let id = coll.insert(doc.clone(), journal)?;
                Ok(Applied::Insert { collection: collection.clone(), id })
            }
            BufferedOp::Update { collection, id, new_doc } => {
                let coll = self.db.collection_handle(collection)?;
                let before = coll
                    .find_by_id(id)?
                    .ok_or_else(|| DbError::NotFound(format!("document {id:?} in {collection}")))?;
                coll.update(id, new_doc.clone(), journal)?;
                Ok(Applied::Update { collection: collection.clone(), id: id.clone(), before })
            }
            BufferedOp::Delete { collection, id } => {
                let coll = self.db.collection_handle(collection)?;
                let before = coll.delete(id, journal)?;
                Ok(Applied::Delete { collection: collection.clone(), before })
            }
        }
    }

    fn compensate(&self, applied: Vec<Applied>, journal: Option<(&crate::wal::Wal, TransactionId)>) {
        for record in applied.into_iter().rev() {
            let outcome: Result<()> = (|| {
                match record {
                    Applied::Insert { collection, id } => {
                        let coll = self.db.collection_handle(&collection)?;
                        coll.delete(&id, journal)?;
                    }
                    Applied::Update { collection, id, before } => {
                        let coll = self.db.collection_handle(&collection)?;
                        coll.update(&id, before, journal)?;
                    }
                    Applied::Delete { collection, before } => {
                        let coll = self.db.collection_handle(&collection)?;
                        coll.insert(before, journal)?;
                    }
                }
                Ok(())
            })();
            if let Err(e) = outcome {
                warn!(error = %e, txn = self.id, "compensation step failed, database may need manual repair");
            }
        }
    }

    fn validate_foreign_keys(&self) -> Result<()> {
        for op in &self.ops {
            let (collection, doc) = match op {
                BufferedOp::Insert { collection, doc } => (collection, doc),
                BufferedOp::Update { collection, new_doc, .. } => (collection, new_doc),
                BufferedOp::Delete { .. } => continue,
            };
            let fks: Vec<ForeignKeyDescriptor> = self.db.foreign_keys_of(collection);
            for fk in fks {
                let Some(value) = doc.get(&fk.field) else { continue };
                if matches!(value, Value::Null) {
                    continue;
                }
                let target = self.db.collection_handle(&fk.target_collection)?;
                if target.find_by_id(value)?.is_none() {
                    return Err(DbError::ForeignKeyViolation {
                        collection: collection.clone(),
                        field: fk.field.clone(),
                        value: format!("{value:?}"),
                        target: fk.target_collection.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Discards every buffered op. Since nothing touches shared state
    /// before `commit()`, this never needs to undo anything.
    pub fn rollback(mut self) {
        self.ops.clear();
        self.state = TransactionState::RolledBack;
        self.db.txn_manager.end(self.id);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            self.db.txn_manager.end(self.id);
        }
    }
}

/// Registry of active transaction ids, with a capacity cap (spec §4.7).
pub struct TransactionManager {
    next_id: AtomicU64,
    active: Mutex<HashSet<TransactionId>>,
    max_transactions: usize,
}

impl TransactionManager {
    pub fn new(max_transactions: usize) -> Self {
        Self { next_id: AtomicU64::new(1), active: Mutex::new(HashSet::new()), max_transactions }
    }

    pub fn begin(&self) -> Result<TransactionId> {
        let mut active = self.active.lock();
        if active.len() >= self.max_transactions {
            return Err(DbError::InvalidArgument(format!(
                "too many active transactions (limit {})",
                self.max_transactions
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        active.insert(id);
        Ok(id)
    }

    pub fn end(&self, id: TransactionId) {
        self.active.lock().remove(&id);
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::IdPolicy;
    use crate::config::Config;
    use crate::db::Database;
    use tempfile::tempdir;

    fn doc(name: &str) -> Document {
        let mut d = Document::new();
        d.insert("name", Value::String(name.to_string()));
        d
    }

    #[test]
    fn commit_persists_buffered_inserts() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("t.db"), Config::default().with_cache_size(32)).unwrap();
        db.create_collection("users", IdPolicy::ObjectId).unwrap();

        let mut txn = db.begin().unwrap();
        let id = txn.record_insert("users", doc("alice")).unwrap();
        assert_eq!(txn.find_by_id("users", &id).unwrap().unwrap().get("name"), Some(&Value::String("alice".to_string())));
        txn.commit().unwrap();

        assert_eq!(db.find_by_id("users", &id).unwrap().unwrap().get("name"), Some(&Value::String("alice".to_string())));
    }

    #[test]
    fn rollback_does_not_persist_anything() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("t.db"), Config::default().with_cache_size(32)).unwrap();
        db.create_collection("users", IdPolicy::ObjectId).unwrap();

        let mut txn = db.begin().unwrap();
        let id = txn.record_insert("users", doc("bob")).unwrap();
        txn.rollback();

        assert_eq!(db.find_by_id("users", &id).unwrap(), None);
    }

    #[test]
    fn savepoint_rollback_discards_only_later_ops() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("t.db"), Config::default().with_cache_size(32)).unwrap();
        db.create_collection("users", IdPolicy::ObjectId).unwrap();

        let mut txn = db.begin().unwrap();
        let id_a = txn.record_insert("users", doc("a")).unwrap();
        let sp = txn.create_savepoint().unwrap();
        let id_b = txn.record_insert("users", doc("b")).unwrap();
        txn.rollback_to(sp).unwrap();
        txn.commit().unwrap();

        assert!(db.find_by_id("users", &id_a).unwrap().is_some());
        assert!(db.find_by_id("users", &id_b).unwrap().is_none());
    }

    #[test]
    fn foreign_key_violation_blocks_commit() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("t.db"), Config::default().with_cache_size(32)).unwrap();
        db.create_collection("authors", IdPolicy::Int64Identity).unwrap();
        db.create_collection("books", IdPolicy::Int64Identity).unwrap();
        db.declare_foreign_key("books", "author_id", "authors").unwrap();

        let mut txn = db.begin().unwrap();
        let mut book = Document::new();
        book.insert("author_id", Value::I64(999));
        txn.record_insert("books", book).unwrap();
        let err = txn.commit().unwrap_err();
        assert!(matches!(err, DbError::ForeignKeyViolation { .. }));
        assert_eq!(db.count("books").unwrap(), 0);
    }
}
