// Per-collection index manager (spec §4.4).
//
// Owns one B+tree per declared index, plus the always-present unique `_id`
// index. Grounded on the teacher's `document_store::indexing` module for
// the ensure/on_insert/on_update/on_delete surface, generalized to use the
// disk-resident [`BTree`](crate::index::BTree) rather than an in-memory map.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::buffer::page_cache::PageCache;
use crate::common::PageId;
use crate::error::{DbError, Result};
use crate::index::{BTree, IndexKey, Journal};
use crate::value::{Document, Value};

use serde::{Deserialize, Serialize};

/// Name reserved for the implicit unique index over `_id` (spec §3.3
/// invariant 7: "collections' `_id` indexes are always unique").
pub const ID_INDEX_NAME: &str = "_id_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
    pub sparse: bool,
    pub root_page: PageId,
}

impl IndexDescriptor {
    fn id_index(root_page: PageId) -> Self {
        IndexDescriptor {
            name: ID_INDEX_NAME.to_string(),
            fields: vec!["_id".to_string()],
            unique: true,
            sparse: false,
            root_page,
        }
    }
}

struct IndexEntry {
    descriptor: IndexDescriptor,
    tree: BTree,
}

pub struct IndexManager {
    cache: Arc<PageCache>,
    indexes: RwLock<Vec<IndexEntry>>,
}

fn encode_location(page_id: PageId, slot: u16) -> Value {
    Value::Array(vec![Value::I64(page_id as i64), Value::I64(slot as i64)])
}

fn decode_location(value: &Value) -> Result<(PageId, u16)> {
    match value {
        Value::Array(items) if items.len() == 2 => {
            let page = match items[0] {
                Value::I64(v) => v as PageId,
                _ => return Err(DbError::Corruption("malformed index location".to_string())),
            };
            let slot = match items[1] {
                Value::I64(v) => v as u16,
                _ => return Err(DbError::Corruption("malformed index location".to_string())),
            };
            Ok((page, slot))
        }
        _ => Err(DbError::Corruption("malformed index location".to_string())),
    }
}

/// Builds the key for `descriptor` out of `doc`, or `None` when the
/// descriptor is sparse and any declared field is absent (spec §4.4
/// "missing-field policy").
fn build_key(descriptor: &IndexDescriptor, doc: &Document) -> Option<IndexKey> {
    if descriptor.sparse && descriptor.fields.iter().any(|f| !doc.contains_key(f)) {
        return None;
    }
    let values = descriptor
        .fields
        .iter()
        .map(|f| doc.get(f).cloned().unwrap_or(Value::Null))
        .collect();
    Some(IndexKey(values))
}

impl IndexManager {
    /// Creates a fresh index manager for a brand-new collection: just the
    /// implicit `_id` index, rooted at a freshly allocated page.
    pub fn bootstrap(cache: Arc<PageCache>) -> Result<Self> {
        let tree = BTree::create(cache.clone())?;
        let descriptor = IndexDescriptor::id_index(tree.root_page_id());
        Ok(Self {
            cache,
            indexes: RwLock::new(vec![IndexEntry { descriptor, tree }]),
        })
    }

    /// Reopens a collection's indexes from their persisted descriptors.
    pub fn open(cache: Arc<PageCache>, descriptors: &[IndexDescriptor]) -> Self {
        let entries = descriptors
            .iter()
            .cloned()
            .map(|descriptor| {
                let tree = BTree::open(cache.clone(), descriptor.root_page);
                IndexEntry { descriptor, tree }
            })
            .collect();
        Self { cache, indexes: RwLock::new(entries) }
    }

    pub fn descriptors(&self) -> Vec<IndexDescriptor> {
        self.indexes.read().iter().map(|e| e.descriptor.clone()).collect()
    }

    pub fn all_indexes(&self) -> Vec<String> {
        self.indexes.read().iter().map(|e| e.descriptor.name.clone()).collect()
    }

    pub fn location_of(&self, id: &Value) -> Result<Option<(PageId, u16)>> {
        let indexes = self.indexes.read();
        let id_index = &indexes[0];
        debug_assert_eq!(id_index.descriptor.name, ID_INDEX_NAME);
        match id_index.tree.find_exact(&IndexKey(vec![id.clone()]))? {
            Some(v) => Ok(Some(decode_location(&v)?)),
            None => Ok(None),
        }
    }

    /// Finds document `_id`s matching `key` on the named secondary index.
    pub fn lookup(&self, index_name: &str, key: &IndexKey) -> Result<Vec<Value>> {
        let indexes = self.indexes.read();
        let entry = indexes
            .iter()
            .find(|e| e.descriptor.name == index_name)
            .ok_or_else(|| DbError::NotFound(format!("index {index_name}")))?;
        entry.tree.find_all(key)
    }

    pub fn range(
        &self,
        index_name: &str,
        lo: Option<&IndexKey>,
        hi: Option<&IndexKey>,
        incl_lo: bool,
        incl_hi: bool,
    ) -> Result<Vec<(IndexKey, Value)>> {
        let indexes = self.indexes.read();
        let entry = indexes
            .iter()
            .find(|e| e.descriptor.name == index_name)
            .ok_or_else(|| DbError::NotFound(format!("index {index_name}")))?;
        entry.tree.range(lo, hi, incl_lo, incl_hi)
    }

    pub fn create_index(
        &self,
        name: String,
        fields: Vec<String>,
        unique: bool,
        sparse: bool,
        entries: impl IntoIterator<Item = (Document, Value)>,
        journal: Journal<'_>,
    ) -> Result<()> {
        if self.indexes.read().iter().any(|e| e.descriptor.name == name) {
            return Err(DbError::InvalidArgument(format!("index {name} already exists")));
        }
        let descriptor = IndexDescriptor { name, fields, unique, sparse, root_page: 0 };
        let tree = BTree::create(self.cache.clone())?;
        for (doc, id) in entries {
            if let Some(key) = build_key(&descriptor, &doc) {
                if descriptor.unique {
                    if tree.find_exact(&key)?.is_some() {
                        return Err(DbError::UniqueConstraint { index: descriptor.name.clone() });
                    }
                }
                tree.insert(key, id, journal)?;
            }
        }
        let descriptor = IndexDescriptor { root_page: tree.root_page_id(), ..descriptor };
        self.indexes.write().push(IndexEntry { descriptor, tree });
        Ok(())
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        if name == ID_INDEX_NAME {
            return Err(DbError::InvalidArgument("cannot drop the _id index".to_string()));
        }
        let mut indexes = self.indexes.write();
        let before = indexes.len();
        indexes.retain(|e| e.descriptor.name != name);
        if indexes.len() == before {
            return Err(DbError::NotFound(format!("index {name}")));
        }
        Ok(())
    }

    /// Maintains every index for a freshly inserted document. On a unique
    /// violation, already-applied index updates are undone in reverse
    /// order (spec §4.4) before the error is returned.
    pub fn on_insert(&self, doc: &Document, id: &Value, location: (PageId, u16), journal: Journal<'_>) -> Result<()> {
        let indexes = self.indexes.read();
        let mut applied: Vec<(usize, IndexKey, Value)> = Vec::new();
        for (i, entry) in indexes.iter().enumerate() {
            let (key, value) = if entry.descriptor.name == ID_INDEX_NAME {
                (IndexKey(vec![id.clone()]), encode_location(location.0, location.1))
            } else {
                match build_key(&entry.descriptor, doc) {
                    Some(k) => (k, id.clone()),
                    None => continue,
                }
            };
            if entry.descriptor.unique && entry.tree.find_exact(&key)?.is_some() {
                for (j, k, v) in applied.into_iter().rev() {
                    let _ = indexes[j].tree.delete(&k, &v, journal);
                }
                return Err(DbError::UniqueConstraint { index: entry.descriptor.name.clone() });
            }
            entry.tree.insert(key.clone(), value.clone(), journal)?;
            applied.push((i, key, value));
        }
        Ok(())
    }

    pub fn on_delete(&self, doc: &Document, id: &Value, location: (PageId, u16), journal: Journal<'_>) -> Result<()> {
        let indexes = self.indexes.read();
        for entry in indexes.iter() {
            if entry.descriptor.name == ID_INDEX_NAME {
                let key = IndexKey(vec![id.clone()]);
                let value = encode_location(location.0, location.1);
                entry.tree.delete(&key, &value, journal)?;
            } else if let Some(key) = build_key(&entry.descriptor, doc) {
                entry.tree.delete(&key, id, journal)?;
            }
        }
        Ok(())
    }

    pub fn on_update(
        &self,
        old_doc: &Document,
        new_doc: &Document,
        id: &Value,
        old_location: (PageId, u16),
        new_location: (PageId, u16),
        journal: Journal<'_>,
    ) -> Result<()> {
        let indexes = self.indexes.read();
        for entry in indexes.iter() {
            let (old_key, old_value, new_key, new_value) = if entry.descriptor.name == ID_INDEX_NAME {
                (
                    Some(IndexKey(vec![id.clone()])),
                    encode_location(old_location.0, old_location.1),
                    Some(IndexKey(vec![id.clone()])),
                    encode_location(new_location.0, new_location.1),
                )
            } else {
                (
                    build_key(&entry.descriptor, old_doc),
                    id.clone(),
                    build_key(&entry.descriptor, new_doc),
                    id.clone(),
                )
            };
            if old_key == new_key && old_value == new_value {
                continue;
            }
            if let Some(k) = &old_key {
                entry.tree.delete(k, &old_value, journal)?;
            }
            if let Some(k) = &new_key {
                if entry.descriptor.unique && entry.tree.find_exact(k)?.is_some() {
                    return Err(DbError::UniqueConstraint { index: entry.descriptor.name.clone() });
                }
                entry.tree.insert(k.clone(), new_value, journal)?;
            }
        }
        Ok(())
    }
}
