// Disk-resident B+tree (spec §4.3).
//
// Grounded on the teacher's in-memory `BPlusTree<K, V>` (latch-crabbed
// node-per-`Arc<RwLock<Node>>` tree) for the overall insert/split and
// delete/merge shape, but nodes now live in pages fetched through the page
// cache rather than as heap objects, per SPEC_FULL.md §4.3: each node is a
// `NodeBody` bincode-encoded into its page's single slot, and the page
// cache's node-view caching (spec §4.1) comes for free because the B+tree
// never holds its own node cache — every access goes through
// `PageCache::fetch`.
//
// Concurrency is the collection-level writer lock (spec §4.3 "no
// latch-crabbing is specified"): callers serialize mutation through the
// owning collection's lock, so this type does not itself latch-crab nodes
// the way the teacher's in-memory tree does.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::buffer::page_cache::PageCache;
use crate::common::{PageId, TransactionId};
use crate::error::{DbError, Result};
use crate::storage::page::{Page, PageType, PAGE_HEADER_SIZE, SLOT_SIZE};
use crate::value::Value;
use crate::wal::Wal;

/// Declared fanout ceiling (spec §4.3 "default upper bound 200 keys/node").
/// Real splits are triggered by whichever bound is hit first: this count or
/// the page's actual byte capacity.
pub const DEFAULT_FANOUT: usize = 200;

/// A journaling context threaded through mutating operations: every page
/// touched gets a WAL before/after image under this transaction.
pub type Journal<'a> = Option<(&'a Wal, TransactionId)>;

/// An ordered tuple of values forming a composite index key (spec §3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexKey(pub Vec<Value>);

impl IndexKey {
    pub fn single(v: Value) -> Self {
        IndexKey(vec![v])
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let ord = a.compare(b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

fn entry_cmp(a: &(IndexKey, Value), b: &(IndexKey, Value)) -> Ordering {
    a.0.cmp(&b.0).then_with(|| a.1.compare(&b.1))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum NodeBody {
    Leaf {
        entries: Vec<(IndexKey, Value)>,
        next: PageId,
        prev: PageId,
    },
    Internal {
        keys: Vec<IndexKey>,
        children: Vec<PageId>,
    },
}

fn read_node(page: &Page) -> Result<NodeBody> {
    let bytes = page
        .get_slot(0)
        .ok_or_else(|| DbError::Corruption(format!("btree page {} missing node slot", page.page_id)))?;
    let (body, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(body)
}

fn encode_node(body: &NodeBody) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(body, bincode::config::standard())?)
}

fn write_node(page: &mut Page, body: &NodeBody) -> Result<()> {
    let bytes = encode_node(body)?;
    if page.slot_count() == 0 {
        page.insert_slot(&bytes)?;
    } else {
        page.update_slot(0, &bytes)?;
    }
    page.set_page_type(match body {
        NodeBody::Leaf { .. } => PageType::BTreeLeaf,
        NodeBody::Internal { .. } => PageType::BTreeInternal,
    });
    Ok(())
}

/// Usable bytes for one node's encoded body, leaving headroom for the page
/// header, the one slot directory entry, and bincode/length overhead.
fn node_capacity(page_size: usize) -> usize {
    page_size.saturating_sub(PAGE_HEADER_SIZE + SLOT_SIZE + 32)
}

/// Disk-resident B+tree: the key is an `IndexKey`, the value is the `_id`
/// of the referenced document (or, for a collection's implicit identity
/// index, a packed data-page location — the tree itself is agnostic to
/// which).
pub struct BTree {
    cache: Arc<PageCache>,
    root: Mutex<PageId>,
    fanout: usize,
}

impl BTree {
    /// Allocates a fresh empty tree (a single empty leaf root).
    pub fn create(cache: Arc<PageCache>) -> Result<Self> {
        let guard = cache.new_page(PageType::BTreeLeaf)?;
        let page_id = guard.page_id();
        write_node(&mut guard.write(), &NodeBody::Leaf { entries: Vec::new(), next: 0, prev: 0 })?;
        drop(guard);
        Ok(Self { cache, root: Mutex::new(page_id), fanout: DEFAULT_FANOUT })
    }

    /// Opens a tree rooted at an existing page (read from the catalog).
    pub fn open(cache: Arc<PageCache>, root_page_id: PageId) -> Self {
        Self { cache, root: Mutex::new(root_page_id), fanout: DEFAULT_FANOUT }
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root.lock()
    }

    fn min_entries(&self) -> usize {
        self.fanout.div_ceil(2)
    }

    fn capacity(&self) -> usize {
        node_capacity(self.cache.page_size())
    }

    fn fits(&self, body: &NodeBody) -> Result<bool> {
        let count = match body {
            NodeBody::Leaf { entries, .. } => entries.len(),
            NodeBody::Internal { keys, .. } => keys.len(),
        };
        Ok(count <= self.fanout && encode_node(body)?.len() <= self.capacity())
    }

    fn read(&self, page_id: PageId) -> Result<NodeBody> {
        let guard = self.cache.fetch(page_id)?;
        read_node(&guard.read())
    }

    fn write(&self, page_id: PageId, body: &NodeBody, journal: Journal<'_>) -> Result<()> {
        self.cache.mutate(page_id, journal, |page| write_node(page, body))
    }

    /// Descends from the root to the leaf that would contain `key`,
    /// returning the full root-to-leaf path (inclusive of the leaf).
    fn find_path(&self, key: &IndexKey) -> Result<Vec<PageId>> {
        let mut path = vec![self.root_page_id()];
        loop {
            let current = *path.last().unwrap();
            match self.read(current)? {
                NodeBody::Leaf { .. } => return Ok(path),
                NodeBody::Internal { keys, children } => {
                    let idx = keys.iter().position(|k| key < k).unwrap_or(keys.len());
                    path.push(children[idx]);
                }
            }
        }
    }

    // -- reads -----------------------------------------------------------

    pub fn find_exact(&self, key: &IndexKey) -> Result<Option<Value>> {
        Ok(self.find_all(key)?.into_iter().next())
    }

    pub fn find_all(&self, key: &IndexKey) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        let path = self.find_path(key)?;
        let mut leaf_id = *path.last().unwrap();
        loop {
            let NodeBody::Leaf { entries, next, .. } = self.read(leaf_id)? else {
                return Err(DbError::Corruption("expected leaf node".to_string()));
            };
            let mut saw_match = false;
            for (k, v) in &entries {
                match k.cmp(key) {
                    Ordering::Less => continue,
                    Ordering::Equal => {
                        saw_match = true;
                        out.push(v.clone());
                    }
                    Ordering::Greater => return Ok(out),
                }
            }
            if !saw_match && !out.is_empty() {
                return Ok(out);
            }
            if next == 0 {
                return Ok(out);
            }
            // Only cross into the next leaf if we ended exactly at this
            // leaf's boundary while still matching.
            if entries.last().map(|(k, _)| k == key).unwrap_or(false) {
                leaf_id = next;
            } else {
                return Ok(out);
            }
        }
    }

    /// Iterates `(key, value)` pairs with `lo <= key <= hi` (bounds
    /// optional, inclusivity controlled per side).
    pub fn range(
        &self,
        lo: Option<&IndexKey>,
        hi: Option<&IndexKey>,
        incl_lo: bool,
        incl_hi: bool,
    ) -> Result<Vec<(IndexKey, Value)>> {
        let start_path = match lo {
            Some(k) => self.find_path(k)?,
            None => {
                let mut path = vec![self.root_page_id()];
                loop {
                    let current = *path.last().unwrap();
                    match self.read(current)? {
                        NodeBody::Leaf { .. } => break,
                        NodeBody::Internal { children, .. } => path.push(children[0]),
                    }
                }
                path
            }
        };
        let mut leaf_id = *start_path.last().unwrap();
        let mut out = Vec::new();
        loop {
            let NodeBody::Leaf { entries, next, .. } = self.read(leaf_id)? else {
                return Err(DbError::Corruption("expected leaf node".to_string()));
            };
            for (k, v) in &entries {
                if let Some(lo) = lo {
                    let ord = k.cmp(lo);
                    if ord == Ordering::Less || (ord == Ordering::Equal && !incl_lo) {
                        continue;
                    }
                }
                if let Some(hi) = hi {
                    let ord = k.cmp(hi);
                    if ord == Ordering::Greater || (ord == Ordering::Equal && !incl_hi) {
                        return Ok(out);
                    }
                }
                out.push((k.clone(), v.clone()));
            }
            if next == 0 {
                return Ok(out);
            }
            leaf_id = next;
        }
    }

    pub fn all_entries(&self) -> Result<Vec<(IndexKey, Value)>> {
        self.range(None, None, true, true)
    }

    // -- insert ------------------------------------------------------------

    pub fn insert(&self, key: IndexKey, value: Value, journal: Journal<'_>) -> Result<()> {
        let path = self.find_path(&key)?;
        let leaf_id = *path.last().unwrap();

        let mut split = self.insert_into_leaf(leaf_id, key, value, journal)?;
        let mut ancestors: Vec<PageId> = path[..path.len() - 1].to_vec();
        let mut child_id = leaf_id;

        while let Some((sep_key, right_id)) = split {
            if let Some(parent_id) = ancestors.pop() {
                split = self.insert_into_internal(parent_id, child_id, sep_key, right_id, journal)?;
                child_id = parent_id;
            } else {
                self.create_new_root(child_id, sep_key, right_id, journal)?;
                split = None;
            }
        }
        Ok(())
    }

    fn insert_into_leaf(
        &self,
        leaf_id: PageId,
        key: IndexKey,
        value: Value,
        journal: Journal<'_>,
    ) -> Result<Option<(IndexKey, PageId)>> {
        let NodeBody::Leaf { mut entries, next, prev } = self.read(leaf_id)? else {
            return Err(DbError::Corruption("expected leaf node".to_string()));
        };

        let target = (key, value);
        let idx = entries.partition_point(|e| entry_cmp(e, &target) == Ordering::Less);
        if entries.get(idx).map(|e| entry_cmp(e, &target) == Ordering::Equal).unwrap_or(false) {
            // Exact (key, value) pair already present: idempotent no-op.
            return Ok(None);
        }
        entries.insert(idx, target);

        let body = NodeBody::Leaf { entries, next, prev };
        if self.fits(&body)? {
            self.write(leaf_id, &body, journal)?;
            return Ok(None);
        }

        let NodeBody::Leaf { entries, next, prev } = body else { unreachable!() };
        let mid = entries.len() / 2;
        let mut left_entries = entries;
        let right_entries = left_entries.split_off(mid);
        let separator = right_entries[0].0.clone();

        let right_guard = self.cache.new_page(PageType::BTreeLeaf)?;
        let right_id = right_guard.page_id();
        drop(right_guard);

        self.write(right_id, &NodeBody::Leaf { entries: right_entries, next, prev: leaf_id }, journal)?;
        self.write(leaf_id, &NodeBody::Leaf { entries: left_entries, next: right_id, prev }, journal)?;
        if next != 0 {
            self.patch_leaf_prev(next, right_id, journal)?;
        }

        Ok(Some((separator, right_id)))
    }

    fn patch_leaf_prev(&self, leaf_id: PageId, new_prev: PageId, journal: Journal<'_>) -> Result<()> {
        let NodeBody::Leaf { entries, next, .. } = self.read(leaf_id)? else {
            return Err(DbError::Corruption("expected leaf node".to_string()));
        };
        self.write(leaf_id, &NodeBody::Leaf { entries, next, prev: new_prev }, journal)
    }

    fn insert_into_internal(
        &self,
        parent_id: PageId,
        old_child: PageId,
        separator: IndexKey,
        new_child: PageId,
        journal: Journal<'_>,
    ) -> Result<Option<(IndexKey, PageId)>> {
        let NodeBody::Internal { mut keys, mut children } = self.read(parent_id)? else {
            return Err(DbError::Corruption("expected internal node".to_string()));
        };
        let pos = children
            .iter()
            .position(|c| *c == old_child)
            .ok_or_else(|| DbError::Corruption("split child missing from parent".to_string()))?;
        keys.insert(pos, separator);
        children.insert(pos + 1, new_child);

        let body = NodeBody::Internal { keys, children };
        if self.fits(&body)? {
            self.write(parent_id, &body, journal)?;
            return Ok(None);
        }

        let NodeBody::Internal { keys, children } = body else { unreachable!() };
        let mid = keys.len() / 2;
        let promote = keys[mid].clone();

        let mut left_keys = keys;
        let right_keys = left_keys.split_off(mid + 1);
        left_keys.pop(); // drop the promoted key from the left side

        let mut left_children = children;
        let right_children = left_children.split_off(mid + 1);

        let right_guard = self.cache.new_page(PageType::BTreeInternal)?;
        let right_id = right_guard.page_id();
        drop(right_guard);

        self.write(right_id, &NodeBody::Internal { keys: right_keys, children: right_children }, journal)?;
        self.write(parent_id, &NodeBody::Internal { keys: left_keys, children: left_children }, journal)?;

        Ok(Some((promote, right_id)))
    }

    fn create_new_root(&self, left: PageId, separator: IndexKey, right: PageId, journal: Journal<'_>) -> Result<()> {
        let guard = self.cache.new_page(PageType::BTreeInternal)?;
        let new_root_id = guard.page_id();
        drop(guard);
        self.write(
            new_root_id,
            &NodeBody::Internal { keys: vec![separator], children: vec![left, right] },
            journal,
        )?;
        *self.root.lock() = new_root_id;
        Ok(())
    }

    // -- delete ------------------------------------------------------------

    /// Removes the exact `(key, value)` pair. Returns whether it was present.
    pub fn delete(&self, key: &IndexKey, value: &Value, journal: Journal<'_>) -> Result<bool> {
        let path = self.find_path(key)?;
        let leaf_id = *path.last().unwrap();

        let NodeBody::Leaf { mut entries, next, prev } = self.read(leaf_id)? else {
            return Err(DbError::Corruption("expected leaf node".to_string()));
        };
        let Some(idx) = entries.iter().position(|(k, v)| k == key && v == value) else {
            return Ok(false);
        };
        entries.remove(idx);
        self.write(leaf_id, &NodeBody::Leaf { entries, next, prev }, journal)?;

        if path.len() == 1 {
            return Ok(true); // leaf is root: underflow is never rebalanced
        }
        self.rebalance_leaf(&path, journal)?;
        Ok(true)
    }

    fn rebalance_leaf(&self, path: &[PageId], journal: Journal<'_>) -> Result<()> {
        let leaf_id = path[path.len() - 1];
        let NodeBody::Leaf { entries, .. } = self.read(leaf_id)? else {
            return Err(DbError::Corruption("expected leaf node".to_string()));
        };
        if entries.len() >= self.min_entries() {
            return Ok(());
        }

        let parent_id = path[path.len() - 2];
        let NodeBody::Internal { mut keys, mut children } = self.read(parent_id)? else {
            return Err(DbError::Corruption("expected internal node".to_string()));
        };
        let pos = children.iter().position(|c| *c == leaf_id).expect("leaf present in parent");

        // Try borrowing from the right sibling.
        if pos + 1 < children.len() {
            let right_id = children[pos + 1];
            if let NodeBody::Leaf { entries: mut right_entries, next: right_next, prev: right_prev } = self.read(right_id)? {
                if right_entries.len() > self.min_entries() {
                    let borrowed = right_entries.remove(0);
                    let NodeBody::Leaf { mut entries, next, prev } = self.read(leaf_id)? else { unreachable!() };
                    entries.push(borrowed);
                    self.write(leaf_id, &NodeBody::Leaf { entries, next, prev }, journal)?;
                    self.write(right_id, &NodeBody::Leaf { entries: right_entries.clone(), next: right_next, prev: right_prev }, journal)?;
                    keys[pos] = right_entries[0].0.clone();
                    self.write(parent_id, &NodeBody::Internal { keys, children }, journal)?;
                    return Ok(());
                }
            }
        }
        // Try borrowing from the left sibling.
        if pos > 0 {
            let left_id = children[pos - 1];
            if let NodeBody::Leaf { entries: mut left_entries, next: left_next, prev: left_prev } = self.read(left_id)? {
                if left_entries.len() > self.min_entries() {
                    let borrowed = left_entries.pop().unwrap();
                    let NodeBody::Leaf { mut entries, next, prev } = self.read(leaf_id)? else { unreachable!() };
                    entries.insert(0, borrowed.clone());
                    self.write(leaf_id, &NodeBody::Leaf { entries, next, prev }, journal)?;
                    self.write(left_id, &NodeBody::Leaf { entries: left_entries, next: left_next, prev: left_prev }, journal)?;
                    keys[pos - 1] = borrowed.0;
                    self.write(parent_id, &NodeBody::Internal { keys, children }, journal)?;
                    return Ok(());
                }
            }
        }

        // Merge. Prefer merging this leaf into its right sibling's slot so
        // we always keep the lower-numbered page as the survivor.
        if pos + 1 < children.len() {
            let right_id = children[pos + 1];
            let NodeBody::Leaf { entries: right_entries, next: right_next, .. } = self.read(right_id)? else {
                return Err(DbError::Corruption("expected leaf node".to_string()));
            };
            let NodeBody::Leaf { mut entries, prev, .. } = self.read(leaf_id)? else { unreachable!() };
            entries.extend(right_entries);
            self.write(leaf_id, &NodeBody::Leaf { entries, next: right_next, prev }, journal)?;
            if right_next != 0 {
                self.patch_leaf_prev(right_next, leaf_id, journal)?;
            }
            keys.remove(pos);
            children.remove(pos + 1);
            self.free_page(right_id, journal)?;
            return self.rebalance_internal(path, parent_id, NodeBody::Internal { keys, children }, journal);
        }
        if pos > 0 {
            let left_id = children[pos - 1];
            let NodeBody::Leaf { entries: mut left_entries, prev: left_prev, .. } = self.read(left_id)? else {
                return Err(DbError::Corruption("expected leaf node".to_string()));
            };
            let NodeBody::Leaf { entries, next, .. } = self.read(leaf_id)? else { unreachable!() };
            left_entries.extend(entries);
            self.write(left_id, &NodeBody::Leaf { entries: left_entries, next, prev: left_prev }, journal)?;
            if next != 0 {
                self.patch_leaf_prev(next, left_id, journal)?;
            }
            keys.remove(pos - 1);
            children.remove(pos);
            self.free_page(leaf_id, journal)?;
            return self.rebalance_internal(path, parent_id, NodeBody::Internal { keys, children }, journal);
        }

        unreachable!("non-root leaf has at least one sibling");
    }

    /// Writes the (already key/child-reduced) parent body and, if it now
    /// underflows, continues rebalancing up the path. `path` is the full
    /// root-to-leaf path; `parent_id` is `path[path.len()-2]`.
    fn rebalance_internal(
        &self,
        path: &[PageId],
        node_id: PageId,
        mut body: NodeBody,
        journal: Journal<'_>,
    ) -> Result<()> {
        let depth = path.iter().position(|p| *p == node_id).expect("node on path");

        if depth == 0 {
            // Root internal node: if it collapsed to a single child, that
            // child becomes the new root (tree height shrinks by one).
            if let NodeBody::Internal { keys, children } = &body {
                if keys.is_empty() && children.len() == 1 {
                    *self.root.lock() = children[0];
                    self.free_page(node_id, journal)?;
                    return Ok(());
                }
            }
            self.write(node_id, &body, journal)?;
            return Ok(());
        }

        let min_keys = self.min_entries().saturating_sub(1).max(1);
        let underflowing = matches!(&body, NodeBody::Internal { keys, .. } if keys.len() < min_keys);
        self.write(node_id, &body, journal)?;
        if !underflowing {
            return Ok(());
        }

        let parent_id = path[depth - 1];
        let NodeBody::Internal { mut keys, mut children } = self.read(parent_id)? else {
            return Err(DbError::Corruption("expected internal node".to_string()));
        };
        let pos = children.iter().position(|c| *c == node_id).expect("node present in parent");

        // Borrow from right internal sibling via the parent separator.
        if pos + 1 < children.len() {
            let right_id = children[pos + 1];
            if let NodeBody::Internal { keys: mut right_keys, children: mut right_children } = self.read(right_id)? {
                if right_keys.len() > min_keys {
                    let NodeBody::Internal { keys: mut node_keys, children: mut node_children } = self.read(node_id)? else { unreachable!() };
                    node_keys.push(keys[pos].clone());
                    keys[pos] = right_keys.remove(0);
                    node_children.push(right_children.remove(0));
                    self.write(node_id, &NodeBody::Internal { keys: node_keys, children: node_children }, journal)?;
                    self.write(right_id, &NodeBody::Internal { keys: right_keys, children: right_children }, journal)?;
                    self.write(parent_id, &NodeBody::Internal { keys, children }, journal)?;
                    return Ok(());
                }
            }
        }
        if pos > 0 {
            let left_id = children[pos - 1];
            if let NodeBody::Internal { keys: mut left_keys, children: mut left_children } = self.read(left_id)? {
                if left_keys.len() > min_keys {
                    let NodeBody::Internal { keys: mut node_keys, children: mut node_children } = self.read(node_id)? else { unreachable!() };
                    node_keys.insert(0, keys[pos - 1].clone());
                    keys[pos - 1] = left_keys.pop().unwrap();
                    node_children.insert(0, left_children.pop().unwrap());
                    self.write(node_id, &NodeBody::Internal { keys: node_keys, children: node_children }, journal)?;
                    self.write(left_id, &NodeBody::Internal { keys: left_keys, children: left_children }, journal)?;
                    self.write(parent_id, &NodeBody::Internal { keys, children }, journal)?;
                    return Ok(());
                }
            }
        }

        // Merge with a sibling, pulling the parent separator down between them.
        if pos + 1 < children.len() {
            let right_id = children[pos + 1];
            let NodeBody::Internal { keys: right_keys, children: right_children } = self.read(right_id)? else {
                return Err(DbError::Corruption("expected internal node".to_string()));
            };
            let NodeBody::Internal { mut node_keys, mut node_children } = self.read(node_id)? else { unreachable!() };
            node_keys.push(keys[pos].clone());
            node_keys.extend(right_keys);
            node_children.extend(right_children);
            self.write(node_id, &NodeBody::Internal { keys: node_keys, children: node_children }, journal)?;
            keys.remove(pos);
            children.remove(pos + 1);
            self.free_page(right_id, journal)?;
        } else {
            let left_id = children[pos - 1];
            let NodeBody::Internal { keys: left_keys, children: left_children } = self.read(left_id)? else {
                return Err(DbError::Corruption("expected internal node".to_string()));
            };
            let NodeBody::Internal { keys: node_keys, children: node_children } = self.read(node_id)? else { unreachable!() };
            let mut merged_keys = left_keys;
            merged_keys.push(keys[pos - 1].clone());
            merged_keys.extend(node_keys);
            let mut merged_children = left_children;
            merged_children.extend(node_children);
            self.write(left_id, &NodeBody::Internal { keys: merged_keys, children: merged_children }, journal)?;
            keys.remove(pos - 1);
            children.remove(pos);
            self.free_page(node_id, journal)?;
        }

        body = NodeBody::Internal { keys, children };
        self.rebalance_internal(path, parent_id, body, journal)
    }

    fn free_page(&self, page_id: PageId, journal: Journal<'_>) -> Result<()> {
        self.cache.free_page(page_id, journal)
    }

    // -- validation (spec §8.1 property 2) ---------------------------------

    /// Walks the whole tree verifying strict ascending order within every
    /// leaf and internal node, parent/child key-range consistency, and
    /// ascending sibling linkage across the leaf chain.
    pub fn validate(&self) -> Result<()> {
        self.validate_subtree(self.root_page_id(), None, None)?;
        self.validate_leaf_chain()
    }

    fn validate_subtree(&self, page_id: PageId, lower: Option<&IndexKey>, upper: Option<&IndexKey>) -> Result<()> {
        match self.read(page_id)? {
            NodeBody::Leaf { entries, .. } => {
                for w in entries.windows(2) {
                    if entry_cmp(&w[0], &w[1]) != Ordering::Less {
                        return Err(DbError::Corruption("leaf entries not strictly ascending".to_string()));
                    }
                }
                for (k, _) in &entries {
                    if lower.is_some_and(|lo| k < lo) || upper.is_some_and(|hi| k >= hi) {
                        return Err(DbError::Corruption("leaf key out of ancestor range".to_string()));
                    }
                }
            }
            NodeBody::Internal { keys, children } => {
                for w in keys.windows(2) {
                    if w[0] >= w[1] {
                        return Err(DbError::Corruption("internal separators not strictly ascending".to_string()));
                    }
                }
                if children.len() != keys.len() + 1 {
                    return Err(DbError::Corruption("child_count != key_count + 1".to_string()));
                }
                for (i, child) in children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { Some(&keys[i - 1]) };
                    let child_upper = if i == keys.len() { upper } else { Some(&keys[i]) };
                    self.validate_subtree(*child, child_lower, child_upper)?;
                }
            }
        }
        Ok(())
    }

    fn validate_leaf_chain(&self) -> Result<()> {
        let mut page_id = self.root_page_id();
        loop {
            match self.read(page_id)? {
                NodeBody::Leaf { .. } => break,
                NodeBody::Internal { children, .. } => page_id = children[0],
            }
        }
        let mut prev_last: Option<IndexKey> = None;
        loop {
            let NodeBody::Leaf { entries, next, .. } = self.read(page_id)? else {
                return Err(DbError::Corruption("expected leaf node".to_string()));
            };
            if let (Some(prev_last_key), Some((first_key, _))) = (&prev_last, entries.first()) {
                if first_key < prev_last_key {
                    return Err(DbError::Corruption("leaf chain not ascending across siblings".to_string()));
                }
            }
            prev_last = entries.last().map(|(k, _)| k.clone());
            if next == 0 {
                return Ok(());
            }
            page_id = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::DiskManager;

    fn tree(page_size: usize) -> BTree {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskManager::open(dir.path().join("idx.db"), page_size).unwrap());
        let cache = PageCache::new(disk, 64);
        BTree::create(cache).unwrap()
    }

    fn key(i: i64) -> IndexKey {
        IndexKey::single(Value::I64(i))
    }

    #[test]
    fn insert_and_find_exact() {
        let t = tree(256);
        t.insert(key(1), Value::I64(100), None).unwrap();
        t.insert(key(2), Value::I64(200), None).unwrap();
        assert_eq!(t.find_exact(&key(1)).unwrap(), Some(Value::I64(100)));
        assert_eq!(t.find_exact(&key(3)).unwrap(), None);
    }

    #[test]
    fn insert_many_forces_splits_and_stays_valid() {
        let t = tree(256);
        for i in 0..500 {
            t.insert(key(i), Value::I64(i * 10), None).unwrap();
        }
        t.validate().unwrap();
        for i in 0..500 {
            assert_eq!(t.find_exact(&key(i)).unwrap(), Some(Value::I64(i * 10)));
        }
    }

    #[test]
    fn non_unique_keys_all_found() {
        let t = tree(256);
        t.insert(key(5), Value::I64(1), None).unwrap();
        t.insert(key(5), Value::I64(2), None).unwrap();
        t.insert(key(5), Value::I64(3), None).unwrap();
        let mut found = t.find_all(&key(5)).unwrap();
        found.sort_by(|a, b| a.compare(b));
        assert_eq!(found, vec![Value::I64(1), Value::I64(2), Value::I64(3)]);
    }

    #[test]
    fn range_scan_respects_bounds() {
        let t = tree(256);
        for i in 0..100 {
            t.insert(key(i), Value::I64(i), None).unwrap();
        }
        let out = t.range(Some(&key(25)), Some(&key(30)), true, true).unwrap();
        let values: Vec<i64> = out
            .into_iter()
            .map(|(_, v)| match v {
                Value::I64(x) => x,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(values, (25..=30).collect::<Vec<_>>());
    }

    #[test]
    fn delete_then_reinsert_stays_valid() {
        let t = tree(256);
        for i in 0..300 {
            t.insert(key(i), Value::I64(i), None).unwrap();
        }
        for i in (0..300).step_by(2) {
            assert!(t.delete(&key(i), &Value::I64(i), None).unwrap());
        }
        t.validate().unwrap();
        for i in 0..300 {
            let expect = if i % 2 == 0 { None } else { Some(Value::I64(i)) };
            assert_eq!(t.find_exact(&key(i)).unwrap(), expect);
        }
        for i in (0..300).step_by(2) {
            t.insert(key(i), Value::I64(i), None).unwrap();
        }
        t.validate().unwrap();
    }

    #[test]
    fn delete_missing_key_returns_false() {
        let t = tree(256);
        t.insert(key(1), Value::I64(1), None).unwrap();
        assert!(!t.delete(&key(99), &Value::I64(1), None).unwrap());
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        // spec §8.1 invariant 2: after any sequence of inserts/deletes, a
        // full validation walk finds every leaf and internal node ordered.
        #[test]
        fn random_insert_delete_sequence_stays_ordered(
            keys in proptest::collection::hash_set(0i64..200, 1..150),
            delete_mask in proptest::collection::vec(proptest::bool::ANY, 1..200),
        ) {
            let t = tree(256);
            let mut keys: Vec<i64> = keys.into_iter().collect();
            keys.sort_unstable();
            let mut live = std::collections::HashSet::new();
            for k in &keys {
                t.insert(key(*k), Value::I64(*k), None).unwrap();
                live.insert(*k);
            }
            for (i, k) in keys.iter().enumerate() {
                if delete_mask.get(i).copied().unwrap_or(false) {
                    prop_assert!(t.delete(&key(*k), &Value::I64(*k), None).unwrap());
                    live.remove(k);
                }
            }
            t.validate().unwrap();
            for k in &keys {
                let expect = if live.contains(k) { Some(Value::I64(*k)) } else { None };
                prop_assert_eq!(t.find_exact(&key(*k)).unwrap(), expect);
            }
        }
    }
}
