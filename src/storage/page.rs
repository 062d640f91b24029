// Slotted page layout (spec §3.2, §6.1).
//
// A fixed-size page holds a 32-byte header, a slot array that grows
// upward from the end of the header, and payload bytes that grow
// downward from the end of the page; the free region sits between them.
// Both collection data pages and B+tree nodes are slotted pages storing
// different payloads (encoded documents, or node entries) through the
// same directory — this collapses the teacher's flat `Page{data: Vec<u8>}`
// blob plus its separate `SlottedPage`/`PageMerger`/`PageSplitter` helpers
// into one type.

use crate::common::PageId;
use crate::error::{DbError, Result};

pub const PAGE_HEADER_SIZE: usize = 32;
pub const SLOT_SIZE: usize = 4;
const TOMBSTONE_BIT: u16 = 0x8000;
const LENGTH_MASK: u16 = 0x7FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Header = 0,
    CollectionData = 1,
    BTreeInternal = 2,
    BTreeLeaf = 3,
    Free = 4,
    Catalog = 5,
}

impl PageType {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => PageType::Header,
            1 => PageType::CollectionData,
            2 => PageType::BTreeInternal,
            3 => PageType::BTreeLeaf,
            4 => PageType::Free,
            5 => PageType::Catalog,
            other => return Err(DbError::Corruption(format!("unknown page type {other}"))),
        })
    }
}

// Header field offsets. 24..32 are reserved for future use (e.g. a page-level checksum).
const OFF_TYPE: usize = 0;
const OFF_FLAGS: usize = 1;
const OFF_SLOT_COUNT: usize = 2; // u16
const OFF_PAGE_ID: usize = 4; // u32
const OFF_NEXT_PAGE_ID: usize = 8; // u32
const OFF_PREV_PAGE_ID: usize = 12; // u32
const OFF_PARENT_PAGE_ID: usize = 16; // u32, btree nodes only
const OFF_FREE_OFFSET: usize = 20; // u16, end of payload region (grows downward)
const OFF_PAYLOAD_USED: usize = 22; // u16, live payload bytes, pre-compaction
const OFF_PAGE_LSN: usize = 24; // u64, LSN of the WAL record covering this page's last mutation

/// One fixed-size page, backed by an owned buffer of exactly `Config::page_size` bytes.
#[derive(Debug, Clone)]
pub struct Page {
    pub page_id: PageId,
    data: Vec<u8>,
    pub dirty: bool,
}

impl Page {
    pub fn new(page_id: PageId, size: usize, page_type: PageType) -> Self {
        let mut data = vec![0u8; size];
        data[OFF_TYPE] = page_type as u8;
        let mut page = Page { page_id, data, dirty: true };
        page.set_u32(OFF_PAGE_ID, page_id);
        page.set_u16(OFF_FREE_OFFSET, size as u16);
        page
    }

    pub fn from_bytes(page_id: PageId, data: Vec<u8>) -> Result<Self> {
        if data.len() < PAGE_HEADER_SIZE {
            return Err(DbError::Corruption("page buffer smaller than header".to_string()));
        }
        let stored_id = u32::from_le_bytes(data[OFF_PAGE_ID..OFF_PAGE_ID + 4].try_into().unwrap());
        if stored_id != page_id {
            return Err(DbError::Corruption(format!(
                "page id mismatch: slot {page_id} holds stamped id {stored_id}"
            )));
        }
        Ok(Page { page_id, data, dirty: false })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn get_u16(&self, off: usize) -> u16 {
        u16::from_le_bytes(self.data[off..off + 2].try_into().unwrap())
    }

    fn set_u16(&mut self, off: usize, v: u16) {
        self.data[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn get_u32(&self, off: usize) -> u32 {
        u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
    }

    fn set_u32(&mut self, off: usize, v: u32) {
        self.data[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn get_u64(&self, off: usize) -> u64 {
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }

    fn set_u64(&mut self, off: usize, v: u64) {
        self.data[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// LSN of the WAL record that covers this page's most recent mutation.
    /// The page cache will not flush a dirty page to disk while this
    /// exceeds the WAL's durable LSN (spec §3.3 invariant 4).
    pub fn page_lsn(&self) -> u64 {
        self.get_u64(OFF_PAGE_LSN)
    }

    pub fn set_page_lsn(&mut self, lsn: u64) {
        self.set_u64(OFF_PAGE_LSN, lsn);
    }

    pub fn page_type(&self) -> Result<PageType> {
        PageType::from_u8(self.data[OFF_TYPE])
    }

    pub fn set_page_type(&mut self, t: PageType) {
        self.data[OFF_TYPE] = t as u8;
        self.dirty = true;
    }

    pub fn flags(&self) -> u8 {
        self.data[OFF_FLAGS]
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.data[OFF_FLAGS] = flags;
        self.dirty = true;
    }

    pub fn slot_count(&self) -> u16 {
        self.get_u16(OFF_SLOT_COUNT)
    }

    pub fn next_page_id(&self) -> PageId {
        self.get_u32(OFF_NEXT_PAGE_ID)
    }

    pub fn set_next_page_id(&mut self, id: PageId) {
        self.set_u32(OFF_NEXT_PAGE_ID, id);
        self.dirty = true;
    }

    pub fn prev_page_id(&self) -> PageId {
        self.get_u32(OFF_PREV_PAGE_ID)
    }

    pub fn set_prev_page_id(&mut self, id: PageId) {
        self.set_u32(OFF_PREV_PAGE_ID, id);
        self.dirty = true;
    }

    pub fn parent_page_id(&self) -> PageId {
        self.get_u32(OFF_PARENT_PAGE_ID)
    }

    pub fn set_parent_page_id(&mut self, id: PageId) {
        self.set_u32(OFF_PARENT_PAGE_ID, id);
        self.dirty = true;
    }

    fn free_offset(&self) -> u16 {
        self.get_u16(OFF_FREE_OFFSET)
    }

    fn slot_array_end(&self) -> usize {
        PAGE_HEADER_SIZE + self.slot_count() as usize * SLOT_SIZE
    }

    /// Bytes available for one more slot plus its payload, ignoring compaction.
    pub fn free_space(&self) -> usize {
        (self.free_offset() as usize).saturating_sub(self.slot_array_end())
    }

    /// Bytes that would be free if tombstoned slots were reclaimed.
    pub fn free_space_after_compaction(&self) -> usize {
        self.size()
            - self.slot_array_end()
            - self.get_u16(OFF_PAYLOAD_USED) as usize
    }

    fn slot_entry(&self, index: u16) -> Option<(u16, u16)> {
        if index >= self.slot_count() {
            return None;
        }
        let off = PAGE_HEADER_SIZE + index as usize * SLOT_SIZE;
        let offset = self.get_u16(off);
        let length_and_flag = self.get_u16(off + 2);
        Some((offset, length_and_flag))
    }

    pub fn is_tombstoned(&self, index: u16) -> bool {
        match self.slot_entry(index) {
            Some((_, lf)) => lf & TOMBSTONE_BIT != 0,
            None => true,
        }
    }

    /// Returns the payload bytes for a live slot, or `None` if the slot is
    /// tombstoned or out of range.
    pub fn get_slot(&self, index: u16) -> Option<&[u8]> {
        let (offset, length_and_flag) = self.slot_entry(index)?;
        if length_and_flag & TOMBSTONE_BIT != 0 {
            return None;
        }
        let len = (length_and_flag & LENGTH_MASK) as usize;
        let offset = offset as usize;
        Some(&self.data[offset..offset + len])
    }

    /// Appends a new slot carrying `payload`, compacting first if needed.
    /// Returns the new slot's index.
    pub fn insert_slot(&mut self, payload: &[u8]) -> Result<u16> {
        let needed = SLOT_SIZE + payload.len();
        if self.free_space() < needed {
            if self.free_space_after_compaction() < needed {
                return Err(DbError::InvalidArgument("page full".to_string()));
            }
            self.compact();
        }

        let new_offset = self.free_offset() as usize - payload.len();
        self.data[new_offset..new_offset + payload.len()].copy_from_slice(payload);
        self.set_u16(OFF_FREE_OFFSET, new_offset as u16);

        let index = self.slot_count();
        let slot_off = PAGE_HEADER_SIZE + index as usize * SLOT_SIZE;
        self.set_u16(slot_off, new_offset as u16);
        self.set_u16(slot_off + 2, payload.len() as u16);
        self.set_u16(OFF_SLOT_COUNT, index + 1);

        let used = self.get_u16(OFF_PAYLOAD_USED) + payload.len() as u16;
        self.set_u16(OFF_PAYLOAD_USED, used);

        self.dirty = true;
        Ok(index)
    }

    /// Replaces a live slot's payload in place when `new_payload` fits the
    /// slot's current allocation; otherwise tombstones it and inserts a new
    /// slot, returning that slot's index.
    pub fn update_slot(&mut self, index: u16, new_payload: &[u8]) -> Result<u16> {
        let (offset, length_and_flag) = self
            .slot_entry(index)
            .filter(|(_, lf)| lf & TOMBSTONE_BIT == 0)
            .ok_or_else(|| DbError::InvalidArgument("update of missing slot".to_string()))?;
        let current_len = (length_and_flag & LENGTH_MASK) as usize;
        if new_payload.len() <= current_len {
            let offset = offset as usize;
            self.data[offset..offset + new_payload.len()].copy_from_slice(new_payload);
            let slot_off = PAGE_HEADER_SIZE + index as usize * SLOT_SIZE;
            self.set_u16(slot_off + 2, new_payload.len() as u16);
            let used = self.get_u16(OFF_PAYLOAD_USED) - (current_len - new_payload.len()) as u16;
            self.set_u16(OFF_PAYLOAD_USED, used);
            self.dirty = true;
            Ok(index)
        } else {
            self.delete_slot(index)?;
            self.insert_slot(new_payload)
        }
    }

    pub fn delete_slot(&mut self, index: u16) -> Result<()> {
        let (_, length_and_flag) = self
            .slot_entry(index)
            .ok_or_else(|| DbError::InvalidArgument("delete of missing slot".to_string()))?;
        if length_and_flag & TOMBSTONE_BIT != 0 {
            return Ok(());
        }
        let len = length_and_flag & LENGTH_MASK;
        let slot_off = PAGE_HEADER_SIZE + index as usize * SLOT_SIZE;
        self.set_u16(slot_off + 2, len | TOMBSTONE_BIT);
        let used = self.get_u16(OFF_PAYLOAD_USED) - len;
        self.set_u16(OFF_PAYLOAD_USED, used);
        self.dirty = true;
        Ok(())
    }

    /// Iterates live (non-tombstoned) slots in directory order.
    pub fn iter_slots(&self) -> impl Iterator<Item = (u16, &[u8])> {
        (0..self.slot_count()).filter_map(move |i| self.get_slot(i).map(|p| (i, p)))
    }

    /// Rewrites the payload region, dropping tombstoned slots and packing
    /// the rest contiguously from the top of the page down.
    fn compact(&mut self) {
        let mut entries: Vec<(u16, Vec<u8>)> = self
            .iter_slots()
            .map(|(i, payload)| (i, payload.to_vec()))
            .collect();
        entries.sort_by_key(|(i, _)| *i);

        let mut cursor = self.size();
        let mut new_offsets = vec![(0u16, 0u16); self.slot_count() as usize];
        for (index, payload) in &entries {
            cursor -= payload.len();
            self.data[cursor..cursor + payload.len()].copy_from_slice(payload);
            new_offsets[*index as usize] = (cursor as u16, payload.len() as u16);
        }
        for (index, (offset, len)) in new_offsets.iter().enumerate() {
            let slot_off = PAGE_HEADER_SIZE + index * SLOT_SIZE;
            if *len == 0 && self.is_tombstoned(index as u16) {
                continue;
            }
            self.set_u16(slot_off, *offset);
            self.set_u16(slot_off + 2, *len);
        }
        self.set_u16(OFF_FREE_OFFSET, cursor as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_read_slots() {
        let mut page = Page::new(1, 256, PageType::CollectionData);
        let a = page.insert_slot(b"hello").unwrap();
        let b = page.insert_slot(b"world!").unwrap();
        assert_eq!(page.get_slot(a), Some(&b"hello"[..]));
        assert_eq!(page.get_slot(b), Some(&b"world!"[..]));
        assert_eq!(page.slot_count(), 2);
    }

    #[test]
    fn delete_tombstones_and_compaction_reclaims() {
        let mut page = Page::new(1, 64, PageType::CollectionData);
        let a = page.insert_slot(b"aaaaaaaaaa").unwrap();
        let _b = page.insert_slot(b"bbbbbbbbbb").unwrap();
        page.delete_slot(a).unwrap();
        assert!(page.get_slot(a).is_none());
        let before = page.free_space();
        let after_compaction = page.free_space_after_compaction();
        assert!(after_compaction > before);
    }

    #[test]
    fn update_slot_grows_by_relocating() {
        let mut page = Page::new(1, 128, PageType::CollectionData);
        let a = page.insert_slot(b"short").unwrap();
        let a2 = page.update_slot(a, b"a much longer payload value").unwrap();
        assert_eq!(page.get_slot(a2), Some(&b"a much longer payload value"[..]));
    }

    #[test]
    fn round_trip_through_bytes() {
        let mut page = Page::new(7, 128, PageType::BTreeLeaf);
        page.insert_slot(b"x").unwrap();
        page.set_next_page_id(42);
        let bytes = page.into_bytes();
        let restored = Page::from_bytes(7, bytes).unwrap();
        assert_eq!(restored.next_page_id(), 42);
        assert_eq!(restored.page_type().unwrap(), PageType::BTreeLeaf);
        assert_eq!(restored.get_slot(0), Some(&b"x"[..]));
    }
}
