// Positional page I/O against the single database file (spec §2 "disk
// stream", §4.1). Grounded on the teacher's `DiskManager`: a single file
// handle behind a lock, pages addressed by `page_id * page_size`, `write_all`
// plus an explicit `fsync`. The teacher's read-ahead/write-behind/write
// coalescing/io_uring machinery is dropped — this engine's durability and
// caching already live in the WAL and page cache, so a second layer of
// speculative buffering in the disk manager would just duplicate it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::common::PageId;
use crate::error::Result;
use crate::storage::page::Page;

pub struct DiskManager {
    file: Mutex<File>,
    page_size: usize,
}

impl DiskManager {
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            page_size,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of `page_size` pages the file currently holds, inferred from
    /// its length (the file is always extended in whole-page increments).
    pub fn page_count(&self) -> Result<u32> {
        let file = self.file.lock();
        let len = file.metadata()?.len();
        Ok((len / self.page_size as u64) as u32)
    }

    pub fn read_page(&self, page_id: PageId) -> Result<Page> {
        Page::from_bytes(page_id, self.read_raw_page(page_id)?)
    }

    pub fn write_page(&self, page: &Page) -> Result<()> {
        self.write_raw_page(page.page_id, page.as_bytes())
    }

    /// Reads `page_id`'s raw bytes without parsing them as a slotted
    /// `Page`. Used for the header page (page 0, which has its own byte
    /// layout per spec §6.1) and WAL recovery, which replays already-encoded
    /// page images straight from the log.
    pub fn read_raw_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        let mut file = self.file.lock();
        let offset = page_id as u64 * self.page_size as u64;
        file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; self.page_size];
        file.read_exact(&mut data)?;
        Ok(data)
    }

    pub fn write_raw_page(&self, page_id: PageId, bytes: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        let offset = page_id as u64 * self.page_size as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Extends the file by one page of zero bytes and returns its id.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        let page_id = (len / self.page_size as u64) as PageId;
        file.seek(SeekFrom::Start(page_id as u64 * self.page_size as u64))?;
        file.write_all(&vec![0u8; self.page_size])?;
        Ok(page_id)
    }

    /// Flushes buffered writes and fsyncs file data (and, for the header
    /// page, metadata) to disk. Used by `WriteConcern::Synced` commits and
    /// the background flush scheduler.
    pub fn fsync(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_all()?;
        Ok(())
    }

    /// Lighter-weight sync that skips metadata (mtime etc.) when the file's
    /// length hasn't changed since the last full sync.
    pub fn fdatasync(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageType;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskManager::open(dir.path().join("data.db"), 512).unwrap();
        disk.allocate_page().unwrap();
        let mut page = Page::new(0, 512, PageType::CollectionData);
        page.insert_slot(b"payload").unwrap();
        disk.write_page(&page).unwrap();

        let read_back = disk.read_page(0).unwrap();
        assert_eq!(read_back.get_slot(0), Some(&b"payload"[..]));
    }

    #[test]
    fn allocate_page_grows_file() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskManager::open(dir.path().join("data.db"), 512).unwrap();
        assert_eq!(disk.allocate_page().unwrap(), 0);
        assert_eq!(disk.allocate_page().unwrap(), 1);
        assert_eq!(disk.page_count().unwrap(), 2);
    }
}
