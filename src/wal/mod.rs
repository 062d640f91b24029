// Write-ahead log (spec §4.2, §6.2).
//
// Grounded on the teacher's `transaction::wal_manager::WALManager`: a single
// append-only file behind a lock, a monotonic LSN counter, `flush()`/
// `replay()`. Two things are deliberately different from the teacher: the
// wire format is the spec's fixed byte layout (not `serde_json`, so the file
// this engine writes is the file it is contracted to write), and entries are
// page before/after images plus txn markers rather than logical row ops,
// since recovery here redoes/undoes physical page mutations.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crc32fast::Hasher;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::common::{Lsn, PageId, TransactionId};
use crate::error::{DbError, Result};

const KIND_PAGE_IMAGE: u8 = 1;
const KIND_COMMIT: u8 = 2;
const KIND_ABORT: u8 = 3;
const KIND_CHECKPOINT: u8 = 4;

/// One write-ahead log record (spec §6.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    PageImage {
        page_id: PageId,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    },
    Commit,
    Abort,
    Checkpoint { active_txns: Vec<TransactionId> },
}

impl WalRecord {
    fn kind(&self) -> u8 {
        match self {
            WalRecord::PageImage { .. } => KIND_PAGE_IMAGE,
            WalRecord::Commit => KIND_COMMIT,
            WalRecord::Abort => KIND_ABORT,
            WalRecord::Checkpoint { .. } => KIND_CHECKPOINT,
        }
    }
}

/// A record as read back off disk, with its assigned LSN and owning txn.
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub lsn: Lsn,
    pub txn_id: TransactionId,
    pub record: WalRecord,
}

/// Encodes one record (kind, lsn, txn_id, body) plus its length prefix and
/// trailing CRC32, per spec §6.2.
fn encode_entry(lsn: Lsn, txn_id: TransactionId, record: &WalRecord) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(record.kind());
    body.extend_from_slice(&lsn.to_le_bytes());
    body.extend_from_slice(&txn_id.to_le_bytes());
    match record {
        WalRecord::PageImage { page_id, before_image, after_image } => {
            body.extend_from_slice(&page_id.to_le_bytes());
            body.extend_from_slice(&(before_image.len() as u32).to_le_bytes());
            body.extend_from_slice(before_image);
            body.extend_from_slice(&(after_image.len() as u32).to_le_bytes());
            body.extend_from_slice(after_image);
        }
        WalRecord::Commit | WalRecord::Abort => {}
        WalRecord::Checkpoint { active_txns } => {
            body.extend_from_slice(&(active_txns.len() as u32).to_le_bytes());
            for txn in active_txns {
                body.extend_from_slice(&txn.to_le_bytes());
            }
        }
    }

    let mut hasher = Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(4 + body.len() + 4);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Decodes one record from `buf[pos..]`, returning it and the new position.
/// Returns `Ok(None)` on a clean EOF (no more records). A CRC mismatch or
/// truncated record is `Corruption`, per the recovery policy in spec §4.2:
/// "CRC mismatch on the first bad record terminates replay at that record".
fn decode_entry(buf: &[u8], pos: usize) -> Result<Option<(WalEntry, usize)>> {
    if pos == buf.len() {
        return Ok(None);
    }
    if pos + 4 > buf.len() {
        return Err(DbError::Corruption("truncated WAL record length".to_string()));
    }
    let body_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
    let body_start = pos + 4;
    let body_end = body_start + body_len;
    let crc_end = body_end + 4;
    if crc_end > buf.len() {
        return Err(DbError::Corruption("truncated WAL record body".to_string()));
    }
    let body = &buf[body_start..body_end];
    let stored_crc = u32::from_le_bytes(buf[body_end..crc_end].try_into().unwrap());
    let mut hasher = Hasher::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(DbError::Corruption("WAL record CRC mismatch".to_string()));
    }

    let mut p = 0usize;
    let kind = body[p];
    p += 1;
    let lsn = u64::from_le_bytes(body[p..p + 8].try_into().unwrap());
    p += 8;
    let txn_id = u64::from_le_bytes(body[p..p + 8].try_into().unwrap());
    p += 8;

    let record = match kind {
        KIND_PAGE_IMAGE => {
            let page_id = u32::from_le_bytes(body[p..p + 4].try_into().unwrap());
            p += 4;
            let before_len = u32::from_le_bytes(body[p..p + 4].try_into().unwrap()) as usize;
            p += 4;
            let before_image = body[p..p + before_len].to_vec();
            p += before_len;
            let after_len = u32::from_le_bytes(body[p..p + 4].try_into().unwrap()) as usize;
            p += 4;
            let after_image = body[p..p + after_len].to_vec();
            WalRecord::PageImage { page_id, before_image, after_image }
        }
        KIND_COMMIT => WalRecord::Commit,
        KIND_ABORT => WalRecord::Abort,
        KIND_CHECKPOINT => {
            let count = u32::from_le_bytes(body[p..p + 4].try_into().unwrap()) as usize;
            p += 4;
            let mut active_txns = Vec::with_capacity(count);
            for _ in 0..count {
                active_txns.push(u64::from_le_bytes(body[p..p + 8].try_into().unwrap()));
                p += 8;
            }
            WalRecord::Checkpoint { active_txns }
        }
        other => return Err(DbError::Corruption(format!("unknown WAL record kind {other}"))),
    };

    Ok(Some((WalEntry { lsn, txn_id, record }, crc_end)))
}

struct SyncState {
    appended_bytes: u64,
    synced_bytes: u64,
    flushing: bool,
}

/// The sidecar `<database_path>-wal` file (spec §4.2).
///
/// A single append lock serializes writers (spec §5); group commit batches
/// concurrent `fsync()` callers behind one `journal_flush_delay` window so a
/// burst of committing transactions pays for one `fsync` rather than one
/// each, mirroring the teacher's buffered `WALManager` but with a real
/// group-commit wait instead of a size-triggered buffer flush.
pub struct Wal {
    path: PathBuf,
    file: Mutex<File>,
    next_lsn: Mutex<Lsn>,
    durable_lsn: Mutex<Lsn>,
    sync: Mutex<SyncState>,
    condvar: Condvar,
    journal_flush_delay: Duration,
}

impl Wal {
    pub fn open(database_path: impl AsRef<Path>, journal_flush_delay: Duration) -> Result<Self> {
        let path = wal_path(database_path.as_ref());
        let file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path,
            file: Mutex::new(file),
            next_lsn: Mutex::new(1),
            durable_lsn: Mutex::new(0),
            sync: Mutex::new(SyncState { appended_bytes: len, synced_bytes: len, flushing: false }),
            condvar: Condvar::new(),
            journal_flush_delay,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest LSN known to have been `fsync`ed. A page whose `page_lsn` is
    /// at or below this may be safely flushed to the data file.
    pub fn durable_lsn(&self) -> Lsn {
        *self.durable_lsn.lock()
    }

    fn next_lsn(&self) -> Lsn {
        let mut lsn = self.next_lsn.lock();
        let assigned = *lsn;
        *lsn += 1;
        assigned
    }

    fn append(&self, txn_id: TransactionId, record: WalRecord) -> Result<Lsn> {
        let lsn = self.next_lsn();
        let bytes = encode_entry(lsn, txn_id, &record);
        let mut file = self.file.lock();
        file.write_all(&bytes)?;
        let mut sync = self.sync.lock();
        sync.appended_bytes += bytes.len() as u64;
        Ok(lsn)
    }

    /// Records a page's before/after image. Returns the LSN assigned to the
    /// record, which the caller stamps onto the page via `Page::set_page_lsn`
    /// so the page cache can enforce the write-ahead rule at flush time.
    pub fn append_page_image(
        &self,
        txn_id: TransactionId,
        page_id: PageId,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    ) -> Result<Lsn> {
        self.append(txn_id, WalRecord::PageImage { page_id, before_image, after_image })
    }

    pub fn append_commit(&self, txn_id: TransactionId) -> Result<Lsn> {
        self.append(txn_id, WalRecord::Commit)
    }

    pub fn append_abort(&self, txn_id: TransactionId) -> Result<Lsn> {
        self.append(txn_id, WalRecord::Abort)
    }

    /// Writes a checkpoint record and truncates the log. Since every
    /// checkpoint empties the file, recovery always replays from byte 0 —
    /// there is no separately tracked "last checkpoint LSN" to persist.
    pub fn checkpoint_and_truncate(&self, active_txns: Vec<TransactionId>) -> Result<()> {
        let txn_id = 0;
        self.append(txn_id, WalRecord::Checkpoint { active_txns })?;
        self.fsync()?;
        let mut file = self.file.lock();
        file.set_len(0)?;
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(0))?;
        let mut sync = self.sync.lock();
        sync.appended_bytes = 0;
        sync.synced_bytes = 0;
        drop(sync);
        *self.next_lsn.lock() = 1;
        *self.durable_lsn.lock() = 0;
        info!("WAL checkpointed and truncated");
        Ok(())
    }

    /// Group-commit fsync: batches concurrent callers within
    /// `journal_flush_delay` of each other behind a single `fsync`.
    pub fn fsync(&self) -> Result<()> {
        let target = {
            let sync = self.sync.lock();
            sync.appended_bytes
        };

        let mut sync = self.sync.lock();
        if sync.synced_bytes >= target {
            return Ok(());
        }
        if sync.flushing {
            self.condvar.wait_while(&mut sync, |s| s.synced_bytes < target && s.flushing);
            if sync.synced_bytes >= target {
                return Ok(());
            }
        }
        sync.flushing = true;
        drop(sync);

        if !self.journal_flush_delay.is_zero() {
            std::thread::sleep(self.journal_flush_delay);
        }

        let result = self.file.lock().sync_data();

        let mut sync = self.sync.lock();
        sync.flushing = false;
        if result.is_ok() {
            sync.synced_bytes = sync.appended_bytes;
            *self.durable_lsn.lock() = *self.next_lsn.lock() - 1;
        }
        self.condvar.notify_all();
        result.map_err(DbError::from)?;
        debug!("WAL group-commit fsync completed");
        Ok(())
    }

    /// Reads every well-formed record from the start of the file, stopping
    /// at the first corrupt or truncated one (spec §4.2).
    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        let mut file = self.file.lock();
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        drop(file);

        let mut entries = Vec::new();
        let mut pos = 0;
        loop {
            match decode_entry(&buf, pos) {
                Ok(Some((entry, new_pos))) => {
                    entries.push(entry);
                    pos = new_pos;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, at = pos, "WAL replay stopped at corrupt record");
                    break;
                }
            }
        }
        Ok(entries)
    }
}

fn wal_path(database_path: &Path) -> PathBuf {
    let mut os = database_path.as_os_str().to_owned();
    os.push("-wal");
    PathBuf::from(os)
}

/// Outcome of a recovery pass, surfaced for diagnostics and tests.
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub records_read: usize,
    pub redone_pages: usize,
    pub undone_pages: usize,
}

/// Replays the WAL against `apply`/`undo` callbacks (spec §4.2):
///
/// 1. Group records by transaction id.
/// 2. A transaction is committed iff a `Commit` record for it was read.
/// 3. Committed transactions' page after-images are redone; uncommitted
///    transactions' page before-images are undone.
/// 4. The caller is expected to checkpoint (truncate) the log afterward.
pub fn recover<FApply, FUndo>(
    wal: &Wal,
    mut apply_after: FApply,
    mut apply_before: FUndo,
) -> Result<RecoveryStats>
where
    FApply: FnMut(PageId, &[u8]) -> Result<()>,
    FUndo: FnMut(PageId, &[u8]) -> Result<()>,
{
    let entries = wal.read_all()?;
    let mut stats = RecoveryStats { records_read: entries.len(), ..Default::default() };

    let mut committed: std::collections::HashSet<TransactionId> = std::collections::HashSet::new();
    for entry in &entries {
        if matches!(entry.record, WalRecord::Commit) {
            committed.insert(entry.txn_id);
        }
    }

    for entry in &entries {
        if let WalRecord::PageImage { page_id, before_image, after_image } = &entry.record {
            if committed.contains(&entry.txn_id) {
                apply_after(*page_id, after_image)?;
                stats.redone_pages += 1;
            } else {
                apply_before(*page_id, before_image)?;
                stats.undone_pages += 1;
            }
        }
    }

    info!(
        records = stats.records_read,
        redone = stats.redone_pages,
        undone = stats.undone_pages,
        "WAL recovery complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wal_in(dir: &std::path::Path) -> Wal {
        Wal::open(dir.join("data.db"), Duration::from_millis(0)).unwrap()
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal_in(dir.path());
        wal.append_page_image(1, 5, vec![0u8; 4], vec![1u8; 4]).unwrap();
        wal.append_commit(1).unwrap();
        wal.fsync().unwrap();

        let entries = wal.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[1].record, WalRecord::Commit));
    }

    #[test]
    fn recovery_redoes_committed_and_undoes_uncommitted() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal_in(dir.path());

        wal.append_page_image(1, 1, vec![0u8], vec![1u8]).unwrap();
        wal.append_commit(1).unwrap();

        wal.append_page_image(2, 2, vec![9u8], vec![8u8]).unwrap();
        // txn 2 never commits.
        wal.fsync().unwrap();

        let mut redone = Vec::new();
        let mut undone = Vec::new();
        let stats = recover(
            &wal,
            |page_id, image| {
                redone.push((page_id, image.to_vec()));
                Ok(())
            },
            |page_id, image| {
                undone.push((page_id, image.to_vec()));
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(stats.redone_pages, 1);
        assert_eq!(stats.undone_pages, 1);
        assert_eq!(redone[0], (1, vec![1u8]));
        assert_eq!(undone[0], (2, vec![9u8]));
    }

    #[test]
    fn checkpoint_truncates_file() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal_in(dir.path());
        wal.append_commit(1).unwrap();
        wal.fsync().unwrap();
        wal.checkpoint_and_truncate(vec![]).unwrap();
        assert!(wal.read_all().unwrap().is_empty());
    }

    #[test]
    fn truncated_trailing_record_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal_in(dir.path());
        wal.append_commit(1).unwrap();
        wal.fsync().unwrap();
        {
            use std::io::Write as _;
            let mut f = std::fs::OpenOptions::new().append(true).open(wal_path(&dir.path().join("data.db"))).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        let entries = wal.read_all().unwrap();
        assert_eq!(entries.len(), 1);
    }
}
