// Database header page: page 0 of every file (spec §6.1).
//
// Validated on every `Database::open`; a checksum mismatch or bad magic is
// reported as `DbError::Corruption` rather than allowed to silently open a
// damaged file, mirroring the teacher's `DiskManager` startup validation.
//
// Byte layout is the spec's fixed contract, not a convenience encoding:
// magic 0..4, format version 4..8, page size 8..12, total pages 12..16,
// used pages 16..20, database name (utf8, zero-padded) 20..52, created-at
// (i64 ms) 52..60, modified-at (i64 ms) 60..68, checksum (crc32 over
// 0..68) 68..72, free-list head 72..76, reserved 76..80.

use crc32fast::Hasher;

use crate::error::{DbError, Result};

pub const MAGIC: [u8; 4] = *b"TDB\x01";
pub const FORMAT_VERSION: u32 = 1;
pub const DATABASE_NAME_LEN: usize = 32;

const OFF_MAGIC: usize = 0;
const OFF_FORMAT_VERSION: usize = 4;
const OFF_PAGE_SIZE: usize = 8;
const OFF_TOTAL_PAGES: usize = 12;
const OFF_USED_PAGES: usize = 16;
const OFF_DATABASE_NAME: usize = 20;
const OFF_CREATED_AT: usize = 52;
const OFF_MODIFIED_AT: usize = 60;
const OFF_CHECKSUM: usize = 68;
const OFF_FREE_LIST_HEAD: usize = 72;
const CHECKSUM_COVERED_LEN: usize = 68;
const HEADER_FIXED_LEN: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub format_version: u32,
    pub page_size: u32,
    pub total_pages: u32,
    pub used_pages: u32,
    pub database_name: String,
    pub created_at_ms: i64,
    pub modified_at_ms: i64,
    pub free_list_head: u32,
}

impl Header {
    pub fn new(page_size: u32, database_name: String, created_at_ms: i64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            page_size,
            total_pages: 1,
            used_pages: 1,
            database_name,
            created_at_ms,
            modified_at_ms: created_at_ms,
            free_list_head: 0,
        }
    }

    /// Serializes into a buffer exactly `page_size` bytes long, at the
    /// fixed positions spec §6.1 mandates.
    pub fn encode(&self, page_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; page_size];
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&MAGIC);
        buf[OFF_FORMAT_VERSION..OFF_FORMAT_VERSION + 4].copy_from_slice(&self.format_version.to_le_bytes());
        buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].copy_from_slice(&self.page_size.to_le_bytes());
        buf[OFF_TOTAL_PAGES..OFF_TOTAL_PAGES + 4].copy_from_slice(&self.total_pages.to_le_bytes());
        buf[OFF_USED_PAGES..OFF_USED_PAGES + 4].copy_from_slice(&self.used_pages.to_le_bytes());

        let name_bytes = self.database_name.as_bytes();
        let name_len = name_bytes.len().min(DATABASE_NAME_LEN);
        buf[OFF_DATABASE_NAME..OFF_DATABASE_NAME + name_len].copy_from_slice(&name_bytes[..name_len]);
        // Remaining bytes up to OFF_DATABASE_NAME + DATABASE_NAME_LEN stay zero-padded.

        buf[OFF_CREATED_AT..OFF_CREATED_AT + 8].copy_from_slice(&self.created_at_ms.to_le_bytes());
        buf[OFF_MODIFIED_AT..OFF_MODIFIED_AT + 8].copy_from_slice(&self.modified_at_ms.to_le_bytes());

        let mut hasher = Hasher::new();
        hasher.update(&buf[0..CHECKSUM_COVERED_LEN]);
        let checksum = hasher.finalize();
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&checksum.to_le_bytes());

        buf[OFF_FREE_LIST_HEAD..OFF_FREE_LIST_HEAD + 4].copy_from_slice(&self.free_list_head.to_le_bytes());
        // bytes 76..80 are reserved and stay zero.

        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_FIXED_LEN {
            return Err(DbError::Corruption("header page too short".to_string()));
        }
        if buf[OFF_MAGIC..OFF_MAGIC + 4] != MAGIC {
            return Err(DbError::Corruption("bad magic in header page".to_string()));
        }

        let mut hasher = Hasher::new();
        hasher.update(&buf[0..CHECKSUM_COVERED_LEN]);
        let expected = hasher.finalize();
        let stored = u32::from_le_bytes(buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].try_into().unwrap());
        if stored != expected {
            return Err(DbError::Corruption(format!(
                "header checksum mismatch: stored {stored:#010x}, computed {expected:#010x}"
            )));
        }

        let format_version = u32::from_le_bytes(buf[OFF_FORMAT_VERSION..OFF_FORMAT_VERSION + 4].try_into().unwrap());
        if format_version != FORMAT_VERSION {
            return Err(DbError::Corruption(format!(
                "unsupported format version {format_version}"
            )));
        }

        let page_size = u32::from_le_bytes(buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].try_into().unwrap());
        let total_pages = u32::from_le_bytes(buf[OFF_TOTAL_PAGES..OFF_TOTAL_PAGES + 4].try_into().unwrap());
        let used_pages = u32::from_le_bytes(buf[OFF_USED_PAGES..OFF_USED_PAGES + 4].try_into().unwrap());

        let name_region = &buf[OFF_DATABASE_NAME..OFF_DATABASE_NAME + DATABASE_NAME_LEN];
        let name_end = name_region.iter().position(|&b| b == 0).unwrap_or(DATABASE_NAME_LEN);
        let database_name = std::str::from_utf8(&name_region[..name_end])
            .map_err(|e| DbError::Corruption(format!("invalid utf8 in database name: {e}")))?
            .to_string();

        let created_at_ms = i64::from_le_bytes(buf[OFF_CREATED_AT..OFF_CREATED_AT + 8].try_into().unwrap());
        let modified_at_ms = i64::from_le_bytes(buf[OFF_MODIFIED_AT..OFF_MODIFIED_AT + 8].try_into().unwrap());
        let free_list_head = u32::from_le_bytes(buf[OFF_FREE_LIST_HEAD..OFF_FREE_LIST_HEAD + 4].try_into().unwrap());

        Ok(Header {
            format_version,
            page_size,
            total_pages,
            used_pages,
            database_name,
            created_at_ms,
            modified_at_ms,
            free_list_head,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let header = Header::new(8192, "mydb".to_string(), 1_700_000_000_000);
        let encoded = header.encode(8192);
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let header = Header::new(8192, "mydb".to_string(), 1_700_000_000_000);
        let mut encoded = header.encode(8192);
        encoded[10] ^= 0xFF;
        assert!(Header::decode(&encoded).is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut encoded = Header::new(4096, "x".to_string(), 0).encode(4096);
        encoded[0] = b'Z';
        assert!(Header::decode(&encoded).is_err());
    }

    #[test]
    fn fields_land_at_spec_offsets() {
        let header = Header { free_list_head: 7, ..Header::new(8192, "db".to_string(), 42) };
        let encoded = header.encode(8192);
        assert_eq!(&encoded[0..4], &MAGIC);
        assert_eq!(u32::from_le_bytes(encoded[8..12].try_into().unwrap()), 8192);
        assert_eq!(&encoded[20..22], b"db");
        assert_eq!(encoded[22], 0, "database name field is zero-padded, not length-prefixed");
        assert_eq!(i64::from_le_bytes(encoded[52..60].try_into().unwrap()), 42);
        assert_eq!(i64::from_le_bytes(encoded[60..68].try_into().unwrap()), 42);
        assert_eq!(u32::from_le_bytes(encoded[72..76].try_into().unwrap()), 7);
    }
}
