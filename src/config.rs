// Configuration surface for opening a database (spec §6.3).
//
// Mirrors the teacher's `Config`/`BufferPoolConfig` pattern: a plain struct,
// a `Default` impl carrying the spec's stated defaults, and `with_*`
// builder methods for the options callers are most likely to override.

use std::time::Duration;

/// Durability mode selecting when `commit()` acknowledges (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConcern {
    /// Buffer pages in memory; periodic background flush; no synchronous fsync.
    None,
    /// Commit record is appended and fsynced before `commit()` returns; data
    /// pages flush asynchronously.
    Journaled,
    /// Like `Journaled`, plus data pages are flushed and fsynced before
    /// `commit()` returns.
    Synced,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Page size in bytes. Fixed at file creation; must be one of 4096,
    /// 8192, 16384, 32768.
    pub page_size: u32,

    /// Maximum number of pages held by the page cache.
    pub cache_size: usize,

    /// Durability mode. See `WriteConcern`.
    pub write_concern: WriteConcern,

    /// If false, the WAL is disabled; `write_concern` must then be `None`.
    pub enable_journaling: bool,

    /// Period of the background flush scheduler. `None` disables it.
    pub background_flush_interval: Option<Duration>,

    /// Group-commit window: commits arriving within this window of each
    /// other share a single WAL fsync.
    pub journal_flush_delay: Duration,

    /// Default lock-wait timeout.
    pub timeout: Duration,

    /// Cap on concurrently active transactions.
    pub max_transactions: usize,

    /// If true, all mutating operations fail with `DbError::ReadOnly`.
    pub read_only: bool,

    /// If present, collection and index page payloads are encrypted with an
    /// authenticated cipher; a key is derived from this password.
    pub password: Option<String>,

    /// Database name stored in the header page.
    pub database_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: 8192,
            cache_size: 1000,
            write_concern: WriteConcern::Journaled,
            enable_journaling: true,
            background_flush_interval: Some(Duration::from_secs(5)),
            journal_flush_delay: Duration::from_millis(25),
            timeout: Duration::from_secs(10),
            max_transactions: 1000,
            read_only: false,
            password: None,
            database_name: String::new(),
        }
    }
}

impl Config {
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = write_concern;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Validates the combination the spec fixes: `enable_journaling = false`
    /// implies `write_concern = None`. Other combinations are legal.
    pub fn validate(&self) -> crate::error::Result<()> {
        if !self.enable_journaling && self.write_concern != WriteConcern::None {
            return Err(crate::error::DbError::InvalidArgument(
                "enable_journaling=false requires write_concern=None".to_string(),
            ));
        }
        match self.page_size {
            4096 | 8192 | 16384 | 32768 => {}
            other => {
                return Err(crate::error::DbError::InvalidArgument(format!(
                    "invalid page_size {other}: must be 4096, 8192, 16384 or 32768"
                )))
            }
        }
        Ok(())
    }
}
