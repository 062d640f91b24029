// Shared identifier types used across the engine.

/// Identifies a fixed-size page within the database file. Page 0 is the header page.
pub type PageId = u32;

/// Monotonically increasing log sequence number assigned to WAL records.
pub type Lsn = u64;

/// Identifies a transaction for the lifetime of its `Active`/`Committing`/`RollingBack` states.
pub type TransactionId = u64;

pub const NULL_PAGE: PageId = 0;
