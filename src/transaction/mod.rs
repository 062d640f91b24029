// Transaction subsystem (spec §4.6, §4.7): multi-granularity locking plus a
// buffered-ops transaction manager.

pub mod lock_manager;
pub mod manager;

pub use lock_manager::{LockKey, LockManager, LockMode, LockStats};
pub use manager::{BufferedOp, SavepointId, Transaction, TransactionManager, TransactionState};
