pub mod error;
pub mod lock;
pub mod remote;
pub mod synced;

pub use error::StoreError;
pub use lock::{NullLock, ReadGuard, ReadWriteLock, WriteGuard, WriterPriorityLock};
pub use remote::{checksum, LocalDirStore, RemoteStore};
pub use synced::SyncedDatabase;
