use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::error::StoreError;
use crate::lock::{ReadWriteLock, WriterPriorityLock};
use crate::remote::{checksum, RemoteStore};

const MEMORY: &str = ":memory:";

/// SQLite file mirrored to a [`RemoteStore`].
///
/// On open the remote copy (if any) replaces the local file. Queries run under
/// the read lock, each on its own read-only connection; mutations and syncs
/// run under the write lock on the shared read-write connection. `sync` and
/// `close` push the file back only when its SHA-256 changed.
pub struct SyncedDatabase<L: ReadWriteLock = WriterPriorityLock> {
    conn: Mutex<Connection>,
    path: PathBuf,
    remote: Option<Arc<dyn RemoteStore>>,
    remote_key: String,
    checksum: Mutex<Vec<u8>>,
    lock: L,
}

impl<L: ReadWriteLock> SyncedDatabase<L> {
    /// Open `path`, preloading it from `remote` under the file's name.
    pub fn open(path: &Path, remote: Option<Arc<dyn RemoteStore>>, lock: L) -> Result<Self, StoreError> {
        let remote_key = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StoreError::Io(format!("not a file path: {}", path.display())))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut stored = Vec::new();
        if let Some(store) = &remote {
            if store.exists(&remote_key)? {
                store.get(&remote_key, path)?;
                stored = checksum(path)?;
                info!(path = %path.display(), key = %remote_key, "database preloaded from remote");
            }
        }

        let conn = Connection::open(path)?;
        info!(path = %path.display(), "database opened");

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_owned(),
            remote,
            remote_key,
            checksum: Mutex::new(stored),
            lock,
        })
    }

    /// Unsynced in-memory database.
    pub fn in_memory(lock: L) -> Result<Self, StoreError> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: PathBuf::from(MEMORY),
            remote: None,
            remote_key: String::new(),
            checksum: Mutex::new(Vec::new()),
            lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_memory(&self) -> bool {
        self.path.as_os_str() == MEMORY
    }

    fn run_query<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        if self.is_memory() {
            let conn = self.conn.lock();
            return f(&conn);
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        f(&conn)
    }

    fn run_mutation<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }

    pub fn query<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let _guard = self.lock.read();
        self.run_query(f)
    }

    pub fn execute<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let _guard = self.lock.write();
        self.run_mutation(f)
    }

    pub async fn query_async<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let _guard = self.lock.read_async().await;
        self.run_query(f)
    }

    pub async fn execute_async<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let _guard = self.lock.write_async().await;
        self.run_mutation(f)
    }

    /// Push the file to the remote if it changed since the last sync or preload.
    /// Returns whether anything was uploaded.
    pub fn sync(&self) -> Result<bool, StoreError> {
        let _guard = self.lock.write();
        self.push_if_changed()
    }

    pub async fn sync_async(&self) -> Result<bool, StoreError> {
        let _guard = self.lock.write_async().await;
        self.push_if_changed()
    }

    /// Close the connection, then sync once more.
    pub fn close(self) -> Result<bool, StoreError> {
        let _guard = self.lock.write();
        // Swap in a throwaway handle so the file connection is closed before hashing.
        let old = std::mem::replace(&mut *self.conn.lock(), Connection::open_in_memory()?);
        old.close().map_err(|(_, e)| StoreError::from(e))?;
        self.push_if_changed()
    }

    fn push_if_changed(&self) -> Result<bool, StoreError> {
        let Some(store) = &self.remote else {
            return Ok(false);
        };
        if self.is_memory() || !self.path.exists() {
            return Ok(false);
        }

        let current = checksum(&self.path)?;
        let mut stored = self.checksum.lock();
        if *stored == current {
            return Ok(false);
        }
        store.put(&self.path, &self.remote_key)?;
        *stored = current;
        info!(path = %self.path.display(), key = %self.remote_key, "database pushed to remote");
        Ok(true)
    }
}
