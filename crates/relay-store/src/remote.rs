use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::StoreError;

/// Persistent storage that outlives the local filesystem.
///
/// Paths on the remote side are `/`-separated keys; local paths are real files.
pub trait RemoteStore: Send + Sync {
    /// Copy `remote` down to `local`, creating parent directories.
    fn get(&self, remote: &str, local: &Path) -> Result<(), StoreError>;

    /// Copy `local` up to `remote`, replacing any previous version.
    fn put(&self, local: &Path, remote: &str) -> Result<(), StoreError>;

    fn exists(&self, remote: &str) -> Result<bool, StoreError>;
}

/// A [`RemoteStore`] rooted at a local directory. Used for development and tests.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, remote: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.root.clone();
        for part in remote.split('/').filter(|p| !p.is_empty() && *p != ".") {
            if part == ".." {
                return Err(StoreError::Remote(format!("path escapes store root: {remote}")));
            }
            path.push(part);
        }
        Ok(path)
    }
}

impl RemoteStore for LocalDirStore {
    fn get(&self, remote: &str, local: &Path) -> Result<(), StoreError> {
        let source = self.resolve(remote)?;
        if !source.is_file() {
            return Err(StoreError::NotFound(remote.to_string()));
        }
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, local)?;
        tracing::debug!(remote, local = %local.display(), "fetched from remote store");
        Ok(())
    }

    fn put(&self, local: &Path, remote: &str) -> Result<(), StoreError> {
        let target = self.resolve(remote)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(local, &target)?;
        tracing::debug!(remote, local = %local.display(), "pushed to remote store");
        Ok(())
    }

    fn exists(&self, remote: &str) -> Result<bool, StoreError> {
        Ok(self.resolve(remote)?.is_file())
    }
}

/// SHA-256 of a file's contents, read in 8 KiB blocks.
pub fn checksum(path: &Path) -> Result<Vec<u8>, StoreError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}
