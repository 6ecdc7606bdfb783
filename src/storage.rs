//! Storage endpoint abstraction.
//!
//! Blocks and chunks persist through this trait, allowing different
//! backends behind a consistent key-to-bytes surface. Two backends are
//! provided: an in-memory map for tests and subset staging, and a
//! directory-backed endpoint for local output.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{CloudtreeError, Result};

/// Key-to-bytes storage surface consumed by blocks and chunks.
pub trait Endpoint: Send + Sync {
    /// Overwrite or create the value at `key`.
    fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Read the value at `key`; `NotFound` if absent.
    fn get(&self, key: &str) -> Result<Bytes>;

    /// Existence and length probe. `Ok(None)` means the key is absent;
    /// errors are real I/O failures.
    fn try_size(&self, key: &str) -> Result<Option<u64>>;
}

/// In-memory endpoint backed by a key-ordered map.
#[derive(Debug, Default)]
pub struct MemoryEndpoint {
    data: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryEndpoint {
    pub fn new() -> MemoryEndpoint {
        MemoryEndpoint::default()
    }

    /// All keys currently stored, in order.
    pub fn keys(&self) -> Vec<String> {
        self.data.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl Endpoint for MemoryEndpoint {
    fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.data.lock().insert(key.to_string(), data);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Bytes> {
        self.data
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| CloudtreeError::NotFound(key.to_string()))
    }

    fn try_size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.data.lock().get(key).map(|data| data.len() as u64))
    }
}

/// A view of another endpoint with every key prefixed, e.g. `"h/"` for
/// the hierarchy's block directory.
pub struct SubEndpoint {
    inner: Arc<dyn Endpoint>,
    prefix: String,
}

impl SubEndpoint {
    pub fn new(inner: Arc<dyn Endpoint>, prefix: &str) -> SubEndpoint {
        SubEndpoint {
            inner,
            prefix: prefix.to_string(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

impl Endpoint for SubEndpoint {
    fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.inner.put(&self.key(key), data)
    }

    fn get(&self, key: &str) -> Result<Bytes> {
        self.inner.get(&self.key(key))
    }

    fn try_size(&self, key: &str) -> Result<Option<u64>> {
        self.inner.try_size(&self.key(key))
    }
}

/// Endpoint over a local directory: one file per key.
#[derive(Debug)]
pub struct FsEndpoint {
    root: PathBuf,
}

impl FsEndpoint {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<FsEndpoint> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(FsEndpoint { root })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl Endpoint for FsEndpoint {
    fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &data)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Bytes> {
        match fs::read(self.path(key)) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(CloudtreeError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_size(&self, key: &str) -> Result<Option<u64>> {
        match fs::metadata(self.path(key)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
