//! Key-value blob stores used for overflow payloads.

use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A key-value store for large binary payloads.
///
/// `put` must not return until the bytes are durable enough that a
/// subsequent `get` (from any thread) observes them.
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the write fails.
    fn put(&self, key: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Fetches the bytes stored under `key`, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Removes `key`. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be modified.
    fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Returns whether `key` is present.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn contains(&self, key: &str) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Lists all keys in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    fn keys(&self) -> StorageResult<Vec<String>>;
}

/// Keys are `/`-separated segments of `[A-Za-z0-9._-]`, never `.` or `..`.
fn validate_key(key: &str) -> StorageResult<()> {
    let invalid = |reason| StorageError::InvalidKey {
        key: key.to_string(),
        reason,
    };
    if key.is_empty() {
        return Err(invalid("empty"));
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(invalid("empty or relative path segment"));
        }
        if !segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        {
            return Err(invalid("unsupported character"));
        }
    }
    Ok(())
}

/// Blob store held in memory, with fault injection for tests.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
    failing_puts: AtomicUsize,
}

impl InMemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls to `put` fail with [`StorageError::Unavailable`].
    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Returns true if no blobs are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    fn take_failure(&self) -> bool {
        self.failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        if self.take_failure() {
            return Err(StorageError::Unavailable(format!("injected put failure for {key}")));
        }
        self.blobs.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        Ok(self.blobs.write().remove(key).is_some())
    }

    fn contains(&self, key: &str) -> StorageResult<bool> {
        Ok(self.blobs.read().contains_key(key))
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.blobs.read().keys().cloned().collect())
    }
}

/// Blob store with one file per key under a root directory.
///
/// Key segments map to subdirectories. Writes go to a temporary sibling file
/// which is synced and then renamed over the target, so readers never see a
/// partially written blob.
#[derive(Debug)]
pub struct DirectoryBlobStore {
    root: PathBuf,
}

const TEMP_SUFFIX: &str = ".partial";

impl DirectoryBlobStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        if key.ends_with(TEMP_SUFFIX) {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "reserved suffix",
            });
        }
        Ok(key.split('/').fold(self.root.clone(), |path, segment| path.join(segment)))
    }
}

fn collect_keys(dir: &Path, prefix: &str, out: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        if entry.file_type()?.is_dir() {
            collect_keys(&entry.path(), &key, out)?;
        } else if !name.ends_with(TEMP_SUFFIX) {
            out.push(key);
        }
    }
    Ok(())
}

impl BlobStore for DirectoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(TEMP_SUFFIX);
        let temp = PathBuf::from(temp_name);
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, key: &str) -> StorageResult<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        collect_keys(&self.root, "", &mut keys)?;
        keys.sort();
        Ok(keys)
    }
}
