//! Blob storage: the key/value surface every piece of pipeline state lives in.
//! `FsBlobStore` maps keys onto a directory; `MemoryBlobStore` keeps everything in RAM.

use crate::util::{create_with_backoff, open_with_backoff, remove_with_backoff, replace_file_atomic_backoff};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("blob already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid blob key: {0:?}")]
    InvalidKey(String),

    #[error("blob {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("storage I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(key: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound(key.to_string())
        } else {
            StoreError::Io { key: key.to_string(), source }
        }
    }
}

/// Key/value object storage.
///
/// Keys are `/`-separated relative names (`"chunks/analysis_1-100.csv"`).
/// Implementations must be shareable across threads; `consolidate` reads in parallel.
pub trait BlobStore: Send + Sync {
    fn exists(&self, key: &str) -> Result<bool, StoreError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    fn put(&self, key: &str, bytes: &[u8], overwrite: bool) -> Result<(), StoreError>;
    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// `get` that maps absence to `None` instead of an error.
    fn get_opt(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.get(key) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ----------------------------- Filesystem -----------------------------------

/// Blob store rooted at a local directory. Writes land in a temp file next to the
/// target and are promoted with an atomic replace, so readers never see half a blob.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let rel = Path::new(key);
        let valid = !key.trim().is_empty()
            && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

impl BlobStore for FsBlobStore {
    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.path_for(key)?.is_file())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        let mut f = open_with_backoff(&path, 16, 50).map_err(|e| StoreError::io(key, e))?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).map_err(|e| StoreError::io(key, e))?;
        Ok(buf)
    }

    fn put(&self, key: &str, bytes: &[u8], overwrite: bool) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if !overwrite && path.is_file() {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(key, e))?;
        }
        let tmp = tmp_path_for(&path);
        let write = || -> io::Result<()> {
            let f = create_with_backoff(&tmp, 16, 50)?;
            let mut w = BufWriter::new(f);
            w.write_all(bytes)?;
            w.flush()?;
            drop(w);
            replace_file_atomic_backoff(&tmp, &path)
        };
        write().map_err(|e| {
            let _ = remove_with_backoff(&tmp, 4, 25);
            StoreError::io(key, e)
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let ent = entry.map_err(|e| StoreError::Io {
                key: prefix.to_string(),
                source: e.into_io_error().unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk failed")),
            })?;
            if !ent.file_type().is_file() {
                continue;
            }
            // in-flight temp files from `put`
            if ent.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(rel) = ent.path().strip_prefix(&self.root) else { continue };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

// ----------------------------- In-memory ------------------------------------

/// In-memory blob store. Besides backing tests, it can simulate transport failures
/// on chosen keys (`fail_key`) and counts writes (`put_count`).
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    failing: Mutex<BTreeSet<String>>,
    puts: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob (builder style).
    pub fn with_blob(self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.blobs.lock().insert(key.into(), bytes.into());
        self
    }

    /// Make every operation touching `key` fail with `StoreError::Io`.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing.lock().insert(key.into());
    }

    pub fn heal_key(&self, key: &str) {
        self.failing.lock().remove(key);
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }

    /// Convenience for assertions: blob as UTF-8 text.
    pub fn text(&self, key: &str) -> Option<String> {
        self.blobs.lock().get(key).map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs.lock().keys().cloned().collect()
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        if self.failing.lock().contains(key) {
            return Err(StoreError::Io {
                key: key.to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionReset, "simulated transport failure"),
            });
        }
        Ok(())
    }
}

impl BlobStore for MemoryBlobStore {
    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check(key)?;
        Ok(self.blobs.lock().contains_key(key))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.check(key)?;
        self.blobs
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn put(&self, key: &str, bytes: &[u8], overwrite: bool) -> Result<(), StoreError> {
        self.check(key)?;
        let mut blobs = self.blobs.lock();
        if !overwrite && blobs.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        blobs.insert(key.to_string(), bytes.to_vec());
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .blobs
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
