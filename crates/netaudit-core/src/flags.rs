//! Durable in-flight flags
//!
//! A flag marks "a job was started for this key and its outcome has not been
//! observed yet". It is written before the start call goes out and cleared on
//! the terminal outcome, so a process that restarts in between still knows to
//! resume polling.
//!
//! Writes are synchronous: once `set` returns, a subsequent `get` (from this
//! or a freshly opened store on the same file) sees the flag.

use crate::error::FlagStoreError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Stored value for a set flag
const FLAG_VALUE: &str = "true";

/// Key → boolean store that survives restarts
pub trait FlagStore: Send + Sync + Debug {
    /// Mark `key` as in flight
    fn set(&self, key: &str) -> Result<(), FlagStoreError>;

    /// Remove `key`
    fn clear(&self, key: &str) -> Result<(), FlagStoreError>;

    /// Whether `key` is in flight
    fn get(&self, key: &str) -> bool;

    /// All keys currently set, sorted
    fn keys(&self) -> Vec<String>;
}

/// In-process flag store
#[derive(Debug, Default)]
pub struct MemoryFlagStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryFlagStore {
    /// Create an empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlagStore for MemoryFlagStore {
    fn set(&self, key: &str) -> Result<(), FlagStoreError> {
        self.entries
            .lock()
            .insert(key.to_string(), FLAG_VALUE.to_string());
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), FlagStoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn get(&self, key: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|value| value == FLAG_VALUE)
    }

    fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}

/// Flag store backed by a flat JSON object on disk
///
/// Every mutation rewrites the whole file through a temp file + rename, so a
/// crash mid-write leaves either the old or the new contents.
#[derive(Debug)]
pub struct FileFlagStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileFlagStore {
    /// Open (or lazily create) the store at `path`
    ///
    /// # Errors
    /// - `FlagStoreError::Io` if the file exists but cannot be read
    /// - `FlagStoreError::Serialization` if it is not a JSON object of strings
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FlagStoreError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => {
                let mut parsed: BTreeMap<String, String> = serde_json::from_str(&raw)?;
                parsed.retain(|_, value| value == FLAG_VALUE);
                parsed
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(path = %path.display(), flags = entries.len(), "opened flag store");

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Backing file
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), FlagStoreError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, entries)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl FlagStore for FileFlagStore {
    fn set(&self, key: &str) -> Result<(), FlagStoreError> {
        let mut entries = self.entries.lock();
        let previous = entries.insert(key.to_string(), FLAG_VALUE.to_string());
        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(value) => entries.insert(key.to_string(), value),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), FlagStoreError> {
        let mut entries = self.entries.lock();
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }

    fn get(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}
