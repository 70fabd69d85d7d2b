//! Derived-output cache.
//!
//! Entries are keyed by source identity, dither algorithm and luminance
//! threshold only. An entry written under one contrast or blur setting is
//! returned for any other; nothing here invalidates entries.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::dither::DitherType;
use crate::error::{ProcessError, ProcessResult};

/// Keys longer than this are shortened with a digest suffix.
const MAX_KEY_LEN: usize = 200;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// `Ok(None)` on a miss.
    async fn get(&self, key: &str) -> ProcessResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, bytes: &[u8]) -> ProcessResult<()>;
}

/// Threshold as it appears in a key: at most two decimals, trailing zeros dropped.
fn format_threshold(threshold: f32) -> String {
    let s = format!("{threshold:.2}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

/// Build the storage key for a derived output.
///
/// Every character outside `[A-Za-z0-9]` becomes `_`, so keys are safe as
/// file names on any platform.
pub fn cache_key(identity: &str, dither: DitherType, threshold: f32) -> String {
    let raw = format!("{identity}_{dither}_{}", format_threshold(threshold));
    let mut key: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if key.len() > MAX_KEY_LEN {
        let digest = hex::encode(Sha256::digest(raw.as_bytes()));
        key.truncate(MAX_KEY_LEN - 17);
        key.push('_');
        key.push_str(&digest[..16]);
    }
    key
}

/// One file per key under a directory, created on first write.
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    dir: PathBuf,
}

impl FsCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

// Each write gets its own uniquely named temp file in the cache dir, then is
// renamed over the entry, so concurrent writers of one key never interleave.
fn write_entry(dir: &Path, path: &Path, bytes: &[u8]) -> ProcessResult<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| ProcessError::Cache(format!("create {}: {e}", dir.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| ProcessError::Cache(format!("temp file in {}: {e}", dir.display())))?;
    tmp.write_all(bytes)
        .map_err(|e| ProcessError::Cache(format!("write {}: {e}", tmp.path().display())))?;
    tmp.persist(path)
        .map_err(|e| ProcessError::Cache(format!("rename to {}: {}", path.display(), e.error)))?;
    Ok(())
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn get(&self, key: &str) -> ProcessResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.entry_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProcessError::Cache(e.to_string())),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> ProcessResult<()> {
        let dir = self.dir.clone();
        let path = self.entry_path(key);
        let owned = bytes.to_vec();
        tokio::task::spawn_blocking(move || write_entry(&dir, &path, &owned))
            .await
            .map_err(|e| ProcessError::Cache(format!("cache writer task: {e}")))??;
        tracing::debug!(key = %key, bytes = bytes.len(), "cached derived output");
        Ok(())
    }
}

/// Process-local store used when the on-disk cache is disabled.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> ProcessResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> ProcessResult<()> {
        self.entries.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}
