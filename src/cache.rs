use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Byte-addressable store keyed by an opaque string. An absent entry is
/// `Ok(None)`, never an error.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Filesystem cache tier. Keys are hashed with SHA-256 before touching
/// disk, so entries live at `<dir>/<hex-digest>` regardless of what the
/// caller-supplied key contains. Entries are whole-file immutable blobs;
/// nothing here ever deletes them.
pub struct FsCache {
    dir: PathBuf,
}

impl FsCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(hash_key(key))
    }

    /// Total bytes and file count under the cache directory, for the
    /// filesystem gauges.
    pub async fn scan(&self) -> Result<(u64, u64)> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> Result<(u64, u64)> {
            if !dir.exists() {
                return Ok((0, 0));
            }
            let mut size = 0u64;
            let mut count = 0u64;
            let mut stack = vec![dir];
            while let Some(path) = stack.pop() {
                for entry in std::fs::read_dir(path)? {
                    let entry = entry?;
                    let file_type = entry.file_type()?;
                    if file_type.is_symlink() {
                        continue;
                    }
                    if file_type.is_dir() {
                        stack.push(entry.path());
                    } else if let Ok(metadata) = entry.metadata() {
                        size = size.saturating_add(metadata.len());
                        count += 1;
                    }
                }
            }
            Ok((size, count))
        })
        .await?
    }
}

#[async_trait]
impl Cache for FsCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.entry_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context("read cache entry"),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("create cache directory")?;
        let path = self.entry_path(key);
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("cache");
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        let temp_path = self.dir.join(format!(".{file_name}.tmp-{nonce}"));
        if let Err(err) = tokio::fs::write(&temp_path, data).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err).context("write cache entry");
        }
        if let Err(err) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err).context("commit cache entry");
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match tokio::fs::metadata(self.entry_path(key)).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context("stat cache entry"),
        }
    }
}

/// Disabled cache tier: every read misses, every write is discarded.
pub struct NoopCache;

#[async_trait]
impl Cache for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn put(&self, _key: &str, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }
}

pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Read-through memoization: return the cached value, or run `fetch`,
/// store its result, and return it. `fetch` errors pass through without
/// touching the cache; write failures after a successful fetch are logged
/// and the value is served anyway.
pub async fn get_cached_or_fetch<F, Fut, E>(
    cache: &dyn Cache,
    key: &str,
    fetch: F,
) -> Result<Vec<u8>, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<u8>, E>>,
    E: From<anyhow::Error>,
{
    if let Some(cached) = cache
        .get(key)
        .await
        .with_context(|| format!("cache read for {key:?}"))
        .map_err(E::from)?
    {
        debug!(key, size = cached.len(), "cache hit");
        return Ok(cached);
    }
    debug!(key, "cache miss");
    let value = fetch().await?;
    if let Err(err) = cache.put(key, &value).await {
        warn!(error = ?err, key, "cache write failed; serving uncached result");
    }
    Ok(value)
}
