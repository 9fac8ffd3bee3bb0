//! Disk Cache (§4.4): a content-addressed blob store on disk with
//! LRU-style eviction under a max-bytes budget.
//!
//! Layout: `<dir>/<key>` for finalized blobs, `<dir>/.tmp/<key>` for
//! in-progress writes. `.tmp` is purged on startup.

mod index;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex as SyncMutex;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncWriteExt};
use tokio::sync::{OwnedRwLockReadGuard, RwLock as AsyncRwLock};
use tracing::{debug, instrument, warn};

use crate::error::CacheError;
use index::{Index, ItemMeta};

const CHUNK_SIZE: usize = 1024 * 1024;

/// Blocking mode waits (and propagates failure) when space can't be made;
/// async mode schedules eviction concurrently with the write and merely
/// logs an unmet budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictMode {
    Blocking,
    Async,
}

struct Shared {
    dir: PathBuf,
    max_size: Option<u64>,
    mode: EvictMode,
    index: SyncMutex<Index>,
    key_locks: SyncMutex<HashMap<String, Arc<AsyncRwLock<()>>>>,
}

#[derive(Clone)]
pub struct DiskCache(Arc<Shared>);

impl DiskCache {
    #[instrument(skip_all, fields(dir = %dir.as_ref().display(), max_size))]
    pub async fn open(
        dir: impl AsRef<Path>,
        max_size: i64,
        mode: EvictMode,
    ) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        if dir.as_os_str().is_empty() {
            return Err(CacheError::InvalidOptions("cache dir is empty".into()));
        }
        if max_size < 0 {
            return Err(CacheError::InvalidOptions(
                "max_size must not be negative".into(),
            ));
        }
        let max_size = if max_size == 0 {
            None
        } else {
            Some(max_size as u64)
        };

        fs::create_dir_all(&dir).await?;
        let tmp_dir = dir.join(".tmp");
        if fs::try_exists(&tmp_dir).await? {
            fs::remove_dir_all(&tmp_dir).await?;
        }
        fs::create_dir_all(&tmp_dir).await?;

        let mut index = Index::default();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            index.insert(
                name,
                ItemMeta {
                    size: meta.len(),
                    mod_time: meta.modified().unwrap_or(SystemTime::now()),
                },
            );
        }
        debug!(items = index.len(), bytes = index.current_size(), "disk cache index loaded");

        Ok(Self(Arc::new(Shared {
            dir,
            max_size,
            mode,
            index: SyncMutex::new(index),
            key_locks: SyncMutex::new(HashMap::new()),
        })))
    }

    fn final_path(&self, key: &str) -> PathBuf {
        self.0.dir.join(key)
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.0.dir.join(".tmp").join(key)
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncRwLock<()>> {
        self.0
            .key_locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncRwLock::new(())))
            .clone()
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.index.lock().contains(key)
    }

    /// Size in bytes of a finalized blob, if it is cached.
    pub fn size_of(&self, key: &str) -> Option<u64> {
        self.0.index.lock().get(key).map(|meta| meta.size)
    }

    pub fn current_size(&self) -> u64 {
        self.0.index.lock().current_size()
    }

    /// Open an existing blob for reading. The returned [`CacheReader`]
    /// holds a shared read lease for as long as it lives, which blocks
    /// eviction of this key.
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<CacheReader, CacheError> {
        let lock = self.key_lock(key);
        let guard = lock.read_owned().await;

        if !self.has(key) {
            return Err(CacheError::ItemNotFound(key.to_string()));
        }

        let now = SystemTime::now();
        self.0.index.lock().touch(key, now);
        let path = self.final_path(key);
        let file = fs::File::open(&path).await?;
        let _ = file.set_modified(now.into()).await;

        Ok(CacheReader {
            _lease: guard,
            file,
        })
    }

    /// Stream `source` into the cache under `key`, evicting as necessary,
    /// then return a reader over the freshly written blob.
    #[instrument(skip(self, source))]
    pub async fn set_with_reader(
        &self,
        key: &str,
        mut source: impl AsyncRead + Unpin,
    ) -> Result<CacheReader, CacheError> {
        let lock = self.key_lock(key);
        let _write_guard = lock.write().await;

        let tmp_path = self.tmp_path(key);
        let mut tmp_file = fs::File::create(&tmp_path).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut written: u64 = 0;
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            tmp_file.write_all(&buf[..n]).await?;
            written += n as u64;
        }
        tmp_file.sync_all().await?;
        drop(tmp_file);

        if let Err(e) = self.make_space(written, key) {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        let final_path = self.final_path(key);
        fs::rename(&tmp_path, &final_path).await?;

        let now = SystemTime::now();
        self.0.index.lock().insert(
            key.to_string(),
            ItemMeta {
                size: written,
                mod_time: now,
            },
        );

        drop(_write_guard);
        self.get(key).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let lock = self.key_lock(key);
        let _guard = lock.write().await;
        if self.0.index.lock().remove(key).is_none() {
            return Err(CacheError::ItemNotFound(key.to_string()));
        }
        fs::remove_file(self.final_path(key)).await?;
        Ok(())
    }

    /// Evict victims (LRU by mod-time) until `current_size + required <=
    /// max_size`, or fail/log depending on [`EvictMode`].
    fn make_space(&self, required: u64, writing_key: &str) -> Result<(), CacheError> {
        let Some(max_size) = self.0.max_size else {
            return Ok(());
        };

        let mut busy: std::collections::HashSet<String> = std::collections::HashSet::new();
        loop {
            let current = self.0.index.lock().current_size();
            if current + required <= max_size {
                return Ok(());
            }

            let victim = {
                let index = self.0.index.lock();
                index.lru_victim(|k| k == writing_key || busy.contains(k))
            };

            let Some(victim) = victim else {
                return self.unmet_budget(required, current, max_size);
            };

            match self.evict_one(&victim) {
                Ok(()) => continue,
                // Held by a live reader: skip it and try the next-oldest
                // candidate rather than spinning forever on the same key.
                Err(EvictAttempt::Busy) => {
                    busy.insert(victim);
                    continue;
                }
                Err(EvictAttempt::Io(e)) => return Err(e.into()),
            }
        }
    }

    fn unmet_budget(&self, required: u64, current: u64, max_size: u64) -> Result<(), CacheError> {
        match self.0.mode {
            EvictMode::Blocking => Err(CacheError::CouldNotMakeSpace {
                needed: current + required,
                max: max_size,
            }),
            EvictMode::Async => {
                warn!(
                    current,
                    required, max_size, "could not evict enough to satisfy budget; continuing anyway"
                );
                Ok(())
            }
        }
    }

    fn evict_one(&self, key: &str) -> Result<(), EvictAttempt> {
        let lock = self.key_lock(key);
        let _guard = lock.try_write().map_err(|_| EvictAttempt::Busy)?;
        let removed = self.0.index.lock().remove(key);
        if removed.is_some() {
            let path = self.final_path(key);
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(EvictAttempt::Io(e));
                }
            }
            debug!(key, "evicted");
        }
        Ok(())
    }
}

enum EvictAttempt {
    Busy,
    Io(std::io::Error),
}

pub struct CacheReader {
    _lease: OwnedRwLockReadGuard<()>,
    file: fs::File,
}

impl AsyncRead for CacheReader {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.file).poll_read(cx, buf)
    }
}

impl AsyncSeek for CacheReader {
    fn start_seek(self: std::pin::Pin<&mut Self>, position: std::io::SeekFrom) -> std::io::Result<()> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.file).start_seek(position)
    }

    fn poll_complete(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<u64>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.file).poll_complete(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 0, EvictMode::Blocking).await.unwrap();
        cache
            .set_with_reader("k1", std::io::Cursor::new(b"hello".to_vec()))
            .await
            .unwrap();
        let mut reader = cache.get("k1").await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn eviction_under_budget_removes_lru() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 10, EvictMode::Blocking).await.unwrap();
        cache
            .set_with_reader("a", std::io::Cursor::new(vec![0u8; 6]))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache
            .set_with_reader("b", std::io::Cursor::new(vec![0u8; 5]))
            .await
            .unwrap();

        assert!(!cache.has("a"));
        assert!(cache.has("b"));
        assert_eq!(cache.current_size(), 5);
    }

    #[tokio::test]
    async fn blocking_mode_fails_when_no_victim_available() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 5, EvictMode::Blocking).await.unwrap();
        cache
            .set_with_reader("a", std::io::Cursor::new(vec![0u8; 5]))
            .await
            .unwrap();
        let _reader = cache.get("a").await.unwrap(); // holds the read lease

        let result = cache
            .set_with_reader("b", std::io::Cursor::new(vec![0u8; 5]))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn async_mode_logs_and_continues_over_budget() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 5, EvictMode::Async).await.unwrap();
        cache
            .set_with_reader("a", std::io::Cursor::new(vec![0u8; 5]))
            .await
            .unwrap();
        let _reader = cache.get("a").await.unwrap();

        let result = cache
            .set_with_reader("b", std::io::Cursor::new(vec![0u8; 5]))
            .await;
        assert!(result.is_ok());
        assert!(cache.has("b"));
    }

    #[tokio::test]
    async fn startup_scans_existing_blobs_and_clears_tmp() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = DiskCache::open(dir.path(), 0, EvictMode::Blocking).await.unwrap();
            cache
                .set_with_reader("k", std::io::Cursor::new(b"xy".to_vec()))
                .await
                .unwrap();
        }
        let tmp_marker = dir.path().join(".tmp").join("stale");
        tokio::fs::write(&tmp_marker, b"leftover").await.unwrap();

        let cache2 = DiskCache::open(dir.path(), 0, EvictMode::Blocking).await.unwrap();
        assert!(cache2.has("k"));
        assert_eq!(cache2.current_size(), 2);
        assert!(!tokio::fs::try_exists(&tmp_marker).await.unwrap());
    }
}
