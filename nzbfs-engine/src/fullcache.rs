//! Full-Cache Resource (§4.3): wraps any one-shot [`Resource`] with a
//! keyed, disk-backed blob. The first reader for a key populates the
//! cache; later readers reuse the stored blob. Populate-or-fetch races are
//! serialized by a process-wide map of per-key mutexes (§5, §9) — distinct
//! from the disk cache's own per-blob read/write lock, which instead
//! guards eviction.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use async_trait::async_trait;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::cache::DiskCache;
use crate::resource::{Reader, Resource};

fn populate_locks() -> &'static std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>> {
    static LOCKS: OnceLock<std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| std::sync::Mutex::new(HashMap::new()))
}

fn populate_lock(key: &str) -> Arc<AsyncMutex<()>> {
    populate_locks()
        .lock()
        .unwrap()
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(AsyncMutex::new(())))
        .clone()
}

pub struct FullCacheResource {
    key: String,
    cache: DiskCache,
    source: Arc<dyn Resource>,
}

impl FullCacheResource {
    pub fn new(key: impl Into<String>, cache: DiskCache, source: Arc<dyn Resource>) -> Self {
        Self {
            key: key.into(),
            cache,
            source,
        }
    }
}

#[async_trait]
impl Resource for FullCacheResource {
    async fn open(&self) -> io::Result<Box<dyn Reader>> {
        Ok(Box::new(FullCacheReader::new(
            self.key.clone(),
            self.cache.clone(),
            self.source.clone(),
        )))
    }

    fn size(&self) -> u64 {
        self.cache.size_of(&self.key).unwrap_or_else(|| self.source.size())
    }

    fn is_size_accurate(&self) -> bool {
        self.cache.has(&self.key) || self.source.is_size_accurate()
    }
}

type OpenFuture = Pin<Box<dyn Future<Output = io::Result<Box<dyn Reader>>> + Send>>;

enum State {
    Init,
    Opening(OpenFuture),
    Ready(Box<dyn Reader>),
}

pin_project! {
    pub struct FullCacheReader {
        key: String,
        cache: DiskCache,
        source: Arc<dyn Resource>,
        state: State,
        pending_seek: Option<io::SeekFrom>,
    }
}

impl FullCacheReader {
    fn new(key: String, cache: DiskCache, source: Arc<dyn Resource>) -> Self {
        Self {
            key,
            cache,
            source,
            state: State::Init,
            pending_seek: None,
        }
    }
}

#[instrument(level = "debug", skip(cache, source), fields(%key))]
async fn populate_and_open(
    key: String,
    cache: DiskCache,
    source: Arc<dyn Resource>,
) -> io::Result<Box<dyn Reader>> {
    if cache.has(&key) {
        let reader = cache.get(&key).await?;
        return Ok(Box::new(reader));
    }

    let guard = populate_lock(&key);
    let _permit = guard.lock().await;

    if !cache.has(&key) {
        let source_reader = source.open().await?;
        cache.set_with_reader(&key, source_reader).await?;
    }

    let reader = cache.get(&key).await?;
    Ok(Box::new(reader))
}

/// Drives `state` from `Init`/`Opening` to `Ready`, returning `Pending`
/// until the populate-or-open future completes.
fn poll_ready<'a>(
    cx: &mut Context<'_>,
    key: &str,
    cache: &DiskCache,
    source: &Arc<dyn Resource>,
    state: &'a mut State,
) -> Poll<io::Result<&'a mut Box<dyn Reader>>> {
    loop {
        match state {
            State::Init => {
                let fut = Box::pin(populate_and_open(key.to_string(), cache.clone(), source.clone()));
                *state = State::Opening(fut);
            }
            State::Opening(fut) => match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(reader)) => *state = State::Ready(reader),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            },
            State::Ready(_) => {
                let State::Ready(reader) = state else {
                    unreachable!()
                };
                return Poll::Ready(Ok(reader));
            }
        }
    }
}

impl AsyncRead for FullCacheReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let reader = match poll_ready(cx, this.key, this.cache, this.source, this.state) {
            Poll::Ready(Ok(r)) => r,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };
        Pin::new(reader.as_mut()).poll_read(cx, buf)
    }
}

impl AsyncSeek for FullCacheReader {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        let this = self.project();
        match this.state {
            State::Ready(reader) => Pin::new(reader.as_mut()).start_seek(position),
            _ => {
                // Pre-population: defer. A `SeekEnd` (or any seek) forces
                // the populate-and-open future to run to completion in
                // `poll_complete`, at which point the real size is known.
                *this.pending_seek = Some(position);
                Ok(())
            }
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.project();
        let reader = match poll_ready(cx, this.key, this.cache, this.source, this.state) {
            Poll::Ready(Ok(r)) => r,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };
        if let Some(pos) = this.pending_seek.take() {
            Pin::new(reader.as_mut()).start_seek(pos)?;
        }
        Pin::new(reader.as_mut()).poll_complete(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EvictMode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    struct CountingResource {
        data: Vec<u8>,
        opens: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Resource for CountingResource {
        async fn open(&self) -> io::Result<Box<dyn Reader>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(io::Cursor::new(self.data.clone())))
        }

        fn size(&self) -> u64 {
            self.data.len() as u64
        }

        fn is_size_accurate(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn single_populator_for_concurrent_opens() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 0, EvictMode::Blocking).await.unwrap();
        let opens = Arc::new(AtomicU32::new(0));
        let source = Arc::new(CountingResource {
            data: b"the quick brown fox".to_vec(),
            opens: opens.clone(),
        });
        let fc = FullCacheResource::new("seg-1", cache, source);

        let (a, b) = tokio::join!(
            async {
                let mut r = fc.open().await.unwrap();
                let mut out = Vec::new();
                r.read_to_end(&mut out).await.unwrap();
                out
            },
            async {
                let mut r = fc.open().await.unwrap();
                let mut out = Vec::new();
                r.read_to_end(&mut out).await.unwrap();
                out
            }
        );
        assert_eq!(a, b"the quick brown fox");
        assert_eq!(b, b"the quick brown fox");
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn seek_end_triggers_population() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 0, EvictMode::Blocking).await.unwrap();
        let opens = Arc::new(AtomicU32::new(0));
        let source = Arc::new(CountingResource {
            data: b"0123456789".to_vec(),
            opens,
        });
        let fc = FullCacheResource::new("seg-2", cache, source);
        let mut reader = fc.open().await.unwrap();
        reader.seek(io::SeekFrom::End(-4)).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"6789");
    }
}
