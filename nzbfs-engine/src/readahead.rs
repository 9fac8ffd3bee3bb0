//! Adaptive Read-Ahead Cache (§4.7): a sequential look-ahead wrapper in
//! front of any seekable [`Resource`], sized by measured read speed and
//! bounded by a [`CircularBuffer`].

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, ReadBuf};
use tokio::sync::Mutex as AsyncMutex;

use crate::resource::{resolve_seek, Reader, Resource};
use crate::ringbuffer::CircularBuffer;

#[derive(Debug, Clone)]
pub struct ReadAheadConfig {
    pub avg_speed_window: Duration,
    pub read_ahead_horizon: Duration,
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub low_water_bytes: u64,
}

impl Default for ReadAheadConfig {
    fn default() -> Self {
        Self {
            avg_speed_window: Duration::from_secs(5),
            read_ahead_horizon: Duration::from_secs(2),
            min_bytes: 1 << 20,
            max_bytes: 32 << 20,
            low_water_bytes: 1 << 19,
        }
    }
}

pub struct ReadAheadResource {
    source: Arc<dyn Resource>,
    config: ReadAheadConfig,
}

impl ReadAheadResource {
    pub fn new(source: Arc<dyn Resource>, config: ReadAheadConfig) -> Self {
        Self { source, config }
    }
}

#[async_trait]
impl Resource for ReadAheadResource {
    async fn open(&self) -> io::Result<Box<dyn Reader>> {
        let upstream = self.source.open().await?;
        Ok(Box::new(ReadAheadReader::new(
            upstream,
            self.config.clone(),
            self.source.clone(),
        )))
    }

    fn size(&self) -> u64 {
        self.source.size()
    }

    fn is_size_accurate(&self) -> bool {
        self.source.is_size_accurate()
    }
}

struct Shared {
    upstream: AsyncMutex<Box<dyn Reader>>,
    ring: CircularBuffer,
    history: SyncMutex<VecDeque<(Instant, u64)>>,
    eof: AtomicBool,
    running: AtomicBool,
    config: ReadAheadConfig,
    source: Arc<dyn Resource>,
}

fn record_read_request(shared: &Shared, n: u64) {
    let mut history = shared.history.lock().unwrap();
    history.push_back((Instant::now(), n));
    let window = shared.config.avg_speed_window;
    let now = Instant::now();
    while let Some((t, _)) = history.front() {
        if now.duration_since(*t) > window {
            history.pop_front();
        } else {
            break;
        }
    }
}

fn desired_fill_bytes(shared: &Shared) -> u64 {
    let history = shared.history.lock().unwrap();
    let now = Instant::now();
    let window = shared.config.avg_speed_window;
    let total: u64 = history
        .iter()
        .filter(|(t, _)| now.duration_since(*t) <= window)
        .map(|(_, n)| *n)
        .sum();
    drop(history);
    let window_secs = window.as_secs_f64().max(0.001);
    let avg_speed = total as f64 / window_secs;
    let horizon_secs = shared.config.read_ahead_horizon.as_secs_f64();
    let desired = (avg_speed * horizon_secs).round() as u64;
    desired.clamp(shared.config.min_bytes, shared.config.max_bytes.max(shared.config.min_bytes))
}

async fn run_read_ahead(shared: Arc<Shared>, upstream_pos: Arc<AtomicU64>) {
    let current_len = shared.ring.len().await as u64;
    if current_len >= shared.config.low_water_bytes {
        shared.running.store(false, Ordering::SeqCst);
        return;
    }
    let desired = desired_fill_bytes(&shared);
    let want = desired.saturating_sub(current_len).max(1);
    shared.ring.ensure_capacity((current_len + want) as usize).await;

    let mut buf = vec![0u8; want as usize];
    let mut upstream = shared.upstream.lock().await;
    let result = upstream.read(&mut buf).await;
    drop(upstream);

    match result {
        Ok(0) => {
            shared.eof.store(true, Ordering::SeqCst);
            shared.ring.close().await;
        }
        Ok(n) => {
            buf.truncate(n);
            upstream_pos.fetch_add(n as u64, Ordering::SeqCst);
            if let Err(e) = shared.ring.try_write(&buf).await {
                tracing::warn!(error = %e, "read-ahead fill dropped: ring rejected committed bytes");
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "read-ahead fetch from upstream failed");
        }
    }
    shared.running.store(false, Ordering::SeqCst);
}

fn maybe_spawn_read_ahead(shared: Arc<Shared>, upstream_pos: Arc<AtomicU64>) {
    if shared.eof.load(Ordering::SeqCst) {
        return;
    }
    if shared.running.swap(true, Ordering::SeqCst) {
        return;
    }
    tokio::spawn(async move {
        run_read_ahead(shared, upstream_pos).await;
    });
}

async fn do_seek(
    shared: Arc<Shared>,
    upstream_pos: Arc<AtomicU64>,
    logical_pos: u64,
    whence: io::SeekFrom,
) -> io::Result<u64> {
    let size = if shared.source.is_size_accurate() {
        Some(shared.source.size())
    } else {
        None
    };
    let target = resolve_seek(whence, logical_pos, size)?;

    let ring_len = shared.ring.len().await as u64;
    if target >= logical_pos && target - logical_pos <= ring_len {
        shared.ring.discard((target - logical_pos) as usize).await;
    } else {
        shared.ring.clear().await;
        shared.history.lock().unwrap().clear();
        shared.eof.store(false, Ordering::SeqCst);
        let mut upstream = shared.upstream.lock().await;
        upstream.seek(io::SeekFrom::Start(target)).await?;
        upstream_pos.store(target, Ordering::SeqCst);
    }
    maybe_spawn_read_ahead(shared.clone(), upstream_pos);
    Ok(target)
}

type ReadFut = Pin<Box<dyn Future<Output = Vec<u8>> + Send>>;
type SeekFut = Pin<Box<dyn Future<Output = io::Result<u64>> + Send>>;

/// At most one in-flight read-ahead fill per reader (`Shared::running`), and
/// no data loss across seeks: a cache-invalidating seek always re-seeks the
/// upstream to the exact target before resuming (§4.7 guarantees).
pub struct ReadAheadReader {
    shared: Arc<Shared>,
    upstream_pos: Arc<AtomicU64>,
    logical_pos: u64,
    read_fut: Option<ReadFut>,
    seek_fut: Option<SeekFut>,
    pending_seek: Option<io::SeekFrom>,
    leftover: Vec<u8>,
    leftover_pos: usize,
}

impl ReadAheadReader {
    fn new(upstream: Box<dyn Reader>, config: ReadAheadConfig, source: Arc<dyn Resource>) -> Self {
        let min = config.min_bytes.max(1);
        let max = config.max_bytes.max(min);
        let shared = Arc::new(Shared {
            upstream: AsyncMutex::new(upstream),
            ring: CircularBuffer::new(min as usize, max as usize),
            history: SyncMutex::new(VecDeque::new()),
            eof: AtomicBool::new(false),
            running: AtomicBool::new(false),
            config,
            source,
        });
        Self {
            shared,
            upstream_pos: Arc::new(AtomicU64::new(0)),
            logical_pos: 0,
            read_fut: None,
            seek_fut: None,
            pending_seek: None,
            leftover: Vec::new(),
            leftover_pos: 0,
        }
    }
}

impl AsyncRead for ReadAheadReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.leftover_pos < this.leftover.len() {
            let n = out.remaining().min(this.leftover.len() - this.leftover_pos);
            out.put_slice(&this.leftover[this.leftover_pos..this.leftover_pos + n]);
            this.leftover_pos += n;
            this.logical_pos += n as u64;
            return Poll::Ready(Ok(()));
        }

        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if this.read_fut.is_none() {
            let want = out.remaining();
            record_read_request(&this.shared, want as u64);
            maybe_spawn_read_ahead(this.shared.clone(), this.upstream_pos.clone());
            let shared = this.shared.clone();
            this.read_fut = Some(Box::pin(async move {
                let mut tmp = vec![0u8; want];
                let n = shared.ring.read(&mut tmp).await;
                tmp.truncate(n);
                tmp
            }));
        }

        let fut = this.read_fut.as_mut().unwrap();
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(data) => {
                this.read_fut = None;
                let n = data.len().min(out.remaining());
                out.put_slice(&data[..n]);
                this.logical_pos += n as u64;
                if n < data.len() {
                    this.leftover_pos = n;
                    this.leftover = data;
                } else {
                    this.leftover.clear();
                    this.leftover_pos = 0;
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl AsyncSeek for ReadAheadReader {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        this.read_fut = None;
        this.leftover.clear();
        this.leftover_pos = 0;
        this.pending_seek = Some(position);
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.get_mut();
        if this.seek_fut.is_none() {
            let Some(position) = this.pending_seek.take() else {
                return Poll::Ready(Ok(this.logical_pos));
            };
            let shared = this.shared.clone();
            let upstream_pos = this.upstream_pos.clone();
            let logical_pos = this.logical_pos;
            this.seek_fut = Some(Box::pin(do_seek(shared, upstream_pos, logical_pos, position)));
        }

        let fut = this.seek_fut.as_mut().unwrap();
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.seek_fut = None;
                if let Ok(new_pos) = result {
                    this.logical_pos = new_pos;
                }
                Poll::Ready(result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};

    struct VecResource(Vec<u8>);

    #[async_trait]
    impl Resource for VecResource {
        async fn open(&self) -> io::Result<Box<dyn Reader>> {
            Ok(Box::new(io::Cursor::new(self.0.clone())))
        }

        fn size(&self) -> u64 {
            self.0.len() as u64
        }
    }

    fn test_config() -> ReadAheadConfig {
        ReadAheadConfig {
            avg_speed_window: Duration::from_millis(200),
            read_ahead_horizon: Duration::from_millis(200),
            min_bytes: 4,
            max_bytes: 64,
            low_water_bytes: 2,
        }
    }

    #[tokio::test]
    async fn reads_full_stream_sequentially() {
        let data: Vec<u8> = (0..200u32).map(|b| b as u8).collect();
        let source = Arc::new(VecResource(data.clone()));
        let res = ReadAheadResource::new(source, test_config());
        let mut reader = res.open().await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn seek_forward_within_ring_then_read() {
        let data = b"0123456789ABCDEF".to_vec();
        let source = Arc::new(VecResource(data.clone()));
        let res = ReadAheadResource::new(source, test_config());
        let mut reader = res.open().await.unwrap();
        let mut first = [0u8; 4];
        reader.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"0123");
        reader.seek(io::SeekFrom::Start(8)).await.unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"89ABCDEF");
    }

    #[tokio::test]
    async fn seek_backward_reseeks_upstream() {
        let data = b"0123456789ABCDEF".to_vec();
        let source = Arc::new(VecResource(data.clone()));
        let res = ReadAheadResource::new(source, test_config());
        let mut reader = res.open().await.unwrap();
        let mut first = [0u8; 10];
        reader.read_exact(&mut first).await.unwrap();
        reader.seek(io::SeekFrom::Start(2)).await.unwrap();
        let mut rest = [0u8; 4];
        reader.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"2345");
    }

    #[tokio::test]
    async fn read_past_end_yields_eof() {
        let data = b"abc".to_vec();
        let source = Arc::new(VecResource(data));
        let res = ReadAheadResource::new(source, test_config());
        let mut reader = res.open().await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abc");
        let mut extra = [0u8; 1];
        assert_eq!(reader.read(&mut extra).await.unwrap(), 0);
    }
}
