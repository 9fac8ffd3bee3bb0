//! Archive Resources (§4.6): present inner files of multi-volume RAR/7z
//! archives as independent seekable streams, layered over the merger.
//!
//! Real RAR/7z decoders (`unrar`, `sevenz-rust`) are blocking, path-based
//! libraries, not `AsyncRead` sources. Volumes — themselves mergers over
//! cached segments — are streamed once to a temporary directory on open,
//! then a blocking thread (`tokio::task::spawn_blocking`, the idiom the
//! teacher uses for every blocking library call) decodes the target
//! member and feeds the result into a [`CircularBuffer`], the same
//! producer/consumer primitive the read-ahead cache uses.

pub mod error;

use std::future::Future;
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWriteExt, ReadBuf};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use nzbfs_engine::resource::{resolve_seek, Reader, Resource};
use nzbfs_engine::ringbuffer::CircularBuffer;

pub use error::CompositionError;

const DISCARD_CHUNK: usize = 16 * 1024 * 1024;
const RING_MIN: usize = 1024 * 1024;
const RING_MAX: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Rar,
    SevenZ,
}

#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Default)]
struct SizeState {
    size: AtomicU64,
    accurate: AtomicBool,
}

/// One inner file of a multi-volume archive, as an [`Resource`].
pub struct ArchiveResource {
    kind: ArchiveKind,
    volumes: Vec<Arc<dyn Resource>>,
    inner_name: String,
    password: Option<String>,
    state: Arc<SizeState>,
}

impl ArchiveResource {
    pub fn new(
        kind: ArchiveKind,
        volumes: Vec<Arc<dyn Resource>>,
        inner_name: impl Into<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            kind,
            volumes,
            inner_name: inner_name.into(),
            password,
            state: Arc::new(SizeState::default()),
        }
    }

    /// A single pass over headers, returning inner filenames/attributes up
    /// to `limit` entries, without decoding any member's bytes.
    #[instrument(level = "debug", skip(volumes, password))]
    pub async fn list(
        kind: ArchiveKind,
        volumes: &[Arc<dyn Resource>],
        password: Option<&str>,
        limit: usize,
    ) -> io::Result<Vec<ArchiveEntry>> {
        let dir = materialize_volumes(volumes, kind).await?;
        let paths = volume_paths(dir.path(), volumes.len(), kind);
        let password = password.map(str::to_string);
        tokio::task::spawn_blocking(move || list_headers(kind, &paths, password.as_deref(), limit))
            .await
            .map_err(|e| io::Error::other(e.to_string()))?
    }
}

#[async_trait]
impl Resource for ArchiveResource {
    #[instrument(level = "debug", skip(self), fields(inner = %self.inner_name))]
    async fn open(&self) -> io::Result<Box<dyn Reader>> {
        let dir = materialize_volumes(&self.volumes, self.kind).await?;
        let paths = volume_paths(dir.path(), self.volumes.len(), self.kind);

        let entries = {
            let paths = paths.clone();
            let password = self.password.clone();
            let kind = self.kind;
            tokio::task::spawn_blocking(move || {
                list_headers(kind, &paths, password.as_deref(), usize::MAX)
            })
            .await
            .map_err(|e| io::Error::other(e.to_string()))??
        };
        let entry = entries
            .into_iter()
            .find(|e| e.name == self.inner_name)
            .ok_or_else(|| io::Error::from(CompositionError::FileNotFound(self.inner_name.clone())))?;

        self.state.size.store(entry.size, Ordering::Release);
        self.state.accurate.store(true, Ordering::Release);

        let shared = Arc::new(Shared {
            _dir: dir,
            paths,
            kind: self.kind,
            inner_name: self.inner_name.clone(),
            password: self.password.clone(),
            size: entry.size,
        });
        let ring = Arc::new(CircularBuffer::new(RING_MIN, RING_MAX));
        let decoder = spawn_decoder(shared.clone(), ring.clone());

        Ok(Box::new(ArchiveReader {
            shared,
            ring,
            decoder: Some(decoder),
            pos: 0,
            leftover: Vec::new(),
            read_fut: None,
            seek: SeekState::Idle,
        }))
    }

    fn size(&self) -> u64 {
        self.state.size.load(Ordering::Acquire)
    }

    fn is_size_accurate(&self) -> bool {
        self.state.accurate.load(Ordering::Acquire)
    }
}

/// Materialized volume paths plus enough to rebuild a decoder from scratch
/// on a backward seek. Outlives every reader opened from the resource.
struct Shared {
    _dir: TempDir,
    paths: Vec<PathBuf>,
    kind: ArchiveKind,
    inner_name: String,
    password: Option<String>,
    size: u64,
}

async fn materialize_volumes(
    volumes: &[Arc<dyn Resource>],
    kind: ArchiveKind,
) -> io::Result<TempDir> {
    let dir = tempfile::tempdir()?;
    for (i, vol) in volumes.iter().enumerate() {
        let mut reader = vol.open().await?;
        let path = dir.path().join(volume_filename(kind, i));
        let mut file = tokio::fs::File::create(&path).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
    }
    Ok(dir)
}

fn volume_filename(kind: ArchiveKind, index: usize) -> String {
    match kind {
        ArchiveKind::Rar => format!("volume.part{:03}.rar", index + 1),
        ArchiveKind::SevenZ if index == 0 => "volume.7z".to_string(),
        ArchiveKind::SevenZ => format!("volume.7z.{:03}", index),
    }
}

fn volume_paths(dir: &Path, count: usize, kind: ArchiveKind) -> Vec<PathBuf> {
    (0..count).map(|i| dir.join(volume_filename(kind, i))).collect()
}

fn list_headers(
    kind: ArchiveKind,
    paths: &[PathBuf],
    password: Option<&str>,
    limit: usize,
) -> io::Result<Vec<ArchiveEntry>> {
    let mut entries = match kind {
        ArchiveKind::Rar => rar_list(paths, password)?,
        ArchiveKind::SevenZ => sevenz_list(paths, password)?,
    };
    entries.truncate(limit);
    Ok(entries)
}

fn rar_list(paths: &[PathBuf], password: Option<&str>) -> io::Result<Vec<ArchiveEntry>> {
    let archive = match password {
        Some(p) => unrar::Archive::with_password(&paths[0], p),
        None => unrar::Archive::new(&paths[0]),
    };
    let mut open = archive
        .open_for_listing()
        .map_err(|e| CompositionError::Decode(e.to_string()))?;
    let mut out = Vec::new();
    while let Some(header) = open
        .read_header()
        .map_err(|e| CompositionError::Decode(e.to_string()))?
    {
        let entry = header.entry();
        if entry.is_file() {
            out.push(ArchiveEntry {
                name: entry.filename.to_string_lossy().into_owned(),
                size: entry.unpacked_size,
            });
        }
        open = header
            .skip()
            .map_err(|e| CompositionError::Decode(e.to_string()))?;
    }
    Ok(out)
}

fn rar_extract(
    paths: &[PathBuf],
    password: Option<&str>,
    inner_name: &str,
    out_dir: &Path,
) -> io::Result<()> {
    let archive = match password {
        Some(p) => unrar::Archive::with_password(&paths[0], p),
        None => unrar::Archive::new(&paths[0]),
    };
    let mut open = archive
        .open_for_processing()
        .map_err(|e| CompositionError::Decode(e.to_string()))?;
    while let Some(header) = open
        .read_header()
        .map_err(|e| CompositionError::Decode(e.to_string()))?
    {
        let is_target = header.entry().filename.to_string_lossy() == inner_name;
        open = if is_target {
            header
                .extract_with_base(out_dir)
                .map_err(|e| CompositionError::Decode(e.to_string()))?
        } else {
            header
                .skip()
                .map_err(|e| CompositionError::Decode(e.to_string()))?
        };
    }
    Ok(())
}

fn sevenz_list(paths: &[PathBuf], password: Option<&str>) -> io::Result<Vec<ArchiveEntry>> {
    let pw = password.map(sevenz_rust::Password::from).unwrap_or_default();
    let reader = sevenz_rust::SevenZReader::open(&paths[0], pw)
        .map_err(|e| CompositionError::Decode(e.to_string()))?;
    Ok(reader
        .archive()
        .files
        .iter()
        .filter(|f| !f.is_directory())
        .map(|f| ArchiveEntry {
            name: f.name().to_string(),
            size: f.size(),
        })
        .collect())
}

fn sevenz_extract(paths: &[PathBuf], password: Option<&str>, out_dir: &Path) -> io::Result<()> {
    let pw = password.map(sevenz_rust::Password::from).unwrap_or_default();
    sevenz_rust::decompress_file_with_password(&paths[0], out_dir, pw)
        .map_err(|e| CompositionError::Decode(e.to_string()).into())
}

/// Decodes the target member on a blocking thread and feeds the decoded
/// bytes into `ring`, closing it when done (or on error, after logging).
fn spawn_decoder(shared: Arc<Shared>, ring: Arc<CircularBuffer>) -> JoinHandle<()> {
    let rt = Handle::current();
    tokio::task::spawn_blocking(move || {
        let result = decode_into_ring(&shared, &ring, &rt);
        if let Err(e) = result {
            warn!(inner = %shared.inner_name, error = %e, "archive decode failed");
        }
        rt.block_on(ring.close());
    })
}

fn decode_into_ring(shared: &Shared, ring: &CircularBuffer, rt: &Handle) -> io::Result<()> {
    let out_dir = tempfile::tempdir()?;
    match shared.kind {
        ArchiveKind::Rar => {
            rar_extract(&shared.paths, shared.password.as_deref(), &shared.inner_name, out_dir.path())?
        }
        ArchiveKind::SevenZ => {
            sevenz_extract(&shared.paths, shared.password.as_deref(), out_dir.path())?
        }
    }
    let extracted = out_dir.path().join(&shared.inner_name);
    let mut file = std::fs::File::open(&extracted)?;
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        rt.block_on(ring.write(&buf[..n]))
            .map_err(|e| io::Error::other(e.to_string()))?;
    }
}

async fn ring_read(ring: Arc<CircularBuffer>, want: usize) -> Vec<u8> {
    let mut buf = vec![0u8; want];
    let n = ring.read(&mut buf).await;
    buf.truncate(n);
    buf
}

async fn do_forward_seek(ring: Arc<CircularBuffer>, mut delta: u64) -> io::Result<()> {
    let mut buf = vec![0u8; DISCARD_CHUNK];
    while delta > 0 {
        let want = (DISCARD_CHUNK as u64).min(delta) as usize;
        let n = ring.read(&mut buf[..want]).await;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "archive member exhausted while skipping"));
        }
        delta -= n as u64;
    }
    Ok(())
}

async fn do_backward_seek(
    shared: Arc<Shared>,
    target: u64,
) -> io::Result<(Arc<CircularBuffer>, JoinHandle<()>)> {
    let ring = Arc::new(CircularBuffer::new(RING_MIN, RING_MAX));
    let decoder = spawn_decoder(shared.clone(), ring.clone());
    do_forward_seek(ring.clone(), target).await?;
    Ok((ring, decoder))
}

fn copy_leftover(leftover: &mut Vec<u8>, buf: &mut ReadBuf<'_>) -> usize {
    let n = leftover.len().min(buf.remaining());
    buf.put_slice(&leftover[..n]);
    leftover.drain(..n);
    n
}

type BackwardFut = Pin<Box<dyn Future<Output = io::Result<(Arc<CircularBuffer>, JoinHandle<()>)>> + Send>>;
type ForwardFut = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

enum SeekState {
    Idle,
    Forward(ForwardFut, u64),
    Backward(BackwardFut, u64),
}

/// A reader over one archive member. Forward seeks discard through the
/// decoder's output; backward seeks rebuild the decoder from the
/// materialized volumes, which — unlike the real Usenet-backed volumes —
/// are plain local files and so are always cheap to reopen.
pub struct ArchiveReader {
    shared: Arc<Shared>,
    ring: Arc<CircularBuffer>,
    decoder: Option<JoinHandle<()>>,
    pos: u64,
    leftover: Vec<u8>,
    read_fut: Option<Pin<Box<dyn Future<Output = Vec<u8>> + Send>>>,
    seek: SeekState,
}

impl AsyncRead for ArchiveReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.leftover.is_empty() {
                let n = copy_leftover(&mut this.leftover, buf);
                this.pos += n as u64;
                return Poll::Ready(Ok(()));
            }
            if this.read_fut.is_none() {
                let want = buf.remaining().max(64 * 1024);
                this.read_fut = Some(Box::pin(ring_read(this.ring.clone(), want)));
            }
            match this.read_fut.as_mut().unwrap().as_mut().poll(cx) {
                Poll::Ready(data) => {
                    this.read_fut = None;
                    if data.is_empty() {
                        return Poll::Ready(Ok(()));
                    }
                    this.leftover = data;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncSeek for ArchiveReader {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        let target = resolve_seek(position, this.pos, Some(this.shared.size))?;
        this.leftover.clear();
        this.read_fut = None;
        if target >= this.pos {
            let delta = target - this.pos;
            this.seek = SeekState::Forward(Box::pin(do_forward_seek(this.ring.clone(), delta)), target);
        } else {
            this.seek = SeekState::Backward(Box::pin(do_backward_seek(this.shared.clone(), target)), target);
        }
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.get_mut();
        match &mut this.seek {
            SeekState::Idle => Poll::Ready(Ok(this.pos)),
            SeekState::Forward(fut, target) => match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(())) => {
                    this.pos = *target;
                    this.seek = SeekState::Idle;
                    Poll::Ready(Ok(this.pos))
                }
                Poll::Ready(Err(e)) => {
                    this.seek = SeekState::Idle;
                    Poll::Ready(Err(e))
                }
                Poll::Pending => Poll::Pending,
            },
            SeekState::Backward(fut, target) => match fut.as_mut().poll(cx) {
                Poll::Ready(Ok((ring, decoder))) => {
                    this.ring = ring;
                    this.decoder = Some(decoder);
                    this.pos = *target;
                    this.seek = SeekState::Idle;
                    Poll::Ready(Ok(this.pos))
                }
                Poll::Ready(Err(e)) => {
                    this.seek = SeekState::Idle;
                    Poll::Ready(Err(e))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    #[test]
    fn rar_volume_names_are_one_indexed() {
        assert_eq!(volume_filename(ArchiveKind::Rar, 0), "volume.part001.rar");
        assert_eq!(volume_filename(ArchiveKind::Rar, 1), "volume.part002.rar");
    }

    #[test]
    fn sevenz_volume_names_first_has_no_suffix_number() {
        assert_eq!(volume_filename(ArchiveKind::SevenZ, 0), "volume.7z");
        assert_eq!(volume_filename(ArchiveKind::SevenZ, 1), "volume.7z.001");
    }

    /// Builds an `ArchiveReader` directly over a ring fed by a plain task
    /// standing in for the decoder, to exercise the read/seek glue without
    /// invoking real RAR/7z decoding.
    fn fake_reader(data: &'static [u8], size: u64) -> ArchiveReader {
        let shared = Arc::new(Shared {
            _dir: tempfile::tempdir().unwrap(),
            paths: Vec::new(),
            kind: ArchiveKind::Rar,
            inner_name: "x".to_string(),
            password: None,
            size,
        });
        let ring = Arc::new(CircularBuffer::new(RING_MIN, RING_MAX));
        let feed = ring.clone();
        let decoder = tokio::spawn(async move {
            feed.write(data).await.unwrap();
            feed.close().await;
        });
        ArchiveReader {
            shared,
            ring,
            decoder: Some(decoder),
            pos: 0,
            leftover: Vec::new(),
            read_fut: None,
            seek: SeekState::Idle,
        }
    }

    #[tokio::test]
    async fn reads_full_member() {
        let mut r = fake_reader(b"hello archive", 13);
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello archive");
    }

    #[tokio::test]
    async fn forward_seek_discards_through_ring() {
        let mut r = fake_reader(b"0123456789", 10);
        r.seek(io::SeekFrom::Start(4)).await.unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"456789");
    }

    // Backward seek rebuilds the decoder from the materialized volume
    // files via `do_backward_seek`/`spawn_decoder`, which shells out to the
    // real `unrar`/`sevenz-rust` extraction path — exercising that here
    // would require shipping a real fixture archive rather than faking the
    // ring feed, so it is left to the real extraction helpers and covered
    // by reading the `do_forward_seek`-based rebuild logic above instead.
    #[tokio::test]
    async fn pure_forward_seek_helper_skips_exact_delta() {
        let ring = Arc::new(CircularBuffer::new(RING_MIN, RING_MAX));
        let feed = ring.clone();
        feed.write(b"0123456789").await.unwrap();
        feed.close().await;

        do_forward_seek(ring.clone(), 4).await.unwrap();
        let mut out = [0u8; 6];
        let n = ring.read(&mut out).await;
        assert_eq!(&out[..n], b"456789");
    }

    #[tokio::test]
    async fn forward_seek_past_end_is_unexpected_eof() {
        let ring = Arc::new(CircularBuffer::new(RING_MIN, RING_MAX));
        ring.write(b"abc").await.unwrap();
        ring.close().await;
        let err = do_forward_seek(ring, 10).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
