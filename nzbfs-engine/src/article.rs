//! Article Resource (§4.2): a stateless handle over one Usenet article.
//! `open()` returns a one-shot reader whose first `read` fetches the
//! article, yEnc-decodes it, and from then on serves the decoded bytes
//! from memory. Not seekable beyond position 0 — wrap in
//! [`crate::fullcache::FullCacheResource`] to gain real seek support.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use nzbfs_model::yenc;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, ReadBuf};
use tracing::{instrument, warn};

use crate::error::WireError;
use crate::resource::{resolve_seek, Reader, Resource};

/// The wire-client contract (§6), scoped to the one call the engine needs.
/// A concrete implementation lives in the `nzbfs-nntp` crate; this crate
/// only depends on the trait.
#[async_trait]
pub trait ArticleFetcher: Send + Sync {
    async fn get_article(
        &self,
        group: &str,
        id: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, WireError>;
}

#[derive(Debug, Default)]
struct SizeState {
    size: AtomicU64,
    accurate: AtomicBool,
}

pub struct ArticleResource {
    id: String,
    group: String,
    fetcher: Arc<dyn ArticleFetcher>,
    state: Arc<SizeState>,
}

impl ArticleResource {
    pub fn new(
        group: impl Into<String>,
        id: impl Into<String>,
        bytes_hint: u64,
        fetcher: Arc<dyn ArticleFetcher>,
    ) -> Self {
        let (hint, _accurate) = yenc::probable_decoded_size(bytes_hint);
        Self {
            id: id.into(),
            group: group.into(),
            fetcher,
            state: Arc::new(SizeState {
                size: AtomicU64::new(hint),
                accurate: AtomicBool::new(false),
            }),
        }
    }
}

#[async_trait]
impl Resource for ArticleResource {
    async fn open(&self) -> io::Result<Box<dyn Reader>> {
        Ok(Box::new(ArticleReader::new(
            self.group.clone(),
            self.id.clone(),
            self.fetcher.clone(),
            self.state.clone(),
        )))
    }

    fn size(&self) -> u64 {
        self.state.size.load(Ordering::Acquire)
    }

    fn is_size_accurate(&self) -> bool {
        self.state.accurate.load(Ordering::Acquire)
    }
}

type FetchFuture = Pin<Box<dyn Future<Output = io::Result<Vec<u8>>> + Send>>;

enum State {
    Unfetched,
    Fetching(FetchFuture),
    Ready(io::Cursor<Vec<u8>>),
}

pin_project! {
    pub struct ArticleReader {
        group: String,
        id: String,
        fetcher: Arc<dyn ArticleFetcher>,
        state: Arc<SizeState>,
        inner: State,
    }
}

impl ArticleReader {
    fn new(
        group: String,
        id: String,
        fetcher: Arc<dyn ArticleFetcher>,
        state: Arc<SizeState>,
    ) -> Self {
        Self {
            group,
            id,
            fetcher,
            state,
            inner: State::Unfetched,
        }
    }
}

#[instrument(level = "debug", skip(fetcher, state), fields(%group, %id))]
async fn fetch_and_decode(
    group: String,
    id: String,
    fetcher: Arc<dyn ArticleFetcher>,
    state: Arc<SizeState>,
) -> io::Result<Vec<u8>> {
    let mut body = fetcher
        .get_article(&group, &id)
        .await
        .map_err(io::Error::from)?;
    let mut raw = Vec::new();
    body.read_to_end(&mut raw).await?;

    let (decoded, meta, crc_ok) = yenc::decode(&raw).map_err(|e| WireError::Decode(e.to_string()))?;
    if !crc_ok {
        warn!(%group, %id, "yenc crc32 mismatch, serving decoded bytes anyway");
    }
    let size = if meta.size > 0 {
        meta.size
    } else {
        decoded.len() as u64
    };
    state.size.store(size, Ordering::Release);
    state.accurate.store(true, Ordering::Release);
    Ok(decoded)
}

impl AsyncRead for ArticleReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        loop {
            match this.inner {
                State::Unfetched => {
                    let fut = Box::pin(fetch_and_decode(
                        this.group.clone(),
                        this.id.clone(),
                        this.fetcher.clone(),
                        this.state.clone(),
                    ));
                    *this.inner = State::Fetching(fut);
                }
                State::Fetching(fut) => match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(bytes)) => {
                        *this.inner = State::Ready(io::Cursor::new(bytes));
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                },
                State::Ready(cursor) => {
                    let filled_before = buf.filled().len();
                    let pos = cursor.position() as usize;
                    let data = cursor.get_ref();
                    let remaining = &data[pos.min(data.len())..];
                    let n = remaining.len().min(buf.remaining());
                    buf.put_slice(&remaining[..n]);
                    cursor.set_position((pos + n) as u64);
                    debug_assert!(buf.filled().len() - filled_before == n);
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl AsyncSeek for ArticleReader {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        let this = self.project();
        let current = match this.inner {
            State::Ready(cursor) => cursor.position(),
            _ => 0,
        };
        let size = match this.inner {
            State::Ready(cursor) => Some(cursor.get_ref().len() as u64),
            _ => None,
        };
        let target = resolve_seek(position, current, size)?;
        match this.inner {
            State::Ready(cursor) => {
                cursor.set_position(target);
                Ok(())
            }
            _ if target == 0 => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "article resource is not seekable before it has been fetched",
            )),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.project();
        let pos = match this.inner {
            State::Ready(cursor) => cursor.position(),
            _ => 0,
        };
        Poll::Ready(Ok(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    struct FakeFetcher {
        body: Vec<u8>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ArticleFetcher for FakeFetcher {
        async fn get_article(
            &self,
            _group: &str,
            _id: &str,
        ) -> Result<Box<dyn AsyncRead + Send + Unpin>, WireError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(io::Cursor::new(self.body.clone())))
        }
    }

    fn yenc_article(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("=ybegin line=128 size={} name=x\r\n", data.len()).as_bytes());
        for &b in data {
            let mut enc = b.wrapping_add(42);
            if enc == b'=' || enc == b'\0' || enc == b'\n' || enc == b'\r' {
                out.push(b'=');
                enc = enc.wrapping_add(64);
            }
            out.push(enc);
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(
            format!("=yend size={} crc32={:08x}\r\n", data.len(), crc32fast::hash(data)).as_bytes(),
        );
        out
    }

    #[tokio::test]
    async fn fetches_decodes_and_becomes_accurate() {
        let data = b"hello article".to_vec();
        let fetcher = Arc::new(FakeFetcher {
            body: yenc_article(&data),
            calls: AtomicU32::new(0),
        });
        let resource = ArticleResource::new("alt.test", "id@host", 1_000_000, fetcher);
        assert!(!resource.is_size_accurate());

        let mut reader = resource.open().await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert!(resource.is_size_accurate());
        assert_eq!(resource.size(), data.len() as u64);
    }

    #[tokio::test]
    async fn seek_to_zero_before_fetch_is_noop() {
        let data = b"abc".to_vec();
        let fetcher = Arc::new(FakeFetcher {
            body: yenc_article(&data),
            calls: AtomicU32::new(0),
        });
        let resource = ArticleResource::new("g", "id", 10, fetcher);
        let mut reader = resource.open().await.unwrap();
        reader.seek(io::SeekFrom::Start(0)).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }
}
